//! Workspace isolation via git worktrees.
//!
//! Each `(repository root, label)` pair binds to at most one worktree
//! per session, created under `<repo>/.worktrees/<label>`. Teardown
//! only removes a tree that has neither uncommitted nor unpushed
//! changes; anything ambiguous is skipped with a warning.

use hive_core::{AgentInstance, Error, Result, WorktreePolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

async fn run_git(repo: &Path, args: &[&str]) -> std::result::Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .map_err(|e| format!("git exec failed: {e}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("git error: {}", stderr.trim()))
    }
}

/// `git worktree add -b <label>`, falling back to checking the branch
/// out when it survives from an earlier session.
async fn add_worktree(
    repo_root: &Path,
    label: &str,
    path_str: &str,
    branch: &str,
) -> std::result::Result<String, String> {
    match run_git(repo_root, &["worktree", "add", "-b", label, path_str, branch]).await {
        Err(message) if message.contains("already exists") => {
            run_git(repo_root, &["worktree", "add", path_str, label]).await
        }
        other => other,
    }
}

/// Repository root containing `path`, or `None` outside any repository.
pub async fn git_root(path: &Path) -> Option<PathBuf> {
    run_git(path, &["rev-parse", "--show-toplevel"])
        .await
        .ok()
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeBinding {
    pub repo_root: PathBuf,
    pub label: String,
    pub path: PathBuf,
}

pub struct WorktreeManager {
    /// Label used for `Shared` policies and as the run-wide default
    /// when isolation is enabled globally.
    session_label: String,
    /// Run-wide policy: `None` means no isolation unless an instance
    /// opts in itself.
    global_label: Option<String>,
    bindings: BTreeMap<(PathBuf, String), PathBuf>,
}

impl WorktreeManager {
    pub fn new(session_label: impl Into<String>, global_label: Option<String>) -> Self {
        Self {
            session_label: session_label.into(),
            global_label,
            bindings: BTreeMap::new(),
        }
    }

    /// Effective label for one instance. Instance settings win;
    /// `Inherit` defers to the run-wide policy.
    pub fn determine_policy(&self, instance: &AgentInstance) -> Option<String> {
        match &instance.worktree {
            WorktreePolicy::Disabled => None,
            WorktreePolicy::Custom(label) => Some(label.clone()),
            WorktreePolicy::Shared => Some(self.session_label.clone()),
            WorktreePolicy::Inherit => self.global_label.clone(),
        }
    }

    /// Deduplicate `(repo_root, label)` pairs across all instances so
    /// each worktree is created at most once.
    pub async fn collect_needed(
        &self,
        instances: &BTreeMap<String, AgentInstance>,
    ) -> Vec<(PathBuf, String)> {
        let mut needed: Vec<(PathBuf, String)> = Vec::new();
        for instance in instances.values() {
            let Some(label) = self.determine_policy(instance) else {
                continue;
            };
            for dir in &instance.directories {
                let Some(root) = git_root(dir).await else {
                    debug!(dir = %dir.display(), "not a git repository, no worktree");
                    continue;
                };
                let key = (root, label.clone());
                if !needed.contains(&key) {
                    needed.push(key);
                }
            }
        }
        needed
    }

    /// Create (or reuse) every needed worktree and record the bindings.
    pub async fn create_all(&mut self, instances: &BTreeMap<String, AgentInstance>) -> Result<()> {
        for (root, label) in self.collect_needed(instances).await {
            self.create(&root, &label).await?;
        }
        Ok(())
    }

    /// Create one worktree at `<repo>/.worktrees/<label>`, branching
    /// off the current branch. Recoverable conflicts (branch already
    /// exists, stale worktree reference) are retried; anything else is
    /// fatal.
    pub async fn create(&mut self, repo_root: &Path, label: &str) -> Result<PathBuf> {
        let key = (repo_root.to_path_buf(), label.to_string());
        if let Some(existing) = self.bindings.get(&key) {
            return Ok(existing.clone());
        }

        let path = repo_root.join(".worktrees").join(label);
        let branch = run_git(repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map_err(Error::worktree)?;
        let path_str = path.display().to_string();

        let mut result = add_worktree(repo_root, label, &path_str, &branch).await;

        if let Err(message) = &result {
            if path.exists() && self.is_live_worktree(repo_root, &path).await {
                info!(path = %path.display(), "reusing existing worktree");
                result = Ok(String::new());
            } else if message.contains("already") {
                // Stale reference left by a crashed session. Prune is
                // best-effort; the retry decides.
                let _ = run_git(repo_root, &["worktree", "prune"]).await;
                result = add_worktree(repo_root, label, &path_str, &branch).await;
            }
        }

        result.map_err(|e| {
            Error::worktree(format!(
                "creating worktree {label} in {}: {e}",
                repo_root.display()
            ))
        })?;
        info!(label, path = %path.display(), "worktree bound");
        self.bindings.insert(key, path.clone());
        Ok(path)
    }

    async fn is_live_worktree(&self, repo_root: &Path, path: &Path) -> bool {
        let Ok(listing) = run_git(repo_root, &["worktree", "list", "--porcelain"]).await else {
            return false;
        };
        listing
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .any(|registered| Path::new(registered) == path)
    }

    /// Rewrite `original` into its worktree under `label`, when a
    /// binding exists; otherwise return it unchanged.
    pub async fn map_path(&self, original: &Path, label: &str) -> PathBuf {
        let Some(root) = git_root(original).await else {
            return original.to_path_buf();
        };
        let Some(worktree) = self.bindings.get(&(root.clone(), label.to_string())) else {
            return original.to_path_buf();
        };
        match original.strip_prefix(&root) {
            Ok(relative) => worktree.join(relative),
            Err(_) => original.to_path_buf(),
        }
    }

    pub fn bindings(&self) -> Vec<WorktreeBinding> {
        self.bindings
            .iter()
            .map(|((repo_root, label), path)| WorktreeBinding {
                repo_root: repo_root.clone(),
                label: label.clone(),
                path: path.clone(),
            })
            .collect()
    }

    pub fn save(&self, file: &Path) -> Result<()> {
        std::fs::write(file, serde_json::to_string_pretty(&self.bindings())?)?;
        Ok(())
    }

    /// Restore bindings persisted by a prior run of the same session.
    pub fn load(&mut self, file: &Path) -> Result<()> {
        if !file.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(file)?;
        let bindings: Vec<WorktreeBinding> = serde_json::from_str(&raw)?;
        for binding in bindings {
            self.bindings
                .insert((binding.repo_root, binding.label), binding.path);
        }
        Ok(())
    }

    /// Remove every binding whose tree is safe to delete; skip (and
    /// warn about) the rest. Skipped bindings stay recorded so a
    /// resumed session can find them again.
    pub async fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let bindings = std::mem::take(&mut self.bindings);
        for ((repo_root, label), path) in bindings {
            if !path.exists() {
                continue;
            }
            let verdict = self.is_safe_to_remove(&path).await;
            let kept_reason = match verdict {
                Ok(true) => {
                    let path_str = path.display().to_string();
                    match run_git(&repo_root, &["worktree", "remove", &path_str]).await {
                        Ok(_) => {
                            info!(label, path = %path.display(), "worktree removed");
                            report.removed.push(path);
                            continue;
                        }
                        Err(e) => {
                            warn!(label, "failed to remove worktree: {e}");
                            e
                        }
                    }
                }
                Ok(false) => {
                    warn!(label, path = %path.display(), "worktree has local changes, keeping it");
                    "uncommitted or unpushed changes".to_string()
                }
                Err(e) => {
                    warn!(label, "could not inspect worktree, keeping it: {e}");
                    e
                }
            };
            self.bindings
                .insert((repo_root.clone(), label.clone()), path.clone());
            report.skipped.push((path, kept_reason));
        }
        report
    }

    async fn is_safe_to_remove(&self, path: &Path) -> std::result::Result<bool, String> {
        let status = run_git(path, &["status", "--porcelain"]).await?;
        if !status.is_empty() {
            return Ok(false);
        }
        Ok(!self.has_unpushed_commits(path).await?)
    }

    /// With an upstream: any commit not on `@{upstream}` counts. Without
    /// one, count commits beyond a detected base branch; when no base
    /// exists either, bias toward keeping the tree.
    async fn has_unpushed_commits(&self, path: &Path) -> std::result::Result<bool, String> {
        if run_git(path, &["rev-parse", "--abbrev-ref", "@{upstream}"])
            .await
            .is_ok()
        {
            let ahead = run_git(path, &["rev-list", "--count", "@{upstream}..HEAD"]).await?;
            return Ok(ahead != "0");
        }

        let Some(base) = self.detect_base_branch(path).await else {
            return Ok(true);
        };
        let range = format!("{base}..HEAD");
        let ahead = run_git(path, &["rev-list", "--count", &range]).await?;
        Ok(ahead != "0")
    }

    async fn detect_base_branch(&self, path: &Path) -> Option<String> {
        if let Ok(head) = run_git(path, &["symbolic-ref", "refs/remotes/origin/HEAD"]).await {
            if let Some(branch) = head.strip_prefix("refs/remotes/") {
                return Some(branch.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if run_git(path, &["rev-parse", "--verify", candidate])
                .await
                .is_ok()
            {
                return Some(candidate.to_string());
            }
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub skipped: Vec<(PathBuf, String)>,
}
