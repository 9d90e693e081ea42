//! Process supervision: session bring-up, root-instance launch, signal
//! handling and teardown.
//!
//! Pre-flight (config, graph, worktree creation, topology) happens
//! before any process spawns and any failure there is fatal. Once the
//! root instance runs in the foreground, its exit code becomes ours.

pub mod cleanup;
pub mod registry;
pub mod tail;

use crate::session::{
    self, SessionPaths, SessionStore, ENV_ROOT_DIR, ENV_SESSION_ID, ENV_SESSION_PATH,
};
use crate::topology::TopologyGenerator;
use crate::worktree::WorktreeManager;
use hive_core::{Error, Result, SwarmConfig};
use registry::PidRegistry;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct StartOptions {
    pub config_path: PathBuf,
    /// Initial prompt handed to the root instance. Without one the root
    /// executor runs interactively.
    pub prompt: Option<String>,
    /// Drop the permission gate on the root instance.
    pub vibe: bool,
    /// Resume the session with this id instead of starting fresh.
    pub session_id: Option<String>,
    /// Run-wide worktree policy: outer `None` disables, `Some(None)`
    /// uses the session label, `Some(Some(l))` a custom label.
    pub worktree: Option<Option<String>>,
    pub tail_logs: bool,
}

/// Bring a swarm up and run it to completion. Returns the process exit
/// code for `main` to pass through.
pub async fn start(options: StartOptions) -> Result<i32> {
    let start_dir = std::env::current_dir()?;
    let paths = SessionPaths::allocate(&start_dir, options.session_id.as_deref());
    let resuming = options.session_id.is_some() && paths.config_snapshot().exists();

    let (store, mut config) = if resuming {
        let store = SessionStore::open(paths.clone())?;
        let config = store.load_config()?;
        info!(session = %paths.root().display(), "resuming session");
        (store, config)
    } else {
        let config = SwarmConfig::load(&options.config_path)?;
        let store = SessionStore::create(paths.clone(), &config, &start_dir)?;
        info!(session = %paths.root().display(), "session created");
        (store, config)
    };

    let main_name = config.main.clone();
    if options.vibe {
        if let Some(main) = config.instances.get_mut(&main_name) {
            main.vibe = true;
        }
    }

    let root_dir = config
        .instances
        .get(&config.main)
        .ok_or_else(|| Error::config(format!("main instance '{}' is not declared", config.main)))?
        .primary_directory()
        .clone();
    std::env::set_var(ENV_SESSION_ID, paths.id());
    std::env::set_var(ENV_SESSION_PATH, paths.root());
    std::env::set_var(ENV_ROOT_DIR, &root_dir);

    let session_label = format!("hive-{}", paths.id());
    let global_label = options
        .worktree
        .clone()
        .map(|label| label.unwrap_or_else(|| session_label.clone()));
    let mut worktrees = WorktreeManager::new(session_label, global_label);
    if resuming {
        worktrees.load(&paths.worktrees_file())?;
    }
    worktrees.create_all(&config.instances).await?;
    worktrees.save(&paths.worktrees_file())?;

    if !resuming {
        let program = std::env::current_exe()?;
        TopologyGenerator::new(&config, &paths, program)
            .generate(&worktrees)
            .await?;
    }

    store.log_line(&format!(
        "swarm '{}' starting with main instance '{}'",
        config.name, config.main
    ))?;

    let registry = PidRegistry::new(paths.pids_dir());
    let tail_token = CancellationToken::new();
    let tail_handle = options
        .tail_logs
        .then(|| tail::spawn_tail(paths.text_log(), tail_token.clone()));

    let code = run_root(&paths, &config, &registry, options.prompt.as_deref()).await;

    info!("sweeping spawned processes");
    let summary = cleanup::sweep(&registry).await;
    if !summary.failed.is_empty() {
        warn!(failed = summary.failed.len(), "some processes could not be cleaned up");
    }
    let report = worktrees.cleanup().await;
    worktrees.save(&paths.worktrees_file())?;
    for (path, reason) in &report.skipped {
        warn!(path = %path.display(), reason, "worktree kept");
    }

    store.log_line("session finished")?;
    tail_token.cancel();
    if let Some(handle) = tail_handle {
        let _ = handle.await;
    }
    code
}

/// Spawn the root instance (serve mode, this same executable) in the
/// foreground with inherited stdio, and wait for it or for a signal.
async fn run_root(
    paths: &SessionPaths,
    config: &SwarmConfig,
    registry: &PidRegistry,
    prompt: Option<&str>,
) -> Result<i32> {
    let program = std::env::current_exe()?;
    let mut command = Command::new(&program);
    command
        .arg("serve")
        .arg("--session-path")
        .arg(paths.root())
        .arg("--instance")
        .arg(&config.main)
        .arg("--caller")
        .arg("user")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if let Some(prompt) = prompt {
        command.arg("--prompt").arg(prompt);
    }

    let mut child = command
        .spawn()
        .map_err(|e| Error::session(format!("spawning root instance: {e}")))?;
    if let Some(pid) = child.id() {
        registry.register(pid, &format!("{} (root)", config.main))?;
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        status = child.wait() => {
            let status = status
                .map_err(|e| Error::session(format!("waiting for root instance: {e}")))?;
            Ok(status.code().unwrap_or(1))
        }
        _ = sigterm.recv() => { info!("received SIGTERM"); Ok(1) }
        _ = sigint.recv() => { info!("received SIGINT"); Ok(1) }
        _ = sigquit.recv() => { info!("received SIGQUIT"); Ok(1) }
    }
}

/// Print a read-only summary of one session: per-instance cost and
/// hierarchy reconstructed from the event log.
pub fn inspect(paths: &SessionPaths) -> Result<()> {
    let store = SessionStore::open(paths.clone())?;
    let stats = store.replay()?;
    println!("session {}", paths.root().display());
    let mut total = 0.0;
    for (name, stat) in &stats {
        let callers: Vec<&str> = stat.callers.iter().map(String::as_str).collect();
        println!(
            "  {name}: ${:.4} over {} calls{}",
            stat.cost_usd,
            stat.calls,
            if callers.is_empty() {
                String::new()
            } else {
                format!(" (called by {})", callers.join(", "))
            }
        );
        total += stat.cost_usd;
    }
    println!("  total: ${total:.4}");
    Ok(())
}

/// List every session under the storage root.
pub fn list() -> Result<()> {
    let sessions = session::list_sessions()?;
    if sessions.is_empty() {
        println!("no sessions recorded");
        return Ok(());
    }
    for paths in sessions {
        println!("{}", paths.root().display());
    }
    Ok(())
}
