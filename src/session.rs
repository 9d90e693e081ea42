//! Session record — crash-tolerant, append-only storage shared by every
//! spawned process.
//!
//! A session is a directory: an append-only JSONL event log, a
//! human-readable text log, per-instance manifests, a PID registry, a
//! resolved-configuration snapshot and a start-directory marker.
//! Independent OS processes serialize appends with an exclusive flock
//! around open → seek-to-end → write → unlock; there is no in-memory
//! broker.

use chrono::Utc;
use hive_core::{Error, Result, SwarmConfig};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ENV_SESSION_PATH: &str = "HIVE_SESSION_PATH";
pub const ENV_SESSION_ID: &str = "HIVE_SESSION_ID";
pub const ENV_ROOT_DIR: &str = "HIVE_ROOT_DIR";

/// Well-known files inside one session directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    root: PathBuf,
}

impl SessionPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Derive a fresh session path from the start directory and a UTC
    /// timestamp, or reuse a prior one when `session_id` is given.
    pub fn allocate(start_dir: &Path, session_id: Option<&str>) -> Self {
        let id = match session_id {
            Some(id) => id.to_string(),
            None => Utc::now().format("%Y%m%d_%H%M%S").to_string(),
        };
        Self {
            root: sessions_home().join(dir_slug(start_dir)).join(id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Session id: the final path component.
    pub fn id(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn events_log(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn text_log(&self) -> PathBuf {
        self.root.join("session.log")
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn config_snapshot(&self) -> PathBuf {
        self.root.join("config.yml")
    }

    /// Directory the snapshot's relative paths resolve against (the
    /// original declaration file's parent, not the start directory).
    pub fn config_base_marker(&self) -> PathBuf {
        self.root.join("config_base")
    }

    pub fn worktrees_file(&self) -> PathBuf {
        self.root.join("worktrees.json")
    }

    pub fn start_dir_marker(&self) -> PathBuf {
        self.root.join("start_directory")
    }
}

/// Root of all session storage: `$HIVE_HOME/sessions` or
/// `~/.hive/sessions`.
pub fn sessions_home() -> PathBuf {
    let home = std::env::var("HIVE_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        format!("{home}/.hive")
    });
    PathBuf::from(home).join("sessions")
}

fn dir_slug(dir: &Path) -> String {
    dir.display().to_string().replace('/', "+")
}

/// One line of the event log. The envelope carries the emitting
/// instance, its session-unique id, calling-instance attribution and a
/// timestamp; the payload is the flattened [`EventKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub instance: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    pub timestamp: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// The emitting instance asked connection `to` to perform work.
    Request { to: String, prompt: String },
    /// The emitting instance finished work for its caller.
    Response {
        text: String,
        cost_usd: f64,
        duration_ms: u64,
    },
    ToolCall { tool: String, input: Value },
    ToolResult { tool: String, output: String },
    ToolError { tool: String, message: String },
}

impl Event {
    pub fn new(
        instance: impl Into<String>,
        instance_id: impl Into<String>,
        caller: Option<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            instance: instance.into(),
            instance_id: instance_id.into(),
            caller,
            timestamp: Utc::now().to_rfc3339(),
            kind,
        }
    }
}

/// Accumulated view of one instance after a log replay.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceStats {
    pub cost_usd: f64,
    pub calls: u64,
    pub callers: BTreeSet<String>,
    pub callees: BTreeSet<String>,
}

/// Backend state persisted per instance so later calls resume the same
/// backend session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceState {
    pub backend_session_id: Option<String>,
}

pub struct SessionStore {
    paths: SessionPaths,
}

impl SessionStore {
    /// Create the on-disk skeleton for a new session.
    pub fn create(paths: SessionPaths, config: &SwarmConfig, start_dir: &Path) -> Result<Self> {
        fs::create_dir_all(paths.root())?;
        fs::create_dir_all(paths.pids_dir())?;
        fs::create_dir_all(paths.manifests_dir())?;
        fs::create_dir_all(paths.state_dir())?;
        fs::write(paths.config_snapshot(), &config.raw)?;
        fs::write(
            paths.config_base_marker(),
            config.base_dir.display().to_string(),
        )?;
        fs::write(paths.start_dir_marker(), start_dir.display().to_string())?;
        Ok(Self { paths })
    }

    /// Open an existing session directory for appending and inspection.
    pub fn open(paths: SessionPaths) -> Result<Self> {
        if !paths.config_snapshot().exists() {
            return Err(Error::session(format!(
                "{} is not a session directory",
                paths.root().display()
            )));
        }
        // The registry may have been removed by a prior clean shutdown.
        fs::create_dir_all(paths.pids_dir())?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Append one event, serialized under an exclusive advisory lock so
    /// concurrent writer processes never interleave partial lines.
    pub fn append(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;
        locked_append(&self.paths.events_log(), &line)
    }

    /// Append a line to the human-readable mirror log.
    pub fn log_line(&self, line: &str) -> Result<()> {
        let stamped = format!("[{}] {line}", Utc::now().format("%H:%M:%S"));
        locked_append(&self.paths.text_log(), &stamped)
    }

    pub fn read_events(&self) -> Result<Vec<Event>> {
        let path = self.paths.events_log();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        for line in fs::read_to_string(path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            // A crash can truncate the final line; skip what does not parse.
            if let Ok(event) = serde_json::from_str::<Event>(line) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Single sequential replay of the log: per-instance cumulative
    /// cost, incoming call count, callers and callees.
    pub fn replay(&self) -> Result<BTreeMap<String, InstanceStats>> {
        let mut stats: BTreeMap<String, InstanceStats> = BTreeMap::new();
        for event in self.read_events()? {
            match &event.kind {
                EventKind::Request { to, .. } => {
                    stats
                        .entry(event.instance.clone())
                        .or_default()
                        .callees
                        .insert(to.clone());
                    let callee = stats.entry(to.clone()).or_default();
                    callee.calls += 1;
                    callee.callers.insert(event.instance.clone());
                }
                EventKind::Response { cost_usd, .. } => {
                    stats.entry(event.instance.clone()).or_default().cost_usd += cost_usd;
                }
                _ => {
                    stats.entry(event.instance.clone()).or_default();
                }
            }
        }
        Ok(stats)
    }

    /// Re-derive the configuration from the session's snapshot. Relative
    /// paths resolve against the recorded base directory, the same base
    /// the original parse used.
    pub fn load_config(&self) -> Result<SwarmConfig> {
        let raw = fs::read_to_string(self.paths.config_snapshot())?;
        let base_dir = self.config_base_directory()?;
        SwarmConfig::parse(&raw, &base_dir)
    }

    /// Base directory the snapshot resolves against: the original
    /// declaration file's parent, which is not necessarily the start
    /// directory.
    pub fn config_base_directory(&self) -> Result<PathBuf> {
        let marker = fs::read_to_string(self.paths.config_base_marker())
            .map_err(|e| Error::session(format!("missing config-base marker: {e}")))?;
        Ok(PathBuf::from(marker.trim()))
    }

    pub fn start_directory(&self) -> Result<PathBuf> {
        let marker = fs::read_to_string(self.paths.start_dir_marker())
            .map_err(|e| Error::session(format!("missing start-directory marker: {e}")))?;
        Ok(PathBuf::from(marker.trim()))
    }

    pub fn load_instance_state(&self, instance: &str) -> InstanceState {
        let path = self.paths.state_dir().join(format!("{instance}.json"));
        fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save_instance_state(&self, instance: &str, state: &InstanceState) -> Result<()> {
        fs::create_dir_all(self.paths.state_dir())?;
        let path = self.paths.state_dir().join(format!("{instance}.json"));
        fs::write(path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }
}

fn locked_append(path: &Path, line: &str) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut locked = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| Error::session(format!("locking {}: {errno}", path.display())))?;
    writeln!(&mut *locked, "{line}")?;
    locked.flush()?;
    // Dropping the guard releases the lock.
    Ok(())
}

/// Read-only listing over all sessions under the storage root.
pub fn list_sessions() -> Result<Vec<SessionPaths>> {
    let home = sessions_home();
    let mut found = Vec::new();
    if !home.exists() {
        return Ok(found);
    }
    for project in fs::read_dir(&home)? {
        let project = project?;
        if !project.path().is_dir() {
            continue;
        }
        for session in fs::read_dir(project.path())? {
            let session = session?;
            let paths = SessionPaths::new(session.path());
            if paths.config_snapshot().exists() {
                found.push(paths);
            }
        }
    }
    found.sort_by_key(|p| p.root().to_path_buf());
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("project");
        fs::create_dir(&config_dir).unwrap();
        let raw =
            "version: 1\nswarm:\n  name: t\n  main: a\n  instances:\n    a: {description: d}\n";
        let config = SwarmConfig::parse(raw, &config_dir).unwrap();
        let paths = SessionPaths::new(dir.path().join("session"));
        let store = SessionStore::create(paths, &config, &config_dir).unwrap();
        (dir, store)
    }

    #[test]
    fn appends_are_line_delimited_json() {
        let (_dir, store) = store();
        store
            .append(&Event::new(
                "a",
                "a_0001",
                None,
                EventKind::ToolCall {
                    tool: "Bash".into(),
                    input: json!({"command": "ls"}),
                },
            ))
            .unwrap();
        store
            .append(&Event::new(
                "a",
                "a_0001",
                None,
                EventKind::ToolResult {
                    tool: "Bash".into(),
                    output: "ok".into(),
                },
            ))
            .unwrap();
        let events = store.read_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].instance_id, "a_0001");
    }

    #[test]
    fn replay_accumulates_hierarchy_and_cost() {
        let (_dir, store) = store();
        store
            .append(&Event::new(
                "main",
                "main_01",
                None,
                EventKind::Request {
                    to: "worker".into(),
                    prompt: "do it".into(),
                },
            ))
            .unwrap();
        store
            .append(&Event::new(
                "worker",
                "worker_01",
                Some("main".into()),
                EventKind::Response {
                    text: "done".into(),
                    cost_usd: 0.25,
                    duration_ms: 10,
                },
            ))
            .unwrap();
        store
            .append(&Event::new(
                "worker",
                "worker_01",
                Some("main".into()),
                EventKind::Response {
                    text: "done again".into(),
                    cost_usd: 0.50,
                    duration_ms: 10,
                },
            ))
            .unwrap();

        let stats = store.replay().unwrap();
        assert_eq!(stats["worker"].calls, 1);
        assert!((stats["worker"].cost_usd - 0.75).abs() < 1e-9);
        assert!(stats["worker"].callers.contains("main"));
        assert!(stats["main"].callees.contains("worker"));
    }

    #[test]
    fn restore_rederives_config_from_snapshot() {
        let (_dir, store) = store();
        let root = store.paths().root().to_path_buf();
        drop(store);
        let reopened = SessionStore::open(SessionPaths::new(root)).unwrap();
        let config = reopened.load_config().unwrap();
        assert_eq!(config.main, "a");
    }

    #[test]
    fn restore_resolves_directories_against_the_declaration_file() {
        // Declaration lives in a subdirectory; its relative `directory`
        // entries resolve against that subdirectory, not the directory
        // the session was started from.
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("configs");
        fs::create_dir(&config_dir).unwrap();
        fs::create_dir(config_dir.join("src")).unwrap();
        let raw = "version: 1\nswarm:\n  name: t\n  main: a\n  instances:\n    a:\n      description: d\n      directory: src\n";
        let config = SwarmConfig::parse(raw, &config_dir).unwrap();

        let paths = SessionPaths::new(dir.path().join("session"));
        let store = SessionStore::create(paths, &config, dir.path()).unwrap();
        let root = store.paths().root().to_path_buf();
        drop(store);

        let reopened = SessionStore::open(SessionPaths::new(root)).unwrap();
        let restored = reopened.load_config().unwrap();
        assert_eq!(
            restored.instances["a"].directories,
            config.instances["a"].directories,
        );
        assert!(restored.instances["a"].primary_directory().ends_with("configs/src"));
    }

    #[test]
    fn truncated_final_line_is_skipped() {
        let (_dir, store) = store();
        store
            .append(&Event::new(
                "a",
                "a_01",
                None,
                EventKind::ToolResult {
                    tool: "Bash".into(),
                    output: "ok".into(),
                },
            ))
            .unwrap();
        // Simulate a crash mid-write.
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.paths().events_log())
            .unwrap();
        write!(file, "{{\"instance\":\"a\",\"trunc").unwrap();
        let events = store.read_events().unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn instance_state_round_trips() {
        let (_dir, store) = store();
        store
            .save_instance_state(
                "worker",
                &InstanceState {
                    backend_session_id: Some("sess-1".into()),
                },
            )
            .unwrap();
        let state = store.load_instance_state("worker");
        assert_eq!(state.backend_session_id.as_deref(), Some("sess-1"));
        assert!(store
            .load_instance_state("other")
            .backend_session_id
            .is_none());
    }

    #[test]
    fn concurrent_appends_do_not_interleave() {
        let (_dir, store) = store();
        let path = store.paths().events_log();
        let mut handles = Vec::new();
        for t in 0..8 {
            let store_path = path.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    let event = Event::new(
                        format!("i{t}"),
                        format!("i{t}_{i}"),
                        None,
                        EventKind::ToolResult {
                            tool: "Bash".into(),
                            output: "x".repeat(200),
                        },
                    );
                    let line = serde_json::to_string(&event).unwrap();
                    super::locked_append(&store_path, &line).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let events = store.read_events().unwrap();
        assert_eq!(events.len(), 200);
    }
}
