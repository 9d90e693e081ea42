//! Filesystem PID registry.
//!
//! Every spawned process writes its own PID file into the session's
//! registry directory, so tracking survives supervisor restarts and
//! needs no shared memory. One file per PID means concurrent writers
//! never contend.

use hive_core::Result;
use std::fs;
use std::path::PathBuf;

pub struct PidRegistry {
    dir: PathBuf,
}

impl PidRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Record one process: a file named after the PID whose content is
    /// a human-readable label.
    pub fn register(&self, pid: u32, label: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(pid.to_string()), label)?;
        Ok(())
    }

    /// Record the calling process itself.
    pub fn register_self(&self, label: &str) -> Result<()> {
        self.register(std::process::id(), label)
    }

    pub fn deregister(&self, pid: u32) -> Result<()> {
        let path = self.dir.join(pid.to_string());
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All registered processes, sorted by PID.
    pub fn entries(&self) -> Result<Vec<(i32, String)>> {
        let mut entries = Vec::new();
        if !self.dir.exists() {
            return Ok(entries);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
                continue;
            };
            let label = fs::read_to_string(entry.path()).unwrap_or_default();
            entries.push((pid, label.trim().to_string()));
        }
        entries.sort_by_key(|(pid, _)| *pid);
        Ok(entries)
    }

    /// Remove the whole registry directory after a sweep.
    pub fn clear(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        !self.dir.exists()
            || fs::read_dir(&self.dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true)
    }
}
