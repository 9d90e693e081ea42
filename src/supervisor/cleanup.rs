//! Graceful-then-forceful teardown of registered processes.
//!
//! Every registered PID first gets SIGTERM; whatever is still alive
//! after the grace period gets SIGKILL. "No such process" and
//! "permission denied" are reported and tolerated — one stubborn PID
//! never aborts the sweep.

use super::registry::PidRegistry;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tracing::{debug, info, warn};

const GRACE_PERIOD: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub struct SweepSummary {
    pub terminated: usize,
    pub killed: usize,
    pub vanished: usize,
    pub failed: Vec<(i32, String)>,
}

/// Terminate everything in the registry, then remove it.
pub async fn sweep(registry: &PidRegistry) -> SweepSummary {
    let mut summary = SweepSummary::default();
    let own_pid = std::process::id() as i32;

    let entries = match registry.entries() {
        Ok(entries) => entries,
        Err(e) => {
            warn!("could not read pid registry: {e}");
            return summary;
        }
    };

    let mut pending: Vec<(i32, String)> = Vec::new();
    for (pid, label) in entries {
        if pid == own_pid {
            continue;
        }
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                debug!(pid, label, "sent SIGTERM");
                pending.push((pid, label));
            }
            Err(Errno::ESRCH) => {
                debug!(pid, label, "already gone");
                summary.vanished += 1;
            }
            Err(errno) => {
                warn!(pid, label, "could not signal: {errno}");
                summary.failed.push((pid, errno.to_string()));
            }
        }
    }

    let deadline = std::time::Instant::now() + GRACE_PERIOD;
    while !pending.is_empty() && std::time::Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
        pending.retain(|(pid, _)| {
            if is_alive(*pid) {
                true
            } else {
                summary.terminated += 1;
                false
            }
        });
    }

    for (pid, label) in pending {
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => {
                info!(pid, label, "escalated to SIGKILL");
                summary.killed += 1;
            }
            Err(Errno::ESRCH) => summary.terminated += 1,
            Err(errno) => {
                warn!(pid, label, "could not kill: {errno}");
                summary.failed.push((pid, errno.to_string()));
            }
        }
    }

    if let Err(e) = registry.clear() {
        warn!("could not remove pid registry: {e}");
    }
    summary
}

fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}
