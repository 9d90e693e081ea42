//! Background tail over the shared session log.
//!
//! Opens the log, seeks to the end, and polls for new bytes until the
//! cancellation token fires. Purely additive output: the task never
//! blocks supervisor exit.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn spawn_tail(path: PathBuf, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut offset: u64 = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("log tail cancelled");
                    return;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            offset = forward_new_bytes(&path, offset);
        }
    })
}

fn forward_new_bytes(path: &PathBuf, offset: u64) -> u64 {
    let Ok(mut file) = std::fs::File::open(path) else {
        return offset;
    };
    let Ok(len) = file.metadata().map(|m| m.len()) else {
        return offset;
    };
    if len <= offset {
        // Shorter than before means the file was replaced; start over.
        return if len < offset { 0 } else { offset };
    }
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return offset;
    }
    let mut buffer = String::new();
    if file.read_to_string(&mut buffer).is_err() {
        return offset;
    }
    print!("{buffer}");
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_only_bytes_past_the_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(&path, "old line\n").unwrap();
        let offset = std::fs::metadata(&path).unwrap().len();
        std::fs::write(&path, "old line\nnew line\n").unwrap();
        let next = forward_new_bytes(&path, offset);
        assert_eq!(next, std::fs::metadata(&path).unwrap().len());
    }

    #[tokio::test]
    async fn cancelled_tail_exits_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(&path, "").unwrap();
        let token = CancellationToken::new();
        let handle = spawn_tail(path, token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("tail did not stop")
            .unwrap();
    }
}
