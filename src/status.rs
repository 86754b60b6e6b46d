use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Heartbeat snapshot written once per scan cycle for external observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub pid: u32,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub queue_depth: usize,
}

/// Atomically publishes the daemon heartbeat (write sibling temp file,
/// rename over the real one) so readers never observe a partial snapshot.
pub struct StatusPublisher {
    path: PathBuf,
    pid: u32,
}

impl StatusPublisher {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            pid: std::process::id(),
        }
    }

    pub fn publish(&self, queue_depth: usize) -> io::Result<()> {
        let snapshot = StatusSnapshot {
            pid: self.pid,
            timestamp: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            queue_depth,
        };
        let body = serde_json::to_vec(&snapshot)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, body)?;
        fs::rename(&tmp_path, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_valid_json_with_monotonic_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("daemon.status");
        let publisher = StatusPublisher::new(status_path.clone());

        publisher.publish(3).unwrap();
        let first: StatusSnapshot =
            serde_json::from_slice(&fs::read(&status_path).unwrap()).unwrap();
        assert_eq!(first.pid, std::process::id());
        assert_eq!(first.queue_depth, 3);

        publisher.publish(0).unwrap();
        let second: StatusSnapshot =
            serde_json::from_slice(&fs::read(&status_path).unwrap()).unwrap();
        assert_eq!(second.queue_depth, 0);
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn overwrites_existing_snapshot_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("daemon.status");
        fs::write(&status_path, b"not json").unwrap();

        StatusPublisher::new(status_path.clone()).publish(1).unwrap();
        let snapshot: StatusSnapshot =
            serde_json::from_slice(&fs::read(&status_path).unwrap()).unwrap();
        assert_eq!(snapshot.queue_depth, 1);
        // No stray temp file left behind.
        assert!(!status_path.with_extension("tmp").exists());
    }
}
