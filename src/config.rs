//! Session configuration.

use crate::error::Result;
use crate::types::ChunkCoord;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one agent's sync session.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Address the notification socket binds to.
    pub listen_addr: String,

    /// Directory holding per-chunk dump files and update logs.
    pub snapshot_dir: PathBuf,

    /// Default wait for an action's completion event.
    pub default_action_timeout_ms: u64,

    /// Default wait for a chunk to reach COMPLETE.
    pub default_snapshot_timeout_ms: u64,

    /// Upper bound on how long `ensure_synced` waits for the apply queue.
    pub barrier_timeout_ms: u64,

    /// Largest datagram accepted.
    /// Default: 64KB
    pub recv_buffer_size: usize,

    /// Warmup commands sent right after connecting.
    pub warmup_attempts: u32,

    /// Command issued to request a fresh dump. `{x}` and `{y}` are
    /// replaced by the chunk coordinate.
    pub resnapshot_command: String,

    /// Command sent during warmup.
    pub warmup_command: String,

    /// Updates held per chunk while it is not COMPLETE.
    pub max_deferred_updates: usize,

    /// Chunks that must reach COMPLETE before leaving BOOTSTRAP.
    pub chunks_of_interest: Vec<ChunkCoord>,

    /// How many resolved or timed-out action ids to remember.
    pub recent_action_memory: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            snapshot_dir: PathBuf::from("./snapshots"),
            default_action_timeout_ms: 10_000,
            default_snapshot_timeout_ms: 30_000,
            barrier_timeout_ms: 5_000,
            recv_buffer_size: 64 * 1024,
            warmup_attempts: 2,
            resnapshot_command: "/sc remote.call('replica', 'resnapshot', {x}, {y})".to_string(),
            warmup_command: "/sc rcon.print(game.tick)".to_string(),
            max_deferred_updates: 4096,
            chunks_of_interest: Vec::new(),
            recent_action_memory: 1024,
        }
    }
}

impl SyncConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.default_action_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.default_snapshot_timeout_ms)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    /// Render the re-snapshot command for one chunk.
    pub fn resnapshot_command_for(&self, chunk: ChunkCoord) -> String {
        self.resnapshot_command
            .replace("{x}", &chunk.x.to_string())
            .replace("{y}", &chunk.y.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.json");
        fs::write(
            &path,
            r#"{"listen_addr": "0.0.0.0:9001", "chunks_of_interest": [{"x": 0, "y": 1}]}"#,
        )
        .unwrap();

        let config = SyncConfig::from_json_file(&path).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9001");
        assert_eq!(config.chunks_of_interest, vec![ChunkCoord::new(0, 1)]);
        assert_eq!(config.warmup_attempts, 2);
        assert_eq!(config.recv_buffer_size, 64 * 1024);
    }

    #[test]
    fn test_resnapshot_command_template() {
        let config = SyncConfig {
            resnapshot_command: "dump {x} {y}".to_string(),
            ..Default::default()
        };
        assert_eq!(config.resnapshot_command_for(ChunkCoord::new(-2, 5)), "dump -2 5");
    }
}
