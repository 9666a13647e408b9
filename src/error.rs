//! Error types for the synchronization layer.

use crate::types::{ActionId, ChunkCoord, ChunkState};
use std::time::Duration;
use thiserror::Error;

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Action already pending: {0}")]
    DuplicateAction(ActionId),

    /// The world-side outcome is unknown, not necessarily failed.
    #[error("Action {action_id} not completed after {elapsed:?}")]
    ActionTimeout { action_id: ActionId, elapsed: Duration },

    #[error("Chunk {chunk} did not reach COMPLETE after {elapsed:?}")]
    SnapshotTimeout { chunk: ChunkCoord, elapsed: Duration },

    #[error("Apply queue did not drain after {elapsed:?}")]
    BarrierTimeout { elapsed: Duration },

    #[error("Illegal state transition for chunk {chunk}: {from} -> {to}")]
    StateTransition {
        chunk: ChunkCoord,
        from: ChunkState,
        to: ChunkState,
    },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Timeouts can be retried by re-issuing the command or forcing a
    /// re-snapshot. Everything else should surface to the operator.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::ActionTimeout { .. }
                | SyncError::SnapshotTimeout { .. }
                | SyncError::BarrierTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            SyncError::Deserialization(e.to_string())
        } else {
            SyncError::Serialization(e.to_string())
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
