//! Notification types decoded from the datagram channel.

use crate::types::{ActionId, ActionResult, ChunkCoord, Tick};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Events emitted by the simulation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SimEvent {
    // --- File Events ---
    /// A dump file or update log appeared.
    FileCreated {
        chunk: ChunkCoord,
        path: PathBuf,
        #[serde(default)]
        tick: Option<Tick>,
    },

    /// A dump file was rewritten or an update log grew.
    FileUpdated {
        chunk: ChunkCoord,
        path: PathBuf,
        #[serde(default)]
        tick: Option<Tick>,
    },

    /// A dump file or update log was removed.
    FileDeleted { chunk: ChunkCoord, path: PathBuf },

    // --- Action Events ---
    /// An agent action finished on the simulation side.
    ActionCompleted {
        action_id: ActionId,
        #[serde(default)]
        result: ActionResult,
    },

    // --- Lifecycle Events ---
    /// Periodic heartbeat carrying the current tick.
    Tick { tick: Tick },
}

impl SimEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            SimEvent::FileCreated { .. } => EventType::FileCreated,
            SimEvent::FileUpdated { .. } => EventType::FileUpdated,
            SimEvent::FileDeleted { .. } => EventType::FileDeleted,
            SimEvent::ActionCompleted { .. } => EventType::ActionCompleted,
            SimEvent::Tick { .. } => EventType::Tick,
        }
    }

    /// The chunk a file event refers to.
    pub fn chunk(&self) -> Option<ChunkCoord> {
        match self {
            SimEvent::FileCreated { chunk, .. }
            | SimEvent::FileUpdated { chunk, .. }
            | SimEvent::FileDeleted { chunk, .. } => Some(*chunk),
            _ => None,
        }
    }
}

/// Tag used to key subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FileCreated,
    FileUpdated,
    FileDeleted,
    ActionCompleted,
    Tick,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::FileCreated,
        EventType::FileUpdated,
        EventType::FileDeleted,
        EventType::ActionCompleted,
        EventType::Tick,
    ];
}

/// What a file event points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// Full chunk dump (`chunk_<x>_<y>.json`).
    Snapshot,
    /// Append-only update log (`chunk_<x>_<y>.updates.jsonl`).
    UpdateLog,
}

impl FileKind {
    pub fn of(path: &Path) -> FileKind {
        match path.extension().and_then(|e| e.to_str()) {
            Some("jsonl") => FileKind::UpdateLog,
            _ => FileKind::Snapshot,
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to a channel subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<SimEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<SimEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<SimEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<SimEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_tagged_events() {
        let raw = json!({
            "event_type": "file_updated",
            "chunk": {"x": 1, "y": -1},
            "path": "chunk_1_-1.updates.jsonl",
        });
        let event: SimEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type(), EventType::FileUpdated);
        assert_eq!(event.chunk(), Some(ChunkCoord::new(1, -1)));

        let raw = json!({
            "event_type": "action_completed",
            "action_id": "a1",
            "result": {"success": false, "body": {"reason": "blocked"}},
        });
        match serde_json::from_value::<SimEvent>(raw).unwrap() {
            SimEvent::ActionCompleted { action_id, result } => {
                assert_eq!(action_id, ActionId::from("a1"));
                assert!(!result.success);
                assert_eq!(result.body["reason"], "blocked");
            }
            other => panic!("Expected ActionCompleted, got {:?}", other),
        }
    }

    #[test]
    fn test_action_completed_without_result() {
        let raw = json!({"event_type": "action_completed", "action_id": "a2"});
        match serde_json::from_value::<SimEvent>(raw).unwrap() {
            SimEvent::ActionCompleted { result, .. } => assert!(result.success),
            other => panic!("Expected ActionCompleted, got {:?}", other),
        }
    }

    #[test]
    fn test_file_kind() {
        assert_eq!(FileKind::of(Path::new("chunk_0_0.json")), FileKind::Snapshot);
        assert_eq!(
            FileKind::of(Path::new("chunk_0_0.updates.jsonl")),
            FileKind::UpdateLog
        );
    }
}
