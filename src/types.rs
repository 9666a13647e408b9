//! Core types for the replica synchronization layer.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Fixed-size spatial region of the simulated world.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// File stem used for this chunk's dump and update log.
    pub fn file_stem(&self) -> String {
        format!("chunk_{}_{}", self.x, self.y)
    }

    /// Parse a chunk coordinate back out of a file name like
    /// `chunk_-3_4.json` or `chunk_-3_4.updates.jsonl`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("chunk_")?;
        let stem = rest.split('.').next()?;
        let (x, y) = stem.split_once('_')?;
        Some(Self {
            x: x.parse().ok()?,
            y: y.parse().ok()?,
        })
    }
}

impl From<(i32, i32)> for ChunkCoord {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

impl fmt::Debug for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({}, {})", self.x, self.y)
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// The simulation's discrete time-step counter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Tick(pub u64);

impl fmt::Debug for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tick({})", self.0)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How far the replica's view of a chunk can be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    /// Never requested or seen.
    Unknown,
    /// A dump has been requested but not started.
    Queued,
    /// A dump is being applied.
    InProgress,
    /// The replica holds a full dump plus every update since.
    Complete,
    /// An update gap was detected; a fresh dump is required.
    Stale,
}

impl ChunkState {
    /// Whether `self -> to` is a legal transition.
    ///
    /// `Complete -> Complete` is a refresh: a newer dump replacing an
    /// older one without the chunk ever becoming untrusted.
    pub fn can_transition_to(self, to: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, to),
            (Unknown, Queued)
                | (Stale, Queued)
                | (Queued, InProgress)
                | (InProgress, Complete)
                | (Complete, Complete)
                | (Complete, Stale)
        )
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChunkState::Unknown => "UNKNOWN",
            ChunkState::Queued => "QUEUED",
            ChunkState::InProgress => "IN_PROGRESS",
            ChunkState::Complete => "COMPLETE",
            ChunkState::Stale => "STALE",
        };
        f.write_str(name)
    }
}

/// Per-agent synchronization phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Initial full enumeration outstanding; incremental updates untrusted.
    Bootstrap,
    /// Steady state; full dumps only on demand or stale recovery.
    Maintenance,
}

/// Identity of an entity within the replica.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Derive the key of an entity from its payload.
    ///
    /// Looks at `id`, then `unit_number`, then `name` + `position`.
    pub fn from_entity(kind: &str, entity: &serde_json::Value) -> Result<Self> {
        let id = match (entity.get("id"), entity.get("unit_number")) {
            (Some(v), _) if !v.is_null() => scalar_to_string(v),
            (_, Some(v)) if !v.is_null() => scalar_to_string(v),
            _ => None,
        };

        let id = match id {
            Some(id) => id,
            None => {
                let name = entity.get("name").and_then(|n| n.as_str());
                let pos = entity.get("position");
                let x = pos.and_then(|p| p.get("x")).and_then(|v| v.as_f64());
                let y = pos.and_then(|p| p.get("y")).and_then(|v| v.as_f64());
                match (name, x, y) {
                    (Some(name), Some(x), Some(y)) => format!("{}@{},{}", name, x, y),
                    _ => {
                        return Err(SyncError::Decode(format!(
                            "{} entity has no id, unit_number, or name+position",
                            kind
                        )))
                    }
                }
            }
        };

        Ok(Self {
            kind: kind.to_string(),
            id,
        })
    }
}

fn scalar_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// One entity as it appears inside a snapshot file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub entity: serde_json::Value,
}

impl Entity {
    pub fn new(kind: impl Into<String>, entity: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            entity,
        }
    }

    pub fn key(&self) -> Result<EntityKey> {
        EntityKey::from_entity(&self.kind, &self.entity)
    }
}

/// Full dump of one chunk at one tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub chunk: ChunkCoord,
    pub tick: Tick,
    /// Sequence number of the last update folded into the dump, when the
    /// producer emits sequence numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "entities")]
    pub payload: Vec<Entity>,
}

/// Incremental operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOp {
    Upsert,
    Remove,
}

/// A single incremental delta for one chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Absent on log lines; filled in from the log's file name.
    #[serde(default)]
    pub chunk: Option<ChunkCoord>,
    pub tick: Tick,
    /// Per-chunk sequence number, when the producer emits one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub op: UpdateOp,
    pub entity_kind: String,
    pub entity: serde_json::Value,
}

impl UpdateRecord {
    pub fn upsert(chunk: ChunkCoord, tick: u64, kind: &str, entity: serde_json::Value) -> Self {
        Self {
            chunk: Some(chunk),
            tick: Tick(tick),
            seq: None,
            op: UpdateOp::Upsert,
            entity_kind: kind.to_string(),
            entity,
        }
    }

    pub fn remove(chunk: ChunkCoord, tick: u64, kind: &str, entity: serde_json::Value) -> Self {
        Self {
            op: UpdateOp::Remove,
            ..Self::upsert(chunk, tick, kind, entity)
        }
    }

    /// Attach a per-chunk sequence number.
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn entity_key(&self) -> Result<EntityKey> {
        EntityKey::from_entity(&self.entity_kind, &self.entity)
    }
}

/// Opaque identifier correlating an issued action with its completion.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub String);

impl ActionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActionId {
    fn from(s: &str) -> Self {
        ActionId(s.to_string())
    }
}

impl From<String> for ActionId {
    fn from(s: String) -> Self {
        ActionId(s)
    }
}

impl fmt::Debug for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionId({})", self.0)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of an action-completed notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub tick: Option<Tick>,
}

fn default_success() -> bool {
    true
}

impl Default for ActionResult {
    fn default() -> Self {
        Self::ok(serde_json::Value::Null)
    }
}

impl ActionResult {
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            success: true,
            body,
            tick: None,
        }
    }

    pub fn failed(body: serde_json::Value) -> Self {
        Self {
            success: false,
            body,
            tick: None,
        }
    }
}

/// An action awaiting its completion event.
#[derive(Clone, Debug)]
pub struct PendingAction {
    pub action_id: ActionId,
    pub issued_at: Instant,
    pub timeout: Duration,
}

impl PendingAction {
    pub fn is_overdue(&self, now: Instant) -> bool {
        now.duration_since(self.issued_at) > self.timeout
    }
}

/// Counters for observability.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub snapshots_applied: u64,
    pub updates_applied: u64,
    pub duplicates_skipped: u64,
    pub updates_deferred: u64,
    pub stale_transitions: u64,
    pub decode_errors: u64,
    pub pending_actions: usize,
}
