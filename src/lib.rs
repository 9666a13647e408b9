//! # worldsync
//!
//! Keeps a local, queryable replica of an authoritative simulation in
//! step with it, over a synchronous command channel and a lossy datagram
//! notification channel.
//!
//! ## Core Concepts
//!
//! - **Chunks**: Fixed-size world regions; the unit of dumps and updates
//! - **Snapshots**: Full per-chunk dumps that replace the chunk wholesale
//! - **Update logs**: Append-only per-chunk deltas, tailed incrementally
//! - **Actions**: Commands whose completion arrives later as a notification
//! - **Barrier**: `ensure_synced()` guarantees no half-applied write is visible
//!
//! ## Example
//!
//! ```ignore
//! use worldsync::{ChunkCoord, RconChannel, SyncConfig, SyncCoordinator};
//!
//! let channel = RconChannel::connect("127.0.0.1:27015", "secret", Duration::from_secs(5))?;
//! let session = SyncCoordinator::new(SyncConfig {
//!     snapshot_dir: "./script-output/replica".into(),
//!     chunks_of_interest: vec![ChunkCoord::new(0, 0)],
//!     ..Default::default()
//! }, Arc::new(channel));
//! session.start()?;
//!
//! // Make sure a chunk is trusted, then query it
//! session.wait_for_chunk_snapshot(ChunkCoord::new(0, 0), None)?;
//! let view = session.query()?;
//! for row in view.entities_in(ChunkCoord::new(0, 0)) {
//!     println!("{} at {}", row.key, row.chunk);
//! }
//! drop(view);
//!
//! // Issue an action and wait for its completion event
//! let result = session.issue_action("mine-42", "/sc agent.mine(42)", None)?;
//! ```

pub mod actions;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod replica;
pub mod snapshot;
pub mod tracker;
pub mod types;

// Re-exports
pub use actions::{ActionCorrelator, Delivery};
pub use command::{warm_up, CommandChannel, RconChannel};
pub use config::SyncConfig;
pub use coordinator::SyncCoordinator;
pub use error::{Result, SyncError};
pub use events::{
    decode_datagram, EventDispatcher, EventHandler, EventType, FileKind, SimEvent,
    SubscriptionHandle, SubscriptionId,
};
pub use replica::{Replica, ReplicaView, Row};
pub use snapshot::{
    append_update_line, read_snapshot_file, snapshot_path, update_log_path, write_snapshot_file,
    LogOutcome, LogTailer, SnapshotApplier, SnapshotOutcome, TailBatch, UpdateOutcome,
};
pub use tracker::{ChunkSnapshotTracker, ChunkStatus};
pub use types::*;
