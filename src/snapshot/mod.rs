//! Snapshot files, update logs, and the replica's single write path.
//!
//! Each chunk has two files in the snapshot directory:
//! - `chunk_<x>_<y>.json`: full dump `{chunk, tick, entities: [...]}`
//! - `chunk_<x>_<y>.updates.jsonl`: append-only `{op, tick, seq?, entity_kind, entity}` lines
//!
//! The applier replaces a chunk wholesale from its dump, then tails the
//! update log from the last byte it consumed.

mod applier;
mod files;

pub use applier::{LogOutcome, SnapshotApplier, SnapshotOutcome, UpdateOutcome};
pub use files::{
    append_update_line, read_snapshot_file, snapshot_path, update_log_path, write_snapshot_file,
    LogTailer, TailBatch,
};
