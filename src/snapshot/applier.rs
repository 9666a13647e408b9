//! The replica's only writer.

use crate::error::{Result, SyncError};
use crate::replica::{Replica, Row};
use crate::tracker::ChunkSnapshotTracker;
use crate::types::{ChunkCoord, ChunkState, EntityKey, SnapshotRecord, Tick, UpdateOp, UpdateRecord};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::files::{read_snapshot_file, LogTailer};

/// Result of applying one update record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Already applied at this tick or sequence number.
    Duplicate,
    /// Older than the newest tick applied for the chunk.
    OutOfOrder,
    /// Held until the chunk next reaches COMPLETE.
    Deferred,
    /// Sequence discontinuity; the chunk is now STALE.
    Gap,
}

/// Result of applying one full dump.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// False if a newer dump was already applied.
    pub applied: bool,
    pub rows: usize,
    /// Rows dropped because they were missing from the dump.
    pub removed: usize,
    /// Deferred updates replayed on top of the dump.
    pub replayed: usize,
    /// First time the chunk ever reached COMPLETE.
    pub first_completion: bool,
    /// The chunk went STALE again while replaying.
    pub stale: bool,
}

/// Tally from tailing one update log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogOutcome {
    pub applied: usize,
    pub duplicates: usize,
    pub deferred: usize,
    pub malformed: usize,
    pub truncated: bool,
    /// The chunk went STALE during this pass.
    pub stale: bool,
}

/// Ordering state for one chunk's update stream.
#[derive(Debug, Default)]
struct ChunkCursor {
    last_tick: Tick,
    last_seq: Option<u64>,
    /// Tick of the dump this cursor started from. Unsequenced updates at
    /// or below it are already part of the dump.
    snapshot_tick: Option<Tick>,
    /// `(op, key)` pairs applied at `last_tick`.
    seen_at_tick: HashSet<(UpdateOp, EntityKey)>,
}

#[derive(Default)]
struct Counters {
    snapshots: AtomicU64,
    updates: AtomicU64,
    duplicates: AtomicU64,
    deferred: AtomicU64,
    stale: AtomicU64,
}

/// Mutable apply state; only touched while `write_lock` is held.
#[derive(Default)]
struct ApplyState {
    cursors: HashMap<ChunkCoord, ChunkCursor>,
    deferred: HashMap<ChunkCoord, VecDeque<UpdateRecord>>,
}

/// Loads dumps and update logs into the replica.
///
/// All `apply_*` calls are serialized by one lock, and each write to the
/// replica happens under its exclusive guard.
pub struct SnapshotApplier {
    replica: Arc<Replica>,
    tracker: Arc<ChunkSnapshotTracker>,
    tailer: LogTailer,
    write_lock: Mutex<ApplyState>,
    max_deferred: usize,
    counters: Counters,
}

impl SnapshotApplier {
    pub fn new(
        replica: Arc<Replica>,
        tracker: Arc<ChunkSnapshotTracker>,
        max_deferred: usize,
    ) -> Self {
        Self {
            replica,
            tracker,
            tailer: LogTailer::new(),
            write_lock: Mutex::new(ApplyState::default()),
            max_deferred: max_deferred.max(1),
            counters: Counters::default(),
        }
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn tracker(&self) -> &Arc<ChunkSnapshotTracker> {
        &self.tracker
    }

    /// Replace a chunk's rows with a full dump.
    ///
    /// Rows for entities missing from the dump are deleted in the same
    /// write. Updates held while the chunk was untrusted are replayed
    /// through the same ordering rules as live updates.
    pub fn apply_snapshot(&self, record: SnapshotRecord) -> Result<SnapshotOutcome> {
        let mut state = self.write_lock.lock();
        let chunk = record.chunk;
        let tick = record.tick;

        let current = self.tracker.get_status(chunk);
        if current.state == ChunkState::Complete
            && current.last_complete_tick.map_or(false, |t| t > tick)
        {
            debug!(%chunk, %tick, "ignoring dump older than current capture");
            return Ok(SnapshotOutcome::default());
        }

        // Decode every key before touching state so a bad dump changes nothing
        let rows = record
            .payload
            .into_iter()
            .map(|e| {
                Ok(Row {
                    key: e.key()?,
                    chunk,
                    tick,
                    entity: e.entity,
                })
            })
            .collect::<Result<Vec<Row>>>()?;

        match current.state {
            ChunkState::Unknown | ChunkState::Stale => {
                self.tracker.mark_queued(chunk)?;
                self.tracker.mark_in_progress(chunk)?;
            }
            ChunkState::Queued => self.tracker.mark_in_progress(chunk)?,
            ChunkState::InProgress | ChunkState::Complete => {}
        }

        let row_count = rows.len();
        let removed = self.replica.write(|t| t.replace_chunk(chunk, rows));

        state.cursors.insert(
            chunk,
            ChunkCursor {
                last_tick: tick,
                last_seq: record.seq,
                snapshot_tick: Some(tick),
                ..Default::default()
            },
        );
        let first_completion = self.tracker.mark_complete(chunk, tick)?;
        self.counters.snapshots.fetch_add(1, Ordering::Relaxed);

        let mut outcome = SnapshotOutcome {
            applied: true,
            rows: row_count,
            removed,
            first_completion,
            ..Default::default()
        };

        let held = state.deferred.remove(&chunk).unwrap_or_default();
        for update in held {
            match self.apply_locked(&mut state, update)? {
                UpdateOutcome::Applied => outcome.replayed += 1,
                UpdateOutcome::Gap => outcome.stale = true,
                _ => {}
            }
        }

        info!(
            %chunk,
            %tick,
            rows = row_count,
            removed,
            replayed = outcome.replayed,
            "chunk snapshot applied"
        );
        Ok(outcome)
    }

    /// Load a dump file and apply it.
    pub fn apply_snapshot_file(&self, path: &Path) -> Result<SnapshotOutcome> {
        let record = read_snapshot_file(path)?;
        self.apply_snapshot(record)
    }

    /// Apply one incremental record.
    pub fn apply_update(&self, record: UpdateRecord) -> Result<UpdateOutcome> {
        let mut state = self.write_lock.lock();
        self.apply_locked(&mut state, record)
    }

    /// Apply every complete line appended to a chunk's log since the
    /// last pass.
    pub fn apply_update_log(&self, chunk: ChunkCoord, path: &Path) -> Result<LogOutcome> {
        let mut state = self.write_lock.lock();
        let batch = self.tailer.read_new(chunk, path)?;

        let mut outcome = LogOutcome {
            malformed: batch.malformed,
            truncated: batch.truncated,
            ..Default::default()
        };

        if batch.truncated && self.stale_locked(&mut state, chunk, "update log truncated")? {
            outcome.stale = true;
        }

        for record in batch.records {
            match self.apply_locked(&mut state, record)? {
                UpdateOutcome::Applied => outcome.applied += 1,
                UpdateOutcome::Duplicate | UpdateOutcome::OutOfOrder => outcome.duplicates += 1,
                UpdateOutcome::Deferred => outcome.deferred += 1,
                UpdateOutcome::Gap => {
                    outcome.stale = true;
                    outcome.deferred += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Mark a chunk untrusted after its files went away or were replaced
    /// out of band. Returns true if the chunk went STALE.
    pub fn invalidate(&self, chunk: ChunkCoord, reason: &str, reset_log: bool) -> Result<bool> {
        let mut state = self.write_lock.lock();
        if reset_log {
            self.tailer.reset(chunk);
        }
        self.stale_locked(&mut state, chunk, reason)
    }

    /// Requeue a chunk ahead of a requested dump. A COMPLETE chunk passes
    /// through STALE. Returns the state it was in.
    pub fn request_snapshot(&self, chunk: ChunkCoord, reason: &str) -> Result<ChunkState> {
        let mut state = self.write_lock.lock();
        let before = self.tracker.requeue(chunk, reason)?;
        if before == ChunkState::Complete {
            state.cursors.remove(&chunk);
        }
        Ok(before)
    }

    /// Requeue a chunk only if it is UNKNOWN or STALE. Returns the state
    /// it left when it was requeued and a dump should be requested.
    pub fn request_if_untrusted(&self, chunk: ChunkCoord, reason: &str) -> Result<Option<ChunkState>> {
        let _state = self.write_lock.lock();
        match self.tracker.get_state(chunk) {
            before @ (ChunkState::Unknown | ChunkState::Stale) => {
                self.tracker.requeue(chunk, reason)?;
                Ok(Some(before))
            }
            _ => Ok(None),
        }
    }

    /// Take back a request made by `request_snapshot` or
    /// `request_if_untrusted` when the dump command could not be sent.
    ///
    /// A chunk that was never captured returns to UNKNOWN; anything else
    /// becomes STALE. Nothing changes if a dump already started arriving.
    pub fn cancel_request(&self, chunk: ChunkCoord, before: ChunkState, reason: &str) -> Result<bool> {
        let _state = self.write_lock.lock();
        let to = match before {
            ChunkState::Unknown => ChunkState::Unknown,
            ChunkState::Stale | ChunkState::Complete => ChunkState::Stale,
            ChunkState::Queued | ChunkState::InProgress => return Ok(false),
        };
        self.tracker.withdraw(chunk, to, reason)
    }

    /// Block until no apply is running.
    pub fn wait_idle(&self) {
        drop(self.write_lock.lock());
    }

    /// Updates currently held for a chunk.
    pub fn deferred_len(&self, chunk: ChunkCoord) -> usize {
        self.write_lock
            .lock()
            .deferred
            .get(&chunk)
            .map_or(0, |q| q.len())
    }

    /// Newest tick applied for a chunk, from a dump or an update.
    pub fn last_applied_tick(&self, chunk: ChunkCoord) -> Option<Tick> {
        self.write_lock.lock().cursors.get(&chunk).map(|c| c.last_tick)
    }

    pub fn snapshots_applied(&self) -> u64 {
        self.counters.snapshots.load(Ordering::Relaxed)
    }

    pub fn updates_applied(&self) -> u64 {
        self.counters.updates.load(Ordering::Relaxed)
    }

    pub fn duplicates_skipped(&self) -> u64 {
        self.counters.duplicates.load(Ordering::Relaxed)
    }

    pub fn updates_deferred(&self) -> u64 {
        self.counters.deferred.load(Ordering::Relaxed)
    }

    pub fn stale_transitions(&self) -> u64 {
        self.counters.stale.load(Ordering::Relaxed)
    }

    fn apply_locked(&self, state: &mut ApplyState, record: UpdateRecord) -> Result<UpdateOutcome> {
        let chunk = record.chunk.ok_or_else(|| {
            SyncError::InvalidOperation("update record has no chunk".to_string())
        })?;
        let key = record.entity_key()?;

        if self.tracker.get_state(chunk) != ChunkState::Complete {
            self.defer(state, chunk, record);
            return Ok(UpdateOutcome::Deferred);
        }

        let (last_tick, last_seq, snapshot_tick, seen) = {
            let cursor = state.cursors.entry(chunk).or_default();
            let seen = cursor.seen_at_tick.contains(&(record.op, key.clone()));
            (cursor.last_tick, cursor.last_seq, cursor.snapshot_tick, seen)
        };

        if record.tick < last_tick {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(%chunk, tick = %record.tick, last = %last_tick, "dropping out-of-order update");
            return Ok(UpdateOutcome::OutOfOrder);
        }

        let seq_checked = record.seq.is_some() && last_seq.is_some();
        if let (Some(seq), Some(last)) = (record.seq, last_seq) {
            if seq <= last {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(UpdateOutcome::Duplicate);
            }
            if seq > last + 1 {
                let reason = format!("sequence gap: expected {}, got {}", last + 1, seq);
                self.stale_locked(state, chunk, &reason)?;
                self.defer(state, chunk, record);
                return Ok(UpdateOutcome::Gap);
            }
        }

        if !seq_checked && snapshot_tick.map_or(false, |t| record.tick <= t) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(%chunk, tick = %record.tick, "update already covered by dump");
            return Ok(UpdateOutcome::Duplicate);
        }

        if record.tick == last_tick && seen {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(UpdateOutcome::Duplicate);
        }

        let cursor = state.cursors.entry(chunk).or_default();
        if record.tick > cursor.last_tick {
            cursor.last_tick = record.tick;
            cursor.seen_at_tick.clear();
        }
        cursor.seen_at_tick.insert((record.op, key.clone()));
        if record.seq.is_some() {
            cursor.last_seq = record.seq;
        }

        let tick = record.tick;
        match record.op {
            UpdateOp::Upsert => {
                let row = Row {
                    key,
                    chunk,
                    tick,
                    entity: record.entity,
                };
                self.replica.write(|t| t.upsert(row));
            }
            UpdateOp::Remove => {
                self.replica.write(|t| t.remove(chunk, &key));
            }
        }
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        Ok(UpdateOutcome::Applied)
    }

    fn defer(&self, state: &mut ApplyState, chunk: ChunkCoord, record: UpdateRecord) {
        let queue = state.deferred.entry(chunk).or_default();
        if queue.len() >= self.max_deferred {
            queue.pop_front();
            debug!(%chunk, "deferred update buffer full, evicting oldest");
        }
        queue.push_back(record);
        self.counters.deferred.fetch_add(1, Ordering::Relaxed);
    }

    /// COMPLETE -> STALE and forget the ordering cursor. No-op for any
    /// other state.
    fn stale_locked(&self, state: &mut ApplyState, chunk: ChunkCoord, reason: &str) -> Result<bool> {
        if self.tracker.get_state(chunk) != ChunkState::Complete {
            return Ok(false);
        }
        self.tracker.mark_stale(chunk, reason)?;
        state.cursors.remove(&chunk);
        self.counters.stale.fetch_add(1, Ordering::Relaxed);
        warn!(%chunk, reason, "chunk needs a fresh snapshot");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Entity;
    use serde_json::json;

    fn applier() -> SnapshotApplier {
        SnapshotApplier::new(
            Arc::new(Replica::new()),
            Arc::new(ChunkSnapshotTracker::new()),
            16,
        )
    }

    fn tree(id: &str) -> serde_json::Value {
        json!({"id": id})
    }

    fn dump(chunk: ChunkCoord, tick: u64, ids: &[&str]) -> SnapshotRecord {
        SnapshotRecord {
            chunk,
            tick: Tick(tick),
            seq: None,
            payload: ids.iter().map(|id| Entity::new("tree", tree(id))).collect(),
        }
    }

    fn ids_in(applier: &SnapshotApplier, chunk: ChunkCoord) -> Vec<String> {
        applier
            .replica()
            .read()
            .entities_in(chunk)
            .iter()
            .map(|r| r.key.id.clone())
            .collect()
    }

    #[test]
    fn test_queued_chunk_completes_on_snapshot() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        applier.tracker().mark_queued(c).unwrap();

        let outcome = applier.apply_snapshot(dump(c, 100, &["entityA"])).unwrap();
        assert!(outcome.applied);
        assert!(outcome.first_completion);
        assert_eq!(applier.tracker().get_state(c), ChunkState::Complete);
        assert_eq!(ids_in(&applier, c), vec!["entityA"]);
    }

    #[test]
    fn test_snapshot_then_remove() {
        let applier = applier();
        let c = ChunkCoord::new(1, 1);
        applier.apply_snapshot(dump(c, 10, &["e1", "e2"])).unwrap();

        let outcome = applier
            .apply_update(UpdateRecord::remove(c, 11, "tree", tree("e1")))
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);
        assert_eq!(ids_in(&applier, c), vec!["e2"]);
    }

    #[test]
    fn test_resnapshot_replaces_rows() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        applier.apply_snapshot(dump(c, 1, &["a", "b", "c"])).unwrap();
        let outcome = applier.apply_snapshot(dump(c, 2, &["c", "d"])).unwrap();
        assert_eq!(outcome.removed, 3);
        assert_eq!(ids_in(&applier, c), vec!["c", "d"]);
    }

    #[test]
    fn test_older_snapshot_ignored() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        applier.apply_snapshot(dump(c, 50, &["new"])).unwrap();
        let outcome = applier.apply_snapshot(dump(c, 40, &["old"])).unwrap();
        assert!(!outcome.applied);
        assert_eq!(ids_in(&applier, c), vec!["new"]);
    }

    #[test]
    fn test_bad_dump_changes_nothing() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        applier.tracker().mark_queued(c).unwrap();

        let bad = SnapshotRecord {
            chunk: c,
            tick: Tick(5),
            seq: None,
            payload: vec![Entity::new("tree", json!({"hp": 1}))],
        };
        assert!(matches!(applier.apply_snapshot(bad), Err(SyncError::Decode(_))));
        assert_eq!(applier.tracker().get_state(c), ChunkState::Queued);
    }

    #[test]
    fn test_duplicate_update_is_idempotent() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        applier.apply_snapshot(dump(c, 1, &[])).unwrap();

        let update = UpdateRecord::upsert(c, 2, "tree", json!({"id": "a", "hp": 3}));
        assert_eq!(applier.apply_update(update.clone()).unwrap(), UpdateOutcome::Applied);
        let generation = applier.replica().generation();
        assert_eq!(applier.apply_update(update).unwrap(), UpdateOutcome::Duplicate);

        assert_eq!(applier.replica().generation(), generation);
        assert_eq!(applier.duplicates_skipped(), 1);
    }

    #[test]
    fn test_same_tick_distinct_entities_both_apply() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        applier.apply_snapshot(dump(c, 1, &[])).unwrap();

        applier.apply_update(UpdateRecord::upsert(c, 5, "tree", tree("a"))).unwrap();
        applier.apply_update(UpdateRecord::upsert(c, 5, "tree", tree("b"))).unwrap();
        assert_eq!(ids_in(&applier, c), vec!["a", "b"]);
    }

    #[test]
    fn test_out_of_order_tick_dropped() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        applier.apply_snapshot(dump(c, 1, &[])).unwrap();

        let mut accepted = Vec::new();
        for (tick, id) in [(5, "t5"), (7, "t7"), (6, "t6"), (9, "t9")] {
            let outcome = applier
                .apply_update(UpdateRecord::upsert(c, tick, "tree", tree(id)))
                .unwrap();
            if outcome == UpdateOutcome::Applied {
                accepted.push(tick);
            }
        }
        assert_eq!(accepted, vec![5, 7, 9]);
        assert_eq!(ids_in(&applier, c), vec!["t5", "t7", "t9"]);
        assert_eq!(applier.last_applied_tick(c), Some(Tick(9)));
    }

    #[test]
    fn test_sequence_gap_marks_stale() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        applier.apply_snapshot(dump(c, 1, &[])).unwrap();

        let first = UpdateRecord::upsert(c, 2, "tree", tree("a")).with_seq(10);
        let skipped = UpdateRecord::upsert(c, 4, "tree", tree("b")).with_seq(12);
        assert_eq!(applier.apply_update(first).unwrap(), UpdateOutcome::Applied);
        assert_eq!(applier.apply_update(skipped).unwrap(), UpdateOutcome::Gap);

        assert_eq!(applier.tracker().get_state(c), ChunkState::Stale);
        assert_eq!(ids_in(&applier, c), vec!["a"]);

        // Further updates wait for a fresh dump
        let later = UpdateRecord::upsert(c, 6, "tree", tree("c")).with_seq(13);
        assert_eq!(applier.apply_update(later).unwrap(), UpdateOutcome::Deferred);

        // Dump at tick 5 covers "b"; only the tick-6 update replays
        let outcome = applier.apply_snapshot(dump(c, 5, &["a", "b"])).unwrap();
        assert_eq!(outcome.replayed, 1);
        assert_eq!(applier.tracker().get_state(c), ChunkState::Complete);
        assert_eq!(ids_in(&applier, c), vec!["a", "b", "c"]);
        assert_eq!(applier.stale_transitions(), 1);
    }

    #[test]
    fn test_updates_before_first_snapshot_are_deferred() {
        let applier = applier();
        let c = ChunkCoord::new(3, 3);

        let early = UpdateRecord::upsert(c, 3, "tree", tree("early"));
        let late = UpdateRecord::upsert(c, 12, "tree", tree("late"));
        assert_eq!(applier.apply_update(early).unwrap(), UpdateOutcome::Deferred);
        assert_eq!(applier.apply_update(late).unwrap(), UpdateOutcome::Deferred);
        assert!(applier.replica().read().is_empty());
        assert_eq!(applier.deferred_len(c), 2);

        applier.apply_snapshot(dump(c, 10, &["base"])).unwrap();
        assert_eq!(ids_in(&applier, c), vec!["base", "late"]);
        assert_eq!(applier.deferred_len(c), 0);
    }

    #[test]
    fn test_deferred_buffer_is_bounded() {
        let applier = SnapshotApplier::new(
            Arc::new(Replica::new()),
            Arc::new(ChunkSnapshotTracker::new()),
            2,
        );
        let c = ChunkCoord::new(0, 0);
        for tick in 1..=5 {
            applier
                .apply_update(UpdateRecord::upsert(c, tick, "tree", tree(&format!("t{}", tick))))
                .unwrap();
        }
        assert_eq!(applier.deferred_len(c), 2);
    }

    #[test]
    fn test_invalidate() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        assert!(!applier.invalidate(c, "file deleted", false).unwrap());

        applier.apply_snapshot(dump(c, 1, &["a"])).unwrap();
        assert!(applier.invalidate(c, "file deleted", true).unwrap());
        assert_eq!(applier.tracker().get_state(c), ChunkState::Stale);
        // Rows stay visible until replaced
        assert_eq!(ids_in(&applier, c), vec!["a"]);
    }

    #[test]
    fn test_request_if_untrusted_leaves_trusted_chunks() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        assert_eq!(
            applier.request_if_untrusted(c, "wait").unwrap(),
            Some(ChunkState::Unknown)
        );
        assert_eq!(applier.request_if_untrusted(c, "wait").unwrap(), None);

        applier.apply_snapshot(dump(c, 1, &["a"])).unwrap();
        assert_eq!(applier.request_if_untrusted(c, "wait").unwrap(), None);
        assert_eq!(applier.tracker().get_state(c), ChunkState::Complete);

        applier.invalidate(c, "gone", false).unwrap();
        assert_eq!(
            applier.request_if_untrusted(c, "wait").unwrap(),
            Some(ChunkState::Stale)
        );
        assert_eq!(applier.tracker().get_state(c), ChunkState::Queued);
    }

    #[test]
    fn test_cancel_request_restores_untrusted_state() {
        let applier = applier();
        let fresh = ChunkCoord::new(0, 0);
        let before = applier.request_if_untrusted(fresh, "wait").unwrap().unwrap();
        assert!(applier.cancel_request(fresh, before, "command failed").unwrap());
        assert_eq!(applier.tracker().get_state(fresh), ChunkState::Unknown);
        // A later caller can request again
        assert!(applier.request_if_untrusted(fresh, "wait").unwrap().is_some());

        let captured = ChunkCoord::new(1, 0);
        applier.apply_snapshot(dump(captured, 4, &["a"])).unwrap();
        let before = applier.request_snapshot(captured, "forced").unwrap();
        assert_eq!(before, ChunkState::Complete);
        assert!(applier.cancel_request(captured, before, "command failed").unwrap());
        assert_eq!(applier.tracker().get_state(captured), ChunkState::Stale);
        assert_eq!(ids_in(&applier, captured), vec!["a"]);

        // Already requested by someone else: left alone
        applier.tracker().mark_queued(captured).unwrap();
        assert!(!applier.cancel_request(captured, ChunkState::Queued, "command failed").unwrap());
        assert_eq!(applier.tracker().get_state(captured), ChunkState::Queued);
    }

    #[test]
    fn test_update_at_dump_tick_is_covered_by_dump() {
        let c = ChunkCoord::new(2, 2);
        let removal = || UpdateRecord::remove(c, 10, "tree", tree("e1"));

        // Delivered after the dump
        let live = applier();
        live.apply_snapshot(dump(c, 10, &["e1"])).unwrap();
        assert_eq!(live.apply_update(removal()).unwrap(), UpdateOutcome::Duplicate);

        // Delivered before the dump and replayed on top of it
        let held = applier();
        assert_eq!(held.apply_update(removal()).unwrap(), UpdateOutcome::Deferred);
        let outcome = held.apply_snapshot(dump(c, 10, &["e1"])).unwrap();
        assert_eq!(outcome.replayed, 0);

        assert_eq!(ids_in(&live, c), vec!["e1"]);
        assert_eq!(ids_in(&held, c), ids_in(&live, c));

        // The next tick still applies
        let next = UpdateRecord::remove(c, 11, "tree", tree("e1"));
        assert_eq!(live.apply_update(next).unwrap(), UpdateOutcome::Applied);
        assert!(ids_in(&live, c).is_empty());
    }

    #[test]
    fn test_dump_sequence_number_seeds_gap_detection() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        let mut record = dump(c, 20, &["a"]);
        record.seq = Some(5);
        applier.apply_snapshot(record).unwrap();

        let covered = UpdateRecord::upsert(c, 20, "tree", tree("b")).with_seq(5);
        assert_eq!(applier.apply_update(covered).unwrap(), UpdateOutcome::Duplicate);

        // Same tick as the dump but the next sequence number: new work
        let next = UpdateRecord::upsert(c, 20, "tree", tree("b")).with_seq(6);
        assert_eq!(applier.apply_update(next).unwrap(), UpdateOutcome::Applied);

        let skipped = UpdateRecord::upsert(c, 21, "tree", tree("c")).with_seq(8);
        assert_eq!(applier.apply_update(skipped).unwrap(), UpdateOutcome::Gap);
        assert_eq!(applier.tracker().get_state(c), ChunkState::Stale);
        assert_eq!(ids_in(&applier, c), vec!["a", "b"]);
    }

    #[test]
    fn test_first_update_after_sequenced_dump_is_checked() {
        let applier = applier();
        let c = ChunkCoord::new(0, 0);
        let mut record = dump(c, 1, &[]);
        record.seq = Some(5);
        applier.apply_snapshot(record).unwrap();

        let skipped = UpdateRecord::upsert(c, 2, "tree", tree("x")).with_seq(7);
        assert_eq!(applier.apply_update(skipped).unwrap(), UpdateOutcome::Gap);
        assert!(ids_in(&applier, c).is_empty());
    }
}
