//! Per-chunk snapshot state machine.
//!
//! ```text
//! UNKNOWN -> QUEUED -> IN_PROGRESS -> COMPLETE -> STALE
//!              ^                        |  ^        |
//!              |                        +--+        |
//!              +------------------------------------+
//! ```
//!
//! Every chunk gets its own slot with its own lock and condition
//! variable, so waiting on one chunk never serializes work on another.

use crate::error::{Result, SyncError};
use crate::types::{ChunkCoord, ChunkState, Tick};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Snapshot status of one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkStatus {
    pub state: ChunkState,
    /// Tick of the last full capture applied.
    pub last_complete_tick: Option<Tick>,
    /// Why the chunk last went STALE.
    pub stale_reason: Option<String>,
    /// Whether the chunk has ever reached COMPLETE.
    pub ever_complete: bool,
}

impl Default for ChunkStatus {
    fn default() -> Self {
        Self {
            state: ChunkState::Unknown,
            last_complete_tick: None,
            stale_reason: None,
            ever_complete: false,
        }
    }
}

#[derive(Default)]
struct ChunkSlot {
    status: Mutex<ChunkStatus>,
    changed: Condvar,
}

/// Tracks whether the replica's view of each chunk can be trusted.
#[derive(Default)]
pub struct ChunkSnapshotTracker {
    chunks: RwLock<HashMap<ChunkCoord, Arc<ChunkSlot>>>,
}

impl ChunkSnapshotTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, chunk: ChunkCoord) -> Arc<ChunkSlot> {
        if let Some(slot) = self.chunks.read().get(&chunk) {
            return Arc::clone(slot);
        }
        Arc::clone(self.chunks.write().entry(chunk).or_default())
    }

    fn transition(
        &self,
        chunk: ChunkCoord,
        to: ChunkState,
        update: impl FnOnce(&mut ChunkStatus),
    ) -> Result<ChunkState> {
        let slot = self.slot(chunk);
        let mut status = slot.status.lock();
        let from = status.state;
        if !from.can_transition_to(to) {
            return Err(SyncError::StateTransition { chunk, from, to });
        }
        status.state = to;
        update(&mut status);
        drop(status);
        slot.changed.notify_all();
        debug!(%chunk, %from, %to, "chunk state changed");
        Ok(from)
    }

    /// UNKNOWN/STALE -> QUEUED.
    pub fn mark_queued(&self, chunk: ChunkCoord) -> Result<()> {
        self.transition(chunk, ChunkState::Queued, |_| {})?;
        Ok(())
    }

    /// QUEUED -> IN_PROGRESS.
    pub fn mark_in_progress(&self, chunk: ChunkCoord) -> Result<()> {
        self.transition(chunk, ChunkState::InProgress, |_| {})?;
        Ok(())
    }

    /// IN_PROGRESS -> COMPLETE, or a COMPLETE refresh at a newer tick.
    ///
    /// Returns true the first time the chunk ever completes.
    pub fn mark_complete(&self, chunk: ChunkCoord, tick: Tick) -> Result<bool> {
        let mut first = false;
        self.transition(chunk, ChunkState::Complete, |status| {
            first = !status.ever_complete;
            status.ever_complete = true;
            status.stale_reason = None;
            status.last_complete_tick = Some(match status.last_complete_tick {
                Some(prev) if prev > tick => prev,
                _ => tick,
            });
        })?;
        Ok(first)
    }

    /// COMPLETE -> STALE.
    pub fn mark_stale(&self, chunk: ChunkCoord, reason: &str) -> Result<()> {
        self.transition(chunk, ChunkState::Stale, |status| {
            status.stale_reason = Some(reason.to_string());
        })?;
        warn!(%chunk, reason, "chunk marked stale");
        Ok(())
    }

    /// Bring a chunk to QUEUED from whatever untrusted state it is in.
    ///
    /// COMPLETE goes through STALE first. QUEUED and IN_PROGRESS are
    /// left alone. Returns the state the chunk was in.
    pub fn requeue(&self, chunk: ChunkCoord, reason: &str) -> Result<ChunkState> {
        let before = self.get_state(chunk);
        match before {
            ChunkState::Queued | ChunkState::InProgress => {}
            ChunkState::Complete => {
                self.mark_stale(chunk, reason)?;
                self.mark_queued(chunk)?;
            }
            ChunkState::Unknown | ChunkState::Stale => self.mark_queued(chunk)?,
        }
        Ok(before)
    }

    /// Undo a queue request whose dump command never went out.
    ///
    /// Only a QUEUED chunk moves, and only back to UNKNOWN or STALE, so the
    /// next caller requests again instead of waiting on nothing. Returns
    /// false if the chunk had already moved on.
    pub fn withdraw(&self, chunk: ChunkCoord, to: ChunkState, reason: &str) -> Result<bool> {
        if !matches!(to, ChunkState::Unknown | ChunkState::Stale) {
            return Err(SyncError::StateTransition {
                chunk,
                from: ChunkState::Queued,
                to,
            });
        }
        let slot = self.slot(chunk);
        let mut status = slot.status.lock();
        if status.state != ChunkState::Queued {
            return Ok(false);
        }
        status.state = to;
        if to == ChunkState::Stale {
            status.stale_reason = Some(reason.to_string());
        }
        drop(status);
        slot.changed.notify_all();
        warn!(%chunk, %to, reason, "snapshot request withdrawn");
        Ok(true)
    }

    pub fn get_state(&self, chunk: ChunkCoord) -> ChunkState {
        self.chunks
            .read()
            .get(&chunk)
            .map(|slot| slot.status.lock().state)
            .unwrap_or(ChunkState::Unknown)
    }

    pub fn get_status(&self, chunk: ChunkCoord) -> ChunkStatus {
        self.chunks
            .read()
            .get(&chunk)
            .map(|slot| slot.status.lock().clone())
            .unwrap_or_default()
    }

    pub fn last_complete_tick(&self, chunk: ChunkCoord) -> Option<Tick> {
        self.get_status(chunk).last_complete_tick
    }

    /// Whether every listed chunk has reached COMPLETE at least once.
    pub fn all_ever_complete(&self, chunks: &[ChunkCoord]) -> bool {
        let map = self.chunks.read();
        chunks.iter().all(|c| {
            map.get(c)
                .map(|slot| slot.status.lock().ever_complete)
                .unwrap_or(false)
        })
    }

    /// Chunks currently in the given state.
    pub fn chunks_in(&self, state: ChunkState) -> Vec<ChunkCoord> {
        let mut out: Vec<ChunkCoord> = self
            .chunks
            .read()
            .iter()
            .filter(|(_, slot)| slot.status.lock().state == state)
            .map(|(chunk, _)| *chunk)
            .collect();
        out.sort();
        out
    }

    pub fn tracked_chunks(&self) -> Vec<ChunkCoord> {
        let mut out: Vec<ChunkCoord> = self.chunks.read().keys().copied().collect();
        out.sort();
        out
    }

    /// Block until the chunk is COMPLETE. Returns the tick of its capture.
    pub fn wait_for_complete(&self, chunk: ChunkCoord, timeout: Duration) -> Result<Tick> {
        let slot = self.slot(chunk);
        let started = Instant::now();
        let deadline = started + timeout;

        let mut status = slot.status.lock();
        loop {
            if status.state == ChunkState::Complete {
                return Ok(status.last_complete_tick.unwrap_or_default());
            }
            if slot.changed.wait_until(&mut status, deadline).timed_out()
                && status.state != ChunkState::Complete
            {
                let elapsed = started.elapsed();
                info!(%chunk, state = %status.state, ?elapsed, "snapshot wait timed out");
                return Err(SyncError::SnapshotTimeout { chunk, elapsed });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const C: ChunkCoord = ChunkCoord::new(0, 0);

    fn complete(tracker: &ChunkSnapshotTracker, chunk: ChunkCoord, tick: u64) {
        tracker.mark_queued(chunk).unwrap();
        tracker.mark_in_progress(chunk).unwrap();
        tracker.mark_complete(chunk, Tick(tick)).unwrap();
    }

    #[test]
    fn test_happy_path() {
        let tracker = ChunkSnapshotTracker::new();
        assert_eq!(tracker.get_state(C), ChunkState::Unknown);

        tracker.mark_queued(C).unwrap();
        assert_eq!(tracker.get_state(C), ChunkState::Queued);
        tracker.mark_in_progress(C).unwrap();
        assert!(tracker.mark_complete(C, Tick(100)).unwrap());

        let status = tracker.get_status(C);
        assert_eq!(status.state, ChunkState::Complete);
        assert_eq!(status.last_complete_tick, Some(Tick(100)));
    }

    #[test]
    fn test_illegal_transitions() {
        let tracker = ChunkSnapshotTracker::new();

        let result = tracker.mark_complete(C, Tick(1));
        assert!(matches!(
            result,
            Err(SyncError::StateTransition {
                from: ChunkState::Unknown,
                to: ChunkState::Complete,
                ..
            })
        ));

        tracker.mark_queued(C).unwrap();
        assert!(tracker.mark_stale(C, "gap").is_err());
        assert!(tracker.mark_queued(C).is_err());
        // Failed transitions leave the state untouched
        assert_eq!(tracker.get_state(C), ChunkState::Queued);
    }

    #[test]
    fn test_stale_cycle() {
        let tracker = ChunkSnapshotTracker::new();
        complete(&tracker, C, 10);

        tracker.mark_stale(C, "seq gap").unwrap();
        let status = tracker.get_status(C);
        assert_eq!(status.state, ChunkState::Stale);
        assert_eq!(status.stale_reason.as_deref(), Some("seq gap"));

        // Second completion is not the first
        tracker.mark_queued(C).unwrap();
        tracker.mark_in_progress(C).unwrap();
        assert!(!tracker.mark_complete(C, Tick(20)).unwrap());
        assert_eq!(tracker.last_complete_tick(C), Some(Tick(20)));
        assert_eq!(tracker.get_status(C).stale_reason, None);
    }

    #[test]
    fn test_refresh_keeps_newest_tick() {
        let tracker = ChunkSnapshotTracker::new();
        complete(&tracker, C, 50);
        tracker.mark_complete(C, Tick(40)).unwrap();
        assert_eq!(tracker.last_complete_tick(C), Some(Tick(50)));
    }

    #[test]
    fn test_requeue() {
        let tracker = ChunkSnapshotTracker::new();
        assert_eq!(tracker.requeue(C, "forced").unwrap(), ChunkState::Unknown);
        assert_eq!(tracker.get_state(C), ChunkState::Queued);

        tracker.mark_in_progress(C).unwrap();
        tracker.mark_complete(C, Tick(1)).unwrap();
        assert_eq!(tracker.requeue(C, "forced").unwrap(), ChunkState::Complete);
        assert_eq!(tracker.get_state(C), ChunkState::Queued);
    }

    #[test]
    fn test_withdraw_only_moves_queued_chunks() {
        let tracker = ChunkSnapshotTracker::new();
        tracker.mark_queued(C).unwrap();
        assert!(tracker.withdraw(C, ChunkState::Unknown, "command failed").unwrap());
        assert_eq!(tracker.get_state(C), ChunkState::Unknown);
        tracker.mark_queued(C).unwrap();

        tracker.mark_in_progress(C).unwrap();
        assert!(!tracker.withdraw(C, ChunkState::Stale, "command failed").unwrap());
        assert_eq!(tracker.get_state(C), ChunkState::InProgress);

        let other = ChunkCoord::new(5, 5);
        complete(&tracker, other, 3);
        tracker.requeue(other, "forced").unwrap();
        assert!(tracker.withdraw(other, ChunkState::Stale, "command failed").unwrap());
        let status = tracker.get_status(other);
        assert_eq!(status.state, ChunkState::Stale);
        assert_eq!(status.stale_reason.as_deref(), Some("command failed"));
        assert!(status.ever_complete);

        assert!(tracker.withdraw(other, ChunkState::Complete, "no").is_err());
    }

    #[test]
    fn test_wait_for_complete_wakes() {
        let tracker = Arc::new(ChunkSnapshotTracker::new());
        tracker.mark_queued(C).unwrap();

        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.wait_for_complete(C, Duration::from_secs(2)))
        };

        thread::sleep(Duration::from_millis(20));
        tracker.mark_in_progress(C).unwrap();
        tracker.mark_complete(C, Tick(7)).unwrap();

        assert_eq!(waiter.join().unwrap().unwrap(), Tick(7));
    }

    #[test]
    fn test_wait_for_complete_times_out() {
        let tracker = ChunkSnapshotTracker::new();
        let chunk = ChunkCoord::new(3, 3);
        let result = tracker.wait_for_complete(chunk, Duration::from_millis(50));
        match result {
            Err(SyncError::SnapshotTimeout { chunk: c, elapsed }) => {
                assert_eq!(c, chunk);
                assert!(elapsed >= Duration::from_millis(50));
            }
            other => panic!("Expected SnapshotTimeout, got {:?}", other),
        }
    }

    #[test]
    fn test_all_ever_complete() {
        let tracker = ChunkSnapshotTracker::new();
        let a = ChunkCoord::new(0, 0);
        let b = ChunkCoord::new(1, 0);
        complete(&tracker, a, 1);
        tracker.mark_queued(b).unwrap();

        assert!(!tracker.all_ever_complete(&[a, b]));
        tracker.mark_in_progress(b).unwrap();
        tracker.mark_complete(b, Tick(2)).unwrap();
        tracker.mark_stale(b, "gap").unwrap();
        assert!(tracker.all_ever_complete(&[a, b]));
        assert_eq!(tracker.chunks_in(ChunkState::Stale), vec![b]);
    }
}
