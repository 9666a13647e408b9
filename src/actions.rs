//! Correlation of issued actions with their asynchronous completions.
//!
//! Each pending action owns a one-slot channel. The registry lock is held
//! only to insert, look up, or remove an entry; waiting happens on the
//! entry's own channel so unrelated actions never contend.

use crate::error::{Result, SyncError};
use crate::types::{ActionId, ActionResult, PendingAction};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Why an action id is remembered after leaving the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retired {
    Resolved,
    TimedOut,
    Cancelled,
}

/// What happened to a completion event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The waiter was resolved by this event.
    Resolved,
    /// The action was already resolved; ignored.
    Duplicate,
    /// The action had already timed out or been cancelled; ignored.
    Late,
    /// Nobody registered this id; ignored.
    Unknown,
}

struct Slot {
    info: PendingAction,
    resolved: AtomicBool,
    /// A caller is blocked on `receiver`.
    waiting: AtomicBool,
    sender: Sender<ActionResult>,
    receiver: Receiver<ActionResult>,
}

/// Pending-action table keyed by action id.
pub struct ActionCorrelator {
    pending: RwLock<HashMap<ActionId, Arc<Slot>>>,
    retired: Mutex<LruCache<ActionId, Retired>>,
    default_timeout: Duration,
}

impl ActionCorrelator {
    pub fn new(default_timeout: Duration, memory: usize) -> Self {
        let memory = NonZeroUsize::new(memory.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            pending: RwLock::new(HashMap::new()),
            retired: Mutex::new(LruCache::new(memory)),
            default_timeout,
        }
    }

    /// Register an action id. Must happen before the command is sent.
    pub fn register(&self, action_id: impl Into<ActionId>) -> Result<PendingAction> {
        self.register_with_timeout(action_id, self.default_timeout)
    }

    pub fn register_with_timeout(
        &self,
        action_id: impl Into<ActionId>,
        timeout: Duration,
    ) -> Result<PendingAction> {
        let action_id = action_id.into();
        let mut pending = self.pending.write();
        if pending.contains_key(&action_id) {
            return Err(SyncError::DuplicateAction(action_id));
        }

        let (sender, receiver) = bounded(1);
        let info = PendingAction {
            action_id: action_id.clone(),
            issued_at: Instant::now(),
            timeout,
        };
        pending.insert(
            action_id.clone(),
            Arc::new(Slot {
                info: info.clone(),
                resolved: AtomicBool::new(false),
                waiting: AtomicBool::new(false),
                sender,
                receiver,
            }),
        );
        self.retired.lock().pop(&action_id);

        debug!(action = %action_id, ?timeout, "action registered");
        Ok(info)
    }

    /// Deliver a completion. First delivery wins; later ones are no-ops.
    pub fn on_completion_event(&self, action_id: &ActionId, result: ActionResult) -> Delivery {
        let slot = self.pending.read().get(action_id).cloned();

        let Some(slot) = slot else {
            return match self.retired.lock().get(action_id).copied() {
                Some(Retired::Resolved) => {
                    debug!(action = %action_id, "duplicate completion ignored");
                    Delivery::Duplicate
                }
                Some(Retired::TimedOut) | Some(Retired::Cancelled) => {
                    info!(action = %action_id, "completion arrived after wait ended");
                    Delivery::Late
                }
                None => {
                    debug!(action = %action_id, "completion for unknown action");
                    Delivery::Unknown
                }
            };
        };

        if slot
            .resolved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(action = %action_id, "duplicate completion ignored");
            return Delivery::Duplicate;
        }

        // Capacity 1 and guarded by `resolved`, so this cannot be full
        let _ = slot.sender.try_send(result);
        debug!(
            action = %action_id,
            elapsed = ?slot.info.issued_at.elapsed(),
            "action resolved"
        );
        Delivery::Resolved
    }

    /// Wait for the action to resolve, using its registered timeout.
    pub fn wait(&self, action_id: &ActionId) -> Result<ActionResult> {
        let timeout = self
            .pending
            .read()
            .get(action_id)
            .map(|s| s.info.timeout)
            .ok_or_else(|| {
                SyncError::InvalidOperation(format!("action {} is not registered", action_id))
            })?;
        self.wait_timeout(action_id, timeout)
    }

    /// Wait up to `timeout` for the action to resolve.
    ///
    /// The entry is removed on return either way, so a late delivery
    /// cannot resurrect it.
    pub fn wait_timeout(&self, action_id: &ActionId, timeout: Duration) -> Result<ActionResult> {
        let receiver = self
            .pending
            .read()
            .get(action_id)
            .map(|s| {
                s.waiting.store(true, Ordering::SeqCst);
                s.receiver.clone()
            })
            .ok_or_else(|| {
                SyncError::InvalidOperation(format!("action {} is not registered", action_id))
            })?;

        let started = Instant::now();
        let outcome = receiver.recv_timeout(timeout);

        match outcome {
            Ok(result) => {
                self.retire(action_id, Retired::Resolved);
                Ok(result)
            }
            Err(RecvTimeoutError::Timeout) => {
                // A completion can race the timeout; take it if it landed
                let raced = self
                    .pending
                    .write()
                    .remove(action_id)
                    .and_then(|slot| {
                        slot.resolved.store(true, Ordering::SeqCst);
                        slot.receiver.try_recv().ok()
                    });
                if let Some(result) = raced {
                    self.retired.lock().put(action_id.clone(), Retired::Resolved);
                    return Ok(result);
                }
                self.retired.lock().put(action_id.clone(), Retired::TimedOut);

                let elapsed = started.elapsed();
                warn!(action = %action_id, ?elapsed, "action timed out");
                Err(SyncError::ActionTimeout {
                    action_id: action_id.clone(),
                    elapsed,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Only reachable if the slot was dropped out from under us
                self.retire(action_id, Retired::Cancelled);
                Err(SyncError::InvalidOperation(format!(
                    "action {} was cancelled",
                    action_id
                )))
            }
        }
    }

    /// Drop a pending action without waiting.
    pub fn cancel(&self, action_id: &ActionId) -> bool {
        let removed = self.pending.write().remove(action_id).is_some();
        if removed {
            self.retired.lock().put(action_id.clone(), Retired::Cancelled);
            debug!(action = %action_id, "action cancelled");
        }
        removed
    }

    /// Remove entries that outlived their timeout with nobody waiting and
    /// no result to hand over. Returns the ids removed.
    pub fn sweep_overdue(&self) -> Vec<ActionId> {
        let now = Instant::now();
        let mut pending = self.pending.write();
        let overdue: Vec<ActionId> = pending
            .values()
            .filter(|s| {
                s.info.is_overdue(now)
                    && s.receiver.is_empty()
                    && !s.waiting.load(Ordering::SeqCst)
            })
            .map(|s| s.info.action_id.clone())
            .collect();
        for id in &overdue {
            pending.remove(id);
        }
        drop(pending);

        if !overdue.is_empty() {
            let mut retired = self.retired.lock();
            for id in &overdue {
                retired.put(id.clone(), Retired::TimedOut);
            }
            warn!(count = overdue.len(), "swept overdue actions");
        }
        overdue
    }

    pub fn is_pending(&self, action_id: &ActionId) -> bool {
        self.pending.read().contains_key(action_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn retire(&self, action_id: &ActionId, how: Retired) {
        self.pending.write().remove(action_id);
        self.retired.lock().put(action_id.clone(), how);
    }
}
