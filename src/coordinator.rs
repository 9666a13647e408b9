//! Session-level façade tying the sync components together.
//!
//! A coordinator is owned by one agent session. `start()` warms up the
//! command channel, binds the notification socket, spawns the apply
//! worker, and requests dumps for every chunk of interest. Callers then:
//! - call `ensure_synced()` (or `query()`) before reading the replica
//! - call `wait_for_chunk_snapshot()` when a chunk must be trusted
//! - bracket world-mutating commands with `register_action()` /
//!   `wait_for_action()`, or use `issue_action()` for both
//!
//! File notifications are never applied on the receive thread; they are
//! queued to a single apply worker, which is the replica's writer.

use crate::actions::{ActionCorrelator, Delivery};
use crate::command::{warm_up, CommandChannel};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventDispatcher, EventType, FileKind, SimEvent, SubscriptionId};
use crate::replica::{Replica, ReplicaView};
use crate::snapshot::{snapshot_path, update_log_path, SnapshotApplier};
use crate::tracker::ChunkSnapshotTracker;
use crate::types::{
    ActionId, ActionResult, ChunkCoord, ChunkState, PendingAction, SyncPhase, SyncStats, Tick,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Work for the apply worker.
#[derive(Debug)]
enum ApplyJob {
    Snapshot { chunk: ChunkCoord, path: PathBuf },
    UpdateLog { chunk: ChunkCoord, path: PathBuf },
    Invalidate {
        chunk: ChunkCoord,
        reason: &'static str,
        reset_log: bool,
    },
    Shutdown,
}

/// Job tickets. Jobs finish in the order they were enqueued.
#[derive(Debug, Default)]
struct JobProgress {
    submitted: u64,
    finished: u64,
}

/// State shared between the caller, the dispatcher callbacks, and the
/// apply worker.
struct Core {
    config: SyncConfig,
    replica: Arc<Replica>,
    tracker: Arc<ChunkSnapshotTracker>,
    applier: Arc<SnapshotApplier>,
    actions: ActionCorrelator,
    commands: Arc<dyn CommandChannel>,
    phase: RwLock<SyncPhase>,
    interest: RwLock<Vec<ChunkCoord>>,
    jobs: Sender<ApplyJob>,
    progress: Mutex<JobProgress>,
    progress_changed: Condvar,
    /// Invariant violation raised on the worker, surfaced by the next barrier.
    fault: Mutex<Option<SyncError>>,
    latest_tick: AtomicU64,
}

impl Core {
    fn enqueue(&self, job: ApplyJob) {
        let mut progress = self.progress.lock();
        progress.submitted += 1;
        // Sent under the lock so ticket order matches queue order
        if self.jobs.send(job).is_err() {
            progress.finished += 1;
            self.progress_changed.notify_all();
            warn!("apply worker is gone, dropping job");
        }
    }

    fn finish_job(&self) {
        self.progress.lock().finished += 1;
        self.progress_changed.notify_all();
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.snapshot_dir.join(path)
        }
    }

    /// Called on the receive thread; only enqueues.
    fn route_file_event(&self, event: &SimEvent) {
        match event {
            SimEvent::FileCreated { chunk, path, .. } | SimEvent::FileUpdated { chunk, path, .. } => {
                let path = self.resolve_path(path);
                let job = match FileKind::of(&path) {
                    FileKind::Snapshot => ApplyJob::Snapshot {
                        chunk: *chunk,
                        path,
                    },
                    FileKind::UpdateLog => ApplyJob::UpdateLog {
                        chunk: *chunk,
                        path,
                    },
                };
                self.enqueue(job);
            }
            SimEvent::FileDeleted { chunk, path } => {
                let job = match FileKind::of(path) {
                    FileKind::Snapshot => ApplyJob::Invalidate {
                        chunk: *chunk,
                        reason: "snapshot file deleted",
                        reset_log: false,
                    },
                    FileKind::UpdateLog => ApplyJob::Invalidate {
                        chunk: *chunk,
                        reason: "update log deleted",
                        reset_log: true,
                    },
                };
                self.enqueue(job);
            }
            _ => {}
        }
    }

    fn on_action_completed(&self, event: &SimEvent) {
        if let SimEvent::ActionCompleted { action_id, result } = event {
            if self.actions.on_completion_event(action_id, result.clone()) == Delivery::Resolved {
                debug!(action = %action_id, success = result.success, "action completion delivered");
            }
        }
    }

    fn on_tick(&self, event: &SimEvent) {
        if let SimEvent::Tick { tick } = event {
            self.latest_tick.fetch_max(tick.0, Ordering::Relaxed);
            self.actions.sweep_overdue();
        }
    }

    /// Run one job on the worker thread.
    fn process(&self, job: ApplyJob) {
        let result = match job {
            ApplyJob::Snapshot { chunk, path } => {
                self.applier.apply_snapshot_file(&path).map(|outcome| {
                    if outcome.first_completion {
                        self.check_phase();
                    }
                    if outcome.stale {
                        self.recover_stale(chunk);
                    }
                })
            }
            ApplyJob::UpdateLog { chunk, path } => {
                self.applier.apply_update_log(chunk, &path).map(|outcome| {
                    if outcome.stale {
                        self.recover_stale(chunk);
                    }
                })
            }
            ApplyJob::Invalidate {
                chunk,
                reason,
                reset_log,
            } => self
                .applier
                .invalidate(chunk, reason, reset_log)
                .map(|stale| {
                    if stale {
                        self.recover_stale(chunk);
                    }
                }),
            ApplyJob::Shutdown => Ok(()),
        };

        if let Err(e) = result {
            match e {
                SyncError::StateTransition { .. } => {
                    error!(error = %e, "replica invariant violated");
                    *self.fault.lock() = Some(e);
                }
                other => warn!(error = %other, "apply job failed"),
            }
        }
    }

    fn recover_stale(&self, chunk: ChunkCoord) {
        if let Err(e) = self.request_if_untrusted(chunk, "stale recovery") {
            warn!(%chunk, error = %e, "could not request re-snapshot");
        }
    }

    /// Requeue a chunk and ask the simulation for a fresh dump.
    fn request_snapshot(&self, chunk: ChunkCoord, reason: &str) -> Result<()> {
        let before = self.applier.request_snapshot(chunk, reason)?;
        self.send_dump_command(chunk, before)?;
        info!(%chunk, from = %before, reason, "re-snapshot requested");
        Ok(())
    }

    /// Ask for a dump only if the chunk is not already trusted or awaited.
    fn request_if_untrusted(&self, chunk: ChunkCoord, reason: &str) -> Result<()> {
        if let Some(before) = self.applier.request_if_untrusted(chunk, reason)? {
            self.send_dump_command(chunk, before)?;
            info!(%chunk, reason, "snapshot requested");
        }
        Ok(())
    }

    /// Send the dump command for a chunk just queued from `before`. On
    /// failure the chunk leaves QUEUED so the next caller asks again.
    fn send_dump_command(&self, chunk: ChunkCoord, before: ChunkState) -> Result<()> {
        let command = self.config.resnapshot_command_for(chunk);
        if let Err(e) = self.commands.issue_command(&command) {
            if let Err(rollback) = self.applier.cancel_request(chunk, before, "dump command failed") {
                error!(%chunk, error = %rollback, "could not withdraw snapshot request");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Enqueue a dump already on disk, or request one.
    fn load_or_request(&self, chunk: ChunkCoord, reason: &str) -> Result<()> {
        if self.tracker.get_state(chunk) != ChunkState::Unknown {
            return self.request_if_untrusted(chunk, reason);
        }
        let dir = &self.config.snapshot_dir;
        let dump = snapshot_path(dir, chunk);
        if dump.exists() {
            debug!(%chunk, "loading dump left on disk");
            self.enqueue(ApplyJob::Snapshot { chunk, path: dump });
            self.enqueue(ApplyJob::UpdateLog {
                chunk,
                path: update_log_path(dir, chunk),
            });
            Ok(())
        } else {
            self.request_if_untrusted(chunk, reason)
        }
    }

    fn check_phase(&self) {
        if *self.phase.read() == SyncPhase::Maintenance {
            return;
        }
        let interest = self.interest.read().clone();
        if self.tracker.all_ever_complete(&interest) {
            let mut phase = self.phase.write();
            if *phase == SyncPhase::Bootstrap {
                *phase = SyncPhase::Maintenance;
                info!(chunks = interest.len(), "bootstrap complete, entering maintenance");
            }
        }
    }

    /// Wait until every job enqueued before this call has finished.
    /// Jobs enqueued while waiting are not waited for.
    fn wait_drained(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut progress = self.progress.lock();
        let ticket = progress.submitted;
        while progress.finished < ticket {
            if self
                .progress_changed
                .wait_until(&mut progress, deadline)
                .timed_out()
                && progress.finished < ticket
            {
                return Err(SyncError::BarrierTimeout {
                    elapsed: started.elapsed(),
                });
            }
        }
        Ok(())
    }
}

fn apply_worker(core: Arc<Core>, jobs: Receiver<ApplyJob>) {
    while let Ok(job) = jobs.recv() {
        let shutdown = matches!(job, ApplyJob::Shutdown);
        core.process(job);
        core.finish_job();
        if shutdown {
            break;
        }
    }
    debug!("apply worker exited");
}

/// One agent's synchronization session.
pub struct SyncCoordinator {
    core: Arc<Core>,
    jobs_rx: Receiver<ApplyJob>,
    dispatcher: EventDispatcher,
    worker: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl SyncCoordinator {
    pub fn new(config: SyncConfig, commands: Arc<dyn CommandChannel>) -> Self {
        let replica = Arc::new(Replica::new());
        let tracker = Arc::new(ChunkSnapshotTracker::new());
        let applier = Arc::new(SnapshotApplier::new(
            Arc::clone(&replica),
            Arc::clone(&tracker),
            config.max_deferred_updates,
        ));
        let actions = ActionCorrelator::new(config.action_timeout(), config.recent_action_memory);
        let (jobs, jobs_rx) = unbounded();

        let core = Arc::new(Core {
            interest: RwLock::new(config.chunks_of_interest.clone()),
            config,
            replica,
            tracker,
            applier,
            actions,
            commands,
            phase: RwLock::new(SyncPhase::Bootstrap),
            jobs,
            progress: Mutex::new(JobProgress::default()),
            progress_changed: Condvar::new(),
            fault: Mutex::new(None),
            latest_tick: AtomicU64::new(0),
        });

        let coordinator = Self {
            core,
            jobs_rx,
            dispatcher: EventDispatcher::new(),
            worker: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        };
        coordinator.subscribe_core();
        coordinator
    }

    // --- Lifecycle ---

    /// Warm up the command channel, bind the notification socket, and
    /// start the apply worker. Returns the bound notification address.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            if let Some(addr) = self.dispatcher.local_addr() {
                return Ok(addr);
            }
        }

        let config = &self.core.config;
        if config.warmup_attempts > 0 {
            warm_up(
                self.core.commands.as_ref(),
                &config.warmup_command,
                config.warmup_attempts,
            )?;
        }

        if worker.is_none() {
            let core = Arc::clone(&self.core);
            let jobs = self.jobs_rx.clone();
            *worker = Some(
                thread::Builder::new()
                    .name("worldsync-apply".into())
                    .spawn(move || apply_worker(core, jobs))?,
            );
        }

        self.subscribe_core();
        let addr = match self.dispatcher.start(&config.listen_addr, config.recv_buffer_size) {
            Ok(addr) => addr,
            Err(e) => {
                drop(worker);
                self.stop();
                return Err(e);
            }
        };
        drop(worker);

        info!(%addr, phase = ?self.phase(), "sync session started");
        self.bootstrap();
        Ok(addr)
    }

    /// Stop receiving notifications and shut the apply worker down after
    /// it drains. Idempotent.
    pub fn stop(&self) {
        self.dispatcher.stop();
        for id in self.subscriptions.lock().drain(..) {
            self.dispatcher.unsubscribe(id);
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            self.core.enqueue(ApplyJob::Shutdown);
            if handle.join().is_err() {
                error!("apply worker panicked");
            }
            info!("sync session stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running() && self.worker.lock().is_some()
    }

    /// Address the notification socket is bound to.
    pub fn notification_addr(&self) -> Option<SocketAddr> {
        self.dispatcher.local_addr()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    fn subscribe_core(&self) {
        let mut subs = self.subscriptions.lock();
        if !subs.is_empty() {
            return;
        }
        for event_type in [EventType::FileCreated, EventType::FileUpdated, EventType::FileDeleted] {
            let core = Arc::clone(&self.core);
            subs.push(
                self.dispatcher
                    .subscribe(event_type, Arc::new(move |e: &SimEvent| core.route_file_event(e))),
            );
        }
        let core = Arc::clone(&self.core);
        subs.push(self.dispatcher.subscribe(
            EventType::ActionCompleted,
            Arc::new(move |e: &SimEvent| core.on_action_completed(e)),
        ));
        let core = Arc::clone(&self.core);
        subs.push(
            self.dispatcher
                .subscribe(EventType::Tick, Arc::new(move |e: &SimEvent| core.on_tick(e))),
        );
    }

    /// Load dumps already on disk and request the rest.
    fn bootstrap(&self) {
        for chunk in self.chunks_of_interest() {
            if self.core.tracker.get_state(chunk) != ChunkState::Unknown {
                continue;
            }
            if let Err(e) = self.core.load_or_request(chunk, "bootstrap") {
                warn!(%chunk, error = %e, "bootstrap snapshot request failed");
            }
        }
        self.core.check_phase();
    }

    // --- Barriers ---

    /// Block until no apply is queued or running.
    ///
    /// Guarantees the replica is not torn when this returns, not that it
    /// has caught up with the live simulation. Surfaces any invariant
    /// violation raised on the apply worker since the last call.
    pub fn ensure_synced(&self) -> Result<()> {
        self.core.wait_drained(self.core.config.barrier_timeout())?;
        self.core.applier.wait_idle();
        if let Some(fault) = self.core.fault.lock().take() {
            return Err(fault);
        }
        Ok(())
    }

    /// Fence, then open a read view of the replica.
    pub fn query(&self) -> Result<ReplicaView<'_>> {
        self.ensure_synced()?;
        Ok(self.core.replica.read())
    }

    /// Wait for a chunk to be COMPLETE, requesting a dump first if the
    /// replica has never seen it or it went STALE.
    pub fn wait_for_chunk_snapshot(&self, chunk: ChunkCoord, timeout: Option<Duration>) -> Result<Tick> {
        let timeout = timeout.unwrap_or_else(|| self.core.config.snapshot_timeout());
        self.core.request_if_untrusted(chunk, "awaited by caller")?;
        let tick = self.core.tracker.wait_for_complete(chunk, timeout)?;
        debug!(%chunk, %tick, "chunk snapshot ready");
        Ok(tick)
    }

    // --- Actions ---

    /// Register an action id. Call before sending the command.
    pub fn register_action(&self, action_id: impl Into<ActionId>) -> Result<PendingAction> {
        let swept = self.core.actions.sweep_overdue();
        if !swept.is_empty() {
            debug!(count = swept.len(), "abandoned actions expired");
        }
        let pending = self.core.actions.register(action_id)?;
        info!(action = %pending.action_id, "awaiting action");
        Ok(pending)
    }

    /// Wait for a registered action to complete.
    pub fn wait_for_action(&self, action_id: &ActionId, timeout: Option<Duration>) -> Result<ActionResult> {
        let timeout = timeout.unwrap_or_else(|| self.core.actions.default_timeout());
        let result = self.core.actions.wait_timeout(action_id, timeout);
        match &result {
            Ok(r) => info!(action = %action_id, success = r.success, "action completed"),
            Err(e) => warn!(action = %action_id, error = %e, "action wait failed"),
        }
        result
    }

    /// Register, send, and await one action.
    pub fn issue_action(
        &self,
        action_id: impl Into<ActionId>,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ActionResult> {
        let pending = self.register_action(action_id)?;
        if let Err(e) = self.core.commands.issue_command(command) {
            self.core.actions.cancel(&pending.action_id);
            return Err(e);
        }
        self.wait_for_action(&pending.action_id, timeout)
    }

    /// Send a command without correlation.
    pub fn issue_command(&self, command: &str) -> Result<String> {
        self.core.commands.issue_command(command)
    }

    // --- Snapshot state ---

    pub fn get_snapshot_state(&self, chunk: ChunkCoord) -> ChunkState {
        self.core.tracker.get_state(chunk)
    }

    /// Request fresh dumps. `None` means every chunk of interest plus
    /// every chunk the tracker has seen. Returns the chunks requested.
    pub fn force_resnapshot(&self, chunks: Option<&[ChunkCoord]>) -> Result<Vec<ChunkCoord>> {
        let targets: Vec<ChunkCoord> = match chunks {
            Some(list) => list.to_vec(),
            None => {
                let mut all = self.core.tracker.tracked_chunks();
                all.extend(self.chunks_of_interest());
                all.sort();
                all.dedup();
                all
            }
        };

        for chunk in &targets {
            self.core.request_snapshot(*chunk, "forced re-snapshot")?;
        }
        Ok(targets)
    }

    // --- Phase ---

    pub fn phase(&self) -> SyncPhase {
        *self.core.phase.read()
    }

    pub fn chunks_of_interest(&self) -> Vec<ChunkCoord> {
        self.core.interest.read().clone()
    }

    /// Add chunks that must complete before leaving BOOTSTRAP. Once in
    /// MAINTENANCE the phase never reverts.
    ///
    /// While running, dumps for the new chunks are loaded or requested
    /// right away. Returns the first request failure after trying every
    /// chunk.
    pub fn add_chunks_of_interest(&self, chunks: &[ChunkCoord]) -> Result<()> {
        let mut added = Vec::new();
        {
            let mut interest = self.core.interest.write();
            for chunk in chunks {
                if !interest.contains(chunk) {
                    interest.push(*chunk);
                    added.push(*chunk);
                }
            }
        }

        let mut first_error = None;
        if self.is_running() {
            for chunk in added {
                if let Err(e) = self.core.load_or_request(chunk, "added to interest") {
                    warn!(%chunk, error = %e, "snapshot request for new chunk failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.core.check_phase();
        first_error.map_or(Ok(()), Err)
    }

    // --- Accessors ---

    pub fn replica(&self) -> &Arc<Replica> {
        &self.core.replica
    }

    pub fn tracker(&self) -> &Arc<ChunkSnapshotTracker> {
        &self.core.tracker
    }

    pub fn applier(&self) -> &Arc<SnapshotApplier> {
        &self.core.applier
    }

    pub fn config(&self) -> &SyncConfig {
        &self.core.config
    }

    /// Newest tick seen on the heartbeat.
    pub fn latest_tick(&self) -> Tick {
        Tick(self.core.latest_tick.load(Ordering::Relaxed))
    }

    /// Route an event as if it had arrived on the socket.
    pub fn handle_event(&self, event: &SimEvent) {
        self.dispatcher.dispatch(event);
    }

    pub fn stats(&self) -> SyncStats {
        let applier = &self.core.applier;
        SyncStats {
            snapshots_applied: applier.snapshots_applied(),
            updates_applied: applier.updates_applied(),
            duplicates_skipped: applier.duplicates_skipped(),
            updates_deferred: applier.updates_deferred(),
            stale_transitions: applier.stale_transitions(),
            decode_errors: self.dispatcher.decode_errors(),
            pending_actions: self.core.actions.pending_count(),
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
