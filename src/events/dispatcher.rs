//! Datagram receiver and subscriber fan-out.

use crate::error::{Result, SyncError};
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::types::{EventType, SimEvent, SubscriptionHandle, SubscriptionId};

/// How often the receive loop wakes to check for `stop()`.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Callback invoked on the receive thread. Must not block.
pub type EventHandler = Arc<dyn Fn(&SimEvent) + Send + Sync>;

enum Target {
    Callback(EventHandler),
    Channel(Sender<SimEvent>),
}

struct Subscriber {
    id: SubscriptionId,
    target: Target,
}

/// State shared with the receive thread.
struct Shared {
    subscribers: RwLock<HashMap<EventType, Vec<Subscriber>>>,
    next_id: AtomicU64,
    running: AtomicBool,
    received: AtomicU64,
    decode_errors: AtomicU64,
}

impl Shared {
    fn dispatch(&self, event: &SimEvent) {
        let event_type = event.event_type();
        let mut overflowed = Vec::new();

        {
            let subs = self.subscribers.read();
            let Some(list) = subs.get(&event_type) else {
                debug!(?event_type, "no subscribers for event");
                return;
            };

            for sub in list {
                match &sub.target {
                    Target::Callback(handler) => {
                        if catch_unwind(AssertUnwindSafe(|| (**handler)(event))).is_err() {
                            error!(subscription = sub.id.0, ?event_type, "subscriber panicked");
                        }
                    }
                    Target::Channel(sender) => {
                        if sender.try_send(event.clone()).is_err() {
                            overflowed.push(sub.id);
                        }
                    }
                }
            }
        }

        // Remove channel subscribers that fell behind or hung up
        if !overflowed.is_empty() {
            let mut subs = self.subscribers.write();
            for list in subs.values_mut() {
                list.retain(|s| !overflowed.contains(&s.id));
            }
            warn!(dropped = overflowed.len(), "dropped slow channel subscribers");
        }
    }

    fn handle_datagram(&self, bytes: &[u8]) {
        self.received.fetch_add(1, Ordering::Relaxed);
        match decode_datagram(bytes) {
            Ok(event) => self.dispatch(&event),
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(len = bytes.len(), error = %e, "dropping malformed notification");
            }
        }
    }
}

/// Decode one datagram. JSON objects and MessagePack maps are accepted.
pub fn decode_datagram(bytes: &[u8]) -> Result<SimEvent> {
    let first = bytes.iter().copied().find(|b| !b.is_ascii_whitespace());
    match first {
        None => Err(SyncError::Decode("empty datagram".into())),
        Some(b'{') => {
            serde_json::from_slice(bytes).map_err(|e| SyncError::Decode(e.to_string()))
        }
        Some(_) => rmp_serde::from_slice(bytes).map_err(|e| SyncError::Decode(e.to_string())),
    }
}

/// Owns the notification socket and routes events to subscribers.
pub struct EventDispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                received: AtomicU64::new(0),
                decode_errors: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind the socket and spawn the receive loop.
    ///
    /// Calling `start` while running returns the already-bound address.
    pub fn start(&self, addr: &str, buffer_size: usize) -> Result<SocketAddr> {
        let mut worker = self.worker.lock();
        if let (Some(_), Some(bound)) = (worker.as_ref(), *self.local_addr.lock()) {
            if self.is_running() {
                return Ok(bound);
            }
        }
        // Reap a loop that died on its own
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let bound = socket.local_addr()?;

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("worldsync-dispatch".into())
            .spawn(move || receive_loop(socket, shared, buffer_size.max(1)))?;

        *worker = Some(handle);
        *self.local_addr.lock() = Some(bound);
        info!(addr = %bound, "notification dispatcher started");
        Ok(bound)
    }

    /// Stop the receive loop and close the socket. Idempotent.
    pub fn stop(&self) {
        let handle = {
            let mut worker = self.worker.lock();
            self.shared.running.store(false, Ordering::SeqCst);
            worker.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
            info!("notification dispatcher stopped");
        }
        *self.local_addr.lock() = None;
    }

    /// Whether the socket is bound and the receive loop alive.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Register a callback for one event type.
    pub fn subscribe(&self, event_type: EventType, handler: EventHandler) -> SubscriptionId {
        let id = self.next_id();
        self.shared
            .subscribers
            .write()
            .entry(event_type)
            .or_default()
            .push(Subscriber {
                id,
                target: Target::Callback(handler),
            });
        debug!(subscription = id.0, ?event_type, "callback subscribed");
        id
    }

    /// Register a bounded channel for several event types.
    ///
    /// The subscription is dropped once its buffer is full.
    pub fn subscribe_channel(&self, event_types: &[EventType], buffer: usize) -> SubscriptionHandle {
        let id = self.next_id();
        let (sender, receiver) = bounded(buffer.max(1));

        let mut subs = self.shared.subscribers.write();
        for event_type in event_types {
            subs.entry(*event_type).or_default().push(Subscriber {
                id,
                target: Target::Channel(sender.clone()),
            });
        }

        SubscriptionHandle { id, receiver }
    }

    /// Remove a subscription. Returns false if it was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut found = false;
        let mut subs = self.shared.subscribers.write();
        for list in subs.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != id);
            found |= list.len() != before;
        }
        found
    }

    /// Route an already-decoded event as if it had arrived on the socket.
    pub fn dispatch(&self, event: &SimEvent) {
        self.shared.dispatch(event);
    }

    /// Route raw datagram bytes through the decode path.
    pub fn dispatch_raw(&self, bytes: &[u8]) {
        self.shared.handle_datagram(bytes);
    }

    pub fn subscription_count(&self) -> usize {
        let subs = self.shared.subscribers.read();
        let mut ids: Vec<u64> = subs.values().flatten().map(|s| s.id.0).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn received_count(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    /// Malformed datagrams dropped so far.
    pub fn decode_errors(&self) -> u64 {
        self.shared.decode_errors.load(Ordering::Relaxed)
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(socket: UdpSocket, shared: Arc<Shared>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];

    while shared.running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                debug!(%peer, len, "datagram received");
                shared.handle_datagram(&buf[..len]);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            // Windows reports ICMP port-unreachable as a reset on UDP sockets
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(error = %e, "ignoring connection reset on datagram socket");
            }
            Err(e) => {
                error!(error = %e, "notification socket failed");
                break;
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionId, ActionResult, ChunkCoord};
    use std::sync::atomic::AtomicUsize;

    fn completed(id: &str) -> SimEvent {
        SimEvent::ActionCompleted {
            action_id: ActionId::from(id),
            result: ActionResult::default(),
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.subscribe(EventType::Tick, Arc::new(|_: &SimEvent| {}));
        assert_eq!(dispatcher.subscription_count(), 1);

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.subscription_count(), 0);
    }

    #[test]
    fn test_routes_by_event_type() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.subscribe(
            EventType::ActionCompleted,
            Arc::new(move |_: &SimEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher.dispatch(&completed("a1"));
        dispatcher.dispatch(&SimEvent::FileDeleted {
            chunk: ChunkCoord::new(0, 0),
            path: "chunk_0_0.json".into(),
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_payload_is_counted_not_raised() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.subscribe(
            EventType::Tick,
            Arc::new(move |_: &SimEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher.dispatch_raw(b"{not json");
        dispatcher.dispatch_raw(br#"{"event_type": "meteor_strike"}"#);
        dispatcher.dispatch_raw(b"");
        dispatcher.dispatch_raw(br#"{"event_type": "tick", "tick": 9}"#);

        assert_eq!(dispatcher.decode_errors(), 3);
        assert_eq!(dispatcher.received_count(), 4);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_msgpack_datagram() {
        let event = completed("mp-1");
        let bytes = rmp_serde::to_vec_named(&event).unwrap();
        assert_eq!(decode_datagram(&bytes).unwrap(), event);
    }

    #[test]
    fn test_undecodable_datagrams_are_decode_errors() {
        // 0xc1 is never valid MessagePack
        assert!(matches!(decode_datagram(&[0xc1, 0x00]), Err(SyncError::Decode(_))));
        assert!(matches!(decode_datagram(b"{\"tick\""), Err(SyncError::Decode(_))));
        assert!(matches!(decode_datagram(b"  "), Err(SyncError::Decode(_))));
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.subscribe(EventType::Tick, Arc::new(|_: &SimEvent| panic!("boom")));
        dispatcher.subscribe(
            EventType::Tick,
            Arc::new(move |_: &SimEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher.dispatch_raw(br#"{"event_type": "tick", "tick": 1}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_slow_channel_subscriber() {
        let dispatcher = EventDispatcher::new();
        let _handle = dispatcher.subscribe_channel(&[EventType::ActionCompleted], 2);

        for i in 0..5 {
            dispatcher.dispatch(&completed(&format!("a{}", i)));
        }

        assert_eq!(dispatcher.subscription_count(), 0);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let dispatcher = EventDispatcher::new();
        let addr = dispatcher.start("127.0.0.1:0", 1024).unwrap();
        assert!(dispatcher.is_running());
        assert_eq!(dispatcher.start("127.0.0.1:0", 1024).unwrap(), addr);

        dispatcher.stop();
        assert!(!dispatcher.is_running());
        dispatcher.stop();
        assert!(dispatcher.local_addr().is_none());
    }
}
