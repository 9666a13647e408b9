//! Inbound notification channel.
//!
//! The simulation pushes notifications as datagrams. One dispatcher per
//! agent owns the socket and fans decoded events out to subscribers:
//! - Snapshot and update-log file events
//! - Action completion events
//! - Tick heartbeats
//!
//! Subscribers register either a callback (runs on the receive thread,
//! must not block) or a bounded channel (dropped if it falls behind).
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = EventDispatcher::new();
//! let addr = dispatcher.start("127.0.0.1:0", 64 * 1024)?;
//!
//! dispatcher.subscribe(EventType::ActionCompleted, Arc::new(|event| {
//!     println!("completed: {:?}", event);
//! }));
//!
//! let files = dispatcher.subscribe_channel(&[EventType::FileUpdated], 256);
//! while let Ok(event) = files.recv() {
//!     println!("file event: {:?}", event);
//! }
//! ```

mod dispatcher;
mod types;

pub use dispatcher::{decode_datagram, EventDispatcher, EventHandler};
pub use types::{EventType, FileKind, SimEvent, SubscriptionHandle, SubscriptionId};
