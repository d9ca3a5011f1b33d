//! Transport adapter interface.
//!
//! This crate defines the narrow duplex port the dispatcher speaks to: send a
//! frame, be told about inbound frames through a callback, and resolve a
//! `(name, crc)` pair to the peer's numeric message id. A real adapter opens
//! the shared-memory queue to the dataplane process; [`mock`] stands in for
//! one in tests.

use std::fmt;
use std::sync::Arc;

mod mock;

pub use mock::MockTransport;

/// Callback invoked by an adapter whenever a frame arrives, from an
/// adapter-owned thread. The core never calls this; it only registers one.
pub type DeliveryCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Errors an adapter can report back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The adapter's connection to the peer is closed.
    Closed,
    /// The peer does not know this `(name, crc)` pair.
    UnknownMessage,
    /// Adapter-specific I/O failure, carried as text since the concrete
    /// transport (shared-memory queue, socket, ...) is out of scope here.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::UnknownMessage => write!(f, "unknown message"),
            TransportError::Io(msg) => write!(f, "transport I/O error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// The minimal duplex port the core consumes. A single connection owns
/// exactly one of these for its entire lifetime.
pub trait TransportAdapter: Send + Sync + 'static {
    /// Send a raw frame to the peer. Callable from any thread; the adapter
    /// is responsible for serializing concurrent sends internally.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Register the callback the adapter invokes for every inbound frame.
    /// Called once, at connect time.
    fn set_delivery(&self, callback: DeliveryCallback);

    /// Resolve a `(name, crc)` pair to the peer-assigned numeric id, asking
    /// the peer if necessary. Returns `UnknownMessage` if the peer doesn't
    /// recognize the pair.
    fn resolve_id(&self, name: &str, crc: u32) -> Result<u16, TransportError>;

    /// Test hook: inject a frame as though the peer had sent it. Behaves
    /// identically to the peer calling the delivery callback directly.
    fn send_synthetic(&self, id: u16, bytes: Vec<u8>);

    /// Tear down the adapter. Idempotent.
    fn close(&self);
}
