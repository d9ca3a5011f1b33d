use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{DeliveryCallback, TransportAdapter, TransportError};

/// An in-memory [`TransportAdapter`] used by tests and examples.
///
/// Holds a fixed `(name, crc) -> id` table (as if the peer had already
/// negotiated ids at connect time), records every frame sent through it,
/// and lets a test inject inbound frames via [`TransportAdapter::send_synthetic`]
/// or by queuing canned replies with [`MockTransport::queue_reply`].
pub struct MockTransport {
    ids: Mutex<HashMap<(String, u32), u16>>,
    sent: Mutex<Vec<Vec<u8>>>,
    delivery: Mutex<Option<DeliveryCallback>>,
    closed: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            ids: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            delivery: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a `(name, crc) -> id` mapping, as if the peer had answered
    /// at connect time. Must be called before the message type is used.
    pub fn register_id(&self, name: &str, crc: u32, id: u16) {
        self.ids.lock().unwrap().insert((name.to_string(), crc), id);
    }

    /// All frames handed to [`TransportAdapter::send`] so far, in order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliver a frame to whatever callback is currently registered, as if
    /// the peer had produced it. `bytes` is the full wire frame (message id
    /// first).
    pub fn inject(&self, bytes: Vec<u8>) {
        if let Some(cb) = self.delivery.lock().unwrap().as_ref() {
            cb(bytes);
        } else {
            tracing::warn!("mock transport: inject with no delivery callback registered");
        }
    }
}

impl TransportAdapter for MockTransport {
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(bytes);
        Ok(())
    }

    fn set_delivery(&self, callback: DeliveryCallback) {
        *self.delivery.lock().unwrap() = Some(callback);
    }

    fn resolve_id(&self, name: &str, crc: u32) -> Result<u16, TransportError> {
        self.ids
            .lock()
            .unwrap()
            .get(&(name.to_string(), crc))
            .copied()
            .ok_or(TransportError::UnknownMessage)
    }

    fn send_synthetic(&self, id: u16, mut bytes: Vec<u8>) {
        let mut frame = Vec::with_capacity(2 + bytes.len());
        frame.extend_from_slice(&id.to_be_bytes());
        frame.append(&mut bytes);
        self.inject(frame);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
