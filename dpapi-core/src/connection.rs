//! The process-wide entry point (component C4): exactly one live
//! connection at a time, guarded by an explicit flag rather than relying on
//! `Arc` reference counts or a hidden `OnceCell`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use dpapi_transport::TransportAdapter;
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelConfig, ChannelInner};
use crate::dispatcher::Dispatcher;
use crate::error::ConnectError;
use crate::registry::MessageRegistry;

static CONNECTION_LOCK: AtomicBool = AtomicBool::new(false);

/// A live connection to a single peer over one transport adapter. Dropping
/// the last handle does not disconnect; call [`Connection::disconnect`]
/// explicitly.
pub struct Connection {
    dispatcher: Arc<Dispatcher>,
    next_client_index: AtomicU32,
    /// Every channel opened on this connection, so `disconnect` can force
    /// them all closed without keeping any of them alive itself.
    channels: Mutex<Vec<Weak<ChannelInner>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("next_client_index", &self.next_client_index)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Take the process-wide connection slot and bring up a dispatcher over
    /// `transport`. Fails with [`ConnectError::AlreadyConnected`] if another
    /// connection is already live in this process.
    pub fn connect(transport: Arc<dyn TransportAdapter>) -> Result<Self, ConnectError> {
        if CONNECTION_LOCK.swap(true, Ordering::AcqRel) {
            return Err(ConnectError::AlreadyConnected);
        }

        tracing::info!("connection established");
        let registry = Arc::new(MessageRegistry::new());
        let dispatcher = Dispatcher::new(transport, registry);
        // Resolving the sentinel up front means a later multipart request
        // never races the peer over the one id every client needs.
        if let Err(err) = dispatcher.resolve_sentinel() {
            CONNECTION_LOCK.store(false, Ordering::Release);
            tracing::warn!(%err, "failed to resolve control-ping-reply sentinel");
            return Err(ConnectError::AlreadyConnected);
        }

        Ok(Connection {
            dispatcher,
            next_client_index: AtomicU32::new(0),
            channels: Mutex::new(Vec::new()),
        })
    }

    /// Open a channel with the default [`ChannelConfig`].
    pub fn new_channel(&self) -> Channel {
        self.new_channel_buffered(ChannelConfig::default())
    }

    /// Open a channel with an explicit queue-sizing override.
    pub fn new_channel_buffered(&self, config: ChannelConfig) -> Channel {
        let client_index = self.next_client_index.fetch_add(1, Ordering::Relaxed);
        let channel = Channel::new(self.dispatcher.clone(), client_index, config);
        self.channels.lock().push(channel.weak());
        channel
    }

    /// Release the process-wide connection slot: every outstanding channel
    /// is forced closed (evicting its pending conversations and
    /// subscriptions), the dispatcher's tables are cleared as a defensive
    /// sweep, and the transport is closed. Idempotent: a second call on an
    /// already-released connection (or a second connection value sharing
    /// the same process, which cannot exist) is a no-op.
    pub fn disconnect(&self) {
        if !CONNECTION_LOCK.swap(false, Ordering::AcqRel) {
            return;
        }
        for weak in self.channels.lock().drain(..) {
            if let Some(inner) = weak.upgrade() {
                inner.close();
            }
        }
        self.dispatcher.clear();
        self.dispatcher.close_transport();
        tracing::info!("connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use dpapi_transport::MockTransport;
    use serial_test::serial;

    fn transport() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport.register_id("control_ping_reply", crate::control::ControlPingReply::CRC, 2);
        transport
    }

    #[test]
    #[serial]
    fn second_connect_is_rejected_while_first_is_live() {
        let first = Connection::connect(transport() as Arc<dyn TransportAdapter>).unwrap();
        let err = Connection::connect(transport() as Arc<dyn TransportAdapter>).unwrap_err();
        assert_eq!(err, ConnectError::AlreadyConnected);
        drop(first);
    }

    #[test]
    #[serial]
    fn disconnect_frees_the_slot_for_reconnect() {
        let first = Connection::connect(transport() as Arc<dyn TransportAdapter>).unwrap();
        first.disconnect();
        let second = Connection::connect(transport() as Arc<dyn TransportAdapter>).unwrap();
        second.disconnect();
    }

    #[test]
    #[serial]
    fn disconnect_is_idempotent() {
        let conn = Connection::connect(transport() as Arc<dyn TransportAdapter>).unwrap();
        conn.disconnect();
        conn.disconnect(); // no panic, no effect
    }

    #[tokio::test]
    #[serial]
    async fn new_channel_assigns_distinct_client_indexes() {
        let conn = Connection::connect(transport() as Arc<dyn TransportAdapter>).unwrap();
        let a = conn.new_channel();
        let b = conn.new_channel();
        assert_ne!(a.client_index(), b.client_index());
        conn.disconnect();
    }

    #[tokio::test]
    #[serial]
    async fn disconnect_closes_open_channels_and_the_transport() {
        let mock = transport();
        let conn = Connection::connect(mock.clone() as Arc<dyn TransportAdapter>).unwrap();
        let channel = conn.new_channel();
        assert!(!channel.is_closed());

        conn.disconnect();

        assert!(channel.is_closed());
        assert_eq!(mock.send(vec![1]), Err(dpapi_transport::TransportError::Closed));
    }

    #[tokio::test]
    #[serial]
    async fn dropping_a_channel_before_disconnect_does_not_leak_its_weak_entry() {
        let conn = Connection::connect(transport() as Arc<dyn TransportAdapter>).unwrap();
        drop(conn.new_channel());

        // disconnect() must tolerate a Weak entry whose ChannelInner is
        // already gone.
        conn.disconnect();
    }
}
