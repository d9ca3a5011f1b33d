//! Request/reply correlation and notification fan-out (component C6): the
//! heart of the multiplexer. One [`Dispatcher`] is shared by every channel
//! on a connection and owns the single transport adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use dpapi_transport::TransportAdapter;

use crate::codec;
use crate::control::ControlPing;
use crate::error::CoreError;
use crate::message::{ContextId, Direction, Message, MessageId};
use crate::registry::MessageRegistry;
use crate::subscription::{SubscriptionEntry, SubscriptionId};

/// A frame routed to a multipart stream: either a detail, or the sentinel
/// that terminates it. [`crate::channel::MultipartStream`] decodes the two
/// differently (a detail as the dump's own type, the sentinel as
/// [`crate::control::ControlPingReply`]).
pub(crate) enum MultipartFrame {
    Detail(Bytes),
    Sentinel(Bytes),
}

/// What the dispatcher does with a frame once it knows which conversation
/// it belongs to.
enum Conversation {
    /// A single in-flight `send_request`, waiting on its one reply. `reply_tx`
    /// is the channel's shared, bounded reply queue (section 4.6): full or
    /// closed means the reply is dropped, not blocked on.
    Single { channel_id: u64, reply_tx: mpsc::Sender<Bytes> },
    /// An in-flight `send_multi_request`, collecting detail frames until the
    /// matching [`Conversation::Sentinel`] fires.
    Multipart {
        channel_id: u64,
        detail_tx: mpsc::Sender<MultipartFrame>,
    },
    /// The control-ping that terminates `target`'s multipart stream. Firing
    /// it forwards its own frame through `target`'s `detail_tx` (as the
    /// stream's last item) before evicting `target`.
    Sentinel { channel_id: u64, target: ContextId },
}

impl Conversation {
    fn channel_id(&self) -> u64 {
        match self {
            Conversation::Single { channel_id, .. } => *channel_id,
            Conversation::Multipart { channel_id, .. } => *channel_id,
            Conversation::Sentinel { channel_id, .. } => *channel_id,
        }
    }
}

pub struct Dispatcher {
    transport: Arc<dyn TransportAdapter>,
    registry: Arc<MessageRegistry>,
    next_context: AtomicU32,
    pending: RwLock<HashMap<ContextId, Conversation>>,
    subscriptions: RwLock<HashMap<MessageId, Vec<SubscriptionEntry>>>,
    sentinel_id: OnceLock<MessageId>,
}

impl Dispatcher {
    /// Build a dispatcher over `transport` and register its delivery
    /// callback. The returned `Arc` is the only thing that keeps the
    /// callback (and therefore the dispatcher) alive; dropping every clone
    /// stops inbound frames from being processed.
    pub fn new(transport: Arc<dyn TransportAdapter>, registry: Arc<MessageRegistry>) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher {
            transport,
            registry,
            next_context: AtomicU32::new(1),
            pending: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            sentinel_id: OnceLock::new(),
        });

        let weak: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
        dispatcher.transport.set_delivery(Arc::new(move |bytes| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.on_frame(bytes);
            }
        }));

        dispatcher
    }

    /// Allocate a fresh, dispatcher-wide-unique correlation id. Exposed so a
    /// [`crate::channel::Channel`] can register its own waiter before handing
    /// the context to [`Dispatcher::send_request_with_context`].
    pub fn alloc_context(&self) -> ContextId {
        ContextId(self.next_context.fetch_add(1, Ordering::Relaxed))
    }

    /// Resolve and cache the multipart termination sentinel's id. Called
    /// once at connect time; `send_multi_request` relies on it already
    /// being cached.
    pub fn resolve_sentinel(&self) -> Result<MessageId, CoreError> {
        if let Some(id) = self.sentinel_id.get() {
            return Ok(*id);
        }
        let id = self
            .registry
            .resolve::<crate::control::ControlPingReply, _>(|name, crc| {
                self.transport.resolve_id(name, crc).ok()
            })?;
        // Another thread may have won the race; either value is correct.
        let _ = self.sentinel_id.set(id);
        Ok(id)
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    pub(crate) fn transport_resolve(&self, name: &str, crc: u32) -> Option<u16> {
        self.transport.resolve_id(name, crc).ok()
    }

    /// Send a request under a caller-allocated `context`, registering the
    /// channel's shared `reply_tx` as where its reply should land. The
    /// caller (a [`crate::channel::Channel`]) is responsible for
    /// demultiplexing that shared queue back to this particular call.
    pub fn send_request_with_context<M: Message>(
        &self,
        channel_id: u64,
        context: ContextId,
        msg: &M,
        client_index: u32,
        reply_tx: mpsc::Sender<Bytes>,
    ) -> Result<(), CoreError> {
        let id = self.registry.resolve::<M, _>(|name, crc| self.transport.resolve_id(name, crc).ok())?;
        self.pending.write().insert(context, Conversation::Single { channel_id, reply_tx });

        let frame = codec::encode(Some(msg), id, client_index, context)?;
        if let Err(err) = self.transport.send(frame) {
            self.pending.write().remove(&context);
            return Err(err.into());
        }
        Ok(())
    }

    /// Send a request expected to produce a stream of detail frames
    /// terminated by a control-ping-reply, and register both the multipart
    /// conversation and the sentinel that closes it.
    pub fn send_multi_request<M: Message>(
        &self,
        channel_id: u64,
        msg: &M,
        client_index: u32,
        buffer: usize,
    ) -> Result<mpsc::Receiver<MultipartFrame>, CoreError> {
        let id = self.registry.resolve::<M, _>(|name, crc| self.transport.resolve_id(name, crc).ok())?;
        let ping_id = self
            .registry
            .resolve::<ControlPing, _>(|name, crc| self.transport.resolve_id(name, crc).ok())?;

        let dump_context = self.alloc_context();
        let (detail_tx, detail_rx) = mpsc::channel(buffer);
        self.pending.write().insert(
            dump_context,
            Conversation::Multipart {
                channel_id,
                detail_tx,
            },
        );

        let frame = codec::encode(Some(msg), id, client_index, dump_context)?;
        if let Err(err) = self.transport.send(frame) {
            self.pending.write().remove(&dump_context);
            return Err(err.into());
        }

        let ping_context = self.alloc_context();
        self.pending.write().insert(
            ping_context,
            Conversation::Sentinel {
                channel_id,
                target: dump_context,
            },
        );
        let ping_frame = codec::encode(Some(&ControlPing), ping_id, client_index, ping_context)?;
        if let Err(err) = self.transport.send(ping_frame) {
            self.pending.write().remove(&ping_context);
            self.pending.write().remove(&dump_context);
            return Err(err.into());
        }

        Ok(detail_rx)
    }

    /// Register standing interest in a notification type, returning both
    /// the handle needed to unsubscribe and the receiver of future frames.
    pub fn subscribe<M: Message>(&self, channel_id: u64, buffer: usize) -> Result<(SubscriptionId, mpsc::Receiver<Bytes>), CoreError> {
        let id = self.registry.resolve::<M, _>(|name, crc| self.transport.resolve_id(name, crc).ok())?;
        let (tx, rx) = mpsc::channel(buffer);
        let entry = SubscriptionEntry::new(channel_id, id, tx);
        let sub_id = entry.id;
        self.subscriptions.write().entry(id).or_default().push(entry);
        Ok((sub_id, rx))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscriptions.write();
        for entries in subs.values_mut() {
            entries.retain(|entry| entry.id != id);
        }
    }

    /// Remove every pending conversation and subscription tagged with
    /// `channel_id`. Called when a channel closes; deliberately O(n) over
    /// both tables since channel closes are infrequent.
    pub fn evict_channel(&self, channel_id: u64) {
        self.pending.write().retain(|_, conv| conv.channel_id() != channel_id);
        for entries in self.subscriptions.write().values_mut() {
            entries.retain(|entry| entry.channel_id != channel_id);
        }
    }

    /// Drop every pending conversation and subscription, regardless of
    /// which channel it belongs to. Called by [`crate::connection::Connection::disconnect`]
    /// after every known channel has already been evicted individually, as
    /// a defensive sweep so nothing outlives the connection.
    pub fn clear(&self) {
        self.pending.write().clear();
        self.subscriptions.write().clear();
    }

    /// Close the underlying transport. Called once, by
    /// [`crate::connection::Connection::disconnect`].
    pub fn close_transport(&self) {
        self.transport.close();
    }

    fn on_frame(&self, bytes: Vec<u8>) {
        let buf = Bytes::from(bytes);

        let id = match codec::peek_message_id(&buf) {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(%err, "dropping frame with unreadable header");
                return;
            }
        };

        let direction = match self.registry.direction_of(id) {
            Some(direction) => direction,
            None => {
                tracing::warn!(?id, "dropping frame with unresolvable message id");
                return;
            }
        };

        let context = match codec::peek_context(&buf, direction) {
            Ok(context) => context,
            Err(err) => {
                tracing::warn!(%err, ?id, "dropping frame with unreadable context");
                return;
            }
        };

        let conversation = self.pending.write().remove(&context);
        match conversation {
            Some(Conversation::Single { reply_tx, .. }) => {
                tracing::trace!(?id, %context, "dispatching reply");
                if reply_tx.try_send(buf).is_err() {
                    tracing::warn!(%context, "dropping reply: channel's reply queue full or closed");
                }
            }
            Some(Conversation::Multipart { channel_id, detail_tx }) => {
                tracing::trace!(?id, %context, "dispatching multipart detail");
                if detail_tx.try_send(MultipartFrame::Detail(buf)).is_err() {
                    tracing::warn!(%context, "dropping multipart detail: receiver full or closed");
                }
                // Still open: put the conversation back so later details land too.
                self.pending.write().insert(context, Conversation::Multipart { channel_id, detail_tx });
            }
            Some(Conversation::Sentinel { target, .. }) => {
                tracing::debug!(%context, %target, "multipart stream terminated");
                if let Some(Conversation::Multipart { detail_tx, .. }) = self.pending.write().remove(&target) {
                    if detail_tx.try_send(MultipartFrame::Sentinel(buf)).is_err() {
                        tracing::warn!(%target, "dropping multipart sentinel: receiver full or closed");
                    }
                }
            }
            None => self.fan_out(id, buf),
        }
    }

    fn fan_out(&self, id: MessageId, buf: Bytes) {
        let subs = self.subscriptions.read();
        match subs.get(&id) {
            Some(entries) if !entries.is_empty() => {
                for entry in entries {
                    if entry.sender.try_send(buf.clone()).is_err() {
                        tracing::warn!(?id, subscription = ?entry.id, "dropping notification: subscriber full or closed");
                    }
                }
            }
            _ => {
                tracing::warn!(?id, "dropping frame matching no conversation or subscription");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlPingReply;
    use crate::error::CodecError;
    use dpapi_transport::MockTransport;

    #[derive(Debug)]
    struct SwInterfaceDump;
    impl Message for SwInterfaceDump {
        const NAME: &'static str = "sw_interface_dump";
        const CRC: u32 = 0x1111;
        const DIRECTION: Direction = Direction::Request;
        fn encode_fields(&self, _buf: &mut bytes::BytesMut) -> Result<(), CodecError> {
            Ok(())
        }
        fn decode_fields(_buf: &mut Bytes) -> Result<Self, CodecError> {
            Ok(SwInterfaceDump)
        }
    }

    #[derive(Debug)]
    struct SwInterfaceDetails;
    impl Message for SwInterfaceDetails {
        const NAME: &'static str = "sw_interface_details";
        const CRC: u32 = 0x2222;
        const DIRECTION: Direction = Direction::Other;
        fn encode_fields(&self, _buf: &mut bytes::BytesMut) -> Result<(), CodecError> {
            Ok(())
        }
        fn decode_fields(_buf: &mut Bytes) -> Result<Self, CodecError> {
            Ok(SwInterfaceDetails)
        }
    }

    #[derive(Debug)]
    struct InterfaceLinkUpDown;
    impl Message for InterfaceLinkUpDown {
        const NAME: &'static str = "sw_interface_event";
        const CRC: u32 = 0x3333;
        const DIRECTION: Direction = Direction::Other;
        fn encode_fields(&self, _buf: &mut bytes::BytesMut) -> Result<(), CodecError> {
            Ok(())
        }
        fn decode_fields(_buf: &mut Bytes) -> Result<Self, CodecError> {
            Ok(InterfaceLinkUpDown)
        }
    }

    fn setup() -> (Arc<Dispatcher>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        transport.register_id("control_ping", crate::control::ControlPing::CRC, 1);
        transport.register_id("control_ping_reply", ControlPingReply::CRC, 2);
        transport.register_id(SwInterfaceDump::NAME, SwInterfaceDump::CRC, 3);
        transport.register_id(SwInterfaceDetails::NAME, SwInterfaceDetails::CRC, 4);
        transport.register_id(InterfaceLinkUpDown::NAME, InterfaceLinkUpDown::CRC, 5);

        let registry = Arc::new(MessageRegistry::new());
        let dispatcher = Dispatcher::new(transport.clone() as Arc<dyn TransportAdapter>, registry);
        dispatcher.resolve_sentinel().unwrap();
        (dispatcher, transport)
    }

    #[tokio::test]
    async fn single_request_reply_round_trip() {
        let (dispatcher, transport) = setup();
        let context = dispatcher.alloc_context();
        let (reply_tx, mut rx) = mpsc::channel(1);
        dispatcher.send_request_with_context(1, context, &ControlPing, 0, reply_tx).unwrap();

        let sent = transport.sent_frames();
        let context = codec::peek_context(&Bytes::from(sent[0].clone()), Direction::Request).unwrap();

        let reply = ControlPingReply {
            retval: 0,
            client_index: 0,
            vpe_pid: 9,
        };
        let reply_frame = codec::encode(Some(&reply), MessageId(2), 0, context).unwrap();
        transport.inject(reply_frame);

        let frame = rx.try_recv().unwrap();
        let (got_context, decoded) = codec::decode::<ControlPingReply>(frame, Direction::Reply).unwrap();
        assert_eq!(got_context, context);
        assert_eq!(decoded, reply);
    }

    #[tokio::test]
    async fn multipart_collects_details_until_sentinel() {
        let (dispatcher, transport) = setup();
        let mut rx = dispatcher.send_multi_request(1, &SwInterfaceDump, 0, 8).unwrap();

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 2, "dump request, then control-ping terminator");

        let dump_context = codec::peek_context(&Bytes::from(sent[0].clone()), Direction::Request).unwrap();
        let ping_context = codec::peek_context(&Bytes::from(sent[1].clone()), Direction::Request).unwrap();

        let detail_frame = codec::encode(Some(&SwInterfaceDetails), MessageId(4), 0, dump_context).unwrap();
        transport.inject(detail_frame.clone());
        transport.inject(detail_frame);

        let ping_reply = ControlPingReply {
            retval: 0,
            client_index: 0,
            vpe_pid: 0,
        };
        let ping_reply_frame = codec::encode(Some(&ping_reply), MessageId(2), 0, ping_context).unwrap();
        transport.inject(ping_reply_frame);

        assert!(matches!(rx.try_recv(), Ok(MultipartFrame::Detail(_))));
        assert!(matches!(rx.try_recv(), Ok(MultipartFrame::Detail(_))));
        assert!(matches!(rx.try_recv(), Ok(MultipartFrame::Sentinel(_))));
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[tokio::test]
    async fn subscription_receives_matching_notifications() {
        let (dispatcher, transport) = setup();
        let (_id, mut rx) = dispatcher.subscribe::<InterfaceLinkUpDown>(1, 4).unwrap();

        let event_frame = codec::encode(Some(&InterfaceLinkUpDown), MessageId(5), 0, ContextId(0)).unwrap();
        transport.inject(event_frame);

        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (dispatcher, transport) = setup();
        let (sub_id, mut rx) = dispatcher.subscribe::<InterfaceLinkUpDown>(1, 4).unwrap();
        dispatcher.unsubscribe(sub_id);

        let event_frame = codec::encode(Some(&InterfaceLinkUpDown), MessageId(5), 0, ContextId(0)).unwrap();
        transport.inject(event_frame);

        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_without_panicking() {
        let (dispatcher, transport) = setup();
        let (_id, mut rx) = dispatcher.subscribe::<InterfaceLinkUpDown>(1, 1).unwrap();

        let event_frame = codec::encode(Some(&InterfaceLinkUpDown), MessageId(5), 0, ContextId(0)).unwrap();
        transport.inject(event_frame.clone());
        transport.inject(event_frame); // queue already full of the first one

        assert!(rx.try_recv().is_ok());
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn evict_channel_removes_its_pending_and_subscriptions() {
        let (dispatcher, _transport) = setup();
        let (reply_tx, _reply_rx) = mpsc::channel(1);
        dispatcher.send_request_with_context(7, dispatcher.alloc_context(), &ControlPing, 0, reply_tx).unwrap();
        let (_id, _sub_rx) = dispatcher.subscribe::<InterfaceLinkUpDown>(7, 4).unwrap();

        assert_eq!(dispatcher.pending.read().len(), 1);
        dispatcher.evict_channel(7);
        assert_eq!(dispatcher.pending.read().len(), 0);
        assert!(dispatcher.subscriptions.read().values().all(|v| v.is_empty()));
    }

    #[tokio::test]
    async fn late_reply_with_no_pending_conversation_is_dropped_silently() {
        let (_dispatcher, transport) = setup();
        let reply = ControlPingReply {
            retval: 0,
            client_index: 0,
            vpe_pid: 0,
        };
        let frame = codec::encode(Some(&reply), MessageId(2), 0, ContextId(999)).unwrap();
        transport.inject(frame); // no panic, no matching conversation or subscription
    }

    #[tokio::test]
    async fn clear_drops_every_pending_conversation_and_subscription() {
        let (dispatcher, _transport) = setup();
        let (reply_tx, _reply_rx) = mpsc::channel(1);
        dispatcher.send_request_with_context(1, dispatcher.alloc_context(), &ControlPing, 0, reply_tx).unwrap();
        dispatcher.subscribe::<InterfaceLinkUpDown>(2, 4).unwrap();

        dispatcher.clear();

        assert_eq!(dispatcher.pending.read().len(), 0);
        assert!(dispatcher.subscriptions.read().values().all(|v| v.is_empty()));
    }

    #[tokio::test]
    async fn close_transport_forwards_to_the_adapter() {
        let (dispatcher, transport) = setup();
        dispatcher.close_transport();
        assert_eq!(transport.send(vec![1]), Err(dpapi_transport::TransportError::Closed));
    }
}
