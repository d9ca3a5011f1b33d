//! The per-caller handle (component C5): one `Channel` per logical user of
//! a connection, each with its own client index and its own slice of the
//! dispatcher's pending-conversation and subscription tables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{Semaphore, mpsc, oneshot};

use crate::codec;
use crate::control::ControlPingReply;
use crate::dispatcher::{Dispatcher, MultipartFrame};
use crate::error::CoreError;
use crate::message::{ContextId, Direction, Message};
use crate::subscription::SubscriptionId;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Per-channel queue sizing. The defaults match section 4.5/4.6: generous
/// headroom for a multipart dump and a shared reply queue, a small
/// subscription queue since a slow subscriber should fall behind rather
/// than stall the dispatcher, and a request queue that bounds how many
/// calls onto one channel may be in flight at once.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub multipart_buffer: usize,
    pub subscription_buffer: usize,
    pub request_buffer: usize,
    pub reply_buffer: usize,
}

impl ChannelConfig {
    pub const DEFAULT_MULTIPART_BUFFER: usize = 100;
    pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 16;
    pub const DEFAULT_REQUEST_BUFFER: usize = 100;
    pub const DEFAULT_REPLY_BUFFER: usize = 100;
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            multipart_buffer: Self::DEFAULT_MULTIPART_BUFFER,
            subscription_buffer: Self::DEFAULT_SUBSCRIPTION_BUFFER,
            request_buffer: Self::DEFAULT_REQUEST_BUFFER,
            reply_buffer: Self::DEFAULT_REPLY_BUFFER,
        }
    }
}

/// A stream of decoded notifications backed by a subscription. Dropping it
/// leaves the subscription registered; call [`NotificationStream::unsubscribe`]
/// (or [`Channel::unsubscribe`] with its id) to stop delivery explicitly.
pub struct NotificationStream<M: Message> {
    id: SubscriptionId,
    rx: mpsc::Receiver<Bytes>,
    _marker: std::marker::PhantomData<M>,
}

impl<M: Message> NotificationStream<M> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next notification, decoding it as `M`.
    pub async fn recv(&mut self) -> Option<Result<M, CoreError>> {
        let frame = self.rx.recv().await?;
        Some(codec::decode::<M>(frame, Direction::Other).map(|(_, value)| value).map_err(CoreError::from))
    }
}

/// One item out of a [`MultipartStream`]: either a decoded detail, or the
/// control-ping-reply sentinel that terminates the dump. The sentinel is
/// exposed rather than silently swallowed so a caller can read its
/// `retval`/`vpe_pid`.
#[derive(Debug)]
pub enum MultipartReply<D> {
    Detail(D),
    Done(ControlPingReply),
}

/// A stream of decoded detail frames from a multipart dump, one item per
/// `recv()` call, ending after the dispatcher's control-ping sentinel is
/// delivered and closes the underlying channel. Mirrors the
/// single-item-at-a-time receive shape a dump conceptually has, rather than
/// forcing every caller to wait for the whole dump before seeing the first
/// detail.
pub struct MultipartStream<D: Message> {
    rx: mpsc::Receiver<MultipartFrame>,
    _marker: std::marker::PhantomData<D>,
}

impl<D: Message> MultipartStream<D> {
    /// Wait for the next item, decoding a detail as `D` or the terminating
    /// sentinel as [`ControlPingReply`]. Returns `None` once the stream has
    /// been fully drained past its sentinel.
    pub async fn recv(&mut self) -> Option<Result<MultipartReply<D>, CoreError>> {
        let frame = self.rx.recv().await?;
        Some(match frame {
            MultipartFrame::Detail(bytes) => codec::decode::<D>(bytes, Direction::Other)
                .map(|(_, value)| MultipartReply::Detail(value))
                .map_err(CoreError::from),
            MultipartFrame::Sentinel(bytes) => codec::decode::<ControlPingReply>(bytes, Direction::Reply)
                .map(|(_, value)| MultipartReply::Done(value))
                .map_err(CoreError::from),
        })
    }

    /// Drain the stream to completion, returning just the details; the
    /// sentinel's own payload is consumed to end the loop and discarded.
    /// Convenience for callers who want the whole dump at once; details
    /// dropped for backpressure before being read are simply absent,
    /// mirroring the dispatcher's offer-don't-block policy.
    pub async fn collect(mut self) -> Result<Vec<D>, CoreError> {
        let mut details = Vec::new();
        while let Some(item) = self.recv().await {
            match item? {
                MultipartReply::Detail(value) => details.push(value),
                MultipartReply::Done(_) => break,
            }
        }
        Ok(details)
    }
}

/// Shared state behind a [`Channel`]. Kept in its own `Arc` so a
/// [`crate::connection::Connection`] can hold a [`Weak`] reference and force
/// every outstanding channel closed on disconnect, without keeping the
/// channel alive itself.
pub(crate) struct ChannelInner {
    id: u64,
    client_index: u32,
    dispatcher: Arc<Dispatcher>,
    config: ChannelConfig,
    closed: AtomicBool,
    reply_tx: mpsc::Sender<Bytes>,
    waiters: Arc<parking_lot::Mutex<HashMap<ContextId, oneshot::Sender<Bytes>>>>,
    request_permits: Semaphore,
    reply_pump: tokio::task::JoinHandle<()>,
}

impl ChannelInner {
    /// Evict this channel's pending conversations and subscriptions, and
    /// stop the background task that demultiplexes its reply queue.
    /// Idempotent: a second call is a no-op.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reply_pump.abort();
        self.dispatcher.evict_channel(self.id);
    }
}

/// One caller's handle onto a connection: its own client index, and the
/// slice of the dispatcher's state tagged with its channel id.
pub struct Channel(Arc<ChannelInner>);

impl Channel {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, client_index: u32, config: ChannelConfig) -> Self {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);

        // A single bounded reply queue per channel, shared by every
        // in-flight `send_request` call, so a slow caller can only ever
        // cause the peer's replies to drop, never to block (section 4.6).
        // A background pump demultiplexes it to each request's own waiter
        // by context id, so one stuck waiter can't starve the others the
        // way sharing the receiver directly would.
        let (reply_tx, mut reply_rx) = mpsc::channel::<Bytes>(config.reply_buffer);
        let waiters: Arc<parking_lot::Mutex<HashMap<ContextId, oneshot::Sender<Bytes>>>> =
            Arc::new(parking_lot::Mutex::new(HashMap::new()));

        let pump_waiters = waiters.clone();
        let reply_pump = tokio::spawn(async move {
            while let Some(frame) = reply_rx.recv().await {
                let context = match codec::peek_context(&frame, Direction::Reply) {
                    Ok(context) => context,
                    Err(err) => {
                        tracing::warn!(%err, "dropping reply with unreadable context");
                        continue;
                    }
                };
                match pump_waiters.lock().remove(&context) {
                    Some(waiter) => {
                        let _ = waiter.send(frame);
                    }
                    None => tracing::warn!(%context, "dropping reply: no waiter registered for it"),
                }
            }
        });

        Channel(Arc::new(ChannelInner {
            id,
            client_index,
            dispatcher,
            config,
            closed: AtomicBool::new(false),
            reply_tx,
            waiters,
            request_permits: Semaphore::new(config.request_buffer),
            reply_pump,
        }))
    }

    /// A non-owning reference a [`crate::connection::Connection`] can use to
    /// force this channel closed without keeping it alive.
    pub(crate) fn weak(&self) -> Weak<ChannelInner> {
        Arc::downgrade(&self.0)
    }

    pub fn client_index(&self) -> u32 {
        self.0.client_index
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), CoreError> {
        if self.0.closed.load(Ordering::Acquire) {
            Err(CoreError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    /// Send `request` and await its single reply, decoded as `R`. Blocks
    /// while this channel already has `request_buffer` other calls in
    /// flight.
    pub async fn send_request<M, R>(&self, request: &M) -> Result<R, CoreError>
    where
        M: Message,
        R: Message,
    {
        self.check_open()?;
        let inner = &self.0;

        let _permit = inner.request_permits.acquire().await.map_err(|_| CoreError::ChannelClosed)?;

        let context = inner.dispatcher.alloc_context();
        let (tx, rx) = oneshot::channel();
        inner.waiters.lock().insert(context, tx);

        if let Err(err) =
            inner
                .dispatcher
                .send_request_with_context(inner.id, context, request, inner.client_index, inner.reply_tx.clone())
        {
            inner.waiters.lock().remove(&context);
            return Err(err);
        }

        let frame = rx.await.map_err(|_| CoreError::ChannelClosed)?;
        let (_, value) = codec::decode::<R>(frame, Direction::Reply)?;
        Ok(value)
    }

    /// Send `request` and return a stream yielding each detail frame up to
    /// the multipart terminator, decoded as `D`.
    pub fn send_multi_request<M, D>(&self, request: &M) -> Result<MultipartStream<D>, CoreError>
    where
        M: Message,
        D: Message,
    {
        self.check_open()?;
        let rx = self
            .0
            .dispatcher
            .send_multi_request(self.0.id, request, self.0.client_index, self.0.config.multipart_buffer)?;
        Ok(MultipartStream {
            rx,
            _marker: std::marker::PhantomData,
        })
    }

    /// Register standing interest in notification type `M`.
    pub fn subscribe<M: Message>(&self) -> Result<NotificationStream<M>, CoreError> {
        self.check_open()?;
        let (id, rx) = self.0.dispatcher.subscribe::<M>(self.0.id, self.0.config.subscription_buffer)?;
        Ok(NotificationStream {
            id,
            rx,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.0.dispatcher.unsubscribe(id);
    }

    /// Validate a whole catalog of `(name, crc)` pairs against the peer.
    pub fn check_message_compatibility(&self, pairs: &[(&'static str, u32)]) -> Vec<&'static str> {
        self.0
            .dispatcher
            .registry()
            .check_compatibility(pairs, |name, crc| self.0.dispatcher.transport_resolve(name, crc))
    }

    /// Evict this channel's pending conversations and subscriptions.
    /// Idempotent: a second call is a no-op.
    pub fn close(&self) {
        self.0.close();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
