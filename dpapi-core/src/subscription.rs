//! Notification subscription bookkeeping (component C7): a typed, opaque
//! handle per subscription so a caller can't unsubscribe someone else's
//! registration by guessing a small integer.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::MessageId;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle returned by `Channel::subscribe`, required by
/// `Channel::unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// One channel's standing interest in a notification type. The dispatcher
/// keeps a flat `Vec<SubscriptionEntry>` per message id and fans out to
/// every entry whose `channel_id` still has a live receiver.
pub struct SubscriptionEntry {
    pub id: SubscriptionId,
    pub channel_id: u64,
    pub message_id: MessageId,
    pub sender: tokio::sync::mpsc::Sender<bytes::Bytes>,
}

impl SubscriptionEntry {
    pub fn new(channel_id: u64, message_id: MessageId, sender: tokio::sync::mpsc::Sender<bytes::Bytes>) -> Self {
        SubscriptionEntry {
            id: SubscriptionId::next(),
            channel_id,
            message_id,
            sender,
        }
    }
}
