//! Maps `(name, crc)` pairs to peer-assigned numeric ids, and caches the
//! reverse mapping so an inbound frame's header can be parsed without
//! knowing the concrete message type ahead of time (component C1).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::RegistryError;
use crate::message::{Direction, Message, MessageId};

/// Thread-safe `(name, crc) -> id` cache, filled lazily from the transport
/// adapter the first time each type is used.
///
/// A `MessageRegistry` is shared (via `Arc`) between the dispatcher and every
/// channel on a connection; all of them resolve ids through the same cache.
#[derive(Default)]
pub struct MessageRegistry {
    by_name: RwLock<HashMap<(&'static str, u32), Option<MessageId>>>,
    directions: RwLock<HashMap<MessageId, Direction>>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        MessageRegistry::default()
    }

    /// Resolve `M`'s numeric id, asking `resolve` (the transport adapter) on
    /// a cache miss. Populates the reverse direction cache as a side effect,
    /// so a later inbound frame carrying this id can be routed without
    /// knowing `M` by name. An unknown `(name, crc)` pair is cached too, as
    /// `None`, so repeated lookups of the same unresolvable type don't keep
    /// re-invoking the transport adapter.
    pub fn resolve<M, F>(&self, resolve: F) -> Result<MessageId, RegistryError>
    where
        M: Message,
        F: FnOnce(&str, u32) -> Option<u16>,
    {
        let key = (M::NAME, M::CRC);
        if let Some(cached) = self.by_name.read().get(&key) {
            return cached.ok_or(RegistryError::UnknownMessage {
                name: M::NAME,
                crc: M::CRC,
            });
        }

        let Some(raw) = resolve(M::NAME, M::CRC) else {
            self.by_name.write().insert(key, None);
            return Err(RegistryError::UnknownMessage {
                name: M::NAME,
                crc: M::CRC,
            });
        };
        let id = MessageId(raw);

        self.by_name.write().insert(key, Some(id));
        self.directions.write().insert(id, M::DIRECTION);
        Ok(id)
    }

    /// Look up the wire direction of an already-resolved id. Returns `None`
    /// for an id this process has never resolved a type for; callers treat
    /// that as an anomaly (section 4.6, inbound step 2), since every inbound
    /// reply or notification's type must have been resolved by a prior
    /// `send_request` or `subscribe` call.
    pub fn direction_of(&self, id: MessageId) -> Option<Direction> {
        self.directions.read().get(&id).copied()
    }

    /// Validate a whole catalog's worth of `(name, crc)` pairs against the
    /// peer in one pass, per section 4.1's `check_message_compatibility`.
    /// Returns the names the peer doesn't recognize.
    pub fn check_compatibility<F>(&self, pairs: &[(&'static str, u32)], mut resolve: F) -> Vec<&'static str>
    where
        F: FnMut(&str, u32) -> Option<u16>,
    {
        let mut unknown = Vec::new();
        for &(name, crc) in pairs {
            if let Some(cached) = self.by_name.read().get(&(name, crc)) {
                if cached.is_none() {
                    unknown.push(name);
                }
                continue;
            }
            match resolve(name, crc) {
                Some(raw) => {
                    let id = MessageId(raw);
                    self.by_name.write().insert((name, crc), Some(id));
                }
                None => {
                    self.by_name.write().insert((name, crc), None);
                    unknown.push(name);
                }
            }
        }
        unknown
    }
}
