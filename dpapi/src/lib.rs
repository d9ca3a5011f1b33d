//! Re-exports the pieces most callers need: connect, open a channel, send
//! requests, subscribe to notifications. See [`dpapi_core`] for the full
//! API surface, including the wire-helper functions a generated message
//! catalog needs.

pub use dpapi_core::{
    Channel, ChannelConfig, CodecError, ConnectError, Connection, ContextId, ControlPing, ControlPingReply, CoreError,
    Direction, Message, MessageId, MultipartReply, MultipartStream, NotificationStream, RegistryError, SubscriptionId,
    wire,
};

pub use dpapi_transport::{DeliveryCallback, MockTransport, TransportAdapter, TransportError};

/// Convenient glob import for application code:
///
/// ```ignore
/// use dpapi::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{Channel, Connection, CoreError, Message, TransportAdapter};
}
