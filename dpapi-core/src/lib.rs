//! Request/reply multiplexing and notification fan-out over a single
//! transport adapter.
//!
//! A [`Connection`] owns one [`dpapi_transport::TransportAdapter`] for the
//! life of the process. Callers open one [`Channel`] per logical user; each
//! channel can send a request and await its reply, send a request and
//! collect a multipart stream, or subscribe to a notification type. The
//! [`Message`] trait is the only thing a generated message catalog needs to
//! implement to work with any of this.

mod channel;
mod codec;
mod connection;
mod control;
mod dispatcher;
mod error;
mod message;
mod registry;
mod subscription;

pub use channel::{Channel, ChannelConfig, MultipartReply, MultipartStream, NotificationStream};
pub use connection::Connection;
pub use control::{ControlPing, ControlPingReply};
pub use error::{CodecError, ConnectError, CoreError, RegistryError};
pub use message::{ContextId, Direction, Message, MessageId};
pub use subscription::SubscriptionId;

pub mod wire {
    //! Field-level wire helpers for hand-written or generated [`super::Message`]
    //! implementations.
    pub use crate::message::{get_fixed_bytes, get_var_bytes, put_fixed_bytes, put_var_bytes, require, trim_trailing_nul};
}
