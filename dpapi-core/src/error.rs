//! Error kinds per section 7 of the spec. Hand-rolled `Display`/`Error`
//! impls, no `thiserror`, matching the teacher's own style.

use std::fmt;

use dpapi_transport::TransportError;

/// Returned by [`crate::connection::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// A connection is already live in this process.
    AlreadyConnected,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::AlreadyConnected => write!(f, "only one connection per process"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Returned by the registry when it can't map a `(name, crc)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The peer doesn't know this `(name, crc)` pair.
    UnknownMessage { name: &'static str, crc: u32 },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownMessage { name, crc } => {
                write!(f, "unknown message: {name} (crc {crc:#010x})")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Returned by [`crate::codec`] encode/decode operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// `encode` was asked to encode an absent value, or `decode` was asked
    /// to decode into an absent target.
    NilMessage,
    /// The registry can't resolve this message's `(name, crc)`.
    UnknownMessage,
    /// A field couldn't be serialized (e.g. a fixed-length array overflow).
    EncodingError(String),
    /// Bytes were exhausted mid-field while decoding.
    ShortFrame,
    /// A fixed-length field decode found fewer bytes than its declared
    /// length.
    LengthMismatch { expected: usize, remaining: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::NilMessage => write!(f, "nil message"),
            CodecError::UnknownMessage => write!(f, "unknown message"),
            CodecError::EncodingError(msg) => write!(f, "encoding error: {msg}"),
            CodecError::ShortFrame => write!(f, "unexpected EOF while decoding frame"),
            CodecError::LengthMismatch { expected, remaining } => write!(
                f,
                "length mismatch: expected {expected} bytes, {remaining} remaining"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// Top-level error surfaced to callers of the channel API. Composes the
/// narrower kinds above plus the channel-local conditions from section 7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    Connect(ConnectError),
    Registry(RegistryError),
    Codec(CodecError),
    Transport(TransportError),
    /// The channel this operation targeted has been closed.
    ChannelClosed,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Connect(e) => write!(f, "{e}"),
            CoreError::Registry(e) => write!(f, "{e}"),
            CoreError::Codec(e) => write!(f, "{e}"),
            CoreError::Transport(e) => write!(f, "{e}"),
            CoreError::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<ConnectError> for CoreError {
    fn from(e: ConnectError) -> Self {
        CoreError::Connect(e)
    }
}

impl From<RegistryError> for CoreError {
    fn from(e: RegistryError) -> Self {
        CoreError::Registry(e)
    }
}

impl From<CodecError> for CoreError {
    fn from(e: CodecError) -> Self {
        CoreError::Codec(e)
    }
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        CoreError::Transport(e)
    }
}
