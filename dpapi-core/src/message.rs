//! The capability set every message value in the (out-of-scope, generated)
//! catalog must implement, plus the small id types the core correlates on.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::CodecError;

/// Which of the three wire shapes a message uses. Fixed per type, known at
/// compile time via [`Message::DIRECTION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Caller-initiated; carries a client index ahead of the context id.
    Request,
    /// Peer-initiated in answer to a request; carries only the context id.
    Reply,
    /// Peer-initiated with no matching request (a detail in a multipart
    /// stream, or a notification); carries only the context id.
    Other,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Reply => write!(f, "reply"),
            Direction::Other => write!(f, "other"),
        }
    }
}

/// Peer-assigned numeric identifier for a `(name, crc)` pair, valid for the
/// life of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u16);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-bit correlation token embedded in every request and echoed in every
/// reply. Allocated dispatcher-wide (see DESIGN.md for why this spec's
/// ambiguity was resolved that way).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Common capability set every generated message value type implements:
/// compile-time identity (`NAME`, `CRC`, `DIRECTION`) plus field-level wire
/// serialization. The registry and codec key off this trait; they never see
/// concrete generated types.
pub trait Message: fmt::Debug + Send + Sync + Sized + 'static {
    /// Schema-stable name, used for peer id negotiation.
    const NAME: &'static str;
    /// 32-bit fingerprint of the field layout, used for peer id negotiation.
    const CRC: u32;
    /// Fixed wire shape for this type.
    const DIRECTION: Direction;

    /// Append this value's fields, in declared order, to `buf`.
    fn encode_fields(&self, buf: &mut bytes::BytesMut) -> Result<(), CodecError>;

    /// Read fields, in declared order, from `buf`, consuming exactly as
    /// many bytes as the type's layout requires.
    fn decode_fields(buf: &mut bytes::Bytes) -> Result<Self, CodecError>;
}

/// Write a fixed-length byte array field, zero-padded on the right, per the
/// wire layout rules in section 4.2 of the spec. Fails if `data` overflows
/// `len`.
pub fn put_fixed_bytes(buf: &mut bytes::BytesMut, data: &[u8], len: usize) -> Result<(), CodecError> {
    if data.len() > len {
        return Err(CodecError::EncodingError(format!(
            "fixed-length field overflow: {} bytes into a {len}-byte slot",
            data.len()
        )));
    }
    buf.put_slice(data);
    buf.put_bytes(0, len - data.len());
    Ok(())
}

/// Read a fixed-length byte array field verbatim, padding included. Pairs
/// with [`put_fixed_bytes`] so `decode(encode(v)) == v` for any `v` that
/// fits in `len` bytes, including values whose real content ends in a
/// `0x00` byte.
pub fn get_fixed_bytes(buf: &mut bytes::Bytes, len: usize) -> Result<Vec<u8>, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::LengthMismatch {
            expected: len,
            remaining: buf.remaining(),
        });
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(raw)
}

/// Trim trailing NUL bytes off a fixed-length field's raw bytes. Only
/// correct for fields documented as NUL-free text (e.g. VPP interface
/// names); applying it to a field whose real content can legitimately end
/// in `0x00` loses data, so it is never called implicitly by
/// [`get_fixed_bytes`] itself.
pub fn trim_trailing_nul(mut raw: Vec<u8>) -> Vec<u8> {
    while raw.last() == Some(&0) {
        raw.pop();
    }
    raw
}

/// Write a variable-length byte array field: a 4-byte big-endian length
/// prefix followed by the elements, per section 4.2.
pub fn put_var_bytes(buf: &mut bytes::BytesMut, data: &[u8]) -> Result<(), CodecError> {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    Ok(())
}

/// Read a variable-length byte array field.
pub fn get_var_bytes(buf: &mut bytes::Bytes) -> Result<Vec<u8>, CodecError> {
    require(buf, 4)?;
    let len = buf.get_u32() as usize;
    require(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Fail with [`CodecError::ShortFrame`] unless at least `n` bytes remain.
pub fn require(buf: &bytes::Bytes, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        Err(CodecError::ShortFrame)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn fixed_bytes_round_trip_with_padding() {
        let mut buf = BytesMut::new();
        put_fixed_bytes(&mut buf, b"eth0", 16).unwrap();
        assert_eq!(buf.len(), 16);

        let mut bytes = buf.freeze();
        let out = get_fixed_bytes(&mut bytes, 16).unwrap();
        assert_eq!(out, b"eth0\0\0\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(trim_trailing_nul(out), b"eth0");
    }

    #[test]
    fn fixed_bytes_preserves_content_ending_in_a_real_nul() {
        let data = [0x41, 0x00];
        let mut buf = BytesMut::new();
        put_fixed_bytes(&mut buf, &data, 4).unwrap();

        let mut bytes = buf.freeze();
        let out = get_fixed_bytes(&mut bytes, 4).unwrap();
        assert_eq!(out, vec![0x41, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn fixed_bytes_overflow_is_encoding_error() {
        let mut buf = BytesMut::new();
        let err = put_fixed_bytes(&mut buf, &[0u8; 17], 16).unwrap_err();
        assert!(matches!(err, CodecError::EncodingError(_)));
    }

    #[test]
    fn fixed_bytes_underflow_is_length_mismatch() {
        let mut bytes = bytes::Bytes::from_static(&[1, 2, 3]);
        let err = get_fixed_bytes(&mut bytes, 16).unwrap_err();
        assert!(matches!(err, CodecError::LengthMismatch { .. }));
    }

    #[test]
    fn var_bytes_round_trip() {
        let mut buf = BytesMut::new();
        put_var_bytes(&mut buf, b"hello world").unwrap();

        let mut bytes = buf.freeze();
        let out = get_var_bytes(&mut bytes).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn var_bytes_short_frame() {
        let mut bytes = bytes::Bytes::from_static(&[0, 0, 0, 5, 1, 2]);
        let err = get_var_bytes(&mut bytes).unwrap_err();
        assert_eq!(err, CodecError::ShortFrame);
    }
}
