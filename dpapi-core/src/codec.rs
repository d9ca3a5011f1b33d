//! Frame-level encode/decode (component C2): turns a resolved id, a
//! correlation id, and a [`Message`] value into the wire frame described in
//! section 4.2, and back again. Never touches the transport or the
//! registry directly; callers resolve the id first.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::message::{ContextId, Direction, Message, MessageId, require};

/// Read the 2-byte message id off the front of a raw inbound frame, without
/// consuming it. The dispatcher uses this to decide where a frame should go
/// before it knows which concrete type to decode into.
pub fn peek_message_id(buf: &Bytes) -> Result<MessageId, CodecError> {
    require(buf, 2)?;
    Ok(MessageId(u16::from_be_bytes([buf[0], buf[1]])))
}

/// Encode a full outbound frame: id, then (for a `Request`-direction type
/// only) the client index, then the context id, then the value's fields.
///
/// `msg` is `None` only for the bodiless control-ping sent to terminate a
/// multipart stream; any other absence is a caller bug and is reported as
/// [`CodecError::NilMessage`].
pub fn encode<M: Message>(
    msg: Option<&M>,
    id: MessageId,
    client_index: u32,
    context: ContextId,
) -> Result<Vec<u8>, CodecError> {
    let msg = msg.ok_or(CodecError::NilMessage)?;

    let mut buf = BytesMut::new();
    buf.put_u16(id.0);
    if M::DIRECTION == Direction::Request {
        buf.put_u32(client_index);
    }
    buf.put_u32(context.0);
    msg.encode_fields(&mut buf)?;
    Ok(buf.to_vec())
}

/// Read just enough of an inbound frame's header to learn its context id,
/// without consuming the buffer. Used by the dispatcher to route a frame to
/// a pending conversation before the frame's concrete type is known.
pub fn peek_context(buf: &Bytes, direction: Direction) -> Result<ContextId, CodecError> {
    let mut header = buf.clone();
    require(&header, 2)?;
    header.advance(2);
    if direction == Direction::Request {
        require(&header, 4)?;
        header.advance(4);
    }
    require(&header, 4)?;
    Ok(ContextId(header.get_u32()))
}

/// Decode an inbound frame whose id has already been peeked and resolved to
/// `direction` by the registry. Returns the embedded context id alongside
/// the decoded value.
pub fn decode<M: Message>(mut buf: Bytes, direction: Direction) -> Result<(ContextId, M), CodecError> {
    require(&buf, 2)?;
    buf.advance(2); // id: already known to the caller, who chose this M

    if direction == Direction::Request {
        require(&buf, 4)?;
        buf.advance(4); // client_index: not meaningful to a reply/notification consumer
    }

    require(&buf, 4)?;
    let context = ContextId(buf.get_u32());
    let value = M::decode_fields(&mut buf)?;
    Ok((context, value))
}
