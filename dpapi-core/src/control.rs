//! The liveness-check request/reply pair. `ControlPingReply` doubles as the
//! multipart termination sentinel (section 6, "Sentinel message"): no other
//! message identity may be used to mark end-of-stream.
//!
//! These two types ship with the core rather than with the (out-of-scope)
//! generated catalog, because the dispatcher's multipart logic is
//! meaningless without a sentinel to resolve at connect time.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::message::{Direction, Message};

/// Liveness check request. Also used, undecorated, as the request that
/// terminates a multipart stream (section 4.6, outbound path step 4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlPing;

impl Message for ControlPing {
    const NAME: &'static str = "control_ping";
    const CRC: u32 = 0x5186_4169;
    const DIRECTION: Direction = Direction::Request;

    fn encode_fields(&self, _buf: &mut BytesMut) -> Result<(), CodecError> {
        Ok(())
    }

    fn decode_fields(_buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(ControlPing)
    }
}

/// Reply to [`ControlPing`]; also the multipart end-of-stream sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlPingReply {
    pub retval: i32,
    pub client_index: u32,
    pub vpe_pid: u32,
}

impl Message for ControlPingReply {
    const NAME: &'static str = "control_ping_reply";
    const CRC: u32 = 0xf198_b37f;
    const DIRECTION: Direction = Direction::Reply;

    fn encode_fields(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_i32(self.retval);
        buf.put_u32(self.client_index);
        buf.put_u32(self.vpe_pid);
        Ok(())
    }

    fn decode_fields(buf: &mut Bytes) -> Result<Self, CodecError> {
        crate::message::require(buf, 12)?;
        Ok(ControlPingReply {
            retval: buf.get_i32(),
            client_index: buf.get_u32(),
            vpe_pid: buf.get_u32(),
        })
    }
}
