//! Wire codec for the fixed 10-byte packet header.
//!
//! A frame on the wire is `[len:u32 LE][nonce:u32 LE][op:u8][tag:u8]`
//! followed by exactly `len` body bytes. The codec is stateless: it reads
//! and writes `bytes` cursors and never touches the transport.

use bytes::{Buf, BufMut};

use crate::constants::{HEADER_LEN, MAX_FRAME_LEN};
use crate::error::WireError;

/// Frame kind carried in the `op` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// One-way frame; no response expected.
    Command = 0,
    /// Request frame; the peer echoes the nonce in a response.
    Request = 1,
    /// Response frame, routed back through the RPC table.
    Response = 2,
}

impl TryFrom<u8> for Op {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Op::Command),
            1 => Ok(Op::Request),
            2 => Ok(Op::Response),
            _ => Err(WireError::InvalidOpcode { value }),
        }
    }
}

/// Application-level message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// Liveness probe.
    Ping = 0,
    /// Peer introduction.
    Hello = 1,
    /// Routing-table lookup.
    FindNode = 2,
    /// Transaction broadcast.
    PushTransaction = 3,
    /// Transaction fetch.
    PullTransaction = 4,
    /// Block fetch.
    PullBlock = 5,
}

impl TryFrom<u8> for Tag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Tag::Ping),
            1 => Ok(Tag::Hello),
            2 => Ok(Tag::FindNode),
            3 => Ok(Tag::PushTransaction),
            4 => Ok(Tag::PullTransaction),
            5 => Ok(Tag::PullBlock),
            _ => Err(WireError::InvalidTag { value }),
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Body length in bytes, excluding the header itself.
    pub len: u32,
    /// Request/response correlator.
    pub nonce: u32,
    /// Frame kind.
    pub op: Op,
    /// Message tag.
    pub tag: Tag,
}

impl Header {
    /// Serialize the header into `out`. Writes exactly [`HEADER_LEN`] bytes.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u32_le(self.len);
        out.put_u32_le(self.nonce);
        out.put_u8(self.op as u8);
        out.put_u8(self.tag as u8);
    }

    /// Decode a header from `src`, which must hold at least [`HEADER_LEN`]
    /// bytes. Consumes at most the header bytes and nothing of the body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, WireError> {
        debug_assert!(src.remaining() >= HEADER_LEN);
        let len = src.get_u32_le();
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge { len });
        }
        let nonce = src.get_u32_le();
        let op = Op::try_from(src.get_u8())?;
        let tag = Tag::try_from(src.get_u8())?;
        Ok(Header { len, nonce, op, tag })
    }
}
