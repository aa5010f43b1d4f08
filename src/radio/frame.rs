//! Radio frames and RadioHead framing

use std::fmt;
use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};

/// RadioHead node address
pub type NodeId = u8;

/// TO, FROM, ID and FLAGS bytes prepended by RadioHead drivers
pub const RADIOHEAD_HEADER_LEN: usize = 4;

/// A frame rejected before reaching the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Payload longer than the transport's maximum frame size
    Oversized { len: usize, max: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Oversized { len, max } => {
                write!(f, "payload of {} bytes exceeds frame limit of {}", len, max)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// One outbound radio packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioFrame {
    destination: NodeId,
    payload: Bytes,
}

impl RadioFrame {
    /// Build a frame for `destination`, refusing payloads above `max_len`.
    ///
    /// Pure function of its inputs; the payload bytes are shared, not copied.
    pub fn from_payload(
        destination: NodeId,
        payload: Bytes,
        max_len: usize,
    ) -> Result<Self, FrameError> {
        if payload.len() > max_len {
            return Err(FrameError::Oversized {
                len: payload.len(),
                max: max_len,
            });
        }
        Ok(Self {
            destination,
            payload,
        })
    }

    pub fn destination(&self) -> NodeId {
        self.destination
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode as a RadioHead packet: `[to, from, id, flags, payload...]`
    pub fn to_radiohead(&self, from: NodeId, id: u8, flags: u8) -> Bytes {
        let mut buf = BytesMut::with_capacity(RADIOHEAD_HEADER_LEN + self.payload.len());
        buf.put_u8(self.destination);
        buf.put_u8(from);
        buf.put_u8(id);
        buf.put_u8(flags);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Space-separated upper-case hex, as printed by the RadioHead examples
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", b);
    }
    out
}
