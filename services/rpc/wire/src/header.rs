//! Frame header processing for the wire protocol.
//!
//! Every frame starts with a 3-byte header:
//!
//! ```text
//! +---------------------+----------------------+
//! | reserved:4 | flags:4| u16 length (BE)      |
//! +---------------------+----------------------+
//! ```
//!
//! `length` covers the whole frame, header included.

use bitflags::bitflags;
use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 3;

/// Largest segment a 16-bit length field can describe
pub const MAX_SEGMENT_SIZE: usize = u16::MAX as usize;

/// Smallest segment size accepted by configuration
pub const MIN_SEGMENT_SIZE: usize = 16;

const RESERVED_MASK: u8 = 0xF0;

bitflags! {
    /// Frame flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Flags: u8 {
        /// First frame of an application message
        const USER_MESSAGE = 1 << 0;
        /// First frame of a protocol-internal message
        const SYSTEM_MESSAGE = 1 << 1;
        /// Frame continues the message in progress
        const CONTINUATION = 1 << 2;
        /// Last frame of the message
        const END_OF_MESSAGE = 1 << 3;
    }
}

/// Message class carried by the first frame of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageClass {
    /// Application traffic
    User,
    /// Protocol control traffic
    System,
}

impl MessageClass {
    /// Flag bit announcing this class
    pub fn flag(self) -> Flags {
        match self {
            MessageClass::User => Flags::USER_MESSAGE,
            MessageClass::System => Flags::SYSTEM_MESSAGE,
        }
    }

    /// Extract the class from a first-frame flag set
    pub fn from_flags(flags: Flags) -> Result<Self, WireError> {
        let user = flags.contains(Flags::USER_MESSAGE);
        let system = flags.contains(Flags::SYSTEM_MESSAGE);
        match (user, system) {
            (true, false) => Ok(MessageClass::User),
            (false, true) => Ok(MessageClass::System),
            _ => Err(WireError::Class(flags.bits())),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame flags
    pub flags: Flags,
    /// Total frame length including the header
    pub length: u16,
}

impl FrameHeader {
    /// Create a header for a body of `body_len` bytes
    pub fn new(flags: Flags, body_len: usize) -> Self {
        Self {
            flags,
            length: (FRAME_HEADER_SIZE + body_len) as u16,
        }
    }

    /// Body length described by this header
    pub fn body_len(&self) -> usize {
        self.length as usize - FRAME_HEADER_SIZE
    }

    /// Whether this frame continues a message in progress
    pub fn is_continuation(&self) -> bool {
        self.flags.contains(Flags::CONTINUATION)
    }

    /// Whether this frame ends its message
    pub fn is_end_of_message(&self) -> bool {
        self.flags.contains(Flags::END_OF_MESSAGE)
    }

    /// Encode the header (big-endian length)
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.length);
    }

    /// Decode and validate a header against the receive segment limit
    pub fn decode(raw: [u8; FRAME_HEADER_SIZE], max_segment_size: usize) -> Result<Self, WireError> {
        if raw[0] & RESERVED_MASK != 0 {
            return Err(WireError::Reserved);
        }
        let flags = Flags::from_bits_truncate(raw[0]);
        let length = u16::from_be_bytes([raw[1], raw[2]]);

        if (length as usize) < FRAME_HEADER_SIZE || length as usize > max_segment_size {
            return Err(WireError::FrameLength(length as usize));
        }

        if !flags.contains(Flags::CONTINUATION) {
            MessageClass::from_flags(flags)?;
        } else if flags.intersects(Flags::USER_MESSAGE | Flags::SYSTEM_MESSAGE) {
            return Err(WireError::Class(flags.bits()));
        }

        Ok(Self { flags, length })
    }
}
