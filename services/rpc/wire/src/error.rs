//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete input (need more data)
    #[error("incomplete input")]
    Incomplete,

    /// Frame length field below the header size or above the segment limit
    #[error("invalid frame length: {0}")]
    FrameLength(usize),

    /// Reassembled message exceeds the configured limit
    #[error("message size limit exceeded: {0}")]
    Size(usize),

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// First frame of a message without exactly one class bit
    #[error("invalid message class flags {0:#04x}")]
    Class(u8),

    /// Continuation frame with no message in progress
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// New message started while another one was still in progress
    #[error("message started before the previous one ended")]
    MissingContinuation,

    /// Handshake token mismatch
    #[error("invalid handshake token")]
    InvalidToken,

    /// Unsupported protocol version
    #[error("version unsupported: {0:#06x}")]
    Version(u16),

    /// Unknown message tag
    #[error("unknown message tag {0:#04x}")]
    Tag(u8),

    /// Message tag sent with the wrong class flag
    #[error("message tag {0:#04x} sent with the wrong class")]
    ClassMismatch(u8),

    /// String field is not valid UTF-8
    #[error("invalid utf-8 in field {0}")]
    Utf8(&'static str),

    /// String field too long for its u16 length prefix
    #[error("field {0} too long")]
    FieldTooLong(&'static str),

    /// Segment size outside the supported range
    #[error("segment size {0} out of range")]
    SegmentSize(usize),

    /// Transmit buffer closed
    #[error("transmit buffer closed")]
    Closed,

    /// Wait cancelled by the caller
    #[error("cancelled")]
    Cancelled,

    /// Malformed structure
    #[error("malformed {0}")]
    Malformed(&'static str),
}
