//! Wire protocol framing, message reassembly, transmit buffering and
//! handshake encoding for the RPC channel.
//!
//! ## Features
//!
//! - **Compact Frames**: 3-byte header, messages chunked to a negotiated segment size
//! - **Zero-Copy Reassembly**: message bodies are slices of the receive buffers
//! - **Segment Packing**: small messages share one transport write
//! - **Prebuilt Messages**: frame once, enqueue on many channels
//!
//! ## Wire Format
//!
//! ```text
//! +---------------------+---------------------------------+
//! | u8 flags            | low nibble: USER | SYSTEM |      |
//! |                     | CONTINUATION | END_OF_MESSAGE   |
//! |                     | high nibble: reserved (0)       |
//! +---------------------+---------------------------------+
//! | u16 length (BE)     | frame length including header   |
//! +---------------------+---------------------------------+
//! | body                | length - 3 bytes                |
//! +---------------------+---------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod header;
pub mod message;
pub mod parser;
pub mod tx_buffer;

// Re-export main types
pub use codec::{CborCodec, Codec, CodecError, CodecKind, JsonCodec};
pub use error::WireError;
pub use frame::{encode_message, frame_count};
pub use handshake::{
    is_version_compatible, Credentials, HandshakeOptions, HandshakeReader, HandshakeRequest,
    HandshakeResponse, HandshakeResult, RawHandshake, HANDSHAKE_TOKEN, PROTOCOL_VERSION,
};
pub use header::{Flags, FrameHeader, MessageClass, FRAME_HEADER_SIZE, MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
pub use message::{Envelope, EnvelopeError, Fault, FaultCode, StreamMode};
pub use parser::{MessageParser, ParseStatus, ParsedMessage, DEFAULT_MAX_MESSAGE_SIZE};
pub use tx_buffer::{PrebuiltMessage, TxBuffer, TxLock, TxState};
