//! Protocol message envelopes.
//!
//! Every logical message body starts with a one-byte tag and the call id it
//! belongs to, followed by tag-specific fields:
//!
//! ```text
//! +---------+---------------+--------------------------+
//! | tag u8  | call_id u64   | fields                   |
//! +---------+---------------+--------------------------+
//! ```
//!
//! Payload fields are the tail of the body and are sliced out without
//! copying.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::header::MessageClass;
use crate::WireError;

mod tag {
    pub const REQUEST: u8 = 0x01;
    pub const MESSAGE: u8 = 0x02;
    pub const RESPONSE: u8 = 0x03;
    pub const FAULT: u8 = 0x04;
    pub const STREAM_OPEN: u8 = 0x05;
    pub const STREAM_PAGE: u8 = 0x06;
    pub const STREAM_ACK: u8 = 0x10;
    pub const STREAM_CLOSE: u8 = 0x11;
    pub const STREAM_CLOSE_ACK: u8 = 0x12;
    pub const STREAM_CANCEL: u8 = 0x13;
    pub const CANCEL_REQUEST: u8 = 0x14;
    pub const PING: u8 = 0x20;
    pub const PONG: u8 = 0x21;
}

/// Directions carrying items on a streaming call
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Caller writes, callee reads
    ClientStreaming = 1,
    /// Callee writes, caller reads
    ServerStreaming = 2,
    /// Both sides write
    Duplex = 3,
}

impl StreamMode {
    /// Whether the calling side writes items
    pub fn client_writes(self) -> bool {
        matches!(self, StreamMode::ClientStreaming | StreamMode::Duplex)
    }

    /// Whether the called side writes items
    pub fn server_writes(self) -> bool {
        matches!(self, StreamMode::ServerStreaming | StreamMode::Duplex)
    }
}

impl TryFrom<u8> for StreamMode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StreamMode::ClientStreaming),
            2 => Ok(StreamMode::ServerStreaming),
            3 => Ok(StreamMode::Duplex),
            _ => Err(WireError::Malformed("stream mode")),
        }
    }
}

/// Fault classification carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// Business error raised by the service
    Application,
    /// Call was cancelled
    Cancelled,
    /// No handler for the method
    UnknownMethod,
    /// Operation not supported by the service
    Unsupported,
    /// Payload could not be decoded
    Deserialization,
    /// Peer broke the call protocol
    ProtocolViolation,
    /// Service failed unexpectedly
    Internal,
    /// Code unknown to this version
    Other(u8),
}

impl FaultCode {
    /// Wire code
    pub fn code(self) -> u8 {
        match self {
            FaultCode::Application => 1,
            FaultCode::Cancelled => 2,
            FaultCode::UnknownMethod => 3,
            FaultCode::Unsupported => 4,
            FaultCode::Deserialization => 5,
            FaultCode::ProtocolViolation => 6,
            FaultCode::Internal => 7,
            FaultCode::Other(code) => code,
        }
    }

    /// Decode a wire code
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => FaultCode::Application,
            2 => FaultCode::Cancelled,
            3 => FaultCode::UnknownMethod,
            4 => FaultCode::Unsupported,
            5 => FaultCode::Deserialization,
            6 => FaultCode::ProtocolViolation,
            7 => FaultCode::Internal,
            other => FaultCode::Other(other),
        }
    }
}

/// Call-scoped failure reported by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Classification
    pub code: FaultCode,
    /// Human readable text
    pub message: String,
    /// Optional serialized fault details
    pub payload: Option<Bytes>,
}

impl Fault {
    /// Create a fault without payload
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            payload: None,
        }
    }

    /// Application fault carrying serialized details
    pub fn application(message: impl Into<String>, payload: Option<Bytes>) -> Self {
        Self {
            code: FaultCode::Application,
            message: message.into(),
            payload,
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Closed set of protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Call expecting a response
    Request {
        /// Call id
        call_id: u64,
        /// Method id
        method: u16,
        /// Serialized argument
        payload: Bytes,
    },
    /// One-way message
    Message {
        /// Method id
        method: u16,
        /// Serialized argument
        payload: Bytes,
    },
    /// Successful result of a call
    Response {
        /// Call id
        call_id: u64,
        /// Serialized result
        payload: Bytes,
    },
    /// Failed result of a call
    Fault {
        /// Call id
        call_id: u64,
        /// Failure details
        fault: Fault,
    },
    /// Stream open request, or its confirmation when sent by the callee
    StreamOpen {
        /// Call id
        call_id: u64,
        /// Method id
        method: u16,
        /// Active directions
        mode: StreamMode,
        /// Items the sender is ready to receive unacknowledged
        window: u32,
        /// Serialized argument
        payload: Bytes,
    },
    /// Batch of stream items
    StreamPage {
        /// Call id
        call_id: u64,
        /// Serialized items
        items: Vec<Bytes>,
    },
    /// Items consumed by the reader
    StreamAck {
        /// Call id
        call_id: u64,
        /// Consumed item count
        count: u32,
    },
    /// Writer finished
    StreamClose {
        /// Call id
        call_id: u64,
    },
    /// Reader saw the close
    StreamCloseAck {
        /// Call id
        call_id: u64,
    },
    /// Stream aborted
    StreamCancel {
        /// Call id
        call_id: u64,
    },
    /// Caller gave up on a call
    CancelRequest {
        /// Call id
        call_id: u64,
    },
    /// Keepalive probe
    Ping {
        /// Correlation value echoed in the pong
        corr_id: u64,
    },
    /// Keepalive answer
    Pong {
        /// Correlation value from the ping
        corr_id: u64,
    },
}

/// Envelope decoding failure, scoped to a call when its id was readable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot decode message for call {call_id:?}: {source}")]
pub struct EnvelopeError {
    /// Call id, when the prefix was intact
    pub call_id: Option<u64>,
    /// Underlying error
    #[source]
    pub source: WireError,
}

/// Longer strings are cut at the last char boundary that fits
fn put_str(buf: &mut BytesMut, value: &str) {
    let mut len = value.len().min(u16::MAX as usize);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    buf.put_u16(len as u16);
    buf.put_slice(&value.as_bytes()[..len]);
}

fn need(buf: &Bytes, n: usize, field: &'static str) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::Malformed(field));
    }
    Ok(())
}

impl Envelope {
    fn tag(&self) -> u8 {
        match self {
            Envelope::Request { .. } => tag::REQUEST,
            Envelope::Message { .. } => tag::MESSAGE,
            Envelope::Response { .. } => tag::RESPONSE,
            Envelope::Fault { .. } => tag::FAULT,
            Envelope::StreamOpen { .. } => tag::STREAM_OPEN,
            Envelope::StreamPage { .. } => tag::STREAM_PAGE,
            Envelope::StreamAck { .. } => tag::STREAM_ACK,
            Envelope::StreamClose { .. } => tag::STREAM_CLOSE,
            Envelope::StreamCloseAck { .. } => tag::STREAM_CLOSE_ACK,
            Envelope::StreamCancel { .. } => tag::STREAM_CANCEL,
            Envelope::CancelRequest { .. } => tag::CANCEL_REQUEST,
            Envelope::Ping { .. } => tag::PING,
            Envelope::Pong { .. } => tag::PONG,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Envelope::Request { .. } => "Request",
            Envelope::Message { .. } => "Message",
            Envelope::Response { .. } => "Response",
            Envelope::Fault { .. } => "Fault",
            Envelope::StreamOpen { .. } => "StreamOpen",
            Envelope::StreamPage { .. } => "StreamPage",
            Envelope::StreamAck { .. } => "StreamAck",
            Envelope::StreamClose { .. } => "StreamClose",
            Envelope::StreamCloseAck { .. } => "StreamCloseAck",
            Envelope::StreamCancel { .. } => "StreamCancel",
            Envelope::CancelRequest { .. } => "CancelRequest",
            Envelope::Ping { .. } => "Ping",
            Envelope::Pong { .. } => "Pong",
        }
    }

    /// Frame class this message travels with
    pub fn class(&self) -> MessageClass {
        class_of(self.tag()).unwrap_or(MessageClass::System)
    }

    /// Call id, or the correlation value for keepalive messages
    pub fn call_id(&self) -> u64 {
        match self {
            Envelope::Message { .. } => 0,
            Envelope::Request { call_id, .. }
            | Envelope::Response { call_id, .. }
            | Envelope::Fault { call_id, .. }
            | Envelope::StreamOpen { call_id, .. }
            | Envelope::StreamPage { call_id, .. }
            | Envelope::StreamAck { call_id, .. }
            | Envelope::StreamClose { call_id }
            | Envelope::StreamCloseAck { call_id }
            | Envelope::StreamCancel { call_id }
            | Envelope::CancelRequest { call_id } => *call_id,
            Envelope::Ping { corr_id } | Envelope::Pong { corr_id } => *corr_id,
        }
    }

    /// Serialize the envelope body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag());
        buf.put_u64(self.call_id());

        match self {
            Envelope::Request { method, payload, .. } | Envelope::Message { method, payload } => {
                buf.put_u16(*method);
                buf.put_slice(payload);
            }
            Envelope::Response { payload, .. } => buf.put_slice(payload),
            Envelope::Fault { fault, .. } => {
                buf.put_u8(fault.code.code());
                put_str(buf, &fault.message);
                match &fault.payload {
                    Some(payload) => {
                        buf.put_u8(1);
                        buf.put_slice(payload);
                    }
                    None => buf.put_u8(0),
                }
            }
            Envelope::StreamOpen {
                method,
                mode,
                window,
                payload,
                ..
            } => {
                buf.put_u16(*method);
                buf.put_u8(*mode as u8);
                buf.put_u32(*window);
                buf.put_slice(payload);
            }
            Envelope::StreamPage { items, .. } => {
                buf.put_u32(items.len() as u32);
                for item in items {
                    buf.put_u32(item.len() as u32);
                    buf.put_slice(item);
                }
            }
            Envelope::StreamAck { count, .. } => buf.put_u32(*count),
            Envelope::StreamClose { .. }
            | Envelope::StreamCloseAck { .. }
            | Envelope::StreamCancel { .. }
            | Envelope::CancelRequest { .. }
            | Envelope::Ping { .. }
            | Envelope::Pong { .. } => {}
        }
    }

    /// Serialize into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a message body that arrived with `class`
    pub fn decode(class: MessageClass, mut body: Bytes) -> Result<Self, EnvelopeError> {
        if body.remaining() < 9 {
            return Err(EnvelopeError {
                call_id: None,
                source: WireError::Malformed("message prefix"),
            });
        }
        let tag = body.get_u8();
        let call_id = body.get_u64();

        Self::decode_fields(tag, call_id, class, body).map_err(|source| EnvelopeError {
            call_id: Some(call_id).filter(|id| *id != 0 && !matches!(tag, tag::PING | tag::PONG)),
            source,
        })
    }

    fn decode_fields(tag: u8, call_id: u64, class: MessageClass, mut body: Bytes) -> Result<Self, WireError> {
        if class_of(tag)? != class {
            return Err(WireError::ClassMismatch(tag));
        }

        let envelope = match tag {
            tag::REQUEST | tag::MESSAGE => {
                need(&body, 2, "method")?;
                let method = body.get_u16();
                if tag == tag::REQUEST {
                    Envelope::Request {
                        call_id,
                        method,
                        payload: body,
                    }
                } else {
                    Envelope::Message {
                        method,
                        payload: body,
                    }
                }
            }
            tag::RESPONSE => Envelope::Response {
                call_id,
                payload: body,
            },
            tag::FAULT => {
                need(&body, 3, "fault")?;
                let code = FaultCode::from_code(body.get_u8());
                let len = body.get_u16() as usize;
                need(&body, len + 1, "fault message")?;
                let raw = body.split_to(len);
                let message = String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8("fault message"))?;
                let payload = match body.get_u8() {
                    0 => None,
                    _ => Some(body),
                };
                Envelope::Fault {
                    call_id,
                    fault: Fault {
                        code,
                        message,
                        payload,
                    },
                }
            }
            tag::STREAM_OPEN => {
                need(&body, 7, "stream open")?;
                let method = body.get_u16();
                let mode = StreamMode::try_from(body.get_u8())?;
                let window = body.get_u32();
                Envelope::StreamOpen {
                    call_id,
                    method,
                    mode,
                    window,
                    payload: body,
                }
            }
            tag::STREAM_PAGE => {
                need(&body, 4, "page count")?;
                let count = body.get_u32() as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    need(&body, 4, "item length")?;
                    let len = body.get_u32() as usize;
                    need(&body, len, "item")?;
                    items.push(body.split_to(len));
                }
                Envelope::StreamPage { call_id, items }
            }
            tag::STREAM_ACK => {
                need(&body, 4, "ack count")?;
                Envelope::StreamAck {
                    call_id,
                    count: body.get_u32(),
                }
            }
            tag::STREAM_CLOSE => Envelope::StreamClose { call_id },
            tag::STREAM_CLOSE_ACK => Envelope::StreamCloseAck { call_id },
            tag::STREAM_CANCEL => Envelope::StreamCancel { call_id },
            tag::CANCEL_REQUEST => Envelope::CancelRequest { call_id },
            tag::PING => Envelope::Ping { corr_id: call_id },
            tag::PONG => Envelope::Pong { corr_id: call_id },
            other => return Err(WireError::Tag(other)),
        };
        Ok(envelope)
    }
}

fn class_of(tag: u8) -> Result<MessageClass, WireError> {
    match tag {
        tag::REQUEST | tag::MESSAGE | tag::RESPONSE | tag::FAULT | tag::STREAM_OPEN | tag::STREAM_PAGE => {
            Ok(MessageClass::User)
        }
        tag::STREAM_ACK
        | tag::STREAM_CLOSE
        | tag::STREAM_CLOSE_ACK
        | tag::STREAM_CANCEL
        | tag::CANCEL_REQUEST
        | tag::PING
        | tag::PONG => Ok(MessageClass::System),
        other => Err(WireError::Tag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: Envelope) -> Envelope {
        let class = envelope.class();
        Envelope::decode(class, envelope.to_bytes()).unwrap()
    }

    #[test]
    fn test_request_and_response() {
        let request = Envelope::Request {
            call_id: 7,
            method: 3,
            payload: Bytes::from_static(b"args"),
        };
        assert_eq!(request.class(), MessageClass::User);
        assert_eq!(roundtrip(request.clone()), request);

        let response = Envelope::Response {
            call_id: 7,
            payload: Bytes::new(),
        };
        assert_eq!(roundtrip(response.clone()), response);
    }

    #[test]
    fn test_fault_with_and_without_payload() {
        let bare = Envelope::Fault {
            call_id: 9,
            fault: Fault::new(FaultCode::UnknownMethod, "no such method"),
        };
        assert_eq!(roundtrip(bare.clone()), bare);

        let detailed = Envelope::Fault {
            call_id: 9,
            fault: Fault::application("insufficient funds", Some(Bytes::from_static(b"\x01\x02"))),
        };
        assert_eq!(roundtrip(detailed.clone()), detailed);
    }

    #[test]
    fn test_long_fault_message_truncated_on_char_boundary() {
        // 'é' is two bytes, so the 65535-byte cut lands inside a char
        let message = "é".repeat(40_000);
        let fault = Envelope::Fault {
            call_id: 5,
            fault: Fault::new(FaultCode::Internal, message.clone()),
        };

        match roundtrip(fault) {
            Envelope::Fault { fault, .. } => {
                assert_eq!(fault.message.len(), u16::MAX as usize - 1);
                assert!(message.starts_with(&fault.message));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stream_messages() {
        let open = Envelope::StreamOpen {
            call_id: 11,
            method: 1,
            mode: StreamMode::Duplex,
            window: 16,
            payload: Bytes::from_static(b"init"),
        };
        assert_eq!(roundtrip(open.clone()), open);

        let page = Envelope::StreamPage {
            call_id: 11,
            items: vec![Bytes::from_static(b"a"), Bytes::new(), Bytes::from_static(b"ccc")],
        };
        assert_eq!(roundtrip(page.clone()), page);

        let ack = Envelope::StreamAck { call_id: 11, count: 2 };
        assert_eq!(ack.class(), MessageClass::System);
        assert_eq!(roundtrip(ack.clone()), ack);
    }

    #[test]
    fn test_class_mismatch_is_scoped_to_call() {
        let ack = Envelope::StreamAck { call_id: 5, count: 1 };
        let err = Envelope::decode(MessageClass::User, ack.to_bytes()).unwrap_err();
        assert_eq!(err.call_id, Some(5));
        assert_eq!(err.source, WireError::ClassMismatch(0x10));
    }

    #[test]
    fn test_truncated_page_is_scoped_to_call() {
        let mut body = BytesMut::new();
        body.put_u8(0x06);
        body.put_u64(42);
        body.put_u32(2);
        body.put_u32(10);
        body.put_slice(b"short");
        let err = Envelope::decode(MessageClass::User, body.freeze()).unwrap_err();
        assert_eq!(err.call_id, Some(42));
    }

    #[test]
    fn test_short_prefix_has_no_call() {
        let err = Envelope::decode(MessageClass::User, Bytes::from_static(&[0x03, 0x00])).unwrap_err();
        assert_eq!(err.call_id, None);
    }

    #[test]
    fn test_unknown_tag() {
        let mut body = BytesMut::new();
        body.put_u8(0x7F);
        body.put_u64(1);
        let err = Envelope::decode(MessageClass::User, body.freeze()).unwrap_err();
        assert_eq!(err.source, WireError::Tag(0x7F));
    }
}
