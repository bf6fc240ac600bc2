//! Handshake wire format.
//!
//! ```text
//! +-----------+-------------+--------------+----------------------+
//! | token (4) | version u16 | body_len u16 | body (body_len)      |
//! +-----------+-------------+--------------+----------------------+
//!
//! request body:  options u16 | domain str | service str
//!                [user str | password str]   if HAS_CREDENTIALS
//!                [max_segment u16]           if HAS_SEGMENT_SIZE
//! response body: options u16 | result u16
//!                [max_segment u16]           if HAS_SEGMENT_SIZE
//!                [reason str]                if HAS_REASON
//! ```
//!
//! Strings are u16 length-prefixed UTF-8. Every optional field is announced
//! by an option bit. Readers skip whatever trails the fields they know, so
//! newer peers may append fields freely.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::WireError;

/// Fixed handshake token
pub const HANDSHAKE_TOKEN: [u8; 4] = *b"WRPC";

/// Protocol version: major in the high byte, minor in the low byte
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Token + version + body length
pub const HANDSHAKE_PREFIX_SIZE: usize = 8;

/// Whether a peer version can talk to ours
pub fn is_version_compatible(version: u16) -> bool {
    version >> 8 == PROTOCOL_VERSION >> 8
}

bitflags! {
    /// Session options exchanged during the handshake
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandshakeOptions: u16 {
        /// Request carries user name and password
        const HAS_CREDENTIALS = 1 << 0;
        /// Sender emits keepalive pings
        const KEEPALIVE = 1 << 1;
        /// Body carries a max segment size
        const HAS_SEGMENT_SIZE = 1 << 2;
        /// Response carries a rejection reason
        const HAS_REASON = 1 << 3;
    }
}

/// User credentials presented to the authenticator
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub user: String,
    /// Password
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Client hello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Sender protocol version
    pub version: u16,
    /// Session options
    pub options: HandshakeOptions,
    /// Target domain
    pub domain: String,
    /// Target service name
    pub service_name: String,
    /// Optional login
    pub credentials: Option<Credentials>,
    /// Largest segment the sender accepts
    pub max_segment_size: Option<u16>,
}

/// Handshake outcome code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    /// Session accepted
    Ok,
    /// Incompatible protocol version
    VersionMismatch,
    /// Domain or service not served here
    UnknownService,
    /// Authenticator rejected the credentials
    LoginFailed,
    /// Server failed while validating
    ServerError,
    /// Code unknown to this version
    Other(u16),
}

impl HandshakeResult {
    /// Wire code
    pub fn code(self) -> u16 {
        match self {
            HandshakeResult::Ok => 0,
            HandshakeResult::VersionMismatch => 1,
            HandshakeResult::UnknownService => 2,
            HandshakeResult::LoginFailed => 3,
            HandshakeResult::ServerError => 4,
            HandshakeResult::Other(code) => code,
        }
    }

    /// Decode a wire code
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => HandshakeResult::Ok,
            1 => HandshakeResult::VersionMismatch,
            2 => HandshakeResult::UnknownService,
            3 => HandshakeResult::LoginFailed,
            4 => HandshakeResult::ServerError,
            other => HandshakeResult::Other(other),
        }
    }
}

/// Server answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Sender protocol version
    pub version: u16,
    /// Negotiated options
    pub options: HandshakeOptions,
    /// Outcome
    pub result: HandshakeResult,
    /// Largest segment the server accepts
    pub max_segment_size: Option<u16>,
    /// Rejection reason
    pub reason: Option<String>,
}

fn put_str(buf: &mut BytesMut, value: &str, field: &'static str) -> Result<(), WireError> {
    let len = u16::try_from(value.len()).map_err(|_| WireError::FieldTooLong(field))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_u16(buf: &mut Bytes, field: &'static str) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Malformed(field));
    }
    Ok(buf.get_u16())
}

fn get_str(buf: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    let len = get_u16(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Malformed(field));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8(field))
}

fn wrap(version: u16, body: BytesMut) -> Result<Bytes, WireError> {
    let body_len = u16::try_from(body.len()).map_err(|_| WireError::FieldTooLong("body"))?;
    let mut buf = BytesMut::with_capacity(HANDSHAKE_PREFIX_SIZE + body.len());
    buf.put_slice(&HANDSHAKE_TOKEN);
    buf.put_u16(version);
    buf.put_u16(body_len);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

impl HandshakeRequest {
    /// Create a request for `service_name` in `domain`
    pub fn new(domain: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            options: HandshakeOptions::empty(),
            domain: domain.into(),
            service_name: service_name.into(),
            credentials: None,
            max_segment_size: None,
        }
    }

    /// Encode the complete request
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut options = self.options;
        options.set(HandshakeOptions::HAS_CREDENTIALS, self.credentials.is_some());
        options.set(HandshakeOptions::HAS_SEGMENT_SIZE, self.max_segment_size.is_some());

        let mut body = BytesMut::new();
        body.put_u16(options.bits());
        put_str(&mut body, &self.domain, "domain")?;
        put_str(&mut body, &self.service_name, "service_name")?;
        if let Some(credentials) = &self.credentials {
            put_str(&mut body, &credentials.user, "user")?;
            put_str(&mut body, &credentials.password, "password")?;
        }
        if let Some(max_segment_size) = self.max_segment_size {
            body.put_u16(max_segment_size);
        }
        wrap(self.version, body)
    }

    /// Decode a request body received with `version`
    pub fn decode_body(version: u16, mut body: Bytes) -> Result<Self, WireError> {
        let options = HandshakeOptions::from_bits_truncate(get_u16(&mut body, "options")?);
        let domain = get_str(&mut body, "domain")?;
        let service_name = get_str(&mut body, "service_name")?;
        let credentials = if options.contains(HandshakeOptions::HAS_CREDENTIALS) {
            Some(Credentials {
                user: get_str(&mut body, "user")?,
                password: get_str(&mut body, "password")?,
            })
        } else {
            None
        };
        let max_segment_size = if options.contains(HandshakeOptions::HAS_SEGMENT_SIZE) {
            Some(get_u16(&mut body, "max_segment_size")?)
        } else {
            None
        };

        Ok(Self {
            version,
            options,
            domain,
            service_name,
            credentials,
            max_segment_size,
        })
    }
}

impl HandshakeResponse {
    /// Create a response with the given outcome
    pub fn new(result: HandshakeResult) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            options: HandshakeOptions::empty(),
            result,
            max_segment_size: None,
            reason: None,
        }
    }

    /// Encode the complete response
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut options = self.options;
        options.set(HandshakeOptions::HAS_SEGMENT_SIZE, self.max_segment_size.is_some());
        options.set(HandshakeOptions::HAS_REASON, self.reason.is_some());

        let mut body = BytesMut::new();
        body.put_u16(options.bits());
        body.put_u16(self.result.code());
        if let Some(max_segment_size) = self.max_segment_size {
            body.put_u16(max_segment_size);
        }
        if let Some(reason) = &self.reason {
            put_str(&mut body, reason, "reason")?;
        }
        wrap(self.version, body)
    }

    /// Decode a response body received with `version`
    pub fn decode_body(version: u16, mut body: Bytes) -> Result<Self, WireError> {
        let options = HandshakeOptions::from_bits_truncate(get_u16(&mut body, "options")?);
        let result = HandshakeResult::from_code(get_u16(&mut body, "result")?);
        let max_segment_size = if options.contains(HandshakeOptions::HAS_SEGMENT_SIZE) {
            Some(get_u16(&mut body, "max_segment_size")?)
        } else {
            None
        };
        let reason = if options.contains(HandshakeOptions::HAS_REASON) {
            Some(get_str(&mut body, "reason")?)
        } else {
            None
        };

        Ok(Self {
            version,
            options,
            result,
            max_segment_size,
            reason,
        })
    }
}

/// Token/version/length prefix plus raw body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHandshake {
    /// Peer protocol version
    pub version: u16,
    /// Undecoded body
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Token { matched: usize },
    Version,
    BodyLen { version: u16 },
    Body { version: u16, len: usize },
    Done,
}

/// Incremental handshake reader.
///
/// Bytes are fed as they arrive; every field is consumed exactly once and
/// kept across calls, so a short read just means "feed more". The token is
/// checked byte by byte and fails as soon as one byte differs.
#[derive(Debug)]
pub struct HandshakeReader {
    stage: Stage,
    buf: BytesMut,
}

impl HandshakeReader {
    /// Create a reader waiting for the token
    pub fn new() -> Self {
        Self {
            stage: Stage::Token { matched: 0 },
            buf: BytesMut::new(),
        }
    }

    /// Append received bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received past the end of the handshake
    pub fn take_remainder(&mut self) -> BytesMut {
        self.buf.split()
    }

    /// Try to complete the handshake with the bytes fed so far
    pub fn poll(&mut self) -> Result<Option<RawHandshake>, WireError> {
        loop {
            match self.stage {
                Stage::Token { mut matched } => {
                    while matched < HANDSHAKE_TOKEN.len() && !self.buf.is_empty() {
                        if self.buf[0] != HANDSHAKE_TOKEN[matched] {
                            return Err(WireError::InvalidToken);
                        }
                        self.buf.advance(1);
                        matched += 1;
                    }
                    if matched < HANDSHAKE_TOKEN.len() {
                        self.stage = Stage::Token { matched };
                        return Ok(None);
                    }
                    self.stage = Stage::Version;
                }
                Stage::Version => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    let version = self.buf.get_u16();
                    self.stage = Stage::BodyLen { version };
                }
                Stage::BodyLen { version } => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    let len = self.buf.get_u16() as usize;
                    self.stage = Stage::Body { version, len };
                }
                Stage::Body { version, len } => {
                    if self.buf.len() < len {
                        return Ok(None);
                    }
                    let body = self.buf.split_to(len).freeze();
                    self.stage = Stage::Done;
                    return Ok(Some(RawHandshake { version, body }));
                }
                Stage::Done => return Err(WireError::Malformed("handshake already read")),
            }
        }
    }
}

impl Default for HandshakeReader {
    fn default() -> Self {
        Self::new()
    }
}
