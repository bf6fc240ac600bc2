//! Result codes and the error type returned by every channel API.

use rpc_wire::{CodecError, Fault, FaultCode, WireError};
use std::fmt;
use thiserror::Error;

/// Outcome classification for calls, sends and connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcResultCode {
    /// Success
    Ok,
    /// Invalid setup detected before connecting
    ConfigurationError,
    /// Transport connect was refused or failed
    ConnectionFailed,
    /// Connect, handshake or idle timeout
    ConnectionTimeout,
    /// Transport dropped while in use
    ConnectionReset,
    /// Handshake token mismatch
    InvalidToken,
    /// Incompatible protocol version
    VersionMismatch,
    /// Authenticator rejected the credentials
    LoginFailed,
    /// Peer broke the protocol
    ProtocolViolation,
    /// Outgoing payload could not be serialized
    SerializationError,
    /// Incoming payload could not be deserialized
    DeserializationError,
    /// Peer reported a business error
    ApplicationFault,
    /// Call was cancelled by the caller
    Cancelled,
    /// Channel is closing or closed
    ChannelClosed,
    /// Stream was aborted
    StreamAborted,
    /// API used in the wrong channel or stream state
    InvalidState,
    /// No handler for the method
    UnknownMethod,
    /// Operation not supported by the peer
    Unsupported,
}

impl RpcResultCode {
    /// Stable name used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            RpcResultCode::Ok => "ok",
            RpcResultCode::ConfigurationError => "configuration_error",
            RpcResultCode::ConnectionFailed => "connection_failed",
            RpcResultCode::ConnectionTimeout => "connection_timeout",
            RpcResultCode::ConnectionReset => "connection_reset",
            RpcResultCode::InvalidToken => "invalid_token",
            RpcResultCode::VersionMismatch => "version_mismatch",
            RpcResultCode::LoginFailed => "login_failed",
            RpcResultCode::ProtocolViolation => "protocol_violation",
            RpcResultCode::SerializationError => "serialization_error",
            RpcResultCode::DeserializationError => "deserialization_error",
            RpcResultCode::ApplicationFault => "application_fault",
            RpcResultCode::Cancelled => "cancelled",
            RpcResultCode::ChannelClosed => "channel_closed",
            RpcResultCode::StreamAborted => "stream_aborted",
            RpcResultCode::InvalidState => "invalid_state",
            RpcResultCode::UnknownMethod => "unknown_method",
            RpcResultCode::Unsupported => "unsupported",
        }
    }

    /// Whether the code describes a transport-level failure
    pub fn is_connection_error(self) -> bool {
        matches!(
            self,
            RpcResultCode::ConnectionFailed
                | RpcResultCode::ConnectionTimeout
                | RpcResultCode::ConnectionReset
        )
    }

    /// Fault code used when this outcome is reported to a caller
    pub fn fault_code(self) -> FaultCode {
        match self {
            RpcResultCode::Cancelled => FaultCode::Cancelled,
            RpcResultCode::UnknownMethod => FaultCode::UnknownMethod,
            RpcResultCode::Unsupported => FaultCode::Unsupported,
            RpcResultCode::DeserializationError => FaultCode::Deserialization,
            RpcResultCode::ProtocolViolation => FaultCode::ProtocolViolation,
            RpcResultCode::ApplicationFault => FaultCode::Application,
            _ => FaultCode::Internal,
        }
    }
}

impl fmt::Display for RpcResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by channel, call and stream operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct RpcError {
    code: RpcResultCode,
    message: String,
    fault: Option<Fault>,
}

/// Result alias used across the session crate
pub type RpcResult<T> = Result<T, RpcError>;

impl RpcError {
    /// Create an error with a code and message
    pub fn new(code: RpcResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fault: None,
        }
    }

    /// Error carrying a fault reported by the peer
    pub fn from_fault(fault: Fault) -> Self {
        let code = match fault.code {
            FaultCode::Cancelled => RpcResultCode::Cancelled,
            FaultCode::UnknownMethod => RpcResultCode::UnknownMethod,
            FaultCode::Unsupported => RpcResultCode::Unsupported,
            FaultCode::Deserialization => RpcResultCode::DeserializationError,
            FaultCode::ProtocolViolation => RpcResultCode::ProtocolViolation,
            FaultCode::Application | FaultCode::Internal | FaultCode::Other(_) => {
                RpcResultCode::ApplicationFault
            }
        };
        Self {
            code,
            message: fault.message.clone(),
            fault: Some(fault),
        }
    }

    /// Shorthand for [`RpcResultCode::ChannelClosed`]
    pub fn channel_closed() -> Self {
        Self::new(RpcResultCode::ChannelClosed, "channel closed")
    }

    /// Shorthand for [`RpcResultCode::Cancelled`]
    pub fn cancelled() -> Self {
        Self::new(RpcResultCode::Cancelled, "call cancelled")
    }

    /// Shorthand for [`RpcResultCode::InvalidState`]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(RpcResultCode::InvalidState, message)
    }

    /// Shorthand for [`RpcResultCode::ProtocolViolation`]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(RpcResultCode::ProtocolViolation, message)
    }

    /// Result code
    pub fn code(&self) -> RpcResultCode {
        self.code
    }

    /// Message text
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Fault reported by the peer, if any
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    /// Fault describing this error to a remote caller
    pub fn to_fault(&self) -> Fault {
        match &self.fault {
            Some(fault) => fault.clone(),
            None => Fault::new(self.code.fault_code(), self.message.clone()),
        }
    }
}

impl From<Fault> for RpcError {
    fn from(fault: Fault) -> Self {
        Self::from_fault(fault)
    }
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> Self {
        let code = match &err {
            WireError::Closed => RpcResultCode::ChannelClosed,
            WireError::Cancelled => RpcResultCode::Cancelled,
            WireError::InvalidToken => RpcResultCode::InvalidToken,
            WireError::Version(_) => RpcResultCode::VersionMismatch,
            WireError::SegmentSize(_) => RpcResultCode::ConfigurationError,
            _ => RpcResultCode::ProtocolViolation,
        };
        Self::new(code, err.to_string())
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        let code = match err {
            CodecError::Encode(_) => RpcResultCode::SerializationError,
            CodecError::Decode(_) => RpcResultCode::DeserializationError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::TimedOut => RpcResultCode::ConnectionTimeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => RpcResultCode::ConnectionReset,
            _ => RpcResultCode::ConnectionFailed,
        };
        Self::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_fault_mapping_keeps_payload() {
        let fault = Fault::application("overdrawn", Some(Bytes::from_static(b"{}")));
        let err = RpcError::from(fault.clone());
        assert_eq!(err.code(), RpcResultCode::ApplicationFault);
        assert_eq!(err.message(), "overdrawn");
        assert_eq!(err.fault(), Some(&fault));
        assert_eq!(err.to_fault(), fault);
    }

    #[test]
    fn test_local_error_to_fault() {
        let err = RpcError::new(RpcResultCode::UnknownMethod, "method 9");
        let fault = err.to_fault();
        assert_eq!(fault.code, FaultCode::UnknownMethod);
        assert_eq!(RpcError::from(fault).code(), RpcResultCode::UnknownMethod);
    }

    #[test]
    fn test_wire_error_mapping() {
        assert_eq!(RpcError::from(WireError::Closed).code(), RpcResultCode::ChannelClosed);
        assert_eq!(RpcError::from(WireError::InvalidToken).code(), RpcResultCode::InvalidToken);
        assert_eq!(RpcError::from(WireError::Reserved).code(), RpcResultCode::ProtocolViolation);
    }

    #[test]
    fn test_io_error_mapping() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(RpcError::from(reset).code(), RpcResultCode::ConnectionReset);
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(RpcError::from(refused).code().is_connection_error());
    }

    #[test]
    fn test_display() {
        let err = RpcError::channel_closed();
        assert_eq!(err.to_string(), "channel_closed: channel closed");
    }
}
