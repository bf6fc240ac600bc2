//! Channel configuration.

use rpc_wire::{CodecKind, Credentials, DEFAULT_MAX_MESSAGE_SIZE, MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::result::{RpcError, RpcResult, RpcResultCode};

/// User name and password sent in the handshake
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// User name
    pub user: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl From<&CredentialsConfig> for Credentials {
    fn from(value: &CredentialsConfig) -> Self {
        Credentials {
            user: value.user.clone(),
            password: value.password.clone(),
        }
    }
}

/// Settings shared by client and server channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest segment this side receives; also the upper bound for sending
    pub max_segment_size: usize,
    /// Largest reassembled message accepted or sent
    pub max_message_size: usize,
    /// Transport connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Handshake timeout (milliseconds)
    pub handshake_timeout_ms: u64,
    /// Keepalive ping interval (milliseconds), disabled when absent
    pub ping_interval_ms: Option<u64>,
    /// Fault the channel after this much inbound silence (milliseconds)
    pub idle_timeout_ms: Option<u64>,
    /// Items a stream reader accepts unacknowledged
    pub stream_window: u32,
    /// Domain presented in the handshake
    pub domain: String,
    /// Service name presented in, or expected by, the handshake
    pub service_name: String,
    /// Client credentials
    pub credentials: Option<CredentialsConfig>,
    /// Payload codec for typed helpers
    pub codec: CodecKind,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 16 * 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            ping_interval_ms: None,
            idle_timeout_ms: None,
            stream_window: 16,
            domain: "default".to_string(),
            service_name: "rpc".to_string(),
            credentials: None,
            codec: CodecKind::default(),
        }
    }
}

impl ChannelConfig {
    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Keepalive ping interval
    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_ms.map(Duration::from_millis)
    }

    /// Idle timeout
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// Reject setups that cannot work
    pub fn validate(&self) -> RpcResult<()> {
        let fail = |message: String| Err(RpcError::new(RpcResultCode::ConfigurationError, message));

        if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&self.max_segment_size) {
            return fail(format!(
                "max_segment_size {} outside {}..={}",
                self.max_segment_size, MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE
            ));
        }
        if self.max_message_size == 0 {
            return fail("max_message_size must be positive".to_string());
        }
        if self.connect_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return fail("timeouts must be positive".to_string());
        }
        if self.ping_interval_ms == Some(0) || self.idle_timeout_ms == Some(0) {
            return fail("keepalive intervals must be positive".to_string());
        }
        if let (Some(ping), Some(idle)) = (self.ping_interval_ms, self.idle_timeout_ms) {
            if idle <= ping {
                return fail(format!("idle_timeout_ms {} must exceed ping_interval_ms {}", idle, ping));
            }
        }
        if self.stream_window == 0 {
            return fail("stream_window must be positive".to_string());
        }
        if self.domain.len() > u16::MAX as usize || self.service_name.len() > u16::MAX as usize {
            return fail("domain and service_name must fit in 65535 bytes".to_string());
        }
        Ok(())
    }
}
