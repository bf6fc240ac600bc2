//! Handshake protocol for channels.
//!
//! The client sends its request immediately after the transport connects.
//! The server validates the token, version, service name and, when an
//! authenticator is configured, the credentials, then answers with a result
//! code. Only an `Ok` answer lets the channel enter normal dispatch.

use async_trait::async_trait;
use bytes::BytesMut;
use rpc_wire::{
    is_version_compatible, Credentials, HandshakeOptions, HandshakeReader, HandshakeRequest,
    HandshakeResponse, HandshakeResult, RawHandshake, MIN_SEGMENT_SIZE,
};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::config::ChannelConfig;
use crate::result::{RpcError, RpcResult, RpcResultCode};
use crate::session::Session;

/// Validates client credentials
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `None` or an empty string accepts the login; anything else is the
    /// rejection reason
    async fn validate(&self, user: &str, password: &str) -> Option<String>;
}

/// Authenticator backed by a fixed user table
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    /// Create an empty table, rejecting everyone
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user
    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(user.into(), password.into());
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn validate(&self, user: &str, password: &str) -> Option<String> {
        match self.users.get(user) {
            Some(expected) if expected == password => None,
            Some(_) => Some("invalid password".to_string()),
            None => Some(format!("unknown user '{}'", user)),
        }
    }
}

/// Result of a successful handshake
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Negotiated session
    pub session: Session,
    /// Segment size to use for sending
    pub send_segment_size: usize,
    /// Bytes read past the handshake, to be fed to the message parser
    pub remainder: BytesMut,
}

fn negotiate_segment_size(own: usize, peer: Option<u16>) -> usize {
    peer.map(usize::from)
        .filter(|peer| *peer >= MIN_SEGMENT_SIZE)
        .map_or(own, |peer| peer.min(own))
}

async fn read_raw<R>(reader: &mut R, handshake: &mut HandshakeReader) -> RpcResult<RawHandshake>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(512);
    loop {
        if let Some(raw) = handshake.poll()? {
            return Ok(raw);
        }
        buf.clear();
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(RpcError::new(
                RpcResultCode::ConnectionReset,
                "connection closed during handshake",
            ));
        }
        trace!("Read {} handshake bytes", n);
        handshake.feed(&buf);
    }
}

/// Run the client side of the handshake
pub async fn client_handshake<S>(io: &mut S, config: &ChannelConfig) -> RpcResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = HandshakeRequest::new(config.domain.clone(), config.service_name.clone());
    request.credentials = config.credentials.as_ref().map(Credentials::from);
    request.max_segment_size = u16::try_from(config.max_segment_size).ok();
    if config.ping_interval().is_some() {
        request.options |= HandshakeOptions::KEEPALIVE;
    }

    io.write_all(&request.encode()?).await?;
    io.flush().await?;
    debug!("Sent handshake request for {}/{}", config.domain, config.service_name);

    let mut reader = HandshakeReader::new();
    let raw = read_raw(io, &mut reader).await?;
    if !is_version_compatible(raw.version) {
        return Err(RpcError::new(
            RpcResultCode::VersionMismatch,
            format!("server speaks version {:#06x}", raw.version),
        ));
    }
    let response = HandshakeResponse::decode_body(raw.version, raw.body)?;

    let reason = response.reason.clone().unwrap_or_default();
    match response.result {
        HandshakeResult::Ok => {}
        HandshakeResult::LoginFailed => {
            return Err(RpcError::new(RpcResultCode::LoginFailed, reason));
        }
        HandshakeResult::VersionMismatch => {
            return Err(RpcError::new(RpcResultCode::VersionMismatch, reason));
        }
        HandshakeResult::UnknownService => {
            return Err(RpcError::new(RpcResultCode::Unsupported, reason));
        }
        HandshakeResult::ServerError | HandshakeResult::Other(_) => {
            return Err(RpcError::new(
                RpcResultCode::ConnectionFailed,
                format!("handshake rejected with code {}: {}", response.result.code(), reason),
            ));
        }
    }

    let send_segment_size = negotiate_segment_size(config.max_segment_size, response.max_segment_size);
    let session = Session::new(
        config.domain.clone(),
        config.service_name.clone(),
        response.options & HandshakeOptions::KEEPALIVE,
        config.credentials.as_ref().map(|c| c.user.clone()),
    );
    info!(
        "Handshake complete, session {} (segment {} bytes)",
        session.id(),
        send_segment_size
    );

    Ok(HandshakeOutcome {
        session,
        send_segment_size,
        remainder: reader.take_remainder(),
    })
}

async fn reject<W>(
    io: &mut W,
    result: HandshakeResult,
    code: RpcResultCode,
    reason: String,
) -> RpcResult<HandshakeOutcome>
where
    W: AsyncWrite + Unpin,
{
    warn!("Rejecting handshake: {}", reason);
    let mut response = HandshakeResponse::new(result);
    response.reason = Some(reason.clone());
    io.write_all(&response.encode()?).await?;
    io.flush().await?;
    Err(RpcError::new(code, reason))
}

/// Run the server side of the handshake
pub async fn server_handshake<S>(
    io: &mut S,
    config: &ChannelConfig,
    authenticator: Option<&dyn Authenticator>,
) -> RpcResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = HandshakeReader::new();
    let raw = read_raw(io, &mut reader).await?;

    if !is_version_compatible(raw.version) {
        return reject(
            io,
            HandshakeResult::VersionMismatch,
            RpcResultCode::VersionMismatch,
            format!("unsupported protocol version {:#06x}", raw.version),
        )
        .await;
    }
    let request = HandshakeRequest::decode_body(raw.version, raw.body)?;
    debug!(
        "Handshake request for {}/{} (options {:?})",
        request.domain, request.service_name, request.options
    );

    if !config.service_name.is_empty() && request.service_name != config.service_name {
        return reject(
            io,
            HandshakeResult::UnknownService,
            RpcResultCode::Unsupported,
            format!("service '{}' is not hosted here", request.service_name),
        )
        .await;
    }

    if let Some(authenticator) = authenticator {
        let (user, password) = request
            .credentials
            .as_ref()
            .map_or(("", ""), |c| (c.user.as_str(), c.password.as_str()));
        if let Some(reason) = authenticator.validate(user, password).await {
            if !reason.is_empty() {
                return reject(io, HandshakeResult::LoginFailed, RpcResultCode::LoginFailed, reason).await;
            }
        }
    }

    let options = request.options & HandshakeOptions::KEEPALIVE;
    let mut response = HandshakeResponse::new(HandshakeResult::Ok);
    response.options = options;
    response.max_segment_size = u16::try_from(config.max_segment_size).ok();
    io.write_all(&response.encode()?).await?;
    io.flush().await?;

    let send_segment_size = negotiate_segment_size(config.max_segment_size, request.max_segment_size);
    let session = Session::new(
        request.domain,
        request.service_name,
        options,
        request.credentials.map(|c| c.user),
    );
    info!("Accepted session {} for user {:?}", session.id(), session.user());

    Ok(HandshakeOutcome {
        session,
        send_segment_size,
        remainder: reader.take_remainder(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialsConfig;

    fn client_config() -> ChannelConfig {
        ChannelConfig {
            service_name: "calc".into(),
            credentials: Some(CredentialsConfig {
                user: "alice".into(),
                password: "pw".into(),
            }),
            ..Default::default()
        }
    }

    fn server_config() -> ChannelConfig {
        ChannelConfig {
            service_name: "calc".into(),
            max_segment_size: 1024,
            ..Default::default()
        }
    }

    async fn run(
        client: ChannelConfig,
        server: ChannelConfig,
        auth: Option<StaticAuthenticator>,
        pipe: usize,
    ) -> (RpcResult<HandshakeOutcome>, RpcResult<HandshakeOutcome>) {
        let (mut a, mut b) = tokio::io::duplex(pipe);
        let server_task = tokio::spawn(async move {
            let auth = auth;
            server_handshake(&mut b, &server, auth.as_ref().map(|a| a as &dyn Authenticator)).await
        });
        let client_result = client_handshake(&mut a, &client).await;
        (client_result, server_task.await.unwrap())
    }

    #[tokio::test]
    async fn test_successful_handshake_negotiates_segment() {
        let auth = StaticAuthenticator::new().with_user("alice", "pw");
        let (client, server) = run(client_config(), server_config(), Some(auth), 4096).await;

        let client = client.unwrap();
        let server = server.unwrap();
        assert_eq!(client.send_segment_size, 1024);
        assert_eq!(server.send_segment_size, 1024);
        assert_eq!(server.session.user(), Some("alice"));
        assert_eq!(server.session.service_name(), "calc");
        assert!(client.remainder.is_empty());
    }

    #[tokio::test]
    async fn test_one_byte_pipe_reads_incrementally() {
        let (client, server) = run(client_config(), server_config(), None, 1).await;
        assert!(client.is_ok());
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn test_failing_authenticator_rejects() {
        let auth = StaticAuthenticator::new().with_user("alice", "other");
        let (client, server) = run(client_config(), server_config(), Some(auth), 4096).await;

        let client = client.unwrap_err();
        assert_eq!(client.code(), RpcResultCode::LoginFailed);
        assert_eq!(client.message(), "invalid password");
        assert_eq!(server.unwrap_err().code(), RpcResultCode::LoginFailed);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let mut client = client_config();
        client.service_name = "billing".into();
        let (client, server) = run(client, server_config(), None, 4096).await;
        assert_eq!(client.unwrap_err().code(), RpcResultCode::Unsupported);
        assert_eq!(server.unwrap_err().code(), RpcResultCode::Unsupported);
    }

    #[tokio::test]
    async fn test_token_mismatch_is_fatal() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let server = tokio::spawn(async move { server_handshake(&mut b, &server_config(), None).await });
        a.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let err = server.await.unwrap().unwrap_err();
        assert_eq!(err.code(), RpcResultCode::InvalidToken);
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let server = tokio::spawn(async move { server_handshake(&mut b, &server_config(), None).await });

        let mut request = HandshakeRequest::new("default", "calc");
        request.version = 0x0200;
        a.write_all(&request.encode().unwrap()).await.unwrap();

        let mut reader = HandshakeReader::new();
        let raw = read_raw(&mut a, &mut reader).await.unwrap();
        let response = HandshakeResponse::decode_body(raw.version, raw.body).unwrap();
        assert_eq!(response.result, HandshakeResult::VersionMismatch);
        assert_eq!(server.await.unwrap().unwrap_err().code(), RpcResultCode::VersionMismatch);
    }

    #[tokio::test]
    async fn test_eof_during_handshake() {
        let (a, mut b) = tokio::io::duplex(256);
        drop(a);
        let err = server_handshake(&mut b, &server_config(), None).await.unwrap_err();
        assert_eq!(err.code(), RpcResultCode::ConnectionReset);
    }

    #[test]
    fn test_segment_negotiation() {
        assert_eq!(negotiate_segment_size(16384, Some(1024)), 1024);
        assert_eq!(negotiate_segment_size(512, Some(4096)), 512);
        assert_eq!(negotiate_segment_size(512, None), 512);
        assert_eq!(negotiate_segment_size(512, Some(4)), 512);
    }
}
