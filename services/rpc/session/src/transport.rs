//! Transport abstraction for channels.
//!
//! A channel only needs an ordered, bidirectional byte stream. Anything that
//! implements tokio's `AsyncRead + AsyncWrite` qualifies, so TCP sockets,
//! TLS streams and in-memory duplex pipes can all carry a channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Byte stream usable as a channel transport
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport
pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports for client channels
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new transport
    async fn connect(&self) -> io::Result<BoxedTransport>;

    /// Peer description for logging
    fn peer(&self) -> String;
}

/// Connects over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    /// Create a connector for `addr`
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        let stream = connect_tcp(self.addr).await?;
        stream.set_nodelay(true)?;
        debug!("TCP connection established to {}", self.addr);
        Ok(Box::new(stream))
    }

    fn peer(&self) -> String {
        self.addr.to_string()
    }
}

/// Hands out one already-established transport
pub struct StreamConnector {
    stream: Mutex<Option<BoxedTransport>>,
    peer: String,
}

impl StreamConnector {
    /// Wrap an established stream
    pub fn new<T: Transport>(stream: T, peer: impl Into<String>) -> Self {
        Self {
            stream: Mutex::new(Some(Box::new(stream))),
            peer: peer.into(),
        }
    }
}

#[async_trait]
impl Connector for StreamConnector {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        self.stream.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "stream already used")
        })
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_connector_round_trip() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let connector = TcpConnector::new(bound_addr);
        assert_eq!(connector.peer(), bound_addr.to_string());

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = connector.connect().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_stream_connector_is_single_use() {
        let (client, _server) = tokio::io::duplex(64);
        let connector = StreamConnector::new(client, "duplex");
        assert!(connector.connect().await.is_ok());
        let err = connector.connect().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
