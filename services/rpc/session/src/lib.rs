//! Handshake, channel lifecycle, call dispatch and flow-controlled streams.
//!
//! This crate runs the rpc wire protocol over any bidirectional byte
//! stream. A [`Channel`] owns one transport, negotiates a [`Session`]
//! during the handshake and then multiplexes calls, one-way messages and
//! streams over it.
//!
//! ## Features
//!
//! - **Handshake**: version, service name and credential checks
//! - **Calls**: request/response correlated by call id, with cancellation
//! - **Streams**: client, server and duplex streaming with windowed credits
//! - **Keepalive**: PING/PONG with RTT measurement and idle timeout
//! - **Hosting**: an [`Acceptor`] serves a [`Service`] on accepted channels
//!
//! ## Example
//!
//! ```rust,no_run
//! use rpc_session::{Channel, ChannelConfig, RpcResult, StreamMode};
//! use bytes::Bytes;
//!
//! # async fn example() -> RpcResult<()> {
//! let addr = "127.0.0.1:9400".parse().unwrap();
//! let channel = Channel::tcp(ChannelConfig::default(), addr)?;
//! channel.try_connect().await?;
//!
//! let reply = channel.call_raw(1, Bytes::from_static(b"hello")).await?;
//! println!("echo: {:?}", reply);
//!
//! let mut call = channel.open_stream(3, StreamMode::Duplex, Bytes::new())?;
//! if let Some(writer) = call.writer() {
//!     writer.write(Bytes::from_static(b"one")).await?;
//! }
//! if let Some(writer) = call.take_writer() {
//!     writer.complete().await?;
//! }
//! if let Some(reader) = call.reader() {
//!     while let Some(item) = reader.next().await? {
//!         println!("item: {:?}", item);
//!     }
//! }
//! call.finish().await?;
//!
//! channel.close_async().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod handshake;
pub mod keepalive;
pub mod result;
pub mod server;
pub mod service;
pub mod session;
pub mod stream;
pub mod transport;

// Re-export main types
pub use channel::{Channel, ChannelState};
pub use config::{ChannelConfig, CredentialsConfig};
pub use dispatcher::{CallKind, Dispatcher};
pub use handshake::{client_handshake, server_handshake, Authenticator, HandshakeOutcome, StaticAuthenticator};
pub use keepalive::{calc_rtt_from_corr, now_corr_id, ChannelStats, StatsSnapshot};
pub use result::{RpcError, RpcResult, RpcResultCode};
pub use server::Acceptor;
pub use service::{unknown_method, CallContext, Service};
pub use session::Session;
pub use stream::{ServerStream, StreamCall, StreamReader, StreamState, StreamWriter};
pub use transport::{connect_tcp, listen_tcp, BoxedTransport, Connector, StreamConnector, TcpConnector, Transport};

// Wire-level types used in the public API
pub use rpc_wire::{CodecKind, Fault, FaultCode, PrebuiltMessage, StreamMode};
