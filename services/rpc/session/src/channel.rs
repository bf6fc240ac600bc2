//! Channel lifecycle and the client call API.
//!
//! A connected channel runs two independent loops over its transport. The
//! receive loop feeds every read buffer into the [`MessageParser`] and
//! routes each completed message; the send loop pulls sealed segments out
//! of the [`TxBuffer`] and writes them. Neither loop waits on the other.
//!
//! ```text
//!  New -> Connecting -> Connected -> Closing -> Closed
//!    \________\______________\___________\-> Faulted
//! ```

use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rpc_wire::{
    Codec, CodecKind, Envelope, Fault, FaultCode, MessageClass, MessageParser, ParseStatus,
    ParsedMessage, PrebuiltMessage, StreamMode, TxBuffer, TxState, WireError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ChannelConfig;
use crate::dispatcher::{CallKind, Dispatcher};
use crate::handshake::{client_handshake, HandshakeOutcome};
use crate::keepalive::{calc_rtt_from_corr, now_corr_id, ChannelStats, StatsSnapshot};
use crate::result::{RpcError, RpcResult, RpcResultCode};
use crate::server;
use crate::service::Service;
use crate::session::Session;
use crate::stream::{StreamCall, StreamShared};
use crate::transport::{BoxedTransport, Connector, TcpConnector};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Channel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, not connected yet
    New,
    /// Transport connect and handshake in progress
    Connecting,
    /// Normal traffic
    Connected,
    /// Draining queued output before shutting the transport
    Closing,
    /// Orderly end
    Closed,
    /// Unrecoverable transport or framing error
    Faulted,
}

impl ChannelState {
    /// Whether the channel reached a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Faulted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

pub(crate) struct ChannelCore {
    pub(crate) config: ChannelConfig,
    pub(crate) role: Role,
    peer: String,
    connector: Option<Arc<dyn Connector>>,
    pub(crate) service: Option<Arc<dyn Service>>,
    state: watch::Sender<ChannelState>,
    pub(crate) tx: Arc<TxBuffer>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) session: OnceCell<Arc<Session>>,
    stats: ChannelStats,
    pub(crate) shutdown: CancellationToken,
    last_error: Mutex<Option<RpcError>>,
}

impl ChannelCore {
    pub(crate) fn new(
        config: ChannelConfig,
        role: Role,
        peer: String,
        connector: Option<Arc<dyn Connector>>,
        service: Option<Arc<dyn Service>>,
    ) -> RpcResult<Arc<Self>> {
        config.validate()?;
        let tx = Arc::new(TxBuffer::new(TxState::shared(config.max_segment_size)?));
        let dispatcher = Arc::new(Dispatcher::new(tx.clone()));
        Ok(Arc::new(Self {
            config,
            role,
            peer,
            connector,
            service,
            state: watch::Sender::new(ChannelState::New),
            tx,
            dispatcher,
            session: OnceCell::new(),
            stats: ChannelStats::default(),
            shutdown: CancellationToken::new(),
            last_error: Mutex::new(None),
        }))
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn transition(&self, from: &[ChannelState], to: ChannelState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                trace!(peer = %self.peer, "Channel {:?} -> {:?}", state, to);
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Enqueue one envelope for sending
    pub(crate) fn send(&self, envelope: &Envelope) -> RpcResult<()> {
        match self.state() {
            ChannelState::Connected => {}
            ChannelState::New | ChannelState::Connecting => {
                return Err(RpcError::invalid_state("channel is not connected"));
            }
            _ => return Err(RpcError::channel_closed()),
        }

        let mut body = BytesMut::with_capacity(64);
        envelope.encode(&mut body);
        if body.len() > self.config.max_message_size {
            return Err(RpcError::new(
                RpcResultCode::SerializationError,
                format!(
                    "message of {} bytes exceeds limit of {}",
                    body.len(),
                    self.config.max_message_size
                ),
            ));
        }
        self.tx.write_message(envelope.class(), &body)?;
        self.stats.record_message_out();
        Ok(())
    }

    /// Start the loops over an established, handshaken transport
    pub(crate) fn start(self: &Arc<Self>, io: BoxedTransport, outcome: HandshakeOutcome) -> RpcResult<()> {
        self.tx.set_max_segment_size(outcome.send_segment_size)?;
        let _ = self.session.set(Arc::new(outcome.session));

        let from = match self.role {
            Role::Client => ChannelState::Connecting,
            Role::Server => ChannelState::New,
        };
        if !self.transition(&[from], ChannelState::Connected) {
            return Err(RpcError::channel_closed());
        }

        let (reader, writer) = tokio::io::split(io);
        let parser = MessageParser::new(self.config.max_segment_size)
            .with_max_message_size(self.config.max_message_size);

        tokio::spawn(receive_loop(self.clone(), reader, parser, outcome.remainder));
        tokio::spawn(send_loop(self.clone(), writer));
        if let Some(interval) = self.config.ping_interval() {
            tokio::spawn(keepalive_loop(self.clone(), interval));
        }
        info!(peer = %self.peer, "Channel connected");
        Ok(())
    }

    /// Unrecoverable error: drain everything and stop the loops
    pub(crate) fn fault(&self, err: RpcError) {
        let terminal = [ChannelState::Closed, ChannelState::Faulted];
        let changed = self.state.send_if_modified(|state| {
            if terminal.contains(state) {
                false
            } else {
                *state = ChannelState::Faulted;
                true
            }
        });
        if !changed {
            return;
        }

        error!(peer = %self.peer, "Channel faulted: {}", err);
        *self.last_error.lock() = Some(err.clone());
        self.dispatcher.close(RpcError::new(
            RpcResultCode::ChannelClosed,
            format!("channel faulted: {}", err.message()),
        ));
        self.tx.abort();
        self.shutdown.cancel();
    }

    pub(crate) fn close(&self) {
        let state = self.state();
        match state {
            ChannelState::New | ChannelState::Connecting => {
                if self.transition(&[state], ChannelState::Closed) {
                    self.dispatcher.close(RpcError::channel_closed());
                    self.tx.close();
                    self.shutdown.cancel();
                    info!(peer = %self.peer, "Channel closed before connecting");
                }
            }
            ChannelState::Connected => {
                if self.transition(&[ChannelState::Connected], ChannelState::Closing) {
                    info!(peer = %self.peer, "Closing channel");
                    self.dispatcher.close(RpcError::channel_closed());
                    self.tx.close();
                }
            }
            ChannelState::Closing | ChannelState::Closed | ChannelState::Faulted => {}
        }
    }

    fn finish_close(&self) {
        if self.transition(&[ChannelState::Closing], ChannelState::Closed) {
            info!(peer = %self.peer, "Channel closed");
        }
        self.shutdown.cancel();
    }

    fn feed(self: &Arc<Self>, parser: &mut MessageParser, segment: Bytes) -> RpcResult<()> {
        parser.set_next_segment(segment);
        loop {
            match parser.parse_further() {
                Ok(ParseStatus::EndOfSegment) => return Ok(()),
                Ok(ParseStatus::MessageParsed(message)) => self.handle_message(message),
                Err(e) => return Err(RpcError::protocol(format!("framing corrupted: {}", e))),
            }
        }
    }

    fn handle_message(self: &Arc<Self>, message: ParsedMessage) {
        self.stats.record_message_in();
        let envelope = match Envelope::decode(message.class(), message.to_bytes()) {
            Ok(envelope) => envelope,
            Err(err) => {
                match err.call_id {
                    Some(call_id) => self.reject_call(
                        call_id,
                        RpcError::new(RpcResultCode::DeserializationError, err.to_string()),
                    ),
                    None => warn!(peer = %self.peer, "Undecodable message dropped: {}", err),
                }
                return;
            }
        };
        trace!(call_id = envelope.call_id(), "{} received", envelope.name());

        match envelope {
            Envelope::Ping { corr_id } => {
                if let Err(e) = self.send(&Envelope::Pong { corr_id }) {
                    debug!("Cannot answer ping: {}", e);
                }
            }
            Envelope::Pong { corr_id } => {
                if let Some(rtt) = calc_rtt_from_corr(corr_id) {
                    self.stats.record_rtt(rtt);
                    debug!(peer = %self.peer, "Received PONG, RTT: {:?}", rtt);
                }
            }
            Envelope::Request { .. }
            | Envelope::Message { .. }
            | Envelope::CancelRequest { .. }
            | Envelope::StreamOpen { .. }
                if self.role == Role::Server =>
            {
                server::handle_incoming(self, envelope)
            }
            Envelope::Request { call_id, method, .. } => {
                warn!(call_id, method, "Client channel does not serve calls");
                let fault = Fault::new(FaultCode::Unsupported, "callbacks are not supported");
                if let Err(e) = self.send(&Envelope::Fault { call_id, fault }) {
                    debug!(call_id, "Cannot refuse callback: {}", e);
                }
            }
            Envelope::Message { method, .. } => {
                debug!(method, "One-way message to client channel dropped");
            }
            Envelope::CancelRequest { call_id } => {
                debug!(call_id, "Cancel request to client channel ignored");
            }
            other => self.dispatcher.route(other),
        }
    }

    /// A message for `call_id` could not be decoded
    fn reject_call(&self, call_id: u64, err: RpcError) {
        warn!(call_id, "Rejecting call: {}", err);
        match self.role {
            Role::Client => self.dispatcher.fail(call_id, err),
            Role::Server => {
                if !self.dispatcher.cancel_incoming(call_id) {
                    if let Err(e) = self.send(&Envelope::Fault {
                        call_id,
                        fault: err.to_fault(),
                    }) {
                        debug!(call_id, "Cannot send fault: {}", e);
                    }
                }
            }
        }
    }
}

async fn receive_loop(
    core: Arc<ChannelCore>,
    mut reader: ReadHalf<BoxedTransport>,
    mut parser: MessageParser,
    remainder: BytesMut,
) {
    if !remainder.is_empty() {
        core.stats.record_read(remainder.len());
        if let Err(e) = core.feed(&mut parser, remainder.freeze()) {
            core.fault(e);
            return;
        }
    }

    let idle_timeout = core.config.idle_timeout();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        if buf.capacity() < READ_BUFFER_SIZE / 4 {
            buf.reserve(READ_BUFFER_SIZE);
        }

        let read = async {
            match idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, reader.read_buf(&mut buf)).await {
                    Ok(result) => result.map_err(RpcError::from),
                    Err(_) => Err(RpcError::new(
                        RpcResultCode::ConnectionTimeout,
                        format!("no traffic for {:?}", idle),
                    )),
                },
                None => reader.read_buf(&mut buf).await.map_err(RpcError::from),
            }
        };

        let result = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            result = read => result,
        };

        match result {
            Ok(0) => {
                if !matches!(core.state(), ChannelState::Closing | ChannelState::Closed) {
                    core.fault(RpcError::new(RpcResultCode::ConnectionReset, "peer closed the connection"));
                }
                break;
            }
            Ok(n) => {
                core.stats.record_read(n);
                let segment = buf.split().freeze();
                if let Err(e) = core.feed(&mut parser, segment) {
                    core.fault(e);
                    break;
                }
            }
            Err(e) => {
                core.fault(e);
                break;
            }
        }
    }
    trace!(peer = %core.peer, "Receive loop finished");
}

async fn send_loop(core: Arc<ChannelCore>, mut writer: WriteHalf<BoxedTransport>) {
    let cancel = core.shutdown.clone();
    let mut next = core.tx.dequeue_next(&cancel).await;
    loop {
        let segment = match next {
            Ok(segment) => segment,
            Err(WireError::Closed) => {
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                core.finish_close();
                break;
            }
            Err(_) => break,
        };

        if let Err(e) = writer.write_all(&segment).await {
            core.fault(RpcError::new(RpcResultCode::ConnectionReset, format!("write failed: {}", e)));
            break;
        }
        core.stats.record_write(segment.len());
        next = core.tx.return_and_dequeue(segment, &cancel).await;
    }
    trace!(peer = %core.peer, "Send loop finished");
}

async fn keepalive_loop(core: Arc<ChannelCore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let corr_id = now_corr_id();
                if core.send(&Envelope::Ping { corr_id }).is_err() {
                    break;
                }
                trace!(peer = %core.peer, corr_id, "Sent PING");
            }
        }
    }
}

/// Handle to one RPC connection. Clones share the connection.
///
/// The connection stays up until [`Channel::close`] is called, the peer
/// disconnects or a fault occurs.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.core.peer)
            .field("role", &self.core.role)
            .field("state", &self.core.state())
            .finish()
    }
}

impl Channel {
    /// Create a client channel that connects through `connector`
    pub fn new(config: ChannelConfig, connector: Arc<dyn Connector>) -> RpcResult<Self> {
        let peer = connector.peer();
        let core = ChannelCore::new(config, Role::Client, peer, Some(connector), None)?;
        Ok(Self { core })
    }

    /// Create a client channel for a TCP address
    pub fn tcp(config: ChannelConfig, addr: std::net::SocketAddr) -> RpcResult<Self> {
        Self::new(config, Arc::new(TcpConnector::new(addr)))
    }

    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    /// Connect the transport and run the handshake as one attempt.
    ///
    /// Ordinary failures are returned as result codes and leave the channel
    /// in `New`, so the caller may try again. Connecting a channel that is
    /// not `New` is misuse and yields `InvalidState`.
    pub async fn try_connect(&self) -> RpcResult<()> {
        let core = &self.core;
        let connector = core
            .connector
            .clone()
            .ok_or_else(|| RpcError::invalid_state("accepted channels cannot connect"))?;
        if !core.transition(&[ChannelState::New], ChannelState::Connecting) {
            return Err(RpcError::invalid_state(format!(
                "cannot connect in state {:?}",
                core.state()
            )));
        }
        info!(peer = %core.peer, "Connecting");

        let attempt = async {
            let mut io = match tokio::time::timeout(core.config.connect_timeout(), connector.connect()).await {
                Ok(Ok(io)) => io,
                Ok(Err(e)) => {
                    return Err(RpcError::new(
                        RpcResultCode::ConnectionFailed,
                        format!("connect to {} failed: {}", core.peer, e),
                    ))
                }
                Err(_) => {
                    return Err(RpcError::new(RpcResultCode::ConnectionTimeout, "connect timed out"));
                }
            };
            let outcome =
                match tokio::time::timeout(core.config.handshake_timeout(), client_handshake(&mut io, &core.config))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(RpcError::new(RpcResultCode::ConnectionTimeout, "handshake timed out"));
                    }
                };
            Ok::<_, RpcError>((io, outcome))
        };

        match attempt.await {
            Ok((io, outcome)) => core.start(io, outcome),
            Err(e) => {
                warn!(peer = %core.peer, "Connect attempt failed: {}", e);
                *core.last_error.lock() = Some(e.clone());
                if !core.transition(&[ChannelState::Connecting], ChannelState::New) {
                    return Err(RpcError::channel_closed());
                }
                Err(e)
            }
        }
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// Negotiated session, once connected
    pub fn session(&self) -> Option<Arc<Session>> {
        self.core.session.get().cloned()
    }

    /// Configuration in effect
    pub fn config(&self) -> &ChannelConfig {
        &self.core.config
    }

    /// Peer description
    pub fn peer(&self) -> &str {
        &self.core.peer
    }

    /// Traffic counters
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Error that faulted the channel or failed the last connect attempt
    pub fn last_error(&self) -> Option<RpcError> {
        self.core.last_error.lock().clone()
    }

    /// Pending-call table
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.core.dispatcher
    }

    /// Segment size negotiated for sending
    pub fn send_segment_size(&self) -> usize {
        self.core.tx.max_segment_size()
    }

    fn codec(&self) -> CodecKind {
        self.core.config.codec
    }

    fn ensure_client(&self) -> RpcResult<()> {
        match self.core.role {
            Role::Client => Ok(()),
            Role::Server => Err(RpcError::invalid_state("only the connecting side issues calls")),
        }
    }

    /// Call `method` with a serialized argument and wait for the result
    pub async fn call_raw(&self, method: u16, payload: Bytes) -> RpcResult<Bytes> {
        self.call_raw_with_cancel(method, payload, &CancellationToken::new()).await
    }

    /// Like [`Channel::call_raw`]; tripping `cancel` resolves the call as
    /// cancelled unless its reply already arrived
    pub async fn call_raw_with_cancel(
        &self,
        method: u16,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> RpcResult<Bytes> {
        self.ensure_client()?;
        let dispatcher = &self.core.dispatcher;
        let (call_id, mut response) = dispatcher.register(CallKind::Unary)?;

        if let Err(e) = self.core.send(&Envelope::Request {
            call_id,
            method,
            payload,
        }) {
            dispatcher.unregister(call_id);
            return Err(e);
        }
        trace!(call_id, method, "Request sent");

        tokio::select! {
            result = &mut response => {
                return result.unwrap_or_else(|_| Err(RpcError::channel_closed()));
            }
            _ = cancel.cancelled() => {}
        }

        dispatcher.cancel(call_id);
        response.await.unwrap_or_else(|_| Err(RpcError::cancelled()))
    }

    /// Typed call using the channel codec
    pub async fn call<Req, Resp>(&self, method: u16, request: &Req) -> RpcResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = Codec::serialize(&self.codec(), request)?;
        let bytes = self.call_raw(method, payload).await?;
        Ok(self.codec().deserialize(&bytes)?)
    }

    /// Send a one-way message
    pub fn send_message_raw(&self, method: u16, payload: Bytes) -> RpcResult<()> {
        self.core.send(&Envelope::Message { method, payload })
    }

    /// Send a typed one-way message
    pub fn send_message<T: Serialize>(&self, method: u16, message: &T) -> RpcResult<()> {
        let payload = Codec::serialize(&self.codec(), message)?;
        self.send_message_raw(method, payload)
    }

    /// Serialize a one-way message once for sending on many channels
    pub fn prebuild_message(method: u16, payload: Bytes) -> PrebuiltMessage {
        let envelope = Envelope::Message { method, payload };
        PrebuiltMessage::from_body(MessageClass::User, envelope.to_bytes())
    }

    /// Enqueue a prebuilt message, chunked to this channel's segment size
    pub fn send_prebuilt(&self, message: &PrebuiltMessage) -> RpcResult<()> {
        match self.state() {
            ChannelState::Connected => {}
            ChannelState::New | ChannelState::Connecting => {
                return Err(RpcError::invalid_state("channel is not connected"));
            }
            _ => return Err(RpcError::channel_closed()),
        }
        if message.len() > self.core.config.max_message_size {
            return Err(RpcError::new(
                RpcResultCode::SerializationError,
                "prebuilt message exceeds message limit",
            ));
        }
        self.core.tx.write_prebuilt(message)?;
        self.core.stats.record_message_out();
        Ok(())
    }

    /// Open a streaming call. Items flow once the server confirms the open.
    pub fn open_stream(&self, method: u16, mode: StreamMode, payload: Bytes) -> RpcResult<StreamCall> {
        self.ensure_client()?;
        let core = &self.core;
        let (call_id, response) = core.dispatcher.register(CallKind::Stream)?;

        let writes = mode.client_writes();
        let reader_window = mode.server_writes().then_some(core.config.stream_window);
        let (shared, items) = StreamShared::new(
            call_id,
            core.tx.clone(),
            core.config.codec,
            core.config.max_message_size,
            writes,
            reader_window,
        );
        core.dispatcher.attach_stream(call_id, &shared);

        if let Err(e) = core.send(&Envelope::StreamOpen {
            call_id,
            method,
            mode,
            window: reader_window.unwrap_or(0),
            payload,
        }) {
            core.dispatcher.unregister(call_id);
            return Err(e);
        }
        debug!(call_id, method, ?mode, "Stream opened");

        Ok(StreamCall::new(shared, core.dispatcher.clone(), response, writes, items))
    }

    /// Open a streaming call with a typed argument
    pub fn open_stream_with<T: Serialize>(&self, method: u16, mode: StreamMode, argument: &T) -> RpcResult<StreamCall> {
        let payload = Codec::serialize(&self.codec(), argument)?;
        self.open_stream(method, mode, payload)
    }

    /// Start closing: pending calls fail with `ChannelClosed`, streams
    /// abort, queued output is flushed. Idempotent.
    pub fn close(&self) {
        self.core.close();
    }

    /// Close and wait until the transport is shut down
    pub async fn close_async(&self) {
        self.core.close();
        let wait = self.wait_closed();
        if tokio::time::timeout(self.core.config.connect_timeout(), wait).await.is_err() {
            warn!(peer = %self.core.peer, "Close did not drain in time, aborting");
            self.core.tx.abort();
            self.core.shutdown.cancel();
            self.core.transition(&[ChannelState::Closing], ChannelState::Closed);
        }
    }

    /// Wait for a terminal state
    pub async fn wait_closed(&self) -> ChannelState {
        let mut state = self.core.state.subscribe();
        let result = state.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        result.unwrap_or(ChannelState::Closed)
    }
}
