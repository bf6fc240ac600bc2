//! Accepting side: handshake validation and hosting a [`Service`].

use bytes::Bytes;
use rpc_wire::{Envelope, Fault, FaultCode, StreamMode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, ChannelCore, Role};
use crate::config::ChannelConfig;
use crate::handshake::{server_handshake, Authenticator};
use crate::result::{RpcError, RpcResult};
use crate::service::{CallContext, Service};
use crate::stream::{ServerStream, StreamShared};
use crate::transport::{BoxedTransport, Transport};

/// Accepts transports, runs the server handshake and hosts a service on
/// every resulting channel
pub struct Acceptor {
    config: ChannelConfig,
    service: Arc<dyn Service>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl Acceptor {
    /// Create an acceptor; the configuration is validated up front
    pub fn new(config: ChannelConfig, service: Arc<dyn Service>) -> RpcResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            service,
            authenticator: None,
        })
    }

    /// Require credentials checked by `authenticator`
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Configuration applied to accepted channels
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Handshake on `io` and start serving it
    pub async fn accept<T: Transport>(&self, io: T, peer: impl Into<String>) -> RpcResult<Channel> {
        let peer = peer.into();
        let mut io: BoxedTransport = Box::new(io);

        let handshake = server_handshake(&mut io, &self.config, self.authenticator.as_deref());
        let outcome = match tokio::time::timeout(self.config.handshake_timeout(), handshake).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RpcError::new(
                    crate::result::RpcResultCode::ConnectionTimeout,
                    "handshake timed out",
                ))
            }
        };
        info!(
            peer = %peer,
            session = %outcome.session.id(),
            user = outcome.session.user().unwrap_or("-"),
            "Handshake accepted"
        );

        let core = ChannelCore::new(
            self.config.clone(),
            Role::Server,
            peer,
            None,
            Some(self.service.clone()),
        )?;
        core.start(io, outcome)?;
        Ok(Channel::from_core(core))
    }

    /// Accept TCP connections until `shutdown` trips
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!("Serving on {:?}", local);

        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Cannot set TCP_NODELAY for {}: {}", addr, e);
            }

            let acceptor = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let channel = match acceptor.accept(stream, addr.to_string()).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!(peer = %addr, "Connection rejected: {}", e);
                        return;
                    }
                };
                tokio::select! {
                    state = channel.wait_closed() => debug!(peer = %addr, "Channel ended in {:?}", state),
                    _ = shutdown.cancelled() => channel.close_async().await,
                }
            });
        }

        info!("Stopped serving on {:?}", local);
        Ok(())
    }
}

/// Entry point for calls arriving on a server channel
pub(crate) fn handle_incoming(core: &Arc<ChannelCore>, envelope: Envelope) {
    match envelope {
        Envelope::Request {
            call_id,
            method,
            payload,
        } => handle_request(core, call_id, method, payload),
        Envelope::Message { method, payload } => handle_message(core, method, payload),
        Envelope::CancelRequest { call_id } => {
            core.dispatcher.cancel_incoming(call_id);
        }
        Envelope::StreamOpen {
            call_id,
            method,
            mode,
            window,
            payload,
        } => handle_stream_open(core, call_id, method, mode, window, payload),
        other => core.dispatcher.route(other),
    }
}

fn context(core: &ChannelCore, call_id: u64, cancel: CancellationToken) -> Option<CallContext> {
    let session = core.session.get()?.clone();
    Some(CallContext::new(session, call_id, cancel, core.config.codec))
}

fn reply(core: &ChannelCore, call_id: u64, result: Result<Bytes, Fault>) {
    let envelope = match result {
        Ok(payload) => Envelope::Response { call_id, payload },
        Err(fault) => {
            debug!(call_id, code = ?fault.code, "Call faulted: {}", fault.message);
            Envelope::Fault { call_id, fault }
        }
    };
    if let Err(e) = core.send(&envelope) {
        match e.code() {
            crate::result::RpcResultCode::SerializationError => {
                error!(call_id, "Reply rejected: {}", e);
                let fault = Fault::new(FaultCode::Internal, e.message());
                if let Err(e) = core.send(&Envelope::Fault { call_id, fault }) {
                    debug!(call_id, "Cannot send fault: {}", e);
                }
            }
            _ => debug!(call_id, "Cannot send reply: {}", e),
        }
    }
}

fn refuse(core: &ChannelCore, call_id: u64, err: RpcError) {
    warn!(call_id, "Incoming call refused: {}", err);
    if let Err(e) = core.send(&Envelope::Fault {
        call_id,
        fault: err.to_fault(),
    }) {
        debug!(call_id, "Cannot send refusal: {}", e);
    }
}

fn cancelled_fault() -> Fault {
    Fault::new(FaultCode::Cancelled, "call cancelled")
}

fn handle_request(core: &Arc<ChannelCore>, call_id: u64, method: u16, payload: Bytes) {
    let Some(service) = core.service.clone() else {
        return;
    };
    let cancel = match core.dispatcher.accept_incoming(call_id, None, &core.shutdown) {
        Ok(cancel) => cancel,
        Err(e) => return refuse(core, call_id, e),
    };
    let Some(ctx) = context(core, call_id, cancel.clone()) else {
        core.dispatcher.finish_incoming(call_id);
        return;
    };
    trace!(call_id, method, "Serving request");

    let core = core.clone();
    tokio::spawn(async move {
        let result = tokio::select! {
            result = service.on_request(ctx, method, payload) => result,
            _ = cancel.cancelled() => Err(cancelled_fault()),
        };
        core.dispatcher.finish_incoming(call_id);
        reply(&core, call_id, result);
    });
}

fn handle_message(core: &Arc<ChannelCore>, method: u16, payload: Bytes) {
    let Some(service) = core.service.clone() else {
        return;
    };
    let Some(ctx) = context(core, 0, core.shutdown.child_token()) else {
        return;
    };
    tokio::spawn(async move {
        service.on_message(ctx, method, payload).await;
    });
}

fn handle_stream_open(
    core: &Arc<ChannelCore>,
    call_id: u64,
    method: u16,
    mode: StreamMode,
    window: u32,
    payload: Bytes,
) {
    let Some(service) = core.service.clone() else {
        return;
    };
    let writes = mode.server_writes();
    if writes && window == 0 {
        return refuse(core, call_id, RpcError::protocol("stream opened with a zero window"));
    }
    let reader_window = mode.client_writes().then_some(core.config.stream_window);
    let (shared, items) = StreamShared::new(
        call_id,
        core.tx.clone(),
        core.config.codec,
        core.config.max_message_size,
        writes,
        reader_window,
    );

    let cancel = match core
        .dispatcher
        .accept_incoming(call_id, Some(shared.clone()), &core.shutdown)
    {
        Ok(cancel) => cancel,
        Err(e) => return refuse(core, call_id, e),
    };
    let Some(ctx) = context(core, call_id, cancel.clone()) else {
        core.dispatcher.finish_incoming(call_id);
        return;
    };
    if writes {
        shared.enable_writer(window);
    }

    let confirmation = Envelope::StreamOpen {
        call_id,
        method,
        mode,
        window: reader_window.unwrap_or(0),
        payload: Bytes::new(),
    };
    if let Err(e) = core.send(&confirmation) {
        debug!(call_id, "Cannot confirm stream: {}", e);
        shared.abort(e);
        core.dispatcher.finish_incoming(call_id);
        return;
    }
    debug!(call_id, method, ?mode, "Serving stream");

    let stream = ServerStream::new(shared.clone(), writes, items);
    let core = core.clone();
    tokio::spawn(async move {
        let result = tokio::select! {
            result = service.on_stream(ctx, method, payload, stream) => result,
            _ = cancel.cancelled() => Err(cancelled_fault()),
        };

        // the writer's close is acknowledged before the result goes out
        let result = match result {
            Ok(payload) => match shared.complete_writer().await {
                Ok(()) => Ok(payload),
                Err(e) => Err(e.to_fault()),
            },
            Err(fault) => Err(fault),
        };
        if let Err(fault) = &result {
            shared.abort(RpcError::from_fault(fault.clone()));
        }
        reply(&core, call_id, result);

        tokio::select! {
            _ = shared.wait_settled() => {}
            _ = cancel.cancelled() => {}
        }
        core.dispatcher.finish_incoming(call_id);
        trace!(call_id, "Stream retired");
    });
}
