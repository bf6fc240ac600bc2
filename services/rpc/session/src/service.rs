//! Service hosting on the accepting side of a channel.

use async_trait::async_trait;
use bytes::Bytes;
use rpc_wire::{Codec, CodecKind, Fault, FaultCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::Session;
use crate::stream::ServerStream;

/// Per-call context handed to service handlers
#[derive(Debug, Clone)]
pub struct CallContext {
    session: Arc<Session>,
    call_id: u64,
    cancel: CancellationToken,
    codec: CodecKind,
}

impl CallContext {
    pub(crate) fn new(session: Arc<Session>, call_id: u64, cancel: CancellationToken, codec: CodecKind) -> Self {
        Self {
            session,
            call_id,
            cancel,
            codec,
        }
    }

    /// Session of the calling channel
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Call id, 0 for one-way messages
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Trips when the caller cancels or the channel closes
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the call was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Codec configured for the channel
    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Decode a payload with the channel codec, as a deserialization fault
    /// on failure
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, Fault> {
        self.codec
            .deserialize(payload)
            .map_err(|e| Fault::new(FaultCode::Deserialization, e.to_string()))
    }

    /// Encode a result with the channel codec
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, Fault> {
        Codec::serialize(&self.codec, value)
            .map_err(|e| Fault::new(FaultCode::Internal, e.to_string()))
    }
}

/// Handlers invoked for calls arriving on a channel
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Serve a call expecting a response
    async fn on_request(&self, ctx: CallContext, method: u16, payload: Bytes) -> Result<Bytes, Fault>;

    /// Handle a one-way message
    async fn on_message(&self, ctx: CallContext, method: u16, payload: Bytes) {
        debug!(
            session = %ctx.session().id(),
            method,
            len = payload.len(),
            "One-way message without handler dropped"
        );
    }

    /// Serve a streaming call. The result is sent after the server's writer
    /// completed.
    async fn on_stream(
        &self,
        ctx: CallContext,
        method: u16,
        payload: Bytes,
        stream: ServerStream,
    ) -> Result<Bytes, Fault> {
        let _ = (ctx, payload, stream);
        Err(Fault::new(
            FaultCode::Unsupported,
            format!("method {} does not support streaming", method),
        ))
    }
}

/// Fault for methods a service does not know
pub fn unknown_method(method: u16) -> Fault {
    Fault::new(FaultCode::UnknownMethod, format!("unknown method {}", method))
}
