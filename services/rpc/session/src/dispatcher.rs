//! Call-id correlation between outgoing calls and inbound replies.
//!
//! The pending table is the one structure touched by both the callers
//! (register) and the receive loop (lookup and removal). It is a `DashMap`,
//! and every completion handle is a one-shot sender behind its own lock so
//! that the first settlement wins and later ones are no-ops.

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rpc_wire::{Envelope, TxBuffer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::result::{RpcError, RpcResult};
use crate::stream::StreamShared;

/// Encode an envelope and enqueue it
pub(crate) fn post(tx: &TxBuffer, envelope: &Envelope) -> RpcResult<()> {
    let mut body = BytesMut::with_capacity(32);
    envelope.encode(&mut body);
    tx.write_message(envelope.class(), &body)?;
    Ok(())
}

/// Shape of reply a pending call expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Single response or fault
    Unary,
    /// Stream control messages, then a response or fault
    Stream,
}

#[derive(Debug)]
struct PendingCall {
    kind: CallKind,
    completion: Mutex<Option<oneshot::Sender<RpcResult<Bytes>>>>,
    cancelled: AtomicBool,
    replied: AtomicBool,
    stream: OnceCell<Weak<StreamShared>>,
}

impl PendingCall {
    /// First settlement wins
    fn complete(&self, result: RpcResult<Bytes>) -> bool {
        match self.completion.lock().take() {
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    fn stream(&self) -> Option<Arc<StreamShared>> {
        self.stream.get().and_then(Weak::upgrade)
    }
}

#[derive(Debug)]
struct IncomingCall {
    cancel: CancellationToken,
    stream: Option<Arc<StreamShared>>,
}

/// Pending-call table and reply router of one channel
#[derive(Debug)]
pub struct Dispatcher {
    next_id: AtomicU64,
    pending: DashMap<u64, Arc<PendingCall>>,
    incoming: DashMap<u64, IncomingCall>,
    closing: AtomicBool,
    tx: Arc<TxBuffer>,
}

impl Dispatcher {
    /// Create a dispatcher sending control messages through `tx`
    pub fn new(tx: Arc<TxBuffer>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            incoming: DashMap::new(),
            closing: AtomicBool::new(false),
            tx,
        }
    }

    #[cfg(test)]
    fn starting_at(tx: Arc<TxBuffer>, first_id: u64) -> Self {
        let dispatcher = Self::new(tx);
        dispatcher.next_id.store(first_id, Ordering::Relaxed);
        dispatcher
    }

    /// Next id not used by any outstanding call. The counter wraps and
    /// skips 0 and ids still pending.
    pub fn generate_operation_id(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Outstanding calls issued by this side
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Calls from the peer currently being served
    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    /// Whether the channel started closing
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Register a new outgoing call
    pub(crate) fn register(&self, kind: CallKind) -> RpcResult<(u64, oneshot::Receiver<RpcResult<Bytes>>)> {
        if self.is_closing() {
            return Err(RpcError::channel_closed());
        }

        let (sender, receiver) = oneshot::channel();
        let call = Arc::new(PendingCall {
            kind,
            completion: Mutex::new(Some(sender)),
            cancelled: AtomicBool::new(false),
            replied: AtomicBool::new(false),
            stream: OnceCell::new(),
        });

        let id = loop {
            let id = self.generate_operation_id();
            match self.pending.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(call);
                    break id;
                }
                Entry::Occupied(_) => continue,
            }
        };

        // close() may have drained the table between the check and the insert
        if self.is_closing() {
            self.pending.remove(&id);
            return Err(RpcError::channel_closed());
        }
        trace!(call_id = id, ?kind, "Call registered");
        Ok((id, receiver))
    }

    pub(crate) fn attach_stream(&self, call_id: u64, stream: &Arc<StreamShared>) {
        if let Some(call) = self.pending.get(&call_id) {
            let _ = call.stream.set(Arc::downgrade(stream));
        }
    }

    /// Retire a call id
    pub(crate) fn unregister(&self, call_id: u64) {
        if self.pending.remove(&call_id).is_some() {
            trace!(call_id, "Call unregistered");
        }
    }

    /// Settle a call locally and remove it
    pub(crate) fn fail(&self, call_id: u64, err: RpcError) {
        if let Some((_, call)) = self.pending.remove(&call_id) {
            if let Some(stream) = call.stream() {
                stream.abort_and_notify(err.clone());
            }
            call.complete(Err(err));
        }
    }

    /// Resolve a call as cancelled. The id stays registered until the
    /// peer's reply arrives; when the reply already came, the id is retired
    /// here. Returns true when the cancellation settled the call.
    pub(crate) fn mark_cancelled(&self, call_id: u64) -> bool {
        let Some(call) = self.pending.get(&call_id).map(|c| c.clone()) else {
            return false;
        };
        call.cancelled.store(true, Ordering::SeqCst);
        let won = call.complete(Err(RpcError::cancelled()));
        if call.replied.load(Ordering::SeqCst) {
            self.unregister(call_id);
        }
        won
    }

    /// Cancel a unary call and ask the peer to stop working on it
    pub(crate) fn cancel(&self, call_id: u64) -> bool {
        let won = self.mark_cancelled(call_id);
        if won {
            debug!(call_id, "Call cancelled");
            if let Err(e) = post(&self.tx, &Envelope::CancelRequest { call_id }) {
                debug!(call_id, "Cannot send cancel request: {}", e);
            }
        }
        won
    }

    /// Reject a reply whose shape does not fit the call
    fn violation(&self, call_id: u64, what: &str) {
        warn!(call_id, "Unexpected {} for call", what);
        self.fail(call_id, RpcError::protocol(format!("unexpected {} for call {}", what, call_id)));
        if let Err(e) = post(&self.tx, &Envelope::CancelRequest { call_id }) {
            debug!(call_id, "Cannot send cancel request: {}", e);
        }
    }

    /// Route a reply or stream-control message by call id
    pub(crate) fn route(&self, envelope: Envelope) {
        let call_id = envelope.call_id();
        match envelope {
            Envelope::Response { payload, .. } => self.settle(call_id, Ok(payload)),
            Envelope::Fault { fault, .. } => self.settle(call_id, Err(RpcError::from_fault(fault))),
            Envelope::StreamOpen { window, .. } => {
                let Some(call) = self.pending.get(&call_id).map(|c| c.clone()) else {
                    debug!(call_id, "Stream confirmation for unknown call ignored");
                    return;
                };
                match (call.kind, call.stream()) {
                    (CallKind::Stream, Some(stream)) => stream.enable_writer(window),
                    (CallKind::Stream, None) => trace!(call_id, "Stream confirmation after owner left"),
                    (CallKind::Unary, _) => self.violation(call_id, "stream confirmation"),
                }
            }
            Envelope::StreamPage { .. }
            | Envelope::StreamAck { .. }
            | Envelope::StreamClose { .. }
            | Envelope::StreamCloseAck { .. }
            | Envelope::StreamCancel { .. } => self.route_stream(call_id, envelope),
            other => {
                debug!(call_id, "{} is not a reply, ignored by dispatcher", other.name());
            }
        }
    }

    fn settle(&self, call_id: u64, result: RpcResult<Bytes>) {
        let Some(call) = self.pending.get(&call_id).map(|c| c.clone()) else {
            debug!(call_id, "Late reply for unknown or completed call ignored");
            return;
        };

        if let (Err(err), Some(stream)) = (&result, call.stream()) {
            stream.abort(err.clone());
        }

        call.replied.store(true, Ordering::SeqCst);
        let first = call.complete(result);
        let retire = call.kind == CallKind::Unary || call.cancelled.load(Ordering::SeqCst);
        if retire {
            self.pending.remove(&call_id);
        }
        if !first {
            trace!(call_id, "Reply after local settlement absorbed");
        }
    }

    fn route_stream(&self, call_id: u64, envelope: Envelope) {
        let (stream, cancel) = if let Some(call) = self.pending.get(&call_id).map(|c| c.clone()) {
            if call.kind == CallKind::Unary {
                self.violation(call_id, envelope.name());
                return;
            }
            match call.stream() {
                Some(stream) => (stream, None),
                None => {
                    trace!(call_id, "{} for released stream dropped", envelope.name());
                    return;
                }
            }
        } else if let Some(incoming) = self.incoming.get(&call_id) {
            match &incoming.stream {
                Some(stream) => (stream.clone(), Some(incoming.cancel.clone())),
                None => {
                    drop(incoming);
                    warn!(call_id, "{} for a unary call", envelope.name());
                    self.cancel_incoming(call_id);
                    return;
                }
            }
        } else {
            debug!(call_id, "{} for unknown call ignored", envelope.name());
            return;
        };

        match envelope {
            Envelope::StreamPage { items, .. } => {
                if let Err(err) = stream.on_page(items) {
                    warn!(call_id, "Stream page rejected: {}", err);
                    stream.abort_and_notify(err.clone());
                    match &cancel {
                        Some(cancel) => cancel.cancel(),
                        None => {
                            if let Some(call) = self.pending.get(&call_id) {
                                call.cancelled.store(true, Ordering::SeqCst);
                                call.complete(Err(err));
                            }
                        }
                    }
                }
            }
            Envelope::StreamAck { count, .. } => stream.on_ack(count),
            Envelope::StreamClose { .. } => stream.on_close(),
            Envelope::StreamCloseAck { .. } => stream.on_close_ack(),
            Envelope::StreamCancel { .. } => {
                stream.abort(RpcError::new(
                    crate::result::RpcResultCode::StreamAborted,
                    "stream cancelled by peer",
                ));
                if let Some(cancel) = cancel {
                    cancel.cancel();
                }
            }
            _ => {}
        }
    }

    /// Track a call received from the peer; the returned token trips on
    /// cancellation or channel close
    pub(crate) fn accept_incoming(
        &self,
        call_id: u64,
        stream: Option<Arc<StreamShared>>,
        parent: &CancellationToken,
    ) -> RpcResult<CancellationToken> {
        if self.is_closing() {
            return Err(RpcError::channel_closed());
        }
        match self.incoming.entry(call_id) {
            Entry::Occupied(_) => Err(RpcError::protocol(format!("call id {} already active", call_id))),
            Entry::Vacant(slot) => {
                let cancel = parent.child_token();
                slot.insert(IncomingCall {
                    cancel: cancel.clone(),
                    stream,
                });
                Ok(cancel)
            }
        }
    }

    /// Peer asked to stop serving a call
    pub(crate) fn cancel_incoming(&self, call_id: u64) -> bool {
        match self.incoming.get(&call_id) {
            Some(call) => {
                debug!(call_id, "Incoming call cancelled by peer");
                call.cancel.cancel();
                if let Some(stream) = &call.stream {
                    stream.abort(RpcError::cancelled());
                }
                true
            }
            None => {
                debug!(call_id, "Cancel for unknown incoming call ignored");
                false
            }
        }
    }

    pub(crate) fn finish_incoming(&self, call_id: u64) {
        self.incoming.remove(&call_id);
    }

    /// Drain every pending and incoming call with `reason` and refuse new ones
    pub(crate) fn close(&self, reason: RpcError) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                if let Some(stream) = call.stream() {
                    stream.abort(reason.clone());
                }
                call.complete(Err(reason.clone()));
            }
        }

        let ids: Vec<u64> = self.incoming.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.incoming.remove(&id) {
                call.cancel.cancel();
                if let Some(stream) = call.stream {
                    stream.abort(reason.clone());
                }
            }
        }
        debug!("Dispatcher closed: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::RpcResultCode;
    use rpc_wire::{CodecKind, Fault, FaultCode, MessageParser, ParseStatus, TxState};
    use std::collections::HashSet;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(TxBuffer::new(TxState::shared(1024).unwrap())))
    }

    fn response(call_id: u64, body: &'static [u8]) -> Envelope {
        Envelope::Response {
            call_id,
            payload: Bytes::from_static(body),
        }
    }

    async fn sent(tx: &TxBuffer) -> Vec<Envelope> {
        let cancel = CancellationToken::new();
        let mut parser = MessageParser::new(1024);
        let mut out = Vec::new();
        while !tx.lock().lock().is_empty() {
            let segment = tx.dequeue_next(&cancel).await.unwrap();
            parser.set_next_segment(segment.freeze());
            while let ParseStatus::MessageParsed(msg) = parser.parse_further().unwrap() {
                out.push(Envelope::decode(msg.class(), msg.to_bytes()).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_response_completes_and_removes() {
        let d = dispatcher();
        let (id, rx) = d.register(CallKind::Unary).unwrap();
        d.route(response(id, b"ok"));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_ids_are_distinct() {
        let d = Arc::new(dispatcher());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let d = d.clone();
            tasks.push(tokio::spawn(async move {
                (0..100)
                    .map(|_| d.register(CallKind::Unary).unwrap())
                    .map(|(id, rx)| {
                        std::mem::forget(rx);
                        id
                    })
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[tokio::test]
    async fn test_wraparound_skips_zero_and_pending() {
        let d = Dispatcher::starting_at(
            Arc::new(TxBuffer::new(TxState::shared(1024).unwrap())),
            u64::MAX,
        );
        let (first, _rx1) = d.register(CallKind::Unary).unwrap();
        assert_eq!(first, u64::MAX);
        let (second, _rx2) = d.register(CallKind::Unary).unwrap();
        assert_eq!(second, 1);

        d.next_id.store(u64::MAX, Ordering::Relaxed);
        let (third, _rx3) = d.register(CallKind::Unary).unwrap();
        assert_eq!(third, 2, "u64::MAX, 0 and 1 are taken or reserved");
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let d = dispatcher();
        let (id, mut rx) = d.register(CallKind::Unary).unwrap();
        d.route(response(id + 100, b"stray"));
        d.route(Envelope::Fault {
            call_id: id + 200,
            fault: Fault::new(FaultCode::Application, "stray"),
        });
        assert!(rx.try_recv().is_err());
        assert_eq!(d.pending_count(), 1);

        d.route(response(id, b"mine"));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"mine"));
    }

    #[tokio::test]
    async fn test_cancel_then_response_settles_once() {
        let d = dispatcher();
        let (id, rx) = d.register(CallKind::Unary).unwrap();

        assert!(d.cancel(id));
        assert!(!d.cancel(id));
        assert_eq!(d.pending_count(), 1, "cancelled call waits for the real reply");

        d.route(response(id, b"late"));
        assert_eq!(d.pending_count(), 0);
        assert_eq!(rx.await.unwrap().unwrap_err().code(), RpcResultCode::Cancelled);

        assert!(sent(&d.tx).await.contains(&Envelope::CancelRequest { call_id: id }));
    }

    #[tokio::test]
    async fn test_response_then_cancel_keeps_response() {
        let d = dispatcher();
        let (id, rx) = d.register(CallKind::Unary).unwrap();
        d.route(response(id, b"first"));
        assert!(!d.cancel(id));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn test_fault_routes_to_caller() {
        let d = dispatcher();
        let (id, rx) = d.register(CallKind::Unary).unwrap();
        d.route(Envelope::Fault {
            call_id: id,
            fault: Fault::application("denied", Some(Bytes::from_static(b"detail"))),
        });
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code(), RpcResultCode::ApplicationFault);
        assert_eq!(err.fault().unwrap().payload.as_deref(), Some(&b"detail"[..]));
    }

    #[tokio::test]
    async fn test_stream_message_for_unary_call_is_violation() {
        let d = dispatcher();
        let (id, rx) = d.register(CallKind::Unary).unwrap();
        let (other, mut other_rx) = d.register(CallKind::Unary).unwrap();

        d.route(Envelope::StreamAck { call_id: id, count: 1 });
        assert_eq!(rx.await.unwrap().unwrap_err().code(), RpcResultCode::ProtocolViolation);
        assert!(other_rx.try_recv().is_err(), "other calls are unaffected");
        assert_eq!(d.pending_count(), 1);
        d.unregister(other);
    }

    #[tokio::test]
    async fn test_stream_call_retired_whichever_side_finishes_last() {
        let d = dispatcher();

        // reply first: the entry waits for its owner, cancellation retires it
        let (id, rx) = d.register(CallKind::Stream).unwrap();
        d.route(response(id, b"done"));
        assert_eq!(rx.await.unwrap().unwrap(), "done");
        assert_eq!(d.pending_count(), 1);
        assert!(!d.mark_cancelled(id));
        assert_eq!(d.pending_count(), 0);

        // cancellation first: the peer's reply retires it
        let (id, rx) = d.register(CallKind::Stream).unwrap();
        assert!(d.mark_cancelled(id));
        assert_eq!(rx.await.unwrap().unwrap_err().code(), RpcResultCode::Cancelled);
        assert_eq!(d.pending_count(), 1);
        d.route(Envelope::Fault {
            call_id: id,
            fault: Fault::new(FaultCode::Cancelled, "stopped"),
        });
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_and_refuses() {
        let d = dispatcher();
        let (_, rx1) = d.register(CallKind::Unary).unwrap();
        let (_, rx2) = d.register(CallKind::Stream).unwrap();

        d.close(RpcError::channel_closed());
        assert_eq!(rx1.await.unwrap().unwrap_err().code(), RpcResultCode::ChannelClosed);
        assert_eq!(rx2.await.unwrap().unwrap_err().code(), RpcResultCode::ChannelClosed);
        assert_eq!(
            d.register(CallKind::Unary).unwrap_err().code(),
            RpcResultCode::ChannelClosed
        );
    }

    #[tokio::test]
    async fn test_stream_control_reaches_stream() {
        let d = dispatcher();
        let (id, _rx) = d.register(CallKind::Stream).unwrap();
        let (shared, _) = StreamShared::new(id, d.tx.clone(), CodecKind::Cbor, 1 << 20, true, None);
        d.attach_stream(id, &shared);

        d.route(Envelope::StreamOpen {
            call_id: id,
            method: 1,
            mode: rpc_wire::StreamMode::ClientStreaming,
            window: 3,
            payload: Bytes::new(),
        });
        assert_eq!(shared.writer_state(), crate::stream::StreamState::Open);

        d.route(Envelope::StreamCancel { call_id: id });
        assert_eq!(shared.writer_state(), crate::stream::StreamState::Aborted);
        assert_eq!(shared.abort_reason().unwrap().code(), RpcResultCode::StreamAborted);
    }

    #[tokio::test]
    async fn test_incoming_duplicate_and_cancel() {
        let d = dispatcher();
        let parent = CancellationToken::new();
        let token = d.accept_incoming(9, None, &parent).unwrap();
        assert_eq!(
            d.accept_incoming(9, None, &parent).unwrap_err().code(),
            RpcResultCode::ProtocolViolation
        );
        assert!(d.cancel_incoming(9));
        assert!(token.is_cancelled());
        d.finish_incoming(9);
        assert_eq!(d.incoming_count(), 0);
    }
}
