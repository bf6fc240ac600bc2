//! Flow-controlled item streams layered on a call.
//!
//! Each active direction of a streaming call has a window: the number of
//! items the writer may have in flight before the reader acknowledges them.
//! The writer holds one semaphore permit per item it may still send. The
//! semaphore starts empty and is filled with the peer's window once the
//! open exchange confirms it, so no item leaves before the peer allocated
//! room for it.
//!
//! ```text
//!   writer                                   reader
//!     | -- StreamPage{items} ------------------> |  queue
//!     | <------------------ StreamAck{count} --- |  consumed
//!     | -- StreamClose ------------------------> |  ends after drain
//!     | <----------------------- StreamCloseAck  |
//! ```

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use rpc_wire::{Codec, CodecKind, Envelope, MessageClass, TxBuffer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dispatcher::{post, Dispatcher};
use crate::result::{RpcError, RpcResult, RpcResultCode};

/// Lifecycle of one stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Items may flow
    Open,
    /// Writer sent its close and waits for the acknowledgement
    Completing,
    /// Orderly end
    Closed,
    /// Aborted locally, by the peer or by the channel
    Aborted,
}

impl StreamState {
    /// Whether the direction reached a terminal state
    pub fn is_settled(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Aborted)
    }
}

#[derive(Debug)]
struct FlowState {
    writer_enabled: bool,
    unacked: u32,
    reader_window: u32,
    outstanding: u32,
    consumed_unacked: u32,
    items: Option<mpsc::UnboundedSender<Bytes>>,
    abort: Option<RpcError>,
}

/// State shared by the call owner, its reader/writer handles and the
/// dispatcher routing table
#[derive(Debug)]
pub(crate) struct StreamShared {
    call_id: u64,
    tx: Arc<TxBuffer>,
    codec: CodecKind,
    max_message_size: usize,
    credits: Semaphore,
    flow: Mutex<FlowState>,
    writer_state: watch::Sender<StreamState>,
    reader_state: watch::Sender<StreamState>,
}

impl StreamShared {
    /// Create stream state. `reader_window` is `None` when the local side
    /// never reads.
    pub(crate) fn new(
        call_id: u64,
        tx: Arc<TxBuffer>,
        codec: CodecKind,
        max_message_size: usize,
        writes: bool,
        reader_window: Option<u32>,
    ) -> (Arc<Self>, Option<mpsc::UnboundedReceiver<Bytes>>) {
        let (items, rx) = match reader_window {
            Some(_) => {
                let (items, rx) = mpsc::unbounded_channel();
                (Some(items), Some(rx))
            }
            None => (None, None),
        };
        let initial = |active: bool| if active { StreamState::Open } else { StreamState::Closed };

        let shared = Arc::new(Self {
            call_id,
            tx,
            codec,
            max_message_size,
            credits: Semaphore::new(0),
            flow: Mutex::new(FlowState {
                writer_enabled: false,
                unacked: 0,
                reader_window: reader_window.unwrap_or(0),
                outstanding: 0,
                consumed_unacked: 0,
                items,
                abort: None,
            }),
            writer_state: watch::Sender::new(initial(writes)),
            reader_state: watch::Sender::new(initial(reader_window.is_some())),
        });
        (shared, rx)
    }

    pub(crate) fn call_id(&self) -> u64 {
        self.call_id
    }

    pub(crate) fn writer_state(&self) -> StreamState {
        *self.writer_state.borrow()
    }

    pub(crate) fn reader_state(&self) -> StreamState {
        *self.reader_state.borrow()
    }

    pub(crate) fn abort_reason(&self) -> Option<RpcError> {
        self.flow.lock().abort.clone()
    }

    /// Grant the writer the peer's window
    pub(crate) fn enable_writer(&self, window: u32) {
        let mut flow = self.flow.lock();
        if flow.writer_enabled {
            debug!(call_id = self.call_id, "Duplicate stream open confirmation ignored");
            return;
        }
        flow.writer_enabled = true;
        if self.writer_state() == StreamState::Open {
            self.credits.add_permits(window as usize);
        }
        trace!(call_id = self.call_id, window, "Stream writer enabled");
    }

    pub(crate) fn on_page(&self, items: Vec<Bytes>) -> RpcResult<()> {
        let discarded = self.accept_page(items)?;
        if discarded > 0 {
            trace!(call_id = self.call_id, discarded, "Items for dropped reader acknowledged");
            self.send_ack(discarded);
        }
        Ok(())
    }

    /// Queue a page for the reader. Returns how many items were discarded
    /// because the reader is gone.
    fn accept_page(&self, items: Vec<Bytes>) -> RpcResult<u32> {
        let mut flow = self.flow.lock();
        match self.reader_state() {
            StreamState::Aborted => {
                trace!(call_id = self.call_id, "Page for aborted stream dropped");
                return Ok(0);
            }
            StreamState::Open => {}
            state => {
                return Err(RpcError::protocol(format!(
                    "stream page received in reader state {:?}",
                    state
                )));
            }
        }

        let n = items.len() as u32;
        flow.outstanding = flow.outstanding.saturating_add(n);
        if flow.outstanding > flow.reader_window {
            return Err(RpcError::protocol(format!(
                "peer exceeded stream window ({} > {})",
                flow.outstanding, flow.reader_window
            )));
        }
        let mut discarded = 0;
        if let Some(sender) = &flow.items {
            for item in items {
                if sender.send(item).is_err() {
                    discarded += 1;
                }
            }
        }
        flow.outstanding -= discarded;
        Ok(discarded)
    }

    pub(crate) fn on_ack(&self, count: u32) {
        let mut flow = self.flow.lock();
        if count > flow.unacked {
            debug!(
                call_id = self.call_id,
                count,
                unacked = flow.unacked,
                "Stream ack exceeds items in flight"
            );
        }
        let n = count.min(flow.unacked);
        flow.unacked -= n;
        if self.writer_state() == StreamState::Open {
            self.credits.add_permits(n as usize);
        }
    }

    /// Peer writer finished; buffered items stay readable
    pub(crate) fn on_close(&self) {
        {
            let mut flow = self.flow.lock();
            flow.items = None;
        }
        self.reader_state.send_if_modified(|state| {
            if *state == StreamState::Open {
                *state = StreamState::Closed;
                true
            } else {
                false
            }
        });
        if let Err(e) = post(&self.tx, &Envelope::StreamCloseAck { call_id: self.call_id }) {
            debug!(call_id = self.call_id, "Cannot acknowledge stream close: {}", e);
        }
    }

    pub(crate) fn on_close_ack(&self) {
        self.writer_state.send_if_modified(|state| {
            if *state == StreamState::Completing {
                *state = StreamState::Closed;
                true
            } else {
                false
            }
        });
    }

    /// Force both directions to `Aborted`. Returns false when already aborted.
    pub(crate) fn abort(&self, reason: RpcError) -> bool {
        {
            let mut flow = self.flow.lock();
            if flow.abort.is_some() {
                return false;
            }
            debug!(call_id = self.call_id, "Stream aborted: {}", reason);
            flow.abort = Some(reason);
            flow.items = None;
        }
        self.credits.close();
        self.writer_state.send_replace(StreamState::Aborted);
        self.reader_state.send_replace(StreamState::Aborted);
        true
    }

    /// Abort and tell the peer
    pub(crate) fn abort_and_notify(&self, reason: RpcError) {
        if self.abort(reason) {
            if let Err(e) = post(&self.tx, &Envelope::StreamCancel { call_id: self.call_id }) {
                debug!(call_id = self.call_id, "Cannot send stream cancel: {}", e);
            }
        }
    }

    fn closed_error(&self) -> RpcError {
        self.abort_reason()
            .unwrap_or_else(|| RpcError::new(RpcResultCode::StreamAborted, "stream aborted"))
    }

    fn check_writable(&self) -> RpcResult<()> {
        match self.writer_state() {
            StreamState::Open => Ok(()),
            StreamState::Aborted => Err(self.closed_error()),
            StreamState::Completing | StreamState::Closed => {
                Err(RpcError::invalid_state("stream writer already completed"))
            }
        }
    }

    async fn acquire_one(&self, cancel: Option<&CancellationToken>) -> RpcResult<()> {
        let permit = match cancel {
            Some(cancel) => tokio::select! {
                permit = self.credits.acquire() => permit,
                _ = cancel.cancelled() => return Err(RpcError::cancelled()),
            },
            None => self.credits.acquire().await,
        };
        match permit {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(self.check_writable().err().unwrap_or_else(|| self.closed_error())),
        }
    }

    fn send_page(&self, items: Vec<Bytes>) -> RpcResult<()> {
        self.check_writable()?;
        let n = items.len() as u32;
        let page = Envelope::StreamPage {
            call_id: self.call_id,
            items,
        };
        let body = page.to_bytes();
        if body.len() > self.max_message_size {
            return Err(RpcError::new(
                RpcResultCode::SerializationError,
                format!("stream page of {} bytes exceeds message limit", body.len()),
            ));
        }
        self.flow.lock().unacked += n;
        self.tx
            .write_message(MessageClass::User, &body)
            .map_err(RpcError::from)?;
        trace!(call_id = self.call_id, items = n, "Stream page sent");
        Ok(())
    }

    /// Send items, suspending whenever the window is exhausted
    pub(crate) async fn write_items(
        &self,
        items: Vec<Bytes>,
        cancel: Option<&CancellationToken>,
    ) -> RpcResult<()> {
        self.check_writable()?;

        let mut page = Vec::new();
        for item in items {
            match self.credits.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    if !page.is_empty() {
                        self.send_page(std::mem::take(&mut page))?;
                    }
                    self.acquire_one(cancel).await?;
                }
            }
            page.push(item);
        }
        if !page.is_empty() {
            self.send_page(page)?;
        }
        Ok(())
    }

    /// Send the writer's close and wait for the peer to acknowledge it
    pub(crate) async fn complete_writer(&self) -> RpcResult<()> {
        let started = self.writer_state.send_if_modified(|state| {
            if *state == StreamState::Open {
                *state = StreamState::Completing;
                true
            } else {
                false
            }
        });
        if started {
            self.credits.close();
            if let Err(e) = post(&self.tx, &Envelope::StreamClose { call_id: self.call_id }) {
                self.abort(e.clone());
                return Err(e);
            }
        }

        let mut state = self.writer_state.subscribe();
        let _ = state.wait_for(|s| s.is_settled()).await;
        let settled = *state.borrow();
        match settled {
            StreamState::Aborted => Err(self.closed_error()),
            _ => Ok(()),
        }
    }

    /// Wait until both directions reached a terminal state
    pub(crate) async fn wait_settled(&self) {
        let mut writer = self.writer_state.subscribe();
        let mut reader = self.reader_state.subscribe();
        let _ = writer.wait_for(|s| s.is_settled()).await;
        let _ = reader.wait_for(|s| s.is_settled()).await;
    }

    /// Record one item handed to the consumer and acknowledge when due
    fn consumed(&self, queue_empty: bool) {
        let count = {
            let mut flow = self.flow.lock();
            flow.consumed_unacked += 1;
            let threshold = (flow.reader_window / 2).max(1);
            if flow.consumed_unacked < threshold && !queue_empty {
                return;
            }
            let count = flow.consumed_unacked;
            flow.consumed_unacked = 0;
            flow.outstanding = flow.outstanding.saturating_sub(count);
            count
        };

        self.send_ack(count);
    }

    /// Acknowledge what a dropped reader left behind so the peer writer
    /// keeps its window
    fn reader_dropped(&self, drained: u32) {
        let count = {
            let mut flow = self.flow.lock();
            let count = drained + flow.consumed_unacked;
            flow.consumed_unacked = 0;
            flow.outstanding = flow.outstanding.saturating_sub(count);
            count
        };
        if count > 0 {
            trace!(call_id = self.call_id, count, "Reader dropped, unread items acknowledged");
            self.send_ack(count);
        }
    }

    fn send_ack(&self, count: u32) {
        if self.reader_state() != StreamState::Open {
            return;
        }
        if let Err(e) = post(&self.tx, &Envelope::StreamAck {
            call_id: self.call_id,
            count,
        }) {
            debug!(call_id = self.call_id, "Cannot send stream ack: {}", e);
        }
    }
}

/// Sending half of a stream
#[derive(Debug)]
pub struct StreamWriter {
    shared: Arc<StreamShared>,
}

impl StreamWriter {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    /// Call the stream belongs to
    pub fn call_id(&self) -> u64 {
        self.shared.call_id()
    }

    /// Current writer state
    pub fn state(&self) -> StreamState {
        self.shared.writer_state()
    }

    /// Items that can be written without suspending
    pub fn available_window(&self) -> usize {
        self.shared.credits.available_permits()
    }

    /// Write one item, suspending while the window is full
    pub async fn write(&self, item: Bytes) -> RpcResult<()> {
        self.shared.write_items(vec![item], None).await
    }

    /// Write one item; `cancel` unblocks a suspended write
    pub async fn write_with_cancel(&self, item: Bytes, cancel: &CancellationToken) -> RpcResult<()> {
        self.shared.write_items(vec![item], Some(cancel)).await
    }

    /// Write items, batching as many per page as the window allows
    pub async fn write_batch(&self, items: Vec<Bytes>) -> RpcResult<()> {
        self.shared.write_items(items, None).await
    }

    /// Serialize and write one item with the channel codec
    pub async fn send<T: Serialize>(&self, item: &T) -> RpcResult<()> {
        let bytes = Codec::serialize(&self.shared.codec, item)?;
        self.write(bytes).await
    }

    /// Finish the direction and wait for the peer's acknowledgement
    pub async fn complete(&self) -> RpcResult<()> {
        self.shared.complete_writer().await
    }
}

/// Receiving half of a stream, also usable as a [`futures::Stream`]
#[derive(Debug)]
pub struct StreamReader {
    shared: Arc<StreamShared>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl StreamReader {
    pub(crate) fn new(shared: Arc<StreamShared>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { shared, rx }
    }

    /// Call the stream belongs to
    pub fn call_id(&self) -> u64 {
        self.shared.call_id()
    }

    /// Current reader state
    pub fn state(&self) -> StreamState {
        self.shared.reader_state()
    }

    /// Next item; `Ok(None)` after the peer closed and the queue drained
    pub async fn next(&mut self) -> RpcResult<Option<Bytes>> {
        if let Some(err) = self.shared.abort_reason() {
            return Err(err);
        }
        match self.rx.recv().await {
            Some(item) => {
                self.shared.consumed(self.rx.is_empty());
                Ok(Some(item))
            }
            None => match self.shared.abort_reason() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Next item decoded with the channel codec
    pub async fn next_item<T: DeserializeOwned>(&mut self) -> RpcResult<Option<T>> {
        match self.next().await? {
            Some(bytes) => Ok(Some(self.shared.codec.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drain the stream into a vector
    pub async fn collect_all(&mut self) -> RpcResult<Vec<Bytes>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.rx.close();
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        self.shared.reader_dropped(drained);
    }
}

impl Stream for StreamReader {
    type Item = RpcResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(err) = self.shared.abort_reason() {
            return Poll::Ready(Some(Err(err)));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                let empty = self.rx.is_empty();
                self.shared.consumed(empty);
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(None) => Poll::Ready(self.shared.abort_reason().map(Err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Client handle of a streaming call.
///
/// Dropping the handle without [`StreamCall::finish`] aborts the stream and
/// tells the peer.
#[derive(Debug)]
pub struct StreamCall {
    shared: Arc<StreamShared>,
    dispatcher: Arc<Dispatcher>,
    response: Option<oneshot::Receiver<RpcResult<Bytes>>>,
    writer: Option<StreamWriter>,
    reader: Option<StreamReader>,
    finished: bool,
}

impl StreamCall {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        dispatcher: Arc<Dispatcher>,
        response: oneshot::Receiver<RpcResult<Bytes>>,
        writes: bool,
        rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    ) -> Self {
        let writer = writes.then(|| StreamWriter::new(shared.clone()));
        let reader = rx.map(|rx| StreamReader::new(shared.clone(), rx));
        Self {
            shared,
            dispatcher,
            response: Some(response),
            writer,
            reader,
            finished: false,
        }
    }

    /// Call id
    pub fn call_id(&self) -> u64 {
        self.shared.call_id()
    }

    /// Borrow the writer, when the call writes and it was not taken
    pub fn writer(&self) -> Option<&StreamWriter> {
        self.writer.as_ref()
    }

    /// Borrow the reader, when the call reads and it was not taken
    pub fn reader(&mut self) -> Option<&mut StreamReader> {
        self.reader.as_mut()
    }

    /// Move the writer out, e.g. into a producer task
    pub fn take_writer(&mut self) -> Option<StreamWriter> {
        self.writer.take()
    }

    /// Move the reader out, e.g. into a consumer task
    pub fn take_reader(&mut self) -> Option<StreamReader> {
        self.reader.take()
    }

    /// Complete the writer, await the call result and let both directions
    /// settle before retiring the call id. Items the held reader did not
    /// consume are discarded.
    pub async fn finish(mut self) -> RpcResult<Bytes> {
        self.finished = true;
        let call_id = self.shared.call_id();
        drop(self.reader.take());

        if let Err(e) = self.shared.complete_writer().await {
            debug!(call_id, "Stream writer ended with {}", e);
        }

        let result = match self.response.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(RpcError::channel_closed())),
            None => Err(RpcError::invalid_state("stream call already finished")),
        };

        match &result {
            Ok(_) => self.shared.wait_settled().await,
            Err(e) => {
                self.shared.abort(e.clone());
            }
        }
        self.dispatcher.unregister(call_id);
        result
    }

    /// Finish and decode the result with the channel codec
    pub async fn finish_typed<T: DeserializeOwned>(self) -> RpcResult<T> {
        let codec = self.shared.codec;
        let bytes = self.finish().await?;
        Ok(codec.deserialize(&bytes)?)
    }

    /// Abort the call and tell the peer. The call id is retired once the
    /// peer's reply arrives, or immediately when it already did.
    pub fn cancel(mut self) {
        debug!(call_id = self.call_id(), "Stream call cancelled");
        self.abandon();
    }

    fn abandon(&mut self) {
        self.finished = true;
        self.shared.abort_and_notify(RpcError::cancelled());
        self.dispatcher.mark_cancelled(self.shared.call_id());
    }
}

impl Drop for StreamCall {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(call_id = self.call_id(), "Stream call dropped before finish, aborting");
        self.abandon();
    }
}

/// Server view of a streaming call
#[derive(Debug)]
pub struct ServerStream {
    call_id: u64,
    reader: Option<StreamReader>,
    writer: Option<StreamWriter>,
}

impl ServerStream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        writes: bool,
        rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    ) -> Self {
        Self {
            call_id: shared.call_id(),
            writer: writes.then(|| StreamWriter::new(shared.clone())),
            reader: rx.map(|rx| StreamReader::new(shared, rx)),
        }
    }

    /// Call id
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Move the reader out; `None` when the client does not write
    pub fn take_reader(&mut self) -> Option<StreamReader> {
        self.reader.take()
    }

    /// Move the writer out; `None` when the server does not write
    pub fn take_writer(&mut self) -> Option<StreamWriter> {
        self.writer.take()
    }

    /// Split into both halves
    pub fn into_parts(self) -> (Option<StreamReader>, Option<StreamWriter>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_wire::{MessageParser, ParseStatus, TxState};
    use std::time::Duration;

    fn tx() -> Arc<TxBuffer> {
        Arc::new(TxBuffer::new(TxState::shared(1024).unwrap()))
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

    fn duplex(tx: &Arc<TxBuffer>, window: u32) -> (Arc<StreamShared>, StreamReader, StreamWriter) {
        let (shared, rx) = StreamShared::new(5, tx.clone(), CodecKind::Cbor, 1 << 20, true, Some(window));
        let reader = StreamReader::new(shared.clone(), rx.unwrap());
        let writer = StreamWriter::new(shared.clone());
        (shared, reader, writer)
    }

    #[tokio::test]
    async fn test_writer_waits_for_open_confirmation() {
        let tx = tx();
        let (shared, _reader, writer) = duplex(&tx, 4);

        let early = tokio::time::timeout(Duration::from_millis(20), writer.write(Bytes::from_static(b"x"))).await;
        assert!(early.is_err(), "write must suspend before the window is granted");
        assert!(sent(&tx).await.is_empty());

        shared.enable_writer(2);
        writer.write(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(writer.available_window(), 1);
    }

    #[tokio::test]
    async fn test_window_suspends_until_ack() {
        let tx = tx();
        let (shared, _reader, writer) = duplex(&tx, 4);
        shared.enable_writer(2);

        writer.write(Bytes::from_static(b"a")).await.unwrap();
        writer.write(Bytes::from_static(b"b")).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(20), writer.write(Bytes::from_static(b"c"))).await;
        assert!(blocked.is_err());

        shared.on_ack(1);
        writer.write(Bytes::from_static(b"c")).await.unwrap();

        let pages: Vec<_> = sent(&tx)
            .await
            .into_iter()
            .filter(|e| matches!(e, Envelope::StreamPage { .. }))
            .collect();
        assert_eq!(pages.len(), 3);
    }

    #[tokio::test]
    async fn test_batch_uses_available_window_per_page() {
        let tx = tx();
        let (shared, _reader, writer) = duplex(&tx, 4);
        shared.enable_writer(3);

        let items: Vec<Bytes> = (0..3u8).map(|i| Bytes::from(vec![i])).collect();
        writer.write_batch(items).await.unwrap();

        let envelopes = sent(&tx).await;
        assert_eq!(envelopes.len(), 1);
        match &envelopes[0] {
            Envelope::StreamPage { items, .. } => assert_eq!(items.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_fails_suspended_write() {
        let tx = tx();
        let (shared, _reader, writer) = duplex(&tx, 4);
        shared.enable_writer(0);

        let pending = tokio::spawn(async move { writer.write(Bytes::from_static(b"x")).await });
        tokio::task::yield_now().await;
        shared.abort(RpcError::new(RpcResultCode::StreamAborted, "peer cancelled"));

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.code(), RpcResultCode::StreamAborted);
        assert_eq!(shared.writer_state(), StreamState::Aborted);
        assert_eq!(shared.reader_state(), StreamState::Aborted);
    }

    #[tokio::test]
    async fn test_cancel_token_unblocks_write() {
        let tx = tx();
        let (shared, _reader, writer) = duplex(&tx, 4);
        shared.enable_writer(0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = writer.write_with_cancel(Bytes::from_static(b"x"), &cancel).await.unwrap_err();
        assert_eq!(err.code(), RpcResultCode::Cancelled);
    }

    #[tokio::test]
    async fn test_reader_drains_before_end() {
        let tx = tx();
        let (shared, mut reader, _writer) = duplex(&tx, 4);

        shared
            .on_page(vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")])
            .unwrap();
        shared.on_close();
        assert_eq!(shared.reader_state(), StreamState::Closed);

        assert_eq!(reader.next().await.unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(reader.next().await.unwrap(), Some(Bytes::from_static(b"2")));
        assert_eq!(reader.next().await.unwrap(), None);

        let envelopes = sent(&tx).await;
        assert!(envelopes.contains(&Envelope::StreamCloseAck { call_id: 5 }));
    }

    #[tokio::test]
    async fn test_acks_never_exceed_delivered() {
        let tx = tx();
        let (shared, mut reader, _writer) = duplex(&tx, 4);

        let items: Vec<Bytes> = (0..4u8).map(|i| Bytes::from(vec![i])).collect();
        shared.on_page(items).unwrap();

        reader.next().await.unwrap();
        assert!(sent(&tx).await.is_empty(), "below threshold, queue not empty");
        reader.next().await.unwrap();

        let acked: u32 = sent(&tx)
            .await
            .iter()
            .map(|e| match e {
                Envelope::StreamAck { count, .. } => *count,
                _ => 0,
            })
            .sum();
        assert_eq!(acked, 2);
    }

    #[tokio::test]
    async fn test_window_violation() {
        let tx = tx();
        let (shared, _reader, _writer) = duplex(&tx, 2);
        let items: Vec<Bytes> = (0..3u8).map(|i| Bytes::from(vec![i])).collect();
        let err = shared.on_page(items).unwrap_err();
        assert_eq!(err.code(), RpcResultCode::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_complete_waits_for_close_ack() {
        let tx = tx();
        let (shared, _reader, writer) = duplex(&tx, 2);
        shared.enable_writer(2);

        let completing = tokio::spawn(async move { writer.complete().await });
        tokio::task::yield_now().await;
        assert_eq!(shared.writer_state(), StreamState::Completing);
        assert!(sent(&tx).await.contains(&Envelope::StreamClose { call_id: 5 }));

        shared.on_close_ack();
        completing.await.unwrap().unwrap();
        assert_eq!(shared.writer_state(), StreamState::Closed);
    }
}
