//! Transmit buffer packing framed messages into transport segments.
//!
//! Any number of tasks may enqueue messages; enqueueing takes the transmit
//! lock only for the time it takes to copy the frames and never waits. A
//! single send loop pulls sealed segments with [`TxBuffer::dequeue_next`] /
//! [`TxBuffer::return_and_dequeue`], suspending while nothing is ready.
//!
//! Messages are chunked purely by byte count: a frame starts in the active
//! segment whenever it has room for a header and at least one body byte,
//! so a message only maps onto a single frame when it fits.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::frame::{check_segment_size, chunk_flags};
use crate::header::{FrameHeader, MessageClass, FRAME_HEADER_SIZE};
use crate::WireError;

/// Returned segments kept for reuse
const MAX_SPARE_SEGMENTS: usize = 8;

/// Lock guarding the transmit state. Owned by the channel and handed to
/// its [`TxBuffer`].
pub type TxLock = Arc<Mutex<TxState>>;

/// Message serialized once and copied into any number of transmit buffers
#[derive(Debug, Clone)]
pub struct PrebuiltMessage {
    class: MessageClass,
    parts: Vec<Bytes>,
    len: usize,
}

impl PrebuiltMessage {
    /// Build from body segments produced by a serializer
    pub fn new(class: MessageClass, parts: Vec<Bytes>) -> Self {
        let len = parts.iter().map(Bytes::len).sum();
        Self { class, parts, len }
    }

    /// Build from a contiguous body
    pub fn from_body(class: MessageClass, body: Bytes) -> Self {
        Self::new(class, vec![body])
    }

    /// Message class
    pub fn class(&self) -> MessageClass {
        self.class
    }

    /// Total body length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the body is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Segment queue state protected by the [`TxLock`]
#[derive(Debug)]
pub struct TxState {
    max_segment_size: usize,
    active: BytesMut,
    ready: VecDeque<BytesMut>,
    spare: Vec<BytesMut>,
    closed: bool,
}

impl TxState {
    /// Create an empty state producing segments of at most `max_segment_size`
    pub fn new(max_segment_size: usize) -> Result<Self, WireError> {
        check_segment_size(max_segment_size)?;
        Ok(Self {
            max_segment_size,
            active: BytesMut::with_capacity(max_segment_size),
            ready: VecDeque::new(),
            spare: Vec::new(),
            closed: false,
        })
    }

    /// Wrap a new state into a lock handle
    pub fn shared(max_segment_size: usize) -> Result<TxLock, WireError> {
        Ok(Arc::new(Mutex::new(Self::new(max_segment_size)?)))
    }

    /// Segment size currently in effect
    pub fn max_segment_size(&self) -> usize {
        self.max_segment_size
    }

    /// Change the segment size; the active segment is sealed first
    pub fn set_max_segment_size(&mut self, max_segment_size: usize) -> Result<(), WireError> {
        check_segment_size(max_segment_size)?;
        self.seal_active();
        self.max_segment_size = max_segment_size;
        Ok(())
    }

    /// Whether no data is waiting to be sent
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.active.is_empty()
    }

    fn space_left(&self) -> usize {
        self.max_segment_size.saturating_sub(self.active.len())
    }

    fn seal_active(&mut self) {
        if self.active.is_empty() {
            return;
        }
        let fresh = self
            .spare
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.max_segment_size));
        let sealed = std::mem::replace(&mut self.active, fresh);
        self.ready.push_back(sealed);
    }

    fn take_ready(&mut self) -> Option<BytesMut> {
        if self.ready.is_empty() {
            self.seal_active();
        }
        self.ready.pop_front()
    }

    fn recycle(&mut self, mut segment: BytesMut) {
        if self.spare.len() < MAX_SPARE_SEGMENTS {
            segment.clear();
            self.spare.push(segment);
        }
    }

    /// Frame `parts` (one logical body) into the segment queue
    fn write_parts(&mut self, class: MessageClass, parts: &[&[u8]]) -> Result<usize, WireError> {
        if self.closed {
            return Err(WireError::Closed);
        }

        let mut remaining: usize = parts.iter().map(|p| p.len()).sum();
        let mut part_idx = 0;
        let mut part_off = 0;
        let mut first = true;
        let mut frames = 0;

        loop {
            let min_frame = if remaining == 0 {
                FRAME_HEADER_SIZE
            } else {
                FRAME_HEADER_SIZE + 1
            };
            if self.space_left() < min_frame {
                self.seal_active();
            }

            let take = (self.space_left() - FRAME_HEADER_SIZE).min(remaining);
            let last = take == remaining;
            FrameHeader::new(chunk_flags(class, first, last), take).encode(&mut self.active);

            let mut copied = 0;
            while copied < take {
                let part = parts[part_idx];
                let n = (part.len() - part_off).min(take - copied);
                self.active.extend_from_slice(&part[part_off..part_off + n]);
                copied += n;
                part_off += n;
                if part_off == part.len() {
                    part_idx += 1;
                    part_off = 0;
                }
            }

            remaining -= take;
            first = false;
            frames += 1;

            if self.space_left() == 0 {
                self.seal_active();
            }
            if last {
                break;
            }
        }

        Ok(frames)
    }
}

/// Transmit buffer shared between message producers and the send loop
#[derive(Debug)]
pub struct TxBuffer {
    state: TxLock,
    ready: Notify,
}

impl TxBuffer {
    /// Create a transmit buffer guarded by the given lock
    pub fn new(state: TxLock) -> Self {
        Self {
            state,
            ready: Notify::new(),
        }
    }

    /// The lock guarding this buffer
    pub fn lock(&self) -> &TxLock {
        &self.state
    }

    /// Serialize one message body into frames; returns the frame count
    pub fn write_message(&self, class: MessageClass, body: &[u8]) -> Result<usize, WireError> {
        let frames = self.state.lock().write_parts(class, &[body])?;
        trace!("Queued {:?} message: {} bytes in {} frames", class, body.len(), frames);
        self.ready.notify_one();
        Ok(frames)
    }

    /// Copy a prebuilt message, chunked against this buffer's segment size
    pub fn write_prebuilt(&self, message: &PrebuiltMessage) -> Result<usize, WireError> {
        let parts: Vec<&[u8]> = message.parts.iter().map(|p| p.as_ref()).collect();
        let frames = self.state.lock().write_parts(message.class, &parts)?;
        self.ready.notify_one();
        Ok(frames)
    }

    /// Change the outgoing segment size
    pub fn set_max_segment_size(&self, max_segment_size: usize) -> Result<(), WireError> {
        self.state.lock().set_max_segment_size(max_segment_size)
    }

    /// Segment size in effect
    pub fn max_segment_size(&self) -> usize {
        self.state.lock().max_segment_size()
    }

    /// Refuse further writes; queued data remains available to the send loop
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_one();
    }

    /// Drop queued data and refuse further writes
    pub fn abort(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.ready.clear();
            state.active.clear();
        }
        self.ready.notify_one();
    }

    /// Whether the buffer refuses writes
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Next sealed segment, suspending while none is ready.
    ///
    /// Fails with [`WireError::Closed`] once the buffer is closed and fully
    /// drained, or [`WireError::Cancelled`] when `cancel` fires.
    pub async fn dequeue_next(&self, cancel: &CancellationToken) -> Result<BytesMut, WireError> {
        loop {
            let notified = self.ready.notified();
            {
                let mut state = self.state.lock();
                if let Some(segment) = state.take_ready() {
                    return Ok(segment);
                }
                if state.closed {
                    return Err(WireError::Closed);
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(WireError::Cancelled),
            }
        }
    }

    /// Hand back a written segment for reuse and fetch the next one
    pub async fn return_and_dequeue(
        &self,
        used: BytesMut,
        cancel: &CancellationToken,
    ) -> Result<BytesMut, WireError> {
        self.state.lock().recycle(used);
        self.dequeue_next(cancel).await
    }
}
