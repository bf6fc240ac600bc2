//! Resumable reassembly of chunked frames into logical messages.
//!
//! The parser is fed one transport buffer at a time through
//! [`MessageParser::set_next_segment`] and advanced with
//! [`MessageParser::parse_further`] until it reports
//! [`ParseStatus::EndOfSegment`]. Header bytes split across buffers are
//! kept between calls; body bytes are collected as zero-copy slices of the
//! caller's buffers until the frame flagged `END_OF_MESSAGE` arrives.

use bytes::{Buf, Bytes, BytesMut};
use smallvec::SmallVec;
use tracing::trace;

use crate::header::{FrameHeader, MessageClass, FRAME_HEADER_SIZE, MAX_SEGMENT_SIZE};
use crate::WireError;

/// Default limit for a reassembled message (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Outcome of one [`MessageParser::parse_further`] step
#[derive(Debug)]
pub enum ParseStatus {
    /// Current input buffer is exhausted, feed the next one
    EndOfSegment,
    /// A complete logical message was reassembled
    MessageParsed(ParsedMessage),
}

/// A reassembled logical message
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    class: MessageClass,
    spans: SmallVec<[Bytes; 4]>,
    len: usize,
}

impl ParsedMessage {
    /// Message class taken from the first frame
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

    /// Body spans in arrival order, each referencing an input buffer
    pub fn spans(&self) -> &[Bytes] {
        &self.spans
    }

    /// Contiguous body; copies only when the body spans several frames
    pub fn to_bytes(&self) -> Bytes {
        match self.spans.len() {
            0 => Bytes::new(),
            1 => self.spans[0].clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.len);
                for span in &self.spans {
                    buf.extend_from_slice(span);
                }
                buf.freeze()
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    AwaitingHeader,
    AwaitingBody { remaining: usize, last: bool },
}

/// Frame-to-message reassembly state machine
#[derive(Debug)]
pub struct MessageParser {
    state: State,
    header_buf: [u8; FRAME_HEADER_SIZE],
    header_len: usize,
    segment: Bytes,
    message: Option<ParsedMessage>,
    max_segment_size: usize,
    max_message_size: usize,
}

impl MessageParser {
    /// Create a parser accepting frames up to `max_segment_size` bytes
    pub fn new(max_segment_size: usize) -> Self {
        Self {
            state: State::AwaitingHeader,
            header_buf: [0; FRAME_HEADER_SIZE],
            header_len: 0,
            segment: Bytes::new(),
            message: None,
            max_segment_size: max_segment_size.min(MAX_SEGMENT_SIZE),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Set the reassembled message size limit
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Hand the next transport buffer to the parser
    pub fn set_next_segment(&mut self, segment: Bytes) {
        if self.segment.is_empty() {
            self.segment = segment;
        } else {
            // previous buffer not drained; keep both in order
            let mut joined = BytesMut::with_capacity(self.segment.len() + segment.len());
            joined.extend_from_slice(&self.segment);
            joined.extend_from_slice(&segment);
            self.segment = joined.freeze();
        }
    }

    /// Whether the parser sits exactly on a message boundary
    pub fn is_idle(&self) -> bool {
        self.message.is_none()
            && self.header_len == 0
            && matches!(self.state, State::AwaitingHeader)
            && self.segment.is_empty()
    }

    /// Drop all partial state
    pub fn reset(&mut self) {
        self.state = State::AwaitingHeader;
        self.header_len = 0;
        self.segment = Bytes::new();
        self.message = None;
    }

    /// Advance over the current buffer until a message completes or the
    /// buffer runs out
    pub fn parse_further(&mut self) -> Result<ParseStatus, WireError> {
        loop {
            match self.state {
                State::AwaitingHeader => {
                    if self.segment.is_empty() {
                        return Ok(ParseStatus::EndOfSegment);
                    }

                    let take = (FRAME_HEADER_SIZE - self.header_len).min(self.segment.len());
                    self.header_buf[self.header_len..self.header_len + take]
                        .copy_from_slice(&self.segment[..take]);
                    self.segment.advance(take);
                    self.header_len += take;

                    if self.header_len < FRAME_HEADER_SIZE {
                        trace!("Partial frame header, {} of {} bytes", self.header_len, FRAME_HEADER_SIZE);
                        return Ok(ParseStatus::EndOfSegment);
                    }
                    self.header_len = 0;

                    let header = FrameHeader::decode(self.header_buf, self.max_segment_size)?;
                    self.begin_frame(&header)?;
                    self.state = State::AwaitingBody {
                        remaining: header.body_len(),
                        last: header.is_end_of_message(),
                    };
                }

                State::AwaitingBody { remaining, last } => {
                    if remaining > 0 {
                        if self.segment.is_empty() {
                            return Ok(ParseStatus::EndOfSegment);
                        }
                        let take = remaining.min(self.segment.len());
                        let span = self.segment.split_to(take);
                        if let Some(message) = self.message.as_mut() {
                            message.len += span.len();
                            message.spans.push(span);
                        }
                        self.state = State::AwaitingBody {
                            remaining: remaining - take,
                            last,
                        };
                        continue;
                    }

                    self.state = State::AwaitingHeader;
                    if last {
                        if let Some(message) = self.message.take() {
                            return Ok(ParseStatus::MessageParsed(message));
                        }
                    }
                }
            }
        }
    }

    fn begin_frame(&mut self, header: &FrameHeader) -> Result<(), WireError> {
        if header.is_continuation() {
            if self.message.is_none() {
                return Err(WireError::UnexpectedContinuation);
            }
        } else {
            if self.message.is_some() {
                return Err(WireError::MissingContinuation);
            }
            self.message = Some(ParsedMessage {
                class: MessageClass::from_flags(header.flags)?,
                spans: SmallVec::new(),
                len: 0,
            });
        }

        let so_far = self.message.as_ref().map(|m| m.len).unwrap_or(0);
        if so_far + header.body_len() > self.max_message_size {
            return Err(WireError::Size(so_far + header.body_len()));
        }
        Ok(())
    }
}
