//! Message chunking into frames.
//!
//! A message whose body fits into one segment travels as a single frame
//! flagged with its class and `END_OF_MESSAGE`. Larger bodies are split:
//! the first frame carries the class bit, the following frames carry
//! `CONTINUATION`, and only the last one has `END_OF_MESSAGE`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::header::{Flags, FrameHeader, MessageClass, FRAME_HEADER_SIZE, MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
use crate::WireError;

/// Validate a configured segment size
pub fn check_segment_size(max_segment_size: usize) -> Result<(), WireError> {
    if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&max_segment_size) {
        return Err(WireError::SegmentSize(max_segment_size));
    }
    Ok(())
}

/// Largest frame body that fits into a segment
pub fn max_body_len(max_segment_size: usize) -> usize {
    max_segment_size - FRAME_HEADER_SIZE
}

/// Number of frames a body of `body_len` bytes is split into
pub fn frame_count(body_len: usize, max_segment_size: usize) -> usize {
    let chunk = max_body_len(max_segment_size);
    if body_len == 0 {
        1
    } else {
        (body_len + chunk - 1) / chunk
    }
}

/// Flags for a frame at a given position of its message
pub fn chunk_flags(class: MessageClass, first: bool, last: bool) -> Flags {
    let mut flags = if first {
        class.flag()
    } else {
        Flags::CONTINUATION
    };
    if last {
        flags |= Flags::END_OF_MESSAGE;
    }
    flags
}

/// Append one frame (header + body) to `out`
pub fn put_frame<B: BufMut>(flags: Flags, body: &[u8], out: &mut B) {
    FrameHeader::new(flags, body.len()).encode(out);
    out.put_slice(body);
}

/// Split a message body into encoded frames, one `Bytes` per frame
pub fn encode_message(
    class: MessageClass,
    body: &[u8],
    max_segment_size: usize,
) -> Result<Vec<Bytes>, WireError> {
    check_segment_size(max_segment_size)?;

    let chunk = max_body_len(max_segment_size);
    let total = frame_count(body.len(), max_segment_size);
    let mut frames = Vec::with_capacity(total);

    if body.is_empty() {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE);
        put_frame(chunk_flags(class, true, true), &[], &mut buf);
        frames.push(buf.freeze());
        return Ok(frames);
    }

    for (no, piece) in body.chunks(chunk).enumerate() {
        let flags = chunk_flags(class, no == 0, no == total - 1);
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + piece.len());
        put_frame(flags, piece, &mut buf);
        frames.push(buf.freeze());
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame_message() {
        let frames = encode_message(MessageClass::User, b"hello", 64).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], (Flags::USER_MESSAGE | Flags::END_OF_MESSAGE).bits());
        assert_eq!(u16::from_be_bytes([frames[0][1], frames[0][2]]), 8);
        assert_eq!(&frames[0][3..], b"hello");
    }

    #[test]
    fn test_chunked_message_115_into_65() {
        let body: Vec<u8> = (0..115u8).collect();
        let frames = encode_message(MessageClass::User, &body, 65).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 65);
        assert_eq!(frames[1].len(), 53 + FRAME_HEADER_SIZE);
        assert_eq!(frames[0][0], Flags::USER_MESSAGE.bits());
        assert_eq!(
            frames[1][0],
            (Flags::CONTINUATION | Flags::END_OF_MESSAGE).bits()
        );
    }

    #[test]
    fn test_frame_count_matches_ceiling() {
        for len in [1usize, 61, 62, 63, 124, 125, 1000] {
            let body = vec![7u8; len];
            let frames = encode_message(MessageClass::System, &body, 65).unwrap();
            assert_eq!(frames.len(), (len + 61) / 62);
            assert_eq!(frames.len(), frame_count(len, 65));
            assert!(frames.iter().all(|f| f.len() <= 65));
            let eom: Vec<bool> = frames
                .iter()
                .map(|f| f[0] & Flags::END_OF_MESSAGE.bits() != 0)
                .collect();
            assert!(eom[..eom.len() - 1].iter().all(|e| !e));
            assert!(eom[eom.len() - 1]);
        }
    }

    #[test]
    fn test_empty_message() {
        let frames = encode_message(MessageClass::User, &[], 64).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_segment_size_validation() {
        assert!(encode_message(MessageClass::User, b"x", 4).is_err());
        assert!(check_segment_size(MAX_SEGMENT_SIZE).is_ok());
        assert!(check_segment_size(MAX_SEGMENT_SIZE + 1).is_err());
    }
}
