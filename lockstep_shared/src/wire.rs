//! Wire codec.
//!
//! Every datagram carries exactly one frame:
//!
//! ```text
//! +---------+-----------+------------+--------------+-----------+--------+
//! | magic 3 | type id 4 | index 4    | length 4     | content   | crc 4  |
//! | "LKS"   | u32 LE    | u32 LE     | u32 LE       | length B  | u32 LE |
//! +---------+-----------+------------+--------------+-----------+--------+
//! ```
//!
//! The trailing CRC-32 covers the header and the content. A frame is either
//! fully valid or rejected; there is no partially decoded state.
//!
//! Frames never carry empty content. Messages without data are encoded with a
//! single [`EMPTY_CONTENT_PAD`] byte so the length field is always at least 1.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::MessageIndex;

/// Protocol identifier at the start of every frame.
pub const MAGIC: [u8; 3] = *b"LKS";

/// Largest datagram the protocol will produce or accept.
pub const MAX_MESSAGE_SIZE: usize = 10_000;

const TYPE_OFFSET: usize = 3;
const INDEX_OFFSET: usize = 7;
const LENGTH_OFFSET: usize = 11;

/// Magic, type id, message index and content length.
pub const HEADER_SIZE: usize = 15;

/// Size of the trailing integrity hash.
pub const HASH_SIZE: usize = 4;

/// Frame overhead: header plus hash.
pub const SIZE_WITHOUT_CONTENT: usize = HEADER_SIZE + HASH_SIZE;

/// Largest content a single frame can carry.
pub const MAX_CONTENT_SIZE: usize = MAX_MESSAGE_SIZE - SIZE_WITHOUT_CONTENT;

/// Content byte written for messages that carry no data.
pub const EMPTY_CONTENT_PAD: u8 = 0;

/// A validated frame. `content` borrows from the decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireMessage<'a> {
    pub type_id: u32,
    pub index: MessageIndex,
    pub content: &'a [u8],
}

impl WireMessage<'_> {
    /// Total encoded size of this frame.
    pub fn frame_len(&self) -> usize {
        SIZE_WITHOUT_CONTENT + self.content.len()
    }
}

/// Reasons a received frame is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame of {len} bytes is shorter than the {SIZE_WITHOUT_CONTENT} byte minimum")]
    TooShort { len: usize },
    #[error("frame magic {found:?} does not match protocol")]
    BadMagic { found: [u8; 3] },
    #[error("frame declares empty content")]
    EmptyContent,
    #[error("declared content length {declared} exceeds maximum {MAX_CONTENT_SIZE}")]
    ContentTooLarge { declared: usize },
    #[error("declared content length {declared} does not fit a {actual} byte frame")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("integrity hash mismatch (sent {sent:#010x}, computed {computed:#010x})")]
    HashMismatch { sent: u32, computed: u32 },
}

/// Reasons a frame cannot be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("content of {len} bytes exceeds maximum {MAX_CONTENT_SIZE}")]
    ContentTooLarge { len: usize },
}

/// Appends one encoded frame to `buf`.
pub fn encode_into(
    buf: &mut BytesMut,
    type_id: u32,
    index: MessageIndex,
    content: &[u8],
) -> Result<(), EncodeError> {
    if content.len() > MAX_CONTENT_SIZE {
        return Err(EncodeError::ContentTooLarge { len: content.len() });
    }
    let content: &[u8] = if content.is_empty() {
        &[EMPTY_CONTENT_PAD]
    } else {
        content
    };

    let start = buf.len();
    buf.reserve(SIZE_WITHOUT_CONTENT + content.len());
    buf.put_slice(&MAGIC);
    buf.put_u32_le(type_id);
    buf.put_u32_le(index);
    buf.put_u32_le(content.len() as u32);
    buf.put_slice(content);

    let hash = crc32fast::hash(&buf[start..]);
    buf.put_u32_le(hash);
    Ok(())
}

/// Encodes one frame into a fresh buffer.
pub fn encode(type_id: u32, index: MessageIndex, content: &[u8]) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::with_capacity(SIZE_WITHOUT_CONTENT + content.len().max(1));
    encode_into(&mut buf, type_id, index, content)?;
    Ok(buf.freeze())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Validates and decodes one frame.
///
/// Bounds are checked before any content is sliced, so a hostile length field
/// can never cause a read past the end of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<WireMessage<'_>, DecodeError> {
    if bytes.len() < SIZE_WITHOUT_CONTENT {
        return Err(DecodeError::TooShort { len: bytes.len() });
    }

    if bytes[..TYPE_OFFSET] != MAGIC {
        let mut found = [0u8; 3];
        found.copy_from_slice(&bytes[..TYPE_OFFSET]);
        return Err(DecodeError::BadMagic { found });
    }

    let declared = read_u32(bytes, LENGTH_OFFSET) as usize;
    if declared == 0 {
        return Err(DecodeError::EmptyContent);
    }
    if declared > MAX_CONTENT_SIZE {
        return Err(DecodeError::ContentTooLarge { declared });
    }
    if bytes.len() != SIZE_WITHOUT_CONTENT + declared {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    let hashed_end = HEADER_SIZE + declared;
    let sent = read_u32(bytes, hashed_end);
    let computed = crc32fast::hash(&bytes[..hashed_end]);
    if sent != computed {
        return Err(DecodeError::HashMismatch { sent, computed });
    }

    Ok(WireMessage {
        type_id: read_u32(bytes, TYPE_OFFSET),
        index: read_u32(bytes, INDEX_OFFSET),
        content: &bytes[HEADER_SIZE..hashed_end],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_survive_encode_decode() {
        for len in [1usize, 2, 17, 512, MAX_CONTENT_SIZE] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let frame = encode(1234, 42, &payload).unwrap();
            assert_eq!(frame.len(), SIZE_WITHOUT_CONTENT + len);

            let msg = decode(&frame).unwrap();
            assert_eq!(msg.type_id, 1234);
            assert_eq!(msg.index, 42);
            assert_eq!(msg.content, payload.as_slice());
        }
    }

    #[test]
    fn empty_payload_is_padded() {
        let frame = encode(7, 1, &[]).unwrap();
        let msg = decode(&frame).unwrap();
        assert_eq!(msg.content, &[EMPTY_CONTENT_PAD]);
        assert_eq!(frame.len(), SIZE_WITHOUT_CONTENT + 1);
    }

    #[test]
    fn oversized_content_is_not_encoded() {
        let payload = vec![1u8; MAX_CONTENT_SIZE + 1];
        assert_eq!(
            encode(1, 1, &payload),
            Err(EncodeError::ContentTooLarge {
                len: MAX_CONTENT_SIZE + 1
            })
        );
    }

    #[test]
    fn any_single_byte_flip_is_rejected() {
        let frame = encode(99, 7, b"lockstep input").unwrap();
        for i in 0..frame.len() {
            let mut corrupted = frame.to_vec();
            corrupted[i] ^= 0x5A;
            assert!(decode(&corrupted).is_err(), "flip at byte {i} was accepted");
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut frame = encode(1, 1, b"x").unwrap().to_vec();
        frame[0] = b'Z';
        assert!(matches!(decode(&frame), Err(DecodeError::BadMagic { .. })));
    }

    #[test]
    fn huge_declared_length_is_rejected_without_reading() {
        let mut frame = encode(1, 1, b"abc").unwrap().to_vec();
        frame[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(
            decode(&frame),
            Err(DecodeError::ContentTooLarge {
                declared: u32::MAX as usize
            })
        );
    }

    #[test]
    fn declared_length_past_buffer_end_is_rejected() {
        let mut frame = encode(1, 1, b"abc").unwrap().to_vec();
        frame[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&500u32.to_le_bytes());
        assert!(matches!(
            decode(&frame),
            Err(DecodeError::LengthMismatch { declared: 500, .. })
        ));
    }

    #[test]
    fn zero_length_is_rejected() {
        let mut frame = encode(1, 1, b"a").unwrap().to_vec();
        frame[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(decode(&frame), Err(DecodeError::EmptyContent));
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert_eq!(decode(&[]), Err(DecodeError::TooShort { len: 0 }));
        assert_eq!(decode(&MAGIC), Err(DecodeError::TooShort { len: 3 }));
    }
}
