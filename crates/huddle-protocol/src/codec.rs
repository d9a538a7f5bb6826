//! Wire framing for Huddle frames.
//!
//! Every frame travels as a big-endian `u32` payload length followed by the
//! MessagePack body (named fields, so rows stay readable across versions).
//! A WebSocket message may carry several frames or a partial one; readers
//! keep a `BytesMut` and call [`decode_from`] until it returns `None`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload length is above [`MAX_FRAME_SIZE`].
    #[error("Frame of {0} bytes is over the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    /// `decode` was handed a truncated frame.
    #[error("Truncated frame: {0} bytes missing")]
    Incomplete(usize),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Payload length announced by a buffered prefix, or `None` if the prefix
/// itself is not complete.
fn announced_length(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let mut prefix = prefix;
    let length = prefix.get_u32() as usize;
    match length {
        n if n > MAX_FRAME_SIZE => Err(ProtocolError::FrameTooLarge(n)),
        n => Ok(Some(n)),
    }
}

/// Encode a frame into a fresh buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Append one encoded frame to `buf`. On error `buf` is left untouched.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n as usize <= MAX_FRAME_SIZE)
        .ok_or(ProtocolError::FrameTooLarge(payload.len()))?;

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(length);
    buf.put_slice(&payload);
    Ok(())
}

/// Decode exactly one frame from `data`. Trailing bytes are ignored.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let length = announced_length(data)?
        .ok_or(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE.saturating_sub(data.len())))?;
    let body = &data[LENGTH_PREFIX_SIZE..];
    if body.len() < length {
        return Err(ProtocolError::Incomplete(length - body.len()));
    }
    Ok(rmp_serde::from_slice(&body[..length])?)
}

/// Take the next complete frame off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` alone while the frame is still
/// partial.
///
/// # Errors
///
/// Returns an error if the announced length is too large or the payload
/// is not a valid frame. The bad frame has been consumed by then.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(length) = announced_length(&buf[..])? else {
        return Ok(None);
    };
    if buf.len() - LENGTH_PREFIX_SIZE < length {
        return Ok(None);
    }

    let mut frame_bytes = buf.split_to(LENGTH_PREFIX_SIZE + length);
    frame_bytes.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(rmp_serde::from_slice(&frame_bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::{MemberRole, MemberRow, MessageKind, NewMessageRow, Row, RowChange, Table};

    fn insert_request() -> Frame {
        Frame::InsertMessage {
            id: 4,
            row: NewMessageRow {
                channel_id: "ws-1".into(),
                sender_id: "u-1".into(),
                sender_name: "alice".into(),
                content: "hello".into(),
                kind: MessageKind::Text,
                correlation_id: Some("temp_1".into()),
            },
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let member = MemberRow {
            channel_id: "ws-1".into(),
            user_id: "u-1".into(),
            role: MemberRole::Admin,
            online: true,
            last_seen_at: 1_700_000_000_000,
        };
        let frames = vec![
            Frame::subscribe(1, "channel_chat_ws-1", "ws-1", vec![Table::ChatMessage, Table::ChannelMember]),
            insert_request(),
            Frame::change("channel_chat_ws-1", RowChange::update(Row::Member(member.clone()))),
            Frame::Member { id: 2, row: None },
            Frame::Members { id: 3, rows: vec![member] },
            Frame::error(1, 1001, "Invalid frame"),
            Frame::pong(Some(12)),
            Frame::connected("conn-123", 1, 30000),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&insert_request()).unwrap();

        match decode(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_oversized_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match decode_from(&mut buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::ack(1);
        let frame2 = insert_request();

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        // Hold back the last byte: the second frame is not complete yet.
        let tail = buf.split_off(buf.len() - 1);

        assert_eq!(decode_from(&mut buf).unwrap(), Some(frame1));
        assert_eq!(decode_from(&mut buf).unwrap(), None);

        buf.unsplit(tail);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(frame2));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_payload_is_consumed() {
        let mut buf = BytesMut::new();
        // 0xc1 is never valid MessagePack.
        buf.put_u32(1);
        buf.put_u8(0xc1);
        encode_into(&Frame::ack(9), &mut buf).unwrap();

        assert!(matches!(decode_from(&mut buf), Err(ProtocolError::Decode(_))));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::ack(9)));
    }
}
