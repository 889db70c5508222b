//! Wire framing (panic-free).
//!
//! Parsing rules:
//! - Never index (`buf[0]`) — always use `Buf` and `remaining()` checks.
//! - Never `unwrap()` / `expect()` / `panic!()` in production paths.
//!
//! Stream framing (TCP): `len: u32 BE` covering the rest of the frame, then
//! `typ: u32 BE`, then the body. Message framing (WebSocket, broker): the
//! message boundary replaces the length prefix, so a payload is just
//! `typ: u32 BE` + body.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{GateError, Result};

/// First byte of a TCP connection selecting the binary content type. Any
/// printable first byte selects the text lane instead.
pub const BINARY_HANDSHAKE: u8 = 0x00;

/// Hard cap on a single frame. Anything larger is a protocol error.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Framing negotiated per session, frozen at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Binary,
    Text,
}

/// Append one length-prefixed stream frame.
pub fn put_frame(buf: &mut BytesMut, typ: u32, body: &[u8]) {
    buf.reserve(8 + body.len());
    buf.put_u32(4 + body.len() as u32);
    buf.put_u32(typ);
    buf.put_slice(body);
}

/// Try to split one stream frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Consumes nothing until a
/// whole frame is available.
pub fn try_split_frame(buf: &mut BytesMut) -> Result<Option<(u32, Bytes)>> {
    let mut peek: &[u8] = &buf[..];
    if peek.remaining() < 4 {
        return Ok(None);
    }
    let len = peek.get_u32() as usize;
    if len < 4 {
        return Err(GateError::Protocol(format!("frame length too short: {len}")));
    }
    if len > MAX_FRAME_BYTES {
        return Err(GateError::Protocol(format!("frame length {len} exceeds cap")));
    }
    if peek.remaining() < len {
        return Ok(None);
    }
    buf.advance(4);
    let mut frame = buf.split_to(len).freeze();
    let typ = frame.get_u32();
    Ok(Some((typ, frame)))
}

/// Encode one message payload (`typ` + body, no length prefix).
pub fn encode_message(typ: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(typ);
    buf.put_slice(body);
    buf.freeze()
}

/// Split a message payload into `typ` + body.
pub fn split_message(mut payload: Bytes) -> Result<(u32, Bytes)> {
    if payload.remaining() < 4 {
        return Err(GateError::Protocol("message too short".into()));
    }
    if payload.len() > 4 + MAX_FRAME_BYTES {
        return Err(GateError::Protocol("message exceeds frame cap".into()));
    }
    let typ = payload.get_u32();
    Ok((typ, payload))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn split_waits_for_whole_frame() {
        let mut buf = BytesMut::new();
        put_frame(&mut buf, 131, b"ping");
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..5]);
        assert!(try_split_frame(&mut partial).unwrap().is_none());

        let (typ, body) = try_split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(typ, 131);
        assert_eq!(&body[..], b"ping");
        assert!(buf.is_empty());
    }

    #[test]
    fn split_rejects_oversize() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_BYTES as u32 + 5);
        assert!(try_split_frame(&mut buf).is_err());
    }

    #[test]
    fn split_rejects_undersize_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        assert!(try_split_frame(&mut buf).is_err());
    }

    #[test]
    fn message_round_trip() {
        let payload = encode_message(0x200, b"hello");
        let (typ, body) = split_message(payload).unwrap();
        assert_eq!(typ, 0x200);
        assert_eq!(&body[..], b"hello");
    }

    #[test]
    fn message_too_short() {
        assert!(split_message(Bytes::from_static(b"ab")).is_err());
    }
}
