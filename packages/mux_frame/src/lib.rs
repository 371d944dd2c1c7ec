//! Mux frame codec.
//!
//! Binary envelope carrying a session id and an opaque payload inside one
//! transport message: `u16_be(len(session_id)) || session_id || payload`.
//! Only the session-id length is explicit — the payload runs to the end of
//! the message, so its length is inferred from the transport.

use std::fmt;

/// Session ids must fit in the two-byte length prefix.
pub const MAX_SESSION_ID_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Session id is empty (encode input or decoded length prefix of zero).
    EmptySessionId,
    /// Session id exceeds the 65535-byte prefix limit.
    SessionIdTooLong(usize),
    /// Frame shorter than the two-byte length prefix.
    FrameTooShort(usize),
    /// Declared session-id length exceeds the bytes remaining in the frame.
    Truncated { declared: usize, available: usize },
    /// Session id bytes are not valid UTF-8.
    InvalidSessionId,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::EmptySessionId => write!(f, "session id required"),
            FrameError::SessionIdTooLong(len) => {
                write!(f, "session id too long: {} bytes (max {})", len, MAX_SESSION_ID_LEN)
            }
            FrameError::FrameTooShort(len) => write!(f, "frame too short: {} bytes", len),
            FrameError::Truncated { declared, available } => {
                write!(f, "frame missing session id: declared {} bytes, {} available", declared, available)
            }
            FrameError::InvalidSessionId => write!(f, "session id is not valid utf-8"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Wrap `payload` in a frame addressed to `session_id`.
pub fn encode(session_id: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let sid = session_id.as_bytes();
    if sid.is_empty() {
        return Err(FrameError::EmptySessionId);
    }
    if sid.len() > MAX_SESSION_ID_LEN {
        return Err(FrameError::SessionIdTooLong(sid.len()));
    }
    let mut frame = Vec::with_capacity(2 + sid.len() + payload.len());
    frame.extend_from_slice(&(sid.len() as u16).to_be_bytes());
    frame.extend_from_slice(sid);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a frame back into its session id and payload.
pub fn decode(frame: &[u8]) -> Result<(&str, &[u8]), FrameError> {
    if frame.len() < 2 {
        return Err(FrameError::FrameTooShort(frame.len()));
    }
    let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    if declared == 0 {
        return Err(FrameError::EmptySessionId);
    }
    if frame.len() < 2 + declared {
        return Err(FrameError::Truncated {
            declared,
            available: frame.len() - 2,
        });
    }
    let session_id =
        std::str::from_utf8(&frame[2..2 + declared]).map_err(|_| FrameError::InvalidSessionId)?;
    Ok((session_id, &frame[2 + declared..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let frame = encode("ai", b"ls\n").unwrap();
        assert_eq!(frame, [0x00, 0x02, b'a', b'i', b'l', b's', b'\n']);
    }

    #[test]
    fn roundtrip() {
        let frame = encode("ops", b"pwd").unwrap();
        let (sid, payload) = decode(&frame).unwrap();
        assert_eq!(sid, "ops");
        assert_eq!(payload, b"pwd");
    }

    #[test]
    fn roundtrip_empty_payload() {
        let frame = encode("s", b"").unwrap();
        let (sid, payload) = decode(&frame).unwrap();
        assert_eq!(sid, "s");
        assert!(payload.is_empty());
    }

    #[test]
    fn roundtrip_multibyte_session_id() {
        let frame = encode("térm", b"\x1b[2J").unwrap();
        let (sid, payload) = decode(&frame).unwrap();
        assert_eq!(sid, "térm");
        assert_eq!(payload, b"\x1b[2J");
    }

    #[test]
    fn encode_rejects_empty_session_id() {
        assert_eq!(encode("", b"x"), Err(FrameError::EmptySessionId));
    }

    #[test]
    fn encode_session_id_at_limit() {
        let sid = "s".repeat(MAX_SESSION_ID_LEN);
        let frame = encode(&sid, b"x").unwrap();
        let (decoded, payload) = decode(&frame).unwrap();
        assert_eq!(decoded.len(), MAX_SESSION_ID_LEN);
        assert_eq!(payload, b"x");
    }

    #[test]
    fn encode_rejects_oversized_session_id() {
        let sid = "s".repeat(MAX_SESSION_ID_LEN + 1);
        assert_eq!(
            encode(&sid, b"x"),
            Err(FrameError::SessionIdTooLong(MAX_SESSION_ID_LEN + 1))
        );
    }

    #[test]
    fn decode_rejects_short_frames() {
        assert_eq!(decode(&[]), Err(FrameError::FrameTooShort(0)));
        assert_eq!(decode(&[0x00]), Err(FrameError::FrameTooShort(1)));
    }

    #[test]
    fn decode_rejects_zero_length_session_id() {
        assert_eq!(decode(&[0x00, 0x00, b'x']), Err(FrameError::EmptySessionId));
    }

    #[test]
    fn decode_rejects_truncated_session_id() {
        // Declares 5 bytes of session id but only carries 2.
        assert_eq!(
            decode(&[0x00, 0x05, b'a', b'b']),
            Err(FrameError::Truncated { declared: 5, available: 2 })
        );
    }

    #[test]
    fn decode_rejects_invalid_utf8_session_id() {
        assert_eq!(
            decode(&[0x00, 0x01, 0xFF, b'p']),
            Err(FrameError::InvalidSessionId)
        );
    }

    #[test]
    fn payload_is_opaque_bytes() {
        let payload = [0x00, 0x01, 0xFF, 0xFE];
        let frame = encode("raw", &payload).unwrap();
        let (_, decoded) = decode(&frame).unwrap();
        assert_eq!(decoded, payload);
    }
}
