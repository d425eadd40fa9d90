//! UDP listener for the provisioning token broadcast.
//!
//! During device setup the companion mobile application broadcasts a
//! length-prefixed binary frame on UDP port 6669 whose JSON payload carries
//! the provisioning token. The same network path sees unrelated multicast
//! traffic, so datagrams that fail to parse at any stage are silently
//! discarded and the loop keeps listening.

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{ActivationError, ActivationResult};

/// Largest datagram the companion app is known to send.
const MAX_DATAGRAM: usize = 255;

/// Offset of the big-endian u32 length field inside a frame.
const LENGTH_OFFSET: usize = 12;
/// Offset of the JSON payload inside a frame.
const PAYLOAD_OFFSET: usize = 16;

/// Wire shape of the broadcast payload.
#[derive(Debug, serde::Deserialize)]
struct TokenPayload {
    token: String,
}

/// Block until a token frame arrives or `cancel` fires.
///
/// Binds `0.0.0.0:<port>` and receives datagrams until one decodes as a
/// token frame. No timeout is imposed here; callers needing a hard deadline
/// wrap this future themselves.
pub async fn listen_for_token(port: u16, cancel: CancellationToken) -> ActivationResult<String> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ActivationError::Transport(format!("failed to bind UDP port {port}: {e}")))?;

    info!(port, "listening for provisioning token broadcast");
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ActivationError::Cancelled);
            }
            received = socket.recv_from(&mut buf) => {
                let (len, addr) = received.map_err(|e| {
                    ActivationError::Transport(format!("UDP receive failed: {e}"))
                })?;

                match decode_token_frame(&buf[..len]) {
                    Some(token) => {
                        info!(%addr, "received provisioning token");
                        return Ok(token);
                    }
                    None => {
                        debug!(%addr, len, "discarding datagram that is not a token frame");
                    }
                }
            }
        }
    }
}

/// Decode one datagram as a token frame.
///
/// Bytes 12..16 hold a big-endian u32 length `L`; the JSON payload spans
/// bytes 16 through `L + 8` (exclusive) and its `token` field is the
/// provisioning token. Returns `None` for anything that does not fit that
/// shape — short frames, lengths outside the datagram, invalid UTF-8 or
/// JSON, or a missing field.
pub fn decode_token_frame(frame: &[u8]) -> Option<String> {
    if frame.len() < PAYLOAD_OFFSET {
        return None;
    }

    let length_bytes: [u8; 4] = frame[LENGTH_OFFSET..PAYLOAD_OFFSET].try_into().ok()?;
    let declared = u32::from_be_bytes(length_bytes) as usize;

    let payload_end = declared.checked_add(8)?;
    if payload_end <= PAYLOAD_OFFSET || payload_end > frame.len() {
        return None;
    }

    let payload = std::str::from_utf8(&frame[PAYLOAD_OFFSET..payload_end]).ok()?;
    let parsed: TokenPayload = serde_json::from_str(payload).ok()?;
    Some(parsed.token)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a frame whose payload sits at the documented offsets.
    fn frame_with_payload(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; PAYLOAD_OFFSET];
        let declared = (payload.len() + 8) as u32;
        frame[LENGTH_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&declared.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn decodes_a_valid_token_frame() {
        let frame = frame_with_payload(br#"{"token":"AZ12345678ABCD"}"#);
        assert_eq!(
            decode_token_frame(&frame).as_deref(),
            Some("AZ12345678ABCD")
        );
    }

    #[test]
    fn trailing_bytes_beyond_declared_length_are_ignored() {
        let mut frame = frame_with_payload(br#"{"token":"AZ12345678ABCD"}"#);
        frame.extend_from_slice(b"garbage after payload");
        assert_eq!(
            decode_token_frame(&frame).as_deref(),
            Some("AZ12345678ABCD")
        );
    }

    #[test]
    fn discards_short_frames() {
        assert!(decode_token_frame(&[]).is_none());
        assert!(decode_token_frame(&[0u8; 15]).is_none());
    }

    #[test]
    fn discards_corrupted_length_field() {
        let mut frame = frame_with_payload(br#"{"token":"AZ12345678ABCD"}"#);
        frame[LENGTH_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(decode_token_frame(&frame).is_none());
    }

    #[test]
    fn discards_invalid_json() {
        let frame = frame_with_payload(b"not json at all {{{{");
        assert!(decode_token_frame(&frame).is_none());
    }

    #[test]
    fn discards_json_without_token_field() {
        let frame = frame_with_payload(br#"{"other":"value"}"#);
        assert!(decode_token_frame(&frame).is_none());
    }

    #[test]
    fn discards_invalid_utf8() {
        let frame = frame_with_payload(&[0xff, 0xfe, 0xfd, 0xfc]);
        assert!(decode_token_frame(&frame).is_none());
    }
}
