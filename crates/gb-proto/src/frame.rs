//! Length-prefixed frame helpers.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.
//! A zero-length payload is a valid keepalive and carries no message.

use crate::codec;
use crate::message::Message;

pub const HEADER_LEN: usize = 4;

/// Payload length from a complete 4-byte header.
pub fn payload_len(header: &[u8]) -> u32 {
    u32::from_be_bytes([header[0], header[1], header[2], header[3]])
}

/// Wrap an already-encoded payload in a frame.
pub fn frame_payload(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode a message and wrap it in a frame, ready for the socket.
pub fn frame_message(msg: &Message) -> Vec<u8> {
    frame_payload(&codec::encode(msg))
}
