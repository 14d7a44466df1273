//! CBOR message framing for tunnel streams.
//!
//! Every logical stream carries whole messages, each written as a 4-byte
//! big-endian length followed by the CBOR payload. [`MuxStream`] reads the
//! prefix off the stream, validates it with [`parse_length`], and decodes
//! the payload with [`decode_message`].
//!
//! [`MuxStream`]: crate::mux::MuxStream

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{TunnelError, TunnelResult};

/// Number of bytes in the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest accepted message payload. Request and response bodies ride
/// inside messages, so the cap sits far above any sane HTTP exchange.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Serialize a message into a length-prefixed buffer ready for a stream.
///
/// The payload is written directly behind a reserved prefix slot, then the
/// slot is patched with the final length.
pub fn encode_message<T: Serialize>(value: &T) -> TunnelResult<Vec<u8>> {
    let mut buf = vec![0u8; LENGTH_PREFIX_LEN];
    ciborium::into_writer(value, &mut buf)?;

    let payload_len = buf.len() - LENGTH_PREFIX_LEN;
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(TunnelError::Codec(format!(
            "message too large to encode: {payload_len} bytes"
        )));
    }
    buf[..LENGTH_PREFIX_LEN].copy_from_slice(&(payload_len as u32).to_be_bytes());
    Ok(buf)
}

/// Validate a length prefix read off a stream.
pub fn parse_length(prefix: [u8; LENGTH_PREFIX_LEN]) -> TunnelResult<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(TunnelError::Codec(format!(
            "message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"
        )));
    }
    Ok(len)
}

/// Decode one CBOR payload, its length prefix already stripped.
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> TunnelResult<T> {
    Ok(ciborium::from_reader(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HandshakeRequest, ResponseFrame, PROTOCOL_VERSION};
    use std::collections::HashMap;

    fn sample_response() -> ResponseFrame {
        ResponseFrame {
            id: "01JXAY8Q0B3N5M2K7F4D9G6H1C".to_string(),
            status: 200,
            headers: HashMap::from([("x-custom".to_string(), "v".to_string())]),
            body: vec![0x00, 0xff, 0x10, 0x7f],
        }
    }

    #[test]
    fn prefix_counts_the_payload() {
        let encoded = encode_message(&sample_response()).unwrap();
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&encoded[..LENGTH_PREFIX_LEN]);
        let len = parse_length(prefix).unwrap();
        assert_eq!(len, encoded.len() - LENGTH_PREFIX_LEN);
    }

    #[test]
    fn response_frame_survives_the_wire_format() {
        let frame = sample_response();
        let encoded = encode_message(&frame).unwrap();
        let decoded: ResponseFrame = decode_message(&encoded[LENGTH_PREFIX_LEN..]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn handshake_without_hint_stays_compact() {
        let request = HandshakeRequest {
            version: PROTOCOL_VERSION.to_string(),
            subdomain: None,
            auth_token: None,
        };
        let encoded = encode_message(&request).unwrap();
        let decoded: HandshakeRequest = decode_message(&encoded[LENGTH_PREFIX_LEN..]).unwrap();
        assert_eq!(decoded, request);

        // Omitted optional fields must not appear on the wire at all.
        assert!(encoded.len() < 32, "encoded {} bytes", encoded.len());
    }

    #[test]
    fn truncated_payload_is_a_codec_error() {
        let encoded = encode_message(&sample_response()).unwrap();
        let cut = &encoded[LENGTH_PREFIX_LEN..encoded.len() - 3];
        let err = decode_message::<ResponseFrame>(cut).unwrap_err();
        assert!(matches!(err, TunnelError::Codec(_)));
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let prefix = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        assert!(matches!(parse_length(prefix), Err(TunnelError::Codec(_))));
    }
}
