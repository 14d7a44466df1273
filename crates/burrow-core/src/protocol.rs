//! Tunnel wire messages.
//!
//! One message per logical stream direction: the agent sends a
//! [`HandshakeRequest`] on its first stream and reads a
//! [`HandshakeResponse`]; every public request travels as a
//! [`RequestFrame`] answered by exactly one [`ResponseFrame`] on the same
//! stream.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Protocol version sent in every handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Header carrying the end-to-end trace identifier.
pub const TRACE_HEADER: &str = "x-trace-id";

/// Agent → gateway, once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: String,
    /// Requested subdomain; ignored when already taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Gateway → agent reply to the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub success: bool,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub public_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Gateway → agent, one per public request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id, a 26-char time-ordered ULID.
    pub id: String,
    pub method: String,
    /// Request-target: path plus query string.
    pub url: String,
    pub headers: HashMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// Agent → gateway, the reply matching a [`RequestFrame`] by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// Generate a fresh 8-hex-character subdomain.
pub fn generate_subdomain() -> String {
    let b: [u8; 4] = rand::random();
    b.iter().fold(String::with_capacity(8), |mut s, x| {
        let _ = write!(s, "{x:02x}");
        s
    })
}

/// New 26-character time-ordered identifier (ULID), used for both the
/// frame correlation id and the `x-trace-id` header value.
pub fn new_trace_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Case-insensitive lookup of the trace header in a frame header map.
pub fn trace_header(headers: &HashMap<String, String>) -> Option<&str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(TRACE_HEADER))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_message, encode_message, LENGTH_PREFIX_LEN};

    #[test]
    fn subdomain_is_eight_hex_chars() {
        for _ in 0..32 {
            let sub = generate_subdomain();
            assert_eq!(sub.len(), 8);
            assert!(sub.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn trace_id_is_26_chars() {
        assert_eq!(new_trace_id().len(), 26);
    }

    #[test]
    fn trace_ids_are_time_ordered() {
        let a = new_trace_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_trace_id();
        assert!(a < b);
    }

    #[test]
    fn trace_header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("X-Trace-ID".to_string(), "abc".to_string());
        assert_eq!(trace_header(&headers), Some("abc"));
        assert_eq!(trace_header(&HashMap::new()), None);
    }

    #[test]
    fn request_frame_carries_binary_bodies_intact() {
        let mut headers = HashMap::new();
        headers.insert("x-custom".to_string(), "v".to_string());
        let frame = RequestFrame {
            id: new_trace_id(),
            method: "POST".to_string(),
            url: "/path?x=1".to_string(),
            headers,
            body: vec![0x00, 0x01, 0xfe, 0xff],
        };

        let encoded = encode_message(&frame).unwrap();
        let decoded: RequestFrame = decode_message(&encoded[LENGTH_PREFIX_LEN..]).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.body, vec![0x00, 0x01, 0xfe, 0xff]);
    }
}
