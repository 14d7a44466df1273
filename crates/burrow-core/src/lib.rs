//! burrow-core: shared tunnel protocol library.
//!
//! Provides the handshake and request/response frame types, the
//! length-prefixed CBOR codec, the WebSocket byte-carrier adapter, and the
//! stream multiplexer that both the gateway and the agent run over it.

pub mod carrier;
pub mod codec;
pub mod error;
pub mod mux;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use carrier::WsCarrier;
pub use codec::{decode_message, encode_message};
pub use error::{TunnelError, TunnelResult};
pub use mux::{Multiplexer, MuxStream};
pub use protocol::{
    generate_subdomain, new_trace_id, trace_header, HandshakeRequest, HandshakeResponse,
    RequestFrame, ResponseFrame, PROTOCOL_VERSION, TRACE_HEADER,
};
