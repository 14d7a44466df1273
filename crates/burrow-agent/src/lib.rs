//! burrow-agent: the tunnel client.
//!
//! Connects out to a gateway, holds the multiplexed control connection, and
//! replays every inbound stream against the local HTTP service.

pub mod agent;
pub mod forwarder;

pub use agent::{Agent, AgentConfig};
pub use forwarder::{RequestRecord, RequestRecorder};
