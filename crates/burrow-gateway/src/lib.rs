//! burrow-gateway: the public tunnel gateway.
//!
//! Accepts agent control connections on `/connect`, keeps live sessions in
//! a subdomain-keyed registry, and dispatches public HTTP requests onto
//! per-request multiplexed streams.

pub mod blob;
mod handlers;
pub mod ratelimit;
pub mod registry;
pub mod server;

pub use blob::{BlobStore, MemoryBlobStore};
pub use ratelimit::RateLimiter;
pub use registry::{Session, SessionRegistry};
pub use server::{Gateway, GatewayConfig};
