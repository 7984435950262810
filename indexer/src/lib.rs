//! Multi-chain RPC failover and chunked contract-activity indexing.
//!
//! The crate is organized around two layers:
//! - a per-chain transport layer (`rpc`, `provider`) that tolerates
//!   unreliable third-party RPC endpoints through rotation, caching,
//!   rate limiting, and provider-level failover;
//! - a subscription-aware indexing pipeline (`tier`, `locate`, `session`,
//!   `pipeline`) that turns a subscriber's historical window into bounded,
//!   resumable, boundary-validated chunks.

pub mod cli;
pub mod config;
pub mod locate;
pub mod metrics;
pub mod pipeline;
pub mod provider;
pub mod rpc;
pub mod session;
pub mod store;
pub mod tier;

#[cfg(test)]
pub(crate) mod test_utils;
