//! Multi-endpoint JSON-RPC transport: rotation, caching, and rate limiting.

mod cache;
mod connection;
mod endpoint;
mod queue;
mod transport;
pub mod types;

pub use cache::ResponseCache;
pub use connection::{HttpConnection, RpcConnection};
pub use endpoint::EndpointSnapshot;
pub use queue::{QueueLimits, TieredQueue};
pub use transport::{
    BlockTimestamp, ErrorRecord, RetryPolicy, RpcTransport, TransportConfig, TransportStats,
};
pub use types::{quantity, LogRecord, ReceiptRecord, TxRecord};

use thiserror::Error;

/// Transport-level error taxonomy.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A single endpoint failed; recovered by rotating to the next one.
    #[error("endpoint {url} failed calling {method}: {reason}")]
    EndpointFailure {
        url: String,
        method: String,
        reason: String,
    },
    /// Every configured endpoint failed within one logical call.
    #[error("transport exhausted after {attempts} attempts across {endpoints} endpoints calling {method}")]
    TransportExhausted {
        method: String,
        endpoints: usize,
        attempts: u32,
    },
    /// The endpoint answered, but not with the shape the method promises.
    #[error("malformed response for {method}: {reason}")]
    MalformedResponse { method: String, reason: String },
    /// Timestamp extrapolation needs at least one known block timestamp.
    #[error("no cached timestamp to extrapolate from for block {block}")]
    NoTimestampReference { block: u64 },
}
