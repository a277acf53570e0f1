//! rudis — a Redis client for Rust.
//!
//! RESP2/RESP3 wire protocol, a fork-safe timeout-aware connection
//! layer, pipelines and MULTI/WATCH transactions with bounded retry,
//! cluster-aware routing (MOVED/ASK/TRYAGAIN), sentinel-based address
//! discovery, and an optional client-side tracking cache.

pub mod cache;
pub mod callbacks;
pub mod config;
pub mod connection;
pub mod crc16;
pub mod error;
pub mod resp;
pub mod retry;
pub mod router;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{CacheConfig, CacheMode, TrackingCache};
pub use config::{ClientConfig, Role, SslParams};
pub use connection::{ConnState, Connection, ConnectionPool};
pub use error::{Error, Result, ServerErrorKind};
pub use resp::Reply;
pub use retry::{Backoff, RetryPolicy};
pub use router::{ClusterRouter, SentinelClient, SentinelResolver};
pub use session::{Pipeline, Session, TxQueue, TxState};
