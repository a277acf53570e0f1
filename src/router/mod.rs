pub mod cluster;
pub mod sentinel;

pub use cluster::ClusterRouter;
pub use sentinel::{SentinelClient, SentinelResolver};
