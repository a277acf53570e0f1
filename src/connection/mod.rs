pub mod conn;
pub mod pool;
pub mod stream;
pub mod transport;

pub use conn::{ConnState, Connection, SubState};
pub use pool::{ConnectionPool, PoolGuard};
pub use stream::FramedStream;
pub use transport::Transport;
