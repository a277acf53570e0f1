//! Bounded connection pool.
//!
//! A semaphore caps the number of checked-out connections; idle ones sit
//! in a LIFO stack so the most-recently-used (warmest) connection is
//! handed out first. The idle stack uses `parking_lot::Mutex` (sync, held
//! very briefly) so checkin can happen in `Drop` without an async context.

use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::ClientConfig;
use crate::connection::conn::{ConnState, Connection};
use crate::error::{Error, Result};

pub struct ConnectionPool {
    /// Idle connections, most-recently-used at the back.
    idle: SyncMutex<VecDeque<Connection>>,
    /// Limits total checked-out connections.
    semaphore: Semaphore,
    config: ClientConfig,
    /// Target address for every pooled connection.
    addr: String,
    max_size: usize,
    /// How long checkout may wait for a free slot.
    pool_timeout: Duration,
    /// Idle connections older than this are discarded at checkout.
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(config: ClientConfig) -> Self {
        let addr = config.addr();
        Self::for_addr(config, addr)
    }

    /// A pool whose connections dial `addr` but keep the config's prelude
    /// (used by the cluster router for per-node pools).
    pub fn for_addr(config: ClientConfig, addr: String) -> Self {
        let max_size = config.pool_size;
        Self {
            idle: SyncMutex::new(VecDeque::with_capacity(max_size)),
            semaphore: Semaphore::new(max_size),
            pool_timeout: config.pool_timeout,
            idle_timeout: config.idle_timeout,
            addr,
            max_size,
            config,
        }
    }

    /// Check out a connection, waiting up to `pool_timeout` for a slot.
    ///
    /// Non-viable idle connections (broken, closed, stale, or inherited
    /// from another process) are discarded and replaced lazily.
    pub async fn get(&self) -> Result<PoolGuard<'_>> {
        let acquire = self.semaphore.acquire();
        let permit = match tokio::time::timeout(self.pool_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::Connection(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "pool is shut down",
                )));
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "no pool connection available within {:?}",
                    self.pool_timeout
                )));
            }
        };

        // Sync lock, held only to pop.
        let reused = {
            let mut idle = self.idle.lock();
            self.pop_viable(&mut idle)
        };

        let mut conn = match reused {
            Some(conn) => conn,
            None => Connection::to_addr(self.config.clone(), self.addr.clone()),
        };
        conn.ensure_connected().await?;

        Ok(PoolGuard {
            conn: Some(conn),
            pool: self,
            _permit: permit,
        })
    }

    fn pop_viable(&self, idle: &mut VecDeque<Connection>) -> Option<Connection> {
        while let Some(conn) = idle.pop_back() {
            if conn.is_viable(self.idle_timeout) {
                return Some(conn);
            }
            // Dropping closes the socket (same-process connections only
            // ever land here; fork-inherited ones fail is_viable and are
            // abandoned by their own ensure_connected path).
        }
        None
    }

    /// Return a connection (sync — callable from Drop). Broken and closed
    /// connections are dropped instead.
    fn checkin(&self, conn: Connection) {
        if conn.state() != ConnState::Open || !conn.is_viable(self.idle_timeout) {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_size {
            idle.push_back(conn);
        }
    }

    /// Close all idle connections. Checked-out connections are closed by
    /// their borrowers on checkin.
    pub fn close(&self) {
        let mut idle = self.idle.lock();
        for mut conn in idle.drain(..) {
            conn.close();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Free checkout slots (roughly `max_size - checked_out`).
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// RAII guard returning the connection to the pool on drop.
pub struct PoolGuard<'a> {
    conn: Option<Connection>,
    pool: &'a ConnectionPool,
    _permit: SemaphorePermit<'a>,
}

impl std::fmt::Debug for PoolGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish_non_exhaustive()
    }
}

impl PoolGuard<'_> {
    pub fn conn(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already taken")
    }

    /// Remove the connection from pool management entirely.
    pub fn take(mut self) -> Connection {
        self.conn.take().expect("connection already taken")
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::types::Reply;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Mock server answering +OK to every chunk received.
    async fn ok_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                if socket.write_all(b"+OK\r\n").await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        addr
    }

    fn pool_config(addr: &str, pool_size: usize) -> ClientConfig {
        let (host, port) = addr.rsplit_once(':').unwrap();
        ClientConfig {
            host: host.to_string(),
            port: port.parse().unwrap(),
            pool_size,
            pool_timeout: Duration::from_millis(100),
            timeout: Some(Duration::from_secs(1)),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn checkout_and_checkin() {
        let addr = ok_server().await;
        let pool = ConnectionPool::new(pool_config(&addr, 3));

        assert_eq!(pool.max_size(), 3);
        assert_eq!(pool.available(), 3);

        let mut guard = pool.get().await.unwrap();
        assert_eq!(pool.available(), 2);

        let reply = guard.conn().call1("PING").await.unwrap();
        assert_eq!(reply, Reply::SimpleString("OK".into()));

        drop(guard);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn reuses_most_recent_connection() {
        let addr = ok_server().await;
        let pool = ConnectionPool::new(pool_config(&addr, 3));

        {
            let mut guard = pool.get().await.unwrap();
            guard.conn().call1("PING").await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);

        {
            let _guard = pool.get().await.unwrap();
            // The idle connection was taken, not a new one created.
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn checkout_blocks_until_pool_timeout() {
        let addr = ok_server().await;
        let pool = ConnectionPool::new(pool_config(&addr, 1));

        let g1 = pool.get().await.unwrap();
        let result = pool.get().await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        drop(g1);
        let _g2 = pool.get().await.unwrap();
    }

    #[tokio::test]
    async fn broken_connection_not_checked_in() {
        let addr = ok_server().await;
        let pool = ConnectionPool::new(pool_config(&addr, 2));

        {
            let mut guard = pool.get().await.unwrap();
            guard.conn().call1("PING").await.unwrap();
            guard.conn().close();
        }
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn take_removes_from_pool() {
        let addr = ok_server().await;
        let pool = ConnectionPool::new(pool_config(&addr, 2));

        let guard = pool.get().await.unwrap();
        let _conn = guard.take();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn stale_idle_connection_is_replaced() {
        let addr = ok_server().await;
        let mut config = pool_config(&addr, 2);
        config.idle_timeout = Duration::from_millis(30);
        let pool = ConnectionPool::new(config);

        {
            let mut guard = pool.get().await.unwrap();
            guard.conn().call1("PING").await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // The stale connection is discarded and a fresh one dialed.
        let mut guard = pool.get().await.unwrap();
        guard.conn().call1("PING").await.unwrap();
    }

    #[tokio::test]
    async fn close_drains_idle() {
        let addr = ok_server().await;
        let pool = ConnectionPool::new(pool_config(&addr, 2));
        {
            let mut guard = pool.get().await.unwrap();
            guard.conn().call1("PING").await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);
        pool.close();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn connect_failure_propagates() {
        let config = ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            pool_size: 1,
            pool_timeout: Duration::from_millis(200),
            timeout: Some(Duration::from_millis(100)),
            ..ClientConfig::default()
        };
        let pool = ConnectionPool::new(config);
        assert!(pool.get().await.is_err());
    }

    #[tokio::test]
    async fn failed_checkout_releases_permit() {
        let config = ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            pool_size: 1,
            pool_timeout: Duration::from_millis(200),
            timeout: Some(Duration::from_millis(50)),
            ..ClientConfig::default()
        };
        let pool = ConnectionPool::new(config);
        assert!(pool.get().await.is_err());
        // The permit from the failed attempt must be back.
        assert_eq!(pool.available(), 1);
    }
}
