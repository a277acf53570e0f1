//! A single connection to a Redis server.
//!
//! Owns the socket, runs the prelude (AUTH / SELECT / optional HELLO) on
//! every (re)connect, and records the owning process identity so that a
//! forked child never reuses the parent's socket: the child abandons the
//! inherited descriptor without closing it — closing would disturb the
//! parent — and dials fresh.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::ClientConfig;
use crate::connection::stream::FramedStream;
use crate::connection::transport::Transport;
use crate::error::{Error, Result};
use crate::resp::types::Reply;
use crate::resp::writer::{encode_command, encode_pipeline};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Never connected (or abandoned after a fork).
    Fresh,
    /// Socket live, prelude complete.
    Open,
    /// Socket exists but the last I/O failed.
    Broken,
    /// Explicitly torn down.
    Closed,
}

/// Subscribe-mode state, gating which frames a read may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Normal,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("owner_pid", &self.owner_pid)
            .field("sub_state", &self.sub_state)
            .finish_non_exhaustive()
    }
}

pub struct Connection {
    config: ClientConfig,
    /// Target address; differs from the config's for cluster node and
    /// sentinel-resolved connections.
    addr: String,
    state: ConnState,
    stream: Option<FramedStream<Transport>>,
    /// Process identity recorded when the socket was opened.
    owner_pid: u32,
    sub_state: SubState,
    /// Out-of-band `invalidate` pushes seen while reading replies.
    invalidations: VecDeque<Reply>,
    timeout: Duration,
    pub last_used: Instant,
}

impl Connection {
    pub fn new(config: ClientConfig) -> Self {
        let addr = config.addr();
        Self::to_addr(config, addr)
    }

    /// A connection to an explicit address, keeping the config's prelude
    /// (credentials, db, timeouts).
    pub fn to_addr(config: ClientConfig, addr: String) -> Self {
        let timeout = config.effective_timeout();
        Self {
            config,
            addr,
            state: ConnState::Fresh,
            stream: None,
            owner_pid: std::process::id(),
            sub_state: SubState::Normal,
            invalidations: VecDeque::new(),
            timeout,
            last_used: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn sub_state(&self) -> SubState {
        self.sub_state
    }

    pub fn set_sub_state(&mut self, state: SubState) {
        self.sub_state = state;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True when the pool may hand this connection to a borrower.
    pub fn is_viable(&self, idle_timeout: Duration) -> bool {
        matches!(self.state, ConnState::Open | ConnState::Fresh)
            && self.owner_pid == std::process::id()
            && self.last_used.elapsed() <= idle_timeout
    }

    /// The gate on every user-visible I/O.
    ///
    /// Check order matters: process identity first (a forked child must
    /// abandon, not close, the parent's socket), then socket presence,
    /// then connect-and-prelude.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.owner_pid != std::process::id() {
            tracing::debug!(addr = %self.addr, "process fork detected, abandoning inherited socket");
            self.abandon();
        }
        if matches!(self.state, ConnState::Closed | ConnState::Broken) || self.stream.is_none() {
            // A Broken socket belongs to this process, so dropping (and
            // closing) it here is safe.
            self.stream = None;
            self.state = ConnState::Fresh;
        }
        if self.state == ConnState::Fresh {
            self.open().await?;
        }
        Ok(())
    }

    /// Drop the socket reference without closing the descriptor.
    fn abandon(&mut self) {
        if let Some(stream) = self.stream.take() {
            std::mem::forget(stream.into_inner());
        }
        self.state = ConnState::Fresh;
        self.sub_state = SubState::Normal;
    }

    /// Tear down explicitly. Any → Closed.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = ConnState::Closed;
        self.sub_state = SubState::Normal;
    }

    /// Drop a broken socket and dial again (prelude replays).
    pub async fn reconnect(&mut self) -> Result<()> {
        self.stream = None;
        self.state = ConnState::Fresh;
        self.open().await
    }

    async fn open(&mut self) -> Result<()> {
        let transport = Transport::connect(&self.config, &self.addr, self.timeout).await?;
        self.stream = Some(FramedStream::new(transport, self.config.max_buffer_size));
        self.owner_pid = std::process::id();
        self.state = ConnState::Open;
        self.sub_state = SubState::Normal;
        self.last_used = Instant::now();

        if let Err(e) = self.prelude().await {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// AUTH / SELECT (or HELLO with folded AUTH when RESP3 is requested),
    /// each within the default timeout.
    async fn prelude(&mut self) -> Result<()> {
        if self.config.resp3 {
            let mut args: Vec<Vec<u8>> = vec![b"HELLO".to_vec(), b"3".to_vec()];
            if let Some(password) = self.config.password.clone() {
                args.push(b"AUTH".to_vec());
                args.push(
                    self.config
                        .username
                        .clone()
                        .unwrap_or_else(|| "default".to_string())
                        .into_bytes(),
                );
                args.push(password.into_bytes());
            }
            let reply = self.call(&args).await?;
            if let Some(msg) = reply.error_message() {
                return Err(Error::server(msg.to_string()));
            }
        } else if let Some(password) = self.config.password.clone() {
            let reply = match self.config.username.clone() {
                Some(user) => {
                    self.call3("AUTH", user.as_bytes(), password.as_bytes())
                        .await?
                }
                None => self.call2("AUTH", password.as_bytes()).await?,
            };
            expect_ok("AUTH", &reply)?;
        }

        if self.config.db > 0 {
            let db = self.config.db.to_string();
            let reply = self.call2("SELECT", db.as_bytes()).await?;
            expect_ok("SELECT", &reply)?;
        }
        Ok(())
    }

    // ── Calls ──────────────────────────────────────────────────────

    /// Send one command and read its reply.
    ///
    /// Server error replies come back as `Reply::Error` values; only
    /// transport, timeout and framing failures are `Err`.
    pub async fn call<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        let frame = encode_command(args);
        self.send(&frame).await?;
        self.read_reply().await
    }

    /// One-argument fast path (no argument vector allocation).
    pub async fn call1(&mut self, cmd: &str) -> Result<Reply> {
        self.call(&[cmd.as_bytes()]).await
    }

    /// Two-argument fast path.
    pub async fn call2(&mut self, cmd: &str, arg: &[u8]) -> Result<Reply> {
        self.call(&[cmd.as_bytes(), arg]).await
    }

    /// Three-argument fast path.
    pub async fn call3(&mut self, cmd: &str, arg1: &[u8], arg2: &[u8]) -> Result<Reply> {
        self.call(&[cmd.as_bytes(), arg1, arg2]).await
    }

    /// Write all commands as one buffer, then read exactly one reply per
    /// command. A per-command error reply does not stop the reads; it is
    /// kept positionally.
    pub async fn pipeline<A: AsRef<[u8]>>(&mut self, commands: &[Vec<A>]) -> Result<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let buf = encode_pipeline(commands);
        self.send(&buf).await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_reply().await?);
        }
        Ok(replies)
    }

    /// Raw buffer write under the write deadline.
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        let stream = self.stream_mut()?;
        match stream.write_all(frame, timeout).await {
            Ok(()) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.state = ConnState::Broken;
                Err(e)
            }
        }
    }

    /// Read the next reply under the read deadline.
    ///
    /// In normal mode, `invalidate` pushes are siphoned off for the cache
    /// and the read continues; in subscribe mode every frame is returned
    /// to the caller.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        self.read_reply_within(self.timeout).await
    }

    /// Like [`Connection::read_reply`] with an explicit budget (used by
    /// the subscribe teardown drain).
    pub async fn read_reply_within(&mut self, budget: Duration) -> Result<Reply> {
        self.read_reply_inner(budget, true).await
    }

    /// Read with `budget`, treating a timeout as plain silence rather
    /// than connection damage. Used while waiting for pub/sub traffic,
    /// where no reply is outstanding.
    pub async fn read_reply_soft(&mut self, budget: Duration) -> Result<Reply> {
        self.read_reply_inner(budget, false).await
    }

    async fn read_reply_inner(&mut self, budget: Duration, timeout_breaks: bool) -> Result<Reply> {
        let in_subscribe = self.sub_state != SubState::Normal;
        loop {
            let stream = self.stream_mut()?;
            let frame = match stream.read_frame(budget).await {
                Ok(frame) => frame,
                Err(e) => {
                    if timeout_breaks || !matches!(e, Error::Timeout(_)) {
                        self.state = ConnState::Broken;
                    }
                    return Err(e);
                }
            };
            self.last_used = Instant::now();

            if let Reply::Push { kind, data } = &frame {
                if kind == "invalidate" {
                    self.invalidations.push_back(Reply::Push {
                        kind: kind.clone(),
                        data: data.clone(),
                    });
                    if !in_subscribe {
                        continue;
                    }
                } else if !in_subscribe {
                    tracing::debug!(kind = %kind, "dropping unsolicited push frame");
                    continue;
                }
            }
            return Ok(frame);
        }
    }

    /// Invalidation pushes collected since the last drain.
    pub fn take_invalidations(&mut self) -> Vec<Reply> {
        self.invalidations.drain(..).collect()
    }

    fn stream_mut(&mut self) -> Result<&mut FramedStream<Transport>> {
        self.stream.as_mut().ok_or_else(|| {
            Error::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection is not open",
            ))
        })
    }

    #[cfg(test)]
    pub(crate) fn pretend_forked(&mut self) {
        // Make the recorded owner differ from the real pid, as a child
        // process would observe after fork.
        self.owner_pid = self.owner_pid.wrapping_add(1);
    }

    #[cfg(test)]
    pub(crate) fn owner_pid(&self) -> u32 {
        self.owner_pid
    }
}

fn expect_ok(what: &str, reply: &Reply) -> Result<()> {
    if let Some(msg) = reply.error_message() {
        return Err(Error::server(msg.to_string()));
    }
    if reply.is_ok() {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "unexpected {what} reply: {}",
            reply.type_name()
        )))
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd;
    use crate::testutil::scripted_server;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    fn config_for(addr: &str) -> ClientConfig {
        let (host, port) = addr.rsplit_once(':').unwrap();
        ClientConfig {
            host: host.to_string(),
            port: port.parse().unwrap(),
            timeout: Some(Duration::from_secs(1)),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn connect_and_call() {
        let (addr, _) = scripted_server(vec![b"+PONG\r\n"]).await;
        let mut conn = Connection::new(config_for(&addr));
        conn.ensure_connected().await.unwrap();
        assert_eq!(conn.state(), ConnState::Open);

        let reply = conn.call1("PING").await.unwrap();
        assert_eq!(reply, Reply::SimpleString("PONG".into()));
    }

    #[tokio::test]
    async fn no_prelude_without_password_or_db() {
        let (addr, log) = scripted_server(vec![b"+PONG\r\n"]).await;
        let mut conn = Connection::new(config_for(&addr));
        conn.ensure_connected().await.unwrap();
        conn.call1("PING").await.unwrap();

        let commands = log.lock().clone();
        assert_eq!(commands, vec![vec!["PING".to_string()]]);
    }

    #[tokio::test]
    async fn prelude_auth_and_select() {
        let (addr, log) = scripted_server(vec![b"+OK\r\n", b"+OK\r\n", b"+PONG\r\n"]).await;
        let mut config = config_for(&addr);
        config.password = Some("secret".to_string());
        config.db = 2;

        let mut conn = Connection::new(config);
        conn.ensure_connected().await.unwrap();
        conn.call1("PING").await.unwrap();

        let commands = log.lock().clone();
        assert_eq!(
            commands,
            vec![
                vec!["AUTH".to_string(), "secret".to_string()],
                vec!["SELECT".to_string(), "2".to_string()],
                vec!["PING".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn prelude_auth_with_username() {
        let (addr, log) = scripted_server(vec![b"+OK\r\n", b"+PONG\r\n"]).await;
        let mut config = config_for(&addr);
        config.username = Some("admin".to_string());
        config.password = Some("secret".to_string());

        let mut conn = Connection::new(config);
        conn.ensure_connected().await.unwrap();
        conn.call1("PING").await.unwrap();

        assert_eq!(
            log.lock()[0],
            vec!["AUTH".to_string(), "admin".to_string(), "secret".to_string()]
        );
    }

    #[tokio::test]
    async fn db_zero_sends_no_select() {
        let (addr, log) = scripted_server(vec![b"+PONG\r\n"]).await;
        let mut config = config_for(&addr);
        config.db = 0;

        let mut conn = Connection::new(config);
        conn.ensure_connected().await.unwrap();
        conn.call1("PING").await.unwrap();

        let commands = log.lock().clone();
        assert!(commands.iter().all(|c| c[0] != "SELECT"));
    }

    #[tokio::test]
    async fn resp3_prelude_sends_hello_with_folded_auth() {
        let (addr, log) = scripted_server(vec![b"%0\r\n", b"+OK\r\n", b"+PONG\r\n"]).await;
        let mut config = config_for(&addr);
        config.resp3 = true;
        config.password = Some("pw".to_string());
        config.db = 1;

        let mut conn = Connection::new(config);
        conn.ensure_connected().await.unwrap();
        conn.call1("PING").await.unwrap();

        let commands = log.lock().clone();
        assert_eq!(
            commands[0],
            vec![
                "HELLO".to_string(),
                "3".to_string(),
                "AUTH".to_string(),
                "default".to_string(),
                "pw".to_string(),
            ]
        );
        assert_eq!(commands[1], vec!["SELECT".to_string(), "1".to_string()]);
    }

    #[tokio::test]
    async fn auth_failure_closes_connection() {
        let (addr, _) = scripted_server(vec![b"-ERR invalid password\r\n"]).await;
        let mut config = config_for(&addr);
        config.password = Some("wrong".to_string());

        let mut conn = Connection::new(config);
        let result = conn.ensure_connected().await;
        assert!(matches!(result, Err(Error::Command { .. })));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn fork_detection_replays_prelude_on_new_socket() {
        let (addr, log) = scripted_server(vec![
            b"+OK\r\n",   // AUTH (first socket)
            b"+OK\r\n",   // SELECT
            b"+PONG\r\n", // PING
            b"+OK\r\n",   // AUTH (second socket)
            b"+OK\r\n",   // SELECT
            b"$1\r\nv\r\n", // GET
        ])
        .await;
        let mut config = config_for(&addr);
        config.password = Some("secret".to_string());
        config.db = 2;

        let mut conn = Connection::new(config);
        conn.ensure_connected().await.unwrap();
        conn.call1("PING").await.unwrap();
        let pid_before = conn.owner_pid();

        conn.pretend_forked();
        conn.ensure_connected().await.unwrap();
        assert_eq!(conn.owner_pid(), std::process::id());
        assert_ne!(conn.owner_pid(), pid_before.wrapping_add(1));

        let reply = conn.call2("GET", b"k").await.unwrap();
        assert_eq!(reply, Reply::BulkString(Bytes::from_static(b"v")));

        let commands = log.lock().clone();
        let flat: Vec<String> = commands.iter().map(|c| c.join(" ")).collect();
        assert_eq!(
            flat,
            vec![
                "AUTH secret",
                "SELECT 2",
                "PING",
                "AUTH secret",
                "SELECT 2",
                "GET k",
            ]
        );
    }

    #[tokio::test]
    async fn pipeline_reads_positionally() {
        let (addr, _) =
            scripted_server(vec![b"+OK\r\n", b"-WRONGTYPE not an integer\r\n", b":3\r\n"]).await;
        let mut conn = Connection::new(config_for(&addr));
        conn.ensure_connected().await.unwrap();

        let commands: Vec<Vec<Vec<u8>>> = vec![
            cmd!("SET", "k", "v"),
            cmd!("INCR", "k"),
            cmd!("DEL", "k"),
        ];
        let replies = conn.pipeline(&commands).await.unwrap();
        assert_eq!(replies.len(), 3);
        assert!(replies[0].is_ok());
        assert!(replies[1].is_error());
        assert_eq!(replies[2], Reply::Integer(3));
    }

    #[tokio::test]
    async fn read_timeout_marks_broken() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            // Hold the socket open, never respond.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut config = config_for(&addr);
        config.timeout = Some(Duration::from_millis(50));
        let mut conn = Connection::new(config);
        conn.ensure_connected().await.unwrap();

        let result = conn.call1("PING").await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(conn.state(), ConnState::Broken);
    }

    #[tokio::test]
    async fn broken_connection_reconnects_via_ensure() {
        let (addr, _) = scripted_server(vec![b"+PONG\r\n", b"+PONG\r\n"]).await;
        let mut conn = Connection::new(config_for(&addr));
        conn.ensure_connected().await.unwrap();
        conn.call1("PING").await.unwrap();

        conn.state = ConnState::Broken;
        conn.ensure_connected().await.unwrap();
        assert_eq!(conn.state(), ConnState::Open);
        let reply = conn.call1("PING").await.unwrap();
        assert_eq!(reply, Reply::SimpleString("PONG".into()));
    }

    #[tokio::test]
    async fn reconnect_replays_prelude() {
        let (addr, log) = scripted_server(vec![
            b"+OK\r\n",   // AUTH (first socket)
            b"+OK\r\n",   // AUTH (second socket)
            b"+PONG\r\n", // PING
        ])
        .await;
        let mut config = config_for(&addr);
        config.password = Some("pw".to_string());

        let mut conn = Connection::new(config);
        conn.ensure_connected().await.unwrap();

        conn.reconnect().await.unwrap();
        assert_eq!(conn.state(), ConnState::Open);
        conn.call1("PING").await.unwrap();

        let flat: Vec<String> = log.lock().iter().map(|c| c.join(" ")).collect();
        assert_eq!(flat, vec!["AUTH pw", "AUTH pw", "PING"]);
    }

    #[tokio::test]
    async fn close_then_reuse_reopens() {
        let (addr, _) = scripted_server(vec![b"+PONG\r\n", b"+PONG\r\n"]).await;
        let mut conn = Connection::new(config_for(&addr));
        conn.ensure_connected().await.unwrap();
        conn.call1("PING").await.unwrap();

        conn.close();
        assert_eq!(conn.state(), ConnState::Closed);

        conn.ensure_connected().await.unwrap();
        assert_eq!(conn.state(), ConnState::Open);
        conn.call1("PING").await.unwrap();
    }

    #[tokio::test]
    async fn invalidate_pushes_are_intercepted() {
        // Response interleaves an invalidate push before the real reply.
        let (addr, _) = scripted_server(vec![
            b">2\r\n$10\r\ninvalidate\r\n*1\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
        ])
        .await;
        let mut conn = Connection::new(config_for(&addr));
        conn.ensure_connected().await.unwrap();

        let reply = conn.call2("GET", b"foo").await.unwrap();
        assert_eq!(reply, Reply::BulkString(Bytes::from_static(b"bar")));

        let pushes = conn.take_invalidations();
        assert_eq!(pushes.len(), 1);
        match &pushes[0] {
            Reply::Push { kind, data } => {
                assert_eq!(kind, "invalidate");
                assert_eq!(data.len(), 1);
            }
            other => panic!("expected Push, got {other:?}"),
        }
        assert!(conn.take_invalidations().is_empty());
    }

    #[tokio::test]
    async fn call_on_fresh_connection_fails_without_ensure() {
        let mut conn = Connection::new(ClientConfig::default());
        let result = conn.call1("PING").await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }
}
