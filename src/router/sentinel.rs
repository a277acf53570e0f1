//! Sentinel-based address discovery.
//!
//! [`SentinelResolver`] queries a pool of sentinels for the current
//! master (or replicas) of a named service, validates what they report,
//! and verifies the role of the node it ends up connected to. A failover
//! resets the resolver so the next call rediscovers.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{ClientConfig, Role};
use crate::connection::conn::Connection;
use crate::error::{Error, Result};
use crate::resp::types::Reply;
use crate::retry::RetryPolicy;

pub struct SentinelResolver {
    /// Sentinel addresses, most-recently-successful first.
    sentinels: RwLock<Vec<(String, u16)>>,
    service: String,
    config: ClientConfig,
    min_other_sentinels: usize,
    /// Last resolved master; cleared on reset so discovery reruns.
    cached_master: RwLock<Option<(String, u16)>>,
    /// Round-robin cursor over healthy replicas.
    replica_cursor: AtomicUsize,
}

impl SentinelResolver {
    /// Build a resolver from the config's `sentinels`, `service_name`,
    /// `min_other_sentinels` and `sentinel_password`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.sentinels.is_empty() {
            return Err(Error::Config("at least one sentinel is required".into()));
        }
        let service = config
            .service_name
            .clone()
            .ok_or_else(|| Error::Config("sentinel mode requires a service_name".into()))?;
        Ok(Self {
            sentinels: RwLock::new(config.sentinels.clone()),
            service,
            min_other_sentinels: config.min_other_sentinels,
            cached_master: RwLock::new(None),
            replica_cursor: AtomicUsize::new(0),
            config,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current sentinel order (front = most recently successful).
    pub fn sentinel_addrs(&self) -> Vec<(String, u16)> {
        self.sentinels.read().clone()
    }

    /// Forget the resolved master; the next call rediscovers.
    pub fn reset(&self) {
        *self.cached_master.write() = None;
    }

    /// The prelude config used when talking to a sentinel (its own
    /// password, no database selection).
    fn sentinel_config(&self) -> ClientConfig {
        ClientConfig {
            username: None,
            password: self.config.sentinel_password.clone(),
            db: 0,
            resp3: false,
            ..self.config.clone()
        }
    }

    /// Ask each sentinel in order for the service's master. The first
    /// sentinel that reports a healthy master wins and is promoted to
    /// the front of the list.
    pub async fn discover_master(&self) -> Result<(String, u16)> {
        let sentinels = self.sentinel_addrs();
        for (index, (host, port)) in sentinels.iter().enumerate() {
            let addr = format!("{host}:{port}");
            let Ok(entries) = self.query(&addr, &["SENTINEL", "MASTERS"]).await else {
                continue;
            };
            let found = entries
                .iter()
                .find(|e| e.get("name").map(String::as_str) == Some(self.service.as_str()))
                .filter(|e| self.master_is_healthy(e))
                .and_then(entry_addr);
            if let Some(master) = found {
                tracing::debug!(service = %self.service, master = %master.0, "sentinel resolved master");
                self.promote(index);
                *self.cached_master.write() = Some(master.clone());
                return Ok(master);
            }
        }
        Err(Error::MasterNotFound(format!(
            "no sentinel reported a healthy master for '{}'",
            self.service
        )))
    }

    /// Healthy replicas of the service, in sentinel-reported order.
    pub async fn discover_replicas(&self) -> Result<Vec<(String, u16)>> {
        let sentinels = self.sentinel_addrs();
        for (host, port) in &sentinels {
            let addr = format!("{host}:{port}");
            let Ok(entries) = self
                .query(&addr, &["SENTINEL", "REPLICAS", &self.service])
                .await
            else {
                continue;
            };
            let replicas: Vec<(String, u16)> = entries
                .iter()
                .filter(|e| replica_is_healthy(e))
                .filter_map(entry_addr)
                .collect();
            if !replicas.is_empty() {
                return Ok(replicas);
            }
        }
        Err(Error::ReplicaNotFound(format!(
            "no sentinel reported a healthy replica for '{}'",
            self.service
        )))
    }

    /// The next replica in round-robin order.
    pub async fn next_replica(&self) -> Result<(String, u16)> {
        let replicas = self.discover_replicas().await?;
        let index = self.replica_cursor.fetch_add(1, Ordering::Relaxed) % replicas.len();
        Ok(replicas[index].clone())
    }

    /// Learn additional sentinels from the ones already known
    /// (`SENTINEL SENTINELS <service>`) and append any new addresses to
    /// the list.
    pub async fn discover_sentinels(&self) -> Result<usize> {
        let sentinels = self.sentinel_addrs();
        for (host, port) in &sentinels {
            let addr = format!("{host}:{port}");
            let Ok(entries) = self
                .query(&addr, &["SENTINEL", "SENTINELS", &self.service])
                .await
            else {
                continue;
            };
            let mut added = 0;
            let mut list = self.sentinels.write();
            for peer in entries.iter().filter_map(entry_addr) {
                if !list.contains(&peer) {
                    tracing::debug!(sentinel = %peer.0, port = peer.1, "learned new sentinel");
                    list.push(peer);
                    added += 1;
                }
            }
            return Ok(added);
        }
        Err(Error::Config("no sentinel reachable for discovery".into()))
    }

    /// Resolve an address for `role` and dial it, replaying the prelude
    /// and verifying the node really has that role. A role mismatch
    /// resets the resolver and raises `Failover`.
    pub async fn connect(&self, role: Role) -> Result<Connection> {
        let (host, port) = match role {
            Role::Master => {
                let cached = self.cached_master.read().clone();
                match cached {
                    Some(addr) => addr,
                    None => self.discover_master().await?,
                }
            }
            Role::Replica => self.next_replica().await?,
        };

        let mut conn = Connection::to_addr(self.config.clone(), format!("{host}:{port}"));
        if let Err(e) = conn.ensure_connected().await {
            self.reset();
            return Err(e);
        }
        self.verify_role(&mut conn, role).await?;
        Ok(conn)
    }

    /// `ROLE` must agree with what the resolver intended to connect to.
    pub async fn verify_role(&self, conn: &mut Connection, role: Role) -> Result<()> {
        let reply = conn.call1("ROLE").await?;
        if let Some(msg) = reply.error_message() {
            return Err(Error::server(msg.to_string()));
        }
        let reported = match &reply {
            Reply::Array(items) => items.first().and_then(Reply::as_str).map(str::to_string),
            _ => None,
        };
        let expected = match role {
            Role::Master => "master",
            Role::Replica => "slave",
        };
        if reported.as_deref() == Some(expected) {
            Ok(())
        } else {
            self.reset();
            Err(Error::Failover(format!(
                "expected role {expected}, node reported {:?}",
                reported.unwrap_or_else(|| "unknown".to_string())
            )))
        }
    }

    /// Run one command against a sentinel and parse the reply into field
    /// maps (one per master/replica entry).
    async fn query(&self, addr: &str, args: &[&str]) -> Result<Vec<HashMap<String, String>>> {
        let mut conn = Connection::to_addr(self.sentinel_config(), addr.to_string());
        conn.ensure_connected().await?;
        let reply = conn.call(args).await?;
        if let Some(msg) = reply.error_message() {
            return Err(Error::server(msg.to_string()));
        }
        let Reply::Array(entries) = reply else {
            return Err(Error::Protocol(format!(
                "unexpected sentinel reply: {}",
                reply.type_name()
            )));
        };
        Ok(entries.iter().filter_map(entry_fields).collect())
    }

    fn master_is_healthy(&self, entry: &HashMap<String, String>) -> bool {
        let flags = entry.get("flags").map(String::as_str).unwrap_or("");
        let role_ok = entry.get("role-reported").map(String::as_str) == Some("master")
            || flags.split(',').any(|f| f == "master");
        let down = flags
            .split(',')
            .any(|f| f == "s_down" || f == "o_down");
        let quorum = entry
            .get("num-other-sentinels")
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0)
            >= self.min_other_sentinels;
        role_ok && !down && quorum
    }

    /// Move the sentinel at `index` to the front of the list.
    fn promote(&self, index: usize) {
        if index == 0 {
            return;
        }
        let mut sentinels = self.sentinels.write();
        if index < sentinels.len() {
            let winner = sentinels.remove(index);
            sentinels.insert(0, winner);
        }
    }
}

fn replica_is_healthy(entry: &HashMap<String, String>) -> bool {
    let flags = entry.get("flags").map(String::as_str).unwrap_or("");
    !flags
        .split(',')
        .any(|f| f == "s_down" || f == "o_down" || f == "disconnected")
}

/// A sentinel entry is a flat `[field, value, …]` array (RESP2) or a map
/// (RESP3).
fn entry_fields(entry: &Reply) -> Option<HashMap<String, String>> {
    match entry {
        Reply::Array(items) => {
            let mut fields = HashMap::with_capacity(items.len() / 2);
            let mut iter = items.iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                    fields.insert(k.to_string(), v.to_string());
                }
            }
            Some(fields)
        }
        Reply::Map(pairs) => {
            let mut fields = HashMap::with_capacity(pairs.len());
            for (k, v) in pairs {
                if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                    fields.insert(k.to_string(), v.to_string());
                }
            }
            Some(fields)
        }
        _ => None,
    }
}

fn entry_addr(entry: &HashMap<String, String>) -> Option<(String, u16)> {
    let host = entry.get("ip")?.clone();
    let port = entry.get("port")?.parse().ok()?;
    Some((host, port))
}

// ── Sentinel-backed client ─────────────────────────────────────────

/// A single-connection client whose address comes from sentinel
/// discovery. Connection failures and READONLY replies trigger
/// rediscovery.
pub struct SentinelClient {
    resolver: SentinelResolver,
    role: Role,
    retry: RetryPolicy,
    conn: Option<Connection>,
}

impl SentinelClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let role = config.role;
        let retry = config.effective_retry_policy();
        Ok(Self {
            resolver: SentinelResolver::new(config)?,
            role,
            retry,
            conn: None,
        })
    }

    pub fn resolver(&self) -> &SentinelResolver {
        &self.resolver
    }

    /// Issue one command against the resolved node.
    ///
    /// A READONLY reply on a master-role client means the node was
    /// demoted under us: reset, rediscover, retry once; a second
    /// READONLY surfaces. Transport failures reset and retry per the
    /// configured policy.
    pub async fn call<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        let mut readonly_retried = false;
        let mut attempts = 0u32;
        loop {
            if self.conn.is_none() {
                match self.resolver.connect(self.role).await {
                    Ok(conn) => self.conn = Some(conn),
                    Err(err) => {
                        attempts += 1;
                        if self.retry.should_retry(&err, attempts) {
                            self.retry.pause(&err, attempts).await;
                            continue;
                        }
                        return Err(err);
                    }
                }
            }
            let Some(conn) = self.conn.as_mut() else {
                continue;
            };

            match conn.call(args).await {
                Ok(reply) => {
                    if let Some(msg) = reply.error_message() {
                        let err = Error::server(msg.to_string());
                        if err.is_readonly() && self.role == Role::Master && !readonly_retried {
                            tracing::warn!(service = %self.resolver.service(), "write hit a demoted master, re-resolving");
                            readonly_retried = true;
                            self.resolver.reset();
                            self.conn = None;
                            continue;
                        }
                        return Err(err);
                    }
                    return Ok(reply);
                }
                Err(err) if err.is_retriable() => {
                    attempts += 1;
                    self.conn = None;
                    self.resolver.reset();
                    if self.retry.should_retry(&err, attempts) {
                        self.retry.pause(&err, attempts).await;
                        continue;
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
