//! Cluster topology router.
//!
//! Maintains a slot table built from `CLUSTER SLOTS`, routes each command
//! to the node owning its key's slot, and follows the server's redirect
//! protocol: `MOVED` rewrites the one slot it names, `ASK` is a one-shot
//! detour behind `ASKING`, `TRYAGAIN` backs off a bounded number of
//! times, `CLUSTERDOWN` is fatal. Multi-key commands whose keys hash to
//! different slots are rejected before any node is contacted.

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::connection::pool::ConnectionPool;
use crate::crc16::{key_slot, SLOT_COUNT};
use crate::error::{Error, Result, ServerErrorKind};
use crate::resp::types::Reply;

/// Redirects followed before giving up on one command.
const MAX_REDIRECTS: usize = 5;

/// TRYAGAIN attempts before surfacing the error.
const MAX_TRYAGAIN: usize = 3;

/// Sleep between TRYAGAIN attempts.
const TRYAGAIN_BACKOFF: Duration = Duration::from_millis(50);

// ── Key extraction ────────────────────────────────────────────────

/// All keys of a command, for slot derivation and cross-slot checks.
fn command_keys<'a, A: AsRef<[u8]>>(args: &'a [A]) -> Vec<&'a [u8]> {
    let Some(first) = args.first() else {
        return Vec::new();
    };
    let name = String::from_utf8_lossy(first.as_ref()).to_ascii_uppercase();
    match name.as_str() {
        // Key-less commands
        "PING" | "INFO" | "DBSIZE" | "CLUSTER" | "CONFIG" | "CLIENT" | "COMMAND" | "TIME"
        | "RANDOMKEY" | "WAIT" | "SAVE" | "BGSAVE" | "BGREWRITEAOF" | "FLUSHALL" | "FLUSHDB"
        | "LASTSAVE" | "SLOWLOG" | "SCRIPT" | "MULTI" | "EXEC" | "DISCARD" | "UNWATCH"
        | "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE" | "QUIT" | "ASKING" => {
            Vec::new()
        }
        // Every argument is a key
        "MGET" | "DEL" | "UNLINK" | "EXISTS" | "TOUCH" | "WATCH" => {
            args[1..].iter().map(|a| a.as_ref()).collect()
        }
        // Alternating key/value pairs
        "MSET" | "MSETNX" => args[1..].iter().step_by(2).map(|a| a.as_ref()).collect(),
        // numkeys at args[2], keys follow
        "EVAL" | "EVALSHA" | "FCALL" | "FCALL_RO" => {
            let numkeys = args
                .get(2)
                .and_then(|n| String::from_utf8_lossy(n.as_ref()).parse::<usize>().ok())
                .unwrap_or(0);
            args.iter()
                .skip(3)
                .take(numkeys)
                .map(|a| a.as_ref())
                .collect()
        }
        // Keys follow the STREAMS keyword (half keys, half ids)
        "XREAD" | "XREADGROUP" => {
            let streams_at = args
                .iter()
                .position(|a| a.as_ref().eq_ignore_ascii_case(b"STREAMS"));
            match streams_at {
                Some(at) => {
                    let rest = &args[at + 1..];
                    rest[..rest.len() / 2].iter().map(|a| a.as_ref()).collect()
                }
                None => Vec::new(),
            }
        }
        // Default: key at position 1
        _ => args.get(1).map(|a| vec![a.as_ref()]).unwrap_or_default(),
    }
}

/// The single slot all of a command's keys hash to, `None` for key-less
/// commands, or `CrossSlot` when the keys disagree.
fn slot_for<A: AsRef<[u8]>>(args: &[A]) -> Result<Option<u16>> {
    let keys = command_keys(args);
    let mut slot: Option<u16> = None;
    for key in keys {
        let s = key_slot(key);
        match slot {
            None => slot = Some(s),
            Some(prev) if prev != s => {
                return Err(Error::CrossSlot(format!(
                    "keys map to slots {prev} and {s}"
                )));
            }
            Some(_) => {}
        }
    }
    Ok(slot)
}

// ── Slot table ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct NodeEntry {
    primary: String,
    replicas: Vec<String>,
}

/// slot → owning node, one entry per slot so a `MOVED` can rewrite
/// exactly the slot it names.
struct SlotTable {
    slots: Vec<Option<Arc<NodeEntry>>>,
}

impl SlotTable {
    fn empty() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize],
        }
    }

    fn primary_for(&self, slot: u16) -> Option<String> {
        self.slots[slot as usize]
            .as_ref()
            .map(|node| node.primary.clone())
    }

    /// Rewrite one slot's owner (after a MOVED redirect). The rest of the
    /// table is untouched.
    fn set_primary(&mut self, slot: u16, addr: &str) {
        self.slots[slot as usize] = Some(Arc::new(NodeEntry {
            primary: addr.to_string(),
            replicas: Vec::new(),
        }));
    }

    fn primaries(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for node in self.slots.iter().flatten() {
            if !out.contains(&node.primary) {
                out.push(node.primary.clone());
            }
        }
        out
    }

    /// Build a full table from a `CLUSTER SLOTS` reply.
    fn from_cluster_slots(reply: &Reply) -> Result<Self> {
        let ranges = match reply {
            Reply::Array(items) => items,
            other => {
                return Err(Error::Cluster(format!(
                    "CLUSTER SLOTS: expected array, got {}",
                    other.type_name()
                )));
            }
        };

        let mut table = Self::empty();
        for range in ranges {
            let Reply::Array(items) = range else { continue };
            if items.len() < 3 {
                continue;
            }
            let (Some(start), Some(end)) = (items[0].as_int(), items[1].as_int()) else {
                return Err(Error::Cluster("CLUSTER SLOTS: invalid slot bounds".into()));
            };
            if start < 0 || end < start || end >= SLOT_COUNT as i64 {
                return Err(Error::Cluster(format!(
                    "CLUSTER SLOTS: bad range {start}-{end}"
                )));
            }

            let primary = node_addr(&items[2])?;
            let replicas = items[3..]
                .iter()
                .filter_map(|node| node_addr(node).ok())
                .collect();
            let entry = Arc::new(NodeEntry { primary, replicas });

            for slot in start..=end {
                table.slots[slot as usize] = Some(Arc::clone(&entry));
            }
        }
        Ok(table)
    }
}

/// `[host, port, …]` from a CLUSTER SLOTS node array → `host:port`.
fn node_addr(value: &Reply) -> Result<String> {
    let Reply::Array(items) = value else {
        return Err(Error::Cluster("CLUSTER SLOTS: expected node array".into()));
    };
    if items.len() < 2 {
        return Err(Error::Cluster("CLUSTER SLOTS: node array too short".into()));
    }
    let host = items[0]
        .as_str()
        .ok_or_else(|| Error::Cluster("CLUSTER SLOTS: invalid host".into()))?;
    let port = items[1]
        .as_int()
        .ok_or_else(|| Error::Cluster("CLUSTER SLOTS: invalid port".into()))?;
    Ok(format!("{host}:{port}"))
}

// ── Router ────────────────────────────────────────────────────────

pub struct ClusterRouter {
    /// Per-node pools, keyed by `host:port`. Grows lazily as redirects
    /// and refreshes reveal nodes.
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    table: RwLock<SlotTable>,
    config: ClientConfig,
    seeds: Vec<String>,
}

impl ClusterRouter {
    /// Connect to the first reachable seed, run `CLUSTER SLOTS`, and
    /// build the initial table.
    pub async fn new(seeds: Vec<(String, u16)>, config: ClientConfig) -> Result<Self> {
        if seeds.is_empty() {
            return Err(Error::Cluster("at least one seed node is required".into()));
        }
        let mut node_config = config.clone();
        node_config.db = 0; // cluster mode has a single keyspace

        let router = Self {
            pools: RwLock::new(HashMap::new()),
            table: RwLock::new(SlotTable::empty()),
            config: node_config,
            seeds: seeds
                .iter()
                .map(|(host, port)| format!("{host}:{port}"))
                .collect(),
        };

        let mut last_err = None;
        let seed_addrs = router.seeds.clone();
        for seed in &seed_addrs {
            match router.refresh_from(seed).await {
                Ok(()) => return Ok(router),
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::Cluster(format!(
            "no seed node reachable: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Re-read the topology from `addr`. The table is replaced wholly on
    /// success and left intact on failure.
    pub async fn refresh_from(&self, addr: &str) -> Result<()> {
        let pool = self.pool_for(addr);
        let mut guard = pool.get().await?;
        let reply = guard.conn().call2("CLUSTER", b"SLOTS").await?;
        if let Some(msg) = reply.error_message() {
            return Err(Error::server(msg.to_string()));
        }
        let table = SlotTable::from_cluster_slots(&reply)?;
        tracing::debug!(nodes = table.primaries().len(), "cluster topology refreshed");
        *self.table.write() = table;
        Ok(())
    }

    /// Full refresh from any currently known node (falling back to the
    /// seeds). Invoked lazily after failures, never on the happy path.
    pub async fn refresh(&self) -> Result<()> {
        let mut candidates = self.table.read().primaries();
        candidates.extend(self.seeds.iter().cloned());
        let mut last_err = None;
        for addr in candidates {
            match self.refresh_from(&addr).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Cluster("no node reachable for refresh".into())))
    }

    fn pool_for(&self, addr: &str) -> Arc<ConnectionPool> {
        if let Some(pool) = self.pools.read().get(addr) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write();
        Arc::clone(pools.entry(addr.to_string()).or_insert_with(|| {
            Arc::new(ConnectionPool::for_addr(
                self.config.clone(),
                addr.to_string(),
            ))
        }))
    }

    fn addr_for_slot(&self, slot: Option<u16>) -> Result<String> {
        let table = self.table.read();
        match slot {
            Some(slot) => table
                .primary_for(slot)
                .ok_or_else(|| Error::Cluster(format!("no node known for slot {slot}"))),
            None => self.random_primary_locked(&table),
        }
    }

    fn random_primary_locked(&self, table: &SlotTable) -> Result<String> {
        table
            .primaries()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| Error::Cluster("slot table is empty".into()))
    }

    /// A random primary (key-less commands, MULTI without WATCH).
    pub fn random_primary(&self) -> Result<String> {
        self.random_primary_locked(&self.table.read())
    }

    /// Route and execute one command, following redirects.
    pub async fn call<A: AsRef<[u8]>>(&self, args: &[A]) -> Result<Reply> {
        let slot = slot_for(args)?;
        let mut addr = self.addr_for_slot(slot)?;
        let mut asking = false;
        let mut redirects = 0usize;
        let mut tryagains = 0usize;

        loop {
            let pool = self.pool_for(&addr);
            let mut guard = pool.get().await?;
            if asking {
                let reply = guard.conn().call1("ASKING").await?;
                if let Some(msg) = reply.error_message() {
                    return Err(Error::server(msg.to_string()));
                }
            }
            let reply = guard.conn().call(args).await?;

            if !reply.is_error() {
                return Ok(reply);
            }
            let msg = reply.error_message().unwrap_or_default().to_string();
            match ServerErrorKind::classify(&msg) {
                ServerErrorKind::Moved {
                    slot: moved_slot,
                    addr: new_addr,
                } => {
                    redirects += 1;
                    if redirects > MAX_REDIRECTS {
                        return Err(Error::Cluster("too many MOVED redirects".into()));
                    }
                    tracing::debug!(slot = moved_slot, to = %new_addr, "following MOVED");
                    // Authoritative for that one slot only.
                    self.table.write().set_primary(moved_slot, &new_addr);
                    addr = new_addr;
                    asking = false;
                }
                ServerErrorKind::Ask { addr: new_addr, .. } => {
                    redirects += 1;
                    if redirects > MAX_REDIRECTS {
                        return Err(Error::Cluster("too many ASK redirects".into()));
                    }
                    tracing::debug!(to = %new_addr, "following ASK");
                    // One-shot: the table is not updated.
                    addr = new_addr;
                    asking = true;
                }
                ServerErrorKind::TryAgain => {
                    tryagains += 1;
                    if tryagains > MAX_TRYAGAIN {
                        return Err(Error::TryAgain(msg.to_string()));
                    }
                    drop(guard);
                    tokio::time::sleep(TRYAGAIN_BACKOFF).await;
                }
                ServerErrorKind::ClusterDown => {
                    return Err(Error::ClusterDown(msg.to_string()));
                }
                _ => return Err(Error::server(msg.to_string())),
            }
        }
    }

    /// Pipeline across the cluster: commands are grouped per target node,
    /// each group flushed as one contiguous write, results returned in
    /// the caller's order. Error replies stay positional.
    pub async fn pipeline(&self, commands: &[Vec<Vec<u8>>]) -> Result<Vec<Reply>> {
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, command) in commands.iter().enumerate() {
            let slot = slot_for(command)?;
            let addr = self.addr_for_slot(slot)?;
            groups.entry(addr).or_default().push(index);
        }

        let mut results: Vec<Option<Reply>> = vec![None; commands.len()];
        for (addr, indexes) in groups {
            let batch: Vec<Vec<Vec<u8>>> =
                indexes.iter().map(|&i| commands[i].clone()).collect();
            let pool = self.pool_for(&addr);
            let mut guard = pool.get().await?;
            let replies = guard.conn().pipeline(&batch).await?;
            drop(guard);

            for (&index, reply) in indexes.iter().zip(replies) {
                // Redirects inside a pipeline are resolved per command.
                let resolved = match reply.error_message().map(ServerErrorKind::classify) {
                    Some(
                        ServerErrorKind::Moved { .. }
                        | ServerErrorKind::Ask { .. }
                        | ServerErrorKind::TryAgain,
                    ) => self.call(&commands[index]).await?,
                    _ => reply,
                };
                results[index] = Some(resolved);
            }
        }

        Ok(results.into_iter().map(|r| r.unwrap_or(Reply::Null)).collect())
    }

    /// WATCH + MULTI pinned to the slot's node for the whole transaction
    /// window. All watched keys must hash to one slot; the check happens
    /// before any node is contacted.
    pub async fn watch_multi<F>(
        &self,
        keys: &[&[u8]],
        queue: F,
    ) -> Result<Option<Vec<Reply>>>
    where
        F: FnOnce(&mut crate::session::TxQueue),
    {
        if keys.is_empty() {
            return Err(Error::Client("WATCH requires at least one key".into()));
        }
        let mut slot: Option<u16> = None;
        for key in keys {
            let s = key_slot(key);
            match slot {
                None => slot = Some(s),
                Some(prev) if prev != s => {
                    return Err(Error::CrossSlot(format!(
                        "watched keys map to slots {prev} and {s}"
                    )));
                }
                Some(_) => {}
            }
        }
        let addr = self.addr_for_slot(slot)?;
        self.transaction_on(&addr, Some(keys), queue).await
    }

    /// MULTI with no prior WATCH runs on a random primary.
    pub async fn multi<F>(&self, queue: F) -> Result<Option<Vec<Reply>>>
    where
        F: FnOnce(&mut crate::session::TxQueue),
    {
        let addr = self.random_primary()?;
        self.transaction_on(&addr, None, queue).await
    }

    async fn transaction_on<F>(
        &self,
        addr: &str,
        watch: Option<&[&[u8]]>,
        queue: F,
    ) -> Result<Option<Vec<Reply>>>
    where
        F: FnOnce(&mut crate::session::TxQueue),
    {
        let queued = crate::session::collect_tx(queue)?;

        let pool = self.pool_for(addr);
        let mut guard = pool.get().await?;
        let conn = guard.conn();

        if let Some(keys) = watch {
            let mut args: Vec<Vec<u8>> = Vec::with_capacity(keys.len() + 1);
            args.push(b"WATCH".to_vec());
            args.extend(keys.iter().map(|k| k.to_vec()));
            let reply = conn.call(&args).await?;
            if let Some(msg) = reply.error_message() {
                return Err(Error::server(msg.to_string()));
            }
        }

        let result = crate::session::exec_transaction(conn, queued).await;
        if result.is_err() && watch.is_some() {
            let _ = conn.call1("UNWATCH").await;
        }
        result
    }

    /// Idle connections across every node pool.
    pub fn idle_count(&self) -> usize {
        self.pools.read().values().map(|p| p.idle_count()).sum()
    }

    pub fn known_nodes(&self) -> Vec<String> {
        self.table.read().primaries()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
