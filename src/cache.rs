//! Client-side tracking cache.
//!
//! A bounded TTL + LRU map keyed by command key. The server pushes
//! `invalidate` messages for keys this connection has read; the cache
//! applies them between replies. Pure data structure — the `CLIENT
//! TRACKING` / `CLIENT CACHING` protocol exchange is driven by the
//! session that owns the cache.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::resp::types::Reply;

/// Server-side tracking mode requested when the cache is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Server tracks every key this connection reads.
    #[default]
    Default,
    /// Server tracks only after an explicit `CLIENT CACHING YES`.
    OptIn,
    /// Server tracks everything except after `CLIENT CACHING NO`.
    OptOut,
    /// Server pushes by key prefix instead of per-key.
    Broadcast,
}

impl CacheMode {
    /// Extra token for `CLIENT TRACKING ON`, if the mode needs one.
    pub fn tracking_arg(self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::OptIn => Some("OPTIN"),
            Self::OptOut => Some("OPTOUT"),
            Self::Broadcast => Some("BCAST"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub mode: CacheMode,
    pub max_entries: usize,
    /// Per-entry lifetime; `None` means entries live until invalidated.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Default,
            max_entries: 10_000,
            ttl: None,
        }
    }
}

struct Entry {
    value: Reply,
    expires_at: Option<Instant>,
    /// Recency stamp; pairs in `recency` with an older stamp are stale.
    seq: u64,
}

pub struct TrackingCache {
    config: CacheConfig,
    entries: HashMap<Vec<u8>, Entry>,
    /// Access order, oldest at the front. Stale pairs (superseded stamps)
    /// are skipped lazily during eviction and compacted when the queue
    /// outgrows the map.
    recency: VecDeque<(u64, Vec<u8>)>,
    next_seq: u64,
    active: bool,
}

impl TrackingCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: HashMap::with_capacity(config.max_entries.min(1024)),
            recency: VecDeque::new(),
            next_seq: 0,
            active: false,
            config,
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.config.mode
    }

    pub fn max_entries(&self) -> usize {
        self.config.max_entries
    }

    /// Whether tracking has been negotiated with the server.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up `key`, refreshing its recency. An entry past its TTL
    /// behaves as a miss and is evicted.
    pub fn get(&mut self, key: &[u8]) -> Option<Reply> {
        let now = Instant::now();
        let expired = self.entries.get(key)?.expires_at.is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
            return None;
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let entry = self.entries.get_mut(key)?;
        entry.seq = seq;
        let value = entry.value.clone();
        self.recency.push_back((seq, key.to_vec()));
        self.maybe_compact();
        Some(value)
    }

    /// True when `key` is present and unexpired (without touching recency).
    pub fn contains(&self, key: &[u8]) -> bool {
        match self.entries.get(key) {
            Some(entry) => !entry.expires_at.is_some_and(|at| at <= Instant::now()),
            None => false,
        }
    }

    /// Store a reply for `key`, evicting the least-recently-used entry
    /// when full.
    pub fn insert(&mut self, key: Vec<u8>, value: Reply) {
        if self.config.max_entries == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.max_entries {
            self.evict_lru();
        }
        let seq = self.bump_seq();
        let expires_at = self.config.ttl.map(|ttl| Instant::now() + ttl);
        self.recency.push_back((seq, key.clone()));
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                seq,
            },
        );
        self.maybe_compact();
    }

    pub fn invalidate(&mut self, key: &[u8]) {
        self.entries.remove(key);
    }

    pub fn flush(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Apply one server push of the form `["invalidate", keys-or-null]`.
    /// A null keys field flushes everything.
    pub fn apply_push(&mut self, push: &Reply) {
        let Reply::Push { kind, data } = push else {
            return;
        };
        if kind != "invalidate" {
            return;
        }
        match data.first() {
            Some(Reply::Array(keys)) => {
                for key in keys {
                    if let Some(bytes) = key.as_bytes() {
                        tracing::debug!(key = %String::from_utf8_lossy(bytes), "cache invalidation");
                        self.invalidate(bytes);
                    }
                }
            }
            Some(Reply::Null) | None => {
                tracing::debug!("cache invalidation flush");
                self.flush();
            }
            Some(_) => {}
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Drop the least-recently-used live entry.
    fn evict_lru(&mut self) {
        while let Some((seq, key)) = self.recency.pop_front() {
            let live = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.seq == seq);
            if live {
                self.entries.remove(&key);
                return;
            }
            // Stale pair: the key was re-accessed or removed since.
        }
    }

    /// Rebuild the recency queue when stale pairs dominate it.
    fn maybe_compact(&mut self) {
        if self.recency.len() <= self.entries.len().saturating_mul(8).max(64) {
            return;
        }
        let entries = &self.entries;
        self.recency
            .retain(|(seq, key)| entries.get(key).is_some_and(|e| e.seq == *seq));
    }
}

// ── Tests ──────────────────────────────────────────────────────────
