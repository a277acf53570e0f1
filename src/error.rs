//! Error taxonomy.
//!
//! Server error text is classified in exactly one place
//! ([`ServerErrorKind::classify`]) so that prefix matching against Redis
//! messages — which can drift across server versions — stays localized.

use std::io;

/// Structured kinds for errors the server returns as `-PREFIX message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Generic ERR
    Err,
    /// NOAUTH / ERR AUTH — authentication required or failed
    Auth,
    /// NOPERM — ACL denies the command
    Permission,
    /// WRONGTYPE Operation against a key holding the wrong kind of value
    WrongType,
    /// READONLY You can't write against a read only replica
    ReadOnly,
    /// MOVED slot host:port  (cluster, permanent redirect)
    Moved { slot: u16, addr: String },
    /// ASK slot host:port  (cluster, one-shot redirect)
    Ask { slot: u16, addr: String },
    /// CLUSTERDOWN
    ClusterDown,
    /// TRYAGAIN
    TryAgain,
    /// LOADING Redis is loading the dataset in memory
    Loading,
    /// Any other prefix
    Other(String),
}

impl ServerErrorKind {
    /// Classify a raw server error message.
    ///
    /// This is the only place in the crate that inspects server error text.
    pub fn classify(msg: &str) -> Self {
        if let Some(kind) = parse_redirect(msg, "MOVED ", |slot, addr| Self::Moved { slot, addr }) {
            return kind;
        }
        if let Some(kind) = parse_redirect(msg, "ASK ", |slot, addr| Self::Ask { slot, addr }) {
            return kind;
        }

        if msg.starts_with("NOAUTH") || msg.starts_with("ERR AUTH") {
            Self::Auth
        } else if msg.starts_with("NOPERM") {
            Self::Permission
        } else if msg.starts_with("WRONGTYPE") {
            Self::WrongType
        } else if msg.starts_with("READONLY")
            || msg.contains("You can't write against a read only replica")
        {
            Self::ReadOnly
        } else if msg.starts_with("CLUSTERDOWN") {
            Self::ClusterDown
        } else if msg.starts_with("TRYAGAIN") {
            Self::TryAgain
        } else if msg.starts_with("LOADING") {
            Self::Loading
        } else if msg.starts_with("ERR") {
            Self::Err
        } else {
            let prefix = msg.split_whitespace().next().unwrap_or("UNKNOWN");
            Self::Other(prefix.to_string())
        }
    }
}

/// Parse `MOVED <slot> <host:port>` / `ASK <slot> <host:port>`.
fn parse_redirect(
    msg: &str,
    prefix: &str,
    build: impl FnOnce(u16, String) -> ServerErrorKind,
) -> Option<ServerErrorKind> {
    let rest = msg.strip_prefix(prefix)?;
    let (slot_str, addr) = rest.split_once(' ')?;
    let slot = slot_str.parse::<u16>().ok()?;
    Some(build(slot, addr.to_string()))
}

/// All error variants for rudis.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure. Retriable per policy.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// Deadline exceeded. Retriable per policy.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed RESP. Fatal for the connection, never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Parser needs more data — control flow, not a real failure.
    #[error("incomplete RESP frame")]
    Incomplete,

    /// The server returned an error reply.
    #[error("server error: {message}")]
    Command {
        kind: ServerErrorKind,
        message: String,
    },

    /// Keys of a multi-key command hash to different slots.
    #[error("cross-slot error: {0}")]
    CrossSlot(String),

    /// TRYAGAIN persisted past the retry budget.
    #[error("try again: {0}")]
    TryAgain(String),

    /// The cluster reported itself down.
    #[error("cluster down: {0}")]
    ClusterDown(String),

    /// Cluster topology problem (no node for slot, no seed reachable, …).
    #[error("cluster error: {0}")]
    Cluster(String),

    /// No sentinel reported a healthy master for the service.
    #[error("master not found: {0}")]
    MasterNotFound(String),

    /// No sentinel reported a healthy replica for the service.
    #[error("replica not found: {0}")]
    ReplicaNotFound(String),

    /// Role verification failed after a sentinel-resolved connect.
    #[error("failover: {0}")]
    Failover(String),

    /// A pipeline result was read before the pipeline was flushed.
    #[error("pipeline result not ready")]
    FutureNotReady,

    /// Client-side API misuse (nested MULTI, empty command, …).
    #[error("{0}")]
    Client(String),

    /// Bad URL or configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Build an [`Error::Command`] from raw server error text.
    pub fn server(msg: impl Into<String>) -> Self {
        let message = msg.into();
        let kind = ServerErrorKind::classify(&message);
        Self::Command { kind, message }
    }

    /// True for errors the retry policy is allowed to act on.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// True if this is a MOVED redirect.
    pub fn is_moved(&self) -> bool {
        matches!(
            self,
            Self::Command {
                kind: ServerErrorKind::Moved { .. },
                ..
            }
        )
    }

    /// True if this is an ASK redirect.
    pub fn is_ask(&self) -> bool {
        matches!(
            self,
            Self::Command {
                kind: ServerErrorKind::Ask { .. },
                ..
            }
        )
    }

    /// True if the server rejected a write on a replica.
    pub fn is_readonly(&self) -> bool {
        matches!(
            self,
            Self::Command {
                kind: ServerErrorKind::ReadOnly,
                ..
            }
        )
    }

    /// Slot and address for a MOVED redirect.
    pub fn moved_info(&self) -> Option<(u16, &str)> {
        match self {
            Self::Command {
                kind: ServerErrorKind::Moved { slot, addr },
                ..
            } => Some((*slot, addr)),
            _ => None,
        }
    }

    /// Slot and address for an ASK redirect.
    pub fn ask_info(&self) -> Option<(u16, &str)> {
        match self {
            Self::Command {
                kind: ServerErrorKind::Ask { slot, addr },
                ..
            } => Some((*slot, addr)),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Tests ──────────────────────────────────────────────────────────
