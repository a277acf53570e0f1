//! Per-command response post-processing.
//!
//! A registry mapping command names (case-insensitive, multi-word forms
//! like `CLIENT LIST` included) to reply transforms. Defaults cover the
//! commands whose raw replies are awkward to consume — INFO's sectioned
//! text, CONFIG GET's flat array, and friends. Custom registrations
//! shadow defaults.

use std::collections::HashMap;
use std::sync::Arc;

use crate::resp::types::Reply;

pub type Callback = Arc<dyn Fn(Reply) -> Reply + Send + Sync>;

pub struct ResponseCallbacks {
    customs: HashMap<String, Callback>,
}

impl Default for ResponseCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCallbacks {
    pub fn new() -> Self {
        Self {
            customs: HashMap::new(),
        }
    }

    /// Register a custom transform for `command` (e.g. `"INFO"` or
    /// `"CLIENT LIST"`). Shadows any default.
    pub fn register(&mut self, command: &str, callback: Callback) {
        self.customs.insert(command.to_ascii_uppercase(), callback);
    }

    /// Remove custom registrations only; defaults stay in effect.
    pub fn reset(&mut self) {
        self.customs.clear();
    }

    /// Copy every default into the custom table so individual entries can
    /// be overridden or removed.
    pub fn load_defaults(&mut self) {
        for (name, cb) in defaults() {
            self.customs.entry(name.to_string()).or_insert(cb);
        }
    }

    /// Transform `reply` for the command in `args`. Error and push frames
    /// pass through untouched.
    pub fn apply<A: AsRef<[u8]>>(&self, args: &[A], reply: Reply) -> Reply {
        if reply.is_error() || reply.is_push() {
            return reply;
        }
        match self.find(args) {
            Some(cb) => cb(reply),
            None => reply,
        }
    }

    /// Find the transform for a command, preferring the two-word form
    /// (`CLIENT LIST`) over the one-word form (`CLIENT`).
    fn find<A: AsRef<[u8]>>(&self, args: &[A]) -> Option<Callback> {
        let first = uppercase_word(args.first()?.as_ref());
        if let Some(second) = args.get(1) {
            let two = format!("{first} {}", uppercase_word(second.as_ref()));
            if let Some(cb) = self.lookup(&two) {
                return Some(cb);
            }
        }
        self.lookup(&first)
    }

    fn lookup(&self, key: &str) -> Option<Callback> {
        if let Some(cb) = self.customs.get(key) {
            return Some(Arc::clone(cb));
        }
        default_for(key)
    }
}

fn uppercase_word(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_uppercase()
}

// ── Defaults ──────────────────────────────────────────────────────

fn defaults() -> Vec<(&'static str, Callback)> {
    vec![
        ("INFO", Arc::new(info_to_map) as Callback),
        ("CLIENT LIST", Arc::new(client_list_to_maps)),
        ("CLIENT INFO", Arc::new(client_info_to_map)),
        ("DEBUG OBJECT", Arc::new(debug_object_to_map)),
        ("MEMORY STATS", Arc::new(flat_array_to_map)),
        ("CONFIG GET", Arc::new(flat_array_to_map)),
        ("ACL LOG", Arc::new(acl_log_to_maps)),
    ]
}

fn default_for(key: &str) -> Option<Callback> {
    let cb: Callback = match key {
        "INFO" => Arc::new(info_to_map),
        "CLIENT LIST" => Arc::new(client_list_to_maps),
        "CLIENT INFO" => Arc::new(client_info_to_map),
        "DEBUG OBJECT" => Arc::new(debug_object_to_map),
        "MEMORY STATS" | "CONFIG GET" => Arc::new(flat_array_to_map),
        "ACL LOG" => Arc::new(acl_log_to_maps),
        _ => return None,
    };
    Some(cb)
}

/// Coerce a textual value: integers and floats become numbers, everything
/// else stays a string.
fn coerce(text: &str) -> Reply {
    if let Ok(n) = text.parse::<i64>() {
        return Reply::Integer(n);
    }
    if let Ok(f) = text.parse::<f64>() {
        if text.bytes().any(|b| b == b'.' || b == b'e' || b == b'E') {
            return Reply::Double(f);
        }
    }
    Reply::SimpleString(text.to_string())
}

fn key(text: &str) -> Reply {
    Reply::SimpleString(text.to_string())
}

/// `INFO` → map of section name → map of field → coerced value.
fn info_to_map(reply: Reply) -> Reply {
    let Some(text) = reply.as_str().map(str::to_string) else {
        return reply;
    };

    let mut sections: Vec<(Reply, Reply)> = Vec::new();
    let mut current_name: Option<String> = None;
    let mut current: Vec<(Reply, Reply)> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix("# ") {
            if let Some(prev) = current_name.take() {
                sections.push((key(&prev), Reply::Map(std::mem::take(&mut current))));
            }
            current_name = Some(name.to_string());
        } else if let Some((field, value)) = line.split_once(':') {
            current.push((key(field), coerce(value)));
        }
    }
    if let Some(prev) = current_name {
        sections.push((key(&prev), Reply::Map(current)));
    } else if !current.is_empty() {
        // Section-less INFO output (e.g. `INFO everything` on forks)
        return Reply::Map(current);
    }
    Reply::Map(sections)
}

/// One `field=value` line → map.
fn kv_line_to_map(line: &str) -> Reply {
    let pairs = line
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
        .map(|(field, value)| (key(field), coerce(value)))
        .collect();
    Reply::Map(pairs)
}

/// `CLIENT LIST` → list of per-client maps.
fn client_list_to_maps(reply: Reply) -> Reply {
    let Some(text) = reply.as_str().map(str::to_string) else {
        return reply;
    };
    let clients = text
        .lines()
        .filter(|l| !l.is_empty())
        .map(kv_line_to_map)
        .collect();
    Reply::Array(clients)
}

/// `CLIENT INFO` → single map.
fn client_info_to_map(reply: Reply) -> Reply {
    let Some(text) = reply.as_str().map(str::to_string) else {
        return reply;
    };
    kv_line_to_map(text.trim())
}

/// `DEBUG OBJECT` → map from its `field:value` tokens.
fn debug_object_to_map(reply: Reply) -> Reply {
    let Some(text) = reply.as_str().map(str::to_string) else {
        return reply;
    };
    let pairs = text
        .split_whitespace()
        .filter_map(|token| token.split_once(':'))
        .map(|(field, value)| (key(field), coerce(value)))
        .collect();
    Reply::Map(pairs)
}

/// Flat `[k1, v1, k2, v2, …]` array → map (CONFIG GET, MEMORY STATS).
fn flat_array_to_map(reply: Reply) -> Reply {
    let items = match reply {
        Reply::Array(items) => items,
        Reply::Map(_) => return reply, // RESP3 servers answer with a map already
        other => return other,
    };
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        let field = match field.as_str() {
            Some(s) => key(s),
            None => field,
        };
        let value = match value.as_str() {
            Some(s) => coerce(s),
            None => value,
        };
        pairs.push((field, value));
    }
    Reply::Map(pairs)
}

/// `ACL LOG` → list of maps, one per log entry.
fn acl_log_to_maps(reply: Reply) -> Reply {
    let items = match reply {
        Reply::Array(items) => items,
        other => return other,
    };
    let entries = items.into_iter().map(flat_array_to_map).collect();
    Reply::Array(entries)
}

// ── Tests ──────────────────────────────────────────────────────────
