//! One logical client over one connection.
//!
//! The session enforces ordering across ordinary calls, pipelines and
//! MULTI/WATCH transactions, drives bounded retry for transient failures,
//! and owns the optional client-side tracking cache. A session is not
//! safe for concurrent use; confine it to one task or guard it with a
//! mutex.

use std::time::Duration;
use tokio::time::Instant;

use crate::cache::{CacheConfig, CacheMode, TrackingCache};
use crate::callbacks::{Callback, ResponseCallbacks};
use crate::config::ClientConfig;
use crate::connection::conn::{Connection, SubState};
use crate::error::{Error, Result};
use crate::resp::types::Reply;
use crate::retry::RetryPolicy;

/// Minimum extra read budget granted to drain the UNSUBSCRIBE
/// confirmation after the user's subscribe deadline has expired.
const UNSUBSCRIBE_DRAIN_FLOOR: Duration = Duration::from_millis(100);

/// Transaction-related session mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxState {
    #[default]
    Normal,
    /// WATCH has been issued; the next MULTI rides the same connection.
    Watching,
}

pub struct Session {
    conn: Connection,
    retry: RetryPolicy,
    callbacks: ResponseCallbacks,
    cache: Option<TrackingCache>,
    tx_state: TxState,
    decode_responses: bool,
}

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        let retry = config.effective_retry_policy();
        let decode_responses = config.decode_responses;
        Self {
            conn: Connection::new(config),
            retry,
            callbacks: ResponseCallbacks::new(),
            cache: None,
            tx_state: TxState::Normal,
            decode_responses,
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(ClientConfig::from_url(url)?))
    }

    /// Build a session from a config, folding in its `url` option first.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        Ok(Self::new(config.normalized()?))
    }

    pub fn tx_state(&self) -> TxState {
        self.tx_state
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn register_callback(&mut self, command: &str, callback: Callback) {
        self.callbacks.register(command, callback);
    }

    pub fn callbacks_mut(&mut self) -> &mut ResponseCallbacks {
        &mut self.callbacks
    }

    pub async fn close(&mut self) {
        self.conn.close();
    }

    // ── Calls ──────────────────────────────────────────────────────

    /// Issue one command. Server error replies surface as typed errors;
    /// transient transport failures are retried only while the command
    /// is known not to have reached the server (at-most-once for writes).
    pub async fn call<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        let reply = self.dispatch(args, false).await?;
        self.finish(args, reply)
    }

    /// Like [`Session::call`] for commands the caller marks idempotent:
    /// transport failures after the command was sent are retried too.
    pub async fn call_idempotent<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        let reply = self.dispatch(args, true).await?;
        self.finish(args, reply)
    }

    /// One-argument fast path.
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

    /// Low-level dispatch: ensure connected, send, read, drain cache
    /// invalidations. Error replies come back as `Reply::Error` values.
    async fn dispatch<A: AsRef<[u8]>>(&mut self, args: &[A], idempotent: bool) -> Result<Reply> {
        let mut attempts = 0u32;
        loop {
            // Connection establishment is always safe to retry: nothing
            // of this command has been observed yet.
            if let Err(err) = self.conn.ensure_connected().await {
                attempts += 1;
                if self.retry.should_retry(&err, attempts) {
                    self.retry.pause(&err, attempts).await;
                    continue;
                }
                return Err(err);
            }

            match self.conn.call(args).await {
                Ok(reply) => {
                    self.drain_invalidations();
                    return Ok(reply);
                }
                Err(err) => {
                    attempts += 1;
                    // Once bytes may have hit the wire, only operations
                    // the caller marked idempotent may be replayed.
                    if idempotent && self.retry.should_retry(&err, attempts) {
                        self.retry.pause(&err, attempts).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Post-processing common to every call path: raise error replies,
    /// run response callbacks, apply optional text decoding.
    fn finish<A: AsRef<[u8]>>(&mut self, args: &[A], reply: Reply) -> Result<Reply> {
        if let Some(msg) = reply.error_message() {
            return Err(Error::server(msg.to_string()));
        }
        let reply = self.callbacks.apply(args, reply);
        Ok(self.maybe_decode(reply))
    }

    fn maybe_decode(&self, reply: Reply) -> Reply {
        if !self.decode_responses {
            return reply;
        }
        decode_text(reply)
    }

    fn drain_invalidations(&mut self) {
        let pushes = self.conn.take_invalidations();
        if let Some(cache) = &mut self.cache {
            for push in &pushes {
                cache.apply_push(push);
            }
        }
    }

    // ── Pipelines ──────────────────────────────────────────────────

    /// Flush a pipeline: one contiguous write, `len` reads, per-command
    /// post-processing. With `raise_on_error` (the default) the first
    /// error reply is raised; otherwise errors stay positional values.
    ///
    /// A pipeline is retried only when the failure happened before any
    /// command was sent; a mid-stream failure surfaces as the error.
    pub async fn run_pipeline(&mut self, pipeline: &mut Pipeline) -> Result<Vec<Reply>> {
        if pipeline.commands.is_empty() {
            pipeline.results = Some(Vec::new());
            return Ok(Vec::new());
        }

        let mut attempts = 0u32;
        loop {
            if let Err(err) = self.conn.ensure_connected().await {
                attempts += 1;
                if self.retry.should_retry(&err, attempts) {
                    self.retry.pause(&err, attempts).await;
                    continue;
                }
                return Err(err);
            }
            break;
        }

        let replies = self.conn.pipeline(&pipeline.commands).await?;
        self.drain_invalidations();

        let mut processed = Vec::with_capacity(replies.len());
        for (args, reply) in pipeline.commands.iter().zip(replies) {
            if let Some(msg) = reply.error_message() {
                if pipeline.raise_on_error {
                    return Err(Error::server(msg.to_string()));
                }
                processed.push(reply);
            } else {
                let reply = self.callbacks.apply(args, reply);
                processed.push(self.maybe_decode(reply));
            }
        }
        pipeline.results = Some(processed.clone());
        Ok(processed)
    }

    // ── Transactions ───────────────────────────────────────────────

    /// Run `queue` to collect commands, then send `MULTI … EXEC` as one
    /// contiguous pipeline. Returns `None` when the transaction was
    /// aborted because a watched key changed.
    ///
    /// The first per-command error inside the results is raised; use
    /// [`Session::multi_with_errors`] to receive errors as values.
    pub async fn multi<F>(&mut self, queue: F) -> Result<Option<Vec<Reply>>>
    where
        F: FnOnce(&mut TxQueue),
    {
        self.multi_inner(queue, true).await
    }

    /// [`Session::multi`] with per-command errors returned positionally.
    pub async fn multi_with_errors<F>(&mut self, queue: F) -> Result<Option<Vec<Reply>>>
    where
        F: FnOnce(&mut TxQueue),
    {
        self.multi_inner(queue, false).await
    }

    async fn multi_inner<F>(&mut self, queue: F, raise_on_error: bool) -> Result<Option<Vec<Reply>>>
    where
        F: FnOnce(&mut TxQueue),
    {
        // Client-side rejections happen before any I/O, so a pending
        // WATCH survives for the caller (or watch_multi) to clean up.
        let queued = collect_tx(queue)?;

        // MULTI inherits the watching connection; a plain MULTI uses the
        // session's connection as-is. Either way this is the only I/O
        // the session performs until EXEC is answered.
        let result = exec_transaction(&mut self.conn, queued.clone()).await;
        self.tx_state = TxState::Normal; // EXEC clears any WATCH server-side
        self.drain_invalidations();

        let Some(results) = result? else {
            // Watched key changed: the server discarded the queue.
            return Ok(None);
        };

        let mut processed = Vec::with_capacity(results.len());
        for (command, reply) in queued.iter().zip(results) {
            if let Some(msg) = reply.error_message() {
                if raise_on_error {
                    return Err(Error::server(msg.to_string()));
                }
                processed.push(reply);
            } else {
                let reply = self.callbacks.apply(command, reply);
                processed.push(self.maybe_decode(reply));
            }
        }
        Ok(Some(processed))
    }

    /// `WATCH key…`. The session moves to `Watching`; the next
    /// [`Session::multi`] runs on this same connection.
    pub async fn watch<A: AsRef<[u8]>>(&mut self, keys: &[A]) -> Result<()> {
        if keys.is_empty() {
            return Err(Error::Client("WATCH requires at least one key".into()));
        }
        let mut args: Vec<Vec<u8>> = Vec::with_capacity(keys.len() + 1);
        args.push(b"WATCH".to_vec());
        args.extend(keys.iter().map(|k| k.as_ref().to_vec()));

        let reply = self.dispatch(&args, false).await?;
        if let Some(msg) = reply.error_message() {
            return Err(Error::server(msg.to_string()));
        }
        self.tx_state = TxState::Watching;
        Ok(())
    }

    /// `WATCH` + transaction with UNWATCH guaranteed on every exit path:
    /// queueing error, transport error, committed, or aborted.
    pub async fn watch_multi<A, F>(&mut self, keys: &[A], queue: F) -> Result<Option<Vec<Reply>>>
    where
        A: AsRef<[u8]>,
        F: FnOnce(&mut TxQueue),
    {
        self.watch(keys).await?;
        let result = self.multi(queue).await;
        if result.is_err() && self.tx_state == TxState::Watching {
            // EXEC never ran; drop the watch explicitly.
            let _ = self.unwatch().await;
        }
        self.tx_state = TxState::Normal;
        result
    }

    /// Direct `UNWATCH` passthrough. Returns the session to `Normal`.
    pub async fn unwatch(&mut self) -> Result<()> {
        let reply = self.dispatch(&[b"UNWATCH".as_ref()], false).await;
        self.tx_state = TxState::Normal;
        let reply = reply?;
        if let Some(msg) = reply.error_message() {
            return Err(Error::server(msg.to_string()));
        }
        Ok(())
    }

    /// Direct `DISCARD` passthrough. Returns the session to `Normal`.
    pub async fn discard(&mut self) -> Result<()> {
        let reply = self.dispatch(&[b"DISCARD".as_ref()], false).await;
        self.tx_state = TxState::Normal;
        let reply = reply?;
        if let Some(msg) = reply.error_message() {
            return Err(Error::server(msg.to_string()));
        }
        Ok(())
    }

    // ── Client-side caching ────────────────────────────────────────

    /// Enable server-assisted caching. Sends `CLIENT TRACKING ON` (plus
    /// the mode token) once; enabling an already-active cache performs no
    /// server call.
    pub async fn enable_cache(&mut self, config: CacheConfig) -> Result<()> {
        if self.cache.as_ref().is_some_and(TrackingCache::is_active) {
            return Ok(());
        }
        let mode = config.mode;
        let cache = TrackingCache::new(config);
        self.cache = Some(cache);
        self.send_tracking_on(mode).await
    }

    async fn send_tracking_on(&mut self, mode: CacheMode) -> Result<()> {
        let mut args: Vec<&[u8]> = vec![b"CLIENT", b"TRACKING", b"ON"];
        if let Some(extra) = mode.tracking_arg() {
            args.push(extra.as_bytes());
        }
        let reply = self.dispatch(&args, true).await?;
        if let Some(msg) = reply.error_message() {
            return Err(Error::server(msg.to_string()));
        }
        if !reply.is_ok() {
            return Err(Error::Protocol(format!(
                "unexpected CLIENT TRACKING reply: {}",
                reply.type_name()
            )));
        }
        if let Some(cache) = &mut self.cache {
            cache.set_active(true);
        }
        Ok(())
    }

    /// Disable tracking (best-effort `CLIENT TRACKING OFF`) and clear the
    /// cache. Disabling twice is the same as disabling once.
    pub async fn disable_cache(&mut self) -> Result<()> {
        let was_active = self.cache.as_ref().is_some_and(TrackingCache::is_active);
        if was_active {
            let _ = self
                .dispatch(&[b"CLIENT".as_ref(), b"TRACKING", b"OFF"], true)
                .await;
        }
        if let Some(cache) = &mut self.cache {
            cache.set_active(false);
            cache.flush();
        }
        Ok(())
    }

    /// Flush the cache and re-issue `CLIENT TRACKING ON`.
    pub async fn reset_cache(&mut self) -> Result<()> {
        let Some(cache) = &mut self.cache else {
            return Ok(());
        };
        cache.flush();
        cache.set_active(false);
        let mode = cache.mode();
        self.send_tracking_on(mode).await
    }

    /// Whether `key` currently sits in the cache, unexpired.
    pub fn cached(&self, key: &[u8]) -> bool {
        self.cache.as_ref().is_some_and(|c| c.contains(key))
    }

    pub fn cache_len(&self) -> usize {
        self.cache.as_ref().map_or(0, TrackingCache::len)
    }

    /// Read through the cache: a hit answers locally; a miss issues the
    /// command and stores the reply per the cache mode.
    pub async fn call_cached<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        self.call_cached_with(args, None).await
    }

    /// [`Session::call_cached`] with the per-call flag for the opt-in /
    /// opt-out modes. `Some(true)` opts a read in (issuing `CLIENT
    /// CACHING YES` first); `Some(false)` opts out (issuing `CLIENT
    /// CACHING NO`).
    pub async fn call_cached_with<A: AsRef<[u8]>>(
        &mut self,
        args: &[A],
        flag: Option<bool>,
    ) -> Result<Reply> {
        let active = self.cache.as_ref().is_some_and(TrackingCache::is_active);
        let key: Option<Vec<u8>> = args.get(1).map(|k| k.as_ref().to_vec());
        let (Some(key), true) = (key, active) else {
            return self.call_idempotent(args).await;
        };

        if let Some(hit) = self.cache.as_mut().and_then(|c| c.get(&key)) {
            return Ok(self.maybe_decode(hit));
        }

        let mode = self.cache.as_ref().map(TrackingCache::mode).unwrap_or_default();
        let (store, pre_command) = match mode {
            CacheMode::Default | CacheMode::Broadcast => (true, None),
            CacheMode::OptIn => (flag == Some(true), flag.filter(|&f| f).map(|_| b"YES".as_ref())),
            CacheMode::OptOut => (
                flag != Some(false),
                flag.filter(|&f| !f).map(|_| b"NO".as_ref()),
            ),
        };
        if let Some(answer) = pre_command {
            let reply = self
                .dispatch(&[b"CLIENT".as_ref(), b"CACHING", answer], true)
                .await?;
            if let Some(msg) = reply.error_message() {
                return Err(Error::server(msg.to_string()));
            }
        }

        let reply = self.dispatch(args, true).await?;
        if let Some(msg) = reply.error_message() {
            return Err(Error::server(msg.to_string()));
        }
        if store && !reply.is_null() {
            if let Some(cache) = &mut self.cache {
                cache.insert(key, reply.clone());
            }
        }
        let reply = self.callbacks.apply(args, reply);
        Ok(self.maybe_decode(reply))
    }

    // ── Subscribe ──────────────────────────────────────────────────

    /// Subscribe to `channels`, collect messages until `deadline` from
    /// now, then unsubscribe and drain the confirmation so the
    /// connection stays reusable. The drain keeps a strictly positive
    /// read budget even when the user deadline has fully elapsed.
    pub async fn subscribe_with_timeout(
        &mut self,
        deadline: Duration,
        channels: &[&str],
    ) -> Result<Vec<Reply>> {
        if channels.is_empty() {
            return Err(Error::Client("SUBSCRIBE requires at least one channel".into()));
        }
        self.conn.ensure_connected().await?;

        let mut args: Vec<Vec<u8>> = Vec::with_capacity(channels.len() + 1);
        args.push(b"SUBSCRIBE".to_vec());
        args.extend(channels.iter().map(|c| c.as_bytes().to_vec()));

        self.conn.set_sub_state(SubState::Subscribing);
        let frame = crate::resp::writer::encode_command(&args);
        if let Err(err) = self.conn.send(&frame).await {
            self.conn.set_sub_state(SubState::Normal);
            return Err(err);
        }

        let stop_at = Instant::now() + deadline;
        let mut confirmations = 0usize;
        let mut messages = Vec::new();

        loop {
            let remaining = stop_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.conn.read_reply_soft(remaining).await {
                Ok(frame) => match pubsub_kind(&frame).as_deref() {
                    Some("subscribe") => {
                        confirmations += 1;
                        if confirmations == channels.len() {
                            self.conn.set_sub_state(SubState::Subscribed);
                        }
                    }
                    Some("message") | Some("pmessage") => messages.push(frame),
                    _ => {}
                },
                Err(Error::Timeout(_)) => break,
                Err(err) => {
                    self.conn.set_sub_state(SubState::Normal);
                    return Err(err);
                }
            }
        }

        // Teardown: the deadline may be spent, but the UNSUBSCRIBE
        // confirmation still gets a positive budget.
        self.conn.set_sub_state(SubState::Unsubscribing);
        self.conn.send(b"*1\r\n$11\r\nUNSUBSCRIBE\r\n").await?;
        loop {
            let frame = self
                .conn
                .read_reply_within(UNSUBSCRIBE_DRAIN_FLOOR)
                .await?;
            if pubsub_kind(&frame).as_deref() == Some("unsubscribe") {
                let remaining_subs = unsubscribe_remaining(&frame);
                if remaining_subs == Some(0) || remaining_subs.is_none() {
                    break;
                }
            }
        }
        self.conn.set_sub_state(SubState::Normal);
        Ok(messages)
    }
}

/// Pub/sub frames arrive as RESP2 arrays or RESP3 pushes; either way the
/// first element names the kind.
fn pubsub_kind(frame: &Reply) -> Option<String> {
    match frame {
        Reply::Push { kind, .. } => Some(kind.clone()),
        Reply::Array(items) => items
            .first()
            .and_then(|k| k.as_str())
            .map(|s| s.to_ascii_lowercase()),
        _ => None,
    }
}

/// The trailing count in an `unsubscribe` confirmation.
fn unsubscribe_remaining(frame: &Reply) -> Option<i64> {
    let items = match frame {
        Reply::Array(items) => items,
        Reply::Push { data, .. } => data,
        _ => return None,
    };
    items.last().and_then(Reply::as_int)
}

/// Recursively decode bulk strings to text (for `decode_responses`).
fn decode_text(reply: Reply) -> Reply {
    match reply {
        Reply::BulkString(bytes) => match std::str::from_utf8(&bytes) {
            Ok(text) => Reply::SimpleString(text.to_string()),
            Err(_) => Reply::BulkString(bytes),
        },
        Reply::Array(items) => Reply::Array(items.into_iter().map(decode_text).collect()),
        Reply::Set(items) => Reply::Set(items.into_iter().map(decode_text).collect()),
        Reply::Map(pairs) => Reply::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (decode_text(k), decode_text(v)))
                .collect(),
        ),
        other => other,
    }
}

// ── Pipeline builder ───────────────────────────────────────────────

/// Collects commands for one contiguous flush.
///
/// `queue` returns the index of the command's slot in the result vector;
/// [`Pipeline::get`] on that index fails with `FutureNotReady` until
/// [`Session::run_pipeline`] has flushed.
pub struct Pipeline {
    commands: Vec<Vec<Vec<u8>>>,
    results: Option<Vec<Reply>>,
    raise_on_error: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            results: None,
            raise_on_error: true,
        }
    }

    /// Keep error replies as positional values instead of raising the
    /// first one.
    pub fn errors_as_values(mut self) -> Self {
        self.raise_on_error = false;
        self
    }

    /// Queue a command; the returned index addresses its reply.
    pub fn queue<A: AsRef<[u8]>>(&mut self, args: &[A]) -> usize {
        self.commands
            .push(args.iter().map(|a| a.as_ref().to_vec()).collect());
        self.commands.len() - 1
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Reply at `index`, once the pipeline has been flushed.
    pub fn get(&self, index: usize) -> Result<&Reply> {
        match &self.results {
            None => Err(Error::FutureNotReady),
            Some(results) => results
                .get(index)
                .ok_or_else(|| Error::Client(format!("no pipeline slot {index}"))),
        }
    }
}

/// Commands queued inside a [`Session::multi`] block.
pub struct TxQueue {
    commands: Vec<Vec<Vec<u8>>>,
}

impl TxQueue {
    /// Queue a command for the transaction; the result appears at the
    /// same position in the EXEC reply array.
    pub fn queue<A: AsRef<[u8]>>(&mut self, args: &[A]) -> usize {
        self.commands
            .push(args.iter().map(|a| a.as_ref().to_vec()).collect());
        self.commands.len() - 1
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Run a queueing closure and validate the collected commands. Nesting
/// MULTI inside a transaction is rejected client-side.
pub(crate) fn collect_tx<F>(queue: F) -> Result<Vec<Vec<Vec<u8>>>>
where
    F: FnOnce(&mut TxQueue),
{
    let mut tx = TxQueue {
        commands: Vec::new(),
    };
    queue(&mut tx);
    for command in &tx.commands {
        if command
            .first()
            .is_some_and(|name| name.eq_ignore_ascii_case(b"MULTI"))
        {
            return Err(Error::Client("MULTI calls cannot be nested".into()));
        }
    }
    Ok(tx.commands)
}

/// Send `MULTI … EXEC` as one contiguous pipeline on `conn` and
/// interpret the replies. `None` means the transaction was aborted by a
/// watched-key change; per-command errors stay positional values.
pub(crate) async fn exec_transaction(
    conn: &mut Connection,
    queued: Vec<Vec<Vec<u8>>>,
) -> Result<Option<Vec<Reply>>> {
    let mut commands: Vec<Vec<Vec<u8>>> = Vec::with_capacity(queued.len() + 2);
    commands.push(vec![b"MULTI".to_vec()]);
    commands.extend(queued);
    commands.push(vec![b"EXEC".to_vec()]);

    conn.ensure_connected().await?;
    let mut replies = conn.pipeline(&commands).await?;

    let Some(exec_reply) = replies.pop() else {
        return Err(Error::Protocol("EXEC produced no reply".into()));
    };
    if let Some(msg) = replies[0].error_message() {
        return Err(Error::server(msg.to_string()));
    }

    match exec_reply {
        Reply::Null => Ok(None),
        Reply::Error(msg) | Reply::BulkError(msg) => Err(Error::server(msg)),
        Reply::Array(results) => Ok(Some(results)),
        other => Err(Error::Protocol(format!(
            "unexpected EXEC reply: {}",
            other.type_name()
        ))),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
