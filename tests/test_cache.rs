//! Integration tests: client-side tracking cache.

mod common;

use bytes::Bytes;
use common::*;
use rudis::cache::CacheConfig;
use rudis::cmd;
use rudis::resp::types::Reply;
use rudis::session::Session;

#[tokio::test]
async fn enable_then_read_through() {
    let (addr, log) = mock_server(vec![ok(), bulk("v")]).await;
    let mut session = Session::new(config_for(&addr));
    session.enable_cache(CacheConfig::default()).await.unwrap();

    // Miss hits the server, hit does not.
    let first = session.call_cached(&cmd!("GET", "k")).await.unwrap();
    let second = session.call_cached(&cmd!("GET", "k")).await.unwrap();
    assert_eq!(first, Reply::BulkString(Bytes::from_static(b"v")));
    assert_eq!(second, first);
    assert_eq!(sent_commands(&log), vec!["CLIENT TRACKING ON", "GET k"]);
}

#[tokio::test]
async fn lru_eviction_follows_access_order() {
    let (addr, _) = mock_server(vec![
        ok(),      // CLIENT TRACKING ON
        bulk("1"), // GET k1
        bulk("2"), // GET k2
        bulk("3"), // GET k3
        bulk("4"), // GET k4
    ])
    .await;
    let mut session = Session::new(config_for(&addr));
    session
        .enable_cache(CacheConfig {
            max_entries: 3,
            ..CacheConfig::default()
        })
        .await
        .unwrap();

    session.call_cached(&cmd!("GET", "k1")).await.unwrap();
    session.call_cached(&cmd!("GET", "k2")).await.unwrap();
    session.call_cached(&cmd!("GET", "k3")).await.unwrap();
    // Touch k1 so k2 becomes the least recently used.
    session.call_cached(&cmd!("GET", "k1")).await.unwrap();
    // Fourth distinct key evicts k2.
    session.call_cached(&cmd!("GET", "k4")).await.unwrap();

    assert!(session.cached(b"k1"));
    assert!(!session.cached(b"k2"));
    assert!(session.cached(b"k3"));
    assert!(session.cached(b"k4"));
    assert_eq!(session.cache_len(), 3);
}

#[tokio::test]
async fn invalidation_push_removes_entry() {
    let (addr, _) = mock_server(vec![
        ok(),
        bulk("v"),
        // PING reply preceded by an invalidation push for k.
        b">2\r\n$10\r\ninvalidate\r\n*1\r\n$1\r\nk\r\n+PONG\r\n".to_vec(),
    ])
    .await;
    let mut session = Session::new(config_for(&addr));
    session.enable_cache(CacheConfig::default()).await.unwrap();

    session.call_cached(&cmd!("GET", "k")).await.unwrap();
    assert!(session.cached(b"k"));

    session.call1("PING").await.unwrap();
    assert!(!session.cached(b"k"));
}

#[tokio::test]
async fn disable_flushes_and_is_idempotent() {
    let (addr, log) = mock_server(vec![ok(), bulk("v"), ok()]).await;
    let mut session = Session::new(config_for(&addr));
    session.enable_cache(CacheConfig::default()).await.unwrap();
    session.call_cached(&cmd!("GET", "k")).await.unwrap();

    session.disable_cache().await.unwrap();
    assert!(!session.cached(b"k"));
    assert_eq!(session.cache_len(), 0);

    session.disable_cache().await.unwrap();

    let offs = sent_commands(&log)
        .iter()
        .filter(|c| c.as_str() == "CLIENT TRACKING OFF")
        .count();
    assert_eq!(offs, 1);
}

#[tokio::test]
async fn enable_is_idempotent() {
    let (addr, log) = mock_server(vec![ok()]).await;
    let mut session = Session::new(config_for(&addr));
    session.enable_cache(CacheConfig::default()).await.unwrap();
    session.enable_cache(CacheConfig::default()).await.unwrap();

    let ons = sent_commands(&log)
        .iter()
        .filter(|c| c.starts_with("CLIENT TRACKING ON"))
        .count();
    assert_eq!(ons, 1);
}

#[tokio::test]
async fn reset_reissues_tracking_on() {
    let (addr, log) = mock_server(vec![ok(), bulk("v"), ok()]).await;
    let mut session = Session::new(config_for(&addr));
    session.enable_cache(CacheConfig::default()).await.unwrap();
    session.call_cached(&cmd!("GET", "k")).await.unwrap();

    session.reset_cache().await.unwrap();
    assert!(!session.cached(b"k"));

    let ons = sent_commands(&log)
        .iter()
        .filter(|c| c.starts_with("CLIENT TRACKING ON"))
        .count();
    assert_eq!(ons, 2);
}
