//! Shared helpers for integration tests.
//!
//! Tests run against scripted mock servers: each mock answers every
//! complete command frame with the next canned response (`+OK` once the
//! script is exhausted) and records what it received, so tests can
//! assert on the exact wire traffic.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use rudis::config::ClientConfig;
use rudis::resp::parser::{decode_slice, frame_len};
use rudis::resp::types::Reply;
use rudis::resp::writer::encode_command;

/// Commands received by a mock, rendered as argument strings.
pub type CommandLog = Arc<Mutex<Vec<Vec<String>>>>;

/// Start a scripted mock server. Responses are served in order across
/// all accepted connections.
pub async fn mock_server(responses: Vec<Vec<u8>>) -> (String, CommandLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
    let log_outer = Arc::clone(&log);

    tokio::spawn(async move {
        let script = Arc::new(Mutex::new(responses));
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let log = Arc::clone(&log_outer);
            let script = Arc::clone(&script);
            tokio::spawn(async move {
                let mut buf: Vec<u8> = Vec::new();
                let mut chunk = [0u8; 4096];
                'conn: loop {
                    while let Ok(len) = frame_len(&buf) {
                        let frame: Vec<u8> = buf.drain(..len).collect();
                        log.lock().push(render_command(&frame));
                        let response = {
                            let mut script = script.lock();
                            if script.is_empty() {
                                b"+OK\r\n".to_vec()
                            } else {
                                script.remove(0)
                            }
                        };
                        if socket.write_all(&response).await.is_err() {
                            break 'conn;
                        }
                    }
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
            });
        }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    (addr, log)
}

/// Render an encoded command frame back into its argument strings.
fn render_command(frame: &[u8]) -> Vec<String> {
    let (reply, _) = decode_slice(frame).unwrap();
    match reply {
        Reply::Array(items) => items
            .into_iter()
            .map(|item| String::from_utf8_lossy(item.as_bytes().unwrap_or(b"?")).into_owned())
            .collect(),
        other => vec![format!("{other:?}")],
    }
}

/// Flatten a command log into `"CMD arg arg"` lines.
pub fn sent_commands(log: &CommandLog) -> Vec<String> {
    log.lock().iter().map(|c| c.join(" ")).collect()
}

/// Config pointing at a mock's address, with test-friendly timeouts.
pub fn config_for(addr: &str) -> ClientConfig {
    let (host, port) = addr.rsplit_once(':').unwrap();
    ClientConfig {
        host: host.to_string(),
        port: port.parse().unwrap(),
        timeout: Some(Duration::from_secs(1)),
        pool_timeout: Duration::from_secs(1),
        ..ClientConfig::default()
    }
}

/// Encode an array-of-bulk-strings frame.
pub fn bulk_array(parts: &[&str]) -> Vec<u8> {
    encode_command(&parts.iter().map(|p| p.as_bytes()).collect::<Vec<_>>())
}

/// Bulk string reply frame.
pub fn bulk(text: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", text.len(), text).into_bytes()
}

pub fn ok() -> Vec<u8> {
    b"+OK\r\n".to_vec()
}

pub fn queued() -> Vec<u8> {
    b"+QUEUED\r\n".to_vec()
}
