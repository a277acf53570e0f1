//! Shared helpers for unit tests: a scripted mock server speaking just
//! enough RESP to exercise the client.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::resp::parser::{decode_slice, frame_len};
use crate::resp::types::Reply;

/// Commands received by a [`scripted_server`], rendered as argument strings.
pub type CommandLog = Arc<Mutex<Vec<Vec<String>>>>;

/// Start a mock server that answers each complete command frame with the
/// next canned response (then `+OK` once the script runs out). Accepts
/// any number of connections; the script and the command log are shared
/// across all of them.
pub async fn scripted_server(responses: Vec<&'static [u8]>) -> (String, CommandLog) {
    scripted_server_owned(responses.into_iter().map(<[u8]>::to_vec).collect()).await
}

/// [`scripted_server`] with owned response frames (for scripts that must
/// embed runtime data such as another mock's address).
pub async fn scripted_server_owned(responses: Vec<Vec<u8>>) -> (String, CommandLog) {
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

/// Encode an array-of-bulk-strings frame (commands, pub/sub messages,
/// sentinel field maps all share this shape).
pub fn bulk_array(parts: &[&str]) -> Vec<u8> {
    crate::resp::writer::encode_command(&parts.iter().map(|p| p.as_bytes()).collect::<Vec<_>>())
}

/// Render an encoded command frame back into its argument strings.
pub fn render_command(frame: &[u8]) -> Vec<String> {
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
pub fn flatten(log: &CommandLog) -> Vec<String> {
    log.lock().iter().map(|c| c.join(" ")).collect()
}
