//! Local-service connections.
//!
//! One `LocalEndpoint` serves a whole session; each call to
//! [`LocalEndpoint::connect`] is a single pairing attempt. Retry policy lives
//! with the session, which is the only place that can observe whether the
//! remote connection is still worth retrying for.

use crate::config::TunnelConfig;
use crate::error::{ConfigError, LocalError};
use rustls::pki_types::ServerName;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Wrapper for the plain/TLS local stream variants.
pub(crate) enum LocalStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for LocalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            LocalStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            LocalStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_flush(cx),
            LocalStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            LocalStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Dials the local service for one pairing at a time.
pub(crate) struct LocalEndpoint {
    addr: String,
    host: String,
    connector: Option<TlsConnector>,
}

impl LocalEndpoint {
    /// Build from validated configuration. The TLS connector, when needed,
    /// is constructed here so credential problems fail before any I/O.
    pub(crate) fn new(config: &TunnelConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            addr: config.local_addr(),
            host: config.local_host().to_string(),
            connector: crate::tls::build_connector(config)?,
        })
    }

    /// One connect attempt, TLS handshake included when configured.
    pub(crate) async fn connect(&self) -> Result<LocalStream, LocalError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(LocalError::classify)?;

        match &self.connector {
            None => {
                debug!(addr = %self.addr, "connected to local service");
                Ok(LocalStream::Plain(stream))
            }
            Some(connector) => {
                let server_name = ServerName::try_from(self.host.clone()).map_err(|e| {
                    LocalError::Fatal(io::Error::new(io::ErrorKind::InvalidInput, e))
                })?;
                let tls = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(LocalError::classify)?;
                debug!(addr = %self.addr, "connected to local service over TLS");
                Ok(LocalStream::Tls(Box::new(tls)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config_for_port(port: u16) -> TunnelConfig {
        TunnelConfig::builder()
            .remote("broker.example", 7070)
            .local_host("127.0.0.1")
            .local_port(port)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let endpoint = LocalEndpoint::new(&config_for_port(port)).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut stream = endpoint.connect().await.unwrap();
        let (mut peer, _) = accept.await.unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_connect_refused_is_transient() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = LocalEndpoint::new(&config_for_port(port)).unwrap();
        match endpoint.connect().await {
            Err(LocalError::Transient(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected transient refusal, got {:?}", other.map(|_| ())),
        }
    }
}
