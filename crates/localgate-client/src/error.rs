//! Error types surfaced by the tunnel client.

use thiserror::Error;

/// Errors surfaced to the caller, either from `open()` or as `Error` events.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The broker actively refused the control connection. The tunnel cannot
    /// exist at all; nothing is retried.
    #[error("connection refused: {host}:{port} (check your firewall settings)")]
    RemoteRefused { host: String, port: u16 },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Synchronous configuration failures. These are fatal for the caller, never
/// retryable.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("remote host is required")]
    MissingRemoteHost,

    #[error("remote port is required")]
    MissingRemotePort,

    #[error("local port is required")]
    MissingLocalPort,

    #[error("local TLS requires credentials unless certificate validation is disabled")]
    MissingCredentials,

    #[error("failed to read credential file {path}: {source}")]
    CredentialRead {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse credential material: {0}")]
    CredentialParse(String),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

/// Classification of a local-connection failure, connect-time or runtime.
///
/// Transient failures are retried for as long as the remote connection lives;
/// fatal ones retire the whole pairing.
#[derive(Error, Debug)]
pub(crate) enum LocalError {
    #[error("transient local failure: {0}")]
    Transient(std::io::Error),

    #[error("fatal local failure: {0}")]
    Fatal(std::io::Error),
}

impl LocalError {
    /// Refused and reset are the recoverable kinds; everything else retires
    /// the pairing.
    pub(crate) fn classify(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => Self::Transient(err),
            _ => Self::Fatal(err),
        }
    }
}
