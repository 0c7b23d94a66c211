//! Client configuration

use crate::error::ConfigError;
use std::path::Path;

/// TLS credential material as opaque PEM byte buffers.
///
/// The client never touches the filesystem after construction; callers either
/// supply bytes directly or go through [`TlsCredentials::load`].
#[derive(Debug, Clone)]
pub struct TlsCredentials {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    pub ca: Option<Vec<u8>>,
}

impl TlsCredentials {
    /// Read certificate, key and optional CA bundle from PEM files.
    ///
    /// Failures are synchronous and fatal; an unreadable file here means the
    /// tunnel cannot be configured at all.
    pub fn load(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        ca_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let cert = read_pem(cert_path.as_ref())?;
        let key = read_pem(key_path.as_ref())?;
        let ca = ca_path.map(read_pem).transpose()?;
        Ok(Self { cert, key, ca })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::CredentialRead {
        path: path.display().to_string(),
        source,
    })
}

/// Tunnel configuration
///
/// Immutable once built. `local_host` doubles as the Host-header override:
/// when set, the client dials that host *and* rewrites the Host header of the
/// first tunneled request to it; when unset, "localhost" is dialed and no
/// rewriting happens.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_host: Option<String>,
    pub local_port: u16,
    pub local_tls: bool,
    pub allow_invalid_certs: bool,
    pub credentials: Option<TlsCredentials>,
    pub session_expiry: bool,
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Host the local service is dialed at.
    pub fn local_host(&self) -> &str {
        self.local_host.as_deref().unwrap_or("localhost")
    }

    /// Host-header override, present only when a local host was configured
    /// explicitly.
    pub fn host_override(&self) -> Option<&str> {
        self.local_host.as_deref()
    }

    pub(crate) fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    pub(crate) fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host(), self.local_port)
    }
}

/// Builder for TunnelConfig
#[derive(Debug, Default)]
pub struct TunnelConfigBuilder {
    remote_host: Option<String>,
    remote_port: Option<u16>,
    local_host: Option<String>,
    local_port: Option<u16>,
    local_tls: bool,
    allow_invalid_certs: bool,
    credentials: Option<TlsCredentials>,
    session_expiry: bool,
}

impl TunnelConfigBuilder {
    /// Broker endpoint the control connection attaches to.
    pub fn remote(mut self, host: impl Into<String>, port: u16) -> Self {
        self.remote_host = Some(host.into());
        self.remote_port = Some(port);
        self
    }

    /// Explicit local host; also enables Host-header rewriting to this value.
    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = Some(host.into());
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Dial the local service over TLS instead of plain TCP.
    pub fn local_tls(mut self, enabled: bool) -> Self {
        self.local_tls = enabled;
        self
    }

    /// Skip certificate validation for the local TLS connection.
    pub fn allow_invalid_certs(mut self, allow: bool) -> Self {
        self.allow_invalid_certs = allow;
        self
    }

    pub fn credentials(mut self, credentials: TlsCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Retire each pairing after a randomized lifetime to spread reconnect
    /// load away from synchronized round timeouts.
    pub fn session_expiry(mut self, enabled: bool) -> Self {
        self.session_expiry = enabled;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, ConfigError> {
        let remote_host = self.remote_host.ok_or(ConfigError::MissingRemoteHost)?;
        let remote_port = self.remote_port.ok_or(ConfigError::MissingRemotePort)?;
        let local_port = self.local_port.ok_or(ConfigError::MissingLocalPort)?;

        if self.local_tls && !self.allow_invalid_certs && self.credentials.is_none() {
            return Err(ConfigError::MissingCredentials);
        }

        Ok(TunnelConfig {
            remote_host,
            remote_port,
            local_host: self.local_host,
            local_port,
            local_tls: self.local_tls,
            allow_invalid_certs: self.allow_invalid_certs,
            credentials: self.credentials,
            session_expiry: self.session_expiry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = TunnelConfig::builder()
            .remote("broker.example", 7070)
            .local_port(3000)
            .build()
            .unwrap();

        assert_eq!(config.remote_host, "broker.example");
        assert_eq!(config.remote_port, 7070);
        assert_eq!(config.local_port, 3000);
        assert!(!config.local_tls);
        assert!(!config.session_expiry);
    }

    #[test]
    fn test_local_host_defaults_to_localhost() {
        let config = TunnelConfig::builder()
            .remote("broker.example", 7070)
            .local_port(3000)
            .build()
            .unwrap();

        assert_eq!(config.local_host(), "localhost");
        assert!(config.host_override().is_none());
        assert_eq!(config.local_addr(), "localhost:3000");
    }

    #[test]
    fn test_explicit_local_host_enables_override() {
        let config = TunnelConfig::builder()
            .remote("broker.example", 7070)
            .local_host("app.internal")
            .local_port(3000)
            .build()
            .unwrap();

        assert_eq!(config.local_host(), "app.internal");
        assert_eq!(config.host_override(), Some("app.internal"));
    }

    #[test]
    fn test_config_builder_missing_remote() {
        let result = TunnelConfig::builder().local_port(3000).build();
        assert!(matches!(result, Err(ConfigError::MissingRemoteHost)));
    }

    #[test]
    fn test_config_builder_missing_local_port() {
        let result = TunnelConfig::builder().remote("broker.example", 7070).build();
        assert!(matches!(result, Err(ConfigError::MissingLocalPort)));
    }

    #[test]
    fn test_tls_without_credentials_rejected() {
        let result = TunnelConfig::builder()
            .remote("broker.example", 7070)
            .local_port(3000)
            .local_tls(true)
            .build();
        assert!(matches!(result, Err(ConfigError::MissingCredentials)));
    }

    #[test]
    fn test_tls_with_trust_override_accepted() {
        let config = TunnelConfig::builder()
            .remote("broker.example", 7070)
            .local_port(3000)
            .local_tls(true)
            .allow_invalid_certs(true)
            .build()
            .unwrap();
        assert!(config.local_tls);
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_credentials_load_missing_file() {
        let result = TlsCredentials::load(
            "/nonexistent/cert.pem",
            "/nonexistent/key.pem",
            None,
        );
        assert!(matches!(result, Err(ConfigError::CredentialRead { .. })));
    }
}
