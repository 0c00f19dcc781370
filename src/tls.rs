//! TLS material for the RPC surface.
//!
//! Certificates are loaded once at startup. The same identity is used as a
//! server (RPC listener) and as a client (raft transport, master client).

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Server name presented in client handshakes. Masters dial each other by
/// IP, so certificates are issued for this name instead.
pub const CLUSTER_DOMAIN: &str = "seaweed-master-cluster";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Node certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("TLS enabled but missing required paths (--ca-cert, --cert, --key)")]
    Incomplete,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Node certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid endpoint {addr}: {source}")]
    Endpoint {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },
}

/// Node identity plus the CA used to verify peers.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity").finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Load TLS materials from the paths in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a path is not configured or a file cannot be read.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_cert_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::MissingCaCert)?;
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        if !ca_cert_path.exists() {
            return Err(TlsError::CaCertNotFound(ca_cert_path.clone()));
        }
        if !cert_path.exists() {
            return Err(TlsError::CertNotFound(cert_path.clone()));
        }
        if !key_path.exists() {
            return Err(TlsError::KeyNotFound(key_path.clone()));
        }

        let ca_pem = fs::read(ca_cert_path).await?;
        let cert_pem = fs::read(cert_path).await?;
        let key_pem = fs::read(key_path).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        })
    }

    /// Resolve the identity the node should run with.
    ///
    /// `Ok(None)` means plaintext: TLS was not requested, or it was requested
    /// with `allow_insecure` and the certificates could not be used.
    pub async fn from_config(config: &TlsConfig) -> Result<Option<Self>, TlsError> {
        if !config.enabled {
            return Ok(None);
        }

        if !config.is_complete() {
            if config.allow_insecure {
                tracing::warn!(
                    "TLS enabled but certificate paths incomplete, running in insecure mode"
                );
                return Ok(None);
            }
            return Err(TlsError::Incomplete);
        }

        match Self::load(config).await {
            Ok(identity) => {
                tracing::info!("TLS enabled with mTLS authentication");
                Ok(Some(identity))
            }
            Err(e) if config.allow_insecure => {
                tracing::warn!(
                    error = %e,
                    "TLS certificate loading failed, running in insecure mode"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Server side: present our certificate and require client certificates.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client side: verify the server against the CA and present our own
    /// certificate.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(CLUSTER_DOMAIN)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

/// Build a gRPC endpoint for `addr` (`host:port`), using TLS when an
/// identity is loaded.
pub fn endpoint(addr: &str, tls: Option<&TlsIdentity>) -> Result<Endpoint, TlsError> {
    let uri = match tls {
        Some(_) => format!("https://{}", addr),
        None => format!("http://{}", addr),
    };
    let endpoint_err = |source| TlsError::Endpoint {
        addr: addr.to_string(),
        source,
    };

    let endpoint = Endpoint::from_shared(uri).map_err(endpoint_err)?;
    match tls {
        Some(identity) => endpoint
            .tls_config(identity.client_tls_config())
            .map_err(endpoint_err),
        None => Ok(endpoint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_paths() {
        let config = TlsConfig {
            enabled: true,
            ..TlsConfig::default()
        };

        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::MissingCaCert)));
    }

    #[tokio::test]
    async fn test_load_nonexistent_files() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            cert_path: Some(PathBuf::from("/nonexistent/node.crt")),
            key_path: Some(PathBuf::from("/nonexistent/node.key")),
            allow_insecure: false,
        };

        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::CaCertNotFound(_))));
    }

    #[tokio::test]
    async fn disabled_tls_runs_plaintext() {
        let identity = TlsIdentity::from_config(&TlsConfig::default())
            .await
            .unwrap();
        assert!(identity.is_none());
    }

    #[tokio::test]
    async fn incomplete_tls_is_fatal_unless_insecure_allowed() {
        let mut config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            ..TlsConfig::default()
        };
        assert!(matches!(
            TlsIdentity::from_config(&config).await,
            Err(TlsError::Incomplete)
        ));

        config.allow_insecure = true;
        assert!(TlsIdentity::from_config(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_certs_fall_back_when_insecure_allowed() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            cert_path: Some(PathBuf::from("/nonexistent/node.crt")),
            key_path: Some(PathBuf::from("/nonexistent/node.key")),
            allow_insecure: true,
        };
        assert!(TlsIdentity::from_config(&config).await.unwrap().is_none());
    }

    #[test]
    fn plaintext_endpoint_uses_http_scheme() {
        let endpoint = endpoint("127.0.0.1:19333", None).unwrap();
        assert!(endpoint
            .uri()
            .to_string()
            .starts_with("http://127.0.0.1:19333"));
    }
}
