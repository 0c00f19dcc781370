use std::path::PathBuf;

use crate::error::{MasterError, Result};
use crate::guard::Guard;

/// Volumes may not be configured larger than this.
pub const VOLUME_SIZE_LIMIT_GB: u64 = 30;
pub const MAX_VOLUME_SIZE_LIMIT_MB: u64 = VOLUME_SIZE_LIMIT_GB * 1000;

/// Options handed to the management service.
#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Master stops directing writes to volumes that reach this size.
    pub volume_size_limit_mb: u64,
    /// Preallocate disk space for new volumes.
    pub volume_preallocate: bool,
    /// Seconds between heartbeats. Also scales the raft timeouts.
    pub pulse_seconds: u64,
    /// Replication type used when a request does not specify one.
    pub default_replication: String,
    /// Garbage ratio above which volumes are vacuumed.
    pub garbage_threshold: f64,
    /// Client IPs allowed to call mutating endpoints. Empty means no limit.
    pub white_list: Vec<String>,
    /// Only serve the status route over HTTP; everything else is gRPC only.
    pub disable_http: bool,
    /// Prometheus push gateway, advertised to volume servers.
    pub metrics_address: String,
    pub metrics_interval_sec: u32,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            volume_size_limit_mb: MAX_VOLUME_SIZE_LIMIT_MB,
            volume_preallocate: false,
            pulse_seconds: 5,
            default_replication: "000".to_string(),
            garbage_threshold: 0.3,
            white_list: Vec::new(),
            disable_http: false,
            metrics_address: String::new(),
            metrics_interval_sec: 15,
        }
    }
}

/// TLS configuration for the RPC surface.
///
/// When enabled, gRPC between masters and from clients uses mutual TLS:
/// both sides present a certificate signed by the cluster CA.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this node's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this node's private key (PEM format).
    pub key_path: Option<PathBuf>,

    /// When true and TLS files are missing, run in plaintext with a warning.
    /// When false and TLS files are missing, fail to start.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

/// Everything bootstrap needs, captured once at process start.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// HTTP port. The RPC port is derived from it.
    pub port: u16,
    /// Address other masters and clients reach this node at.
    pub ip: String,
    /// Address the listeners bind to.
    pub ip_bind: String,
    /// Directory holding the raft state.
    pub meta_folder: PathBuf,
    /// Raw comma separated `ip:port` list of all masters.
    pub peers: String,
    pub options: MasterOptions,
    pub tls: TlsConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            port: 9333,
            ip: "localhost".to_string(),
            ip_bind: "0.0.0.0".to_string(),
            meta_folder: std::env::temp_dir(),
            peers: String::new(),
            options: MasterOptions::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl MasterConfig {
    pub fn new(ip: impl Into<String>, port: u16, meta_folder: impl Into<PathBuf>) -> Self {
        Self {
            ip: ip.into(),
            port,
            meta_folder: meta_folder.into(),
            ..Default::default()
        }
    }

    pub fn with_peers(mut self, peers: impl Into<String>) -> Self {
        self.peers = peers.into();
        self
    }

    /// Reject settings the master cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.options.volume_size_limit_mb > MAX_VOLUME_SIZE_LIMIT_MB {
            return Err(MasterError::VolumeSizeLimit {
                configured_mb: self.options.volume_size_limit_mb,
                max_mb: MAX_VOLUME_SIZE_LIMIT_MB,
            });
        }
        Guard::new(&self.options.white_list)?;
        Ok(())
    }
}

/// Split a comma separated whitelist. Empty input means no restriction.
pub fn parse_white_list(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',').map(str::to_string).collect()
}
