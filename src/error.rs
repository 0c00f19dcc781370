use std::path::PathBuf;

use thiserror::Error;

use crate::peers::NodeAddress;
use crate::tls::TlsError;

/// How a failure should be read by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fix the flags and restart.
    Configuration,
    /// A directory or port the node needs is not available.
    ResourceUnavailable,
    /// A service the master depends on could not be built.
    DependentService,
    /// Failure after startup, surfaced to a request.
    Runtime,
}

#[derive(Error, Debug)]
pub enum MasterError {
    #[error("Only odd number of masters are supported! Resolved {count} peers: {peers:?}")]
    EvenQuorum { count: usize, peers: Vec<String> },

    #[error("volumeSizeLimitMB should be smaller than {max_mb}, got {configured_mb}")]
    VolumeSizeLimit { configured_mb: u64, max_mb: u64 },

    #[error("Port {port} leaves no room for the RPC port at +{offset}")]
    InvalidPort { port: u16, offset: u16 },

    #[error("Invalid node address {0:?}, expected host:port")]
    InvalidAddress(String),

    #[error(
        "Check meta folder (--mdir) writable {path}: {reason}. \
         Make sure the directory exists and is writable by this user"
    )]
    MetaFolderNotWritable { path: PathBuf, reason: String },

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Raft server failed to start, please verify {path} is writable: {reason}")]
    RaftInit { path: PathBuf, reason: String },

    #[error("Invalid whitelist entry {entry:?}, expected an IP address or CIDR range")]
    InvalidWhiteList { entry: String },

    #[error("Not the leader, current leader: {}", .leader.as_ref().map(|l| l.as_str()).unwrap_or("unknown"))]
    NotLeader { leader: Option<NodeAddress> },

    #[error("Failed to persist raft state in {path}: {source}")]
    RaftPersist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Raft server is already attached to the master server")]
    RaftAlreadyAttached,

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MasterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MasterError::EvenQuorum { .. }
            | MasterError::VolumeSizeLimit { .. }
            | MasterError::InvalidPort { .. }
            | MasterError::InvalidAddress(_)
            | MasterError::InvalidWhiteList { .. }
            | MasterError::Tls(_) => ErrorKind::Configuration,
            MasterError::MetaFolderNotWritable { .. } | MasterError::Bind { .. } => {
                ErrorKind::ResourceUnavailable
            }
            MasterError::RaftInit { .. } | MasterError::RaftAlreadyAttached => {
                ErrorKind::DependentService
            }
            MasterError::NotLeader { .. }
            | MasterError::RaftPersist { .. }
            | MasterError::Grpc(_)
            | MasterError::Transport(_)
            | MasterError::Internal(_) => ErrorKind::Runtime,
        }
    }
}

pub type Result<T> = std::result::Result<T, MasterError>;
