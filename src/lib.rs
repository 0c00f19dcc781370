pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod grpc;
pub mod guard;
pub mod lifecycle;
pub mod listener;
pub mod master_server;
pub mod peers;
pub mod raft;
pub mod tls;
pub mod topology;

pub use bootstrap::{Bootstrap, RunningMaster};
pub use config::{MasterConfig, MasterOptions};
pub use error::{MasterError, Result};

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("master");
}

/// Encoded descriptors of `proto/master.proto`, served through gRPC reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("master_descriptor");
