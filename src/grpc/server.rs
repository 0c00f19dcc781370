use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic::transport::Server;

use crate::error::{MasterError, Result};
use crate::grpc::cluster_service::ClusterService;
use crate::grpc::master_service::ManagementService;
use crate::master_server::MasterServer;
use crate::proto::master_service_server::MasterServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::RaftServer;
use crate::tls::TlsIdentity;

/// RPC surface of a master: management, raft and reflection on one server.
pub struct GrpcServer {
    router: Router,
}

impl GrpcServer {
    pub fn new(
        master: Arc<MasterServer>,
        raft: Arc<RaftServer>,
        tls: Option<&TlsIdentity>,
    ) -> Result<Self> {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(crate::FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| MasterError::Internal(format!("gRPC reflection: {}", e)))?;

        let mut builder = Server::builder();
        if let Some(identity) = tls {
            builder = builder.tls_config(identity.server_tls_config())?;
        }

        let router = builder
            .add_service(MasterServiceServer::new(ManagementService::new(master)))
            .add_service(RaftServiceServer::new(ClusterService::new(raft)))
            .add_service(reflection);

        Ok(Self { router })
    }

    /// Serve on an already bound listener until the process exits.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.router
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await?;
        Ok(())
    }
}
