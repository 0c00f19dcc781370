use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::master_server::MasterServer;
use crate::proto::master_service_server::MasterService;
use crate::proto::{
    GetMasterConfigurationRequest, GetMasterConfigurationResponse, KeepConnectedRequest,
    KeepConnectedResponse,
};

type KeepConnectedStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<KeepConnectedResponse, Status>> + Send>>;

/// gRPC service for clients of the master
pub struct ManagementService {
    master: Arc<MasterServer>,
}

impl ManagementService {
    pub fn new(master: Arc<MasterServer>) -> Self {
        Self { master }
    }
}

#[tonic::async_trait]
impl MasterService for ManagementService {
    type KeepConnectedStream = KeepConnectedStream;

    async fn keep_connected(
        &self,
        request: Request<KeepConnectedRequest>,
    ) -> Result<Response<Self::KeepConnectedStream>, Status> {
        let req = request.into_inner();
        let raft = self
            .master
            .raft()
            .cloned()
            .ok_or_else(|| Status::unavailable("raft server not ready"))?;
        let topology = self.master.topology().clone();

        let (tx, rx) = mpsc::channel(8);

        if !raft.is_leader().await {
            let leader = raft.leader().await.map(|l| l.to_string()).unwrap_or_default();
            tracing::debug!(client = %req.name, leader = %leader, "Redirecting client to leader");
            let _ = tx
                .send(Ok(KeepConnectedResponse {
                    leader,
                    max_volume_id: topology.max_volume_id(),
                }))
                .await;
            return Ok(Response::new(
                Box::pin(ReceiverStream::new(rx)) as Self::KeepConnectedStream
            ));
        }

        tracing::debug!(client = %req.name, "Client connected");
        let me = raft.me().to_string();
        let leadership_check = Duration::from_secs(self.master.options().pulse_seconds.max(1));

        tokio::spawn(async move {
            let mut max_volume_id = topology.subscribe();
            let mut ticker = tokio::time::interval(leadership_check);

            loop {
                let update = KeepConnectedResponse {
                    leader: me.clone(),
                    max_volume_id: *max_volume_id.borrow_and_update(),
                };
                if tx.send(Ok(update)).await.is_err() {
                    break;
                }

                // Wait for a change, or end the stream once leadership is lost.
                let lost_leadership = loop {
                    tokio::select! {
                        changed = max_volume_id.changed() => break changed.is_err(),
                        _ = ticker.tick() => {
                            if !raft.is_leader().await {
                                break true;
                            }
                        }
                        _ = tx.closed() => break true,
                    }
                };

                if lost_leadership {
                    let leader = raft.leader().await.map(|l| l.to_string()).unwrap_or_default();
                    if leader != me {
                        let _ = tx
                            .send(Ok(KeepConnectedResponse {
                                leader,
                                max_volume_id: topology.max_volume_id(),
                            }))
                            .await;
                    }
                    break;
                }
            }

            tracing::debug!(client = %req.name, "Client disconnected");
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::KeepConnectedStream
        ))
    }

    async fn get_master_configuration(
        &self,
        _request: Request<GetMasterConfigurationRequest>,
    ) -> Result<Response<GetMasterConfigurationResponse>, Status> {
        let options = self.master.options();
        let leader = self
            .master
            .leader()
            .await
            .map(|l| l.to_string())
            .unwrap_or_default();

        Ok(Response::new(GetMasterConfigurationResponse {
            volume_size_limit_mb: options.volume_size_limit_mb,
            default_replication: options.default_replication.clone(),
            volume_preallocate: options.volume_preallocate,
            garbage_threshold: options.garbage_threshold,
            metrics_address: options.metrics_address.clone(),
            metrics_interval_seconds: options.metrics_interval_sec,
            leader,
        }))
    }
}
