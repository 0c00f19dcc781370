//! Management service of a master: topology, whitelist and HTTP routes.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::client::MasterClient;
use crate::config::MasterOptions;
use crate::error::{MasterError, Result};
use crate::guard::Guard;
use crate::peers::{NodeAddress, PeerSet};
use crate::raft::{Command, RaftServer};
use crate::tls::TlsIdentity;
use crate::topology::{Topology, VolumeId};

const RESERVE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MasterServer {
    options: MasterOptions,
    peers: PeerSet,
    self_address: NodeAddress,
    topology: Arc<Topology>,
    guard: Guard,
    raft: OnceLock<Arc<RaftServer>>,
    client: Arc<MasterClient>,
    reserve_lock: Mutex<()>,
}

#[derive(Serialize)]
struct DirStatus {
    #[serde(rename = "Version")]
    version: &'static str,
    #[serde(rename = "Topology")]
    topology: TopologyInfo,
    #[serde(rename = "Leader", skip_serializing_if = "Option::is_none")]
    leader: Option<String>,
}

#[derive(Serialize)]
struct TopologyInfo {
    #[serde(rename = "Max")]
    max: VolumeId,
    #[serde(rename = "VolumeSizeLimitMB")]
    volume_size_limit_mb: u64,
    #[serde(rename = "DefaultReplication")]
    default_replication: String,
}

#[derive(Serialize)]
struct ReserveResponse {
    #[serde(rename = "VolumeId")]
    volume_id: VolumeId,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(rename = "Leader", skip_serializing_if = "Option::is_none")]
    leader: Option<String>,
}

fn error_response(status: StatusCode, error: impl Into<String>, leader: Option<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            leader,
        }),
    )
        .into_response()
}

impl MasterServer {
    /// The consensus slot starts empty; fill it with [`MasterServer::attach_raft`].
    ///
    /// # Errors
    ///
    /// Fails if a whitelist entry is neither an IP address nor a CIDR range.
    pub fn new(
        options: MasterOptions,
        peers: PeerSet,
        self_address: NodeAddress,
        tls: Option<TlsIdentity>,
    ) -> Result<Arc<Self>> {
        let topology = Arc::new(Topology::new(
            options.volume_size_limit_mb,
            options.default_replication.clone(),
        ));
        let guard = Guard::new(&options.white_list)?;
        let client = Arc::new(MasterClient::new(
            self_address.to_string(),
            peers.clone(),
            tls,
        ));

        tracing::debug!(
            self_address = %self_address,
            volume_size_limit_mb = options.volume_size_limit_mb,
            white_list = ?options.white_list,
            disable_http = options.disable_http,
            "Master server created"
        );

        Ok(Arc::new(Self {
            options,
            peers,
            self_address,
            topology,
            guard,
            raft: OnceLock::new(),
            client,
            reserve_lock: Mutex::new(()),
        }))
    }

    pub fn attach_raft(&self, raft: Arc<RaftServer>) -> Result<()> {
        self.raft
            .set(raft)
            .map_err(|_| MasterError::RaftAlreadyAttached)
    }

    pub fn raft(&self) -> Option<&Arc<RaftServer>> {
        self.raft.get()
    }

    pub fn options(&self) -> &MasterOptions {
        &self.options
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn self_address(&self) -> &NodeAddress {
        &self.self_address
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn client(&self) -> &Arc<MasterClient> {
        &self.client
    }

    pub async fn leader(&self) -> Option<NodeAddress> {
        match self.raft() {
            Some(raft) => raft.leader().await,
            None => None,
        }
    }

    /// Management routes. With `disable_http` set this is empty and only
    /// the consensus status route is served.
    pub fn router(self: &Arc<Self>) -> Router {
        let router = if self.options.disable_http {
            Router::new()
        } else {
            Router::new()
                .route("/dir/status", get(dir_status_handler))
                .route("/vol/reserve", post(reserve_volume_handler))
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).with_state(self.clone())
    }

    /// Reserve the next volume id through consensus. Only the leader can.
    pub async fn reserve_volume_id(&self) -> std::result::Result<VolumeId, Response> {
        let Some(raft) = self.raft() else {
            return Err(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "raft server not ready",
                None,
            ));
        };

        if !raft.is_leader().await {
            let leader = raft.leader().await.map(|l| l.to_string());
            return Err(error_response(StatusCode::CONFLICT, "not the leader", leader));
        }

        let _reserving = self.reserve_lock.lock().await;
        let volume_id = self.topology.next_volume_id();

        let internal = |e: MasterError| reserve_failure(volume_id, e);

        // Leadership can be lost after the check above.
        let index = raft
            .propose(Command::MaxVolumeId { volume_id })
            .await
            .map_err(internal)?;
        raft.wait_for_commit(index, RESERVE_TIMEOUT)
            .await
            .map_err(internal)?;

        let mut applied = self.topology.subscribe();
        tokio::time::timeout(RESERVE_TIMEOUT, applied.wait_for(|max| *max >= volume_id))
            .await
            .map_err(|_| internal(MasterError::Internal("commit not applied in time".into())))?
            .map_err(|_| internal(MasterError::Internal("topology closed".into())))?;

        tracing::info!(volume_id, index, "Reserved volume id");
        Ok(volume_id)
    }
}

fn reserve_failure(volume_id: VolumeId, e: MasterError) -> Response {
    match e {
        MasterError::NotLeader { leader } => error_response(
            StatusCode::CONFLICT,
            "not the leader",
            leader.map(|l| l.to_string()),
        ),
        e => {
            tracing::warn!(volume_id, error = %e, "Failed to reserve volume id");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), None)
        }
    }
}

async fn dir_status_handler(State(master): State<Arc<MasterServer>>) -> Json<DirStatus> {
    Json(DirStatus {
        version: env!("CARGO_PKG_VERSION"),
        topology: TopologyInfo {
            max: master.topology.max_volume_id(),
            volume_size_limit_mb: master.topology.volume_size_limit_mb(),
            default_replication: master.topology.default_replication().to_string(),
        },
        leader: master.leader().await.map(|l| l.to_string()),
    })
}

async fn reserve_volume_handler(
    State(master): State<Arc<MasterServer>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    if !master.guard.allows(remote.ip()) {
        tracing::warn!(remote = %remote, "Rejected client not on whitelist");
        return error_response(StatusCode::UNAUTHORIZED, "not in whitelist", None);
    }

    match master.reserve_volume_id().await {
        Ok(volume_id) => Json(ReserveResponse { volume_id }).into_response(),
        Err(resp) => resp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn lost_leadership_during_reserve_is_a_conflict() {
        let resp = reserve_failure(
            7,
            MasterError::NotLeader {
                leader: Some(NodeAddress::from("10.0.0.2:9333")),
            },
        );
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["Leader"], "10.0.0.2:9333");
    }

    #[tokio::test]
    async fn other_reserve_failures_are_internal() {
        let resp = reserve_failure(7, MasterError::Internal("commit timed out".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(resp).await.get("Leader").is_none());
    }
}
