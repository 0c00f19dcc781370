use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::raft::RaftServer;

/// Body of `GET /cluster/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(rename = "IsLeader")]
    pub is_leader: bool,
    #[serde(rename = "Leader", default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    /// Every other master in the peer set
    #[serde(rename = "Peers", default)]
    pub peers: Vec<String>,
}

impl RaftServer {
    pub async fn cluster_status(&self) -> ClusterStatus {
        ClusterStatus {
            is_leader: self.is_leader().await,
            leader: self.leader().await.map(|l| l.to_string()),
            peers: self
                .peers()
                .others(self.me())
                .map(|p| p.to_string())
                .collect(),
        }
    }

    /// Routes the consensus service exposes on the HTTP listener.
    pub fn status_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/cluster/status", get(cluster_status_handler))
            .with_state(self.clone())
    }
}

async fn cluster_status_handler(State(raft): State<Arc<RaftServer>>) -> Json<ClusterStatus> {
    Json(raft.cluster_status().await)
}
