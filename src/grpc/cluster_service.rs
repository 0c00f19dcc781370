//! Raft traffic between masters, served on the RPC port.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::proto::raft_service_server::RaftService;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::RaftServer;

pub struct ClusterService {
    raft: Arc<RaftServer>,
}

impl ClusterService {
    pub fn new(raft: Arc<RaftServer>) -> Self {
        Self { raft }
    }

    /// Raft only accepts traffic from masters in the static peer set.
    fn check_sender(&self, sender: &str) -> Result<(), Status> {
        if self.raft.peers().iter().any(|p| p.as_str() == sender) {
            Ok(())
        } else {
            tracing::warn!(me = %self.raft.me(), sender, "Raft RPC from unknown master");
            Err(Status::permission_denied(format!(
                "{} is not a master of this cluster",
                sender
            )))
        }
    }
}

#[tonic::async_trait]
impl RaftService for ClusterService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        self.check_sender(&req.candidate)?;

        let candidate = req.candidate.clone();
        let term = req.term;
        let resp = self.raft.handle_vote_request(req).await;
        tracing::debug!(
            candidate = %candidate,
            term,
            granted = resp.vote_granted,
            our_term = resp.term,
            "Vote"
        );
        Ok(Response::new(resp))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        self.check_sender(&req.leader)?;

        let leader = req.leader.clone();
        let sent = req.entries.len();
        let resp = self.raft.handle_append_entries(req).await;
        if !resp.success {
            tracing::debug!(
                leader = %leader,
                sent,
                our_term = resp.term,
                match_index = resp.match_index,
                "Rejected append"
            );
        }
        Ok(Response::new(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::resolve_peers;
    use crate::raft::RaftTimings;
    use crate::topology::Topology;

    fn service(dir: &std::path::Path) -> ClusterService {
        let (me, peers) =
            resolve_peers("127.0.0.1", 9333, "127.0.0.2:9333,127.0.0.3:9333").unwrap();
        let raft = RaftServer::new(
            None,
            peers,
            me,
            dir,
            Arc::new(Topology::new(30_000, "000")),
            RaftTimings::from_pulse_seconds(5),
        )
        .unwrap();
        ClusterService::new(raft)
    }

    #[tokio::test]
    async fn vote_from_peer_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        let resp = svc
            .request_vote(Request::new(VoteRequest {
                term: 1,
                candidate: "127.0.0.2:9333".into(),
                last_log_index: 0,
                last_log_term: 0,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.vote_granted);
    }

    #[tokio::test]
    async fn traffic_from_outside_the_peer_set_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        let status = svc
            .append_entries(Request::new(AppendEntriesRequest {
                term: 9,
                leader: "192.0.2.1:9333".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        assert_eq!(svc.raft.state.read().await.current_term, 0);
    }
}
