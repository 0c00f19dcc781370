use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Duration, Instant};
use tonic::transport::Channel;

use crate::error::{MasterError, Result};
use crate::listener::grpc_address;
use crate::peers::{NodeAddress, PeerSet};
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::rpc::{handle_append_entries, handle_request_vote, log_entry_to_proto};
use crate::raft::state::{Command, LogEntry, RaftRole, RaftState};
use crate::raft::storage::RaftStorage;
use crate::raft::timer::RaftTimings;
use crate::tls::{self, TlsIdentity};
use crate::topology::Topology;

/// Message types for the raft event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Append a command to the log (leader only)
    AppendCommand {
        command: Command,
        response_tx: oneshot::Sender<Result<u64>>,
    },
}

/// Consensus service of a master.
///
/// Membership is the static [`PeerSet`] resolved at startup. Peers are
/// reached on their RPC port, derived from the HTTP address in the set.
pub struct RaftServer {
    me: NodeAddress,
    peers: PeerSet,
    pub state: Arc<RwLock<RaftState>>,
    storage: RaftStorage,
    timings: RaftTimings,
    clients: HashMap<NodeAddress, RaftServiceClient<Channel>>,
    topology: Arc<Topology>,
    message_tx: mpsc::Sender<RaftMessage>,
    message_rx: StdMutex<Option<mpsc::Receiver<RaftMessage>>>,
    last_heartbeat: RwLock<Instant>,
    commit_tx: watch::Sender<u64>,
}

impl RaftServer {
    /// Build the consensus service over `meta_folder`.
    ///
    /// Nothing runs until [`RaftServer::start`] is called.
    ///
    /// # Errors
    ///
    /// Fails if the raft state under `meta_folder` cannot be created or read,
    /// or if a peer address has no usable RPC port.
    pub fn new(
        tls: Option<&TlsIdentity>,
        peers: PeerSet,
        me: NodeAddress,
        meta_folder: &Path,
        topology: Arc<Topology>,
        timings: RaftTimings,
    ) -> Result<Arc<Self>> {
        let (storage, hard) = RaftStorage::open(meta_folder)?;

        let mut clients = HashMap::new();
        for peer in peers.others(&me) {
            let addr = grpc_address(peer).map_err(|e| MasterError::RaftInit {
                path: meta_folder.to_path_buf(),
                reason: format!("peer {}: {}", peer, e),
            })?;
            let channel = tls::endpoint(&addr, tls)?
                .connect_timeout(timings.rpc_timeout * 5)
                .connect_lazy();
            clients.insert(peer.clone(), RaftServiceClient::new(channel));
        }

        let (message_tx, message_rx) = mpsc::channel(100);
        let (commit_tx, _) = watch::channel(0);

        tracing::info!(
            me = %me,
            peers = ?peers.to_strings(),
            term = hard.current_term,
            log_len = hard.log.len(),
            election_timeout_ms = timings.election_timeout_min.as_millis() as u64,
            "Raft server created"
        );

        Ok(Arc::new(Self {
            me,
            peers,
            state: Arc::new(RwLock::new(RaftState::from_hard_state(hard))),
            storage,
            timings,
            clients,
            topology,
            message_tx,
            message_rx: StdMutex::new(Some(message_rx)),
            last_heartbeat: RwLock::new(Instant::now()),
            commit_tx,
        }))
    }

    /// Spawn the event loop and the loop applying committed entries to the
    /// topology, returning both handles so the owner can stop them. Only the
    /// first call spawns anything; later calls return no handles.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let rx = match self.message_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(rx) = rx else {
            tracing::warn!(me = %self.me, "Raft server already started");
            return Vec::new();
        };

        let raft = self.clone();
        let run = tokio::spawn(async move { raft.run(rx).await });

        let raft = self.clone();
        let apply = tokio::spawn(async move { raft.apply_loop().await });

        vec![run, apply]
    }

    pub fn me(&self) -> &NodeAddress {
        &self.me
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    pub async fn leader(&self) -> Option<NodeAddress> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.me.clone())
        } else {
            state.leader.clone()
        }
    }

    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Append `command` to the log. Returns the log index once appended on
    /// the leader; use [`RaftServer::wait_for_commit`] to wait for replication.
    ///
    /// A follower answers [`MasterError::NotLeader`] with the leader it knows.
    pub async fn propose(&self, command: Command) -> Result<u64> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(RaftMessage::AppendCommand {
                command,
                response_tx,
            })
            .await
            .map_err(|_| MasterError::Internal("raft event loop is not running".into()))?;

        response_rx
            .await
            .map_err(|_| MasterError::Internal("raft dropped the proposal".into()))?
    }

    /// Wait until `index` is committed.
    pub async fn wait_for_commit(&self, index: u64, deadline: Duration) -> Result<()> {
        let mut rx = self.subscribe_commits();
        let result = match timeout(deadline, rx.wait_for(|commit| *commit >= index)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(MasterError::Internal("raft commit channel closed".into())),
            Err(_) => Err(MasterError::Internal(format!(
                "log index {} not committed within {:?}",
                index, deadline
            ))),
        };
        result
    }

    async fn run(self: Arc<Self>, mut message_rx: mpsc::Receiver<RaftMessage>) {
        let mut election_timeout = self.timings.random_election_timeout();

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                Some(msg) = message_rx.recv() => {
                    match msg {
                        RaftMessage::AppendCommand { command, response_tx } => {
                            let result = self.handle_append_command(command).await;
                            let _ = response_tx.send(result);
                        }
                    }
                }

                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        tracing::info!(
                            me = %self.me,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Election timeout, starting election"
                        );
                        self.start_election().await;
                    }
                    election_timeout = self.timings.random_election_timeout();
                }

                _ = tokio::time::sleep(self.timings.heartbeat_interval), if role == RaftRole::Leader => {
                    self.send_heartbeats();
                }
            }
        }
    }

    async fn apply_loop(self: Arc<Self>) {
        let mut commit_rx = self.subscribe_commits();

        loop {
            for entry in self.take_committed_entries().await {
                match entry.command {
                    Command::MaxVolumeId { volume_id } => {
                        if self.topology.up_adjust_max_volume_id(volume_id) {
                            tracing::debug!(volume_id, index = entry.index, "Applied max volume id");
                        }
                    }
                    Command::Noop => {}
                }
            }

            if commit_rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn persist(&self, state: &RaftState) -> Result<()> {
        self.storage.save(&state.hard_state()).map_err(|source| {
            tracing::error!(
                dir = %self.storage.dir().display(),
                error = %source,
                "Failed to persist raft state"
            );
            MasterError::RaftPersist {
                path: self.storage.dir().to_path_buf(),
                source,
            }
        })
    }

    fn publish_commit(&self, commit_index: u64) {
        self.commit_tx.send_if_modified(|current| {
            if commit_index > *current {
                *current = commit_index;
                true
            } else {
                false
            }
        });
    }

    async fn start_election(self: &Arc<Self>) {
        let mut state = self.state.write().await;
        state.become_candidate(&self.me);
        let term = state.current_term;
        if self.persist(&state).is_err() {
            // Votes may only be asked for once our own vote is durable.
            state.become_follower(term);
            return;
        }
        let req = VoteRequest {
            term,
            candidate: self.me.to_string(),
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
        };
        drop(state);

        tracing::info!(me = %self.me, term, "Starting election");

        let mut requests = JoinSet::new();
        for (peer, client) in &self.clients {
            let mut client = client.clone();
            let peer = peer.clone();
            let req = req.clone();
            let rpc_timeout = self.timings.rpc_timeout;
            requests.spawn(async move {
                let result = timeout(rpc_timeout, client.request_vote(req)).await;
                (peer, result)
            });
        }

        let mut vote_count = 1usize;
        while let Some(joined) = requests.join_next().await {
            let Ok((peer, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(response)) => {
                    let resp = response.into_inner();
                    if resp.term > term {
                        let mut state = self.state.write().await;
                        if resp.term > state.current_term {
                            state.become_follower(resp.term);
                            let _ = self.persist(&state);
                        }
                        return;
                    }
                    if resp.vote_granted {
                        vote_count += 1;
                        tracing::debug!(me = %self.me, peer = %peer, votes = vote_count, "Received vote");
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer, error = %e, "Vote request failed");
                }
                Err(_) => {
                    tracing::debug!(peer = %peer, "Vote request timed out");
                }
            }
        }

        let majority = self.peers.quorum();
        let mut state = self.state.write().await;
        if state.role != RaftRole::Candidate || state.current_term != term {
            return;
        }
        state.votes_received = vote_count as u64;

        if vote_count >= majority {
            state.become_leader(&self.me, self.clients.keys());
            state.append_entry(Command::Noop);
            if self.persist(&state).is_err() {
                state.log.pop();
                state.become_follower(term);
                state.leader = None;
                return;
            }
            if state.advance_commit_index(self.peers.len()) {
                self.publish_commit(state.commit_index);
            }
            drop(state);

            tracing::info!(me = %self.me, term, votes = vote_count, "Became leader");
            self.send_heartbeats();
        } else {
            tracing::debug!(
                me = %self.me,
                term,
                votes = vote_count,
                needed = majority,
                "Election failed, not enough votes"
            );
        }
    }

    /// Replicate to every follower; doubles as the leader heartbeat.
    fn send_heartbeats(self: &Arc<Self>) {
        for (peer, client) in &self.clients {
            let raft = self.clone();
            let peer = peer.clone();
            let client = client.clone();
            tokio::spawn(async move { raft.replicate_to(peer, client).await });
        }
    }

    async fn replicate_to(&self, peer: NodeAddress, mut client: RaftServiceClient<Channel>) {
        let req = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }
            let next_index = state.next_index.get(&peer).copied().unwrap_or(1);
            let prev_log_index = next_index.saturating_sub(1);
            let prev_log_term = state.get_entry(prev_log_index).map(|e| e.term).unwrap_or(0);
            let entries = state.get_entries_from(next_index);

            AppendEntriesRequest {
                term: state.current_term,
                leader: self.me.to_string(),
                prev_log_index,
                prev_log_term,
                entries: entries.iter().map(log_entry_to_proto).collect(),
                leader_commit: state.commit_index,
            }
        };

        match timeout(self.timings.rpc_timeout, client.append_entries(req)).await {
            Ok(Ok(response)) => self.handle_append_response(&peer, response.into_inner()).await,
            Ok(Err(e)) => {
                tracing::trace!(peer = %peer, error = %e, "AppendEntries failed");
            }
            Err(_) => {
                tracing::trace!(peer = %peer, "AppendEntries timed out");
            }
        }
    }

    async fn handle_append_response(&self, peer: &NodeAddress, resp: AppendEntriesResponse) {
        let mut state = self.state.write().await;

        if resp.term > state.current_term {
            state.become_follower(resp.term);
            state.leader = None;
            let _ = self.persist(&state);
            return;
        }
        if state.role != RaftRole::Leader {
            return;
        }

        if resp.success {
            state.record_match(peer, resp.match_index);

            if state.advance_commit_index(self.peers.len()) {
                tracing::debug!(commit_index = state.commit_index, "Updated commit index");
                self.publish_commit(state.commit_index);
            }
        } else {
            // Step back, but never past what the follower says it has.
            let current = state.next_index.get(peer).copied().unwrap_or(1);
            let next = current.saturating_sub(1).min(resp.match_index + 1).max(1);
            state.next_index.insert(peer.clone(), next);
        }
    }

    async fn handle_append_command(&self, command: Command) -> Result<u64> {
        let mut state = self.state.write().await;

        if state.role != RaftRole::Leader {
            return Err(MasterError::NotLeader {
                leader: state.leader.clone(),
            });
        }

        let index = state.append_entry(command);
        if let Err(e) = self.persist(&state) {
            state.log.pop();
            return Err(e);
        }
        tracing::debug!(index, term = state.current_term, "Appended command to log");

        if state.advance_commit_index(self.peers.len()) {
            self.publish_commit(state.commit_index);
        }

        Ok(index)
    }

    /// Handle incoming RequestVote RPC. A vote is only granted once it is
    /// on disk.
    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        let mut state = self.state.write().await;
        let before = (state.current_term, state.voted_for.clone());
        let mut response = handle_request_vote(&mut state, &req, &self.me);

        if before != (state.current_term, state.voted_for.clone())
            && self.persist(&state).is_err()
        {
            if response.vote_granted {
                state.voted_for = if state.current_term == before.0 {
                    before.1
                } else {
                    None
                };
            }
            response.vote_granted = false;
        }
        drop(state);

        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }

        response
    }

    /// Handle incoming AppendEntries RPC. Success is only reported once the
    /// merged log is on disk.
    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.write().await;
        let before = state.hard_state();
        let commit_before = state.commit_index;
        let mut response = handle_append_entries(&mut state, &req, &self.me);

        if before != state.hard_state() && self.persist(&state).is_err() {
            state.log = before.log;
            state.commit_index = commit_before;
            response.success = false;
            response.match_index = state.last_log_index();
        }
        let commit_index = state.commit_index;
        drop(state);

        self.publish_commit(commit_index);
        if response.success {
            *self.last_heartbeat.write().await = Instant::now();
        }

        response
    }

    /// Entries that have been committed but not yet applied
    async fn take_committed_entries(&self) -> Vec<LogEntry> {
        let mut state = self.state.write().await;
        let mut entries = Vec::new();

        while state.last_applied < state.commit_index {
            state.last_applied += 1;
            if let Some(entry) = state.get_entry(state.last_applied) {
                entries.push(entry.clone());
            }
        }

        entries
    }
}
