use crate::peers::NodeAddress;
use crate::proto::{
    command::CommandType, AppendEntriesRequest, AppendEntriesResponse, Command as ProtoCommand,
    LogEntry as ProtoLogEntry, MaxVolumeIdCommand, VoteRequest, VoteResponse,
};
use crate::raft::state::{Command, LogEntry, RaftRole, RaftState};

/// Handle RequestVote RPC
pub fn handle_request_vote(
    state: &mut RaftState,
    req: &VoteRequest,
    me: &NodeAddress,
) -> VoteResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let candidate = NodeAddress::from(req.candidate.as_str());
    let vote_granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some() && state.voted_for.as_ref() != Some(&candidate) {
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.voted_for = Some(candidate);
        true
    };

    tracing::debug!(
        node = %me,
        candidate = %req.candidate,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    me: &NodeAddress,
) -> AppendEntriesResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let reject = |state: &RaftState| AppendEntriesResponse {
        term: state.current_term,
        success: false,
        match_index: state.last_log_index(),
    };

    if req.term < state.current_term {
        return reject(state);
    }

    // A valid leader exists for this term.
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader = Some(NodeAddress::from(req.leader.as_str()));

    if req.prev_log_index > 0 {
        match state.get_entry(req.prev_log_index).map(|e| e.term) {
            None => return reject(state),
            Some(term) if term != req.prev_log_term => {
                state.log.truncate((req.prev_log_index - 1) as usize);
                return reject(state);
            }
            Some(_) => {}
        }
    }

    let sent_through = req.prev_log_index + req.entries.len() as u64;
    if state.merge_entries(req.entries.iter().map(proto_to_log_entry)) {
        tracing::debug!(
            node = %me,
            entries = req.entries.len(),
            new_last_index = state.last_log_index(),
            "Merged entries from leader"
        );
    }

    // Only what this request covered is known to match the leader. Entries
    // past it may be a stale tail from an older term.
    let commit = req.leader_commit.min(sent_through);
    if commit > state.commit_index {
        state.commit_index = commit;
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: sent_through,
    }
}

/// Convert protobuf LogEntry to internal LogEntry
pub fn proto_to_log_entry(proto: &ProtoLogEntry) -> LogEntry {
    let command = match proto.command.as_ref().and_then(|c| c.command_type.as_ref()) {
        Some(CommandType::MaxVolumeId(cmd)) => Command::MaxVolumeId {
            volume_id: cmd.volume_id,
        },
        None => Command::Noop,
    };

    LogEntry {
        term: proto.term,
        index: proto.index,
        command,
    }
}

/// Convert internal LogEntry to protobuf LogEntry
pub fn log_entry_to_proto(entry: &LogEntry) -> ProtoLogEntry {
    let command = match &entry.command {
        Command::MaxVolumeId { volume_id } => Some(ProtoCommand {
            command_type: Some(CommandType::MaxVolumeId(MaxVolumeIdCommand {
                volume_id: *volume_id,
            })),
        }),
        Command::Noop => None,
    };

    ProtoLogEntry {
        term: entry.term,
        index: entry.index,
        command,
    }
}
