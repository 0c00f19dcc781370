use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::peers::NodeAddress;
use crate::topology::VolumeId;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Commands replicated through the master log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Raise the cluster-wide max volume id
    MaxVolumeId { volume_id: VolumeId },
    /// Appended by a new leader so it can commit entries of its own term
    Noop,
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

/// The part of [`RaftState`] that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeAddress>,
    pub log: Vec<LogEntry>,
}

/// Raft state of one master.
///
/// Safety rests on the usual invariants:
/// - one vote per term (`voted_for`), majority needed to lead
/// - leaders only append; followers truncate on conflict
/// - `AppendEntries` consistency check on (prev_log_index, prev_log_term)
/// - votes only go to candidates with an up-to-date log
/// - leaders only commit entries from their own term
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<NodeAddress>,
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<NodeAddress, u64>,
    pub match_index: HashMap<NodeAddress, u64>,

    pub role: RaftRole,
    pub leader: Option<NodeAddress>,
    pub votes_received: u64,
}

impl RaftState {
    pub fn new() -> Self {
        Self::from_hard_state(HardState::default())
    }

    pub fn from_hard_state(hard: HardState) -> Self {
        Self {
            current_term: hard.current_term,
            voted_for: hard.voted_for,
            log: hard.log,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader: None,
            votes_received: 0,
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            log: self.log.clone(),
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Get log entry at index (1-indexed)
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Entries starting from index (inclusive)
    pub fn get_entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        if start_index == 0 {
            return self.log.clone();
        }
        let start = (start_index - 1) as usize;
        if start >= self.log.len() {
            return Vec::new();
        }
        self.log[start..].to_vec()
    }

    /// Append a command in the current term and return its index
    pub fn append_entry(&mut self, command: Command) -> u64 {
        let index = self.last_log_index() + 1;
        self.log.push(LogEntry {
            term: self.current_term,
            index,
            command,
        });
        index
    }

    /// Merge entries sent by the leader after a successful consistency
    /// check. Entries already held with the same term are kept; the log is
    /// cut only at the first index whose term differs. Returns true if the
    /// log changed.
    pub fn merge_entries(&mut self, entries: impl IntoIterator<Item = LogEntry>) -> bool {
        let mut changed = false;
        for entry in entries {
            match self.get_entry(entry.index).map(|e| e.term) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.log.truncate((entry.index - 1) as usize);
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
            changed = true;
        }
        changed
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.current_term = term;
        self.votes_received = 0;
    }

    pub fn become_candidate(&mut self, me: &NodeAddress) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(me.clone());
        self.votes_received = 1;
        self.leader = None;
    }

    pub fn become_leader<'a>(
        &mut self,
        me: &NodeAddress,
        peers: impl IntoIterator<Item = &'a NodeAddress>,
    ) {
        self.role = RaftRole::Leader;
        self.leader = Some(me.clone());

        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for peer in peers {
            self.next_index.insert(peer.clone(), last_log_index + 1);
            self.match_index.insert(peer.clone(), 0);
        }
    }

    /// Record a successful AppendEntries reply. Replies can arrive out of
    /// order, so `match_index` never moves back.
    pub fn record_match(&mut self, peer: &NodeAddress, match_index: u64) {
        let matched = self.match_index.entry(peer.clone()).or_insert(0);
        *matched = (*matched).max(match_index);
        let next = *matched + 1;
        self.next_index.insert(peer.clone(), next);
    }

    /// Move the commit index to the highest entry of the current term that
    /// a majority of `cluster_size` holds. Returns true if it moved.
    pub fn advance_commit_index(&mut self, cluster_size: usize) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }

        let mut match_indices: Vec<u64> = self.match_index.values().copied().collect();
        match_indices.push(self.last_log_index());
        // Peers that never answered count as holding nothing.
        match_indices.resize(cluster_size.max(match_indices.len()), 0);
        match_indices.sort_unstable_by(|a, b| b.cmp(a));

        let majority = cluster_size / 2 + 1;
        let candidate = match_indices[majority - 1];

        if candidate > self.commit_index {
            if let Some(entry) = self.get_entry(candidate) {
                if entry.term == self.current_term {
                    self.commit_index = candidate;
                    return true;
                }
            }
        }
        false
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NodeAddress {
        NodeAddress::from(s)
    }

    #[test]
    fn test_new_state_is_follower() {
        let state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert!(state.log.is_empty());
    }

    #[test]
    fn test_become_candidate() {
        let mut state = RaftState::new();
        state.become_candidate(&addr("a:1"));

        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(addr("a:1")));
        assert_eq!(state.votes_received, 1);
        assert_eq!(state.leader, None);
    }

    #[test]
    fn test_become_leader() {
        let mut state = RaftState::new();
        state.become_candidate(&addr("a:1"));
        let peers = [addr("b:2"), addr("c:3")];
        state.become_leader(&addr("a:1"), &peers);

        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.leader, Some(addr("a:1")));
        assert_eq!(state.next_index.get(&addr("b:2")), Some(&1));
        assert_eq!(state.match_index.get(&addr("c:3")), Some(&0));
    }

    #[test]
    fn test_become_follower_clears_vote_on_new_term() {
        let mut state = RaftState::new();
        state.become_candidate(&addr("a:1"));
        state.become_follower(5);

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for, None);

        state.voted_for = Some(addr("b:2"));
        state.become_follower(5);
        assert_eq!(state.voted_for, Some(addr("b:2")));
    }

    #[test]
    fn test_append_and_get_entry() {
        let mut state = RaftState::new();
        state.current_term = 1;
        assert_eq!(state.append_entry(Command::Noop), 1);
        state.current_term = 2;
        assert_eq!(
            state.append_entry(Command::MaxVolumeId { volume_id: 3 }),
            2
        );

        assert!(state.get_entry(0).is_none());
        assert_eq!(state.get_entry(1).unwrap().term, 1);
        assert_eq!(state.get_entry(2).unwrap().term, 2);
        assert!(state.get_entry(3).is_none());
        assert_eq!(state.get_entries_from(2).len(), 1);
        assert_eq!(state.get_entries_from(0).len(), 2);
    }

    #[test]
    fn merge_cuts_at_first_conflict() {
        let mut state = RaftState::new();
        state.current_term = 1;
        state.append_entry(Command::Noop);
        state.append_entry(Command::Noop);
        state.append_entry(Command::Noop);

        let changed = state.merge_entries(vec![
            LogEntry {
                term: 1,
                index: 2,
                command: Command::Noop,
            },
            LogEntry {
                term: 2,
                index: 3,
                command: Command::Noop,
            },
        ]);

        assert!(changed);
        assert_eq!(state.log.len(), 3);
        assert_eq!(state.log[1].term, 1);
        assert_eq!(state.log[2].term, 2);
    }

    #[test]
    fn merge_of_held_prefix_keeps_tail() {
        let mut state = RaftState::new();
        state.current_term = 1;
        for _ in 0..3 {
            state.append_entry(Command::Noop);
        }

        let changed = state.merge_entries(vec![LogEntry {
            term: 1,
            index: 1,
            command: Command::Noop,
        }]);

        assert!(!changed);
        assert_eq!(state.log.len(), 3);
    }

    #[test]
    fn test_is_log_up_to_date() {
        let mut state = RaftState::new();
        assert!(state.is_log_up_to_date(0, 0));

        state.current_term = 1;
        state.append_entry(Command::Noop);
        state.current_term = 2;
        state.append_entry(Command::Noop);

        assert!(state.is_log_up_to_date(1, 3));
        assert!(state.is_log_up_to_date(2, 2));
        assert!(!state.is_log_up_to_date(5, 1));
        assert!(!state.is_log_up_to_date(1, 2));
    }

    #[test]
    fn single_node_leader_commits_its_own_entries() {
        let mut state = RaftState::new();
        let me = addr("a:1");
        state.become_candidate(&me);
        state.become_leader(&me, std::iter::empty::<&NodeAddress>());
        state.append_entry(Command::Noop);

        assert!(state.advance_commit_index(1));
        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn commit_needs_majority_of_cluster() {
        let mut state = RaftState::new();
        let me = addr("a:1");
        let peers = [addr("b:2"), addr("c:3")];
        state.become_candidate(&me);
        state.become_leader(&me, &peers);
        state.append_entry(Command::Noop);

        assert!(!state.advance_commit_index(3));

        state.match_index.insert(addr("b:2"), 1);
        assert!(state.advance_commit_index(3));
        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn late_reply_does_not_lower_match_index() {
        let mut state = RaftState::new();
        let me = addr("a:1");
        let peer = addr("b:2");
        state.become_candidate(&me);
        state.become_leader(&me, [&peer]);

        state.record_match(&peer, 4);
        state.record_match(&peer, 2);

        assert_eq!(state.match_index.get(&peer), Some(&4));
        assert_eq!(state.next_index.get(&peer), Some(&5));
    }

    #[test]
    fn entries_from_older_terms_are_not_committed_directly() {
        let mut state = RaftState::new();
        state.current_term = 1;
        state.append_entry(Command::Noop);
        state.current_term = 2;
        state.role = RaftRole::Leader;
        state.match_index.insert(addr("b:2"), 1);

        assert!(!state.advance_commit_index(3));
        assert_eq!(state.commit_index, 0);
    }

    #[test]
    fn hard_state_round_trips_through_state() {
        let mut state = RaftState::new();
        state.become_candidate(&addr("a:1"));
        state.append_entry(Command::MaxVolumeId { volume_id: 9 });

        let restored = RaftState::from_hard_state(state.hard_state());
        assert_eq!(restored.current_term, 1);
        assert_eq!(restored.voted_for, Some(addr("a:1")));
        assert_eq!(restored.log, state.log);
        assert_eq!(restored.role, RaftRole::Follower);
        assert_eq!(restored.commit_index, 0);
    }
}
