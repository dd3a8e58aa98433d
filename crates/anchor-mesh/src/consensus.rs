//! Consensus scaffold.
//!
//! Leader/follower/candidate roles with randomized election timeouts,
//! term monotonicity, and single-vote-per-term. Log replication is
//! intentionally absent: nothing in the data plane depends on this
//! module, and it can be completed behind [`MeshConsensus`] without
//! breaking callers.

use parking_lot::Mutex;
use rand::Rng;
use std::ops::Range;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug)]
struct ConsensusState {
    role: NodeRole,
    term: u64,
    voted_for: Option<String>,
    leader: Option<String>,
}

pub struct MeshConsensus {
    node_id: String,
    state: Mutex<ConsensusState>,
    election_timeout: Range<Duration>,
}

impl MeshConsensus {
    pub fn new(node_id: impl Into<String>, election_timeout: Range<Duration>) -> MeshConsensus {
        MeshConsensus {
            node_id: node_id.into(),
            state: Mutex::new(ConsensusState {
                role: NodeRole::Follower,
                term: 0,
                voted_for: None,
                leader: None,
            }),
            election_timeout,
        }
    }

    pub fn role(&self) -> NodeRole {
        self.state.lock().role
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn leader(&self) -> Option<String> {
        self.state.lock().leader.clone()
    }

    /// Randomized timeout within the configured window; re-rolled per
    /// election so candidates do not collide forever.
    pub fn next_election_timeout(&self) -> Duration {
        let min = self.election_timeout.start.as_millis() as u64;
        let max = (self.election_timeout.end.as_millis() as u64).max(min + 1);
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }

    /// Begin an election: bump the term, vote for self, become candidate.
    pub fn start_election(&self) -> u64 {
        let mut state = self.state.lock();
        state.term += 1;
        state.role = NodeRole::Candidate;
        state.voted_for = Some(self.node_id.clone());
        state.leader = None;
        state.term
    }

    /// A vote request from a peer. Granted at most once per term; a
    /// higher term always demotes to follower first.
    pub fn handle_vote_request(&self, candidate: &str, term: u64) -> bool {
        let mut state = self.state.lock();
        if term < state.term {
            return false;
        }
        if term > state.term {
            state.term = term;
            state.role = NodeRole::Follower;
            state.voted_for = None;
        }
        match &state.voted_for {
            Some(existing) => existing == candidate,
            None => {
                state.voted_for = Some(candidate.to_string());
                true
            }
        }
    }

    /// Observe a term from any peer message. Terms never move backwards.
    pub fn observe_term(&self, term: u64, leader: Option<&str>) {
        let mut state = self.state.lock();
        if term > state.term {
            state.term = term;
            state.role = NodeRole::Follower;
            state.voted_for = None;
            state.leader = leader.map(str::to_string);
        } else if term == state.term {
            if let Some(leader) = leader {
                state.leader = Some(leader.to_string());
                if state.role == NodeRole::Candidate {
                    state.role = NodeRole::Follower;
                }
            }
        }
    }

    /// Enough votes arrived; become leader of the current term.
    pub fn become_leader(&self) {
        let mut state = self.state.lock();
        if state.role == NodeRole::Candidate {
            state.role = NodeRole::Leader;
            state.leader = Some(self.node_id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consensus(node: &str) -> MeshConsensus {
        MeshConsensus::new(
            node,
            Duration::from_millis(150)..Duration::from_millis(300),
        )
    }

    #[test]
    fn election_timeouts_stay_in_the_window() {
        let c = consensus("node_a");
        for _ in 0..50 {
            let timeout = c.next_election_timeout();
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout < Duration::from_millis(300));
        }
    }

    #[test]
    fn terms_are_monotonic() {
        let c = consensus("node_a");
        assert_eq!(c.start_election(), 1);
        c.observe_term(5, Some("node_b"));
        assert_eq!(c.term(), 5);
        // Stale term is ignored.
        c.observe_term(3, Some("node_c"));
        assert_eq!(c.term(), 5);
        assert_eq!(c.leader().as_deref(), Some("node_b"));
    }

    #[test]
    fn one_vote_per_term() {
        let c = consensus("node_a");
        assert!(c.handle_vote_request("node_b", 1));
        assert!(!c.handle_vote_request("node_c", 1));
        // Re-request from the granted candidate is idempotent.
        assert!(c.handle_vote_request("node_b", 1));
        // New term, new vote.
        assert!(c.handle_vote_request("node_c", 2));
    }

    #[test]
    fn candidates_step_down_on_current_term_leader() {
        let c = consensus("node_a");
        c.start_election();
        assert_eq!(c.role(), NodeRole::Candidate);
        let term = c.term();
        c.observe_term(term, Some("node_b"));
        assert_eq!(c.role(), NodeRole::Follower);
    }

    #[test]
    fn winning_an_election_promotes_to_leader() {
        let c = consensus("node_a");
        c.start_election();
        c.become_leader();
        assert_eq!(c.role(), NodeRole::Leader);
        assert_eq!(c.leader().as_deref(), Some("node_a"));
    }
}
