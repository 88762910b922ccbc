use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::protos::*;

/// Where a node stands in the membership lifecycle, orthogonal to its leadership role
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MembershipPhase {
	/// Present in the configurations this node knows about
	Active,

	/// A reconfiguration entry omitting this node has been appended locally but its
	/// removal has not been finalized; reverted if that entry is truncated
	PendingRetirement,

	/// A RetiredCommitted entry naming this node has committed; the node no longer
	/// participates in elections or append processing, but keeps serving reads
	RetiredCommitted,

	/// Local shutdown after retirement; terminal
	Removed,
}

/// Replication progress the leader tracks for one peer
#[derive(Debug, Clone)]
pub struct ServerProgress {
	/// Index of the next entry to send to this peer
	pub next_index: LogIndex,

	/// Highest index known to be durably replicated on this peer
	pub match_index: LogIndex,

	/// Last index covered by the request currently in flight (0 if none was ever sent)
	pub sent_index: LogIndex,

	/// Commit index carried by the most recent request to this peer
	pub sent_commit: LogIndex,

	/// Whether a request carrying entries is awaiting a response
	pub inflight: bool,

	pub last_sent: Option<Duration>,

	/// Time of the last response of any kind from this peer
	pub last_ack: Option<Duration>,

	/// Current retry delay for an unacknowledged request; doubles per silent retry up
	/// to the configured cap and resets on any response
	pub backoff: Duration,
}

impl ServerProgress {
	pub fn new(last_log_index: LogIndex, initial_backoff: Duration) -> ServerProgress {
		ServerProgress {
			next_index: last_log_index + 1,
			match_index: 0,
			sent_index: 0,
			sent_commit: 0,
			inflight: false,
			last_sent: None,
			last_ack: None,
			backoff: initial_backoff,
		}
	}
}

pub struct ServerFollowerState {
	pub election_timeout: Duration,

	/// Id of the last leader we have seen a valid request from in the current term
	pub last_leader_id: Option<NodeId>,

	/// Logical time of the last valid contact from the current leader (or of the last
	/// vote we granted); the election deadline is measured from here
	pub last_heartbeat: Duration,
}

pub struct ServerCandidateState {
	/// Logical time at which the current election round began
	pub election_start: Duration,

	pub election_timeout: Duration,

	/// Nodes that granted us their vote this round (not counting ourselves)
	pub votes_received: HashSet<NodeId>,
}

pub struct ServerLeaderState {
	pub servers: HashMap<NodeId, ServerProgress>,
}

pub enum ServerState {
	Follower(ServerFollowerState),
	Candidate(ServerCandidateState),
	Leader(ServerLeaderState),

	/// Retirement has been committed; the node holds its ledger for readers until
	/// shutdown but drives nothing
	Retired,
}

impl ServerState {
	pub fn name(&self) -> &'static str {
		match self {
			ServerState::Follower(_) => "follower",
			ServerState::Candidate(_) => "candidate",
			ServerState::Leader(_) => "leader",
			ServerState::Retired => "retired",
		}
	}
}
