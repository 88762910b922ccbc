use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/*
	NOTE: When two nodes first connect to each other, the channel layer is expected to have
	authenticated the remote end, so the sender id attached to recv_message can be trusted

	Additions over the textbook protocol carried here:
	- AppendEntriesResponse reports the receiver's last log index so the leader can catch
	  up lagging followers without probing one index at a time
	- Votes compare the committable suffix of the log rather than the raw tail, so an
	  uncommittable batch pending under the next signature never decides an election
	- ProposeRequestVote lets an up-to-date follower ask the current leader to step down
	  without inflating the term first
*/

/// Type used to uniquely identify each node in the cluster. Ids are short opaque strings
/// assigned by the operator (or the test harness) and are never reused for new nodes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
	pub fn new<S: Into<String>>(s: S) -> NodeId {
		NodeId(s.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for NodeId {
	fn from(s: &str) -> NodeId {
		NodeId(s.to_owned())
	}
}

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl fmt::Debug for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

pub type Term = u64;

pub type LogIndex = u64;

/// Position of a single entry in the ledger
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
	pub term: Term,
	pub index: LogIndex,
}

/// Persistent information describing the state of the current node
/// Must be durably stored whenever a tick raises the meta flag, before any message
/// produced by that tick is released to the channels
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Metadata {
	/// Latest term seen by this node (starts at 0)
	pub current_term: Term,

	/// The id of the node that we have voted for in the current term
	pub voted_for: Option<NodeId>,

	/// Index of the last entry known to be durable on a strict majority and committed
	/// under the leader-term rule
	/// NOTE: It is safe to lose this; it can always be re-derived from a newer leader
	pub commit_index: LogIndex,
}

impl Default for Metadata {
	fn default() -> Self {
		Metadata {
			current_term: 0,
			voted_for: None,
			commit_index: 0,
		}
	}
}

/// Network location of a node as declared by the reconfiguration entry that added it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeAddr {
	pub hostname: String,
	pub port: u16,
}

/// A complete membership set at a single ledger index
/// The map is ordered so that serializations of the same set are byte-identical
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
	/// Index of the reconfiguration entry that declared this set (0 for a bootstrap
	/// configuration installed below the start of the ledger)
	pub idx: LogIndex,

	/// All nodes in the set, each of which counts towards votes and quorums
	pub nodes: BTreeMap<NodeId, NodeAddr>,
}

impl Configuration {
	pub fn new(idx: LogIndex, nodes: BTreeMap<NodeId, NodeAddr>) -> Configuration {
		Configuration { idx, nodes }
	}

	pub fn contains(&self, id: &NodeId) -> bool {
		self.nodes.contains_key(id)
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	/// Number of nodes required for anything to get done in this set
	/// NOTE: This is always at least one; an empty set can never reach quorum
	pub fn majority(&self) -> usize {
		if self.nodes.is_empty() {
			return usize::MAX;
		}

		(self.nodes.len() / 2) + 1
	}

	pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
		self.nodes.keys()
	}
}

/// Represents the configuration as of a single applied index, for persistence
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConfigurationSnapshot {
	/// Index of the last log entry applied to this configuration
	pub last_applied: LogIndex,

	pub data: Configuration,
}

impl Default for ConfigurationSnapshot {
	fn default() -> Self {
		ConfigurationSnapshot {
			last_applied: 0,
			data: Configuration::new(0, BTreeMap::new()),
		}
	}
}

/// Discriminates what a ledger entry's payload means to the replication engine itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
	/// Opaque state machine data; batched under the next signature for commit purposes
	Raw,

	/// Payload is a marshalled complete membership set taking effect at this index
	Reconfiguration,

	/// Payload is a marshalled list of previously departed nodes whose retirement this
	/// entry finalizes
	RetiredCommitted,

	/// A commit boundary in the audit trail; the only kind produced by the engine itself
	/// (as the term-start entry of a new leader)
	Signature,
}

impl EntryKind {
	pub fn to_u8(self) -> u8 {
		match self {
			EntryKind::Raw => 0,
			EntryKind::Reconfiguration => 1,
			EntryKind::RetiredCommitted => 2,
			EntryKind::Signature => 3,
		}
	}

	pub fn from_u8(v: u8) -> Option<EntryKind> {
		Some(match v {
			0 => EntryKind::Raw,
			1 => EntryKind::Reconfiguration,
			2 => EntryKind::RetiredCommitted,
			3 => EntryKind::Signature,
			_ => return None,
		})
	}
}

/// The format of a single entry in every node's append-only ledger
/// Each entry represents an increment by one of the current log index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
	pub index: LogIndex,
	pub term: Term,

	/// Whether the commit point may rest on this entry (true for signatures)
	pub committable: bool,

	pub kind: EntryKind,

	pub payload: Bytes,
}

impl LogEntry {
	pub fn position(&self) -> LogPosition {
		LogPosition {
			term: self.term,
			index: self.index,
		}
	}
}

/// An entry as submitted through the driver api, before an index and term are assigned
#[derive(Debug, Clone)]
pub struct ReplicatedEntry {
	pub payload: Bytes,
	pub committable: bool,
	pub kind: EntryKind,
}

/// Replicates entries from the leader and doubles as the heartbeat when empty
/// The batch covers exactly the indices in (prev_index, idx]
#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesRequest {
	pub term: Term,
	pub leader_id: NodeId,
	pub prev_index: LogIndex,
	pub prev_term: Term,
	pub leader_commit: LogIndex,

	/// Term of the entry at idx (equals prev_term for a heartbeat)
	pub term_of_idx: Term,

	/// Index of the last entry carried by this request (equals prev_index for a heartbeat)
	pub idx: LogIndex,

	pub entries: Vec<LogEntry>,
}

/// Outcome reported by a follower for a single AppendEntries request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
	Ok,

	/// The follower's entry at prev_index disagrees (or its log is too short); the leader
	/// should rewind next_index to first_index and try again
	Conflict {
		term: Term,
		first_index: LogIndex,
	},
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesResponse {
	pub term: Term,

	/// The very end of the follower's log after processing the request, so that the
	/// leader knows how far this follower still has to be caught up
	pub last_log_index: LogIndex,

	pub result: AppendResult,
}

/// Asks the receiver to vote for the sender in the given term
/// The candidate is identified by the channel sender, so no id travels in the message
#[derive(Debug, Clone, PartialEq)]
pub struct RequestVoteRequest {
	pub term: Term,

	/// Highest committable index in the candidate's ledger
	pub last_committable_index: LogIndex,

	pub term_of_last_committable_index: Term,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestVoteResponse {
	pub term: Term,
	pub vote_granted: bool,
}

/// Sent by a follower that believes it should take over, asking the current leader to
/// voluntarily step down instead of forcing a disruptive higher-term election
#[derive(Debug, Clone, PartialEq)]
pub struct ProposeRequestVote {
	pub term: Term,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
	AppendEntries(AppendEntriesRequest),
	AppendEntriesResponse(AppendEntriesResponse),
	RequestVote(RequestVoteRequest),
	RequestVoteResponse(RequestVoteResponse),
	ProposeRequestVote(ProposeRequestVote),
}

/// An outbound message requested by the consensus module during a tick
/// The host serializes the body once and hands a copy to the channel of every recipient
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
	pub to: Vec<NodeId>,
	pub body: MessageBody,
}
