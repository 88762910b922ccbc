use std::sync::Mutex;

use crate::protos::*;

/// Position of a transaction in the replicated history: the term it was created in and
/// the index it occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxId {
	pub term: Term,
	pub index: LogIndex,
}

/*
	The state store is the consensus module's window onto the external key-value store.
	The module is the sole caller during apply; hooks run synchronously inside the
	driver call that advanced the commit point, so the store observes commits in ledger
	order with no gaps.
*/

pub trait StateStore: Send + Sync {
	/// Invoked whenever the node observes a new term, before any apply in that term
	fn initialise_term(&self, term: Term);

	/// Newly committed entries in ledger order; commit_index is the new commit point.
	/// Invoked once per commit advancement batch.
	fn apply(&self, entries: &[LogEntry], commit_index: LogIndex);

	/// The ledger was truncated back to tx_id while entering new_term. A store that
	/// never applied past tx_id may ignore this.
	fn rollback(&self, tx_id: TxId, new_term: Term);

	/// The prefix at or below the index is committed everywhere it matters; snapshots
	/// and applied state up to it may be compacted away.
	fn compact(&self, index: LogIndex);

	/// A reconfiguration entry committed and the given set is now active
	fn configuration_committed(&self, _config: &Configuration) {}

	/// A RetiredCommitted entry at the given index finalized the removal of these nodes
	fn retirement_committed(&self, _index: LogIndex, _nodes: &[NodeId]) {}
}

#[derive(Default)]
struct BufferingInner {
	applied: Vec<LogEntry>,
	commit_points: Vec<LogIndex>,
	rollbacks: Vec<(TxId, Term)>,
	compactions: Vec<LogIndex>,
	initialised_terms: Vec<Term>,
	configurations: Vec<Configuration>,
	retirements: Vec<(LogIndex, Vec<NodeId>)>,
}

/// State store double that records every call for later inspection. The harness gives
/// one to every node so tests can compare what actually reached the state machines.
#[derive(Default)]
pub struct BufferingStore {
	inner: Mutex<BufferingInner>,
}

impl BufferingStore {
	pub fn new() -> BufferingStore {
		BufferingStore::default()
	}

	/// Every entry handed to apply so far, in order
	pub fn applied(&self) -> Vec<LogEntry> {
		self.inner.lock().unwrap().applied.clone()
	}

	pub fn last_applied_index(&self) -> LogIndex {
		self.inner
			.lock()
			.unwrap()
			.applied
			.last()
			.map(|e| e.index)
			.unwrap_or(0)
	}

	/// The commit point reported with each apply batch
	pub fn commit_points(&self) -> Vec<LogIndex> {
		self.inner.lock().unwrap().commit_points.clone()
	}

	pub fn rollbacks(&self) -> Vec<(TxId, Term)> {
		self.inner.lock().unwrap().rollbacks.clone()
	}

	pub fn compactions(&self) -> Vec<LogIndex> {
		self.inner.lock().unwrap().compactions.clone()
	}

	pub fn initialised_terms(&self) -> Vec<Term> {
		self.inner.lock().unwrap().initialised_terms.clone()
	}

	pub fn configurations(&self) -> Vec<Configuration> {
		self.inner.lock().unwrap().configurations.clone()
	}

	pub fn retirements(&self) -> Vec<(LogIndex, Vec<NodeId>)> {
		self.inner.lock().unwrap().retirements.clone()
	}
}

impl StateStore for BufferingStore {
	fn initialise_term(&self, term: Term) {
		self.inner.lock().unwrap().initialised_terms.push(term);
	}

	fn apply(&self, entries: &[LogEntry], commit_index: LogIndex) {
		let mut inner = self.inner.lock().unwrap();
		inner.applied.extend_from_slice(entries);
		inner.commit_points.push(commit_index);
	}

	fn rollback(&self, tx_id: TxId, new_term: Term) {
		self.inner.lock().unwrap().rollbacks.push((tx_id, new_term));
	}

	fn compact(&self, index: LogIndex) {
		self.inner.lock().unwrap().compactions.push(index);
	}

	fn configuration_committed(&self, config: &Configuration) {
		self.inner.lock().unwrap().configurations.push(config.clone());
	}

	fn retirement_committed(&self, index: LogIndex, nodes: &[NodeId]) {
		self.inner
			.lock()
			.unwrap()
			.retirements
			.push((index, nodes.to_vec()));
	}
}
