use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::*;
use crate::protos::*;
use crate::wire;

/*
	Membership evolves through reconfiguration entries carrying a complete target set.
	The set in the newest entry at or below the commit index is the active
	configuration; newer uncommitted sets are pending. Quorum-bearing decisions must
	overlap every tracked set, which is what makes a single-step change safe as long as
	the caller only proposes sets sharing a majority with the previous one.

	A truncation that removes a reconfiguration entry reverts its set; a commit that
	reaches one promotes it.
*/

/// Tracks the configurations currently relevant to quorum decisions on this node
pub struct ConfigurationStateMachine {
	/// The newest configuration whose reconfiguration entry is committed. Empty (and at
	/// idx 0) until a bootstrap configuration is installed or replicated in.
	pub value: Configuration,

	/// Uncommitted configurations in log order, oldest first. The last one is "the"
	/// pending configuration; the rest are retained only so a truncation can revert
	/// cleanly.
	pending: Vec<Configuration>,

	/// Nodes dropped from the active configuration whose retirement has not been
	/// finalized yet. They keep receiving entries (so they can observe their own
	/// retirement commit) but carry no quorum weight.
	retiring: Vec<NodeId>,

	/// Index of the last log entry this state machine has seen
	pub last_applied: LogIndex,
}

impl ConfigurationStateMachine {
	pub fn from(snapshot: ConfigurationSnapshot) -> ConfigurationStateMachine {
		ConfigurationStateMachine {
			value: snapshot.data,
			pending: Vec::new(),
			retiring: Vec::new(),
			last_applied: snapshot.last_applied,
		}
	}

	pub fn new() -> ConfigurationStateMachine {
		Self::from(ConfigurationSnapshot::default())
	}

	/// The latest configuration known, committed or not
	pub fn latest(&self) -> &Configuration {
		self.pending.last().unwrap_or(&self.value)
	}

	pub fn pending(&self) -> Option<&Configuration> {
		self.pending.last()
	}

	pub fn has_pending(&self) -> bool {
		!self.pending.is_empty()
	}

	/// Every non-empty configuration a quorum decision must overlap
	pub fn quorums(&self) -> Vec<&Configuration> {
		std::iter::once(&self.value)
			.chain(self.pending.iter())
			.filter(|c| !c.is_empty())
			.collect()
	}

	/// Whether the id is in the active configuration
	pub fn is_member(&self, id: &NodeId) -> bool {
		self.value.contains(id)
	}

	/// Whether the id is in any tracked configuration (active or pending) or is still
	/// being walked out the door. Messages from such nodes are processed; everyone
	/// else is a stranger.
	pub fn is_known(&self, id: &NodeId) -> bool {
		self.value.contains(id)
			|| self.pending.iter().any(|c| c.contains(id))
			|| self.retiring.contains(id)
	}

	/// All distinct ids across the tracked configurations, plus nodes whose retirement
	/// is not yet finalized
	pub fn known_ids(&self) -> Vec<NodeId> {
		let mut out: Vec<NodeId> = Vec::new();
		for config in std::iter::once(&self.value).chain(self.pending.iter()) {
			for id in config.iter() {
				if !out.contains(id) {
					out.push(id.clone());
				}
			}
		}
		for id in self.retiring.iter() {
			if !out.contains(id) {
				out.push(id.clone());
			}
		}
		out
	}

	/// Observes a single appended entry. For a reconfiguration entry this installs the
	/// carried set as pending; every entry advances last_applied.
	pub fn apply(&mut self, entry: &LogEntry) -> Result<()> {
		if entry.index <= self.last_applied {
			return Ok(());
		}

		if entry.kind == EntryKind::Reconfiguration {
			let nodes: BTreeMap<NodeId, NodeAddr> = wire::unmarshal(&entry.payload)?;
			debug!(idx = entry.index, size = nodes.len(), "pending configuration");
			self.pending.push(Configuration::new(entry.index, nodes));
		}

		self.last_applied = entry.index;
		Ok(())
	}

	/// Promotes every pending configuration at or below the new commit index. Returns
	/// the newly active configuration if any promotion happened. Members dropped by a
	/// promotion move to the retiring list until their removal is finalized.
	pub fn commit(&mut self, commit_index: LogIndex) -> Option<Configuration> {
		let mut promoted = None;

		while let Some(first) = self.pending.first() {
			if first.idx > commit_index {
				break;
			}

			let config = self.pending.remove(0);

			for id in self.value.iter() {
				if !config.contains(id) && !self.retiring.contains(id) {
					self.retiring.push(id.clone());
				}
			}

			self.value = config.clone();
			promoted = Some(config);
		}

		promoted
	}

	/// A RetiredCommitted entry committed; the named nodes are gone for good
	pub fn finalize_retirement(&mut self, nodes: &[NodeId]) {
		self.retiring.retain(|id| !nodes.contains(id));
	}

	/// Undoes the effect of every entry at or above the given index, ahead of a
	/// truncation. Committed configurations are never affected.
	pub fn revert(&mut self, from_index: LogIndex) {
		self.pending.retain(|c| c.idx < from_index);

		if self.last_applied >= from_index {
			self.last_applied = from_index - 1;
		}
	}

	/// The persistable view of the committed configuration
	pub fn snapshot(&self) -> ConfigurationSnapshot {
		ConfigurationSnapshot {
			last_applied: self.value.idx,
			data: self.value.clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;

	fn addr(port: u16) -> NodeAddr {
		NodeAddr {
			hostname: "localhost".into(),
			port,
		}
	}

	fn nodes(ids: &[&str]) -> BTreeMap<NodeId, NodeAddr> {
		ids.iter()
			.enumerate()
			.map(|(i, id)| (NodeId::from(*id), addr(4000 + i as u16)))
			.collect()
	}

	fn reconfig_entry(index: LogIndex, term: Term, ids: &[&str]) -> LogEntry {
		LogEntry {
			index,
			term,
			committable: false,
			kind: EntryKind::Reconfiguration,
			payload: Bytes::from(wire::marshal(&nodes(ids)).unwrap()),
		}
	}

	#[test]
	fn pending_then_commit_promotes() {
		let mut cs = ConfigurationStateMachine::new();
		assert!(cs.quorums().is_empty());

		cs.apply(&reconfig_entry(1, 2, &["a", "b", "c"])).unwrap();
		assert!(cs.has_pending());
		assert!(cs.value.is_empty());
		assert_eq!(cs.quorums().len(), 1);
		assert!(cs.is_known(&NodeId::from("a")));
		assert!(!cs.is_member(&NodeId::from("a")));

		let promoted = cs.commit(1).unwrap();
		assert_eq!(promoted.idx, 1);
		assert!(!cs.has_pending());
		assert!(cs.is_member(&NodeId::from("b")));
	}

	#[test]
	fn quorums_cover_active_and_pending() {
		let mut cs = ConfigurationStateMachine::new();
		cs.apply(&reconfig_entry(1, 2, &["a", "b", "c"])).unwrap();
		cs.commit(1);

		cs.apply(&reconfig_entry(5, 2, &["a", "b", "d"])).unwrap();
		let quorums = cs.quorums();
		assert_eq!(quorums.len(), 2);
		assert!(cs.is_known(&NodeId::from("c")));
		assert!(cs.is_known(&NodeId::from("d")));

		// After the promotion C is out of the quorum but still known, so it can be
		// walked through its retirement
		cs.commit(5);
		assert_eq!(cs.quorums().len(), 1);
		assert!(!cs.is_member(&NodeId::from("c")));
		assert!(cs.is_known(&NodeId::from("c")));

		cs.finalize_retirement(&[NodeId::from("c")]);
		assert!(!cs.is_known(&NodeId::from("c")));
	}

	#[test]
	fn revert_drops_uncommitted_sets() {
		let mut cs = ConfigurationStateMachine::new();
		cs.apply(&reconfig_entry(1, 2, &["a", "b", "c"])).unwrap();
		cs.commit(1);

		cs.apply(&reconfig_entry(3, 2, &["a", "b"])).unwrap();
		assert!(cs.has_pending());

		cs.revert(3);
		assert!(!cs.has_pending());
		assert_eq!(cs.last_applied, 2);
		assert!(cs.is_member(&NodeId::from("c")));
	}

	#[test]
	fn identical_set_is_still_a_new_configuration() {
		let mut cs = ConfigurationStateMachine::new();
		cs.apply(&reconfig_entry(1, 2, &["a", "b", "c"])).unwrap();
		cs.commit(1);

		// Re-declaring the same membership is a no-op in effect but still occupies a
		// committed index and refreshes the configuration's index
		cs.apply(&reconfig_entry(4, 2, &["a", "b", "c"])).unwrap();
		let promoted = cs.commit(4).unwrap();
		assert_eq!(promoted.idx, 4);
		assert_eq!(promoted.nodes, cs.value.nodes);
	}
}
