use std::sync::Mutex;

use crate::errors::*;
use crate::protos::*;

/*
	The ledger is the durable half of the node: an append-only ordered sequence of
	entries addressed by (term, index). Invariants it enforces locally:

	- Indices are contiguous starting at 1 (no gaps)
	- Terms never decrease along the index axis
	- An append is durable before it returns; the consensus module treats the return of
	  append() as the durable-append acknowledgement and never acks replication it has
	  not persisted
	- Truncation removes a suffix only; whether the suffix is allowed to be removed
	  (it must lie strictly above the commit index) is checked by the caller, which
	  knows the commit point

	Reads reflect durable entries only.
*/

pub trait Ledger: Send + Sync {
	/// Appends the entry at last_index + 1. Fails if the entry's index is not
	/// contiguous or its term regresses relative to the entry it extends.
	fn append(&self, entry: LogEntry) -> Result<LogIndex>;

	fn entry(&self, index: LogIndex) -> Option<LogEntry>;

	/// Contiguous entries with lo <= index <= hi, clamped to what exists
	fn range(&self, lo: LogIndex, hi: LogIndex) -> Vec<LogEntry>;

	/// Removes every entry with index >= from. Durable before it returns.
	fn truncate_suffix(&self, from: LogIndex) -> Result<()>;

	/// Index of the first retained entry (1 unless a prefix was compacted away)
	fn first_index(&self) -> LogIndex;

	/// Index of the last entry, or 0 for an empty ledger
	fn last_index(&self) -> LogIndex;

	/// Term of the entry at the given index. term_at(0) is the 0 sentinel standing for
	/// the empty prefix; None means the index is beyond the end or compacted away.
	fn term_at(&self, index: LogIndex) -> Option<Term>;

	fn last(&self) -> LogPosition {
		let index = self.last_index();
		LogPosition {
			term: self.term_at(index).unwrap_or(0),
			index,
		}
	}

	/// Highest index at or below hi whose entry is committable, or 0 if there is none
	/// The commit point is only ever advanced onto such an index.
	fn committable_up_to(&self, hi: LogIndex) -> LogIndex {
		let mut i = std::cmp::min(hi, self.last_index());
		while i >= std::cmp::max(self.first_index(), 1) {
			if let Some(e) = self.entry(i) {
				if e.committable {
					return i;
				}
			}
			i -= 1;
		}

		0
	}

	/// Highest committable index in the whole ledger (what elections compare)
	fn last_committable(&self) -> LogIndex {
		self.committable_up_to(self.last_index())
	}

	/// Lowest index of the contiguous run of entries sharing the term at the given
	/// index. Used to build conflict hints for the leader.
	fn first_index_of_term_at(&self, index: LogIndex) -> LogIndex {
		let term = match self.term_at(index) {
			Some(t) => t,
			None => return index,
		};

		let mut i = index;
		while i > self.first_index() && self.term_at(i - 1) == Some(term) {
			i -= 1;
		}

		i
	}
}

/// Ledger held entirely in memory. This is the implementation behind every node in the
/// in-process harness; production nodes use the file-backed one.
pub struct MemoryLedger {
	entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLedger {
	pub fn new() -> MemoryLedger {
		MemoryLedger {
			entries: Mutex::new(Vec::new()),
		}
	}
}

impl Default for MemoryLedger {
	fn default() -> Self {
		MemoryLedger::new()
	}
}

impl Ledger for MemoryLedger {
	fn append(&self, entry: LogEntry) -> Result<LogIndex> {
		let mut entries = self.entries.lock().unwrap();

		let last_index = entries.len() as LogIndex;
		let last_term = entries.last().map(|e| e.term).unwrap_or(0);

		if entry.index != last_index + 1 {
			bail!(ErrorKind::Malformed(format!(
				"append of index {} onto last index {}",
				entry.index, last_index
			)));
		}

		if entry.term < last_term {
			bail!(ErrorKind::Malformed(format!(
				"append of term {} behind term {}",
				entry.term, last_term
			)));
		}

		let index = entry.index;
		entries.push(entry);
		Ok(index)
	}

	fn entry(&self, index: LogIndex) -> Option<LogEntry> {
		if index == 0 {
			return None;
		}

		let entries = self.entries.lock().unwrap();
		entries.get((index - 1) as usize).cloned()
	}

	fn range(&self, lo: LogIndex, hi: LogIndex) -> Vec<LogEntry> {
		let entries = self.entries.lock().unwrap();

		let lo = std::cmp::max(lo, 1);
		let hi = std::cmp::min(hi, entries.len() as LogIndex);
		if lo > hi {
			return Vec::new();
		}

		entries[(lo - 1) as usize..hi as usize].to_vec()
	}

	fn truncate_suffix(&self, from: LogIndex) -> Result<()> {
		if from == 0 {
			bail!(ErrorKind::Malformed("truncate from index 0".into()));
		}

		let mut entries = self.entries.lock().unwrap();
		entries.truncate((from - 1) as usize);
		Ok(())
	}

	fn first_index(&self) -> LogIndex {
		1
	}

	fn last_index(&self) -> LogIndex {
		self.entries.lock().unwrap().len() as LogIndex
	}

	fn term_at(&self, index: LogIndex) -> Option<Term> {
		if index == 0 {
			return Some(0);
		}

		let entries = self.entries.lock().unwrap();
		entries.get((index - 1) as usize).map(|e| e.term)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;

	fn entry(index: LogIndex, term: Term, committable: bool) -> LogEntry {
		LogEntry {
			index,
			term,
			committable,
			kind: if committable {
				EntryKind::Signature
			} else {
				EntryKind::Raw
			},
			payload: Bytes::from(format!("{}.{}", term, index)),
		}
	}

	#[test]
	fn append_then_get_returns_the_entry() {
		let log = MemoryLedger::new();
		assert_eq!(log.last_index(), 0);
		assert_eq!(log.term_at(0), Some(0));

		log.append(entry(1, 2, false)).unwrap();
		log.append(entry(2, 2, true)).unwrap();

		assert_eq!(log.entry(1).unwrap(), entry(1, 2, false));
		assert_eq!(log.entry(2).unwrap(), entry(2, 2, true));
		assert_eq!(log.entry(3), None);
		assert_eq!(log.last(), LogPosition { term: 2, index: 2 });
	}

	#[test]
	fn append_rejects_gaps_and_term_regression() {
		let log = MemoryLedger::new();
		log.append(entry(1, 3, false)).unwrap();

		assert!(log.append(entry(3, 3, false)).is_err());
		assert!(log.append(entry(2, 2, false)).is_err());

		// Still intact
		assert_eq!(log.last_index(), 1);
	}

	#[test]
	fn truncate_suffix_then_last_is_previous_index() {
		let log = MemoryLedger::new();
		for i in 1..=5 {
			log.append(entry(i, 1, false)).unwrap();
		}

		log.truncate_suffix(3).unwrap();
		assert_eq!(log.last_index(), 2);
		assert_eq!(log.entry(3), None);

		// Truncating beyond the end is a no-op
		log.truncate_suffix(10).unwrap();
		assert_eq!(log.last_index(), 2);
	}

	#[test]
	fn committable_tracking() {
		let log = MemoryLedger::new();
		log.append(entry(1, 1, false)).unwrap();
		log.append(entry(2, 1, true)).unwrap();
		log.append(entry(3, 1, false)).unwrap();
		log.append(entry(4, 1, true)).unwrap();
		log.append(entry(5, 1, false)).unwrap();

		assert_eq!(log.last_committable(), 4);
		assert_eq!(log.committable_up_to(3), 2);
		assert_eq!(log.committable_up_to(1), 0);
	}

	#[test]
	fn first_index_of_term_runs() {
		let log = MemoryLedger::new();
		log.append(entry(1, 1, false)).unwrap();
		log.append(entry(2, 1, false)).unwrap();
		log.append(entry(3, 4, false)).unwrap();
		log.append(entry(4, 4, false)).unwrap();

		assert_eq!(log.first_index_of_term_at(2), 1);
		assert_eq!(log.first_index_of_term_at(4), 3);
		assert_eq!(log.first_index_of_term_at(3), 3);
	}

	#[test]
	fn range_is_clamped() {
		let log = MemoryLedger::new();
		for i in 1..=4 {
			log.append(entry(i, 1, false)).unwrap();
		}

		let r = log.range(2, 3);
		assert_eq!(r.len(), 2);
		assert_eq!(r[0].index, 2);
		assert_eq!(r[1].index, 3);

		assert_eq!(log.range(0, 100).len(), 4);
		assert_eq!(log.range(5, 6).len(), 0);
	}
}
