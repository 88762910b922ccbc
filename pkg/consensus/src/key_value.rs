use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use consensus::protos::*;
use consensus::state_machine::{StateStore, TxId};
use consensus::wire;

/// Operations accepted by the demo key-value state machine, marshalled into raw ledger
/// entry payloads
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum KeyValueOperation {
	Set { key: Vec<u8>, value: Vec<u8> },
	Delete { key: Vec<u8> },
}

/// Minimal in-memory KV store fed exclusively by the commit hook. Because it only ever
/// sees committed entries, a ledger truncation can never cross anything it applied.
pub struct MemoryKVStateMachine {
	data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKVStateMachine {
	pub fn new() -> MemoryKVStateMachine {
		MemoryKVStateMachine {
			data: Mutex::new(HashMap::new()),
		}
	}

	pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
		self.data.lock().unwrap().get(key).cloned()
	}

	pub fn len(&self) -> usize {
		self.data.lock().unwrap().len()
	}
}

impl Default for MemoryKVStateMachine {
	fn default() -> Self {
		MemoryKVStateMachine::new()
	}
}

impl StateStore for MemoryKVStateMachine {
	fn initialise_term(&self, term: Term) {
		debug!(term, "kv: new term");
	}

	fn apply(&self, entries: &[LogEntry], commit_index: LogIndex) {
		let mut data = self.data.lock().unwrap();

		for e in entries {
			if e.kind != EntryKind::Raw || e.payload.is_empty() {
				continue;
			}

			match wire::unmarshal::<KeyValueOperation>(&e.payload) {
				Ok(KeyValueOperation::Set { key, value }) => {
					data.insert(key, value);
				}
				Ok(KeyValueOperation::Delete { key }) => {
					data.remove(&key);
				}
				Err(err) => {
					warn!(idx = e.index, error = %err, "kv: skipping unparseable entry");
				}
			}
		}

		debug!(commit_index, applied = entries.len(), "kv: applied batch");
	}

	fn rollback(&self, tx_id: TxId, new_term: Term) {
		// Only uncommitted suffixes are ever truncated and we apply committed entries
		// only, so there is nothing to undo
		debug!(term = tx_id.term, index = tx_id.index, new_term, "kv: rollback");
	}

	fn compact(&self, index: LogIndex) {
		debug!(index, "kv: compact");
	}
}
