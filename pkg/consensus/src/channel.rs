use std::collections::VecDeque;
use std::sync::Mutex;

use crate::errors::*;
use crate::protos::NodeId;

/// Outbound transport seam. Implementations must preserve send order per destination;
/// the network beyond that may drop or duplicate, which the protocol tolerates.
pub trait Channels: Send + Sync {
	fn send(&self, to: &NodeId, data: Vec<u8>) -> Result<()>;
}

/// In-process channel layer: a single FIFO of (destination, bytes) pairs that the host
/// drains and routes. Used by the harness and the demo binary.
pub struct MemoryChannels {
	queue: Mutex<VecDeque<(NodeId, Vec<u8>)>>,
}

impl MemoryChannels {
	pub fn new() -> MemoryChannels {
		MemoryChannels {
			queue: Mutex::new(VecDeque::new()),
		}
	}

	pub fn len(&self) -> usize {
		self.queue.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Removes and returns the oldest queued message
	pub fn pop(&self) -> Option<(NodeId, Vec<u8>)> {
		self.queue.lock().unwrap().pop_front()
	}

	/// Drops every queued message addressed to the given node, returning how many
	pub fn drop_pending_to(&self, to: &NodeId) -> usize {
		let mut queue = self.queue.lock().unwrap();
		let before = queue.len();
		queue.retain(|(dst, _)| dst != to);
		before - queue.len()
	}

	pub fn drain(&self) -> Vec<(NodeId, Vec<u8>)> {
		self.queue.lock().unwrap().drain(..).collect()
	}
}

impl Default for MemoryChannels {
	fn default() -> Self {
		MemoryChannels::new()
	}
}

impl Channels for MemoryChannels {
	fn send(&self, to: &NodeId, data: Vec<u8>) -> Result<()> {
		self.queue.lock().unwrap().push_back((to.clone(), data));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn preserves_order_per_destination() {
		let ch = MemoryChannels::new();
		ch.send(&NodeId::from("b"), vec![1]).unwrap();
		ch.send(&NodeId::from("c"), vec![2]).unwrap();
		ch.send(&NodeId::from("b"), vec![3]).unwrap();

		let to_b: Vec<_> = ch
			.drain()
			.into_iter()
			.filter(|(dst, _)| dst == &NodeId::from("b"))
			.map(|(_, d)| d)
			.collect();

		assert_eq!(to_b, vec![vec![1], vec![3]]);
	}

	#[test]
	fn drop_pending_to_removes_only_that_destination() {
		let ch = MemoryChannels::new();
		ch.send(&NodeId::from("b"), vec![1]).unwrap();
		ch.send(&NodeId::from("c"), vec![2]).unwrap();

		assert_eq!(ch.drop_pending_to(&NodeId::from("b")), 1);
		assert_eq!(ch.len(), 1);
		assert_eq!(ch.pop().unwrap().0, NodeId::from("c"));
	}
}
