use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::channel::{Channels, MemoryChannels};
use crate::clock::{Clock, ManualClock};
use crate::consensus::*;
use crate::log::{Ledger, MemoryLedger};
use crate::protos::*;
use crate::state_machine::BufferingStore;
use crate::wire;

/*
	In-process cluster harness. Every node is a real ConsensusModule over a memory
	ledger; the harness plays the host: it routes ticks' messages through per-node
	outbound queues, honors the connect/disconnect topology, advances a manual clock,
	and continuously audits the cluster against the core safety properties.

	Message dispatch is explicit so tests can interleave deliveries, drops and
	partitions deterministically.
*/

pub struct SimNode {
	pub module: ConsensusModule,
	pub ledger: Arc<MemoryLedger>,
	pub store: Arc<BufferingStore>,
	pub outbound: Arc<MemoryChannels>,

	/// Set by the harness when the node fails a safety audit or dies on an invariant
	/// breach; a halted node no longer processes anything
	pub halted: bool,
}

pub struct ClusterSim {
	settings: Settings,
	nodes: BTreeMap<NodeId, SimNode>,
	connections: HashSet<(NodeId, NodeId)>,
	clock: ManualClock,

	/// Which node was observed leading each term; second distinct leader in the same
	/// term is an election-safety violation
	leaders_seen: HashMap<Term, NodeId>,

	/// Every entry ever observed at a committed index on any node, along with the
	/// earliest term in which its commit was observed
	committed: BTreeMap<LogIndex, CommittedRecord>,

	/// Highest (term, commit_index) previously observed per node, for monotonicity
	last_observed: HashMap<NodeId, (Term, LogIndex)>,

	/// Safety violations noticed while observing node states after each step
	violations: Vec<String>,
}

struct CommittedRecord {
	term: Term,
	payload: Bytes,

	/// Earliest term some node was in when it reported this entry committed. Leaders
	/// of later terms must hold the entry; a stale leader of an earlier term need not.
	committed_in: Term,
}

impl ClusterSim {
	pub fn new(settings: Settings) -> ClusterSim {
		ClusterSim {
			settings,
			nodes: BTreeMap::new(),
			connections: HashSet::new(),
			clock: ManualClock::new(),
			leaders_seen: HashMap::new(),
			committed: BTreeMap::new(),
			last_observed: HashMap::new(),
			violations: Vec::new(),
		}
	}

	/// Short timeouts so tests converge in a handful of ticks
	pub fn default_settings() -> Settings {
		Settings {
			election_timeout: Duration::from_millis(100),
			heartbeat_interval: Duration::from_millis(10),
			batch_size: 32,
			backoff_initial: Duration::from_millis(10),
			backoff_cap: Duration::from_millis(500),
		}
	}

	pub fn config_for(ids: &[&str]) -> BTreeMap<NodeId, NodeAddr> {
		ids.iter()
			.enumerate()
			.map(|(i, id)| {
				(
					NodeId::from(*id),
					NodeAddr {
						hostname: "localhost".into(),
						port: 4100 + i as u16,
					},
				)
			})
			.collect()
	}

	/// Adds a node with no configuration; it waits to be adopted by a leader
	pub fn add_node(&mut self, id: &str) {
		let node_id = NodeId::from(id);
		assert!(
			!self.nodes.contains_key(&node_id),
			"node {} already exists",
			id
		);

		let ledger = Arc::new(MemoryLedger::new());
		let store = Arc::new(BufferingStore::new());

		let module = ConsensusModule::new(
			node_id.clone(),
			Metadata::default(),
			ConfigurationSnapshot::default(),
			ledger.clone(),
			store.clone(),
			self.settings.clone(),
			0,
		)
		.unwrap();

		info!(node = %node_id, "node created");
		self.nodes.insert(
			node_id,
			SimNode {
				module,
				ledger,
				store,
				outbound: Arc::new(MemoryChannels::new()),
				halted: false,
			},
		);
	}

	/// Adds the given nodes and installs the full set as the bootstrap configuration
	/// on each of them, below the start of the ledger
	pub fn create_nodes(&mut self, ids: &[&str]) {
		let config = Self::config_for(ids);
		for id in ids {
			self.add_node(id);
			let node = self.nodes.get_mut(&NodeId::from(*id)).unwrap();
			node.module.add_configuration(0, config.clone()).unwrap();
		}
	}

	pub fn node(&self, id: &str) -> &SimNode {
		&self.nodes[&NodeId::from(id)]
	}

	/// Direct mutable access for tests that drive a module outside the usual flow.
	/// Remember to route any produced tick yourself if messages matter.
	pub fn node_mut(&mut self, id: &str) -> &mut SimNode {
		self.nodes.get_mut(&NodeId::from(id)).unwrap()
	}

	pub fn node_ids(&self) -> Vec<NodeId> {
		self.nodes.keys().cloned().collect()
	}

	pub fn halt_node(&mut self, id: &str) {
		self.nodes.get_mut(&NodeId::from(id)).unwrap().halted = true;
	}

	// ---- topology ----

	pub fn connect(&mut self, a: &str, b: &str) {
		let (a, b) = (NodeId::from(a), NodeId::from(b));
		self.connections.insert((a.clone(), b.clone()));
		self.connections.insert((b, a));
	}

	pub fn connect_all(&mut self) {
		let ids = self.node_ids();
		for a in ids.iter() {
			for b in ids.iter() {
				if a != b {
					self.connections.insert((a.clone(), b.clone()));
				}
			}
		}
	}

	pub fn disconnect(&mut self, a: &str, b: &str) {
		let (a, b) = (NodeId::from(a), NodeId::from(b));
		self.connections.remove(&(a.clone(), b.clone()));
		self.connections.remove(&(b, a));
	}

	pub fn disconnect_node(&mut self, id: &str) {
		let ids = self.node_ids();
		for other in ids {
			if other.as_str() != id {
				self.disconnect(id, other.as_str());
			}
		}
	}

	pub fn reconnect_node(&mut self, id: &str) {
		let ids = self.node_ids();
		for other in ids {
			if other.as_str() != id {
				self.connect(id, other.as_str());
			}
		}
	}

	fn connected(&self, a: &NodeId, b: &NodeId) -> bool {
		self.connections.contains(&(a.clone(), b.clone()))
	}

	// ---- driving ----

	/// Routes a finished tick's messages into the node's outbound queue
	fn finish_tick(&mut self, id: &NodeId, tick: Tick) {
		{
			let node = self.nodes.get_mut(id).unwrap();
			for msg in tick.messages {
				let data = wire::encode_message(&msg.body);
				for to in msg.to {
					// In-process send cannot fail
					node.outbound.send(&to, data.clone()).unwrap();
				}
			}
		}

		self.observe(id);
	}

	pub fn periodic(&mut self, id: &str, elapsed: Duration) {
		let node_id = NodeId::from(id);

		let tick = {
			let node = self.nodes.get_mut(&node_id).unwrap();
			if node.halted {
				return;
			}

			let mut tick = node.module.new_tick();
			node.module.periodic(elapsed, &mut tick);
			tick
		};

		self.finish_tick(&node_id, tick);
	}

	pub fn periodic_all(&mut self, elapsed: Duration) {
		self.clock.advance(elapsed);
		let ids = self.node_ids();
		for id in ids {
			self.periodic(id.as_str(), elapsed);
		}
	}

	/// Delivers up to max queued messages from the given node, honoring the topology.
	/// Returns how many were actually delivered.
	pub fn dispatch_one(&mut self, id: &str, max: Option<usize>) -> usize {
		let from = NodeId::from(id);
		let mut count = 0;

		loop {
			if let Some(cap) = max {
				if count >= cap {
					break;
				}
			}

			let (to, data) = {
				let node = self.nodes.get_mut(&from).unwrap();
				match node.outbound.pop() {
					Some(m) => m,
					None => break,
				}
			};

			if self.deliver(&from, &to, data) {
				count += 1;
			}
		}

		count
	}

	/// Delivers all messages currently queued anywhere, but none of the messages
	/// produced in response to them. Counting first keeps one call from running the
	/// cluster to quiescence on its own.
	pub fn dispatch_all_once(&mut self) {
		let counts: Vec<(NodeId, usize)> = self
			.nodes
			.iter()
			.map(|(id, n)| (id.clone(), n.outbound.len()))
			.collect();

		for (id, count) in counts {
			self.dispatch_one(id.as_str(), Some(count));
		}
	}

	/// Keeps delivering until the cluster goes quiet (bounded)
	pub fn dispatch_all(&mut self) {
		let mut iterations = 0;
		while self.nodes.values().map(|n| n.outbound.len()).sum::<usize>() > 0 && iterations < 10 {
			self.dispatch_all_once();
			iterations += 1;
		}
	}

	/// Delivers one message from src addressed to dst, if any is queued
	pub fn dispatch_single(&mut self, src: &str, dst: &str) -> bool {
		let from = NodeId::from(src);
		let to = NodeId::from(dst);

		let mut requeue = Vec::new();
		let mut hit = None;

		{
			let node = self.nodes.get_mut(&from).unwrap();
			while let Some((t, data)) = node.outbound.pop() {
				if hit.is_none() && t == to {
					hit = Some(data);
				} else {
					requeue.push((t, data));
				}
			}
			for (t, data) in requeue {
				node.outbound.send(&t, data).unwrap();
			}
		}

		match hit {
			Some(data) => self.deliver(&from, &to, data),
			None => false,
		}
	}

	/// Drops everything the node has queued
	pub fn drop_pending(&mut self, id: &str) -> usize {
		let node = self.nodes.get_mut(&NodeId::from(id)).unwrap();
		node.outbound.drain().len()
	}

	/// Injects an arbitrary (possibly forged) message, bypassing the queues
	pub fn inject(&mut self, from: &str, to: &str, body: MessageBody) {
		let data = wire::encode_message(&body);
		self.deliver(&NodeId::from(from), &NodeId::from(to), data);
	}

	fn deliver(&mut self, from: &NodeId, to: &NodeId, data: Vec<u8>) -> bool {
		if !self.connected(from, to) || !self.nodes.contains_key(to) {
			// The link is down. If this was a replication request, tell the sender so
			// it can schedule a retry instead of waiting forever.
			if data.first() == Some(&wire::TAG_APPEND_ENTRIES) {
				if let Some(sender) = self.nodes.get_mut(from) {
					let mut tick = sender.module.new_tick();
					sender.module.append_entries_noresponse(to, &mut tick);
				}
			}

			debug!(from = %from, to = %to, "dropped (disconnected)");
			return false;
		}

		let outcome = {
			let node = self.nodes.get_mut(to).unwrap();
			if node.halted {
				return false;
			}

			let mut tick = node.module.new_tick();
			match node.module.recv_message(from, &data, &mut tick) {
				Ok(()) => Ok(tick),
				Err(e) => {
					// Fatal invariant breach inside the module
					node.halted = true;
					Err(e)
				}
			}
		};

		match outcome {
			Ok(tick) => {
				self.finish_tick(to, tick);
				true
			}
			Err(e) => {
				self.violations.push(format!("node {} halted: {}", to, e));
				false
			}
		}
	}

	// ---- cluster operations ----

	pub fn primaries(&self) -> Vec<(Term, NodeId)> {
		self.nodes
			.iter()
			.filter(|(_, n)| n.module.is_leader())
			.map(|(id, n)| (n.module.current_term(), id.clone()))
			.collect()
	}

	pub fn find_primary_in_term(&self, term: Term) -> Option<NodeId> {
		self.primaries()
			.into_iter()
			.find(|(t, _)| *t == term)
			.map(|(_, id)| id)
	}

	pub fn force_primary(&mut self, id: &str) {
		let node_id = NodeId::from(id);
		let tick = {
			let node = self.nodes.get_mut(&node_id).unwrap();
			let mut tick = node.module.new_tick();
			node.module.force_become_primary(&mut tick);
			tick
		};
		self.finish_tick(&node_id, tick);
	}

	fn replicate_on_primary(
		&mut self,
		term: Term,
		f: impl FnOnce(&mut ConsensusModule, &mut Tick) -> ReplicateResult,
	) -> Option<Proposal> {
		let primary = self.find_primary_in_term(term)?;

		let (result, tick) = {
			let node = self.nodes.get_mut(&primary).unwrap();
			let mut tick = node.module.new_tick();
			let result = f(&mut node.module, &mut tick);
			(result, tick)
		};

		self.finish_tick(&primary, tick);
		result.ok()
	}

	/// Replicates an opaque payload at the primary of the given term
	pub fn replicate(&mut self, term: Term, payload: &[u8], committable: bool) -> Option<Proposal> {
		let payload = Bytes::copy_from_slice(payload);
		self.replicate_on_primary(term, move |m, tick| {
			m.replicate_data(term, payload, committable, tick)
		})
	}

	pub fn emit_signature(&mut self, term: Term) -> Option<Proposal> {
		self.replicate_on_primary(term, move |m, tick| m.emit_signature(term, tick))
	}

	pub fn replicate_reconfiguration(&mut self, term: Term, ids: &[&str]) -> Option<Proposal> {
		let nodes = Self::config_for(ids);
		self.replicate_on_primary(term, move |m, tick| {
			m.replicate_reconfiguration(term, nodes, true, tick)
		})
	}

	pub fn replicate_retired_committed(&mut self, term: Term, ids: &[&str]) -> Option<Proposal> {
		let nodes: Vec<NodeId> = ids.iter().map(|s| NodeId::from(*s)).collect();
		self.replicate_on_primary(term, move |m, tick| {
			m.replicate_retired_committed(term, nodes, true, tick)
		})
	}

	/// The node asks whoever it believes is the leader to step down in its favor.
	/// Returns whether a proposal was actually sent.
	pub fn propose_request_vote(&mut self, id: &str) -> bool {
		let node_id = NodeId::from(id);
		let (sent, tick) = {
			let node = self.nodes.get_mut(&node_id).unwrap();
			let mut tick = node.module.new_tick();
			let sent = node.module.propose_request_vote(&mut tick);
			(sent, tick)
		};
		self.finish_tick(&node_id, tick);
		sent
	}

	/// Ticks and dispatches a few rounds so in-flight work settles
	pub fn settle(&mut self, rounds: usize) {
		for _ in 0..rounds {
			self.periodic_all(self.settings.heartbeat_interval);
			self.dispatch_all();
		}
	}

	// ---- safety auditing ----

	/// Notes the node's externally visible state, recording anything that violates
	/// election safety, monotonicity, or committed-entry stability
	fn observe(&mut self, id: &NodeId) {
		let (term, commit, is_leader, prefix) = {
			let node = &self.nodes[id];
			let commit = node.module.commit_index();
			(
				node.module.current_term(),
				commit,
				node.module.is_leader(),
				node.ledger.range(1, commit),
			)
		};

		if is_leader {
			match self.leaders_seen.get(&term) {
				Some(existing) if existing != id => {
					self.violations.push(format!(
						"two leaders in term {}: {} and {}",
						term, existing, id
					));
				}
				_ => {
					self.leaders_seen.insert(term, id.clone());
				}
			}
		}

		if let Some((prev_term, prev_commit)) = self.last_observed.get(id) {
			if term < *prev_term {
				self.violations
					.push(format!("node {} term regressed {} -> {}", id, prev_term, term));
			}
			if commit < *prev_commit {
				self.violations.push(format!(
					"node {} commit regressed {} -> {}",
					id, prev_commit, commit
				));
			}
		}
		self.last_observed.insert(id.clone(), (term, commit));

		// Committed entries are forever: remember each and complain if any node later
		// disagrees about one
		if (prefix.len() as u64) < commit {
			self.violations
				.push(format!("node {} committed {} entries it does not hold", id, commit));
		}

		for entry in prefix {
			match self.committed.get_mut(&entry.index) {
				Some(rec) => {
					if rec.term != entry.term || rec.payload != entry.payload {
						self.violations.push(format!(
							"node {} rewrote committed entry {} ({}.{})",
							id, entry.index, entry.term, entry.index
						));
					}
					rec.committed_in = std::cmp::min(rec.committed_in, term);
				}
				None => {
					self.committed.insert(
						entry.index,
						CommittedRecord {
							term: entry.term,
							payload: entry.payload.clone(),
							committed_in: term,
						},
					);
				}
			}
		}
	}

	fn audited_nodes(&self) -> impl Iterator<Item = (&NodeId, &SimNode)> {
		self.nodes.iter().filter(|(_, n)| !n.halted)
	}

	/// Log matching: identical (term, index) implies identical prefix
	pub fn check_log_matching(&self) -> std::result::Result<(), String> {
		let nodes: Vec<(&NodeId, &SimNode)> = self.audited_nodes().collect();

		for (ai, (a_id, a)) in nodes.iter().enumerate() {
			for (b_id, b) in nodes.iter().skip(ai + 1) {
				let upper = std::cmp::min(a.ledger.last_index(), b.ledger.last_index());

				let mut matched = 0;
				for i in (1..=upper).rev() {
					if a.ledger.term_at(i) == b.ledger.term_at(i) {
						matched = i;
						break;
					}
				}

				for i in 1..=matched {
					if a.ledger.entry(i) != b.ledger.entry(i) {
						return Err(format!(
							"log matching violated between {} and {} at index {} (matched through {})",
							a_id, b_id, i, matched
						));
					}
				}
			}
		}

		Ok(())
	}

	/// Leader completeness: every current leader's ledger contains every entry committed in a term at
	/// or below its own. A stale leader of an earlier term is exempt from entries
	/// committed after it was cut off.
	pub fn check_leader_completeness(&self) -> std::result::Result<(), String> {
		for (id, node) in self.audited_nodes() {
			if !node.module.is_leader() {
				continue;
			}

			let leader_term = node.module.current_term();

			for (i, rec) in self.committed.iter() {
				if rec.committed_in > leader_term {
					continue;
				}

				match node.ledger.entry(*i) {
					Some(e) if e.term == rec.term && e.payload == rec.payload => {}
					_ => {
						return Err(format!(
							"leader {} is missing committed entry {}.{}",
							id, rec.term, i
						));
					}
				}
			}
		}

		Ok(())
	}

	/// State machine safety: no two state machines applied different entries at the same index
	pub fn check_applied_safety(&self) -> std::result::Result<(), String> {
		let mut seen: BTreeMap<LogIndex, (Term, Bytes)> = BTreeMap::new();

		for (id, node) in self.audited_nodes() {
			let mut prev = 0;
			for e in node.store.applied() {
				if e.index != prev + 1 {
					return Err(format!(
						"node {} applied index {} after {}",
						id, e.index, prev
					));
				}
				prev = e.index;

				match seen.get(&e.index) {
					Some((t, p)) => {
						if *t != e.term || *p != e.payload {
							return Err(format!(
								"applied divergence at index {} on node {}",
								e.index, id
							));
						}
					}
					None => {
						seen.insert(e.index, (e.term, e.payload.clone()));
					}
				}
			}
		}

		Ok(())
	}

	/// Election safety and monotonicity: violations spotted while observing states
	/// after every step
	pub fn check_observed(&self) -> std::result::Result<(), String> {
		if self.violations.is_empty() {
			Ok(())
		} else {
			Err(self.violations.join("; "))
		}
	}

	/// Quorum commit: the committed prefix of the node is identically present on a strict
	/// majority of its active configuration
	pub fn check_commit_safety(&self, id: &str) -> std::result::Result<(), String> {
		let node = self.node(id);
		let commit = node.module.commit_index();
		if commit == 0 {
			return Ok(());
		}

		let prefix = node.ledger.range(1, commit);
		if prefix.len() as u64 != commit {
			return Err(format!("node {} commit {} exceeds its own ledger", id, commit));
		}

		let config = node.module.config_snapshot().data;
		let (members, majority): (Vec<NodeId>, usize) = if config.is_empty() {
			(self.node_ids(), self.nodes.len() / 2 + 1)
		} else {
			(config.iter().cloned().collect(), config.majority())
		};

		let mut present = 0;
		for member in members {
			if let Some(other) = self.nodes.get(&member) {
				if other.ledger.range(1, commit) == prefix {
					present += 1;
				}
			}
		}

		if present < majority {
			return Err(format!(
				"node {} committed {} but only {} of a needed {} nodes hold that prefix",
				id, commit, present, majority
			));
		}

		Ok(())
	}

	/// Runs every safety audit across the cluster
	pub fn check_all(&self) -> std::result::Result<(), String> {
		self.check_observed()?;
		self.check_log_matching()?;
		self.check_leader_completeness()?;
		self.check_applied_safety()?;

		for (id, _) in self.audited_nodes() {
			self.check_commit_safety(id.as_str())?;
		}

		Ok(())
	}

	/// Asserts every node agrees on term, ledger contents, and commit point
	pub fn assert_state_sync(&self) -> std::result::Result<(), String> {
		let mut iter = self.audited_nodes();
		let (first_id, first) = match iter.next() {
			Some(v) => v,
			None => return Ok(()),
		};

		let term = first.module.current_term();
		let last = first.ledger.last_index();
		let commit = first.module.commit_index();
		let entries = first.ledger.range(1, last);

		for (id, node) in iter {
			if node.module.current_term() != term {
				return Err(format!(
					"{} at term {}, {} at term {}",
					first_id,
					term,
					id,
					node.module.current_term()
				));
			}
			if node.ledger.last_index() != last || node.ledger.range(1, last) != entries {
				return Err(format!("{} and {} have different ledgers", first_id, id));
			}
			if node.module.commit_index() != commit {
				return Err(format!(
					"{} at commit {}, {} at commit {}",
					first_id,
					commit,
					id,
					node.module.commit_index()
				));
			}
		}

		Ok(())
	}

	pub fn clock_now(&self) -> Duration {
		self.clock.now()
	}
}
