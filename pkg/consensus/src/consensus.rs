use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config_state::*;
use crate::constraint::*;
use crate::errors::*;
use crate::log::Ledger;
use crate::protos::*;
use crate::state::*;
use crate::state_machine::{StateStore, TxId};
use crate::wire;

/*
	The module is a plain value driven by exactly one task. Every driver call takes a
	Tick and records the side effects it wants (messages to send, durability
	obligations, the next timer deadline); the host discharges them after the call
	returns. Metadata marked dirty on a tick must be durable before any message from
	that same tick is released.
*/

/// Tunable timing and batching knobs. The defaults suit a LAN deployment; the harness
/// runs with much shorter timeouts.
#[derive(Debug, Clone)]
pub struct Settings {
	/// Base election timeout T. A follower's deadline is drawn uniformly from [T, 2T).
	pub election_timeout: Duration,

	/// Leader heartbeat interval. Must be well under half the election timeout or
	/// followers will keep starting elections against a healthy leader.
	pub heartbeat_interval: Duration,

	/// Maximum number of entries carried by one AppendEntries
	pub batch_size: u64,

	/// First retry delay for an unacknowledged request
	pub backoff_initial: Duration,

	/// Ceiling for the exponential retry delay
	pub backoff_cap: Duration,
}

impl Default for Settings {
	fn default() -> Self {
		Settings {
			election_timeout: Duration::from_millis(400),
			heartbeat_interval: Duration::from_millis(150),
			batch_size: 32,
			backoff_initial: Duration::from_millis(150),
			backoff_cap: Duration::from_secs(5),
		}
	}
}

// NOTE: This is basically the same type as a LogPosition; the contents are opaque to
// programs driving the module
pub type Proposal = LogPosition;

/// On success, the entries have been accepted and may eventually be committed at the
/// returned position
pub type ReplicateResult = std::result::Result<Proposal, ReplicateError>;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicateError {
	/// The entries can't be accepted by this node because it is not the current leader
	NotLeader { leader_hint: Option<NodeId> },

	/// The caller's term does not match the leader's current term
	TermMismatch { current_term: Term },

	/// The node has no configuration yet, is retired, or cannot process the entry
	/// right now (e.g. a reconfiguration while another one is still pending)
	NotReady,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProposalStatus {
	/// The proposal has been safely replicated and has been applied (or is about to be)
	Committed,

	/// The proposal was abandoned; typically another leader took over before the entry
	/// was fully replicated
	Failed,

	/// The proposal is still pending replication
	Pending,

	/// We don't know anything about this proposal right now. This is what a follower
	/// reports for a proposal made on the leader.
	Missing,

	/// The status is permanently unavailable (the position is from before the start of
	/// the retained ledger)
	Unavailable,
}

/// Represents all external side effects requested by the module during one operation
pub struct Tick {
	/// Logical time at which this tick is happening
	pub time: Duration,

	/// If set, the metadata changed and must be persisted before any message in this
	/// tick is released
	pub meta: bool,

	/// If set, the committed configuration changed and should be persisted
	pub config: bool,

	/// Whether new entries were appended to the ledger
	pub new_entries: bool,

	/// Messages that need to be sent out
	pub messages: Vec<Message>,

	/// If no other event occurs, when the next periodic() call should happen
	pub next_tick: Option<Duration>,
}

impl Tick {
	pub fn empty(time: Duration) -> Self {
		Tick {
			time,
			meta: false,
			config: false,
			new_entries: false,
			messages: vec![],
			next_tick: None,
		}
	}

	pub fn write_meta(&mut self) {
		self.meta = true;
	}

	pub fn write_config(&mut self) {
		self.config = true;
	}

	pub fn send(&mut self, msg: Message) {
		self.messages.push(msg);
	}

	fn wake_in(&mut self, d: Duration) {
		self.next_tick = Some(match self.next_tick {
			Some(cur) => std::cmp::min(cur, d),
			None => d,
		});
	}
}

pub struct ConsensusModule {
	/// Id of the node this module is running
	id: NodeId,

	settings: Settings,

	meta: Metadata,

	/// The configurations currently relevant to quorum decisions
	config: ConfigurationStateMachine,

	/// Reader/appender for the durable ledger. Appends are durable when they return.
	log: Arc<dyn Ledger>,

	/// Commit sink registered at construction; the sole route to the external KV
	store: Arc<dyn StateStore>,

	state: ServerState,

	membership: MembershipPhase,

	/// Index of the last entry handed to the store's apply hook
	last_applied: LogIndex,

	/// On a leader, retirements committed locally whose subjects have not yet been
	/// told about the commit. The subject keeps receiving entries until it
	/// acknowledges a request carrying a commit point at or past its retirement, so
	/// it can observe its own removal before we stop talking to it.
	retirement_acks: Vec<(LogIndex, NodeId)>,

	/// Logical clock, advanced only by periodic()
	now: Duration,

	/// Number of inbound messages dropped because they failed to decode
	decode_failures: u64,

	/// Set on a fatal invariant breach; every driver call is a no-op afterwards
	halted: bool,
}

impl ConsensusModule {
	/// Creates a module from recovered durable state. The ledger and configuration
	/// snapshot must come from the same data directory; last_applied is how far the
	/// external store had applied before the restart.
	pub fn new(
		id: NodeId,
		mut meta: Metadata,
		config_snapshot: ConfigurationSnapshot,
		log: Arc<dyn Ledger>,
		store: Arc<dyn StateStore>,
		settings: Settings,
		last_applied: LogIndex,
	) -> Result<ConsensusModule> {
		// Unless we cast a vote it isn't strictly necessary to persist the metadata, so
		// if the ledger contains newer terms than the metadata we know that no
		// meaningful vote was cast in those terms
		let last_log_term = log.term_at(log.last_index()).unwrap_or(0);
		if last_log_term > meta.current_term {
			meta.current_term = last_log_term;
			meta.voted_for = None;
		}

		// Snapshots only ever contain committed data
		if config_snapshot.last_applied > meta.commit_index {
			meta.commit_index = config_snapshot.last_applied;
		}

		if config_snapshot.last_applied + 1 < log.first_index() {
			bail!(ErrorKind::InvariantBreach(
				"configuration snapshot is from before the start of the ledger".into()
			));
		}

		let mut config = ConfigurationStateMachine::from(config_snapshot);

		// Advance the configuration over any entries it has not yet seen
		let last_log_index = log.last_index();
		for i in (config.last_applied + 1)..(last_log_index + 1) {
			let e = log
				.entry(i)
				.ok_or_else(|| Error::from(ErrorKind::InvariantBreach(format!("missing ledger entry {}", i))))?;
			config.apply(&e)?;
		}
		config.commit(meta.commit_index);

		let settings_clone = settings.clone();
		let mut module = ConsensusModule {
			id,
			settings,
			meta,
			config,
			log,
			store,
			state: Self::new_follower_state(&settings_clone, Duration::from_millis(0)),
			membership: MembershipPhase::Active,
			last_applied,
			retirement_acks: Vec::new(),
			now: Duration::from_millis(0),
			decode_failures: 0,
			halted: false,
		};

		module.refresh_membership();
		module.store.initialise_term(module.meta.current_term);

		// Catch the external store up with anything committed before the restart
		if module.meta.commit_index > module.last_applied {
			module.deliver_committed(module.meta.commit_index);
		}

		Ok(module)
	}

	pub fn id(&self) -> &NodeId {
		&self.id
	}

	pub fn meta(&self) -> &Metadata {
		&self.meta
	}

	pub fn current_term(&self) -> Term {
		self.meta.current_term
	}

	pub fn commit_index(&self) -> LogIndex {
		self.meta.commit_index
	}

	pub fn last_index(&self) -> LogIndex {
		self.log.last_index()
	}

	pub fn is_leader(&self) -> bool {
		matches!(self.state, ServerState::Leader(_))
	}

	pub fn is_follower(&self) -> bool {
		matches!(self.state, ServerState::Follower(_))
	}

	pub fn is_candidate(&self) -> bool {
		matches!(self.state, ServerState::Candidate(_))
	}

	pub fn is_retired(&self) -> bool {
		self.membership >= MembershipPhase::RetiredCommitted
	}

	pub fn is_halted(&self) -> bool {
		self.halted
	}

	pub fn membership(&self) -> MembershipPhase {
		self.membership
	}

	pub fn role_name(&self) -> &'static str {
		self.state.name()
	}

	/// Term of the ledger entry at the given index
	pub fn view_at(&self, index: LogIndex) -> Option<Term> {
		self.log.term_at(index)
	}

	/// Positions of every retained ledger entry, in order
	pub fn history(&self) -> Vec<LogPosition> {
		self.log
			.range(self.log.first_index(), self.log.last_index())
			.iter()
			.map(|e| e.position())
			.collect()
	}

	/// Who this node believes the current leader is, if anyone
	pub fn leader_hint(&self) -> Option<NodeId> {
		match self.state {
			ServerState::Leader(_) => Some(self.id.clone()),
			ServerState::Follower(ref s) => s.last_leader_id.clone().or(self.meta.voted_for.clone()),
			_ => None,
		}
	}

	/// Gets the latest committed configuration currently in memory
	/// NOTE: This says nothing about what snapshot exists on disk right now
	pub fn config_snapshot(&self) -> ConfigurationSnapshot {
		self.config.snapshot()
	}

	pub fn decode_failures(&self) -> u64 {
		self.decode_failures
	}

	pub fn now(&self) -> Duration {
		self.now
	}

	/// Replication progress of one peer as (next_index, match_index), for debugging
	pub fn peer_progress(&self, id: &NodeId) -> Option<(LogIndex, LogIndex)> {
		match self.state {
			ServerState::Leader(ref s) => s
				.servers
				.get(id)
				.map(|p| (p.next_index, p.match_index)),
			_ => None,
		}
	}

	pub fn new_tick(&self) -> Tick {
		Tick::empty(self.now)
	}

	/// Bootstraps the initial configuration. Only valid while the node knows of no
	/// configuration at all; later membership changes go through the ledger.
	pub fn add_configuration(
		&mut self,
		at_index: LogIndex,
		nodes: std::collections::BTreeMap<NodeId, NodeAddr>,
	) -> Result<()> {
		if nodes.is_empty() {
			bail!(ErrorKind::Malformed("empty configuration".into()));
		}

		if !self.config.quorums().is_empty() {
			bail!(ErrorKind::Malformed(
				"node already has a configuration".into()
			));
		}

		self.config = ConfigurationStateMachine::from(ConfigurationSnapshot {
			last_applied: at_index,
			data: Configuration::new(at_index, nodes),
		});
		self.refresh_membership();
		Ok(())
	}

	/// Checks the progress of a previously initiated proposal. Can be queried on any
	/// node, but only the leader that accepted the proposal converges first.
	pub fn proposal_status(&self, prop: &Proposal) -> ProposalStatus {
		let last = self.log.last();

		// In this case the proposal has not made it into our ledger yet
		if prop.term > last.term || prop.index > last.index {
			return ProposalStatus::Missing;
		}

		let cur_term = match self.log.term_at(prop.index) {
			Some(v) => v,

			// The proposal is from before the start of our retained ledger
			None => return ProposalStatus::Unavailable,
		};

		if cur_term > prop.term {
			// It was truncated in favor of an entry in a newer term
			ProposalStatus::Failed
		} else if cur_term < prop.term {
			if self.meta.commit_index >= prop.index {
				ProposalStatus::Failed
			} else {
				ProposalStatus::Missing
			}
		} else {
			if self.meta.commit_index >= prop.index {
				ProposalStatus::Committed
			} else {
				ProposalStatus::Pending
			}
		}
	}

	/// Submits entries for replication. Only accepted on the leader of exactly the
	/// given term; indices are assigned contiguously and the call returns as soon as
	/// the entries are durable in the local ledger, with replication scheduled.
	pub fn replicate(
		&mut self,
		term: Term,
		entries: Vec<ReplicatedEntry>,
		out: &mut Tick,
	) -> ReplicateResult {
		if self.halted || self.is_retired() {
			return Err(ReplicateError::NotReady);
		}

		match self.state {
			ServerState::Leader(_) => {}
			ServerState::Follower(ref s) => {
				return Err(ReplicateError::NotLeader {
					leader_hint: s.last_leader_id.clone().or(self.meta.voted_for.clone()),
				});
			}
			_ => return Err(ReplicateError::NotLeader { leader_hint: None }),
		}

		if term != self.meta.current_term {
			return Err(ReplicateError::TermMismatch {
				current_term: self.meta.current_term,
			});
		}

		// Validate engine-interpreted payloads before anything is appended so a batch
		// is never half-applied
		for e in entries.iter() {
			match e.kind {
				EntryKind::Reconfiguration => {
					if self.config.has_pending() {
						// The previous membership change must commit first
						return Err(ReplicateError::NotReady);
					}

					if wire::unmarshal::<std::collections::BTreeMap<NodeId, NodeAddr>>(&e.payload)
						.map(|m| m.is_empty())
						.unwrap_or(true)
					{
						return Err(ReplicateError::NotReady);
					}
				}
				EntryKind::RetiredCommitted => {
					if wire::unmarshal::<Vec<NodeId>>(&e.payload).is_err() {
						return Err(ReplicateError::NotReady);
					}
				}
				_ => {}
			}
		}

		let mut position = LogPosition {
			term,
			index: self.log.last_index(),
		};

		for e in entries {
			let index = self.log.last_index() + 1;
			let entry = LogEntry {
				index,
				term,
				committable: e.committable,
				kind: e.kind,
				payload: e.payload,
			};

			out.new_entries = true;
			if let Err(err) = self.log.append(entry) {
				error!(error = %err, "ledger append failed");
				self.halt();
				return Err(ReplicateError::NotReady);
			}

			// As soon as a configuration change lands in the log we use it
			let e = self.log.entry(index).unwrap();
			if self.config.apply(&e).is_err() {
				// Unreachable given the validation above
				return Err(ReplicateError::NotReady);
			}
			self.refresh_membership();

			position.index = index;
		}

		// Cycle the state to replicate the new entries to the other nodes
		self.cycle(out);

		Ok(position)
	}

	/// Convenience wrapper replicating one opaque state machine entry
	pub fn replicate_data(
		&mut self,
		term: Term,
		payload: Bytes,
		committable: bool,
		out: &mut Tick,
	) -> ReplicateResult {
		self.replicate(
			term,
			vec![ReplicatedEntry {
				payload,
				committable,
				kind: EntryKind::Raw,
			}],
			out,
		)
	}

	/// Proposes a complete replacement membership set
	pub fn replicate_reconfiguration(
		&mut self,
		term: Term,
		nodes: std::collections::BTreeMap<NodeId, NodeAddr>,
		committable: bool,
		out: &mut Tick,
	) -> ReplicateResult {
		let payload = wire::marshal(&nodes).map_err(|_| ReplicateError::NotReady)?;
		self.replicate(
			term,
			vec![ReplicatedEntry {
				payload: Bytes::from(payload),
				committable,
				kind: EntryKind::Reconfiguration,
			}],
			out,
		)
	}

	/// Finalizes the removal of previously departed nodes
	pub fn replicate_retired_committed(
		&mut self,
		term: Term,
		nodes: Vec<NodeId>,
		committable: bool,
		out: &mut Tick,
	) -> ReplicateResult {
		let payload = wire::marshal(&nodes).map_err(|_| ReplicateError::NotReady)?;
		self.replicate(
			term,
			vec![ReplicatedEntry {
				payload: Bytes::from(payload),
				committable,
				kind: EntryKind::RetiredCommitted,
			}],
			out,
		)
	}

	/// Appends a signature boundary so the commit point can advance over any raw
	/// entries batched since the last one
	pub fn emit_signature(&mut self, term: Term, out: &mut Tick) -> ReplicateResult {
		self.replicate(
			term,
			vec![ReplicatedEntry {
				payload: Bytes::new(),
				committable: true,
				kind: EntryKind::Signature,
			}],
			out,
		)
	}

	/// Advances the logical clock; may trigger heartbeats, an election, or commit
	/// advancement
	pub fn periodic(&mut self, elapsed: Duration, out: &mut Tick) {
		if self.halted {
			return;
		}

		self.now += elapsed;
		out.time = self.now;
		self.cycle(out);
	}

	/// Bootstrap/recovery hook: assume leadership immediately without an election.
	/// Advances the term by two so the new reign is unambiguously newer than anything
	/// a crashed first term could have produced, and deliberately skips the term-start
	/// signature so a bootstrap reconfiguration can occupy index 1.
	pub fn force_become_primary(&mut self, out: &mut Tick) {
		self.meta.current_term += 2;
		self.meta.voted_for = Some(self.id.clone());
		out.write_meta();

		self.store.initialise_term(self.meta.current_term);
		info!(term = self.meta.current_term, "forced to primary");

		self.become_leader_now(out, false);
	}

	/// Completes the membership lifecycle of a node whose retirement has been
	/// finalized: it leaves the cluster for good and stops serving. Returns false (and
	/// does nothing) while the node is still in the membership.
	pub fn shutdown(&mut self) -> bool {
		if self.membership != MembershipPhase::RetiredCommitted {
			return false;
		}

		info!("retired node shutting down");
		self.membership = MembershipPhase::Removed;
		self.halted = true;
		true
	}

	/// Asks the node we believe to be the leader to step down in our favor. Returns
	/// whether a proposal was actually sent.
	pub fn propose_request_vote(&mut self, out: &mut Tick) -> bool {
		if self.halted || self.is_retired() {
			return false;
		}

		let leader = match self.state {
			ServerState::Follower(ref s) => match s.last_leader_id.clone() {
				Some(id) => id,
				None => return false,
			},
			_ => return false,
		};

		out.send(Message {
			to: vec![leader],
			body: MessageBody::ProposeRequestVote(ProposeRequestVote {
				term: self.meta.current_term,
			}),
		});

		true
	}

	/// Dispatches a single message received from the given peer. Returns an error only
	/// on a fatal invariant breach, after which the node is halted.
	pub fn recv_message(&mut self, from: &NodeId, data: &[u8], out: &mut Tick) -> Result<()> {
		if self.halted {
			return Ok(());
		}

		// A retired node stops processing elections and appends entirely; it only
		// serves reads until shutdown
		if self.is_retired() {
			return Ok(());
		}

		let body = match wire::decode_message(data) {
			Ok(b) => b,
			Err(e) => {
				self.decode_failures += 1;
				warn!(from = %from, error = %e, "dropping undecodable message");
				return Ok(());
			}
		};

		// Strangers are ignored, with one exception: a RequestVote at a higher term
		// must be heard or a re-added node could never win. A node with no
		// configuration at all accepts anything; it is waiting to be adopted.
		let from_higher_vote = match body {
			MessageBody::RequestVote(ref req) => req.term > self.meta.current_term,
			_ => false,
		};

		if !from_higher_vote && !self.config.quorums().is_empty() && !self.config.is_known(from) {
			warn!(from = %from, "ignoring message from node outside the configuration");
			return Ok(());
		}

		match body {
			MessageBody::AppendEntries(req) => {
				let result = self.append_entries(from, req, out);
				match result {
					Ok(constraint) => {
						// Appends are durable when they return, so the constraint
						// resolves immediately
						match constraint.poll(self.log.as_ref()) {
							Ok(resp) => out.send(Message {
								to: vec![from.clone()],
								body: MessageBody::AppendEntriesResponse(resp),
							}),
							Err(c) => {
								warn!(pos = ?c.position(), "response withheld pending durability");
							}
						}
					}
					Err(e) => {
						if let ErrorKind::InvariantBreach(_) = e.kind() {
							self.halt();
							error!(error = %e, "fatal invariant breach");
							return Err(e);
						}

						warn!(from = %from, error = %e, "rejecting bad append entries request");
					}
				}
			}
			MessageBody::AppendEntriesResponse(resp) => {
				self.append_entries_callback(from, resp, out);
			}
			MessageBody::RequestVote(req) => {
				let resp = self.request_vote(from, req, out);

				// The vote (if granted) is in the tick's metadata, which the host
				// persists before this response leaves the machine
				out.send(Message {
					to: vec![from.clone()],
					body: MessageBody::RequestVoteResponse(resp.persisted()),
				});
			}
			MessageBody::RequestVoteResponse(resp) => {
				self.request_vote_callback(from, resp, out);
			}
			MessageBody::ProposeRequestVote(req) => {
				self.handle_propose_request_vote(from, req, out);
			}
		}

		Ok(())
	}

	// ---- internal state machine ----

	fn halt(&mut self) {
		self.halted = true;
	}

	fn new_follower_state(settings: &Settings, now: Duration) -> ServerState {
		ServerState::Follower(ServerFollowerState {
			election_timeout: Self::new_election_timeout(settings),
			last_leader_id: None,
			last_heartbeat: now,
		})
	}

	fn new_election_timeout(settings: &Settings) -> Duration {
		let base = settings.election_timeout.as_millis() as u64;
		let jitter = rand::thread_rng().gen_range(0..base.max(1));
		Duration::from_millis(base + jitter)
	}

	/// Makes this node a follower in the current term
	fn become_follower(&mut self, tick: &mut Tick) {
		info!(term = self.meta.current_term, "becoming follower");

		// Any retirements we were shepherding as leader are the next leader's problem
		let orphaned: Vec<NodeId> = self.retirement_acks.drain(..).map(|(_, n)| n).collect();
		for node in orphaned {
			self.config.finalize_retirement(&[node]);
		}

		self.state = Self::new_follower_state(&self.settings, tick.time);
		self.cycle(tick);
	}

	/// Run every time a term is seen in a remote request or response. If another node
	/// has a higher term than us we must become a follower.
	fn observe_term(&mut self, term: Term, tick: &mut Tick) {
		if term > self.meta.current_term {
			self.meta.current_term = term;
			self.meta.voted_for = None;
			tick.write_meta();

			self.store.initialise_term(term);
			self.become_follower(tick);
		}
	}

	/// Only moves between Active and PendingRetirement; a committed retirement never
	/// reverts
	fn refresh_membership(&mut self) {
		if self.membership >= MembershipPhase::RetiredCommitted {
			return;
		}

		let latest = self.config.latest();
		let phase = if latest.is_empty() || latest.contains(&self.id) {
			MembershipPhase::Active
		} else {
			MembershipPhase::PendingRetirement
		};

		if phase != self.membership {
			info!(phase = ?phase, "membership phase change");
			self.membership = phase;
		}
	}

	/// Leaders are allowed to commit entries before they are locally flushed, so a
	/// restarted node may briefly have a commit index past its log; it must not become
	/// leader until resynced.
	fn can_be_leader(&self) -> bool {
		self.log.last_index() >= self.meta.commit_index && self.config.value.contains(&self.id)
	}

	pub fn cycle(&mut self, tick: &mut Tick) {
		if self.halted {
			return;
		}

		// A retired node drives nothing
		if self.is_retired() {
			self.state = ServerState::Retired;
			return;
		}

		// With no configuration at all there is trivially nothing to do. A follower
		// outside the voting set also never starts elections; it just tracks the
		// leader.
		let is_leader = matches!(self.state, ServerState::Leader(_));
		if self.config.quorums().is_empty()
			|| (!is_leader && !self.config.value.contains(&self.id))
		{
			tick.wake_in(Duration::from_secs(1));
			return;
		}

		enum Summary {
			Follower {
				elapsed: Duration,
				election_timeout: Duration,
			},
			Candidate {
				vote_count: usize,
				election_start: Duration,
				election_timeout: Duration,
			},
			Leader {
				next_commit_index: Option<LogIndex>,
			},
		}

		// Move the important information out of the state so the handling below can
		// borrow the rest of the module freely
		let summary = match self.state {
			ServerState::Follower(ref s) => Summary::Follower {
				elapsed: tick.time.checked_sub(s.last_heartbeat).unwrap_or_default(),
				election_timeout: s.election_timeout,
			},
			ServerState::Candidate(ref s) => Summary::Candidate {
				// We always vote for ourselves when starting the election
				vote_count: 1
					+ s.votes_received
						.iter()
						.filter(|id| self.config.value.contains(*id))
						.count(),
				election_start: s.election_start,
				election_timeout: s.election_timeout,
			},
			ServerState::Leader(ref s) => Summary::Leader {
				next_commit_index: self.find_next_commit_index(s),
			},
			ServerState::Retired => return,
		};

		match summary {
			Summary::Follower {
				elapsed,
				election_timeout,
			} => {
				if !self.can_be_leader() {
					// Keep deferring the election until we could potentially win it
					self.state = Self::new_follower_state(&self.settings, tick.time);
					tick.wake_in(election_timeout);
				} else if elapsed >= election_timeout || self.config.value.len() == 1 {
					// A single-node cluster wins its election trivially, so don't wait
					self.start_election(tick);
				} else {
					tick.wake_in(election_timeout - elapsed);
				}
			}
			Summary::Candidate {
				vote_count,
				election_start,
				election_timeout,
			} => {
				let majority = self.config.value.majority();

				if vote_count >= majority {
					info!(term = self.meta.current_term, "won election");
					self.become_leader_now(tick, true);
				} else {
					let elapsed = tick.time.checked_sub(election_start).unwrap_or_default();

					if elapsed >= election_timeout {
						self.start_election(tick);
					} else {
						tick.wake_in(election_timeout - elapsed);
					}
				}
			}
			Summary::Leader { next_commit_index } => {
				if let Some(ci) = next_commit_index {
					self.update_committed(ci, tick);
				}

				let next_heartbeat = self.replicate_entries(tick);

				// A leader of a single-node set has nobody to heartbeat
				if self.config.known_ids().len() == 1 {
					tick.wake_in(Duration::from_secs(2));
				} else {
					tick.wake_in(next_heartbeat);
				}
			}
		}
	}

	fn start_election(&mut self, tick: &mut Tick) {
		// Will only be triggered from cycle, which checks this, but guard anyway as an
		// election from a desynced log would break leader completeness
		if !self.can_be_leader() {
			warn!("not eligible to start an election");
			self.state = Self::new_follower_state(&self.settings, tick.time);
			return;
		}

		self.meta.current_term += 1;
		self.meta.voted_for = Some(self.id.clone());
		tick.write_meta();
		self.store.initialise_term(self.meta.current_term);

		info!(term = self.meta.current_term, "starting election");

		self.state = ServerState::Candidate(ServerCandidateState {
			election_start: tick.time,
			election_timeout: Self::new_election_timeout(&self.settings),
			votes_received: std::collections::HashSet::new(),
		});

		self.perform_election(tick);

		// Either sets the election-timeout wakeup or immediately makes us leader in a
		// single-node set
		self.cycle(tick);
	}

	fn perform_election(&self, tick: &mut Tick) {
		let last_committable = self.log.last_committable();
		let term_of_last_committable = self.log.term_at(last_committable).unwrap_or(0);

		let req = RequestVoteRequest {
			term: self.meta.current_term,
			last_committable_index: last_committable,
			term_of_last_committable_index: term_of_last_committable,
		};

		// All voting members aside from ourselves
		let ids: Vec<NodeId> = self
			.config
			.value
			.iter()
			.filter(|id| **id != self.id)
			.cloned()
			.collect();

		// This will happen for a single node cluster
		if ids.is_empty() {
			return;
		}

		tick.send(Message {
			to: ids,
			body: MessageBody::RequestVote(req),
		});
	}

	/// Promotion to leader, either by winning an election or by force. With an
	/// election, a committable term-start signature is appended immediately so the
	/// leader-term commit rule can fire without waiting for client writes.
	fn become_leader_now(&mut self, tick: &mut Tick, append_term_start: bool) {
		let last_log_index = self.log.last_index();

		let servers: HashMap<NodeId, ServerProgress> = self
			.config
			.known_ids()
			.into_iter()
			.filter(|id| *id != self.id)
			.map(|id| {
				(
					id,
					ServerProgress::new(last_log_index, self.settings.backoff_initial),
				)
			})
			.collect();

		self.state = ServerState::Leader(ServerLeaderState { servers });

		if append_term_start {
			let term = self.meta.current_term;
			if let Err(e) = self.emit_signature(term, tick) {
				// Cannot happen: we just became the leader of this term
				error!(error = ?e, "failed to append term-start signature");
			}
		}

		// Announce ourselves right away
		self.cycle(tick);
	}

	/// On the leader, finds the best next commit index if any advance is possible: the
	/// largest index replicated on a majority of every tracked configuration and
	/// created in the current term, clamped down to the nearest committable entry
	fn find_next_commit_index(&self, s: &ServerLeaderState) -> Option<LogIndex> {
		let mut ci = self.log.last_index();

		let quorums = self.config.quorums();
		if quorums.is_empty() {
			return None;
		}

		while ci > self.meta.commit_index {
			// Terms are monotonic, so once below the current term no higher index can
			// satisfy the leader-term rule either
			let term = match self.log.term_at(ci) {
				Some(t) => t,
				None => return None,
			};

			if term < self.meta.current_term {
				break;
			}

			if term == self.meta.current_term {
				let replicated = |cfg: &Configuration| {
					let mut count = 0;

					// We are the leader; our own ledger is durable through last_index
					if cfg.contains(&self.id) && self.log.last_index() >= ci {
						count += 1;
					}

					for (id, progress) in s.servers.iter() {
						if !cfg.contains(id) || *id == self.id {
							continue;
						}
						if progress.match_index >= ci {
							count += 1;
						}
					}

					count >= cfg.majority()
				};

				if quorums.iter().all(|cfg| replicated(cfg)) {
					// The commit point may only rest on a committable entry
					let target = self.log.committable_up_to(ci);
					if target > self.meta.commit_index {
						return Some(target);
					}
					return None;
				}
			}

			ci -= 1;
		}

		None
	}

	/// Run whenever the commit index advances
	fn update_committed(&mut self, index: LogIndex, tick: &mut Tick) {
		assert!(index > self.meta.commit_index);

		self.meta.commit_index = index;
		tick.write_meta();

		if self.deliver_committed(index) {
			tick.write_config();
		}
	}

	/// Hands newly committed entries to the store, promotes configurations, and
	/// processes retirement finalizations. Returns whether the active configuration
	/// changed.
	fn deliver_committed(&mut self, upto: LogIndex) -> bool {
		let mut config_changed = false;

		let entries = if upto > self.last_applied {
			let entries = self.log.range(self.last_applied + 1, upto);
			self.store.apply(&entries, upto);
			self.last_applied = upto;
			entries
		} else {
			Vec::new()
		};

		// Promote configurations before processing retirements: a batch may carry the
		// reconfiguration that starts a node's retirement and the entry that finalizes
		// it, and they take effect in ledger order
		if let Some(config) = self.config.commit(upto) {
			info!(idx = config.idx, size = config.len(), "configuration committed");
			self.store.configuration_committed(&config);
			config_changed = true;
		}

		{
			let was_leader = matches!(self.state, ServerState::Leader(_));

			for e in entries.iter() {
				if e.kind == EntryKind::RetiredCommitted {
					match wire::unmarshal::<Vec<NodeId>>(&e.payload) {
						Ok(nodes) => {
							self.store.retirement_committed(e.index, &nodes);

							if nodes.contains(&self.id) {
								info!(idx = e.index, "retirement committed for this node");
								self.membership = MembershipPhase::RetiredCommitted;
								self.state = ServerState::Retired;
								self.config.finalize_retirement(&[self.id.clone()]);
							}

							if was_leader {
								// Keep replicating to each subject until it has seen
								// this commit point, so it can observe its own removal
								// before we stop talking to it
								let subjects: Vec<NodeId> = nodes
									.iter()
									.filter(|n| **n != self.id)
									.cloned()
									.collect();
								for n in subjects {
									self.retirement_acks.push((e.index, n));
								}
							} else {
								self.config.finalize_retirement(&nodes);
							}
						}
						Err(err) => {
							warn!(idx = e.index, error = %err, "bad retirement payload");
						}
					}
				}
			}
		}

		// The committed prefix can be compacted away by the snapshotter whenever it
		// likes
		self.store.compact(upto);

		config_changed
	}

	/// On the leader, produces the requests needed to replicate or maintain the log on
	/// every other node, heartbeats included. Returns the time remaining until the
	/// next heartbeat is due.
	fn replicate_entries(&mut self, tick: &mut Tick) -> Duration {
		let known = self.config.known_ids();
		let leader_id = self.id.clone();
		let term = self.meta.current_term;
		let leader_commit = self.meta.commit_index;
		let settings = self.settings.clone();
		let log = &self.log;
		let now = tick.time;

		let state: &mut ServerLeaderState = match self.state {
			ServerState::Leader(ref mut s) => s,
			// This entire function is only called while we are the leader
			_ => panic!("not the leader"),
		};

		// Nodes removed from every tracked configuration no longer need progress
		state.servers.retain(|id, _| known.contains(id));

		let last_log_index = log.last_index();

		// Requests with the same previous index are identical, so build each once and
		// fan the recipient list out
		let mut message_map: HashMap<LogIndex, Message> = HashMap::new();

		let mut next_wake = settings.heartbeat_interval;

		for id in known.iter() {
			if *id == leader_id {
				continue;
			}

			let progress = state
				.servers
				.entry(id.clone())
				.or_insert_with(|| ServerProgress::new(last_log_index, settings.backoff_initial));

			let has_new = last_log_index >= progress.next_index;

			if progress.inflight {
				// An unacknowledged request is retried no earlier than its backoff
				let since = progress
					.last_sent
					.map(|t| now.checked_sub(t).unwrap_or_default())
					.unwrap_or(settings.backoff_cap);

				if since < progress.backoff {
					next_wake = std::cmp::min(next_wake, progress.backoff - since);
					continue;
				}

				progress.backoff = std::cmp::min(progress.backoff * 2, settings.backoff_cap);
			} else if !has_new {
				// Fully caught up; only contact it again once a heartbeat is due
				if let Some(t) = progress.last_sent {
					let since = now.checked_sub(t).unwrap_or_default();
					if since < settings.heartbeat_interval {
						next_wake = std::cmp::min(next_wake, settings.heartbeat_interval - since);
						continue;
					}
				}
			}

			let prev_index = progress.next_index - 1;
			let prev_term = match log.term_at(prev_index) {
				Some(t) => t,
				None => {
					// The prefix this peer needs was compacted away; a snapshot
					// transfer (outside this module) has to catch it up
					warn!(peer = %id, prev_index, "peer is behind the start of the ledger");
					continue;
				}
			};

			let end = std::cmp::min(last_log_index, prev_index + settings.batch_size);
			let entries = log.range(prev_index + 1, end);
			let idx = prev_index + entries.len() as u64;
			let term_of_idx = entries.last().map(|e| e.term).unwrap_or(prev_term);

			progress.sent_index = idx;
			progress.sent_commit = leader_commit;
			progress.last_sent = Some(now);
			progress.inflight = !entries.is_empty();

			if let Some(msg) = message_map.get_mut(&prev_index) {
				msg.to.push(id.clone());
			} else {
				message_map.insert(
					prev_index,
					Message {
						to: vec![id.clone()],
						body: MessageBody::AppendEntries(AppendEntriesRequest {
							term,
							leader_id: leader_id.clone(),
							prev_index,
							prev_term,
							leader_commit,
							term_of_idx,
							idx,
							entries,
						}),
					},
				);
			}
		}

		for (_, msg) in message_map.into_iter() {
			tick.send(msg);
		}

		next_wake
	}

	/// Decides whether we would grant a vote to the given candidate, without mutating
	/// anything
	fn vote_decision(&self, candidate: &NodeId, req: &RequestVoteRequest) -> bool {
		if req.term < self.meta.current_term {
			return false;
		}

		// Only members of the active configuration hand out votes
		if !self.config.value.contains(&self.id) {
			return false;
		}

		// Whether the candidate's committable suffix is at least as up-to-date as ours
		let our_last = self.log.last_committable();
		let our_term = self.log.term_at(our_last).unwrap_or(0);

		let up_to_date = req.term_of_last_committable_index > our_term
			|| (req.term_of_last_committable_index == our_term
				&& req.last_committable_index >= our_last);

		if !up_to_date {
			return false;
		}

		// We trivially never voted in a term higher than our own
		if req.term > self.meta.current_term {
			return true;
		}

		match self.meta.voted_for {
			// Having already voted in this term, we are not allowed to change our mind
			Some(ref id) => id == candidate,
			None => true,
		}
	}

	/// Called when another node requests our vote
	fn request_vote(
		&mut self,
		candidate: &NodeId,
		req: RequestVoteRequest,
		tick: &mut Tick,
	) -> MustPersistMetadata<RequestVoteResponse> {
		debug!(candidate = %candidate, term = req.term, "received vote request");

		self.observe_term(req.term, tick);

		let granted = self.vote_decision(candidate, &req);

		if granted {
			self.meta.voted_for = Some(candidate.clone());
			tick.write_meta();
			info!(candidate = %candidate, term = req.term, "granted vote");

			// Granting a vote resets the election deadline so the new leader gets a
			// full quiet period to assert itself
			if let ServerState::Follower(ref mut s) = self.state {
				s.last_heartbeat = tick.time;
			}
		}

		MustPersistMetadata::new(RequestVoteResponse {
			term: self.meta.current_term,
			vote_granted: granted,
		})
	}

	/// Handles the response to a RequestVote this module issued
	fn request_vote_callback(&mut self, from: &NodeId, resp: RequestVoteResponse, tick: &mut Tick) {
		self.observe_term(resp.term, tick);

		// Only matters if we are still the candidate of the term we asked in
		if self.meta.current_term != resp.term {
			return;
		}

		if *from == self.id {
			warn!("rejected duplicate self vote");
			return;
		}

		let should_cycle = if let ServerState::Candidate(ref mut s) = self.state {
			if resp.vote_granted {
				s.votes_received.insert(from.clone());
			}
			true
		} else {
			false
		};

		if should_cycle {
			// Might have just reached the majority
			self.cycle(tick);
		}
	}

	/// An up-to-date follower asked us to step aside so it can run an election without
	/// inflating the term
	fn handle_propose_request_vote(&mut self, from: &NodeId, req: ProposeRequestVote, tick: &mut Tick) {
		self.observe_term(req.term, tick);

		if req.term != self.meta.current_term {
			return;
		}

		let up_to_date = match self.state {
			ServerState::Leader(ref s) => s
				.servers
				.get(from)
				.map(|p| p.match_index >= self.log.last_index())
				.unwrap_or(false),
			_ => return,
		};

		if up_to_date {
			info!(peer = %from, "stepping down on request of an up-to-date follower");
			self.become_follower(tick);
		} else {
			debug!(peer = %from, "ignoring step-down proposal from a lagging follower");
		}
	}

	/// Follower half of replication. Responds with a constraint tying the response to
	/// the durability of the last appended position.
	fn append_entries(
		&mut self,
		from: &NodeId,
		req: AppendEntriesRequest,
		tick: &mut Tick,
	) -> Result<MatchConstraint<AppendEntriesResponse>> {
		self.observe_term(req.term, tick);

		if req.term < self.meta.current_term {
			// Not the current leader; the term in our response will demote it
			return Ok(AppendEntriesResponse {
				term: self.meta.current_term,
				last_log_index: 0,
				result: AppendResult::Ok,
			}
			.into());
		}

		// A candidate observing a leader in its own term lost the race
		if matches!(self.state, ServerState::Candidate(_)) {
			self.become_follower(tick);
		}

		match self.state {
			ServerState::Follower(ref mut s) => {
				s.last_heartbeat = tick.time;
				s.last_leader_id = Some(req.leader_id.clone());
			}
			ServerState::Leader(_) => {
				bail!(ErrorKind::InvariantBreach(format!(
					"second leader {} in term {}",
					from, req.term
				)));
			}
			_ => {}
		}

		let current_term = self.meta.current_term;
		let last_log_index = self.log.last_index();

		// Sanity check the request shape before touching any state
		if !req.entries.is_empty() {
			let first = &req.entries[0];
			if first.index != req.prev_index + 1 || first.term < req.prev_term {
				bail!(ErrorKind::Malformed("first entry does not follow prev".into()));
			}

			for pair in req.entries.windows(2) {
				if pair[1].index != pair[0].index + 1 || pair[1].term < pair[0].term {
					bail!(ErrorKind::Malformed("entries are unsorted or inconsistent".into()));
				}
			}

			// Engine-interpreted payloads must parse before anything is appended
			for e in req.entries.iter() {
				match e.kind {
					EntryKind::Reconfiguration => {
						wire::unmarshal::<std::collections::BTreeMap<NodeId, NodeAddr>>(&e.payload)?;
					}
					EntryKind::RetiredCommitted => {
						wire::unmarshal::<Vec<NodeId>>(&e.payload)?;
					}
					_ => {}
				}
			}
		}

		if req.prev_index + 1 < self.log.first_index() {
			// Only committed (and snapshotted) entries live before the start of the
			// log, and those are never resent
			bail!(ErrorKind::Malformed(
				"previous log entry is before the start of the log".into()
			));
		}

		// Log matching check at the previous position. Conflicts are reported, never
		// silently absorbed.
		match self.log.term_at(req.prev_index) {
			Some(t) if t == req.prev_term => {}
			Some(t) => {
				// Point the leader at the start of the conflicting term's run so it can
				// skip over it in one step
				return Ok(AppendEntriesResponse {
					term: current_term,
					last_log_index,
					result: AppendResult::Conflict {
						term: t,
						first_index: self.log.first_index_of_term_at(req.prev_index),
					},
				}
				.into());
			}
			None => {
				// The request starts beyond the end of our log
				return Ok(AppendEntriesResponse {
					term: current_term,
					last_log_index,
					result: AppendResult::Conflict {
						term: 0,
						first_index: last_log_index + 1,
					},
				}
				.into());
			}
		}

		// Index into the entries of the first entry not already in our log
		let mut first_new = 0;

		for e in req.entries.iter() {
			match self.log.term_at(e.index) {
				Some(t) if t == e.term => {
					// Already in the log
					first_new += 1;
				}
				Some(_) => {
					// Inconsistent suffix; it must be rolled back before appending

					if self.meta.commit_index >= e.index {
						// The leader is asking us to rewrite committed history. A
						// committed entry is never removed, so this cannot be answered;
						// the node halts rather than keep running against a ledger it
						// can no longer trust.
						bail!(ErrorKind::InvariantBreach(format!(
							"leader {} attempted to truncate at or below commit index {} at entry {}",
							from, self.meta.commit_index, e.index
						)));
					}

					// Drop any uncommitted configuration that is being truncated away
					self.config.revert(e.index);
					self.refresh_membership();

					let rollback_to = TxId {
						term: self.log.term_at(e.index - 1).unwrap_or(0),
						index: e.index - 1,
					};
					self.store.rollback(rollback_to, current_term);

					self.log.truncate_suffix(e.index)?;
					break;
				}
				None => break,
			}
		}

		let mut last_new = req.prev_index;
		let mut last_new_term = req.prev_term;

		let new_entries = &req.entries[first_new..];
		if !new_entries.is_empty() {
			// The first appended entry must extend our log exactly
			let next = &new_entries[0];
			let last = self.log.last();
			if next.index != last.index + 1 || next.term < last.term {
				bail!(ErrorKind::Malformed(
					"new entries do not extend the local log".into()
				));
			}

			for e in new_entries {
				tick.new_entries = true;
				self.log.append(e.clone())?;

				let appended = self.log.entry(e.index).unwrap();
				self.config.apply(&appended)?;
				self.refresh_membership();
			}

			last_new = new_entries.last().unwrap().index;
			last_new_term = new_entries.last().unwrap().term;
		}

		// Only trust the leader's commit point as far as the prefix this request let us
		// validate
		if req.leader_commit > self.meta.commit_index {
			let target = std::cmp::min(req.leader_commit, last_new);
			let target = self.log.committable_up_to(target);

			if target > self.meta.commit_index {
				self.update_committed(target, tick);
			}
		}

		Ok(MatchConstraint::new(
			AppendEntriesResponse {
				term: current_term,
				last_log_index: self.log.last_index(),
				result: AppendResult::Ok,
			},
			LogPosition {
				term: last_new_term,
				index: last_new,
			},
		))
	}

	/// Handles the response to an AppendEntries this leader issued
	fn append_entries_callback(
		&mut self,
		from: &NodeId,
		resp: AppendEntriesResponse,
		tick: &mut Tick,
	) {
		self.observe_term(resp.term, tick);

		// A response from an older term carries no usable progress information
		if resp.term != self.meta.current_term {
			return;
		}

		let should_cycle = if let ServerState::Leader(ref mut s) = self.state {
			let progress = match s.servers.get_mut(from) {
				Some(p) => p,
				None => return,
			};

			progress.inflight = false;
			progress.last_ack = Some(tick.time);
			progress.backoff = self.settings.backoff_initial;

			match resp.result {
				AppendResult::Ok => {
					// Trust the acknowledgement only as far as what we actually sent;
					// anything beyond that on the follower is an unvalidated leftover
					// from an earlier term
					let acked = std::cmp::min(resp.last_log_index, progress.sent_index);

					if acked > progress.match_index {
						progress.match_index = acked;
						progress.next_index = acked + 1;
					}

					// A retiring peer that has now seen both its retirement entry and
					// a commit point covering it can finally be let go
					let match_index = progress.match_index;
					let sent_commit = progress.sent_commit;
					let mut done: Vec<NodeId> = Vec::new();
					self.retirement_acks.retain(|(idx, node)| {
						if node == from && match_index >= *idx && sent_commit >= *idx {
							done.push(node.clone());
							false
						} else {
							true
						}
					});
					for node in done {
						info!(peer = %node, "retired node released from replication");
						self.config.finalize_retirement(&[node]);
					}
				}
				AppendResult::Conflict { first_index, .. } => {
					let rewound = std::cmp::max(first_index, 1);
					if rewound < progress.next_index {
						progress.next_index = std::cmp::max(rewound, progress.match_index + 1);
					} else {
						// A conflict that does not rewind means the follower's log is
						// shorter than we assumed
						progress.next_index =
							std::cmp::max(std::cmp::min(progress.next_index, resp.last_log_index + 1), 1);
					}
				}
			}

			true
		} else {
			false
		};

		if should_cycle {
			// Something may have advanced; retry sends and the commit point now
			self.cycle(tick);
		}
	}

	/// Handles the host reporting that an AppendEntries could not be delivered. The
	/// request stays accounted as inflight; its backoff grows so retries to an
	/// unreachable peer thin out instead of spamming every cycle.
	pub fn append_entries_noresponse(&mut self, from: &NodeId, _tick: &mut Tick) {
		if let ServerState::Leader(ref mut s) = self.state {
			if let Some(progress) = s.servers.get_mut(from) {
				if progress.inflight {
					progress.backoff =
						std::cmp::min(progress.backoff * 2, self.settings.backoff_cap);
				}
			}
		}
	}
}
