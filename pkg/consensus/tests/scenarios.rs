use std::time::Duration;

use bytes::Bytes;
use consensus::consensus::{ProposalStatus, ReplicateError};
use consensus::log::Ledger;
use consensus::protos::*;
use consensus::sim::ClusterSim;
use consensus::state::MembershipPhase;

/*
	End-to-end cluster scenarios, each driven step by step through the in-process
	harness so message interleavings are deterministic where the scenario needs them
	to be.
*/

fn ms(v: u64) -> Duration {
	Duration::from_millis(v)
}

/// Builds the standard three-node cluster: A forced primary in term 2, the initial
/// membership replicated as the reconfiguration entry at index 1, and one committed
/// payload at index 2.
fn three_node_cluster() -> ClusterSim {
	let mut sim = ClusterSim::new(ClusterSim::default_settings());
	sim.add_node("a");
	sim.add_node("b");
	sim.add_node("c");

	sim.force_primary("a");
	assert_eq!(sim.node("a").module.current_term(), 2);

	let prop = sim.replicate_reconfiguration(2, &["a", "b", "c"]).unwrap();
	assert_eq!(prop.index, 1);

	sim.connect_all();

	let prop = sim.replicate(2, b"x", true).unwrap();
	assert_eq!(prop, LogPosition { term: 2, index: 2 });

	sim.settle(5);
	sim
}

#[test_log::test]
fn three_node_happy_path() {
	let sim = three_node_cluster();

	for id in ["a", "b", "c"] {
		let node = sim.node(id);
		assert_eq!(node.module.commit_index(), 2, "commit on {}", id);
		assert_eq!(node.ledger.entry(2).unwrap().payload.as_ref(), b"x");
	}

	assert!(sim.node("a").module.is_leader());
	assert_eq!(sim.node("b").ledger.entry(2), sim.node("c").ledger.entry(2));

	sim.assert_state_sync().unwrap();
	sim.check_all().unwrap();
}

#[test_log::test]
fn leader_partition_and_reconciliation() {
	let mut sim = three_node_cluster();

	// Cut the leader off, then give it an uncommitted entry nobody will ever see
	sim.disconnect("a", "b");
	sim.disconnect("a", "c");
	let doomed = sim.replicate(2, b"y", true).unwrap();
	assert_eq!(sim.node("a").module.last_index(), 3);
	assert_eq!(
		sim.node("a").module.proposal_status(&doomed),
		ProposalStatus::Pending
	);

	// Flush the doomed replication attempts into the void
	sim.periodic("a", ms(20));
	sim.dispatch_one("a", None);

	// B times out and takes over in term 3
	sim.periodic("b", ms(250));
	assert!(sim.node("b").module.is_candidate());
	sim.dispatch_all();

	assert!(sim.node("b").module.is_leader());
	assert_eq!(sim.node("b").module.current_term(), 3);
	assert!(sim.node("c").module.is_follower());

	// The new leader's term-start entry lands at index 3 and commits with C
	sim.settle(3);
	assert_eq!(sim.node("b").module.commit_index(), 3);
	assert_eq!(sim.node("b").module.view_at(3), Some(3));

	// The old leader still reigns over term 2 but its commit point is stuck
	assert!(sim.node("a").module.is_leader());
	assert_eq!(sim.node("a").module.current_term(), 2);
	assert_eq!(sim.node("a").module.commit_index(), 2);

	// On reconnect A steps down and its uncommitted suffix is replaced
	sim.reconnect_node("a");
	sim.settle(5);

	assert!(sim.node("a").module.is_follower());
	assert_eq!(sim.node("a").module.current_term(), 3);
	assert_eq!(sim.node("a").module.commit_index(), 3);
	assert_eq!(sim.node("a").module.view_at(3), Some(3));

	// The doomed proposal was swept away by the new leader's entry at its index
	assert_eq!(
		sim.node("a").module.proposal_status(&doomed),
		ProposalStatus::Failed
	);

	sim.assert_state_sync().unwrap();
	sim.check_all().unwrap();
}

#[test_log::test]
fn log_match_rollback() {
	let mut sim = ClusterSim::new(ClusterSim::default_settings());
	sim.create_nodes(&["a", "b", "c"]);
	sim.connect_all();

	sim.force_primary("a");

	// One uncommittable entry everyone has, so logs agree at index 1
	sim.replicate(2, b"2.1", false).unwrap();
	sim.settle(2);
	for id in ["a", "b", "c"] {
		assert_eq!(sim.node(id).module.last_index(), 1);
		assert_eq!(sim.node(id).module.commit_index(), 0);
	}

	// A keeps appending into the void
	sim.disconnect_node("a");
	sim.replicate(2, b"2.2", false).unwrap();
	sim.replicate(2, b"2.3", false).unwrap();
	assert_eq!(sim.node("a").module.last_index(), 3);

	// B wins term 3 and its term-start signature occupies index 2
	sim.periodic("b", ms(250));
	sim.dispatch_all();
	assert!(sim.node("b").module.is_leader());
	assert_eq!(sim.node("b").module.view_at(2), Some(3));

	sim.settle(3);
	assert_eq!(sim.node("b").module.commit_index(), 2);

	// Reconnected, A must discard its divergent suffix in favor of 3.2
	sim.reconnect_node("a");
	sim.settle(5);

	let a = sim.node("a");
	assert_eq!(a.module.last_index(), 2);
	assert_eq!(
		a.module.history(),
		vec![
			LogPosition { term: 2, index: 1 },
			LogPosition { term: 3, index: 2 }
		]
	);
	assert_eq!(a.ledger.entry(2), sim.node("b").ledger.entry(2));

	// The truncation was reported to the state store adapter
	assert!(!a.store.rollbacks().is_empty());

	sim.assert_state_sync().unwrap();
	sim.check_all().unwrap();
}

#[test_log::test]
fn configuration_change_with_retirement() {
	let mut sim = ClusterSim::new(ClusterSim::default_settings());
	sim.create_nodes(&["a", "b", "c"]);
	sim.connect_all();
	sim.force_primary("a");

	// Fill the ledger to index 4
	for i in 1..=4 {
		sim.replicate(2, format!("e{}", i).as_bytes(), true).unwrap();
		sim.settle(2);
	}
	assert_eq!(sim.node("a").module.commit_index(), 4);

	// Swap C out for D at index 5
	sim.add_node("d");
	sim.reconnect_node("d");

	let prop = sim.replicate_reconfiguration(2, &["a", "b", "d"]).unwrap();
	assert_eq!(prop.index, 5);
	sim.settle(5);

	assert_eq!(sim.node("a").module.commit_index(), 5);
	assert_eq!(sim.node("a").module.config_snapshot().data.idx, 5);
	assert!(sim
		.node("a")
		.module
		.config_snapshot()
		.data
		.contains(&NodeId::from("d")));

	// D was adopted and caught up; C knows it is on the way out
	assert_eq!(sim.node("d").module.commit_index(), 5);
	assert_eq!(
		sim.node("c").module.membership(),
		MembershipPhase::PendingRetirement
	);
	assert!(!sim.node("c").module.is_retired());

	// Any majority of {A, B, D} now advances the commit point; B is not needed
	sim.disconnect_node("b");
	sim.replicate(2, b"after-swap", true).unwrap();
	sim.settle(5);
	assert_eq!(sim.node("a").module.commit_index(), 6);
	assert_eq!(sim.node("d").module.commit_index(), 6);
	sim.reconnect_node("b");
	sim.settle(3);

	// Finalizing the removal flips C to retired once the entry commits on C
	sim.replicate_retired_committed(2, &["c"]).unwrap();
	sim.settle(5);

	let c = sim.node("c");
	assert_eq!(c.module.membership(), MembershipPhase::RetiredCommitted);
	assert!(c.module.is_retired());
	assert_eq!(c.module.role_name(), "retired");
	assert!(!c.store.retirements().is_empty());

	// Retired nodes still serve their ledger to readers
	assert_eq!(c.module.commit_index(), 7);
	assert!(c.ledger.entry(7).is_some());

	// But they accept no more work
	let c = sim.node_mut("c");
	let mut tick = c.module.new_tick();
	let refused = c
		.module
		.replicate_data(2, Bytes::from_static(b"late"), true, &mut tick);
	assert_eq!(refused, Err(ReplicateError::NotReady));

	// Local shutdown completes the lifecycle
	assert!(c.module.shutdown());
	assert_eq!(c.module.membership(), MembershipPhase::Removed);

	sim.check_all().unwrap();
}

#[test_log::test]
fn commit_only_in_current_term() {
	let mut sim = ClusterSim::new(ClusterSim::default_settings());
	sim.create_nodes(&["a", "b", "c"]);
	sim.connect_all();
	sim.force_primary("a");

	// A replicates 2.1 and 2.2 to B but never learns of it: B's acknowledgements are
	// lost, and C is unreachable
	sim.disconnect("a", "c");

	sim.replicate(2, b"2.1", true).unwrap();
	sim.dispatch_one("a", None);
	sim.drop_pending("b");

	sim.replicate(2, b"2.2", true).unwrap();
	sim.periodic("a", ms(20));
	sim.dispatch_one("a", None);
	sim.drop_pending("b");

	assert_eq!(sim.node("a").module.commit_index(), 0);
	assert_eq!(sim.node("b").module.last_index(), 2);
	assert_eq!(sim.node("b").module.commit_index(), 0);

	// A crashes; B takes over in term 3 with the old entries uncommitted
	sim.halt_node("a");
	sim.disconnect_node("a");

	sim.periodic("b", ms(250));
	assert!(sim.node("b").module.is_candidate());

	// Deliver the vote requests, then the grants; B is now leader with its term-start
	// entry appended locally but nothing replicated yet
	sim.dispatch_all_once();
	sim.dispatch_all_once();
	assert!(sim.node("b").module.is_leader());
	assert_eq!(sim.node("b").module.current_term(), 3);

	// Being replicated on a majority is not enough for the old entries; nothing is
	// committed until the new term's own entry reaches a majority
	assert_eq!(sim.node("b").module.commit_index(), 0);

	// B's term-start signature is 3.3; once C holds it the commit point sweeps
	// straight past 2.1 and 2.2 to 3
	sim.settle(5);
	assert_eq!(sim.node("b").module.view_at(3), Some(3));
	assert_eq!(sim.node("b").module.commit_index(), 3);
	assert_eq!(sim.node("c").module.commit_index(), 3);

	// The sweep reached the state machine as a single batch ending at 3
	assert_eq!(sim.node("b").store.commit_points(), vec![3]);
	assert_eq!(
		sim.node("b")
			.store
			.applied()
			.iter()
			.map(|e| e.index)
			.collect::<Vec<_>>(),
		vec![1, 2, 3]
	);

	sim.check_all().unwrap();
}

#[test_log::test]
fn step_down_proposal_from_an_up_to_date_follower() {
	let mut sim = three_node_cluster();

	// B is fully caught up, so the leader honors its proposal and steps down without
	// any term inflation
	assert!(sim.propose_request_vote("b"));
	sim.dispatch_all();

	assert!(sim.node("a").module.is_follower());
	assert_eq!(sim.node("a").module.current_term(), 2);

	// B then wins the next election normally
	sim.periodic("b", ms(250));
	sim.dispatch_all();
	sim.settle(3);

	assert!(sim.node("b").module.is_leader());
	assert_eq!(sim.node("b").module.current_term(), 3);
	sim.check_all().unwrap();
}

#[test_log::test]
fn step_down_proposal_from_a_lagging_follower_is_ignored() {
	let mut sim = three_node_cluster();

	// C misses an entry
	sim.disconnect_node("c");
	sim.replicate(2, b"z", true).unwrap();
	sim.settle(3);
	sim.reconnect_node("c");

	// Its proposal is refused while it lags
	assert!(sim.propose_request_vote("c"));
	sim.dispatch_single("c", "a");

	assert!(sim.node("a").module.is_leader());
	assert_eq!(sim.node("a").module.current_term(), 2);
	sim.check_all().unwrap();
}

#[test_log::test]
fn unsafe_commit_from_faulty_acknowledgement_is_detected() {
	let mut sim = ClusterSim::new(ClusterSim::default_settings());
	sim.create_nodes(&["a", "b", "c"]);
	sim.connect_all();
	sim.force_primary("a");

	for payload in [&b"p1"[..], &b"p2"[..], &b"p3"[..]] {
		sim.replicate(2, payload, true).unwrap();
	}

	// Make sure the full batch went out once, then lose it all
	sim.periodic("a", ms(20));
	sim.drop_pending("a");
	assert_eq!(sim.node("a").module.commit_index(), 0);

	// A faulty adapter on B claims everything persisted
	sim.inject(
		"b",
		"a",
		MessageBody::AppendEntriesResponse(AppendEntriesResponse {
			term: 2,
			last_log_index: 3,
			result: AppendResult::Ok,
		}),
	);

	// The leader now believes in a majority that does not exist
	assert_eq!(sim.node("a").module.commit_index(), 3);

	// The consistency audit flags the commit point as exceeding the true
	// majority-held prefix, and the node is taken down
	let verdict = sim.check_commit_safety("a");
	assert!(verdict.is_err(), "unsafe commit went undetected");
	sim.halt_node("a");

	// The healthy remainder of the cluster still audits clean
	sim.check_log_matching().unwrap();
	sim.check_applied_safety().unwrap();
}
