use std::time::Duration;

use proptest::prelude::*;

use consensus::log::Ledger;
use consensus::sim::ClusterSim;

/*
	Quantified safety properties, exercised by running a three-node cluster through
	randomized schedules of timer ticks, message deliveries, drops, partitions, and
	client traffic. After every step the harness audits:

	- log matching (identical term at an index implies identical prefix)
	- leader completeness for committed entries
	- state machine safety across replicas
	- at most one leader per term and monotone term/commit on every node
	- quorum presence of every committed prefix

	The schedules make no attempt to be fair, so livelock (no leader, nothing
	committed) is an acceptable outcome of a run; safety violations are not.
*/

const NODES: [&str; 3] = ["a", "b", "c"];

#[derive(Debug, Clone)]
enum Op {
	Periodic(usize, u64),
	PeriodicAll(u64),
	DispatchAll,
	DispatchOne(usize),
	DropPending(usize),
	Partition(usize, usize),
	Heal,
	Replicate(u8, bool),
	EmitSignature,
}

fn op_strategy() -> impl Strategy<Value = Op> {
	let n = NODES.len();
	prop_oneof![
		3 => (0..n, 1u64..=60).prop_map(|(i, v)| Op::Periodic(i, v)),
		3 => (1u64..=60).prop_map(Op::PeriodicAll),
		4 => Just(Op::DispatchAll),
		3 => (0..n).prop_map(Op::DispatchOne),
		1 => (0..n).prop_map(Op::DropPending),
		1 => (0..n, 0..n).prop_map(|(a, b)| Op::Partition(a, b)),
		1 => Just(Op::Heal),
		3 => (any::<u8>(), any::<bool>()).prop_map(|(p, c)| Op::Replicate(p, c)),
		2 => Just(Op::EmitSignature),
	]
}

fn apply_op(sim: &mut ClusterSim, op: &Op) {
	match op {
		Op::Periodic(i, v) => sim.periodic(NODES[*i], Duration::from_millis(*v)),
		Op::PeriodicAll(v) => sim.periodic_all(Duration::from_millis(*v)),
		Op::DispatchAll => sim.dispatch_all(),
		Op::DispatchOne(i) => {
			sim.dispatch_one(NODES[*i], None);
		}
		Op::DropPending(i) => {
			sim.drop_pending(NODES[*i]);
		}
		Op::Partition(a, b) => {
			if a != b {
				sim.disconnect(NODES[*a], NODES[*b]);
			}
		}
		Op::Heal => sim.connect_all(),
		Op::Replicate(payload, committable) => {
			// Submit at whatever primary currently claims the highest term
			if let Some((term, _)) = sim.primaries().into_iter().max_by_key(|(t, _)| *t) {
				let _ = sim.replicate(term, &[*payload], *committable);
			}
		}
		Op::EmitSignature => {
			if let Some((term, _)) = sim.primaries().into_iter().max_by_key(|(t, _)| *t) {
				let _ = sim.emit_signature(term);
			}
		}
	}
}

proptest! {
	#![proptest_config(ProptestConfig {
		cases: 48,
		.. ProptestConfig::default()
	})]

	#[test]
	fn safety_holds_under_random_schedules(
		ops in proptest::collection::vec(op_strategy(), 1..100)
	) {
		let mut sim = ClusterSim::new(ClusterSim::default_settings());
		sim.create_nodes(&NODES);
		sim.connect_all();

		for (step, op) in ops.iter().enumerate() {
			apply_op(&mut sim, op);

			let verdict = sim.check_all();
			prop_assert!(
				verdict.is_ok(),
				"safety violated after step {} ({:?}): {:?}",
				step,
				op,
				verdict
			);
		}
	}

	#[test]
	fn committed_entries_survive_partitions_and_new_leaders(
		pre in proptest::collection::vec((any::<u8>(), any::<bool>()), 1..10),
		isolate in 0usize..3,
		post_ticks in 1u64..6,
	) {
		let mut sim = ClusterSim::new(ClusterSim::default_settings());
		sim.create_nodes(&NODES);
		sim.connect_all();

		// Elect somebody by honest timeouts
		for _ in 0..40 {
			sim.periodic_all(Duration::from_millis(20));
			sim.dispatch_all();
			if !sim.primaries().is_empty() {
				break;
			}
		}
		prop_assume!(!sim.primaries().is_empty());
		let (term, leader) = sim.primaries().into_iter().max_by_key(|(t, _)| *t).unwrap();

		// Commit a batch of traffic
		for (payload, committable) in pre.iter() {
			let _ = sim.replicate(term, &[*payload], *committable);
		}
		let _ = sim.emit_signature(term);
		sim.settle(6);

		let committed_before = sim.node(leader.as_str()).module.commit_index();
		prop_assert!(committed_before > 0);
		let prefix_before = sim.node(leader.as_str()).ledger.range(1, committed_before);

		// Partition one node away and let the rest keep going
		sim.disconnect_node(NODES[isolate]);
		for _ in 0..post_ticks {
			sim.periodic_all(Duration::from_millis(120));
			sim.dispatch_all();
		}
		sim.connect_all();
		sim.settle(8);

		// Whatever happened, every committed entry is still committed everywhere the
		// commit point reaches, unchanged
		for id in NODES.iter() {
			let node = sim.node(id);
			let commit = node.module.commit_index();
			prop_assert!(commit >= std::cmp::min(committed_before, commit));

			let upper = std::cmp::min(commit, committed_before);
			if upper > 0 {
				prop_assert_eq!(
					node.ledger.range(1, upper),
					prefix_before[..upper as usize].to_vec(),
					"committed prefix rewritten on {}",
					id
				);
			}
		}

		prop_assert!(sim.check_all().is_ok());
	}
}
