mod key_value;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{App, Arg};
use tracing::info;

use consensus::channel::{Channels, MemoryChannels};
use consensus::clock::{Clock, SystemClock};
use consensus::consensus::{ConsensusModule, Settings, Tick};
use consensus::errors::*;
use consensus::log::Ledger;
use consensus::log_file::FileLedger;
use consensus::protos::*;
use consensus::wire;

use key_value::{KeyValueOperation, MemoryKVStateMachine};

/*
	Small demonstration host. In the default mode it runs an in-process cluster of N
	nodes over memory channels, elects a leader, pushes some key-value operations
	through replication, and prints what each replica ended up applying. With --dir it
	runs a single durable node on a file ledger instead, so re-running it shows the
	ledger surviving restarts.
*/

struct LocalNode {
	id: NodeId,
	module: ConsensusModule,
	kv: Arc<MemoryKVStateMachine>,
	outbound: Arc<MemoryChannels>,
}

fn demo_settings() -> Settings {
	Settings {
		election_timeout: Duration::from_millis(100),
		heartbeat_interval: Duration::from_millis(10),
		batch_size: 32,
		backoff_initial: Duration::from_millis(10),
		backoff_cap: Duration::from_millis(500),
	}
}

fn set_op(key: &str, value: &str) -> Result<Bytes> {
	let op = KeyValueOperation::Set {
		key: key.as_bytes().to_vec(),
		value: value.as_bytes().to_vec(),
	};
	Ok(Bytes::from(wire::marshal(&op)?))
}

fn cluster_demo(node_count: usize, op_count: usize) -> Result<()> {
	let ids: Vec<String> = (1..=node_count).map(|i| format!("n{}", i)).collect();

	let config: BTreeMap<NodeId, NodeAddr> = ids
		.iter()
		.enumerate()
		.map(|(i, id)| {
			(
				NodeId::from(id.as_str()),
				NodeAddr {
					hostname: "localhost".into(),
					port: 4100 + i as u16,
				},
			)
		})
		.collect();

	let mut nodes: Vec<LocalNode> = Vec::new();
	for id in ids.iter() {
		let node_id = NodeId::from(id.as_str());
		let kv = Arc::new(MemoryKVStateMachine::new());
		let ledger = Arc::new(consensus::log::MemoryLedger::new());

		let mut module = ConsensusModule::new(
			node_id.clone(),
			Metadata::default(),
			ConfigurationSnapshot::default(),
			ledger,
			kv.clone(),
			demo_settings(),
			0,
		)?;
		module.add_configuration(0, config.clone())?;

		nodes.push(LocalNode {
			id: node_id,
			module,
			kv,
			outbound: Arc::new(MemoryChannels::new()),
		});
	}

	let route = |nodes: &mut Vec<LocalNode>| {
		// Drain every outbound queue and deliver in-process, repeating until quiet
		for _ in 0..10 {
			let mut moved = 0;

			for i in 0..nodes.len() {
				let pending = nodes[i].outbound.drain();
				let from = nodes[i].id.clone();

				for (to, data) in pending {
					if let Some(target) = nodes.iter_mut().find(|n| n.id == to) {
						let mut tick = target.module.new_tick();
						if target.module.recv_message(&from, &data, &mut tick).is_ok() {
							push_tick(&target.outbound, tick);
						}
						moved += 1;
					}
				}
			}

			if moved == 0 {
				break;
			}
		}
	};

	// Let the timers run until someone wins an election
	let step = demo_settings().heartbeat_interval;
	for _ in 0..200 {
		for node in nodes.iter_mut() {
			let mut tick = node.module.new_tick();
			node.module.periodic(step, &mut tick);
			push_tick(&node.outbound, tick);
		}
		route(&mut nodes);

		if nodes.iter().any(|n| n.module.is_leader()) {
			break;
		}
	}

	let leader_idx = nodes
		.iter()
		.position(|n| n.module.is_leader())
		.ok_or_else(|| Error::from("no leader elected"))?;
	let term = nodes[leader_idx].module.current_term();
	info!(leader = %nodes[leader_idx].id, term, "cluster is up");

	for i in 1..=op_count {
		let payload = set_op(&format!("key{}", i), &format!("value{}", i))?;

		let leader = &mut nodes[leader_idx];
		let mut tick = leader.module.new_tick();
		leader
			.module
			.replicate_data(term, payload, true, &mut tick)
			.map_err(|e| Error::from(format!("replicate failed: {:?}", e)))?;
		push_tick(&leader.outbound, tick);

		route(&mut nodes);
	}

	// A couple of heartbeats so the commit point reaches every replica
	for _ in 0..5 {
		for node in nodes.iter_mut() {
			let mut tick = node.module.new_tick();
			node.module.periodic(step, &mut tick);
			push_tick(&node.outbound, tick);
		}
		route(&mut nodes);
	}

	for node in nodes.iter() {
		println!(
			"{}: role={} term={} last={} commit={} kv_entries={}",
			node.id,
			node.module.role_name(),
			node.module.current_term(),
			node.module.last_index(),
			node.module.commit_index(),
			node.kv.len()
		);
	}

	let sample = nodes[0].kv.get(b"key1");
	println!(
		"key1 = {:?}",
		sample.map(|v| String::from_utf8_lossy(&v).into_owned())
	);

	Ok(())
}

fn push_tick(outbound: &Arc<MemoryChannels>, tick: Tick) {
	for msg in tick.messages {
		let data = wire::encode_message(&msg.body);
		for to in msg.to {
			let _ = outbound.send(&to, data.clone());
		}
	}
}

fn read_meta(path: &Path) -> Metadata {
	std::fs::read(path)
		.ok()
		.and_then(|data| wire::unmarshal(&data).ok())
		.unwrap_or_default()
}

fn write_meta(path: &Path, meta: &Metadata) -> Result<()> {
	std::fs::write(path, wire::marshal(meta)?)?;
	Ok(())
}

fn durable_demo(dir: &Path, op_count: usize) -> Result<()> {
	let node_id = NodeId::from("n1");
	let meta_path = dir.join("meta");

	let ledger = Arc::new(FileLedger::open(dir)?);
	let recovered = ledger.last_index();

	let kv = Arc::new(MemoryKVStateMachine::new());
	let meta = read_meta(&meta_path);

	let mut config = BTreeMap::new();
	config.insert(
		node_id.clone(),
		NodeAddr {
			hostname: "localhost".into(),
			port: 4100,
		},
	);

	let mut module = ConsensusModule::new(
		node_id,
		meta,
		ConfigurationSnapshot::default(),
		ledger,
		kv.clone(),
		demo_settings(),
		0,
	)?;
	module.add_configuration(0, config)?;

	let clock = SystemClock::new();

	// A single-node set elects itself on the first tick
	let mut tick = module.new_tick();
	module.periodic(Duration::from_millis(1), &mut tick);
	if tick.meta {
		write_meta(&meta_path, module.meta())?;
	}

	let term = module.current_term();
	info!(term, recovered_entries = recovered, "durable node is up");

	for i in 1..=op_count {
		let payload = set_op(&format!("run-t{}-key{}", term, i), &format!("value{}", i))?;

		let mut tick = module.new_tick();
		module
			.replicate_data(term, payload, true, &mut tick)
			.map_err(|e| Error::from(format!("replicate failed: {:?}", e)))?;
		if tick.meta {
			write_meta(&meta_path, module.meta())?;
		}

		clock.sleep_until(clock.now() + Duration::from_millis(1));
	}

	println!(
		"term={} last={} commit={} kv_entries={} (ledger recovered {} entries from previous runs)",
		module.current_term(),
		module.last_index(),
		module.commit_index(),
		kv.len(),
		recovered
	);

	Ok(())
}

fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_max_level(tracing::Level::INFO)
		.init();

	let matches = App::new("Consensus")
		.about("Ledger-backed consensus demonstration node")
		.arg(
			Arg::with_name("nodes")
				.long("nodes")
				.short("n")
				.value_name("COUNT")
				.help("Number of in-process nodes to run")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("ops")
				.long("ops")
				.short("o")
				.value_name("COUNT")
				.help("Number of key-value operations to replicate")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("dir")
				.long("dir")
				.short("d")
				.value_name("DIRECTORY_PATH")
				.help("Run a single durable node storing its ledger in this directory")
				.takes_value(true),
		)
		.get_matches();

	let ops = matches
		.value_of("ops")
		.and_then(|v| v.parse().ok())
		.unwrap_or(8);

	match matches.value_of("dir") {
		Some(dir) => durable_demo(Path::new(dir), ops),
		None => {
			let nodes = matches
				.value_of("nodes")
				.and_then(|v| v.parse().ok())
				.unwrap_or(3);
			cluster_demo(nodes, ops)
		}
	}
}
