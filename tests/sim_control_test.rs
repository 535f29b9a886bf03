//! Simulator control surface: terminal commands, flash snapshots and
//! reestablishment after transient link drops.

use meshsim::sim::terminal::{self, TerminalError};
use meshsim::types::ConnectionState;
use meshsim::{SimConfig, Simulator};

fn config() -> SimConfig {
    SimConfig {
        seed: 31,
        num_nodes: 2,
        map_width_in_meters: 100.0,
        map_height_in_meters: 100.0,
        mesh_extended_connection_timeout_sec: 10,
        ..Default::default()
    }
}

fn run_ms(sim: &mut Simulator, ms: u32) {
    let deadline = sim.sim_time_ms() + ms;
    while sim.sim_time_ms() < deadline {
        sim.step_all_nodes();
    }
}

fn cluster(sim: &mut Simulator) {
    let serials: Vec<u32> = sim.nodes.iter().map(|n| n.serial_index).collect();
    for (i, serial) in serials.iter().enumerate() {
        sim.set_position(*serial, 50.0 + 0.2 * i as f32, 50.0, 0.0);
    }
    let deadline = sim.sim_time_ms() + 60_000;
    while sim.sim_time_ms() < deadline && !sim.is_clustering_done() {
        sim.step_all_nodes();
    }
    assert!(sim.is_clustering_done());
}

#[test]
fn reestablishment_recovers_without_full_handshake() {
    let mut sim = Simulator::new(config());
    cluster(&mut sim);
    // The connection must have been stable for more than ten seconds.
    run_ms(&mut sim, 15_000);

    let cluster_id_before = sim.nodes[0].cluster_id;
    let handle = sim.nodes[0]
        .sd
        .connections
        .iter()
        .find(|c| c.active)
        .map(|c| c.handle)
        .expect("a gap link must exist");

    // Drop the link with a timeout, as `rees` would.
    let line = terminal::execute(&mut sim, &format!("rees {}", handle)).unwrap();
    assert!(line.contains("dropped"));

    // Shortly after, at least one side is in a reestablishing state.
    run_ms(&mut sim, 500);
    let reestablishing = sim.nodes.iter().any(|n| {
        n.cm.mesh_slots().into_iter().any(|s| {
            let state = n.cm.get(s).unwrap().state;
            state == ConnectionState::Reestablishing
                || state == ConnectionState::ReestablishingHandshake
        })
    });
    assert!(reestablishing, "the drop must trigger reestablishment");

    // Within the budget both sides are back without a clustering handshake.
    run_ms(&mut sim, 10_000);
    for node in &sim.nodes {
        assert_eq!(node.cluster_size, 2, "cluster must survive the drop");
        assert_eq!(node.cluster_id, cluster_id_before, "cluster id must not change");
        let slot = node.cm.handshaked_mesh_slots()[0];
        assert_eq!(node.cm.get(slot).unwrap().state, ConnectionState::HandshakeDone);
    }
    // No mesh-level disconnect was reported.
    assert!(sim.json_journal.iter().all(|l| !l.contains("mesh_disconnect")));
}

#[test]
fn reestablishment_gives_up_after_budget() {
    let mut sim = Simulator::new(config());
    cluster(&mut sim);
    run_ms(&mut sim, 15_000);

    // Move the partner out of range, then drop the link.
    let serial = sim.nodes[1].serial_index;
    sim.set_position(serial, 99.0, 99.0, 0.0);
    let handle = sim.nodes[0].sd.connections.iter().find(|c| c.active).unwrap().handle;
    sim.disconnect_simulator_connection(0, handle, 0x08, 0x08);

    // After the reestablishment budget, the records are destroyed.
    run_ms(&mut sim, 25_000);
    for node in &sim.nodes {
        assert!(
            node.cm
                .mesh_slots()
                .into_iter()
                .all(|s| node.cm.get(s).unwrap().state < ConnectionState::Reestablishing),
            "node {} kept a reestablishing record past the budget",
            node.id
        );
        assert_eq!(node.cluster_size, 1, "node {} must fall back to its own cluster", node.id);
    }
    assert!(sim.json_journal.iter().any(|l| l.contains("mesh_disconnect")));
}

#[test]
fn flash_snapshot_roundtrip_restores_state() {
    let path = std::env::temp_dir().join("meshsim_flash_test.bin");
    let path_str = path.to_string_lossy().to_string();
    let _ = std::fs::remove_file(&path);

    let mut sim = Simulator::new(SimConfig {
        store_flash_to_file: Some(path_str.clone()),
        ..config()
    });
    cluster(&mut sim);
    sim.store_flash_to_file();

    // A fresh simulation against the stored images boots the same identities.
    let mut restored = Simulator::new(SimConfig {
        store_flash_to_file: Some(path_str.clone()),
        ..config()
    });
    assert!(restored.load_flash_from_file());
    for (a, b) in sim.nodes.iter().zip(restored.nodes.iter()) {
        assert_eq!(a.config.node_id, b.config.node_id);
        assert_eq!(a.config.network_id, b.config.network_id);
        assert_eq!(a.serial_index, b.serial_index);
    }

    // Clustering completes again quickly, no re-provisioning needed.
    let serials: Vec<u32> = restored.nodes.iter().map(|n| n.serial_index).collect();
    for (i, serial) in serials.iter().enumerate() {
        restored.set_position(*serial, 50.0 + 0.2 * i as f32, 50.0, 0.0);
    }
    let deadline = restored.sim_time_ms() + 10_000;
    while restored.sim_time_ms() < deadline && !restored.is_clustering_done() {
        restored.step_all_nodes();
    }
    assert!(restored.is_clustering_done());

    // A node-count mismatch rejects the file and keeps it on disk.
    let mut wrong = Simulator::new(SimConfig {
        num_nodes: 3,
        store_flash_to_file: Some(path_str),
        ..config()
    });
    assert!(!wrong.load_flash_from_file());
    assert!(path.exists(), "a rejected snapshot must not be deleted");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn simstat_reports_every_node() {
    let mut sim = Simulator::new(config());
    let out = terminal::execute(&mut sim, "simstat").unwrap();
    assert!(out.contains("nodes: 2"));
    assert!(out.contains("node 1:"));
    assert!(out.contains("node 2:"));
}

#[test]
fn seed_command_reads_and_writes() {
    let mut sim = Simulator::new(config());
    assert_eq!(terminal::execute(&mut sim, "seed").unwrap(), "seed is 31");
    terminal::execute(&mut sim, "seed 99").unwrap();
    assert_eq!(sim.config.seed, 99);
}

#[test]
fn malformed_crc_token_is_rejected() {
    let mut sim = Simulator::new(config());
    assert_eq!(
        terminal::execute(&mut sim, "width 10 CRC: notanumber"),
        Err(TerminalError::CrcInvalid)
    );
}

#[test]
fn settime_and_gettime_through_the_terminal() {
    let mut sim = Simulator::new(config());
    cluster(&mut sim);
    terminal::execute(&mut sim, "term 1").unwrap();
    terminal::execute(&mut sim, "settime 1560262597 0").unwrap();
    run_ms(&mut sim, 1_000);
    terminal::execute(&mut sim, "gettime").unwrap();
    run_ms(&mut sim, 1_000);
    let out = sim.nodes[0].terminal_output.join("\n");
    assert!(out.contains("Time is currently set"), "output: {}", out);
}
