//! End-to-end clustering scenarios.

use meshsim::{SimConfig, Simulator};

fn close_pair_config() -> SimConfig {
    SimConfig {
        seed: 5,
        num_nodes: 2,
        map_width_in_meters: 100.0,
        map_height_in_meters: 100.0,
        sink_node_index: Some(0),
        ..Default::default()
    }
}

/// Steps until the predicate holds or the virtual deadline passes.
fn run_until(sim: &mut Simulator, max_ms: u32, mut pred: impl FnMut(&Simulator) -> bool) -> bool {
    while sim.sim_time_ms() < max_ms {
        sim.step_all_nodes();
        if pred(sim) {
            return true;
        }
    }
    false
}

fn place_close(sim: &mut Simulator) {
    let serials: Vec<u32> = sim.nodes.iter().map(|n| n.serial_index).collect();
    for (i, serial) in serials.iter().enumerate() {
        sim.set_position(*serial, 50.0 + 0.1 * i as f32, 50.0, 0.0);
    }
}

#[test]
fn two_nodes_cluster_within_ten_seconds() {
    let mut sim = Simulator::new(close_pair_config());
    place_close(&mut sim);

    let done = run_until(&mut sim, 10_000, |s| {
        s.nodes.iter().all(|n| n.cluster_size == 2)
    });
    assert!(done, "clustering did not converge within 10 s");

    assert_eq!(sim.nodes[0].cluster_id, sim.nodes[1].cluster_id);

    // Exactly one side of the connection holds the master bit.
    let master_bits: usize = sim.nodes.iter().map(|n| n.cm.master_bit_count()).sum();
    assert_eq!(master_bits, 1);

    // Exactly one GAP connection was set up for the mesh.
    let connects = sim
        .json_journal
        .iter()
        .filter(|l| l.contains("\"type\":\"sim_connect\""))
        .count();
    assert_eq!(connects, 1);
}

#[test]
fn three_clusters_merge_into_one() {
    let config = SimConfig {
        seed: 21,
        num_nodes: 3,
        enable_clustering_validity_check: true,
        ..close_pair_config()
    };
    let mut sim = Simulator::new(config);
    place_close(&mut sim);

    let done = run_until(&mut sim, 60_000, |s| s.is_clustering_done());
    assert!(done, "three nodes did not merge into one cluster");

    for node in &sim.nodes {
        assert_eq!(node.cluster_size, 3);
        assert_eq!(node.cluster_id, sim.nodes[0].cluster_id);
    }

    // Per handshaked edge exactly one endpoint holds the master bit, and
    // exactly one node holds the bit on all of its connections.
    let mut edges = 0;
    let mut nodes_with_all_bits = 0;
    for a in 0..sim.nodes.len() {
        let mut holds_all = true;
        let mut has_conn = false;
        for slot in sim.nodes[a].cm.handshaked_mesh_slots() {
            has_conn = true;
            let conn = sim.nodes[a].cm.get(slot).unwrap();
            let partner = conn.partner_id;
            let holds_here = conn.mesh().unwrap().connection_master_bit;
            holds_all &= holds_here;

            let b = sim.find_node_index_by_id(partner).unwrap();
            if a < b {
                edges += 1;
                let other_slot =
                    sim.nodes[b].cm.find_mesh_slot_to_partner(sim.nodes[a].id).unwrap();
                let holds_there = sim.nodes[b]
                    .cm
                    .get(other_slot)
                    .unwrap()
                    .mesh()
                    .unwrap()
                    .connection_master_bit;
                assert!(
                    holds_here ^ holds_there,
                    "edge {}-{} must have exactly one master bit",
                    sim.nodes[a].id,
                    sim.nodes[b].id
                );
            }
        }
        if has_conn && holds_all {
            nodes_with_all_bits += 1;
        }
    }
    // A tree over three nodes has two edges.
    assert_eq!(edges, 2);
    assert_eq!(nodes_with_all_bits, 1, "exactly one cluster master expected");
}

#[test]
fn hops_to_sink_converge() {
    let config = SimConfig { seed: 77, num_nodes: 4, ..close_pair_config() };
    let mut sim = Simulator::new(config);
    place_close(&mut sim);

    assert!(run_until(&mut sim, 120_000, |s| s.is_clustering_done()));
    // Let pending cluster-info-updates carry the hop counts around.
    let deadline = sim.sim_time_ms() + 20_000;
    run_until(&mut sim, deadline, |_| false);

    assert_eq!(sim.nodes[0].hops_to_sink(), 0, "the sink is its own sink");
    for node in sim.nodes.iter().skip(1) {
        let hops = node.hops_to_sink();
        assert!(hops >= 1, "node {} has no route to the sink", node.id);
        assert!(hops < 4, "node {} routes too far: {}", node.id, hops);
    }
}

#[test]
fn free_slot_invariant_holds_every_tick() {
    let config = SimConfig { seed: 3, num_nodes: 5, ..close_pair_config() };
    let mut sim = Simulator::new(config);
    place_close(&mut sim);

    for _ in 0..2000 {
        sim.step_all_nodes();
        for node in &sim.nodes {
            let active_in = node
                .cm
                .mesh_slots()
                .into_iter()
                .filter(|&s| {
                    node.cm.get(s).map(|c| c.direction == meshsim::ConnectionDirection::In).unwrap_or(false)
                })
                .count() as u8;
            let active_out = node
                .cm
                .mesh_slots()
                .into_iter()
                .filter(|&s| {
                    node.cm.get(s).map(|c| c.direction == meshsim::ConnectionDirection::Out).unwrap_or(false)
                })
                .count() as u8;
            assert_eq!(
                node.cm.free_mesh_in() + active_in,
                meshsim::config::MAX_MESH_IN_CONNECTIONS as u8,
                "node {} mesh-in accounting broken",
                node.id
            );
            assert_eq!(
                node.cm.free_mesh_out() + active_out,
                meshsim::config::MAX_MESH_OUT_CONNECTIONS as u8,
                "node {} mesh-out accounting broken",
                node.id
            );
        }
    }
}

#[test]
fn master_bit_handover_flips_sides() {
    let mut sim = Simulator::new(close_pair_config());
    place_close(&mut sim);
    assert!(run_until(&mut sim, 10_000, |s| s.is_clustering_done()));

    // Find the holder and hand the bit over.
    let holder = (0..2)
        .find(|&i| sim.nodes[i].cm.master_bit_count() == 1)
        .expect("someone must hold the master bit");
    let other = 1 - holder;
    let slot = sim.nodes[holder].cm.handshaked_mesh_slots()[0];

    // Drive the handover through the node itself.
    let counters = &mut sim.counters;
    sim.nodes[holder].handover_master_bit(slot, counters);
    assert_eq!(sim.nodes[holder].cm.master_bit_count(), 0);

    // The update travels with vital priority and flips the partner's bit.
    let deadline = sim.sim_time_ms() + 5_000;
    run_until(&mut sim, deadline, |_| false);
    assert_eq!(sim.nodes[other].cm.master_bit_count(), 1);
    assert_eq!(sim.nodes[holder].cm.master_bit_count(), 0);
}
