//! Clustering consistency check.
//!
//! After each tick, the validator predicts what every node's cluster size
//! will be once all in-flight cluster-info-updates have been applied and
//! compares that against the actual size of the connected component. A
//! mismatch hints at lost or double-applied updates and is logged, never
//! fatal.

use crate::ble::BleEventKind;
use crate::proto::{ClusterInfoUpdate, ConnPacketHeader, MessageType};
use tracing::warn;

use super::Simulator;

/// One handshaked link between two nodes, as seen from both ends.
#[derive(Debug, Clone, Copy)]
struct Bond {
    node_a: usize,
    node_b: usize,
}

pub fn check_meshing_consistency(sim: &mut Simulator) {
    let bonds = collect_bonds(sim);
    let num_nodes = sim.config.num_nodes;

    for index in 0..num_nodes {
        let real_size = component_size(&bonds, index, None);

        // Sum every in-flight delta that will eventually arrive at this node:
        // a delta traveling A -> B is applied at B and then forwarded through
        // B's subtree, so it counts for every node on B's side of the edge.
        let mut pending: i32 = 0;
        for bond in &bonds {
            for (from, to) in [(bond.node_a, bond.node_b), (bond.node_b, bond.node_a)] {
                let delta = in_flight_delta(sim, from, to);
                if delta != 0 && on_side_of(&bonds, index, to, (from, to)) {
                    pending += delta as i32;
                }
            }
        }

        let believed = sim.nodes[index].cluster_size as i32 + pending;
        if believed != real_size as i32 {
            warn!(
                node = sim.nodes[index].id,
                real = real_size,
                believed,
                local = sim.nodes[index].cluster_size,
                pending,
                "potential clustering mismatch"
            );
        }
    }
}

/// Links where both sides have a handshaked mesh connection to each other.
fn collect_bonds(sim: &Simulator) -> Vec<Bond> {
    let mut bonds = Vec::new();
    for a in 0..sim.config.num_nodes {
        for b in (a + 1)..sim.config.num_nodes {
            let id_a = sim.nodes[a].id;
            let id_b = sim.nodes[b].id;
            let a_to_b = sim.nodes[a].cm.find_mesh_slot_to_partner(id_b).is_some();
            let b_to_a = sim.nodes[b].cm.find_mesh_slot_to_partner(id_a).is_some();
            if a_to_b && b_to_a {
                bonds.push(Bond { node_a: a, node_b: b });
            }
        }
    }
    bonds
}

/// Size of the connected component containing `start`, optionally with one
/// edge removed.
fn component_size(bonds: &[Bond], start: usize, removed_edge: Option<(usize, usize)>) -> usize {
    let mut visited = vec![start];
    let mut queue = vec![start];
    while let Some(current) = queue.pop() {
        for bond in bonds {
            let skip = removed_edge
                .map(|(x, y)| {
                    (bond.node_a == x && bond.node_b == y) || (bond.node_a == y && bond.node_b == x)
                })
                .unwrap_or(false);
            if skip {
                continue;
            }
            let neighbor = if bond.node_a == current {
                bond.node_b
            } else if bond.node_b == current {
                bond.node_a
            } else {
                continue;
            };
            if !visited.contains(&neighbor) {
                visited.push(neighbor);
                queue.push(neighbor);
            }
        }
    }
    visited.len()
}

/// Whether `node` lies on `to`'s side when the edge `(from, to)` is cut.
fn on_side_of(bonds: &[Bond], node: usize, to: usize, edge: (usize, usize)) -> bool {
    let mut visited = vec![to];
    let mut queue = vec![to];
    while let Some(current) = queue.pop() {
        if current == node {
            return true;
        }
        for bond in bonds {
            if (bond.node_a == edge.0 && bond.node_b == edge.1)
                || (bond.node_a == edge.1 && bond.node_b == edge.0)
            {
                continue;
            }
            let neighbor = if bond.node_a == current {
                bond.node_b
            } else if bond.node_b == current {
                bond.node_a
            } else {
                continue;
            };
            if !visited.contains(&neighbor) {
                visited.push(neighbor);
                queue.push(neighbor);
            }
        }
    }
    node == to
}

/// Sums the cluster-size deltas currently traveling from `from` to `to`:
/// the coalescing slot, queued-but-not-yet-handed messages, packets in the
/// softdevice buffers, and writes already in the receiver's event queue.
fn in_flight_delta(sim: &Simulator, from: usize, to: usize) -> i16 {
    let to_id = sim.nodes[to].id;
    let Some(slot) = sim.nodes[from].cm.find_mesh_slot_to_partner(to_id) else {
        return 0;
    };
    let Some(conn) = sim.nodes[from].cm.get(slot) else { return 0 };
    let mut delta = 0i16;

    if let Some(mesh) = conn.mesh() {
        delta += mesh.cluster_info_update.cluster_size_change;
    }

    // Queued messages not yet handed to the softdevice; handed ones are
    // counted through the buffers instead.
    for msg in conn.queue.iter_messages() {
        if msg.sent_chunks == 0 {
            if let Some(update) = decode_update(&msg.data) {
                delta += update.cluster_size_change;
            }
        }
    }

    let conn_handle = conn.connection_handle;
    if let Some(sd_idx) = sim.nodes[from].sd.find_connection_by_handle(conn_handle) {
        let sd_conn = &sim.nodes[from].sd.connections[sd_idx];
        for packet in sd_conn
            .unreliable_buffers
            .iter()
            .flatten()
            .chain(sd_conn.reliable_buffer.iter())
        {
            if let Some(update) = decode_update(&packet.data) {
                delta += update.cluster_size_change;
            }
        }
    }

    for event in sim.nodes[to].event_queue.iter() {
        if let BleEventKind::GattsWrite { conn_handle: h, data, .. } = &event.kind {
            if *h == conn_handle {
                if let Some(update) = decode_update(data) {
                    delta += update.cluster_size_change;
                }
            }
        }
    }

    delta
}

fn decode_update(data: &[u8]) -> Option<ClusterInfoUpdate> {
    let header = ConnPacketHeader::decode(data)?;
    if header.message_type != MessageType::ClusterInfoUpdate {
        return None;
    }
    ClusterInfoUpdate::decode(data)
}
