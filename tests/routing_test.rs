//! Message routing: loopback, broadcast, hops, sink routing, splits and
//! minimum-length validation.

use meshsim::proto::{ConnPacketHeader, MessageType, ModulePacket, TimeSyncPacket, TimeSyncType};
use meshsim::types::{
    NODE_ID_BROADCAST, NODE_ID_HOPS_BASE, NODE_ID_LOCAL_LOOPBACK, NODE_ID_SHORTEST_SINK,
};
use meshsim::{SimConfig, Simulator};

fn config(nodes: usize) -> SimConfig {
    SimConfig {
        seed: 9,
        num_nodes: nodes,
        map_width_in_meters: 100.0,
        map_height_in_meters: 100.0,
        sink_node_index: Some(0),
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
    let deadline = sim.sim_time_ms() + 120_000;
    while sim.sim_time_ms() < deadline && !sim.is_clustering_done() {
        sim.step_all_nodes();
    }
    assert!(sim.is_clustering_done(), "precondition: mesh must be clustered");
}

fn raw_data_packet(sender: u16, receiver: u16, payload: Vec<u8>) -> Vec<u8> {
    ModulePacket {
        header: ConnPacketHeader::new(MessageType::ModuleRawDataLight, sender, receiver),
        module_id: 13,
        request_handle: 0,
        action_type: 0,
        data: payload,
    }
    .encode()
}

#[test]
fn loopback_is_rewritten_to_local_id() {
    let mut sim = Simulator::new(config(2));
    cluster(&mut sim);

    let own_id = sim.nodes[0].id;
    let packet = raw_data_packet(own_id, NODE_ID_LOCAL_LOOPBACK, vec![1, 2, 3]);
    sim.nodes[0].send_mesh_message(&packet, &mut sim.counters);

    let message = sim.nodes[0]
        .received_messages
        .iter()
        .find(|m| m.message_type == MessageType::ModuleRawDataLight)
        .expect("loopback must dispatch locally");
    assert_eq!(message.receiver, own_id, "loopback receiver must be rewritten");

    // Nothing arrives at the partner.
    run_ms(&mut sim, 3_000);
    assert!(sim.nodes[1]
        .received_messages
        .iter()
        .all(|m| m.message_type != MessageType::ModuleRawDataLight));
}

#[test]
fn broadcast_reaches_every_node_once() {
    let mut sim = Simulator::new(config(4));
    cluster(&mut sim);

    let sender_id = sim.nodes[0].id;
    let packet = raw_data_packet(sender_id, NODE_ID_BROADCAST, vec![0xAB; 8]);
    sim.nodes[0].send_mesh_message(&packet, &mut sim.counters);
    run_ms(&mut sim, 10_000);

    for node in sim.nodes.iter().skip(1) {
        let copies = node
            .received_messages
            .iter()
            .filter(|m| {
                m.message_type == MessageType::ModuleRawDataLight && m.sender == sender_id
            })
            .count();
        assert_eq!(copies, 1, "node {} saw {} copies", node.id, copies);
    }
}

#[test]
fn hops_receiver_is_decremented_per_hop() {
    let mut sim = Simulator::new(config(2));
    cluster(&mut sim);

    let sender_id = sim.nodes[0].id;
    let packet = raw_data_packet(sender_id, NODE_ID_HOPS_BASE + 2, vec![7]);
    sim.nodes[0].send_mesh_message(&packet, &mut sim.counters);
    run_ms(&mut sim, 5_000);

    let message = sim.nodes[1]
        .received_messages
        .iter()
        .find(|m| m.message_type == MessageType::ModuleRawDataLight)
        .expect("one-hop neighbor must receive the packet");
    // Dispatch sees the arrival value; the decrement applies to the copy
    // forwarded onwards.
    assert_eq!(message.receiver, NODE_ID_HOPS_BASE + 2);
}

#[test]
fn shortest_sink_routing_reaches_the_sink() {
    let mut sim = Simulator::new(config(3));
    // A line: node 1 cannot hear node 3 directly.
    sim.nodes[0].impossible_connections.push(2);
    sim.nodes[2].impossible_connections.push(0);
    cluster(&mut sim);
    // Wait for hop gossip to settle.
    run_ms(&mut sim, 30_000);

    let sender_id = sim.nodes[2].id;
    let packet = raw_data_packet(sender_id, NODE_ID_SHORTEST_SINK, vec![0x51]);
    sim.nodes[2].send_mesh_message(&packet, &mut sim.counters);
    run_ms(&mut sim, 10_000);

    let sink_got = sim.nodes[0]
        .received_messages
        .iter()
        .any(|m| m.message_type == MessageType::ModuleRawDataLight && m.sender == sender_id);
    assert!(sink_got, "the sink never received the packet");

    // The relay node forwards but the message is not addressed to it.
    assert_eq!(sim.nodes[0].hops_to_sink(), 0);
    assert!(sim.nodes[1].hops_to_sink() >= 1);
}

#[test]
fn long_messages_split_and_reassemble() {
    let mut sim = Simulator::new(config(2));
    cluster(&mut sim);

    // Far above the 63-byte MTU, forcing several split chunks.
    let payload: Vec<u8> = (0..150).map(|i| i as u8).collect();
    let sender_id = sim.nodes[0].id;
    let packet = raw_data_packet(sender_id, sim.nodes[1].id, payload.clone());
    sim.nodes[0].send_mesh_message(&packet, &mut sim.counters);
    run_ms(&mut sim, 10_000);

    let message = sim.nodes[1]
        .received_messages
        .iter()
        .find(|m| m.message_type == MessageType::ModuleRawDataLight)
        .expect("split message must be reassembled and dispatched");
    let received = ModulePacket::decode(&message.data).unwrap();
    assert_eq!(received.data, payload, "payload must survive splitting");
}

#[test]
fn undersized_messages_are_dropped() {
    let mut sim = Simulator::new(config(2));
    cluster(&mut sim);

    // A time-sync frame needs 18 bytes; send only the 6-byte prefix.
    let own_id = sim.nodes[0].id;
    let full = TimeSyncPacket {
        header: ConnPacketHeader::new(MessageType::TimeSync, own_id, own_id),
        sync_type: TimeSyncType::Initial,
        sync_time_s: 0,
        time_since_sync_ds: 0,
        correction_ticks: 0,
    }
    .encode();
    let truncated = &full[..6];

    let dropped_before = sim.nodes[0].cm.dropped_mesh_packets;
    sim.nodes[0].send_mesh_message(truncated, &mut sim.counters);
    assert_eq!(sim.nodes[0].cm.dropped_mesh_packets, dropped_before + 1);
    assert!(sim.nodes[0]
        .received_messages
        .iter()
        .all(|m| m.message_type != MessageType::TimeSync));
}

#[test]
fn time_sync_propagates_to_all_nodes() {
    let mut sim = Simulator::new(config(4));
    cluster(&mut sim);

    sim.send_uart_command(1, "settime 1560262597 0");
    run_ms(&mut sim, 60_000);

    let times: Vec<u32> = sim.nodes.iter().map(|n| n.time.unix_time_s()).collect();
    for (i, t) in times.iter().enumerate() {
        // June 2019; every node must be inside the same second range.
        assert!(
            *t >= 1_560_262_597,
            "node {} clock not set: {}",
            sim.nodes[i].id,
            t
        );
    }
    let min = times.iter().min().unwrap();
    let max = times.iter().max().unwrap();
    assert!(max - min <= 1, "node clocks differ by more than one second");
}
