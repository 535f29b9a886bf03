//! Clustering protocol on mesh connections.
//!
//! The welcome/ack1/ack2 handshake merges two clusters; the coalescing
//! cluster-info-update keeps sizes and the master bit consistent afterwards;
//! the reconnect handshake restores a dropped link without redoing the full
//! clustering handshake.

use crate::node::{Node, SimCounters};
use crate::proto::{
    ClusterAck1, ClusterAck2, ClusterWelcome, ConnPacketHeader, MessageType, Reconnect,
    TimeSyncPacket, TimeSyncType,
};
use crate::types::{
    AppDisconnectReason, ClusterId, ClusterSize, ConnectionDirection, ConnectionState,
    DeliveryOption, DeliveryPriority, DeviceType, HciError, NodeId, NODE_ID_HOPS_BASE,
};

use super::connection::TimeSyncState;
use super::manager::ConnectionManager;

use crate::config::{GAP_CONNECTING_TIMEOUT_DS, MESH_CONNECTION_INTERVAL_MS};
use tracing::{debug, warn};

// Live-report fail codes for the clustering handshake.
const LIVE_REPORT_HANDSHAKE_FAIL: u8 = 105;
const HANDSHAKE_FAIL_SAME_CLUSTER_ID: u8 = 1;
const HANDSHAKE_FAIL_NETWORK_ID_MISMATCH: u8 = 2;
const HANDSHAKE_FAIL_WRONG_DIRECTION: u8 = 3;
const HANDSHAKE_FAIL_UNPREFERRED: u8 = 4;

impl Node {
    /// Emits the live-report line consumed by log harnesses whenever a
    /// clustering handshake fails.
    fn live_report_handshake_fail(&mut self, partner: NodeId, fail_code: u8) {
        self.json_log.push(format!(
            "{{\"type\":\"live_report\",\"nodeId\":{},\"code\":{},\"extra\":{},\"extra2\":{}}}",
            self.config.node_id, LIVE_REPORT_HANDSHAKE_FAIL, partner, fail_code
        ));
    }

    // =========================================================================
    // HANDSHAKE, CENTRAL SIDE
    // =========================================================================

    /// Starts the clustering handshake after the GAP link and MTU are up.
    pub(crate) fn start_mesh_handshake(&mut self, slot: usize, counters: &mut SimCounters) {
        let cluster_id = self.cluster_id;
        let cluster_size = self.cluster_size;
        let hops = self.hops_to_sink_excluding(Some(slot));
        let network_id = self.config.network_id;
        let sender = self.config.node_id;

        let Some(conn) = self.cm.get_mut(slot) else { return };
        if conn.state >= ConnectionState::Handshaking {
            return;
        }
        conn.state = ConnectionState::Handshaking;
        conn.handshake_started_ds = self.app_timer_ds;
        let partner_write_handle;
        {
            let mesh = conn.mesh_mut().unwrap();
            // The handshake works on a snapshot; concurrent changes are
            // delivered as updates afterwards.
            mesh.cluster_id_backup = cluster_id;
            mesh.cluster_size_backup = cluster_size;
            mesh.cluster_info_update = Default::default();
            partner_write_handle = mesh.partner_write_characteristic_handle;
        }

        let packet = ClusterWelcome {
            // The partner's node id is unknown; one hop reaches exactly it.
            header: ConnPacketHeader::new(MessageType::ClusterWelcome, sender, NODE_ID_HOPS_BASE + 1),
            cluster_id,
            cluster_size,
            mesh_write_handle: crate::ble::MESH_WRITE_CHARACTERISTIC_HANDLE,
            hops_to_sink: hops,
            preferred_connection_interval: 0,
            network_id,
        };
        debug!(
            node = sender,
            cluster_id, cluster_size, hops, "handshake starting, sending welcome"
        );
        self.send_handshake_message(slot, packet.encode(), true, partner_write_handle, counters);
    }

    /// Queues a packet no matter whether the handshake is done.
    fn send_handshake_message(
        &mut self,
        slot: usize,
        data: Vec<u8>,
        reliable: bool,
        characteristic_handle: u16,
        counters: &mut SimCounters,
    ) -> bool {
        let Some(conn) = self.cm.get(slot) else { return false };
        if !conn.is_connected() {
            return false;
        }
        let delivery = if reliable { DeliveryOption::WriteReq } else { DeliveryOption::WriteCmd };
        self.send_on_connection(slot, data, delivery, characteristic_handle, DeliveryPriority::High, counters)
            .is_some()
    }

    /// Sends application data over a handshaked mesh connection.
    pub(crate) fn mesh_send_data(
        &mut self,
        slot: usize,
        data: &[u8],
        _reliable: bool,
        counters: &mut SimCounters,
    ) -> bool {
        let Some(conn) = self.cm.get(slot) else { return false };
        if !conn.handshake_done() {
            return false;
        }
        let Some(mesh) = conn.mesh() else { return false };
        let handle = mesh.partner_write_characteristic_handle;
        // Write requests stall the whole connection event; only the clustering
        // handshake is worth that, everything else goes as write commands.
        self.send_on_connection(
            slot,
            data.to_vec(),
            DeliveryOption::WriteCmd,
            handle,
            DeliveryPriority::Medium,
            counters,
        )
        .is_some()
    }

    // =========================================================================
    // VITAL PRIORITY SLOT
    // =========================================================================

    /// Flushes the coalescing cluster-info-update ahead of the normal queue.
    pub(crate) fn queue_vital_prio_data(&mut self, slot: usize) {
        let own_id = self.config.node_id;
        let hops = self.hops_to_sink_excluding(Some(slot));
        let Some(conn) = self.cm.get_mut(slot) else { return };
        if !conn.handshake_done() {
            return;
        }
        let Some(mesh) = conn.mesh() else { return };
        if !mesh.cluster_info_update.has_data() {
            return;
        }
        let counter = conn.cluster_update_counter ^ 1;
        let characteristic_handle = mesh.partner_write_characteristic_handle;
        let message_handle = conn.fresh_message_handle();

        let mesh = conn.mesh_mut().unwrap();
        let packet = mesh.cluster_info_update.drain(own_id, counter, hops);
        let encoded = packet.encode();

        if conn.queue.queue_data(
            DeliveryPriority::Vital,
            DeliveryOption::WriteCmd,
            characteristic_handle,
            encoded,
            message_handle,
        ) {
            conn.cluster_update_counter = counter;
            debug!(node = own_id, slot, change = packet.cluster_size_change, "queued cluster update");
        } else {
            // Queue full: put the data back so nothing is lost.
            warn!(node = own_id, slot, "vital priority queue full");
            let mesh = conn.mesh_mut().unwrap();
            mesh.cluster_info_update.merge(
                packet.new_cluster_id,
                packet.cluster_size_change,
                packet.connection_master_bit_handover,
                packet.hops_to_sink,
            );
        }
    }

    // =========================================================================
    // RECEIVE
    // =========================================================================

    pub(crate) fn receive_mesh_data(
        &mut self,
        slot: usize,
        characteristic_handle: u16,
        data: &[u8],
        counters: &mut SimCounters,
    ) {
        if characteristic_handle != crate::ble::MESH_WRITE_CHARACTERISTIC_HANDLE {
            return;
        }
        let Some(conn) = self.cm.get_mut(slot) else { return };
        let Some(message) = conn.reassemble(data) else { return };
        let state = conn.state;

        if state == ConnectionState::Connected
            || state == ConnectionState::Handshaking
            || state == ConnectionState::ReestablishingHandshake
        {
            self.receive_handshake_packet(slot, &message, counters);
        } else if state == ConnectionState::HandshakeDone {
            self.receive_mesh_message(slot, &message, counters);
        }
    }

    fn receive_handshake_packet(&mut self, slot: usize, data: &[u8], counters: &mut SimCounters) {
        let Some(header) = ConnPacketHeader::decode(data) else { return };
        match header.message_type {
            MessageType::Reconnect => {
                if let Some(packet) = Reconnect::decode(data) {
                    self.receive_reconnect_packet(slot, &packet, counters);
                }
            }
            MessageType::ClusterWelcome => {
                if let Some(packet) = ClusterWelcome::decode(data) {
                    let has_network_id = ClusterWelcome::has_network_id(data);
                    self.receive_cluster_welcome(slot, &packet, has_network_id, counters);
                }
            }
            MessageType::ClusterAck1 => {
                if let Some(packet) = ClusterAck1::decode(data) {
                    self.receive_cluster_ack1(slot, &packet, counters);
                }
            }
            MessageType::ClusterAck2 => {
                if let Some(packet) = ClusterAck2::decode(data) {
                    self.receive_cluster_ack2(slot, &packet, counters);
                }
            }
            _ => {
                warn!(
                    node = self.id,
                    ?header,
                    "non-handshake packet while handshaking"
                );
            }
        }
    }

    /// Peripheral side: the central's cluster offer arrived.
    fn receive_cluster_welcome(
        &mut self,
        slot: usize,
        packet: &ClusterWelcome,
        has_network_id: bool,
        counters: &mut SimCounters,
    ) {
        let own_cluster_id = self.cluster_id;
        let own_cluster_size = self.cluster_size;
        let own_network_id = self.config.network_id;
        let own_id = self.config.node_id;
        let is_sink = self.is_sink();

        let Some(conn) = self.cm.get_mut(slot) else { return };
        conn.state = ConnectionState::Handshaking;
        conn.handshake_started_ds = self.app_timer_ds;
        let direction = conn.direction;
        {
            let mesh = conn.mesh_mut().unwrap();
            mesh.partner_write_characteristic_handle = packet.mesh_write_handle;
            mesh.cluster_id_backup = own_cluster_id;
            mesh.cluster_size_backup = own_cluster_size;
            mesh.cluster_info_update = Default::default();
        }
        debug!(
            node = own_id,
            from = packet.header.sender,
            cluster_id = packet.cluster_id,
            cluster_size = packet.cluster_size,
            "received cluster welcome"
        );

        if packet.cluster_id == own_cluster_id {
            // Two nodes of one cluster must never handshake again.
            self.disconnect_and_remove(slot, AppDisconnectReason::SameClusterId, counters);
            self.live_report_handshake_fail(packet.header.sender, HANDSHAKE_FAIL_SAME_CLUSTER_ID);
        } else if packet.cluster_size < own_cluster_size {
            // We are the bigger cluster; the partner should have connected to
            // us as central instead.
            if direction == ConnectionDirection::In {
                self.disconnect_and_remove(slot, AppDisconnectReason::WrongDirection, counters);
                self.live_report_handshake_fail(packet.header.sender, HANDSHAKE_FAIL_WRONG_DIRECTION);
            }
        } else if has_network_id && packet.network_id != own_network_id {
            self.disconnect_and_remove(slot, AppDisconnectReason::NetworkIdMismatch, counters);
            self.live_report_handshake_fail(packet.header.sender, HANDSHAKE_FAIL_NETWORK_ID_MISMATCH);
        } else if self.preferred_connections_ignore_others
            && !self.preferred_connections.is_empty()
            && !self.preferred_connections.contains(&packet.header.sender)
        {
            self.disconnect_and_remove(slot, AppDisconnectReason::UnpreferredConnection, counters);
            self.live_report_handshake_fail(packet.header.sender, HANDSHAKE_FAIL_UNPREFERRED);
        } else {
            // We are the smaller cluster and join the partner's cluster.
            let partner_write_handle;
            {
                let conn = self.cm.get_mut(slot).unwrap();
                conn.partner_id = packet.header.sender;
                partner_write_handle =
                    conn.mesh().unwrap().partner_write_characteristic_handle;
            }
            let ack = ClusterAck1 {
                header: ConnPacketHeader::new(MessageType::ClusterAck1, own_id, packet.header.sender),
                hops_to_sink: if is_sink { 0 } else { -1 },
            };
            self.send_handshake_message(slot, ack.encode(), true, partner_write_handle, counters);

            // Leaving the old cluster: drop every other mesh connection.
            self.force_disconnect_other_mesh_connections(
                slot,
                AppDisconnectReason::IAmSmaller,
                counters,
            );

            // Fresh starting point in case the ACK2 never arrives. The real
            // values follow with the ACK2.
            self.cluster_size = 1;
            self.cluster_id = self.generate_cluster_id();
        }
    }

    /// Central side: the partner confirmed it joins our cluster.
    fn receive_cluster_ack1(&mut self, slot: usize, packet: &ClusterAck1, counters: &mut SimCounters) {
        let own_id = self.config.node_id;
        let in_handshake = self.cm.connection_in_handshake_state();
        let Some(conn) = self.cm.get_mut(slot) else { return };
        {
            let mesh = conn.mesh_mut().unwrap();
            if mesh.ack1_seen || in_handshake != Some(slot) {
                warn!(node = own_id, slot, "duplicate or misplaced ACK1");
            }
            mesh.ack1_seen = true;
        }
        conn.partner_id = packet.header.sender;

        // The winner of the merge holds the master bit for this link.
        let cluster_id_backup;
        let cluster_size_backup;
        {
            let mesh = conn.mesh_mut().unwrap();
            mesh.connection_master_bit = true;
            mesh.hops_to_sink = packet.hops_to_sink;
            cluster_id_backup = mesh.cluster_id_backup;
            cluster_size_backup = mesh.cluster_size_backup;
        }
        debug!(node = own_id, partner = packet.header.sender, "ACK1 received, master bit created");

        let partner_write_handle = conn.mesh().unwrap().partner_write_characteristic_handle;
        let hops = self.hops_to_sink_excluding(Some(slot));
        let ack2 = ClusterAck2 {
            header: ConnPacketHeader::new(MessageType::ClusterAck2, own_id, packet.header.sender),
            cluster_id: cluster_id_backup,
            // One more for the node that just joined.
            cluster_size: cluster_size_backup + 1,
            hops_to_sink: hops,
        };
        self.send_handshake_message(slot, ack2.encode(), true, partner_write_handle, counters);

        self.handshake_done(slot, true, None, counters);
    }

    /// Peripheral side: we received our new cluster identity.
    fn receive_cluster_ack2(&mut self, slot: usize, packet: &ClusterAck2, counters: &mut SimCounters) {
        let own_id = self.config.node_id;
        let in_handshake = self.cm.connection_in_handshake_state();
        let Some(conn) = self.cm.get_mut(slot) else { return };
        {
            let mesh = conn.mesh_mut().unwrap();
            if mesh.ack2_seen || in_handshake != Some(slot) {
                warn!(node = own_id, slot, "duplicate or misplaced ACK2");
            }
            mesh.ack2_seen = true;
        }
        debug!(
            node = own_id,
            cluster_id = packet.cluster_id,
            cluster_size = packet.cluster_size,
            "ACK2 received"
        );
        self.handshake_done(slot, false, Some(*packet), counters);
    }

    /// Common end of the clustering handshake.
    fn handshake_done(
        &mut self,
        slot: usize,
        as_winner: bool,
        ack2: Option<ClusterAck2>,
        counters: &mut SimCounters,
    ) {
        let own_id = self.config.node_id;
        let conn_handle;
        {
            let Some(conn) = self.cm.get_mut(slot) else { return };
            conn.state = ConnectionState::HandshakeDone;
            conn.connection_handshaked_timestamp_ds = self.app_timer_ds;
            conn_handle = conn.connection_handle;
        }
        self.cm.pending_connection = None;
        // Status reporting samples the RSSI of established mesh links.
        if let Some(sd_idx) = self.sd.find_connection_by_handle(conn_handle) {
            self.sd.connections[sd_idx].rssi_measurement_active = true;
        }

        if as_winner {
            // The joining side always arrives as a cluster of one.
            self.cluster_size += 1;
            let cluster_id = self.cluster_id;
            {
                let conn = self.cm.get_mut(slot).unwrap();
                let mesh = conn.mesh_mut().unwrap();
                mesh.connected_cluster_id = cluster_id;
                mesh.connected_cluster_size = 1;
            }
            self.send_cluster_info_update_to_others(Some(slot), 0, 1, counters);
        } else if let Some(ack2) = ack2 {
            self.cluster_id = ack2.cluster_id;
            self.cluster_size = ack2.cluster_size;
            let conn = self.cm.get_mut(slot).unwrap();
            conn.partner_id = ack2.header.sender;
            let mesh = conn.mesh_mut().unwrap();
            mesh.connected_cluster_id = ack2.cluster_id;
            mesh.connected_cluster_size = ack2.cluster_size - 1;
            mesh.hops_to_sink = ack2.hops_to_sink;
        }

        debug!(
            node = own_id,
            cluster_id = self.cluster_id,
            cluster_size = self.cluster_size,
            as_winner,
            "mesh handshake done"
        );
        self.refresh_advertising();
    }

    /// Drops every other mesh connection, e.g. when joining a bigger cluster.
    pub(crate) fn force_disconnect_other_mesh_connections(
        &mut self,
        except_slot: usize,
        reason: AppDisconnectReason,
        counters: &mut SimCounters,
    ) {
        for other in self.cm.mesh_slots() {
            if other != except_slot {
                self.disconnect_and_remove(other, reason, counters);
            }
        }
    }

    // =========================================================================
    // MESH MESSAGES AFTER HANDSHAKE
    // =========================================================================

    fn receive_mesh_message(&mut self, slot: usize, data: &[u8], counters: &mut SimCounters) {
        let Some(header) = ConnPacketHeader::decode(data) else { return };
        match header.message_type {
            MessageType::ClusterInfoUpdate => {
                if let Some(packet) = crate::proto::ClusterInfoUpdate::decode(data) {
                    self.receive_cluster_info_update(slot, &packet, counters);
                }
            }
            MessageType::Reconnect => {
                // Duplicate reconnect after both sides already recovered.
            }
            _ => {
                self.route_mesh_data(slot, data, counters);
                self.dispatch_mesh_message(Some(slot), data, false, counters);
            }
        }
    }

    fn receive_cluster_info_update(
        &mut self,
        slot: usize,
        packet: &crate::proto::ClusterInfoUpdate,
        counters: &mut SimCounters,
    ) {
        {
            let Some(conn) = self.cm.get_mut(slot) else { return };
            if packet.counter != conn.next_expected_cluster_update_counter {
                // Replayed send after a reestablishment; already applied.
                debug!(node = self.id, slot, "ignoring replayed cluster update");
                return;
            }
            conn.next_expected_cluster_update_counter ^= 1;

            let mesh = conn.mesh_mut().unwrap();
            mesh.connected_cluster_size += packet.cluster_size_change;
            if packet.connection_master_bit_handover {
                mesh.connection_master_bit = true;
            }
            mesh.hops_to_sink = packet.hops_to_sink;
            if packet.new_cluster_id != 0 {
                mesh.connected_cluster_id = packet.new_cluster_id;
            }
        }

        self.cluster_size += packet.cluster_size_change;
        if packet.new_cluster_id != 0 {
            self.cluster_id = packet.new_cluster_id;
        }
        debug!(
            node = self.id,
            change = packet.cluster_size_change,
            cluster_size = self.cluster_size,
            "applied cluster update"
        );

        if packet.cluster_size_change != 0 || packet.new_cluster_id != 0 {
            self.send_cluster_info_update_to_others(
                Some(slot),
                packet.new_cluster_id,
                packet.cluster_size_change,
                counters,
            );
        }
        self.refresh_advertising();
    }

    /// Merges a delta into the update slot of every other mesh connection.
    pub(crate) fn send_cluster_info_update_to_others(
        &mut self,
        except_slot: Option<usize>,
        new_cluster_id: ClusterId,
        size_change: ClusterSize,
        counters: &mut SimCounters,
    ) {
        for other in self.cm.handshaked_mesh_slots() {
            if Some(other) == except_slot {
                continue;
            }
            let hops = self.hops_to_sink_excluding(Some(other));
            let Some(conn) = self.cm.get_mut(other) else { continue };
            let Some(mesh) = conn.mesh_mut() else { continue };
            mesh.cluster_info_update.merge(new_cluster_id, size_change, false, hops);
            self.fill_transmit_buffers(other, counters);
        }
    }

    /// Hands the master bit of this connection to the partner.
    pub fn handover_master_bit(&mut self, slot: usize, counters: &mut SimCounters) {
        let hops = self.hops_to_sink_excluding(Some(slot));
        let Some(conn) = self.cm.get_mut(slot) else { return };
        let Some(mesh) = conn.mesh_mut() else { return };
        mesh.connection_master_bit = false;
        mesh.cluster_info_update.merge(0, 0, true, hops);
        debug!(node = self.id, slot, "master bit handover queued");
        self.fill_transmit_buffers(slot, counters);
    }

    pub fn hops_to_sink_excluding(&self, exclude_slot: Option<usize>) -> ClusterSize {
        if self.is_sink() {
            0
        } else {
            self.cm.mesh_hops_to_shortest_sink(exclude_slot)
        }
    }

    // =========================================================================
    // DISCONNECT AND REESTABLISHMENT
    // =========================================================================

    /// GAP link dropped. Decides between reestablishment and teardown.
    pub(crate) fn gap_connection_disconnected(
        &mut self,
        conn_handle: u16,
        hci_reason: u8,
        counters: &mut SimCounters,
    ) {
        let Some(slot) = self.cm.find_slot_by_conn_handle(conn_handle) else { return };
        let reestablish_budget = self.reestablishment_timeout_sec_value;
        let app_timer = self.app_timer_ds;
        let is_leaf = self.config.device_type == DeviceType::Leaf;

        let Some(conn) = self.cm.get_mut(slot) else { return };
        conn.state_before_disconnection = conn.state;
        conn.state = ConnectionState::Disconnected;
        conn.disconnected_timestamp_ds = app_timer;
        conn.disconnection_reason = match hci_reason {
            0x08 => HciError::ConnectionTimeout,
            0x13 => HciError::RemoteUserTerminatedConnection,
            0x16 => HciError::LocalHostTerminatedConnection,
            _ => HciError::Success,
        };

        let is_mesh = conn.variant.is_mesh();
        if is_mesh && !(conn.direction == ConnectionDirection::In && is_leaf) {
            // Reestablishment preconditions, all must hold.
            let mut blocked = 0u32;
            if reestablish_budget == 0 {
                blocked |= 1 << 0;
            }
            if conn.state_before_disconnection < ConnectionState::HandshakeDone {
                blocked |= 1 << 1;
            }
            if conn.disconnection_reason == HciError::LocalHostTerminatedConnection {
                blocked |= 1 << 2;
            }
            if conn.disconnection_reason == HciError::RemoteUserTerminatedConnection {
                blocked |= 1 << 3;
            }
            if app_timer.saturating_sub(conn.connection_handshaked_timestamp_ds)
                <= crate::types::sec_to_ds(10)
            {
                blocked |= 1 << 4;
            }

            if blocked == 0 {
                debug!(node = self.id, slot, "trying to reestablish connection");
                conn.state = ConnectionState::Reestablishing;
                if conn.state_before_disconnection == ConnectionState::HandshakeDone {
                    let mesh = conn.mesh_mut().unwrap();
                    mesh.reestablishment_started_ds = app_timer;
                }
                let direction = conn.direction;
                if direction == ConnectionDirection::Out {
                    self.try_reestablishing(slot, counters);
                } else {
                    // Fast advertising guarantees the central finds us again.
                    self.discovery_high = true;
                    self.refresh_advertising();
                }
                return;
            }
            debug!(node = self.id, slot, blocked, "not reestablishing");
        }

        self.disconnect_and_remove(
            slot,
            AppDisconnectReason::GapDisconnectNoReestablishRequested,
            counters,
        );
    }

    pub(crate) fn try_reestablishing(&mut self, slot: usize, counters: &mut SimCounters) {
        let budget = self.reestablishment_timeout_sec_value;
        let Some(conn) = self.cm.get_mut(slot) else { return };
        let address = conn.partner_address;
        if let Some(mesh) = conn.mesh_mut() {
            mesh.must_retry_reestablishing = false;
        }
        if self.sd.connecting_active {
            // The radio is busy with another connect attempt; retried by the
            // connection-manager timer.
            if let Some(mesh) = self.cm.get_mut(slot).and_then(|c| c.mesh_mut()) {
                mesh.must_retry_reestablishing = true;
            }
            return;
        }
        self.gap_connect(
            address,
            MESH_CONNECTION_INTERVAL_MS,
            GAP_CONNECTING_TIMEOUT_DS.max(crate::types::sec_to_ds(budget)),
            counters,
        );
    }

    /// The GAP link to a reestablishing partner is back.
    pub(crate) fn gap_reconnection_successful(
        &mut self,
        slot: usize,
        conn_handle: u16,
        counters: &mut SimCounters,
    ) {
        let own_id = self.config.node_id;
        let Some(conn) = self.cm.get_mut(slot) else { return };
        conn.connection_handle = conn_handle;
        conn.state = ConnectionState::ReestablishingHandshake;
        conn.handshake_started_ds = self.app_timer_ds;
        // Everything not acknowledged goes on air again.
        conn.queue.rollback_look_ahead();
        let partner_id = conn.partner_id;
        let partner_write_handle = conn.mesh().unwrap().partner_write_characteristic_handle;

        debug!(node = own_id, partner = partner_id, "reconnected, sending reconnect packet");
        let packet = Reconnect {
            header: ConnPacketHeader::new(MessageType::Reconnect, own_id, partner_id),
        };
        // Ahead of all rolled-back data.
        self.send_on_connection(
            slot,
            packet.encode(),
            DeliveryOption::WriteCmd,
            partner_write_handle,
            DeliveryPriority::Vital,
            counters,
        );
    }

    fn receive_reconnect_packet(&mut self, slot: usize, packet: &Reconnect, counters: &mut SimCounters) {
        let own_id = self.config.node_id;
        let Some(conn) = self.cm.get_mut(slot) else { return };
        if packet.header.sender != conn.partner_id
            || conn.state != ConnectionState::ReestablishingHandshake
        {
            return;
        }
        let partner_id = conn.partner_id;
        let partner_write_handle = conn.mesh().unwrap().partner_write_characteristic_handle;

        let reply = Reconnect {
            header: ConnPacketHeader::new(MessageType::Reconnect, own_id, partner_id),
        };
        self.send_on_connection(
            slot,
            reply.encode(),
            DeliveryOption::WriteCmd,
            partner_write_handle,
            DeliveryPriority::Vital,
            counters,
        );

        let conn = self.cm.get_mut(slot).unwrap();
        conn.state = ConnectionState::HandshakeDone;
        conn.disconnected_timestamp_ds = 0;
        debug!(node = own_id, partner = partner_id, "reestablishment handshake done");
    }

    /// Node-level bookkeeping after a handshaked mesh connection died.
    pub(crate) fn mesh_connection_disconnected(
        &mut self,
        _state_before: ConnectionState,
        had_master_bit: bool,
        connected_cluster_size: ClusterSize,
        counters: &mut SimCounters,
    ) {
        self.cluster_size -= connected_cluster_size;
        let new_cluster_id = if had_master_bit {
            // We keep the cluster identity; the other side must rename.
            0
        } else {
            let id = self.generate_cluster_id();
            self.cluster_id = id;
            id
        };
        self.send_cluster_info_update_to_others(
            None,
            new_cluster_id,
            -connected_cluster_size,
            counters,
        );
        // Back to aggressive discovery to repair the mesh.
        self.discovery_high = true;
        self.refresh_advertising();
    }

    // =========================================================================
    // TIME SYNC
    // =========================================================================

    /// Periodic driver: pushes every handshaked connection one step further
    /// through the sync protocol.
    pub(crate) fn time_sync_interval(&mut self, counters: &mut SimCounters) {
        let own_id = self.config.node_id;
        for slot in self.cm.handshaked_mesh_slots() {
            let Some(conn) = self.cm.get(slot) else { continue };
            let Some(mesh) = conn.mesh() else { continue };
            let partner = conn.partner_id;
            match mesh.time_sync_state {
                TimeSyncState::Unsynced => {
                    let packet = self.time.initial_message(own_id, partner);
                    {
                        let conn = self.cm.get_mut(slot).unwrap();
                        let mesh = conn.mesh_mut().unwrap();
                        mesh.sync_sending_ordered_ds = self.app_timer_ds;
                    }
                    debug!(node = own_id, partner, "sending time sync initial");
                    self.send_mesh_message(&packet.encode(), counters);
                }
                TimeSyncState::InitialSent => {
                    let correction = self
                        .cm
                        .get(slot)
                        .and_then(|c| c.mesh())
                        .map(|m| m.correction_ticks)
                        .unwrap_or(0);
                    let packet = TimeSyncPacket {
                        header: ConnPacketHeader::new(MessageType::TimeSync, own_id, partner),
                        sync_type: TimeSyncType::Correction,
                        sync_time_s: 0,
                        time_since_sync_ds: 0,
                        correction_ticks: correction,
                    };
                    debug!(node = own_id, partner, correction, "sending time sync correction");
                    self.send_mesh_message(&packet.encode(), counters);
                }
                TimeSyncState::CorrectionSent => {}
            }
        }
    }

    pub(crate) fn handle_time_sync(
        &mut self,
        arrival_slot: Option<usize>,
        packet: &TimeSyncPacket,
        counters: &mut SimCounters,
    ) {
        let own_id = self.config.node_id;
        match packet.sync_type {
            TimeSyncType::Initial => {
                self.time.handle_initial(packet);
                let reply = TimeSyncPacket {
                    header: ConnPacketHeader::new(MessageType::TimeSync, own_id, packet.header.sender),
                    sync_type: TimeSyncType::InitialReply,
                    sync_time_s: 0,
                    time_since_sync_ds: 0,
                    correction_ticks: 0,
                };
                self.send_mesh_message(&reply.encode(), counters);
            }
            TimeSyncType::InitialReply => {
                self.set_time_sync_state_for_sender(packet.header.sender, TimeSyncState::Unsynced, TimeSyncState::InitialSent);
            }
            TimeSyncType::Correction => {
                self.time.handle_correction(packet);
                let reply = TimeSyncPacket {
                    header: ConnPacketHeader::new(MessageType::TimeSync, own_id, packet.header.sender),
                    sync_type: TimeSyncType::CorrectionReply,
                    sync_time_s: 0,
                    time_since_sync_ds: 0,
                    correction_ticks: 0,
                };
                self.send_mesh_message(&reply.encode(), counters);
            }
            TimeSyncType::CorrectionReply => {
                self.set_time_sync_state_for_sender(packet.header.sender, TimeSyncState::InitialSent, TimeSyncState::CorrectionSent);
            }
        }
        let _ = arrival_slot;
    }

    /// Advances the per-connection sync state when the expected reply came;
    /// a reply in an unexpected state restarts that connection's sync.
    fn set_time_sync_state_for_sender(
        &mut self,
        sender: NodeId,
        expected: TimeSyncState,
        next: TimeSyncState,
    ) {
        for slot in self.cm.mesh_slots() {
            let Some(conn) = self.cm.get_mut(slot) else { continue };
            if conn.partner_id != sender {
                continue;
            }
            if let Some(mesh) = conn.mesh_mut() {
                mesh.time_sync_state =
                    if mesh.time_sync_state == expected { next } else { TimeSyncState::Unsynced };
            }
        }
    }

    /// Restarts the sync protocol on every connection, e.g. after `settime`.
    pub fn reset_time_sync(&mut self) {
        for slot in self.cm.mesh_slots() {
            if let Some(mesh) = self.cm.get_mut(slot).and_then(|c| c.mesh_mut()) {
                mesh.time_sync_state = TimeSyncState::Unsynced;
            }
        }
        self.cm.time_since_time_sync_ds = 0;
    }
}

// Convenience accessors used by tests and the validator.
impl ConnectionManager {
    /// Sum of master bits over all handshaked mesh connections.
    pub fn master_bit_count(&self) -> usize {
        self.handshaked_mesh_slots()
            .into_iter()
            .filter(|&i| {
                self.get(i)
                    .and_then(|c| c.mesh())
                    .map(|m| m.connection_master_bit)
                    .unwrap_or(false)
            })
            .count()
    }
}
