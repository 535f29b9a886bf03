//! Connection records.
//!
//! The firmware's connection class hierarchy is flattened into one record
//! with shared fields plus a tagged variant for the type-specific state. A
//! freshly accepted inbound link starts as a `Resolver` until the first write
//! identifies the protocol spoken on it.

use crate::proto::{ClusterInfoUpdate, MessageType, SIZEOF_CONN_PACKET_SPLIT_HEADER};
use crate::types::{
    AppDisconnectReason, BleAddress, ClusterId, ClusterSize, ConnectionDirection, ConnectionState,
    EncryptionState, FmKeyId, HciError, NodeId, TunnelType, MAX_MESH_PACKET_SIZE,
};

use super::queue::ChunkedPriorityQueue;

/// Time-sync progress of a mesh connection, reset on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncState {
    Unsynced,
    InitialSent,
    CorrectionSent,
}

/// The coalescing vital-priority slot holding pending cluster deltas.
///
/// It is neither a queue nor a plain field: deltas accumulate between
/// flushes, and `drain` empties it when the packet was queued successfully.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterInfoUpdateSlot {
    pub new_cluster_id: ClusterId,
    pub cluster_size_change: ClusterSize,
    pub master_bit_handover: bool,
    pub hops_to_sink: ClusterSize,
}

impl ClusterInfoUpdateSlot {
    pub fn merge(
        &mut self,
        new_cluster_id: ClusterId,
        size_change: ClusterSize,
        handover: bool,
        hops_to_sink: ClusterSize,
    ) {
        if new_cluster_id != 0 {
            self.new_cluster_id = new_cluster_id;
        }
        self.cluster_size_change += size_change;
        self.master_bit_handover |= handover;
        self.hops_to_sink = hops_to_sink;
    }

    pub fn has_data(&self) -> bool {
        self.cluster_size_change != 0 || self.master_bit_handover || self.new_cluster_id != 0
    }

    pub fn drain(&mut self, sender: NodeId, counter: u8, hops_to_sink: ClusterSize) -> ClusterInfoUpdate {
        let packet = ClusterInfoUpdate {
            sender,
            new_cluster_id: self.new_cluster_id,
            cluster_size_change: self.cluster_size_change,
            hops_to_sink,
            connection_master_bit_handover: self.master_bit_handover,
            counter,
        };
        *self = ClusterInfoUpdateSlot::default();
        packet
    }
}

/// Mesh-connection specific state.
#[derive(Debug)]
pub struct MeshState {
    pub partner_write_characteristic_handle: u16,
    pub connection_master_bit: bool,
    pub connected_cluster_id: ClusterId,
    pub connected_cluster_size: ClusterSize,
    pub hops_to_sink: ClusterSize,
    pub cluster_id_backup: ClusterId,
    pub cluster_size_backup: ClusterSize,
    pub cluster_info_update: ClusterInfoUpdateSlot,
    pub time_sync_state: TimeSyncState,
    pub correction_ticks: u32,
    /// Timer value when the initial sync message was ordered to be sent.
    pub sync_sending_ordered_ds: u32,
    pub enrolled_nodes_synced: bool,
    pub must_retry_reestablishing: bool,
    pub reestablishment_started_ds: u32,
    /// Guards against duplicate ACK packets within one handshake.
    pub ack1_seen: bool,
    pub ack2_seen: bool,
}

impl MeshState {
    pub fn new(partner_write_characteristic_handle: u16) -> MeshState {
        MeshState {
            partner_write_characteristic_handle,
            connection_master_bit: false,
            connected_cluster_id: 0,
            connected_cluster_size: 0,
            hops_to_sink: -1,
            cluster_id_backup: 0,
            cluster_size_backup: 0,
            cluster_info_update: ClusterInfoUpdateSlot::default(),
            time_sync_state: TimeSyncState::Unsynced,
            correction_ticks: 0,
            sync_sending_ordered_ds: 0,
            enrolled_nodes_synced: false,
            must_retry_reestablishing: false,
            reestablishment_started_ds: 0,
            ack1_seen: false,
            ack2_seen: false,
        }
    }
}

pub const MAX_CORRUPTED_MESSAGES: u32 = 32;

/// Encrypted tunnel specific state.
#[derive(Debug)]
pub struct MeshAccessState {
    pub fm_key_id: FmKeyId,
    pub tunnel_type: TunnelType,
    pub virtual_partner_id: NodeId,
    pub virtual_partner_id_overwritten: bool,
    pub use_custom_key: bool,
    pub custom_key: [u8; 16],
    pub session_encryption_key: [u8; 16],
    pub session_decryption_key: [u8; 16],
    pub encryption_nonce: [u32; 2],
    pub decryption_nonce: [u32; 2],
    pub amount_of_corrupted_messages: u32,
    pub allow_corrupted_encryption_start: bool,
    /// Node id that is told about connection state changes, 0 for none.
    pub connection_state_subscriber_id: NodeId,
    pub scheduled_connection_removal_time_ds: u32,
    pub partner_rx_characteristic_handle: u16,
    pub partner_tx_characteristic_handle: u16,
    pub partner_tx_cccd_handle: u16,
    /// Message handle of the ANONCE; encryption starts once it was sent.
    pub anonce_message_handle: u32,
}

impl MeshAccessState {
    pub fn new(fm_key_id: FmKeyId, tunnel_type: TunnelType) -> MeshAccessState {
        MeshAccessState {
            fm_key_id,
            tunnel_type,
            virtual_partner_id: 0,
            virtual_partner_id_overwritten: false,
            use_custom_key: false,
            custom_key: [0; 16],
            session_encryption_key: [0; 16],
            session_decryption_key: [0; 16],
            encryption_nonce: [0; 2],
            decryption_nonce: [0; 2],
            amount_of_corrupted_messages: 0,
            allow_corrupted_encryption_start: false,
            connection_state_subscriber_id: 0,
            scheduled_connection_removal_time_ds: 0,
            partner_rx_characteristic_handle: 0,
            partner_tx_characteristic_handle: 0,
            partner_tx_cccd_handle: 0,
            anonce_message_handle: 0,
        }
    }
}

/// Type-specific arm of a connection.
#[derive(Debug)]
pub enum ConnectionVariant {
    /// Inbound link whose protocol is not yet known.
    Resolver,
    Mesh(MeshState),
    MeshAccess(MeshAccessState),
}

impl ConnectionVariant {
    pub fn is_mesh(&self) -> bool {
        matches!(self, ConnectionVariant::Mesh(_))
    }
    pub fn is_mesh_access(&self) -> bool {
        matches!(self, ConnectionVariant::MeshAccess(_))
    }
    pub fn is_resolver(&self) -> bool {
        matches!(self, ConnectionVariant::Resolver)
    }
}

/// One connection slot's content.
#[derive(Debug)]
pub struct Connection {
    /// Never 0, never reused.
    pub unique_id: u32,
    /// Pool slot index.
    pub connection_id: u8,
    pub direction: ConnectionDirection,
    pub state: ConnectionState,
    pub state_before_disconnection: ConnectionState,
    pub encryption_state: EncryptionState,
    pub disconnection_reason: HciError,
    pub app_disconnect_reason: AppDisconnectReason,

    pub connection_handle: u16,
    pub partner_address: BleAddress,
    pub partner_id: NodeId,
    pub connection_mtu: u16,
    pub connection_payload_size: u16,

    pub creation_time_ds: u32,
    pub handshake_started_ds: u32,
    pub connection_handshaked_timestamp_ds: u32,
    pub disconnected_timestamp_ds: u32,

    pub last_reported_rssi: i8,
    pub rssi_average_times_1000: i32,

    pub queue: ChunkedPriorityQueue,
    pub next_message_handle: u32,

    /// 1-bit rolling counters for cluster-info-update replay detection.
    pub cluster_update_counter: u8,
    pub next_expected_cluster_update_counter: u8,

    reassembly_buffer: Vec<u8>,
    /// Next expected split counter; 0 means no reassembly in progress.
    reassembly_position: u8,

    pub dropped_packets: u16,
    pub sent_reliable: u16,
    pub sent_unreliable: u16,

    pub variant: ConnectionVariant,
}

impl Connection {
    pub fn new(
        unique_id: u32,
        connection_id: u8,
        direction: ConnectionDirection,
        partner_address: BleAddress,
        creation_time_ds: u32,
        variant: ConnectionVariant,
    ) -> Connection {
        Connection {
            unique_id,
            connection_id,
            direction,
            state: ConnectionState::Connecting,
            state_before_disconnection: ConnectionState::Disconnected,
            encryption_state: EncryptionState::NotEncrypted,
            disconnection_reason: HciError::Success,
            app_disconnect_reason: AppDisconnectReason::Unknown,
            connection_handle: crate::ble::state::BLE_CONN_HANDLE_INVALID,
            partner_address,
            partner_id: 0,
            connection_mtu: crate::types::MAX_DATA_SIZE_PER_WRITE,
            connection_payload_size: crate::types::MAX_DATA_SIZE_PER_WRITE,
            creation_time_ds,
            handshake_started_ds: 0,
            connection_handshaked_timestamp_ds: 0,
            disconnected_timestamp_ds: 0,
            last_reported_rssi: 0,
            rssi_average_times_1000: 0,
            queue: ChunkedPriorityQueue::default(),
            next_message_handle: 1,
            cluster_update_counter: 0,
            next_expected_cluster_update_counter: 1,
            reassembly_buffer: Vec::new(),
            reassembly_position: 0,
            dropped_packets: 0,
            sent_reliable: 0,
            sent_unreliable: 0,
            variant,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state >= ConnectionState::Connected
    }

    pub fn handshake_done(&self) -> bool {
        self.state >= ConnectionState::HandshakeDone
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    pub fn fresh_message_handle(&mut self) -> u32 {
        let h = self.next_message_handle;
        self.next_message_handle += 1;
        h
    }

    pub fn mesh(&self) -> Option<&MeshState> {
        match &self.variant {
            ConnectionVariant::Mesh(m) => Some(m),
            _ => None,
        }
    }

    pub fn mesh_mut(&mut self) -> Option<&mut MeshState> {
        match &mut self.variant {
            ConnectionVariant::Mesh(m) => Some(m),
            _ => None,
        }
    }

    pub fn mesh_access(&self) -> Option<&MeshAccessState> {
        match &self.variant {
            ConnectionVariant::MeshAccess(m) => Some(m),
            _ => None,
        }
    }

    pub fn mesh_access_mut(&mut self) -> Option<&mut MeshAccessState> {
        match &mut self.variant {
            ConnectionVariant::MeshAccess(m) => Some(m),
            _ => None,
        }
    }

    /// Average RSSI as reported to status consumers.
    pub fn average_rssi(&self) -> i8 {
        (self.rssi_average_times_1000 / 1000) as i8
    }

    /// Folds one RSSI sample into the moving average (5% per step).
    pub fn update_rssi_average(&mut self) {
        self.rssi_average_times_1000 =
            (95 * self.rssi_average_times_1000 + 5000 * self.last_reported_rssi as i32) / 100;
    }

    /// Feeds one received chunk through split reassembly.
    ///
    /// Returns the full message once complete, `None` while chunks are still
    /// outstanding. At most one partially received message exists at a time;
    /// a chunk that does not continue the expected sequence drops the whole
    /// message.
    pub fn reassemble(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < SIZEOF_CONN_PACKET_SPLIT_HEADER {
            return None;
        }
        let message_type = MessageType::from_u8(data[0]);
        match message_type {
            MessageType::SplitWriteCmd => {
                let counter = data[1];
                if counter == 0 {
                    self.reassembly_buffer.clear();
                    self.reassembly_position = 0;
                }
                if counter != self.reassembly_position {
                    // A chunk was lost; the message cannot be completed.
                    self.reassembly_buffer.clear();
                    self.reassembly_position = 0;
                    self.dropped_packets += 1;
                    return None;
                }
                if self.reassembly_buffer.len() + data.len() > MAX_MESH_PACKET_SIZE {
                    self.reassembly_buffer.clear();
                    self.reassembly_position = 0;
                    self.dropped_packets += 1;
                    return None;
                }
                self.reassembly_buffer.extend_from_slice(&data[2..]);
                self.reassembly_position += 1;
                None
            }
            MessageType::SplitWriteCmdEnd => {
                let counter = data[1];
                if counter != self.reassembly_position || counter == 0 {
                    self.reassembly_buffer.clear();
                    self.reassembly_position = 0;
                    self.dropped_packets += 1;
                    return None;
                }
                let mut full = std::mem::take(&mut self.reassembly_buffer);
                full.extend_from_slice(&data[2..]);
                self.reassembly_position = 0;
                Some(full)
            }
            _ => {
                // Unsplit message; any half-finished reassembly is stale.
                self.reassembly_buffer.clear();
                self.reassembly_position = 0;
                Some(data.to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::split_message;

    fn test_connection(variant: ConnectionVariant) -> Connection {
        Connection::new(
            1,
            0,
            ConnectionDirection::Out,
            BleAddress::from_node_id(2),
            0,
            variant,
        )
    }

    #[test]
    fn reassembly_roundtrip() {
        let mut conn = test_connection(ConnectionVariant::Resolver);
        let message: Vec<u8> = (0..60).collect();
        let chunks = split_message(&message, 20);
        let mut result = None;
        for chunk in &chunks {
            result = conn.reassemble(chunk);
        }
        assert_eq!(result, Some(message));
        assert_eq!(conn.dropped_packets, 0);
    }

    #[test]
    fn missing_first_chunk_drops_message() {
        let mut conn = test_connection(ConnectionVariant::Resolver);
        let message: Vec<u8> = (0..60).collect();
        let chunks = split_message(&message, 20);
        // Skip chunk 0.
        assert_eq!(conn.reassemble(&chunks[1]), None);
        assert_eq!(conn.reassemble(&chunks[2]), None);
        assert!(conn.dropped_packets > 0);
    }

    #[test]
    fn unsplit_passes_through() {
        let mut conn = test_connection(ConnectionVariant::Resolver);
        let message = vec![MessageType::ClusterWelcome as u8, 1, 0, 2, 0];
        assert_eq!(conn.reassemble(&message), Some(message));
    }

    #[test]
    fn cluster_info_slot_coalesces() {
        let mut slot = ClusterInfoUpdateSlot::default();
        assert!(!slot.has_data());
        slot.merge(0, 3, false, -1);
        slot.merge(0, 3, false, 2);
        assert!(slot.has_data());
        let packet = slot.drain(1, 1, 2);
        assert_eq!(packet.cluster_size_change, 6);
        assert_eq!(packet.hops_to_sink, 2);
        assert!(!slot.has_data());

        slot.merge(42, 0, false, 2);
        assert!(slot.has_data());
        assert_eq!(slot.drain(1, 0, 2).new_cluster_id, 42);
    }

    #[test]
    fn rssi_moving_average() {
        let mut conn = test_connection(ConnectionVariant::Resolver);
        conn.last_reported_rssi = -60;
        for _ in 0..100 {
            conn.update_rssi_average();
        }
        assert!((conn.average_rssi() as i32 - -60).abs() <= 1);
    }
}
