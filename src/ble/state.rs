//! Per-node SoftDevice state.
//!
//! Advertising and scanning share the radio but are tracked independently;
//! both can be active at once. Connection slots buffer outgoing GATT traffic
//! until the scheduler's connection events move it to the partner's event
//! queue.

use crate::config::{
    CONFIGURED_CENTRAL_CONNECTION_COUNT, CONFIGURED_PERIPHERAL_CONNECTION_COUNT,
    CONFIGURED_TOTAL_CONNECTION_COUNT, GATT_MTU_SIZE_DEFAULT, SIM_NUM_UNRELIABLE_BUFFERS,
};
use crate::types::{BleAddress, DeliveryOption, ADV_PACKET_BUFFER_SIZE};
use std::collections::VecDeque;

// Well-known GATT handles. All simulated nodes run the same firmware image,
// so the attribute table layout is identical everywhere.
pub const MESH_SERVICE_UUID16: u16 = 0xFE12;
pub const MESH_WRITE_CHARACTERISTIC_HANDLE: u16 = 0x0012;
pub const MA_SERVICE_UUID16: u16 = 0xFE13;
pub const MA_RX_CHARACTERISTIC_HANDLE: u16 = 0x0022;
pub const MA_TX_CHARACTERISTIC_HANDLE: u16 = 0x0024;
pub const MA_TX_CCCD_HANDLE: u16 = 0x0025;

pub const MESH_CHARACTERISTIC_UUID16: u16 = 0x0001;
pub const MA_RX_CHARACTERISTIC_UUID16: u16 = 0x0002;
pub const MA_TX_CHARACTERISTIC_UUID16: u16 = 0x0003;

/// Invalid BLE connection handle.
pub const BLE_CONN_HANDLE_INVALID: u16 = 0xFFFF;

#[derive(Debug, Clone)]
pub struct CharacteristicDb {
    pub uuid: u16,
    pub value_handle: u16,
    pub cccd_handle: u16,
}

#[derive(Debug, Clone)]
pub struct ServiceDb {
    pub uuid: u16,
    pub characteristics: Vec<CharacteristicDb>,
}

/// A packet handed to the softdevice, waiting for a connection event.
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    pub global_packet_id: u32,
    pub queue_time_ms: u32,
    pub characteristic_handle: u16,
    pub delivery: DeliveryOption,
    pub data: Vec<u8>,
}

/// One softdevice link slot.
#[derive(Debug, Clone, Default)]
pub struct SoftdeviceConnection {
    pub active: bool,
    pub handle: u16,
    pub is_central: bool,
    /// Slab index of the partner node.
    pub partner_index: usize,
    pub interval_ms: u16,
    pub mtu: u16,
    pub rssi_measurement_active: bool,
    pub reliable_buffer: Option<BufferedPacket>,
    pub unreliable_buffers: Vec<Option<BufferedPacket>>,
}

impl SoftdeviceConnection {
    fn cleared() -> SoftdeviceConnection {
        SoftdeviceConnection {
            unreliable_buffers: vec![None; SIM_NUM_UNRELIABLE_BUFFERS],
            ..Default::default()
        }
    }

    pub fn clear_buffers(&mut self) {
        self.reliable_buffer = None;
        for b in &mut self.unreliable_buffers {
            *b = None;
        }
    }

    /// Count of free unreliable buffers.
    pub fn free_unreliable(&self) -> usize {
        self.unreliable_buffers.iter().filter(|b| b.is_none()).count()
    }

    /// The buffered packet with the lowest global id, if any.
    pub fn next_packet_to_write(&self) -> Option<&BufferedPacket> {
        let mut best: Option<&BufferedPacket> = self.reliable_buffer.as_ref();
        for p in self.unreliable_buffers.iter().flatten() {
            if best.map(|b| p.global_packet_id < b.global_packet_id).unwrap_or(true) {
                best = Some(p);
            }
        }
        best
    }

    /// Removes and returns the packet with the given global id.
    pub fn take_packet(&mut self, global_packet_id: u32) -> Option<BufferedPacket> {
        if self
            .reliable_buffer
            .as_ref()
            .map(|p| p.global_packet_id == global_packet_id)
            .unwrap_or(false)
        {
            return self.reliable_buffer.take();
        }
        for slot in &mut self.unreliable_buffers {
            if slot.as_ref().map(|p| p.global_packet_id == global_packet_id).unwrap_or(false) {
                return slot.take();
            }
        }
        None
    }
}

/// The complete simulated radio state of one node.
#[derive(Debug)]
pub struct SoftdeviceState {
    pub initialized: bool,

    // Advertising
    pub advertising_active: bool,
    pub advertising_interval_ms: u32,
    /// ADV_IND (connectable, 0) or ADV_NONCONN_IND (2).
    pub advertising_type: u8,
    pub advertising_data: [u8; ADV_PACKET_BUFFER_SIZE],
    pub advertising_data_length: u8,

    // Scanning
    pub scanning_active: bool,
    pub scan_interval_ms: u32,
    pub scan_window_ms: u32,

    // Connecting (central side of GAP connect)
    pub connecting_active: bool,
    pub connecting_partner_addr: BleAddress,
    pub connecting_interval_ms: u16,
    pub connecting_timeout_timestamp_ms: i64,

    // Links
    pub connections: Vec<SoftdeviceConnection>,
    pub configured_peripheral_connection_count: u8,
    pub configured_central_connection_count: u8,

    // Service discovery, one outstanding request at a time
    pub discovery_done_time_ms: u32,
    pub discovery_conn_handle: u16,
    pub discovery_service_uuid: u16,

    // Attribute table
    pub services: Vec<ServiceDb>,

    // UART input, fed by the sim terminal and drained by uart interrupts
    pub uart_rx_lines: VecDeque<String>,
}

impl SoftdeviceState {
    pub fn new() -> SoftdeviceState {
        SoftdeviceState {
            initialized: false,
            advertising_active: false,
            advertising_interval_ms: 0,
            advertising_type: 0,
            advertising_data: [0; ADV_PACKET_BUFFER_SIZE],
            advertising_data_length: 0,
            scanning_active: false,
            scan_interval_ms: 0,
            scan_window_ms: 0,
            connecting_active: false,
            connecting_partner_addr: BleAddress::from_node_id(0),
            connecting_interval_ms: 0,
            connecting_timeout_timestamp_ms: 0,
            connections: (0..CONFIGURED_TOTAL_CONNECTION_COUNT)
                .map(|_| SoftdeviceConnection::cleared())
                .collect(),
            configured_peripheral_connection_count: CONFIGURED_PERIPHERAL_CONNECTION_COUNT,
            configured_central_connection_count: CONFIGURED_CENTRAL_CONNECTION_COUNT,
            discovery_done_time_ms: 0,
            discovery_conn_handle: BLE_CONN_HANDLE_INVALID,
            discovery_service_uuid: 0,
            services: default_services(),
            uart_rx_lines: VecDeque::new(),
        }
    }

    pub fn find_connection_by_handle(&self, handle: u16) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| c.active && c.handle == handle)
    }

    pub fn active_connection_count(&self) -> u8 {
        self.connections.iter().filter(|c| c.active).count() as u8
    }

    pub fn active_peripheral_count(&self) -> u8 {
        self.connections.iter().filter(|c| c.active && !c.is_central).count() as u8
    }

    pub fn active_central_count(&self) -> u8 {
        self.connections.iter().filter(|c| c.active && c.is_central).count() as u8
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.connections.iter().position(|c| !c.active)
    }

    /// Allocates a slot for a new link.
    pub fn occupy_slot(
        &mut self,
        slot: usize,
        handle: u16,
        is_central: bool,
        partner_index: usize,
        interval_ms: u16,
    ) {
        let conn = &mut self.connections[slot];
        *conn = SoftdeviceConnection::cleared();
        conn.active = true;
        conn.handle = handle;
        conn.is_central = is_central;
        conn.partner_index = partner_index;
        conn.interval_ms = interval_ms;
        conn.mtu = GATT_MTU_SIZE_DEFAULT;
    }
}

impl Default for SoftdeviceState {
    fn default() -> Self {
        Self::new()
    }
}

fn default_services() -> Vec<ServiceDb> {
    vec![
        ServiceDb {
            uuid: MESH_SERVICE_UUID16,
            characteristics: vec![CharacteristicDb {
                uuid: MESH_CHARACTERISTIC_UUID16,
                value_handle: MESH_WRITE_CHARACTERISTIC_HANDLE,
                cccd_handle: 0,
            }],
        },
        ServiceDb {
            uuid: MA_SERVICE_UUID16,
            characteristics: vec![
                CharacteristicDb {
                    uuid: MA_RX_CHARACTERISTIC_UUID16,
                    value_handle: MA_RX_CHARACTERISTIC_HANDLE,
                    cccd_handle: 0,
                },
                CharacteristicDb {
                    uuid: MA_TX_CHARACTERISTIC_UUID16,
                    value_handle: MA_TX_CHARACTERISTIC_HANDLE,
                    cccd_handle: MA_TX_CCCD_HANDLE,
                },
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_accounting() {
        let mut s = SoftdeviceState::new();
        assert_eq!(s.active_connection_count(), 0);
        let slot = s.free_slot().unwrap();
        s.occupy_slot(slot, 100, true, 3, 10);
        assert_eq!(s.active_central_count(), 1);
        assert_eq!(s.active_peripheral_count(), 0);
        assert_eq!(s.find_connection_by_handle(100), Some(slot));
        assert_eq!(s.find_connection_by_handle(101), None);
    }

    #[test]
    fn next_packet_is_lowest_global_id() {
        let mut c = SoftdeviceConnection::cleared();
        c.unreliable_buffers[0] = Some(BufferedPacket {
            global_packet_id: 9,
            queue_time_ms: 0,
            characteristic_handle: 1,
            delivery: DeliveryOption::WriteCmd,
            data: vec![],
        });
        c.reliable_buffer = Some(BufferedPacket {
            global_packet_id: 4,
            queue_time_ms: 0,
            characteristic_handle: 1,
            delivery: DeliveryOption::WriteReq,
            data: vec![],
        });
        assert_eq!(c.next_packet_to_write().unwrap().global_packet_id, 4);
        let taken = c.take_packet(4).unwrap();
        assert_eq!(taken.global_packet_id, 4);
        assert_eq!(c.next_packet_to_write().unwrap().global_packet_id, 9);
    }
}
