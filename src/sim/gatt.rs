//! Radio and GATT simulation: advertising reception, connection setup and
//! teardown, and the per-connection-event packet delivery.

use crate::ble::state::BLE_CONN_HANDLE_INVALID;
use crate::ble::{BleEventKind, SimBleEvent, TimeoutSource};
use crate::config::SIM_NUM_UNRELIABLE_BUFFERS;
use crate::radio;
use crate::rng::should_sim_iv_trigger;
use crate::types::{DeliveryOption, HciError, SimErrorType};
use tracing::warn;

use super::Simulator;

/// Oldest age a buffered packet may reach before the link is declared dead.
const STUCK_PACKET_TIMEOUT_MS: u32 = 30_000;

impl Simulator {
    /// RSSI from `sender` to `receiver`, honoring impossible-connection
    /// overrides and the optional noise model.
    pub fn reception_rssi(&mut self, sender: usize, receiver: usize) -> f32 {
        if self.nodes[sender].impossible_connections.contains(&receiver)
            || self.nodes[receiver].impossible_connections.contains(&sender)
        {
            return radio::IMPOSSIBLE_RSSI;
        }
        let noise = if self.config.rssi_noise { Some(&mut self.counters.rng) } else { None };
        radio::reception_rssi(
            &self.nodes[sender].position,
            &self.nodes[receiver].position,
            self.config.map_width_in_meters,
            self.config.map_height_in_meters,
            noise,
        )
    }

    pub fn reception_probability(&mut self, sender: usize, receiver: usize) -> f64 {
        radio::reception_probability(self.reception_rssi(sender, receiver))
    }

    // =========================================================================
    // TIMEOUTS
    // =========================================================================

    /// Fires the GAP connecting timeout when the deadline passed.
    pub(crate) fn simulate_timeouts(&mut self, index: usize) {
        let now = self.counters.sim_time_ms as i64;
        let node = &mut self.nodes[index];
        if node.sd.connecting_active && node.sd.connecting_timeout_timestamp_ms <= now {
            node.sd.connecting_active = false;
            let event = SimBleEvent {
                global_id: self.counters.next_event_id(),
                kind: BleEventKind::GapTimeout { source: TimeoutSource::Connection },
            };
            self.nodes[index].event_queue.push(event);
        }
    }

    // =========================================================================
    // ADVERTISING
    // =========================================================================

    /// Distributes this node's advertisement to scanners and connectors.
    pub(crate) fn simulate_broadcast(&mut self, index: usize) {
        let tick = self.config.sim_tick_duration_ms;
        let now = self.counters.sim_time_ms;
        {
            let node = &self.nodes[index];
            if !node.sd.advertising_active
                || !should_sim_iv_trigger(now, tick, node.sd.advertising_interval_ms)
            {
                return;
            }
        }

        for other in 0..self.nodes.len() {
            if other == index {
                continue;
            }
            if self.nodes[other].sd.scanning_active {
                let probability = self.reception_probability(index, other);
                if self.counters.rng.next_f64() < probability {
                    let rssi = self.reception_rssi(index, other) as i8;
                    let sender = &self.nodes[index];
                    let event = SimBleEvent {
                        global_id: self.counters.next_event_id(),
                        kind: BleEventKind::AdvReport {
                            peer_addr: sender.address,
                            rssi,
                            adv_type: sender.sd.advertising_type,
                            data: sender.sd.advertising_data,
                            data_len: sender.sd.advertising_data_length,
                        },
                    };
                    self.nodes[other].event_queue.push(event);
                }
            } else if self.nodes[other].sd.connecting_active
                && self.nodes[index].sd.advertising_type == 0
                && self.nodes[other].sd.connecting_partner_addr == self.nodes[index].address
            {
                let probability = self.reception_probability(index, other);
                if self.counters.rng.next_f64() < probability {
                    self.connect_master_to_slave(other, index);
                    // The softdevice stops advertising once connected.
                    self.nodes[index].sd.advertising_active = false;
                    return;
                }
            }
        }
    }

    // =========================================================================
    // CONNECTION SETUP / TEARDOWN
    // =========================================================================

    /// Establishes a GAP link; `master` initiated, `slave` advertised.
    pub(crate) fn connect_master_to_slave(&mut self, master: usize, slave: usize) {
        self.global_conn_handle_counter += 1;
        if self.global_conn_handle_counter > 65000 {
            // Handle reuse makes the rest of the run unsound.
            warn!("global connection handle counter wrapped");
            self.report_error(SimErrorType::ConnHandleWrap);
            self.global_conn_handle_counter = 1;
        }
        let conn_handle = self.global_conn_handle_counter as u16;
        let interval_ms = self.nodes[master].sd.connecting_interval_ms;

        let rssi = self.reception_rssi(master, slave) as i32;
        let line = format!(
            "{{\"type\":\"sim_connect\",\"nodeId\":{},\"partnerId\":{},\"globalConnectionHandle\":{},\"rssi\":{},\"timeMs\":{}}}",
            self.nodes[master].id, self.nodes[slave].id, conn_handle, rssi, self.counters.sim_time_ms
        );
        self.emit_json(line);

        // Slave side: it must still have a free peripheral spot, otherwise it
        // should not have been advertising as connectable.
        {
            let sd = &self.nodes[slave].sd;
            if sd.active_peripheral_count() >= sd.configured_peripheral_connection_count
                || sd.free_slot().is_none()
            {
                self.report_error(SimErrorType::IllegalState);
                return;
            }
        }
        // Master side: gap_connect must not have been allowed beyond the
        // configured central link count.
        {
            let sd = &self.nodes[master].sd;
            if sd.active_central_count() >= sd.configured_central_connection_count
                || sd.free_slot().is_none()
            {
                self.report_error(SimErrorType::IllegalState);
                return;
            }
        }

        let slave_slot = self.nodes[slave].sd.free_slot().unwrap();
        self.nodes[slave].sd.occupy_slot(slave_slot, conn_handle, false, master, interval_ms);
        let slave_event = SimBleEvent {
            global_id: self.counters.next_event_id(),
            kind: BleEventKind::Connected {
                conn_handle,
                is_central: false,
                peer_addr: self.nodes[master].address,
                conn_interval_ms: interval_ms,
            },
        };
        self.nodes[slave].event_queue.push(slave_event);

        let master_slot = self.nodes[master].sd.free_slot().unwrap();
        self.nodes[master].sd.occupy_slot(master_slot, conn_handle, true, slave, interval_ms);
        let master_event = SimBleEvent {
            global_id: self.counters.next_event_id(),
            kind: BleEventKind::Connected {
                conn_handle,
                is_central: true,
                peer_addr: self.nodes[slave].address,
                conn_interval_ms: interval_ms,
            },
        };
        self.nodes[master].event_queue.push(master_event);

        self.nodes[master].sd.connecting_active = false;
    }

    /// Tears down a GAP link on both sides with per-side HCI reasons.
    pub fn disconnect_simulator_connection(
        &mut self,
        node_index: usize,
        conn_handle: u16,
        hci_reason: u8,
        hci_reason_partner: u8,
    ) -> bool {
        let Some(slot) = self.nodes[node_index].sd.find_connection_by_handle(conn_handle) else {
            return false;
        };
        let partner_index = self.nodes[node_index].sd.connections[slot].partner_index;
        let Some(partner_slot) =
            self.nodes[partner_index].sd.find_connection_by_handle(conn_handle)
        else {
            self.report_error(SimErrorType::IllegalState);
            return false;
        };

        let line = format!(
            "{{\"type\":\"sim_disconnect\",\"nodeId\":{},\"partnerId\":{},\"globalConnectionHandle\":{},\"timeMs\":{},\"reason\":{}}}",
            self.nodes[node_index].id,
            self.nodes[partner_index].id,
            conn_handle,
            self.counters.sim_time_ms,
            hci_reason
        );
        self.emit_json(line);

        {
            let conn = &mut self.nodes[node_index].sd.connections[slot];
            conn.clear_buffers();
            conn.active = false;
        }
        let event = SimBleEvent {
            global_id: self.counters.next_event_id(),
            kind: BleEventKind::Disconnected { conn_handle, hci_reason },
        };
        self.nodes[node_index].event_queue.push(event);

        {
            let conn = &mut self.nodes[partner_index].sd.connections[partner_slot];
            conn.clear_buffers();
            conn.active = false;
        }
        let event = SimBleEvent {
            global_id: self.counters.next_event_id(),
            kind: BleEventKind::Disconnected { conn_handle, hci_reason: hci_reason_partner },
        };
        self.nodes[partner_index].event_queue.push(event);
        true
    }

    // =========================================================================
    // CONNECTION EVENTS
    // =========================================================================

    /// Delivers buffered packets for each of this node's active links whose
    /// connection interval triggered.
    pub(crate) fn simulate_connections(&mut self, index: usize) {
        if self.block_connections {
            return;
        }
        let tick = self.config.sim_tick_duration_ms;
        let now = self.counters.sim_time_ms;

        for slot in 0..self.nodes[index].sd.connections.len() {
            if !self.nodes[index].sd.connections[slot].active {
                continue;
            }
            let mut interval_ms = self.nodes[index].sd.connections[slot].interval_ms as u32;
            // 7.5 ms is not representable on the tick grid; round up.
            if interval_ms == 7 {
                interval_ms = 10;
            }
            if !should_sim_iv_trigger(now, tick, interval_ms) {
                continue;
            }

            let partner_index = self.nodes[index].sd.connections[slot].partner_index;
            let num_connections = self.nodes[index].sd.active_connection_count();
            let mut num_packets_to_send = match num_connections {
                1 => self.counters.rng.next_range(0, SIM_NUM_UNRELIABLE_BUFFERS as u32),
                2 => self.counters.rng.next_range(0, 5),
                _ => self.counters.rng.next_range(0, 3),
            };
            if self.reception_probability(index, partner_index) == 0.0 {
                num_packets_to_send = 0;
            }

            // A packet that sat in the buffers for too long means the link is
            // gone for good.
            if let Some(oldest) = self.nodes[index].sd.connections[slot].next_packet_to_write() {
                if now.saturating_sub(oldest.queue_time_ms) > STUCK_PACKET_TIMEOUT_MS {
                    let handle = self.nodes[index].sd.connections[slot].handle;
                    self.disconnect_simulator_connection(
                        index,
                        handle,
                        HciError::ConnectionTimeout as u8,
                        HciError::ConnectionTimeout as u8,
                    );
                    continue;
                }
            }

            let mut unreliable_sent: u8 = 0;
            for _ in 0..num_packets_to_send {
                let Some(next_id) = self.nodes[index].sd.connections[slot]
                    .next_packet_to_write()
                    .map(|p| p.global_packet_id)
                else {
                    break;
                };
                let packet =
                    self.nodes[index].sd.connections[slot].take_packet(next_id).unwrap();
                let conn_handle = self.nodes[index].sd.connections[slot].handle;

                match packet.delivery {
                    DeliveryOption::Notification => {
                        self.generate_notification(index, partner_index, conn_handle, &packet);
                        unreliable_sent += 1;
                    }
                    DeliveryOption::WriteCmd => {
                        self.generate_write(index, partner_index, conn_handle, &packet, false);
                        unreliable_sent += 1;
                    }
                    DeliveryOption::WriteReq => {
                        // The pending unreliable acknowledgements must be
                        // flushed before the reliable one.
                        self.send_unreliable_tx_complete(index, conn_handle, unreliable_sent);
                        unreliable_sent = 0;

                        self.generate_write(index, partner_index, conn_handle, &packet, true);
                        let event = SimBleEvent {
                            global_id: self.counters.next_event_id(),
                            kind: BleEventKind::WriteRsp {
                                conn_handle,
                                global_packet_id: packet.global_packet_id,
                            },
                        };
                        self.nodes[index].event_queue.push(event);
                        // A reliable write ends the connection event.
                        break;
                    }
                }
            }
            let conn_handle = self.nodes[index].sd.connections[slot].handle;
            self.send_unreliable_tx_complete(index, conn_handle, unreliable_sent);
        }

        // RSSI sampling on active links.
        if should_sim_iv_trigger(now, tick, 5000) {
            for slot in 0..self.nodes[index].sd.connections.len() {
                let conn = &self.nodes[index].sd.connections[slot];
                if !conn.active || !conn.rssi_measurement_active {
                    continue;
                }
                let partner_index = conn.partner_index;
                let conn_handle = conn.handle;
                let rssi = self.reception_rssi(partner_index, index) as i8;
                let event = SimBleEvent {
                    global_id: self.counters.next_event_id(),
                    kind: BleEventKind::RssiChanged { conn_handle, rssi },
                };
                self.nodes[index].event_queue.push(event);
            }
        }

        // Spontaneous connection losses, rolled once per simulated second.
        if self.config.connection_timeout_probability_per_sec != 0.0
            && should_sim_iv_trigger(now, tick, 1000)
        {
            for slot in 0..self.nodes[index].sd.connections.len() {
                if !self.nodes[index].sd.connections[slot].active {
                    continue;
                }
                if self.counters.rng.roll(self.config.connection_timeout_probability_per_sec) {
                    self.simulated_connection_losses += 1;
                    let handle = self.nodes[index].sd.connections[slot].handle;
                    warn!(
                        node = self.nodes[index].id,
                        handle, "simulated connection loss"
                    );
                    self.disconnect_simulator_connection(
                        index,
                        handle,
                        HciError::ConnectionTimeout as u8,
                        HciError::ConnectionTimeout as u8,
                    );
                }
            }
        }
    }

    fn generate_write(
        &mut self,
        sender: usize,
        receiver: usize,
        conn_handle: u16,
        packet: &crate::ble::BufferedPacket,
        is_write_req: bool,
    ) {
        let line = format!(
            "{{\"type\":\"sim_data\",\"nodeId\":{},\"partnerId\":{},\"reliable\":{},\"timeMs\":{},\"data\":\"{}\"}}",
            self.nodes[sender].id,
            self.nodes[receiver].id,
            is_write_req,
            self.counters.sim_time_ms,
            hex::encode(&packet.data)
        );
        self.emit_json(line);

        let event = SimBleEvent {
            global_id: self.counters.next_event_id(),
            kind: BleEventKind::GattsWrite {
                conn_handle,
                characteristic_handle: packet.characteristic_handle,
                is_write_req,
                data: packet.data.clone(),
                global_packet_id: packet.global_packet_id,
            },
        };
        self.nodes[receiver].event_queue.push(event);
    }

    fn generate_notification(
        &mut self,
        sender: usize,
        receiver: usize,
        conn_handle: u16,
        packet: &crate::ble::BufferedPacket,
    ) {
        let line = format!(
            "{{\"type\":\"sim_data\",\"nodeId\":{},\"partnerId\":{},\"reliable\":false,\"timeMs\":{},\"data\":\"{}\"}}",
            self.nodes[sender].id,
            self.nodes[receiver].id,
            self.counters.sim_time_ms,
            hex::encode(&packet.data)
        );
        self.emit_json(line);

        let event = SimBleEvent {
            global_id: self.counters.next_event_id(),
            kind: BleEventKind::GattcHvx {
                conn_handle,
                characteristic_handle: packet.characteristic_handle,
                data: packet.data.clone(),
                global_packet_id: packet.global_packet_id,
            },
        };
        self.nodes[receiver].event_queue.push(event);
    }

    fn send_unreliable_tx_complete(&mut self, index: usize, conn_handle: u16, count: u8) {
        if count == 0 {
            return;
        }
        let event = SimBleEvent {
            global_id: self.counters.next_event_id(),
            kind: BleEventKind::TxComplete { conn_handle, count },
        };
        self.nodes[index].event_queue.push(event);
    }

    // =========================================================================
    // SERVICE DISCOVERY
    // =========================================================================

    /// Completes a pending service discovery once its delay elapsed.
    pub(crate) fn simulate_service_discovery(&mut self, index: usize) {
        let done_time = self.nodes[index].sd.discovery_done_time_ms;
        if done_time == 0 || done_time >= self.counters.sim_time_ms {
            return;
        }
        self.nodes[index].sd.discovery_done_time_ms = 0;

        let conn_handle = self.nodes[index].sd.discovery_conn_handle;
        if conn_handle == BLE_CONN_HANDLE_INVALID {
            return;
        }
        let uuid = self.nodes[index].sd.discovery_service_uuid;
        // All nodes run the same attribute table, so looking the service up
        // locally matches what the partner would report.
        let service = self.nodes[index].sd.services.iter().find(|s| s.uuid == uuid).cloned();
        self.nodes[index].service_discovery_finished(conn_handle, service, &mut self.counters);
    }
}
