//! Connection pool and slot accounting.
//!
//! The pool owns `TOTAL_NUM_CONNECTIONS + 1` typed slots (the extra slot
//! absorbs a short-lived resolver while all regular slots are busy). Mesh
//! connections are additionally governed by the in/out quotas that the
//! clustering algorithm advertises to its neighbors.

use crate::config::{MAX_MESH_IN_CONNECTIONS, MAX_MESH_OUT_CONNECTIONS, TOTAL_NUM_CONNECTIONS};
use crate::types::{
    AppDisconnectReason, BleAddress, ClusterSize, ConnectionDirection, ConnectionState, NodeId,
};
use tracing::debug;

use super::connection::{Connection, ConnectionVariant};

pub struct ConnectionManager {
    slots: Vec<Option<Connection>>,
    free_mesh_in: u8,
    free_mesh_out: u8,
    unique_id_counter: u32,
    removed_connections_counter: u32,
    /// Unique id of the connection currently being set up, if any.
    pub pending_connection: Option<u32>,
    pub time_since_time_sync_ds: u32,
    pub time_since_enrolled_sync_ds: u32,
    pub dropped_mesh_packets: u32,
    pub sent_mesh_packets_reliable: u32,
    pub sent_mesh_packets_unreliable: u32,
}

impl ConnectionManager {
    pub fn new() -> ConnectionManager {
        ConnectionManager {
            slots: (0..TOTAL_NUM_CONNECTIONS + 1).map(|_| None).collect(),
            free_mesh_in: MAX_MESH_IN_CONNECTIONS as u8,
            free_mesh_out: MAX_MESH_OUT_CONNECTIONS as u8,
            unique_id_counter: 0,
            removed_connections_counter: 0,
            pending_connection: None,
            time_since_time_sync_ds: 0,
            time_since_enrolled_sync_ds: 0,
            dropped_mesh_packets: 0,
            sent_mesh_packets_reliable: 0,
            sent_mesh_packets_unreliable: 0,
        }
    }

    // =========================================================================
    // POOL
    // =========================================================================

    /// Generates the next unique connection id, skipping 0 on wrap.
    fn generate_unique_connection_id(&mut self) -> u32 {
        self.unique_id_counter = self.unique_id_counter.wrapping_add(1);
        if self.unique_id_counter == 0 {
            self.unique_id_counter = 1;
        }
        self.unique_id_counter
    }

    /// Places a new connection into a free slot.
    pub fn allocate(
        &mut self,
        direction: ConnectionDirection,
        partner_address: BleAddress,
        creation_time_ds: u32,
        variant: ConnectionVariant,
    ) -> Option<usize> {
        let slot = self.slots.iter().position(|s| s.is_none())?;
        let unique_id = self.generate_unique_connection_id();
        let conn = Connection::new(
            unique_id,
            slot as u8,
            direction,
            partner_address,
            creation_time_ds,
            variant,
        );
        self.slots[slot] = Some(conn);
        Some(slot)
    }

    /// Removes a connection and returns the mesh quota it held.
    pub fn delete_connection(&mut self, slot: usize, reason: AppDisconnectReason) {
        let Some(conn) = self.slots[slot].take() else {
            return;
        };
        debug!(
            slot,
            unique_id = conn.unique_id,
            ?reason,
            "connection removed from pool"
        );
        if conn.variant.is_mesh() {
            match conn.direction {
                ConnectionDirection::In => self.free_mesh_in += 1,
                ConnectionDirection::Out => self.free_mesh_out += 1,
            }
        }
        if self.pending_connection == Some(conn.unique_id) {
            self.pending_connection = None;
        }
        self.removed_connections_counter = self.removed_connections_counter.wrapping_add(1);
    }

    /// Reserves mesh quota for a connection that becomes (or is created as) a
    /// mesh connection. Returns false when the quota is exhausted.
    pub fn reserve_mesh_quota(&mut self, direction: ConnectionDirection) -> bool {
        match direction {
            ConnectionDirection::In => {
                if self.free_mesh_in == 0 {
                    return false;
                }
                self.free_mesh_in -= 1;
            }
            ConnectionDirection::Out => {
                if self.free_mesh_out == 0 {
                    return false;
                }
                self.free_mesh_out -= 1;
            }
        }
        true
    }

    pub fn has_free_mesh_connection(&self, direction: ConnectionDirection) -> bool {
        match direction {
            ConnectionDirection::In => self.free_mesh_in > 0,
            ConnectionDirection::Out => self.free_mesh_out > 0,
        }
    }

    pub fn free_mesh_in(&self) -> u8 {
        self.free_mesh_in
    }

    pub fn free_mesh_out(&self) -> u8 {
        self.free_mesh_out
    }

    pub fn removed_connections_counter(&self) -> u32 {
        self.removed_connections_counter
    }

    // =========================================================================
    // LOOKUP
    // =========================================================================

    pub fn get(&self, slot: usize) -> Option<&Connection> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    pub fn find_slot_by_unique_id(&self, unique_id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map(|c| c.unique_id == unique_id).unwrap_or(false))
    }

    pub fn find_slot_by_conn_handle(&self, conn_handle: u16) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_ref()
                .map(|c| c.connection_handle == conn_handle && !c.is_disconnected())
                .unwrap_or(false)
        })
    }

    /// Slot indices of all occupied slots.
    pub fn occupied_slots(&self) -> Vec<usize> {
        (0..self.slots.len()).filter(|&i| self.slots[i].is_some()).collect()
    }

    pub fn mesh_slots(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].as_ref().map(|c| c.variant.is_mesh()).unwrap_or(false))
            .collect()
    }

    pub fn mesh_access_slots(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| {
                self.slots[i].as_ref().map(|c| c.variant.is_mesh_access()).unwrap_or(false)
            })
            .collect()
    }

    pub fn handshaked_mesh_slots(&self) -> Vec<usize> {
        self.mesh_slots()
            .into_iter()
            .filter(|&i| self.get(i).map(|c| c.handshake_done()).unwrap_or(false))
            .collect()
    }

    pub fn find_mesh_slot_to_partner(&self, partner_id: NodeId) -> Option<usize> {
        self.handshaked_mesh_slots()
            .into_iter()
            .find(|&i| self.get(i).map(|c| c.partner_id == partner_id).unwrap_or(false))
    }

    /// The connection currently between `Connected` and `HandshakeDone`.
    pub fn connection_in_handshake_state(&self) -> Option<usize> {
        self.occupied_slots().into_iter().find(|&i| {
            self.get(i)
                .map(|c| {
                    c.state >= ConnectionState::Connected && c.state < ConnectionState::HandshakeDone
                })
                .unwrap_or(false)
        })
    }

    // =========================================================================
    // ROUTING HELPERS
    // =========================================================================

    /// Our hop distance to the closest sink over handshaked mesh connections,
    /// excluding `exclude_slot`. -1 when no route exists.
    pub fn mesh_hops_to_shortest_sink(&self, exclude_slot: Option<usize>) -> ClusterSize {
        self.mesh_slot_to_shortest_sink(exclude_slot)
            .and_then(|slot| self.get(slot))
            .and_then(|c| c.mesh().map(|m| m.hops_to_sink + 1))
            .unwrap_or(-1)
    }

    /// The mesh connection whose partner advertises the lowest positive hop
    /// count to a sink.
    pub fn mesh_slot_to_shortest_sink(&self, exclude_slot: Option<usize>) -> Option<usize> {
        let mut best: Option<(usize, ClusterSize)> = None;
        for slot in self.handshaked_mesh_slots() {
            if Some(slot) == exclude_slot {
                continue;
            }
            let Some(hops) = self.get(slot).and_then(|c| c.mesh().map(|m| m.hops_to_sink)) else {
                continue;
            };
            if hops < 0 {
                continue;
            }
            if best.map(|(_, b)| hops < b).unwrap_or(true) {
                best = Some((slot, hops));
            }
        }
        best.map(|(slot, _)| slot)
    }

    /// Number of queued packets over all connections.
    pub fn pending_packets(&self) -> u32 {
        self.occupied_slots()
            .into_iter()
            .filter_map(|i| self.get(i))
            .map(|c| {
                c.queue.amount_of_packets()
                    + c.mesh().map(|m| m.cluster_info_update.has_data() as u32).unwrap_or(0)
            })
            .sum()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::connection::MeshState;

    fn mesh_variant() -> ConnectionVariant {
        ConnectionVariant::Mesh(MeshState::new(0x12))
    }

    #[test]
    fn unique_ids_are_monotonic_and_never_zero() {
        let mut cm = ConnectionManager::new();
        let a = cm.allocate(ConnectionDirection::Out, BleAddress::from_node_id(1), 0, mesh_variant()).unwrap();
        let b = cm.allocate(ConnectionDirection::Out, BleAddress::from_node_id(2), 0, mesh_variant()).unwrap();
        let ida = cm.get(a).unwrap().unique_id;
        let idb = cm.get(b).unwrap().unique_id;
        assert!(ida > 0 && idb > ida);
    }

    #[test]
    fn quota_accounting_balances() {
        let mut cm = ConnectionManager::new();
        assert_eq!(cm.free_mesh_out(), MAX_MESH_OUT_CONNECTIONS as u8);
        assert!(cm.reserve_mesh_quota(ConnectionDirection::Out));
        let slot = cm
            .allocate(ConnectionDirection::Out, BleAddress::from_node_id(1), 0, mesh_variant())
            .unwrap();
        assert_eq!(cm.free_mesh_out(), MAX_MESH_OUT_CONNECTIONS as u8 - 1);
        cm.delete_connection(slot, AppDisconnectReason::UserRequest);
        assert_eq!(cm.free_mesh_out(), MAX_MESH_OUT_CONNECTIONS as u8);
    }

    #[test]
    fn in_quota_exhausts() {
        let mut cm = ConnectionManager::new();
        for _ in 0..MAX_MESH_IN_CONNECTIONS {
            assert!(cm.reserve_mesh_quota(ConnectionDirection::In));
        }
        assert!(!cm.reserve_mesh_quota(ConnectionDirection::In));
    }

    #[test]
    fn shortest_sink_selection() {
        let mut cm = ConnectionManager::new();
        let a = cm.allocate(ConnectionDirection::Out, BleAddress::from_node_id(1), 0, mesh_variant()).unwrap();
        let b = cm.allocate(ConnectionDirection::Out, BleAddress::from_node_id(2), 0, mesh_variant()).unwrap();
        for (slot, hops) in [(a, 3i16), (b, 1i16)] {
            let conn = cm.get_mut(slot).unwrap();
            conn.state = ConnectionState::HandshakeDone;
            conn.mesh_mut().unwrap().hops_to_sink = hops;
        }
        assert_eq!(cm.mesh_slot_to_shortest_sink(None), Some(b));
        assert_eq!(cm.mesh_hops_to_shortest_sink(None), 2);
        assert_eq!(cm.mesh_slot_to_shortest_sink(Some(b)), Some(a));
        // No route anywhere.
        cm.get_mut(a).unwrap().mesh_mut().unwrap().hops_to_sink = -1;
        assert_eq!(cm.mesh_hops_to_shortest_sink(Some(b)), -1);
    }
}
