//! Safe references to pooled connections.
//!
//! A handle stores the connection's unique id plus a cached slot lookup. The
//! cache stays valid as long as no connection was removed from the pool since
//! it was filled; afterwards the handle re-resolves by searching for the
//! unique id. A handle to a deleted connection resolves to `None` instead of
//! dangling.

use std::cell::Cell;

use super::manager::ConnectionManager;

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    unique_id: u32,
    cache: Cell<Option<(u32, usize)>>,
}

impl ConnectionHandle {
    pub const INVALID: u32 = 0;

    pub fn new(unique_id: u32) -> ConnectionHandle {
        ConnectionHandle { unique_id, cache: Cell::new(None) }
    }

    pub fn invalid() -> ConnectionHandle {
        ConnectionHandle::new(Self::INVALID)
    }

    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    pub fn is_valid(&self) -> bool {
        self.unique_id != Self::INVALID
    }

    /// Resolves to the pool slot currently holding this connection.
    pub fn resolve(&self, cm: &ConnectionManager) -> Option<usize> {
        if self.unique_id == Self::INVALID {
            return None;
        }
        if let Some((removed_count, slot)) = self.cache.get() {
            if removed_count == cm.removed_connections_counter() {
                // Nothing was deleted since the lookup; the slot is current.
                return Some(slot);
            }
        }
        let slot = cm.find_slot_by_unique_id(self.unique_id)?;
        self.cache.set(Some((cm.removed_connections_counter(), slot)));
        Some(slot)
    }

    pub fn exists(&self, cm: &ConnectionManager) -> bool {
        self.resolve(cm).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::connection::ConnectionVariant;
    use crate::types::{AppDisconnectReason, BleAddress, ConnectionDirection};

    #[test]
    fn handle_survives_unrelated_changes_and_dies_on_delete() {
        let mut cm = ConnectionManager::new();
        let slot = cm
            .allocate(
                ConnectionDirection::Out,
                BleAddress::from_node_id(9),
                0,
                ConnectionVariant::Resolver,
            )
            .unwrap();
        let unique_id = cm.get(slot).unwrap().unique_id;
        let handle = ConnectionHandle::new(unique_id);

        assert_eq!(handle.resolve(&cm), Some(slot));
        // Cached path.
        assert_eq!(handle.resolve(&cm), Some(slot));

        cm.delete_connection(slot, AppDisconnectReason::UserRequest);
        assert_eq!(handle.resolve(&cm), None);
        assert!(!handle.exists(&cm));
    }

    #[test]
    fn invalid_handle_never_resolves() {
        let cm = ConnectionManager::new();
        assert_eq!(ConnectionHandle::invalid().resolve(&cm), None);
    }
}
