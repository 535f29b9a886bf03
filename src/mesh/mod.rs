//! Firmware-side connection layer: pool, queues and the two protocols that
//! run on top of GATT links.

pub mod connection;
pub mod handle;
pub mod manager;
pub mod mesh_access;
pub mod mesh_connection;
pub mod queue;

pub use connection::{
    ClusterInfoUpdateSlot, Connection, ConnectionVariant, MeshAccessState, MeshState,
    TimeSyncState, MAX_CORRUPTED_MESSAGES,
};
pub use handle::ConnectionHandle;
pub use manager::ConnectionManager;
pub use queue::{ChunkedPriorityQueue, OutboundChunk, QueuedMessage};
