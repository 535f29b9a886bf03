//! Simulated SoftDevice: BLE events and per-node radio state.

pub mod events;
pub mod state;

pub use events::{BleEventKind, EventQueue, SimBleEvent, TimeoutSource};
pub use state::{
    BufferedPacket, CharacteristicDb, ServiceDb, SoftdeviceConnection, SoftdeviceState,
    MA_RX_CHARACTERISTIC_HANDLE, MA_SERVICE_UUID16, MA_TX_CCCD_HANDLE,
    MA_TX_CHARACTERISTIC_HANDLE, MESH_SERVICE_UUID16, MESH_WRITE_CHARACTERISTIC_HANDLE,
};
