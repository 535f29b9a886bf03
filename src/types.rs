// Meshsim — Constants and Types
// Distributed under the MIT software license.

//! Mesh-wide constants and primitive types.
//!
//! The node-id address space, the connection state machines and the reason
//! enums defined here are wire-visible. Their numeric values must not change,
//! otherwise simulated firmware images stop being interoperable with real
//! ones.

use serde::{Deserialize, Serialize};

/// Network id shared by all members of one mesh.
pub type NetworkId = u16;
/// Per-device address inside one mesh.
pub type NodeId = u16;
/// Cluster identity, randomly generated when a cluster forms.
pub type ClusterId = u32;
/// Signed cluster size. Deltas can be negative.
pub type ClusterSize = i16;

// =============================================================================
// NODE ID ADDRESS SPACE
// =============================================================================
// The mesh routes on 16-bit node ids. Besides per-device addresses, several
// well-known ranges carry routing semantics.

/// Received by every node within one mesh.
pub const NODE_ID_BROADCAST: NodeId = 0;
/// First assignable per-device address.
pub const NODE_ID_DEVICE_BASE: NodeId = 1;
pub const NODE_ID_DEVICE_BASE_SIZE: NodeId = 1999;

/// Multiplier for per-slot virtual addresses handed to tunnel partners that
/// are not part of the mesh themselves.
pub const NODE_ID_VIRTUAL_BASE: NodeId = 2000;

/// Group addresses. A node can be a member of many groups at once.
pub const NODE_ID_GROUP_BASE: NodeId = 20000;
pub const NODE_ID_GROUP_BASE_SIZE: NodeId = 10000;

/// Local loopback. Delivered only to the sending node itself.
pub const NODE_ID_LOCAL_LOOPBACK: NodeId = 30000;
/// `HOPS_BASE + k` travels k hops, decremented on each relay.
pub const NODE_ID_HOPS_BASE: NodeId = 30000;
pub const NODE_ID_HOPS_BASE_SIZE: NodeId = 1000;

/// Routed along the lowest hops-to-sink gradient, broadcast when no route.
pub const NODE_ID_SHORTEST_SINK: NodeId = 31000;
/// Sent to the first matching tunnel partner only; broadcast if none accepts.
pub const NODE_ID_ANYCAST_THEN_BROADCAST: NodeId = 31001;

/// Custom GATT surface, smartphone connections (`APP_BASE + module`).
pub const NODE_ID_APP_BASE: NodeId = 32000;
pub const NODE_ID_APP_BASE_SIZE: NodeId = 1000;

/// Organization-wide addresses, e.g. for assets.
pub const NODE_ID_GLOBAL_DEVICE_BASE: NodeId = 33000;
pub const NODE_ID_GLOBAL_DEVICE_BASE_SIZE: NodeId = 7000;

/// Error marker, never a valid sender or receiver.
pub const NODE_ID_INVALID: NodeId = 0xFFFF;

/// True if `id` lies in the organization-wide global device range.
pub fn is_global_device_id(id: NodeId) -> bool {
    (NODE_ID_GLOBAL_DEVICE_BASE..NODE_ID_GLOBAL_DEVICE_BASE + NODE_ID_GLOBAL_DEVICE_BASE_SIZE)
        .contains(&id)
}

// =============================================================================
// DEVICE / KEY / STATE ENUMS
// =============================================================================

/// The kinds of devices a mesh consists of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceType {
    Invalid = 0,
    /// A normal node that remains static at one position.
    Static = 1,
    /// A node that moves constantly or often.
    Roaming = 2,
    /// A static node that acquires data, e.g. a gateway.
    Sink = 3,
    /// A roaming node that only broadcasts and rarely connects.
    Asset = 4,
    /// Connects only as central, never relays.
    Leaf = 5,
}

/// Long-term key selector for the encrypted tunnel handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FmKeyId(pub u32);

impl FmKeyId {
    pub const ZERO: FmKeyId = FmKeyId(0);
    pub const NODE: FmKeyId = FmKeyId(1);
    pub const NETWORK: FmKeyId = FmKeyId(2);
    pub const BASE_USER: FmKeyId = FmKeyId(3);
    pub const ORGANIZATION: FmKeyId = FmKeyId(4);
    pub const RESTRAINED: FmKeyId = FmKeyId(5);
    pub const USER_DERIVED_START: FmKeyId = FmKeyId(10);
    pub const USER_DERIVED_END: FmKeyId = FmKeyId(u32::MAX / 2);

    pub fn is_user_derived(self) -> bool {
        self >= Self::USER_DERIVED_START && self <= Self::USER_DERIVED_END
    }
}

/// Direction of a connection. `In` means we are the peripheral,
/// `Out` means we are the central.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    In,
    Out,
}

/// Direction of data relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    In,
    Out,
}

/// Connection state machine.
///
/// ```text
/// Connecting ──► Connected ──► Handshaking ──► HandshakeDone
///                                                   │ gap drop
///                                                   ▼
///                             Reestablishing ──► ReestablishingHandshake
///                                                   │ reconnect packet
///                                                   ▼
///                                              HandshakeDone
/// ```
///
/// Ordering matters: `>= Connected` means a GAP link exists, and
/// `>= HandshakeDone` means application data may flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Handshaking = 3,
    HandshakeDone = 4,
    Reestablishing = 5,
    ReestablishingHandshake = 6,
}

/// Encryption state of an encrypted tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    NotEncrypted,
    Encrypting,
    Encrypted,
}

/// Direction the encrypted tunnel works in. A mesh on both sides cannot be
/// supported without extra routing data, so one side must be chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelType {
    PeerToPeer = 0,
    RemoteMesh = 1,
    LocalMesh = 2,
    Invalid = 0xFF,
}

impl TunnelType {
    pub fn from_u8(v: u8) -> TunnelType {
        match v {
            0 => TunnelType::PeerToPeer,
            1 => TunnelType::RemoteMesh,
            2 => TunnelType::LocalMesh,
            _ => TunnelType::Invalid,
        }
    }

    /// The partner's tunnel type as seen from our side.
    pub fn dual(self) -> TunnelType {
        match self {
            TunnelType::PeerToPeer => TunnelType::PeerToPeer,
            TunnelType::LocalMesh => TunnelType::RemoteMesh,
            TunnelType::RemoteMesh => TunnelType::LocalMesh,
            TunnelType::Invalid => TunnelType::Invalid,
        }
    }
}

/// Packet authorization for tunnel traffic. Larger values always win when
/// several modules disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MeshAccessAuthorization {
    /// Not checked by any module. Dropped.
    Undetermined = 0,
    /// Allowed everywhere.
    Whitelist = 1,
    /// Processed by the receiving node only, never relayed.
    LocalOnly = 2,
    /// Dropped. Always wins over a whitelist.
    Blacklist = 3,
}

/// Why a connection was purposefully torn down. Recorded before teardown so
/// log consumers can attribute cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AppDisconnectReason {
    Unknown = 0,
    HandshakeTimeout = 1,
    ReconnectTimeout = 2,
    GapDisconnectNoReestablishRequested = 3,
    SameClusterId = 4,
    TooManySendRetries = 5,
    IAmSmaller = 6,
    PartnerHasMasterBit = 7,
    ShouldWaitAsSlave = 8,
    LeafNode = 9,
    StaticNode = 10,
    QueueNumMismatch = 11,
    CmFailNoSpot = 12,
    UserRequest = 13,
    CurrentlyInHandshake = 14,
    GapConnectingTimeout = 15,
    PendingTimeout = 16,
    NetworkIdMismatch = 19,
    ReconnectBleError = 20,
    UnpreferredConnection = 21,
    EmergencyDisconnect = 22,
    GapError = 23,
    WrongPartnerId = 24,
    IllegalTunnelType = 25,
    InvalidKey = 26,
    InvalidPacket = 27,
    WrongDirection = 30,
    InvalidHandshakePacket = 33,
    Reboot = 34,
    ScheduledRemove = 36,
    MtuUpgradeFailed = 41,
}

/// HCI disconnect reason codes placed in simulated GAP disconnect events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HciError {
    Success = 0x00,
    ConnectionTimeout = 0x08,
    RemoteUserTerminatedConnection = 0x13,
    LocalHostTerminatedConnection = 0x16,
    MemoryCapacityExceeded = 0x07,
}

/// Why the device was rebooted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RebootReason {
    Unknown = 0,
    HardFault = 1,
    AppFault = 2,
    SdFault = 3,
    PinReset = 4,
    Watchdog = 5,
    FromOffState = 6,
    LocalReset = 7,
    RemoteReset = 8,
    Enrollment = 9,
    UnknownButBooted = 22,
    StackOverflow = 23,
    FactoryReset = 30,
}

/// Mesh discovery duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Scanning and advertising at a high duty cycle.
    High,
    /// Scanning and advertising at a low duty cycle.
    Low,
    /// Scanning disabled, advertising at a low duty cycle.
    Idle,
    /// Radio fully quiet for the node's own discovery purposes.
    Off,
}

/// Send-queue priorities. Vital is reserved for mesh-relevant data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeliveryPriority {
    Vital = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}
pub const AMOUNT_OF_SEND_QUEUE_PRIORITIES: usize = 4;

/// How a GATT payload is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOption {
    WriteCmd,
    WriteReq,
    Notification,
}

// =============================================================================
// BLE ADDRESS
// =============================================================================

/// Address type discriminator. Only random-static is fabricated by the sim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BleAddrType {
    Public = 0,
    RandomStatic = 1,
}

/// 7-byte BLE GAP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BleAddress {
    pub addr_type: BleAddrType,
    pub addr: [u8; 6],
}

impl BleAddress {
    /// Fabricated sim address: the node id embedded in bytes 2..4.
    pub fn from_node_id(id: NodeId) -> BleAddress {
        BleAddress {
            addr_type: BleAddrType::RandomStatic,
            addr: [0, 0, (id & 0xFF) as u8, (id >> 8) as u8, 0, 0],
        }
    }

    /// Colon-separated hex, most significant byte first.
    pub fn to_display(&self) -> String {
        let a = &self.addr;
        format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[5], a[4], a[3], a[2], a[1], a[0]
        )
    }

    /// Parses the display format back into an address.
    pub fn parse(s: &str) -> Option<BleAddress> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return None;
        }
        let mut addr = [0u8; 6];
        for (i, p) in parts.iter().enumerate() {
            addr[5 - i] = u8::from_str_radix(p, 16).ok()?;
        }
        Some(BleAddress { addr_type: BleAddrType::RandomStatic, addr })
    }
}

// =============================================================================
// SIMULATION ERRORS
// =============================================================================

/// Internal consistency problems noticed by the simulator. These are recorded
/// in the error journal of the simulator; tests can mute expected kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimErrorType {
    IllegalState,
    IllegalArgument,
    ConnHandleWrap,
    PacketTooBig,
    PacketTooSmall,
    MessageTooLong,
    CorruptOrOutdatedSavefile,
    PacketStatBufferSizeNotEnough,
    NonCompatibleDataType,
    IndexOutOfBounds,
    StackOverflow,
}

/// Position of a node. `x` and `y` are normalized to `[0,1)` against the map
/// dimensions, `z` is in meters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

// =============================================================================
// MISC FIRMWARE CONSTANTS
// =============================================================================

/// Maximum bytes per unsegmented GATT write before an MTU upgrade.
pub const MAX_DATA_SIZE_PER_WRITE: u16 = 20;

/// Size of the 31-byte legacy advertising buffer.
pub const ADV_PACKET_BUFFER_SIZE: usize = 31;

/// Largest message the mesh transports after reassembly.
pub const MAX_MESH_PACKET_SIZE: usize = 200;

/// Company identifier in the manufacturer-specific adv data header.
pub const MESH_COMPANY_IDENTIFIER: u16 = 0x024D;
/// Discriminates the mesh protocol under the company identifier.
pub const MESH_IDENTIFIER: u8 = 0xF0;
/// 16-bit service UUID of the mesh service.
pub const MESH_SERVICE_DATA_SERVICE_UUID16: u16 = 0xFE12;

/// An erased flash word.
pub const EMPTY_WORD: u32 = 0xFFFF_FFFF;

/// Deciseconds helpers. Firmware timers run on 100 ms granularity.
pub const fn sec_to_ds(sec: u32) -> u32 {
    sec * 10
}
pub const fn ds_to_sec(ds: u32) -> u32 {
    ds / 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrip() {
        let addr = BleAddress::from_node_id(2);
        assert_eq!(addr.to_display(), "00:00:00:02:00:00");
        assert_eq!(BleAddress::parse("00:00:00:02:00:00"), Some(addr));
        assert_eq!(BleAddress::parse("00:02:00:00"), None);
    }

    #[test]
    fn tunnel_type_duality() {
        assert_eq!(TunnelType::LocalMesh.dual(), TunnelType::RemoteMesh);
        assert_eq!(TunnelType::RemoteMesh.dual(), TunnelType::LocalMesh);
        assert_eq!(TunnelType::PeerToPeer.dual(), TunnelType::PeerToPeer);
    }

    #[test]
    fn connection_state_ordering() {
        assert!(ConnectionState::HandshakeDone > ConnectionState::Handshaking);
        assert!(ConnectionState::Reestablishing > ConnectionState::HandshakeDone);
    }
}
