//! Wire format of mesh packets.
//!
//! Every packet starts with the 5-byte connection packet header. Multi-byte
//! fields are little endian. The numeric message-type values are part of the
//! protocol and must not change.

use crate::types::{ClusterId, ClusterSize, NodeId};

pub const SIZEOF_CONN_PACKET_HEADER: usize = 5;
pub const SIZEOF_CONN_PACKET_SPLIT_HEADER: usize = 2;
pub const SIZEOF_CONN_PACKET_MODULE: usize = 8;

/// Message types transported over connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    Invalid = 0,
    SplitWriteCmd = 16,
    SplitWriteCmdEnd = 17,
    ClusterWelcome = 20,
    ClusterAck1 = 21,
    ClusterAck2 = 22,
    ClusterInfoUpdate = 23,
    Reconnect = 24,
    EncryptCustomStart = 25,
    EncryptCustomANonce = 26,
    EncryptCustomSNonce = 27,
    EncryptCustomDone = 28,
    UpdateTimestamp = 29,
    UpdateConnectionInterval = 30,
    TimeSync = 36,
    DeadData = 37,
    ModuleConfig = 50,
    ModuleTriggerAction = 51,
    ModuleActionResponse = 52,
    ModuleGeneral = 53,
    ModuleRawData = 54,
    ModuleRawDataLight = 55,
    ComponentAct = 58,
    ComponentSense = 59,
    Data1 = 80,
    Data1Vital = 81,
}

impl MessageType {
    pub fn from_u8(v: u8) -> MessageType {
        match v {
            16 => MessageType::SplitWriteCmd,
            17 => MessageType::SplitWriteCmdEnd,
            20 => MessageType::ClusterWelcome,
            21 => MessageType::ClusterAck1,
            22 => MessageType::ClusterAck2,
            23 => MessageType::ClusterInfoUpdate,
            24 => MessageType::Reconnect,
            25 => MessageType::EncryptCustomStart,
            26 => MessageType::EncryptCustomANonce,
            27 => MessageType::EncryptCustomSNonce,
            28 => MessageType::EncryptCustomDone,
            29 => MessageType::UpdateTimestamp,
            30 => MessageType::UpdateConnectionInterval,
            36 => MessageType::TimeSync,
            37 => MessageType::DeadData,
            50 => MessageType::ModuleConfig,
            51 => MessageType::ModuleTriggerAction,
            52 => MessageType::ModuleActionResponse,
            53 => MessageType::ModuleGeneral,
            54 => MessageType::ModuleRawData,
            55 => MessageType::ModuleRawDataLight,
            58 => MessageType::ComponentAct,
            59 => MessageType::ComponentSense,
            80 => MessageType::Data1,
            81 => MessageType::Data1Vital,
            _ => MessageType::Invalid,
        }
    }

    /// True for the four encrypt-custom handshake types.
    pub fn is_encrypt_custom(self) -> bool {
        self >= MessageType::EncryptCustomStart && self <= MessageType::EncryptCustomDone
    }

    /// Minimum accepted length of an inbound message of this type.
    /// Undersized messages are dropped before dispatch.
    pub fn min_len(self) -> usize {
        match self {
            MessageType::SplitWriteCmd | MessageType::SplitWriteCmdEnd => {
                SIZEOF_CONN_PACKET_SPLIT_HEADER
            }
            MessageType::ClusterWelcome => ClusterWelcome::SIZE_LEGACY,
            MessageType::ClusterAck1 => ClusterAck1::SIZE,
            MessageType::ClusterAck2 => ClusterAck2::SIZE,
            MessageType::ClusterInfoUpdate => ClusterInfoUpdate::SIZE,
            MessageType::Reconnect => Reconnect::SIZE,
            MessageType::EncryptCustomStart => EncryptCustomStart::SIZE,
            MessageType::EncryptCustomANonce => EncryptCustomANonce::SIZE,
            MessageType::EncryptCustomSNonce => EncryptCustomSNonce::SIZE,
            MessageType::EncryptCustomDone => EncryptCustomDone::SIZE,
            MessageType::UpdateTimestamp => SIZEOF_CONN_PACKET_HEADER + 8,
            MessageType::UpdateConnectionInterval => SIZEOF_CONN_PACKET_HEADER + 2,
            MessageType::TimeSync => TimeSyncPacket::HEADER_SIZE,
            MessageType::DeadData => DeadData::SIZE,
            MessageType::ModuleConfig
            | MessageType::ModuleTriggerAction
            | MessageType::ModuleActionResponse
            | MessageType::ModuleGeneral
            | MessageType::ModuleRawData
            | MessageType::ModuleRawDataLight => SIZEOF_CONN_PACKET_MODULE,
            MessageType::ComponentAct | MessageType::ComponentSense => SIZEOF_CONN_PACKET_MODULE + 4,
            MessageType::Data1 | MessageType::Data1Vital => SIZEOF_CONN_PACKET_HEADER,
            MessageType::Invalid => usize::MAX,
        }
    }
}

// =============================================================================
// HEADER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnPacketHeader {
    pub message_type: MessageType,
    pub sender: NodeId,
    pub receiver: NodeId,
}

impl ConnPacketHeader {
    pub fn new(message_type: MessageType, sender: NodeId, receiver: NodeId) -> Self {
        Self { message_type, sender, receiver }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.message_type as u8);
        out.extend_from_slice(&self.sender.to_le_bytes());
        out.extend_from_slice(&self.receiver.to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> Option<ConnPacketHeader> {
        if data.len() < SIZEOF_CONN_PACKET_HEADER {
            return None;
        }
        Some(ConnPacketHeader {
            message_type: MessageType::from_u8(data[0]),
            sender: u16::from_le_bytes([data[1], data[2]]),
            receiver: u16::from_le_bytes([data[3], data[4]]),
        })
    }

    /// Rewrites the receiver field of an encoded packet in place.
    pub fn patch_receiver(data: &mut [u8], receiver: NodeId) {
        data[3..5].copy_from_slice(&receiver.to_le_bytes());
    }

    /// Rewrites the sender field of an encoded packet in place.
    pub fn patch_sender(data: &mut [u8], sender: NodeId) {
        data[1..3].copy_from_slice(&sender.to_le_bytes());
    }
}

// =============================================================================
// CLUSTERING HANDSHAKE
// =============================================================================

/// First handshake packet, sent by the central.
#[derive(Debug, Clone, Copy)]
pub struct ClusterWelcome {
    pub header: ConnPacketHeader,
    pub cluster_id: ClusterId,
    pub cluster_size: ClusterSize,
    pub mesh_write_handle: u16,
    pub hops_to_sink: ClusterSize,
    pub preferred_connection_interval: u16,
    pub network_id: u16,
}

impl ClusterWelcome {
    /// Early firmware versions did not send the network id.
    pub const SIZE_LEGACY: usize = SIZEOF_CONN_PACKET_HEADER + 12;
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 14;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.cluster_id.to_le_bytes());
        out.extend_from_slice(&self.cluster_size.to_le_bytes());
        out.extend_from_slice(&self.mesh_write_handle.to_le_bytes());
        out.extend_from_slice(&self.hops_to_sink.to_le_bytes());
        out.extend_from_slice(&self.preferred_connection_interval.to_le_bytes());
        out.extend_from_slice(&self.network_id.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<ClusterWelcome> {
        if data.len() < Self::SIZE_LEGACY {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        let p = &data[SIZEOF_CONN_PACKET_HEADER..];
        let network_id = if data.len() >= Self::SIZE {
            u16::from_le_bytes([p[12], p[13]])
        } else {
            0
        };
        Some(ClusterWelcome {
            header,
            cluster_id: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
            cluster_size: i16::from_le_bytes([p[4], p[5]]),
            mesh_write_handle: u16::from_le_bytes([p[6], p[7]]),
            hops_to_sink: i16::from_le_bytes([p[8], p[9]]),
            preferred_connection_interval: u16::from_le_bytes([p[10], p[11]]),
            network_id,
        })
    }

    /// True when the packet is recent enough to carry a network id.
    pub fn has_network_id(data: &[u8]) -> bool {
        data.len() >= Self::SIZE
    }
}

/// Smaller cluster confirms it is joining.
#[derive(Debug, Clone, Copy)]
pub struct ClusterAck1 {
    pub header: ConnPacketHeader,
    pub hops_to_sink: ClusterSize,
}

impl ClusterAck1 {
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.hops_to_sink.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<ClusterAck1> {
        if data.len() < Self::SIZE {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        let p = &data[SIZEOF_CONN_PACKET_HEADER..];
        Some(ClusterAck1 { header, hops_to_sink: i16::from_le_bytes([p[0], p[1]]) })
    }
}

/// Bigger cluster hands the joining node its cluster id and size.
#[derive(Debug, Clone, Copy)]
pub struct ClusterAck2 {
    pub header: ConnPacketHeader,
    pub cluster_id: ClusterId,
    pub cluster_size: ClusterSize,
    pub hops_to_sink: ClusterSize,
}

impl ClusterAck2 {
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.cluster_id.to_le_bytes());
        out.extend_from_slice(&self.cluster_size.to_le_bytes());
        out.extend_from_slice(&self.hops_to_sink.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<ClusterAck2> {
        if data.len() < Self::SIZE {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        let p = &data[SIZEOF_CONN_PACKET_HEADER..];
        Some(ClusterAck2 {
            header,
            cluster_id: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
            cluster_size: i16::from_le_bytes([p[4], p[5]]),
            hops_to_sink: i16::from_le_bytes([p[6], p[7]]),
        })
    }
}

/// Coalescing vital-priority update carrying size / master-bit / hops deltas.
/// `new_cluster_id` propagates a regenerated cluster id after a split,
/// 0 meaning unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterInfoUpdate {
    pub sender: NodeId,
    pub new_cluster_id: ClusterId,
    pub cluster_size_change: ClusterSize,
    pub hops_to_sink: ClusterSize,
    pub connection_master_bit_handover: bool,
    /// 1-bit rolling id to detect replayed sends after reestablishment.
    pub counter: u8,
}

impl ClusterInfoUpdate {
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 9;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        ConnPacketHeader::new(MessageType::ClusterInfoUpdate, self.sender, 0).encode_into(&mut out);
        out.extend_from_slice(&self.new_cluster_id.to_le_bytes());
        out.extend_from_slice(&self.cluster_size_change.to_le_bytes());
        out.extend_from_slice(&self.hops_to_sink.to_le_bytes());
        let flags =
            (self.connection_master_bit_handover as u8) | ((self.counter & 0x01) << 1);
        out.push(flags);
        out
    }

    pub fn decode(data: &[u8]) -> Option<ClusterInfoUpdate> {
        if data.len() < Self::SIZE {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        let p = &data[SIZEOF_CONN_PACKET_HEADER..];
        Some(ClusterInfoUpdate {
            sender: header.sender,
            new_cluster_id: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
            cluster_size_change: i16::from_le_bytes([p[4], p[5]]),
            hops_to_sink: i16::from_le_bytes([p[6], p[7]]),
            connection_master_bit_handover: p[8] & 0x01 != 0,
            counter: (p[8] >> 1) & 0x01,
        })
    }
}

/// Reestablishment handshake. Carries only the identities.
#[derive(Debug, Clone, Copy)]
pub struct Reconnect {
    pub header: ConnPacketHeader,
}

impl Reconnect {
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.header.encode_into(&mut out);
        out
    }

    pub fn decode(data: &[u8]) -> Option<Reconnect> {
        Some(Reconnect { header: ConnPacketHeader::decode(data)? })
    }
}

// =============================================================================
// ENCRYPTED TUNNEL HANDSHAKE
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct EncryptCustomStart {
    pub header: ConnPacketHeader,
    pub version: u8,
    pub fm_key_id: u32,
    pub tunnel_type: u8,
}

impl EncryptCustomStart {
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 6;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.header.encode_into(&mut out);
        out.push(self.version);
        out.extend_from_slice(&self.fm_key_id.to_le_bytes());
        out.push(self.tunnel_type);
        out
    }

    pub fn decode(data: &[u8]) -> Option<EncryptCustomStart> {
        if data.len() < Self::SIZE {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        let p = &data[SIZEOF_CONN_PACKET_HEADER..];
        Some(EncryptCustomStart {
            header,
            version: p[0],
            fm_key_id: u32::from_le_bytes([p[1], p[2], p[3], p[4]]),
            tunnel_type: p[5],
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EncryptCustomANonce {
    pub header: ConnPacketHeader,
    pub anonce: [u32; 2],
}

impl EncryptCustomANonce {
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.anonce[0].to_le_bytes());
        out.extend_from_slice(&self.anonce[1].to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<EncryptCustomANonce> {
        if data.len() < Self::SIZE {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        let p = &data[SIZEOF_CONN_PACKET_HEADER..];
        Some(EncryptCustomANonce {
            header,
            anonce: [
                u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
                u32::from_le_bytes([p[4], p[5], p[6], p[7]]),
            ],
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EncryptCustomSNonce {
    pub header: ConnPacketHeader,
    pub snonce: [u32; 2],
}

impl EncryptCustomSNonce {
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.snonce[0].to_le_bytes());
        out.extend_from_slice(&self.snonce[1].to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<EncryptCustomSNonce> {
        if data.len() < Self::SIZE {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        let p = &data[SIZEOF_CONN_PACKET_HEADER..];
        Some(EncryptCustomSNonce {
            header,
            snonce: [
                u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
                u32::from_le_bytes([p[4], p[5], p[6], p[7]]),
            ],
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EncryptCustomDone {
    pub header: ConnPacketHeader,
    pub status: u8,
}

impl EncryptCustomDone {
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 1;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.header.encode_into(&mut out);
        out.push(self.status);
        out
    }

    pub fn decode(data: &[u8]) -> Option<EncryptCustomDone> {
        if data.len() < Self::SIZE {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        Some(EncryptCustomDone { header, status: data[SIZEOF_CONN_PACKET_HEADER] })
    }
}

/// Sent whenever a tunnel endpoint failed to decrypt a packet.
#[derive(Debug, Clone, Copy)]
pub struct DeadData {
    pub header: ConnPacketHeader,
    pub magic: [u8; 8],
}

pub const DEAD_DATA_MAGIC: [u8; 8] = [0xDE, 0xAD, 0xDA, 0xDA, 0x00, 0xFF, 0x77, 0x33];

impl DeadData {
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 8;

    pub fn new(sender: NodeId, receiver: NodeId) -> DeadData {
        DeadData {
            header: ConnPacketHeader::new(MessageType::DeadData, sender, receiver),
            magic: DEAD_DATA_MAGIC,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.magic);
        out
    }

    pub fn decode(data: &[u8]) -> Option<DeadData> {
        if data.len() < Self::SIZE {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&data[SIZEOF_CONN_PACKET_HEADER..SIZEOF_CONN_PACKET_HEADER + 8]);
        Some(DeadData { header, magic })
    }
}

// =============================================================================
// TIME SYNC
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeSyncType {
    Initial = 0,
    InitialReply = 1,
    Correction = 2,
    CorrectionReply = 3,
}

impl TimeSyncType {
    pub fn from_u8(v: u8) -> Option<TimeSyncType> {
        match v {
            0 => Some(TimeSyncType::Initial),
            1 => Some(TimeSyncType::InitialReply),
            2 => Some(TimeSyncType::Correction),
            3 => Some(TimeSyncType::CorrectionReply),
            _ => None,
        }
    }
}

/// All four time-sync messages share one frame; unused fields are zero.
#[derive(Debug, Clone, Copy)]
pub struct TimeSyncPacket {
    pub header: ConnPacketHeader,
    pub sync_type: TimeSyncType,
    /// Unix timestamp of the sender (Initial only).
    pub sync_time_s: u32,
    /// Offset that has accumulated since the sender was synced (Initial only).
    pub time_since_sync_ds: u32,
    /// Queuing latency compensation (Correction only).
    pub correction_ticks: u32,
}

impl TimeSyncPacket {
    pub const HEADER_SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 1;
    pub const SIZE: usize = SIZEOF_CONN_PACKET_HEADER + 13;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.header.encode_into(&mut out);
        out.push(self.sync_type as u8);
        out.extend_from_slice(&self.sync_time_s.to_le_bytes());
        out.extend_from_slice(&self.time_since_sync_ds.to_le_bytes());
        out.extend_from_slice(&self.correction_ticks.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<TimeSyncPacket> {
        if data.len() < Self::SIZE {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        let p = &data[SIZEOF_CONN_PACKET_HEADER..];
        Some(TimeSyncPacket {
            header,
            sync_type: TimeSyncType::from_u8(p[0])?,
            sync_time_s: u32::from_le_bytes([p[1], p[2], p[3], p[4]]),
            time_since_sync_ds: u32::from_le_bytes([p[5], p[6], p[7], p[8]]),
            correction_ticks: u32::from_le_bytes([p[9], p[10], p[11], p[12]]),
        })
    }
}

// =============================================================================
// MODULE MESSAGES
// =============================================================================

pub mod module_id {
    pub const NODE: u8 = 0;
    pub const STATUS_REPORTER: u8 = 3;
    pub const ENROLLMENT: u8 = 5;
    pub const MESH_ACCESS: u8 = 10;
}

/// Action types under `ModuleGeneral` / `module_id::NODE`.
pub mod node_module_action {
    pub const SET_ENROLLED_NODES: u8 = 1;
    pub const ENROLLED_NODES_REPLY: u8 = 2;
}

/// Generic module message. `data` is the action payload.
#[derive(Debug, Clone)]
pub struct ModulePacket {
    pub header: ConnPacketHeader,
    pub module_id: u8,
    pub request_handle: u8,
    pub action_type: u8,
    pub data: Vec<u8>,
}

impl ModulePacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIZEOF_CONN_PACKET_MODULE + self.data.len());
        self.header.encode_into(&mut out);
        out.push(self.module_id);
        out.push(self.request_handle);
        out.push(self.action_type);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(data: &[u8]) -> Option<ModulePacket> {
        if data.len() < SIZEOF_CONN_PACKET_MODULE {
            return None;
        }
        let header = ConnPacketHeader::decode(data)?;
        Some(ModulePacket {
            header,
            module_id: data[5],
            request_handle: data[6],
            action_type: data[7],
            data: data[SIZEOF_CONN_PACKET_MODULE..].to_vec(),
        })
    }
}

// =============================================================================
// JOIN-ME ADVERTISING PAYLOAD
// =============================================================================

/// Clustering beacon broadcast in the 31-byte advertising buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinMePayload {
    pub sender: NodeId,
    pub network_id: u16,
    pub cluster_id: ClusterId,
    pub cluster_size: ClusterSize,
    pub free_mesh_in_connections: u8,
    pub free_mesh_out_connections: u8,
    pub battery_runtime: u8,
    pub tx_power: i8,
    pub device_type: u8,
    pub hops_to_sink: ClusterSize,
    pub mesh_write_handle: u16,
    pub ack_field: u16,
}

impl JoinMePayload {
    /// Bytes of payload behind the service-data header.
    pub const PAYLOAD_SIZE: usize = 20;

    /// Encodes service-data header plus payload into a 31-byte adv buffer.
    pub fn encode(&self) -> ([u8; crate::types::ADV_PACKET_BUFFER_SIZE], u8) {
        let mut buf = [0u8; crate::types::ADV_PACKET_BUFFER_SIZE];
        // Flags AD structure.
        buf[0] = 2;
        buf[1] = 0x01;
        buf[2] = 0x06;
        // Service data AD structure with the mesh service UUID.
        buf[3] = Self::PAYLOAD_SIZE as u8 + 3;
        buf[4] = 0x16;
        buf[5..7].copy_from_slice(&crate::types::MESH_SERVICE_DATA_SERVICE_UUID16.to_le_bytes());
        let p = &mut buf[7..];
        p[0..2].copy_from_slice(&self.sender.to_le_bytes());
        p[2..4].copy_from_slice(&self.network_id.to_le_bytes());
        p[4..8].copy_from_slice(&self.cluster_id.to_le_bytes());
        p[8..10].copy_from_slice(&self.cluster_size.to_le_bytes());
        p[10] = (self.free_mesh_in_connections & 0x07) | (self.free_mesh_out_connections << 3);
        p[11] = self.battery_runtime;
        p[12] = self.tx_power as u8;
        p[13] = self.device_type;
        p[14..16].copy_from_slice(&self.hops_to_sink.to_le_bytes());
        p[16..18].copy_from_slice(&self.mesh_write_handle.to_le_bytes());
        p[18..20].copy_from_slice(&self.ack_field.to_le_bytes());
        (buf, 7 + 20)
    }

    pub fn decode(buf: &[u8]) -> Option<JoinMePayload> {
        if buf.len() < 27 || buf[4] != 0x16 {
            return None;
        }
        let uuid = u16::from_le_bytes([buf[5], buf[6]]);
        if uuid != crate::types::MESH_SERVICE_DATA_SERVICE_UUID16 {
            return None;
        }
        let p = &buf[7..];
        Some(JoinMePayload {
            sender: u16::from_le_bytes([p[0], p[1]]),
            network_id: u16::from_le_bytes([p[2], p[3]]),
            cluster_id: u32::from_le_bytes([p[4], p[5], p[6], p[7]]),
            cluster_size: i16::from_le_bytes([p[8], p[9]]),
            free_mesh_in_connections: p[10] & 0x07,
            free_mesh_out_connections: p[10] >> 3,
            battery_runtime: p[11],
            tx_power: p[12] as i8,
            device_type: p[13],
            hops_to_sink: i16::from_le_bytes([p[14], p[15]]),
            mesh_write_handle: u16::from_le_bytes([p[16], p[17]]),
            ack_field: u16::from_le_bytes([p[18], p[19]]),
        })
    }
}

// =============================================================================
// SPLIT HEADERS
// =============================================================================

/// Splits `data` into chunks that fit `payload_size`, prefixing each chunk
/// with the 2-byte split header. A message that fits is returned unsplit.
pub fn split_message(data: &[u8], payload_size: usize) -> Vec<Vec<u8>> {
    if data.len() <= payload_size {
        return vec![data.to_vec()];
    }
    let chunk_payload = payload_size - SIZEOF_CONN_PACKET_SPLIT_HEADER;
    let chunks: Vec<&[u8]> = data.chunks(chunk_payload).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut out = Vec::with_capacity(chunk.len() + SIZEOF_CONN_PACKET_SPLIT_HEADER);
            out.push(if i == last {
                MessageType::SplitWriteCmdEnd as u8
            } else {
                MessageType::SplitWriteCmd as u8
            });
            out.push(i as u8);
            out.extend_from_slice(chunk);
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = ConnPacketHeader::new(MessageType::ClusterWelcome, 7, 30001);
        let mut buf = Vec::new();
        h.encode_into(&mut buf);
        assert_eq!(buf.len(), SIZEOF_CONN_PACKET_HEADER);
        assert_eq!(ConnPacketHeader::decode(&buf), Some(h));
    }

    #[test]
    fn cluster_welcome_roundtrip() {
        let w = ClusterWelcome {
            header: ConnPacketHeader::new(MessageType::ClusterWelcome, 1, 30001),
            cluster_id: 0xDEAD_BEEF,
            cluster_size: 5,
            mesh_write_handle: 0x0012,
            hops_to_sink: -1,
            preferred_connection_interval: 0,
            network_id: 10,
        };
        let encoded = w.encode();
        let d = ClusterWelcome::decode(&encoded).unwrap();
        assert_eq!(d.cluster_id, 0xDEAD_BEEF);
        assert_eq!(d.cluster_size, 5);
        assert_eq!(d.hops_to_sink, -1);
        assert_eq!(d.network_id, 10);
        assert!(ClusterWelcome::has_network_id(&encoded));
    }

    #[test]
    fn cluster_info_update_flags() {
        let u = ClusterInfoUpdate {
            sender: 3,
            new_cluster_id: 0x0002_0001,
            cluster_size_change: -4,
            hops_to_sink: 2,
            connection_master_bit_handover: true,
            counter: 1,
        };
        let d = ClusterInfoUpdate::decode(&u.encode()).unwrap();
        assert_eq!(d.new_cluster_id, 0x0002_0001);
        assert_eq!(d.cluster_size_change, -4);
        assert!(d.connection_master_bit_handover);
        assert_eq!(d.counter, 1);
    }

    #[test]
    fn dead_data_magic_matches() {
        let d = DeadData::new(1, 2);
        let encoded = d.encode();
        assert_eq!(encoded.len(), 13);
        assert_eq!(&encoded[5..], &DEAD_DATA_MAGIC);
    }

    #[test]
    fn join_me_roundtrip() {
        let j = JoinMePayload {
            sender: 2,
            network_id: 10,
            cluster_id: 77,
            cluster_size: 3,
            free_mesh_in_connections: 1,
            free_mesh_out_connections: 3,
            battery_runtime: 100,
            tx_power: 4,
            device_type: 1,
            hops_to_sink: -1,
            mesh_write_handle: 0x12,
            ack_field: 0,
        };
        let (buf, len) = j.encode();
        assert!(len as usize <= buf.len());
        assert_eq!(JoinMePayload::decode(&buf), Some(j));
    }

    #[test]
    fn split_message_chunks_and_terminates() {
        let data: Vec<u8> = (0..50).collect();
        let chunks = split_message(&data, 20);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0][0], MessageType::SplitWriteCmd as u8);
        assert_eq!(chunks[1][0], MessageType::SplitWriteCmd as u8);
        assert_eq!(chunks[2][0], MessageType::SplitWriteCmdEnd as u8);
        assert_eq!(chunks[1][1], 1);

        let reassembled: Vec<u8> =
            chunks.iter().flat_map(|c| c[2..].iter().copied()).collect();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn small_message_not_split() {
        let data = vec![1u8; 10];
        assert_eq!(split_message(&data, 20), vec![data]);
    }

    #[test]
    fn min_len_rejects_undersized() {
        assert!(ClusterAck2::decode(&[0u8; 5]).is_none());
        assert!(EncryptCustomANonce::decode(&[0u8; 8]).is_none());
    }
}
