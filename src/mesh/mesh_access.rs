//! Encrypted tunnel connections.
//!
//! The tunnel speaks the encrypt-custom handshake over GATT and encrypts
//! every subsequent packet with AES-128 counter mode plus a 4-byte MIC. The
//! partner appears inside the local mesh under a virtual node id.

use crate::ble::state::{
    MA_RX_CHARACTERISTIC_HANDLE, MA_TX_CCCD_HANDLE, MA_TX_CHARACTERISTIC_HANDLE,
};
use crate::crypto;
use crate::node::{Node, SimCounters};
use crate::proto::{
    ConnPacketHeader, DeadData, EncryptCustomANonce, EncryptCustomDone, EncryptCustomSNonce,
    EncryptCustomStart, MessageType,
};
use crate::types::{
    is_global_device_id, AppDisconnectReason, BleAddress, ConnectionDirection, ConnectionState,
    DataDirection, DeliveryOption, DeliveryPriority, EncryptionState, FmKeyId,
    MeshAccessAuthorization, NodeId, TunnelType, NODE_ID_BROADCAST, NODE_ID_DEVICE_BASE,
    NODE_ID_GROUP_BASE, NODE_ID_VIRTUAL_BASE,
};

use super::connection::{ConnectionVariant, MeshAccessState, MAX_CORRUPTED_MESSAGES};
use crate::config::{GAP_CONNECTING_TIMEOUT_DS, MESH_CONNECTION_INTERVAL_MS};
use tracing::{debug, warn};

impl Node {
    // =========================================================================
    // CONNECT (central)
    // =========================================================================

    /// Opens a tunnel to `address` as central. Returns the unique connection
    /// id, or 0 when no slot was available.
    pub fn mesh_access_connect_as_master(
        &mut self,
        address: BleAddress,
        fm_key_id: FmKeyId,
        tunnel_type: TunnelType,
        custom_key: Option<[u8; 16]>,
        overwrite_virtual_id: NodeId,
        counters: &mut SimCounters,
    ) -> u32 {
        let own_id = self.config.node_id;
        if self.sd.connecting_active {
            // The radio can only set up one link at a time.
            return 0;
        }
        let mut state = MeshAccessState::new(fm_key_id, tunnel_type);
        if let Some(key) = custom_key {
            state.use_custom_key = true;
            state.custom_key = key;
        }
        let Some(slot) = self.cm.allocate(
            ConnectionDirection::Out,
            address,
            self.app_timer_ds,
            ConnectionVariant::MeshAccess(state),
        ) else {
            return 0;
        };
        let conn = self.cm.get_mut(slot).unwrap();
        let ma = conn.mesh_access_mut().unwrap();
        if overwrite_virtual_id != 0 {
            ma.virtual_partner_id = overwrite_virtual_id;
            ma.virtual_partner_id_overwritten = true;
        } else {
            ma.virtual_partner_id = own_id + (slot as NodeId + 1) * NODE_ID_VIRTUAL_BASE;
        }
        let unique_id = conn.unique_id;

        self.gap_connect(address, MESH_CONNECTION_INTERVAL_MS, GAP_CONNECTING_TIMEOUT_DS, counters);
        debug!(node = own_id, ?address, unique_id, "tunnel connect as master");
        unique_id
    }

    // =========================================================================
    // HANDSHAKE
    // =========================================================================

    /// Central: request encryption once the service handles are known.
    pub(crate) fn start_mesh_access_handshake(&mut self, slot: usize, counters: &mut SimCounters) {
        let own_id = self.config.node_id;
        let Some(conn) = self.cm.get_mut(slot) else { return };
        if conn.state >= ConnectionState::Handshaking {
            return;
        }
        conn.state = ConnectionState::Handshaking;
        conn.handshake_started_ds = self.app_timer_ds;
        let ma = conn.mesh_access().unwrap();
        let packet = EncryptCustomStart {
            header: ConnPacketHeader::new(
                MessageType::EncryptCustomStart,
                own_id,
                ma.virtual_partner_id,
            ),
            version: 1,
            fm_key_id: ma.fm_key_id.0,
            tunnel_type: ma.tunnel_type as u8,
        };
        debug!(node = own_id, slot, "tunnel handshake: sending start");
        self.mesh_access_send_data(slot, &packet.encode(), counters);
    }

    /// Peripheral: answer the start packet with our nonce.
    fn handshake_anonce(&mut self, slot: usize, packet: &EncryptCustomStart, counters: &mut SimCounters) {
        let own_id = self.config.node_id;
        {
            let Some(conn) = self.cm.get_mut(slot) else { return };
            conn.state = ConnectionState::Handshaking;
            conn.handshake_started_ds = self.app_timer_ds;
            conn.partner_id = packet.header.sender;
        }
        if packet.header.sender == NODE_ID_BROADCAST {
            warn!(node = own_id, "tunnel partner used the broadcast id");
            self.disconnect_and_remove(slot, AppDisconnectReason::WrongPartnerId, counters);
            return;
        }
        let tunnel_type = TunnelType::from_u8(packet.tunnel_type).dual();
        if tunnel_type == TunnelType::Invalid {
            warn!(node = own_id, raw = packet.tunnel_type, "illegal tunnel type");
            self.disconnect_and_remove(slot, AppDisconnectReason::IllegalTunnelType, counters);
            return;
        }

        let anonce = [counters.rng.next_u32(), counters.rng.next_u32()];
        let partner_id = packet.header.sender;
        {
            let conn = self.cm.get_mut(slot).unwrap();
            let ma = conn.mesh_access_mut().unwrap();
            ma.fm_key_id = FmKeyId(packet.fm_key_id);
            ma.tunnel_type = tunnel_type;
            ma.decryption_nonce = anonce;
        }
        // The session decryption key is derived from the central's node id
        // and our nonce.
        let Some(long_term_key) = resolve_long_term_key(self, slot) else {
            warn!(node = own_id, "invalid key for tunnel handshake");
            self.disconnect_and_remove(slot, AppDisconnectReason::InvalidKey, counters);
            return;
        };
        {
            let conn = self.cm.get_mut(slot).unwrap();
            let ma = conn.mesh_access_mut().unwrap();
            ma.session_decryption_key = crypto::derive_session_key(&anonce, partner_id, &long_term_key);
        }

        let virtual_partner_id = self
            .cm
            .get(slot)
            .and_then(|c| c.mesh_access())
            .map(|m| m.virtual_partner_id)
            .unwrap_or(0);
        let reply = EncryptCustomANonce {
            header: ConnPacketHeader::new(MessageType::EncryptCustomANonce, own_id, virtual_partner_id),
            anonce,
        };
        debug!(node = own_id, slot, "tunnel handshake: sending anonce");
        let handle = self.mesh_access_send_raw(slot, &reply.encode(), counters);
        if let Some(handle) = handle {
            if let Some(ma) = self.cm.get_mut(slot).and_then(|c| c.mesh_access_mut()) {
                // Encryption starts once this packet has left the device.
                ma.anonce_message_handle = handle;
            }
        }
    }

    /// Central: the partner's nonce arrived, finish key derivation.
    fn on_anonce_received(&mut self, slot: usize, packet: &EncryptCustomANonce, counters: &mut SimCounters) {
        let own_id = self.config.node_id;
        let snonce = [counters.rng.next_u32(), counters.rng.next_u32()];
        {
            let Some(conn) = self.cm.get_mut(slot) else { return };
            conn.partner_id = packet.header.sender;
            let ma = conn.mesh_access_mut().unwrap();
            ma.encryption_nonce = packet.anonce;
            ma.decryption_nonce = snonce;
        }
        let Some(long_term_key) = resolve_long_term_key(self, slot) else {
            warn!(node = own_id, "invalid key for tunnel handshake");
            self.disconnect_and_remove(slot, AppDisconnectReason::InvalidKey, counters);
            return;
        };
        let virtual_partner_id;
        {
            let conn = self.cm.get_mut(slot).unwrap();
            let mtu = conn.connection_mtu;
            // Both session keys are derived from the central's id, i.e. ours.
            let ma = conn.mesh_access_mut().unwrap();
            ma.session_encryption_key =
                crypto::derive_session_key(&packet.anonce, own_id, &long_term_key);
            ma.session_decryption_key = crypto::derive_session_key(&snonce, own_id, &long_term_key);
            virtual_partner_id = ma.virtual_partner_id;
            // The next outgoing packet (the snonce) must already be encrypted.
            conn.encryption_state = EncryptionState::Encrypted;
            conn.connection_payload_size = mtu - crypto::MIC_LENGTH as u16;
        }

        let reply = EncryptCustomSNonce {
            header: ConnPacketHeader::new(MessageType::EncryptCustomSNonce, own_id, virtual_partner_id),
            snonce,
        };
        debug!(node = own_id, slot, "tunnel handshake: sending snonce");
        self.mesh_access_send_raw(slot, &reply.encode(), counters);

        {
            let conn = self.cm.get_mut(slot).unwrap();
            conn.state = ConnectionState::HandshakeDone;
        }
        self.cm.pending_connection = None;
        self.send_cluster_state(slot, counters);
        self.notify_tunnel_subscriber(slot, ConnectionState::HandshakeDone, counters);
        debug!(node = own_id, "tunnel handshake done as central");
    }

    /// Peripheral: the encrypted snonce arrived, derive the last key.
    fn on_snonce_received(&mut self, slot: usize, packet: &EncryptCustomSNonce, counters: &mut SimCounters) {
        let own_id = self.config.node_id;
        let partner_id;
        {
            let Some(conn) = self.cm.get_mut(slot) else { return };
            partner_id = conn.partner_id;
            let ma = conn.mesh_access_mut().unwrap();
            ma.encryption_nonce = packet.snonce;
        }
        let Some(long_term_key) = resolve_long_term_key(self, slot) else {
            warn!(node = own_id, "invalid key in final handshake step");
            self.disconnect_and_remove(slot, AppDisconnectReason::InvalidKey, counters);
            return;
        };
        let virtual_partner_id;
        {
            let conn = self.cm.get_mut(slot).unwrap();
            let mtu = conn.connection_mtu;
            let ma = conn.mesh_access_mut().unwrap();
            ma.session_encryption_key =
                crypto::derive_session_key(&packet.snonce, partner_id, &long_term_key);
            ma.amount_of_corrupted_messages = 0;
            ma.allow_corrupted_encryption_start = false;
            virtual_partner_id = ma.virtual_partner_id;
            conn.state = ConnectionState::HandshakeDone;
            conn.connection_payload_size = mtu - crypto::MIC_LENGTH as u16;
        }

        let done = EncryptCustomDone {
            header: ConnPacketHeader::new(MessageType::EncryptCustomDone, own_id, virtual_partner_id),
            status: 0,
        };
        self.mesh_access_send_raw(slot, &done.encode(), counters);
        self.send_cluster_state(slot, counters);
        self.notify_tunnel_subscriber(slot, ConnectionState::HandshakeDone, counters);
        debug!(node = own_id, "tunnel handshake done as peripheral");
    }

    /// Tells the tunnel partner our current clustering state.
    fn send_cluster_state(&mut self, slot: usize, counters: &mut SimCounters) {
        let packet = crate::proto::ClusterInfoUpdate {
            sender: self.config.node_id,
            new_cluster_id: 0,
            cluster_size_change: self.cluster_size,
            hops_to_sink: self.hops_to_sink_excluding(None),
            connection_master_bit_handover: false,
            counter: 0,
        };
        self.mesh_access_send_data(slot, &packet.encode(), counters);
    }

    fn notify_tunnel_subscriber(&mut self, slot: usize, state: ConnectionState, counters: &mut SimCounters) {
        let Some(conn) = self.cm.get(slot) else { return };
        let Some(ma) = conn.mesh_access() else { return };
        let subscriber = ma.connection_state_subscriber_id;
        let virtual_partner = ma.virtual_partner_id;
        if subscriber != 0 {
            self.notify_connection_state_subscriber(subscriber, virtual_partner, state, counters);
        }
    }

    // =========================================================================
    // CORRUPTED MESSAGES
    // =========================================================================

    fn on_corrupted_message(&mut self, slot: usize, counters: &mut SimCounters) {
        let own_id = self.config.node_id;
        let virtual_partner_id;
        let corrupted;
        {
            let Some(conn) = self.cm.get_mut(slot) else { return };
            let app_timer = self.app_timer_ds;
            let ma = conn.mesh_access_mut().unwrap();
            ma.amount_of_corrupted_messages += 1;
            corrupted = ma.amount_of_corrupted_messages;
            virtual_partner_id = ma.virtual_partner_id;
            if corrupted == 1 {
                // First failure of this handshake cycle: drop back to the
                // unencrypted connected state and open a re-handshake window.
                ma.allow_corrupted_encryption_start = true;
                conn.encryption_state = EncryptionState::NotEncrypted;
                conn.state = ConnectionState::Connected;
                conn.handshake_started_ds = app_timer + crate::types::sec_to_ds(10);
            }
        }

        warn!(node = own_id, slot, corrupted, "corrupted tunnel message");
        let msg = DeadData::new(own_id, virtual_partner_id);
        self.mesh_access_send_raw(slot, &msg.encode(), counters);

        if corrupted >= MAX_CORRUPTED_MESSAGES {
            self.disconnect_and_remove(slot, AppDisconnectReason::InvalidPacket, counters);
        }
    }

    // =========================================================================
    // SEND
    // =========================================================================

    /// Sends tunnel traffic, applying the routing gate, authorization and the
    /// virtual-id rewrite. Returns true when the packet was queued.
    pub(crate) fn mesh_access_send_data(
        &mut self,
        slot: usize,
        data: &[u8],
        counters: &mut SimCounters,
    ) -> bool {
        let Some(header) = ConnPacketHeader::decode(data) else { return false };
        let Some(conn) = self.cm.get(slot) else { return false };
        let Some(ma) = conn.mesh_access() else { return false };
        let state = conn.state;
        let fm_key_id = ma.fm_key_id;
        let tunnel_type = ma.tunnel_type;
        let virtual_partner_id = ma.virtual_partner_id;
        let partner_id = conn.partner_id;

        // Pre-handshake, only the handshake itself and dead data pass.
        if state < ConnectionState::HandshakeDone
            && !header.message_type.is_encrypt_custom()
            && header.message_type != MessageType::DeadData
        {
            return false;
        }

        let auth = self.check_authorization(data, fm_key_id, DataDirection::Out);
        if auth == MeshAccessAuthorization::Undetermined
            || auth == MeshAccessAuthorization::Blacklist
        {
            return false;
        }

        // Messages addressed into our own mesh stay there unless this tunnel
        // leads to a remote mesh.
        if header.receiver > NODE_ID_DEVICE_BASE
            && header.receiver < NODE_ID_GROUP_BASE
            && header.receiver != virtual_partner_id
            && tunnel_type != TunnelType::RemoteMesh
            && !header.message_type.is_encrypt_custom()
            && header.message_type != MessageType::DeadData
        {
            return false;
        }

        // The partner knows itself by its real id, not our virtual alias.
        let mut owned;
        let data = if header.receiver == virtual_partner_id {
            owned = data.to_vec();
            ConnPacketHeader::patch_receiver(&mut owned, partner_id);
            &owned[..]
        } else {
            data
        };
        self.mesh_access_send_raw(slot, data, counters).is_some()
    }

    /// Queues bytes on the tunnel without routing checks.
    fn mesh_access_send_raw(
        &mut self,
        slot: usize,
        data: &[u8],
        counters: &mut SimCounters,
    ) -> Option<u32> {
        let Some(conn) = self.cm.get(slot) else { return None };
        let (delivery, characteristic_handle) = match conn.direction {
            // The central writes into the peripheral's rx characteristic.
            ConnectionDirection::Out => (
                DeliveryOption::WriteCmd,
                conn.mesh_access().map(|m| m.partner_rx_characteristic_handle).unwrap_or(MA_RX_CHARACTERISTIC_HANDLE),
            ),
            // The peripheral notifies from its own tx characteristic.
            ConnectionDirection::In => (DeliveryOption::Notification, MA_TX_CHARACTERISTIC_HANDLE),
        };
        self.send_on_connection(
            slot,
            data.to_vec(),
            delivery,
            characteristic_handle,
            DeliveryPriority::High,
            counters,
        )
    }

    // =========================================================================
    // RECEIVE
    // =========================================================================

    pub(crate) fn receive_mesh_access_data(
        &mut self,
        slot: usize,
        characteristic_handle: u16,
        data: &[u8],
        counters: &mut SimCounters,
    ) {
        let Some(conn) = self.cm.get(slot) else { return };
        match conn.direction {
            ConnectionDirection::Out => {
                if characteristic_handle != MA_TX_CHARACTERISTIC_HANDLE {
                    return;
                }
            }
            ConnectionDirection::In => {
                if characteristic_handle == MA_TX_CCCD_HANDLE {
                    // Notification subscription, carries no payload.
                    return;
                }
                if characteristic_handle != MA_RX_CHARACTERISTIC_HANDLE {
                    return;
                }
            }
        }

        let encrypted = conn.encryption_state == EncryptionState::Encrypted;
        let state = conn.state;
        let decryption_nonce = conn.mesh_access().map(|m| m.decryption_nonce).unwrap_or([0; 2]);
        let decryption_key =
            conn.mesh_access().map(|m| m.session_decryption_key).unwrap_or([0; 16]);

        let plaintext: Vec<u8>;
        let data: &[u8] = if encrypted {
            match crypto::decrypt_packet(data, &decryption_nonce, &decryption_key) {
                Some(p) => {
                    let conn = self.cm.get_mut(slot).unwrap();
                    let ma = conn.mesh_access_mut().unwrap();
                    ma.decryption_nonce[1] = ma.decryption_nonce[1].wrapping_add(2);
                    plaintext = p;
                    &plaintext
                }
                None => {
                    if state < ConnectionState::HandshakeDone {
                        warn!(node = self.id, slot, "invalid packet during tunnel handshake");
                        self.disconnect_and_remove(
                            slot,
                            AppDisconnectReason::InvalidHandshakePacket,
                            counters,
                        );
                    } else {
                        self.on_corrupted_message(slot, counters);
                    }
                    return;
                }
            }
        } else {
            data
        };

        let Some(header) = ConnPacketHeader::decode(data) else { return };
        let Some(conn) = self.cm.get(slot) else { return };
        match conn.state {
            ConnectionState::Connected => {
                let allow_corrupted = conn
                    .mesh_access()
                    .map(|m| m.allow_corrupted_encryption_start)
                    .unwrap_or(false);
                if header.message_type == MessageType::EncryptCustomStart {
                    if let Some(packet) = EncryptCustomStart::decode(data) {
                        self.handshake_anonce(slot, &packet, counters);
                    }
                } else if !allow_corrupted {
                    self.disconnect_and_remove(
                        slot,
                        AppDisconnectReason::InvalidHandshakePacket,
                        counters,
                    );
                }
            }
            ConnectionState::Handshaking => match header.message_type {
                MessageType::EncryptCustomANonce => {
                    if let Some(packet) = EncryptCustomANonce::decode(data) {
                        self.on_anonce_received(slot, &packet, counters);
                    }
                }
                MessageType::EncryptCustomSNonce => {
                    if let Some(packet) = EncryptCustomSNonce::decode(data) {
                        self.on_snonce_received(slot, &packet, counters);
                    }
                }
                _ => {
                    self.disconnect_and_remove(
                        slot,
                        AppDisconnectReason::InvalidHandshakePacket,
                        counters,
                    );
                }
            },
            ConnectionState::HandshakeDone => {
                let Some(conn) = self.cm.get_mut(slot) else { return };
                if let Some(message) = conn.reassemble(data) {
                    self.receive_mesh_access_message(slot, &message, counters);
                }
            }
            _ => {}
        }
    }

    fn receive_mesh_access_message(&mut self, slot: usize, data: &[u8], counters: &mut SimCounters) {
        let Some(header) = ConnPacketHeader::decode(data) else { return };
        let Some(conn) = self.cm.get(slot) else { return };
        let Some(ma) = conn.mesh_access() else { return };
        let partner_id = conn.partner_id;
        let virtual_partner_id = ma.virtual_partner_id;
        let overwritten = ma.virtual_partner_id_overwritten;
        let tunnel_type = ma.tunnel_type;
        let fm_key_id = ma.fm_key_id;

        // Our partner's real id may clash with ids inside our mesh, so the
        // sender is replaced by the virtual alias. Partners with a globally
        // unique id keep it, unless the user pinned a different alias.
        let replace_sender = !(is_global_device_id(partner_id) && !overwritten);
        let mut owned;
        let data: &[u8] = if header.sender == partner_id && replace_sender {
            owned = data.to_vec();
            ConnPacketHeader::patch_sender(&mut owned, virtual_partner_id);
            &owned
        } else {
            data
        };

        let auth = self.check_authorization(data, fm_key_id, DataDirection::In);
        if auth == MeshAccessAuthorization::Undetermined
            || auth == MeshAccessAuthorization::Blacklist
        {
            debug!(node = self.id, slot, "unauthorized tunnel packet dropped");
            return;
        }

        let header = ConnPacketHeader::decode(data).unwrap();
        match tunnel_type {
            TunnelType::PeerToPeer | TunnelType::RemoteMesh => {
                // Never routed into the local mesh.
                if auth <= MeshAccessAuthorization::LocalOnly {
                    self.dispatch_mesh_message(Some(slot), data, true, counters);
                }
            }
            TunnelType::LocalMesh => {
                if auth <= MeshAccessAuthorization::Whitelist {
                    self.route_mesh_data(slot, data, counters);
                }
                if auth <= MeshAccessAuthorization::LocalOnly {
                    self.dispatch_mesh_message(Some(slot), data, true, counters);
                }
            }
            TunnelType::Invalid => {
                if header.message_type.is_encrypt_custom()
                    && auth <= MeshAccessAuthorization::LocalOnly
                {
                    self.dispatch_mesh_message(Some(slot), data, true, counters);
                }
            }
        }
    }
}

/// Resolves the long-term key for a tunnel connection from its key id.
fn resolve_long_term_key(node: &Node, slot: usize) -> Option<[u8; 16]> {
    let conn = node.cm.get(slot)?;
    let ma = conn.mesh_access()?;
    let key = if ma.use_custom_key {
        ma.custom_key
    } else {
        match ma.fm_key_id {
            FmKeyId::ZERO => {
                // Only usable while not enrolled or when we opened the
                // connection ourselves.
                if node.config.network_id != 0 && conn.direction == ConnectionDirection::In {
                    return None;
                }
                [0u8; 16]
            }
            FmKeyId::NODE => node.config.node_key,
            FmKeyId::NETWORK => node.config.network_key,
            FmKeyId::ORGANIZATION => node.config.organization_key,
            FmKeyId::RESTRAINED => {
                // Restrained key is derived from the node key.
                crypto::derive_user_key(FmKeyId::RESTRAINED.0, &node.config.node_key)
            }
            id if id.is_user_derived() => crypto::derive_user_key(id.0, &node.config.user_base_key),
            _ => return None,
        }
    };
    if crypto::is_unprogrammed(&key) {
        return None;
    }
    Some(key)
}
