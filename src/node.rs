//! One simulated node: identity, lifecycle and the firmware logic that runs
//! against its own softdevice state.
//!
//! Firmware code only ever touches the node it runs on. Cross-node effects
//! (packet delivery, GAP disconnects of the partner side) go through the
//! event queue or the outbox, which the scheduler applies after the node's
//! frame. That keeps the borrow graph flat and matches how the radio behaves:
//! nothing a node does is observable at the partner before the partner runs.

use crate::ble::state::{
    BLE_CONN_HANDLE_INVALID, MA_RX_CHARACTERISTIC_HANDLE, MA_SERVICE_UUID16, MA_TX_CCCD_HANDLE,
    MESH_WRITE_CHARACTERISTIC_HANDLE,
};
use crate::ble::{BleEventKind, EventQueue, SimBleEvent, SoftdeviceState, TimeoutSource};
use crate::config::{
    self, DISCOVERY_HIGH_DECISION_INTERVAL_DS, DISCOVERY_LOW_DECISION_INTERVAL_DS,
    ENROLLED_NODES_SYNC_INTERVAL_DS, GAP_CONNECTING_TIMEOUT_DS, GATT_MTU_SIZE_UPGRADED,
    MESH_CONNECTION_INTERVAL_MS, MESH_HANDSHAKE_TIMEOUT_DS, TIME_BETWEEN_TIME_SYNC_INTERVALS_DS,
};
use crate::flash::Flash;
use crate::mesh::{
    ConnectionManager, ConnectionVariant, MeshAccessState, MeshState, TimeSyncState,
};
use crate::proto::{
    module_id, node_module_action, ConnPacketHeader, JoinMePayload, MessageType, ModulePacket,
    TimeSyncPacket, SIZEOF_CONN_PACKET_HEADER,
};
use crate::rng::should_iv_trigger;
use crate::time::TimeManager;
use crate::types::{
    is_global_device_id, sec_to_ds, AppDisconnectReason, BleAddress, ClusterId, ClusterSize,
    ConnectionDirection, ConnectionState, DeliveryOption, DeliveryPriority, DeviceType, FmKeyId,
    HciError, MeshAccessAuthorization, NodeId, Position, RebootReason, TunnelType,
    NODE_ID_ANYCAST_THEN_BROADCAST, NODE_ID_APP_BASE, NODE_ID_APP_BASE_SIZE, NODE_ID_BROADCAST,
    NODE_ID_HOPS_BASE, NODE_ID_HOPS_BASE_SIZE, NODE_ID_LOCAL_LOOPBACK, NODE_ID_SHORTEST_SINK,
    NODE_ID_VIRTUAL_BASE,
};
use tracing::{debug, warn};

/// Start of the open serial-number range used for fabricated devices.
pub const SERIAL_INDEX_START: u32 = 2_673_000;

/// Outcome of draining the firmware event loop for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    Done,
    /// The firmware requested a software reset; the driver reboots the node.
    Reset(RebootReason),
}

/// Cross-node actions a node requests from the scheduler.
#[derive(Debug, Clone, Copy)]
pub enum SimRequest {
    GapDisconnect {
        conn_handle: u16,
        hci_reason: HciError,
        hci_reason_partner: HciError,
    },
}

/// Shared simulation context threaded into node code: globally monotonic
/// event/packet ids, the current virtual time, and the tick-seeded RNG that
/// all randomness must come from.
pub struct SimCounters {
    pub global_event_id: u32,
    pub global_packet_id: u32,
    /// Read-only copy of the current virtual time for firmware code.
    pub sim_time_ms: u32,
    pub rng: crate::rng::RngStream,
}

impl SimCounters {
    pub fn new(seed: u32) -> SimCounters {
        SimCounters {
            global_event_id: 0,
            global_packet_id: 0,
            sim_time_ms: 0,
            rng: crate::rng::RngStream::new(seed),
        }
    }

    pub fn next_event_id(&mut self) -> u32 {
        let id = self.global_event_id;
        self.global_event_id += 1;
        id
    }

    pub fn next_packet_id(&mut self) -> u32 {
        let id = self.global_packet_id;
        self.global_packet_id += 1;
        id
    }
}

/// Per-node module authorization hook for tunnel traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationPolicy {
    /// Whitelists well-formed traffic, the behavior of a stock image.
    Default,
    /// Forces a fixed verdict, used by tests to exercise drop paths.
    Fixed(MeshAccessAuthorization),
}

/// Journal entry for every message dispatched to this node's modules.
#[derive(Debug, Clone)]
pub struct ReceivedMeshMessage {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub message_type: MessageType,
    pub data: Vec<u8>,
    pub over_mesh_access: bool,
}

/// Persistent per-node configuration, loaded at boot.
#[derive(Debug, Clone)]
pub struct NodeConfiguration {
    pub node_id: NodeId,
    pub network_id: u16,
    pub device_type: DeviceType,
    pub node_key: [u8; 16],
    pub network_key: [u8; 16],
    pub organization_key: [u8; 16],
    pub user_base_key: [u8; 16],
    pub number_of_enrolled_devices: u16,
}

pub struct Node {
    // Identity, preserved across resets.
    pub index: usize,
    pub id: NodeId,
    pub serial_index: u32,
    pub address: BleAddress,
    pub position: Position,
    pub flash: Flash,

    // Volatile state, rebuilt at boot.
    pub sd: SoftdeviceState,
    pub event_queue: EventQueue,
    pub cm: ConnectionManager,
    pub config: NodeConfiguration,
    pub cluster_id: ClusterId,
    pub cluster_size: ClusterSize,
    cluster_id_counter: u16,
    pub app_timer_ds: u32,
    timer_remainder_ms: u32,
    pub time: TimeManager,
    pub discovery_high: bool,
    pub discovery_off: bool,
    pub join_me_candidates: Vec<JoinMePayload>,
    pub restart_counter: u32,
    pub reboot_reason: RebootReason,
    pub simulated_frames: i64,
    pub nano_ampere_per_ms_total: u64,
    pub fake_dfu_version: u32,
    pub led_on: bool,
    /// Opaque per-boot scratch the firmware hands to its HAL layers.
    pub hal_memory: Vec<u8>,
    pub auth_policy: AuthorizationPolicy,
    pub watchdog_last_feed_ds: u32,
    want_reset: Option<RebootReason>,

    /// Node indices this node can never reach, regardless of distance.
    pub impossible_connections: Vec<usize>,

    /// Partners this node prefers; empty means everyone is acceptable.
    pub preferred_connections: Vec<NodeId>,
    /// When set, non-preferred partners are rejected during the handshake.
    pub preferred_connections_ignore_others: bool,

    pub received_messages: Vec<ReceivedMeshMessage>,
    pub outbox: Vec<SimRequest>,
    pub json_log: Vec<String>,
    pub terminal_output: Vec<String>,

    /// Reestablishment budget in seconds, 0 disables it. Written by the
    /// simulator at node creation so firmware code never reaches into the
    /// simulator config.
    pub reestablishment_timeout_sec_value: u32,
}

impl Node {
    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Creates the node as the factory would: erased flash, provisioned UICR.
    pub fn init(index: usize, flash_size: usize) -> Node {
        let id = (index + 1) as NodeId;
        let serial_index = SERIAL_INDEX_START + index as u32;
        let mut flash = Flash::new(flash_size);
        flash.seed_uicr(serial_index, 4);
        Node {
            index,
            id,
            serial_index,
            address: BleAddress::from_node_id(id),
            position: Position::default(),
            flash,
            sd: SoftdeviceState::new(),
            event_queue: EventQueue::default(),
            cm: ConnectionManager::new(),
            config: NodeConfiguration {
                node_id: id,
                network_id: 0,
                device_type: DeviceType::Static,
                node_key: [0; 16],
                network_key: [0; 16],
                organization_key: [0; 16],
                user_base_key: [0; 16],
                number_of_enrolled_devices: 0,
            },
            cluster_id: 0,
            cluster_size: 1,
            cluster_id_counter: 0,
            app_timer_ds: 0,
            timer_remainder_ms: 0,
            time: TimeManager::default(),
            discovery_high: true,
            discovery_off: false,
            join_me_candidates: Vec::new(),
            restart_counter: 0,
            reboot_reason: RebootReason::Unknown,
            simulated_frames: 0,
            nano_ampere_per_ms_total: 0,
            fake_dfu_version: 0,
            led_on: false,
            hal_memory: Vec::new(),
            auth_policy: AuthorizationPolicy::Default,
            watchdog_last_feed_ds: 0,
            want_reset: None,
            impossible_connections: Vec::new(),
            preferred_connections: Vec::new(),
            preferred_connections_ignore_others: false,
            received_messages: Vec::new(),
            outbox: Vec::new(),
            json_log: Vec::new(),
            terminal_output: Vec::new(),
            reestablishment_timeout_sec_value: 10,
        }
    }

    /// "Flashes" the default configuration into UICR, as a deployment would.
    pub fn flash_defaults(&mut self, network_id: u16, device_type: DeviceType) {
        self.flash.set_uicr_identity(network_id, self.id, device_type as u8);
    }

    /// Boots the firmware: loads the config, rebuilds all volatile state and
    /// starts discovery.
    pub fn boot(&mut self) {
        // A persisted settings record wins over the factory UICR values, so a
        // restored flash image carries its enrollment state.
        if let Some(record) = self.flash.read_settings_record() {
            self.config.node_id = record.node_id;
            self.config.network_id = record.network_id;
            self.config.number_of_enrolled_devices = record.number_of_enrolled_devices;
        } else {
            self.config.node_id = self.flash.uicr_node_id().unwrap_or(self.id);
            self.config.network_id = self.flash.uicr_network_id().unwrap_or(0);
            self.persist_settings();
        }
        self.config.node_key = self.flash.node_key();
        self.id = self.config.node_id;

        self.sd = SoftdeviceState::new();
        self.sd.initialized = true;
        self.event_queue.clear();
        self.cm = ConnectionManager::new();
        self.join_me_candidates.clear();
        self.time = TimeManager::default();
        self.app_timer_ds = 0;
        self.timer_remainder_ms = 0;
        self.watchdog_last_feed_ds = 0;
        self.want_reset = None;
        self.cluster_size = 1;
        self.cluster_id = self.generate_cluster_id();
        self.restart_counter += 1;
        self.discovery_high = true;
        self.discovery_off = false;
        self.hal_memory.clear();

        self.flash.place_bootloader_settings_marker().ok();

        // Bring up discovery: scanning plus a connectable join-me beacon.
        self.sd.scanning_active = self.config.device_type != DeviceType::Asset;
        self.sd.scan_interval_ms = 100;
        self.sd.scan_window_ms = 50;
        self.refresh_advertising();
        debug!(node = self.id, cluster_id = self.cluster_id, "node booted");
    }

    /// Writes the current configuration into the flash settings page.
    pub fn persist_settings(&mut self) {
        let record = crate::flash::SettingsRecord {
            network_id: self.config.network_id,
            node_id: self.config.node_id,
            device_type: self.config.device_type as u8,
            number_of_enrolled_devices: self.config.number_of_enrolled_devices,
        };
        self.flash.write_settings_record(&record).ok();
    }

    /// Requests a software reset; honored by the driver at the next pump.
    pub fn queue_reset(&mut self, reason: RebootReason) {
        self.want_reset = Some(reason);
    }

    /// Performs the reset: everything except index, id, address, position and
    /// flash is rebuilt.
    pub fn reset(&mut self, reason: RebootReason) {
        self.reboot_reason = reason;
        self.boot();
    }

    pub fn generate_cluster_id(&mut self) -> ClusterId {
        self.cluster_id_counter = self.cluster_id_counter.wrapping_add(1);
        ((self.cluster_id_counter as u32) << 16) | self.id as u32
    }

    pub fn is_sink(&self) -> bool {
        self.config.device_type == DeviceType::Sink
    }

    /// 0 when we are a sink, otherwise one more than the best neighbor.
    pub fn hops_to_sink(&self) -> ClusterSize {
        if self.is_sink() {
            0
        } else {
            self.cm.mesh_hops_to_shortest_sink(None)
        }
    }

    // =========================================================================
    // ADVERTISING / DISCOVERY
    // =========================================================================

    pub fn refresh_advertising(&mut self) {
        if self.discovery_off {
            self.sd.advertising_active = false;
            return;
        }
        let join_me = JoinMePayload {
            sender: self.config.node_id,
            network_id: self.config.network_id,
            cluster_id: self.cluster_id,
            cluster_size: self.cluster_size,
            free_mesh_in_connections: self.cm.free_mesh_in(),
            free_mesh_out_connections: self.cm.free_mesh_out(),
            battery_runtime: 100,
            tx_power: config::DEFAULT_DBM_TX,
            device_type: self.config.device_type as u8,
            hops_to_sink: self.hops_to_sink(),
            mesh_write_handle: MESH_WRITE_CHARACTERISTIC_HANDLE,
            ack_field: 0,
        };
        let (data, len) = join_me.encode();
        self.sd.advertising_data = data;
        self.sd.advertising_data_length = len;
        self.sd.advertising_active = true;
        self.sd.advertising_interval_ms = if self.discovery_high {
            config::ADV_INTERVAL_HIGH_MS
        } else {
            config::ADV_INTERVAL_LOW_MS
        };
        // Connectable while the softdevice can take another peripheral link;
        // whether a mesh connection is accepted on it is decided later by the
        // resolver against the mesh-in quota. Assets never accept connections.
        let connectable = self.config.device_type != DeviceType::Asset
            && self.sd.active_peripheral_count() < self.sd.configured_peripheral_connection_count;
        self.sd.advertising_type = if connectable { 0 } else { 2 };
    }

    // =========================================================================
    // TIMER
    // =========================================================================

    /// Advances the decisecond app timer by one tick of virtual time.
    pub fn simulate_timer(&mut self, tick_ms: u32, counters: &mut SimCounters) {
        self.timer_remainder_ms += tick_ms;
        let passed_ds = self.timer_remainder_ms / 100;
        if passed_ds == 0 {
            return;
        }
        self.timer_remainder_ms %= 100;
        self.app_timer_ds += passed_ds;
        self.timer_event_handler(passed_ds, counters);
    }

    fn timer_event_handler(&mut self, passed_ds: u32, counters: &mut SimCounters) {
        self.time.add_ticks(passed_ds);
        self.refresh_advertising();

        self.connection_manager_timer(passed_ds, counters);

        let decision_iv = if self.discovery_high {
            DISCOVERY_HIGH_DECISION_INTERVAL_DS
        } else {
            DISCOVERY_LOW_DECISION_INTERVAL_DS
        };
        if should_iv_trigger(self.app_timer_ds, passed_ds, decision_iv) {
            self.clustering_decision(counters);
        }
    }

    /// Periodic connection upkeep: averages, timeouts, sync protocols.
    fn connection_manager_timer(&mut self, passed_ds: u32, counters: &mut SimCounters) {
        // Flush queues that could not be flushed earlier.
        if should_iv_trigger(self.app_timer_ds, passed_ds, sec_to_ds(1))
            && self.cm.pending_packets() > 0
        {
            for slot in self.cm.occupied_slots() {
                self.fill_transmit_buffers(slot, counters);
            }
        }

        for slot in self.cm.occupied_slots() {
            let Some(conn) = self.cm.get_mut(slot) else { continue };
            conn.update_rssi_average();

            let state = conn.state;
            let handshake_started = conn.handshake_started_ds;
            let creation_time = conn.creation_time_ds;
            let unique_id = conn.unique_id;
            let is_pending = self.cm.pending_connection == Some(unique_id);

            // A pending connection that got stuck is an implementation error;
            // clean it up after a grace period.
            if is_pending {
                let base = if handshake_started > 0 { handshake_started + MESH_HANDSHAKE_TIMEOUT_DS } else { creation_time };
                if self.app_timer_ds > base + sec_to_ds(10) {
                    warn!(node = self.id, slot, "pending connection timed out");
                    self.disconnect_and_remove(slot, AppDisconnectReason::PendingTimeout, counters);
                    continue;
                }
            }
            // Handshake took too long.
            else if state >= ConnectionState::Connected
                && state < ConnectionState::HandshakeDone
                && handshake_started != 0
                && handshake_started + MESH_HANDSHAKE_TIMEOUT_DS <= self.app_timer_ds
            {
                debug!(node = self.id, slot, ?state, "handshake timeout");
                self.disconnect_and_remove(slot, AppDisconnectReason::HandshakeTimeout, counters);
                continue;
            }
            // An inbound link whose first write never arrived must not keep
            // its slot forever.
            else if state == ConnectionState::Connected
                && handshake_started == 0
                && self.cm.get(slot).map(|c| c.variant.is_resolver()).unwrap_or(false)
                && creation_time + MESH_HANDSHAKE_TIMEOUT_DS <= self.app_timer_ds
            {
                debug!(node = self.id, slot, "resolver timeout");
                self.disconnect_and_remove(slot, AppDisconnectReason::PendingTimeout, counters);
                continue;
            }

            // Reestablishment retry and timeout.
            let Some(conn) = self.cm.get(slot) else { continue };
            if let Some(mesh) = conn.mesh() {
                if mesh.must_retry_reestablishing {
                    self.try_reestablishing(slot, counters);
                    continue;
                }
                if (conn.state == ConnectionState::Reestablishing
                    || conn.state == ConnectionState::ReestablishingHandshake)
                    && mesh.reestablishment_started_ds
                        + sec_to_ds(self.reestablishment_timeout_sec())
                        <= self.app_timer_ds
                {
                    debug!(node = self.id, slot, "reconnect timeout");
                    self.disconnect_and_remove(slot, AppDisconnectReason::ReconnectTimeout, counters);
                    continue;
                }
            }

            // Scheduled removal of tunnel connections.
            let Some(conn) = self.cm.get(slot) else { continue };
            if let Some(ma) = conn.mesh_access() {
                if ma.scheduled_connection_removal_time_ds != 0
                    && ma.scheduled_connection_removal_time_ds <= self.app_timer_ds
                {
                    self.disconnect_and_remove(slot, AppDisconnectReason::ScheduledRemove, counters);
                    continue;
                }
                // After a corruption reset the central reopens the encryption
                // handshake inside the recovery window.
                if conn.direction == ConnectionDirection::Out
                    && conn.state == ConnectionState::Connected
                    && ma.allow_corrupted_encryption_start
                    && should_iv_trigger(self.app_timer_ds, passed_ds, sec_to_ds(1))
                {
                    self.start_mesh_access_handshake(slot, counters);
                    continue;
                }
            }
        }

        // Time syncing across handshaked mesh connections.
        self.cm.time_since_time_sync_ds += passed_ds;
        if self.time.is_time_corrected()
            && self.cm.time_since_time_sync_ds >= TIME_BETWEEN_TIME_SYNC_INTERVALS_DS
        {
            self.cm.time_since_time_sync_ds = 0;
            self.time_sync_interval(counters);
        }

        // Enrolled-nodes gossip.
        self.cm.time_since_enrolled_sync_ds += passed_ds;
        if self.cm.time_since_enrolled_sync_ds >= ENROLLED_NODES_SYNC_INTERVAL_DS {
            self.cm.time_since_enrolled_sync_ds = 0;
            self.enrolled_nodes_interval(counters);
        }
    }

    fn reestablishment_timeout_sec(&self) -> u32 {
        // Driven from the sim config via the boot parameters; stored here so
        // firmware code does not reach into the simulator.
        self.reestablishment_timeout_sec_value
    }

    // =========================================================================
    // CLUSTERING DECISION
    // =========================================================================

    /// Picks the best join-me candidate and connects to it as central.
    fn clustering_decision(&mut self, counters: &mut SimCounters) {
        let candidates = std::mem::take(&mut self.join_me_candidates);
        if self.config.device_type == DeviceType::Asset {
            return;
        }
        if self.sd.connecting_active || self.cm.pending_connection.is_some() {
            return;
        }
        if !self.cm.has_free_mesh_connection(ConnectionDirection::Out) {
            return;
        }
        if self.sd.active_central_count() >= self.sd.configured_central_connection_count {
            return;
        }

        let own_size = self.cluster_size;
        let own_id = self.cluster_id;
        let best = candidates
            .iter()
            .filter(|c| c.network_id == self.config.network_id)
            .filter(|c| c.cluster_id != own_id)
            .filter(|c| c.free_mesh_in_connections > 0)
            // The bigger cluster connects to the smaller one; equal sizes are
            // broken by cluster id so exactly one side initiates.
            .filter(|c| {
                c.cluster_size < own_size || (c.cluster_size == own_size && c.cluster_id < own_id)
            })
            .max_by_key(|c| (c.cluster_size, std::cmp::Reverse(c.sender)));

        let Some(candidate) = best.copied() else {
            return;
        };

        debug!(
            node = self.id,
            partner = candidate.sender,
            "clustering decision: connecting as master"
        );
        self.connect_as_master(
            candidate.sender,
            BleAddress::from_node_id(candidate.sender),
            candidate.mesh_write_handle,
            counters,
        );
    }

    /// Creates the pending OUT mesh connection and starts GAP connecting.
    pub fn connect_as_master(
        &mut self,
        partner_id: NodeId,
        address: BleAddress,
        partner_write_characteristic_handle: u16,
        counters: &mut SimCounters,
    ) {
        if !self.cm.reserve_mesh_quota(ConnectionDirection::Out) {
            return;
        }
        let Some(slot) = self.cm.allocate(
            ConnectionDirection::Out,
            address,
            self.app_timer_ds,
            ConnectionVariant::Mesh(MeshState::new(partner_write_characteristic_handle)),
        ) else {
            return;
        };
        let conn = self.cm.get_mut(slot).unwrap();
        conn.partner_id = partner_id;
        conn.state = ConnectionState::Connecting;
        self.cm.pending_connection = Some(self.cm.get(slot).unwrap().unique_id);

        self.gap_connect(address, MESH_CONNECTION_INTERVAL_MS, GAP_CONNECTING_TIMEOUT_DS, counters);
    }

    /// GAP connect request against the own softdevice.
    pub fn gap_connect(
        &mut self,
        address: BleAddress,
        interval_ms: u16,
        timeout_ds: u32,
        counters: &mut SimCounters,
    ) {
        self.sd.connecting_active = true;
        self.sd.connecting_partner_addr = address;
        self.sd.connecting_interval_ms = interval_ms;
        self.sd.connecting_timeout_timestamp_ms =
            counters.sim_time_ms as i64 + (timeout_ds as i64) * 100;
    }

    // =========================================================================
    // EVENT PUMP
    // =========================================================================

    /// Drains the BLE event queue. Stops early when the firmware requested a
    /// reset, leaving remaining events for after the reboot (they are cleared
    /// by boot anyway).
    pub fn pump_events(&mut self, counters: &mut SimCounters) -> PumpOutcome {
        while let Some(event) = self.event_queue.pop() {
            self.dispatch_ble_event(event, counters);
            self.watchdog_last_feed_ds = self.app_timer_ds;
            if let Some(reason) = self.want_reset.take() {
                return PumpOutcome::Reset(reason);
            }
        }
        self.watchdog_last_feed_ds = self.app_timer_ds;
        if let Some(reason) = self.want_reset.take() {
            return PumpOutcome::Reset(reason);
        }
        PumpOutcome::Done
    }

    fn dispatch_ble_event(&mut self, event: SimBleEvent, counters: &mut SimCounters) {
        match event.kind {
            BleEventKind::AdvReport { data, data_len, .. } => {
                if !self.sd.scanning_active {
                    return;
                }
                if let Some(join_me) = JoinMePayload::decode(&data[..data_len as usize]) {
                    self.join_me_candidates.retain(|c| c.sender != join_me.sender);
                    if self.join_me_candidates.len() < 8 {
                        self.join_me_candidates.push(join_me);
                    }
                }
            }
            BleEventKind::Connected { conn_handle, is_central, peer_addr, .. } => {
                self.gap_connection_connected(conn_handle, is_central, peer_addr, counters);
            }
            BleEventKind::Disconnected { conn_handle, hci_reason } => {
                self.gap_connection_disconnected(conn_handle, hci_reason, counters);
            }
            BleEventKind::GattsWrite { conn_handle, characteristic_handle, data, .. } => {
                self.forward_received_data(conn_handle, characteristic_handle, &data, counters);
            }
            BleEventKind::GattcHvx { conn_handle, characteristic_handle, data, .. } => {
                self.forward_received_data(conn_handle, characteristic_handle, &data, counters);
            }
            BleEventKind::TxComplete { conn_handle, count } => {
                self.handle_packet_sent(conn_handle, count as usize, 0, counters);
            }
            BleEventKind::WriteRsp { conn_handle, .. } => {
                self.handle_packet_sent(conn_handle, 0, 1, counters);
            }
            BleEventKind::GapTimeout { source } => {
                if source == TimeoutSource::Connection {
                    self.gap_connecting_timeout(counters);
                }
            }
            BleEventKind::RssiChanged { conn_handle, rssi } => {
                if let Some(slot) = self.cm.find_slot_by_conn_handle(conn_handle) {
                    if let Some(conn) = self.cm.get_mut(slot) {
                        conn.last_reported_rssi = rssi;
                    }
                }
            }
        }
    }

    // =========================================================================
    // GAP HANDLERS
    // =========================================================================

    fn gap_connection_connected(
        &mut self,
        conn_handle: u16,
        is_central: bool,
        peer_addr: BleAddress,
        counters: &mut SimCounters,
    ) {
        if is_central {
            // A reestablishing OUT connection reattaches to its record.
            if let Some(slot) = self.find_reestablishing_slot(peer_addr, ConnectionDirection::Out) {
                self.gap_reconnection_successful(slot, conn_handle, counters);
                return;
            }
            // Otherwise this completes a pending outgoing connection.
            let Some(slot) = self.find_connecting_out_slot(peer_addr) else {
                // Nobody waits for this link anymore.
                self.outbox.push(SimRequest::GapDisconnect {
                    conn_handle,
                    hci_reason: HciError::LocalHostTerminatedConnection,
                    hci_reason_partner: HciError::RemoteUserTerminatedConnection,
                });
                return;
            };
            let conn = self.cm.get_mut(slot).unwrap();
            conn.connection_handle = conn_handle;
            conn.state = ConnectionState::Connected;
            let is_mesh = conn.variant.is_mesh();
            let is_ma = conn.variant.is_mesh_access();
            if is_mesh {
                // The data-length extension is negotiated right away. Tunnel
                // connections keep the default MTU: their cipher works on one
                // AES block per chunk.
                conn.connection_mtu = GATT_MTU_SIZE_UPGRADED;
                conn.connection_payload_size = GATT_MTU_SIZE_UPGRADED;
                self.start_mesh_handshake(slot, counters);
            } else if is_ma {
                // Discover the tunnel service before the handshake.
                self.sd.discovery_conn_handle = conn_handle;
                self.sd.discovery_service_uuid = MA_SERVICE_UUID16;
                self.sd.discovery_done_time_ms = counters.sim_time_ms + 100;
            }
        } else {
            // A reestablishing IN connection reattaches and waits for the
            // partner's reconnect packet.
            if let Some(slot) = self.find_reestablishing_slot(peer_addr, ConnectionDirection::In) {
                let conn = self.cm.get_mut(slot).unwrap();
                conn.connection_handle = conn_handle;
                conn.state = ConnectionState::ReestablishingHandshake;
                conn.handshake_started_ds = self.app_timer_ds;
                conn.queue.rollback_look_ahead();
                return;
            }
            // Fresh inbound link: its protocol is resolved on the first write.
            let Some(slot) = self.cm.allocate(
                ConnectionDirection::In,
                peer_addr,
                self.app_timer_ds,
                ConnectionVariant::Resolver,
            ) else {
                self.outbox.push(SimRequest::GapDisconnect {
                    conn_handle,
                    hci_reason: HciError::LocalHostTerminatedConnection,
                    hci_reason_partner: HciError::RemoteUserTerminatedConnection,
                });
                return;
            };
            let conn = self.cm.get_mut(slot).unwrap();
            conn.connection_handle = conn_handle;
            conn.state = ConnectionState::Connected;
        }
        self.refresh_advertising();
    }

    fn find_connecting_out_slot(&self, peer_addr: BleAddress) -> Option<usize> {
        self.cm.occupied_slots().into_iter().find(|&i| {
            self.cm
                .get(i)
                .map(|c| {
                    c.state == ConnectionState::Connecting
                        && c.direction == ConnectionDirection::Out
                        && c.partner_address == peer_addr
                })
                .unwrap_or(false)
        })
    }

    fn find_reestablishing_slot(
        &self,
        peer_addr: BleAddress,
        direction: ConnectionDirection,
    ) -> Option<usize> {
        self.cm.occupied_slots().into_iter().find(|&i| {
            self.cm
                .get(i)
                .map(|c| {
                    c.state == ConnectionState::Reestablishing
                        && c.direction == direction
                        && c.partner_address == peer_addr
                        && c.variant.is_mesh()
                })
                .unwrap_or(false)
        })
    }

    fn gap_connecting_timeout(&mut self, counters: &mut SimCounters) {
        // Find the connection that was being set up.
        let Some(slot) = self.cm.occupied_slots().into_iter().find(|&i| {
            self.cm
                .get(i)
                .map(|c| {
                    c.direction == ConnectionDirection::Out
                        && (c.state == ConnectionState::Connecting
                            || c.state == ConnectionState::Reestablishing)
                })
                .unwrap_or(false)
        }) else {
            return;
        };
        let conn = self.cm.get_mut(slot).unwrap();
        if conn.state == ConnectionState::Reestablishing {
            // Keep trying until the reestablishment window closes.
            if let Some(mesh) = conn.mesh_mut() {
                mesh.must_retry_reestablishing = true;
            }
        } else {
            self.disconnect_and_remove(slot, AppDisconnectReason::GapConnectingTimeout, counters);
        }
    }

    /// Common teardown: removes the connection record, frees the quota and
    /// lets the node adjust its clustering state. The GAP link, if still
    /// active, is dropped through the outbox.
    pub fn disconnect_and_remove(
        &mut self,
        slot: usize,
        reason: AppDisconnectReason,
        counters: &mut SimCounters,
    ) {
        let Some(conn) = self.cm.get_mut(slot) else { return };
        if conn.app_disconnect_reason == AppDisconnectReason::Unknown {
            conn.app_disconnect_reason = reason;
        }
        let reason = conn.app_disconnect_reason;
        let state_before = if conn.state == ConnectionState::Disconnected {
            conn.state_before_disconnection
        } else {
            conn.state
        };
        let had_master_bit = conn.mesh().map(|m| m.connection_master_bit).unwrap_or(false);
        let connected_cluster_size = conn.mesh().map(|m| m.connected_cluster_size).unwrap_or(0);
        let partner_id = conn.partner_id;
        let conn_handle = conn.connection_handle;
        let was_mesh = conn.variant.is_mesh();
        let was_ma = conn.variant.is_mesh_access();
        let subscriber = conn.mesh_access().map(|m| m.connection_state_subscriber_id).unwrap_or(0);
        // Only the gap between drop and reconnection has no live link.
        let gap_active = conn.state >= ConnectionState::Connected
            && conn.state != ConnectionState::Reestablishing
            && conn_handle != BLE_CONN_HANDLE_INVALID;

        self.cm.delete_connection(slot, reason);

        if gap_active {
            self.outbox.push(SimRequest::GapDisconnect {
                conn_handle,
                hci_reason: HciError::LocalHostTerminatedConnection,
                hci_reason_partner: HciError::RemoteUserTerminatedConnection,
            });
        }

        if was_mesh && state_before >= ConnectionState::HandshakeDone {
            self.json_log
                .push(format!("{{\"type\":\"mesh_disconnect\",\"partnerId\":{}}}", partner_id));
            self.mesh_connection_disconnected(
                state_before,
                had_master_bit,
                connected_cluster_size,
                counters,
            );
        }
        if was_ma && subscriber != 0 {
            self.notify_connection_state_subscriber(subscriber, partner_id, ConnectionState::Disconnected, counters);
        }
        self.refresh_advertising();
    }

    // =========================================================================
    // RECEIVE PATH
    // =========================================================================

    fn forward_received_data(
        &mut self,
        conn_handle: u16,
        characteristic_handle: u16,
        data: &[u8],
        counters: &mut SimCounters,
    ) {
        let Some(mut slot) = self.cm.find_slot_by_conn_handle(conn_handle) else {
            return;
        };
        if self.cm.get(slot).map(|c| c.variant.is_resolver()).unwrap_or(false) {
            match self.resolve_connection(slot, characteristic_handle, counters) {
                Some(resolved) => slot = resolved,
                None => return,
            }
        }
        let Some(conn) = self.cm.get(slot) else { return };
        let is_mesh = conn.variant.is_mesh();
        let is_ma = conn.variant.is_mesh_access();
        if is_mesh {
            self.receive_mesh_data(slot, characteristic_handle, data, counters);
        } else if is_ma {
            self.receive_mesh_access_data(slot, characteristic_handle, data, counters);
        }
    }

    /// Runs the resolver chain on a fresh inbound link. Order matters: the
    /// tunnel resolver claims its characteristics before the mesh resolver
    /// gets a chance.
    fn resolve_connection(
        &mut self,
        slot: usize,
        characteristic_handle: u16,
        _counters: &mut SimCounters,
    ) -> Option<usize> {
        type Resolver = fn(&mut Node, usize, u16) -> bool;
        let resolvers: [Resolver; 2] = [Node::resolve_mesh_access, Node::resolve_mesh];
        for resolver in resolvers {
            if resolver(self, slot, characteristic_handle) {
                return Some(slot);
            }
        }
        None
    }

    fn resolve_mesh_access(&mut self, slot: usize, characteristic_handle: u16) -> bool {
        if characteristic_handle != MA_RX_CHARACTERISTIC_HANDLE
            && characteristic_handle != MA_TX_CCCD_HANDLE
        {
            return false;
        }
        let own_id = self.config.node_id;
        let conn = self.cm.get_mut(slot).unwrap();
        let mut state = MeshAccessState::new(FmKeyId::ZERO, TunnelType::Invalid);
        state.virtual_partner_id = own_id + (slot as NodeId + 1) * NODE_ID_VIRTUAL_BASE;
        conn.variant = ConnectionVariant::MeshAccess(state);
        debug!(node = own_id, slot, "resolved inbound connection as mesh access");
        true
    }

    fn resolve_mesh(&mut self, slot: usize, characteristic_handle: u16) -> bool {
        if characteristic_handle != MESH_WRITE_CHARACTERISTIC_HANDLE {
            return false;
        }
        if !self.cm.reserve_mesh_quota(ConnectionDirection::In) {
            // No peripheral mesh slot left; the spot check failed.
            let conn = self.cm.get_mut(slot).unwrap();
            conn.app_disconnect_reason = AppDisconnectReason::CmFailNoSpot;
            return false;
        }
        let conn = self.cm.get_mut(slot).unwrap();
        conn.variant = ConnectionVariant::Mesh(MeshState::new(MESH_WRITE_CHARACTERISTIC_HANDLE));
        // Mesh links run with the extended data length on both sides.
        conn.connection_mtu = GATT_MTU_SIZE_UPGRADED;
        conn.connection_payload_size = GATT_MTU_SIZE_UPGRADED;
        let unique_id = conn.unique_id;
        self.cm.pending_connection = Some(unique_id);
        debug!(node = self.config.node_id, slot, "resolved inbound connection as mesh");
        true
    }

    // =========================================================================
    // SERVICE DISCOVERY (central side of the tunnel)
    // =========================================================================

    /// Called by the scheduler when the simulated discovery delay elapsed.
    pub fn service_discovery_finished(
        &mut self,
        conn_handle: u16,
        service: Option<crate::ble::ServiceDb>,
        counters: &mut SimCounters,
    ) {
        let Some(slot) = self.cm.find_slot_by_conn_handle(conn_handle) else { return };
        if !self.cm.get(slot).map(|c| c.variant.is_mesh_access()).unwrap_or(false) {
            return;
        }
        let Some(service) = service else {
            self.disconnect_and_remove(slot, AppDisconnectReason::GapError, counters);
            return;
        };
        {
            let conn = self.cm.get_mut(slot).unwrap();
            let ma = conn.mesh_access_mut().unwrap();
            for ch in &service.characteristics {
                if ch.value_handle == MA_RX_CHARACTERISTIC_HANDLE {
                    ma.partner_rx_characteristic_handle = ch.value_handle;
                }
                if ch.cccd_handle != 0 {
                    ma.partner_tx_characteristic_handle = ch.value_handle;
                    ma.partner_tx_cccd_handle = ch.cccd_handle;
                }
            }
        }
        // Register for notifications; this write also resolves our connection
        // type at the peripheral.
        let cccd = self.cm.get(slot).and_then(|c| c.mesh_access()).unwrap().partner_tx_cccd_handle;
        if cccd != 0 {
            self.send_on_connection(
                slot,
                vec![0x01, 0x00],
                DeliveryOption::WriteReq,
                cccd,
                DeliveryPriority::High,
                counters,
            );
        }
        self.start_mesh_access_handshake(slot, counters);
    }

    // =========================================================================
    // SEND PATH
    // =========================================================================

    /// Queues raw bytes on a connection and flushes the transmit buffers.
    pub(crate) fn send_on_connection(
        &mut self,
        slot: usize,
        data: Vec<u8>,
        delivery: DeliveryOption,
        characteristic_handle: u16,
        priority: DeliveryPriority,
        counters: &mut SimCounters,
    ) -> Option<u32> {
        let conn = self.cm.get_mut(slot)?;
        let handle = conn.fresh_message_handle();
        if !conn.queue.queue_data(priority, delivery, characteristic_handle, data, handle) {
            conn.dropped_packets += 1;
            return None;
        }
        self.fill_transmit_buffers(slot, counters);
        Some(handle)
    }

    /// Moves chunks from the connection queue into the softdevice buffers.
    pub fn fill_transmit_buffers(&mut self, slot: usize, counters: &mut SimCounters) {
        loop {
            let Some(conn) = self.cm.get_mut(slot) else { return };
            if conn.state < ConnectionState::Connected
                || conn.state == ConnectionState::Reestablishing
            {
                return;
            }
            let conn_handle = conn.connection_handle;
            let Some(sd_idx) = self.sd.find_connection_by_handle(conn_handle) else { return };

            // The coalescing cluster update is flushed ahead of the queue.
            self.queue_vital_prio_data(slot);

            let Some(conn) = self.cm.get_mut(slot) else { return };
            let payload_size = conn.connection_payload_size as usize;
            let encrypted = conn.encryption_state == crate::types::EncryptionState::Encrypted;

            // Check buffer space before handing out the chunk.
            let sd_conn = &self.sd.connections[sd_idx];
            let has_unreliable = sd_conn.free_unreliable() > 0;
            let has_reliable = sd_conn.reliable_buffer.is_none();

            let Some(chunk) = ({
                let conn = self.cm.get_mut(slot).unwrap();
                let peek_delivery_needs_reliable = |d: DeliveryOption| d == DeliveryOption::WriteReq;
                // next_chunk consumes look-ahead, so only call it when the
                // matching buffer class is free. Peek by trying and rolling
                // back is not possible, so check the stricter condition.
                if !has_unreliable && !has_reliable {
                    None
                } else {
                    let chunk = conn.queue.next_chunk(payload_size);
                    match chunk {
                        Some(c) if peek_delivery_needs_reliable(c.delivery) && !has_reliable => {
                            // Undo: push origin back and restore counter.
                            conn.queue.unsend_last_chunk();
                            None
                        }
                        Some(c) if !peek_delivery_needs_reliable(c.delivery) && !has_unreliable => {
                            conn.queue.unsend_last_chunk();
                            None
                        }
                        other => other,
                    }
                }
            }) else {
                return;
            };

            let mut data = chunk.data.clone();
            if encrypted {
                let conn = self.cm.get_mut(slot).unwrap();
                let ma = conn.mesh_access_mut().unwrap();
                let mic = crate::crypto::encrypt_packet(
                    &mut data,
                    &ma.encryption_nonce,
                    &ma.session_encryption_key,
                );
                data.extend_from_slice(&mic);
            }

            let packet = crate::ble::BufferedPacket {
                global_packet_id: counters.next_packet_id(),
                queue_time_ms: counters.sim_time_ms,
                characteristic_handle: chunk.characteristic_handle,
                delivery: chunk.delivery,
                data,
            };
            let sd_conn = &mut self.sd.connections[sd_idx];
            match chunk.delivery {
                DeliveryOption::WriteReq => sd_conn.reliable_buffer = Some(packet),
                _ => {
                    if let Some(free) = sd_conn.unreliable_buffers.iter_mut().find(|b| b.is_none()) {
                        *free = Some(packet);
                    }
                }
            }

            // Packet successfully queued with the softdevice.
            let conn = self.cm.get_mut(slot).unwrap();
            match chunk.delivery {
                DeliveryOption::WriteReq => conn.sent_reliable += 1,
                _ => conn.sent_unreliable += 1,
            }
            if encrypted {
                if let Some(ma) = conn.mesh_access_mut() {
                    // Committed only now: the keystream used the base counter,
                    // the MIC used base + 1.
                    ma.encryption_nonce[1] = ma.encryption_nonce[1].wrapping_add(2);
                }
            }
            // Record queuing latency for the time-sync correction.
            if chunk.data.first() == Some(&(MessageType::TimeSync as u8)) {
                let ordered = conn.mesh().map(|m| m.sync_sending_ordered_ds).unwrap_or(0);
                let now = self.app_timer_ds;
                if let Some(mesh) = conn.mesh_mut() {
                    if mesh.time_sync_state == TimeSyncState::Unsynced && ordered != 0 {
                        mesh.correction_ticks = now.saturating_sub(ordered);
                    }
                }
            }
        }
    }

    /// Acknowledgement of sent chunks, reliable or unreliable.
    fn handle_packet_sent(
        &mut self,
        conn_handle: u16,
        unreliable: usize,
        reliable: usize,
        counters: &mut SimCounters,
    ) {
        let Some(slot) = self.cm.find_slot_by_conn_handle(conn_handle) else { return };
        let Some(conn) = self.cm.get_mut(slot) else { return };
        let payload_size = conn.connection_payload_size as usize;
        let finished = conn.queue.ack_chunks(unreliable + reliable, payload_size);

        // Data-sent hooks.
        let anonce_handle =
            conn.mesh_access().map(|m| m.anonce_message_handle).unwrap_or(0);
        if anonce_handle != 0 && finished.contains(&anonce_handle) {
            let conn = self.cm.get_mut(slot).unwrap();
            conn.encryption_state = crate::types::EncryptionState::Encrypted;
            if let Some(ma) = conn.mesh_access_mut() {
                ma.anonce_message_handle = 0;
            }
        }
        // More queued data may fit now.
        self.fill_transmit_buffers(slot, counters);
    }

    // =========================================================================
    // MESH MESSAGE ROUTING
    // =========================================================================

    /// Entry point for locally generated messages.
    pub fn send_mesh_message(&mut self, data: &[u8], counters: &mut SimCounters) {
        if data.len() > crate::types::MAX_MESH_PACKET_SIZE
            || data.len() < SIZEOF_CONN_PACKET_HEADER
        {
            warn!(node = self.id, len = data.len(), "mesh message with illegal size");
            return;
        }
        let Some(header) = ConnPacketHeader::decode(data) else { return };

        // Local loopback is dispatched first.
        self.dispatch_mesh_message(None, data, false, counters);

        // Fan out to tunnel partners that may be the receiver.
        let mut data = data.to_vec();
        for slot in self.cm.mesh_access_slots() {
            let Some(conn) = self.cm.get(slot) else { continue };
            let Some(_) = conn.mesh_access() else { continue };
            let is_asset = self.config.device_type == DeviceType::Asset;
            if !is_asset && !self.should_send_data_to_node_id(slot, header.receiver) {
                continue;
            }
            if header.receiver == NODE_ID_ANYCAST_THEN_BROADCAST {
                ConnPacketHeader::patch_receiver(&mut data, NODE_ID_BROADCAST);
                if self.mesh_access_send_data(slot, &data, counters) {
                    return;
                }
            } else {
                self.mesh_access_send_data(slot, &data, counters);
            }
        }

        // Sink routing.
        if header.receiver == NODE_ID_SHORTEST_SINK {
            if let Some(slot) = self.cm.mesh_slot_to_shortest_sink(None) {
                self.mesh_send_data(slot, &data, false, counters);
            } else {
                self.broadcast_mesh_packet(&data, counters);
            }
            return;
        }
        if header.receiver == NODE_ID_LOCAL_LOOPBACK {
            return;
        }
        if header.receiver != self.config.node_id {
            // Directly connected partner or broadcast.
            if let Some(slot) = self.cm.find_mesh_slot_to_partner(header.receiver) {
                self.mesh_send_data(slot, &data, false, counters);
            } else {
                self.broadcast_mesh_packet(&data, counters);
            }
        }
    }

    fn broadcast_mesh_packet(&mut self, data: &[u8], counters: &mut SimCounters) {
        let mut data = data.to_vec();
        let header = ConnPacketHeader::decode(&data).unwrap();
        for slot in self.cm.handshaked_mesh_slots() {
            if header.receiver == NODE_ID_ANYCAST_THEN_BROADCAST {
                ConnPacketHeader::patch_receiver(&mut data, NODE_ID_BROADCAST);
                self.mesh_send_data(slot, &data, false, counters);
                return;
            }
            self.mesh_send_data(slot, &data, false, counters);
        }
    }

    /// Relays a message received on `arrival_slot` into the rest of the mesh.
    pub(crate) fn route_mesh_data(
        &mut self,
        arrival_slot: usize,
        data: &[u8],
        counters: &mut SimCounters,
    ) {
        let Some(header) = ConnPacketHeader::decode(data) else { return };

        // Terminal receivers: no forwarding needed.
        if header.receiver == self.config.node_id
            || header.receiver == NODE_ID_HOPS_BASE + 1
            || (header.receiver == NODE_ID_SHORTEST_SINK && self.is_sink())
        {
            return;
        }

        if header.receiver == NODE_ID_SHORTEST_SINK {
            if let Some(slot) = self.cm.mesh_slot_to_shortest_sink(Some(arrival_slot)) {
                self.mesh_send_data(slot, data, false, counters);
            } else {
                self.broadcast_mesh_data_except(arrival_slot, data, counters);
            }
            return;
        }

        let mut forwarded = data.to_vec();
        if header.receiver > NODE_ID_HOPS_BASE
            && header.receiver < NODE_ID_HOPS_BASE + NODE_ID_HOPS_BASE_SIZE
        {
            ConnPacketHeader::patch_receiver(&mut forwarded, header.receiver - 1);
        }

        // Cluster updates and timestamps have bespoke propagation.
        if header.message_type == MessageType::ClusterInfoUpdate
            || header.message_type == MessageType::UpdateTimestamp
        {
            return;
        }
        self.broadcast_mesh_data_except(arrival_slot, &forwarded, counters);
    }

    fn broadcast_mesh_data_except(
        &mut self,
        arrival_slot: usize,
        data: &[u8],
        counters: &mut SimCounters,
    ) {
        for slot in self.cm.handshaked_mesh_slots() {
            if slot != arrival_slot {
                self.mesh_send_data(slot, data, false, counters);
            }
        }
        for slot in self.cm.mesh_access_slots() {
            if slot != arrival_slot {
                self.mesh_access_send_data(slot, data, counters);
            }
        }
    }

    /// Whether this node consumes a message addressed to `node_id`.
    pub fn is_receiver_of_node_id(&self, node_id: NodeId) -> bool {
        if node_id == self.config.node_id || node_id == NODE_ID_BROADCAST {
            return true;
        }
        if node_id >= NODE_ID_HOPS_BASE && node_id < NODE_ID_HOPS_BASE + NODE_ID_HOPS_BASE_SIZE {
            return true;
        }
        if node_id == NODE_ID_SHORTEST_SINK && self.is_sink() {
            return true;
        }
        false
    }

    /// Dispatches a message to the local modules after validation.
    pub(crate) fn dispatch_mesh_message(
        &mut self,
        arrival_slot: Option<usize>,
        data: &[u8],
        over_mesh_access: bool,
        counters: &mut SimCounters,
    ) {
        let Some(header) = ConnPacketHeader::decode(data) else { return };
        if !self.is_receiver_of_node_id(header.receiver) {
            return;
        }
        if data.len() < header.message_type.min_len() {
            self.cm.dropped_mesh_packets += 1;
            debug!(node = self.id, ?header, "dropping undersized packet");
            return;
        }

        // The loopback receiver is rewritten to the local id.
        let mut owned;
        let data = if header.receiver == NODE_ID_LOCAL_LOOPBACK {
            owned = data.to_vec();
            ConnPacketHeader::patch_receiver(&mut owned, self.config.node_id);
            &owned[..]
        } else {
            data
        };
        let header = ConnPacketHeader::decode(data).unwrap();

        match header.message_type {
            MessageType::TimeSync => {
                if let Some(packet) = TimeSyncPacket::decode(data) {
                    self.handle_time_sync(arrival_slot, &packet, counters);
                }
            }
            MessageType::ModuleGeneral
            | MessageType::ModuleTriggerAction
            | MessageType::ModuleActionResponse
            | MessageType::ModuleRawDataLight => {
                if let Some(packet) = ModulePacket::decode(data) {
                    self.handle_module_message(&packet, counters);
                }
            }
            _ => {}
        }

        self.received_messages.push(ReceivedMeshMessage {
            sender: header.sender,
            receiver: header.receiver,
            message_type: header.message_type,
            data: data.to_vec(),
            over_mesh_access,
        });
    }

    fn handle_module_message(&mut self, packet: &ModulePacket, counters: &mut SimCounters) {
        match (packet.module_id, packet.header.message_type) {
            (module_id::NODE, MessageType::ModuleGeneral) => match packet.action_type {
                node_module_action::SET_ENROLLED_NODES => {
                    self.handle_set_enrolled_nodes(packet, counters);
                }
                node_module_action::ENROLLED_NODES_REPLY => {
                    self.handle_enrolled_nodes_reply(packet);
                }
                _ => {}
            },
            (_, MessageType::ModuleRawDataLight) => {
                let protocol_id = packet.action_type;
                use base64::Engine;
                let payload =
                    base64::engine::general_purpose::STANDARD.encode(&packet.data);
                self.json_log.push(format!(
                    "{{\"type\":\"raw_data_light\",\"nodeId\":{},\"module\":{},\"protocol\":{},\"payload\":\"{}\"}}",
                    packet.header.sender, packet.module_id, protocol_id, payload
                ));
            }
            _ => {}
        }
    }

    // =========================================================================
    // ENROLLED NODES GOSSIP
    // =========================================================================

    fn enrolled_nodes_interval(&mut self, counters: &mut SimCounters) {
        for slot in self.cm.handshaked_mesh_slots() {
            let Some(conn) = self.cm.get(slot) else { continue };
            let Some(mesh) = conn.mesh() else { continue };
            if mesh.enrolled_nodes_synced {
                continue;
            }
            let partner = conn.partner_id;
            self.send_enrolled_nodes(partner, node_module_action::SET_ENROLLED_NODES, counters);
        }
    }

    fn send_enrolled_nodes(&mut self, to: NodeId, action: u8, counters: &mut SimCounters) {
        let packet = ModulePacket {
            header: ConnPacketHeader::new(MessageType::ModuleGeneral, self.config.node_id, to),
            module_id: module_id::NODE,
            request_handle: 0,
            action_type: action,
            data: self.config.number_of_enrolled_devices.to_le_bytes().to_vec(),
        };
        self.send_mesh_message(&packet.encode(), counters);
    }

    fn handle_set_enrolled_nodes(&mut self, packet: &ModulePacket, counters: &mut SimCounters) {
        let sender = packet.header.sender;
        // The sending connection is now known to be synced, all others not.
        for slot in self.cm.mesh_slots() {
            let Some(conn) = self.cm.get_mut(slot) else { continue };
            let is_sender = conn.partner_id == sender;
            if let Some(mesh) = conn.mesh_mut() {
                mesh.enrolled_nodes_synced = is_sender;
            }
        }
        self.send_enrolled_nodes(sender, node_module_action::ENROLLED_NODES_REPLY, counters);
    }

    fn handle_enrolled_nodes_reply(&mut self, packet: &ModulePacket) {
        if packet.data.len() < 2 {
            return;
        }
        let replied = u16::from_le_bytes([packet.data[0], packet.data[1]]);
        let sender = packet.header.sender;
        if replied != self.config.number_of_enrolled_devices {
            return;
        }
        for slot in self.cm.mesh_slots() {
            let Some(conn) = self.cm.get_mut(slot) else { continue };
            if conn.partner_id == sender {
                if let Some(mesh) = conn.mesh_mut() {
                    mesh.enrolled_nodes_synced = true;
                }
            }
        }
    }

    // =========================================================================
    // WATCHDOG / BATTERY
    // =========================================================================

    pub fn simulate_watchdog(&mut self) {
        if config::WATCHDOG_TIMEOUT_DS == 0 {
            return;
        }
        if self.app_timer_ds.saturating_sub(self.watchdog_last_feed_ds) > config::WATCHDOG_TIMEOUT_DS {
            warn!(node = self.id, "watchdog starved, resetting node");
            self.reset(RebootReason::Watchdog);
        }
    }

    pub fn simulate_battery_usage(&mut self, tick_ms: u32) {
        let mut draw = config::BATTERY_IDLE_DRAW;
        if self.led_on {
            draw += config::BATTERY_LED_DRAW;
        }
        if self.sd.advertising_active {
            draw += if self.sd.advertising_interval_ms <= 200 {
                config::BATTERY_ADV_HIGH_DRAW
            } else {
                config::BATTERY_ADV_LOW_DRAW
            };
        }
        if self.sd.scanning_active {
            let duty =
                (self.sd.scan_window_ms.max(1) * 100 / self.sd.scan_interval_ms.max(1)).min(100);
            draw += config::BATTERY_SCAN_DRAW * duty / 100;
        }
        draw += config::BATTERY_PER_CONNECTION_DRAW * self.sd.active_connection_count() as u32;
        self.nano_ampere_per_ms_total += draw as u64 * tick_ms as u64;
    }
}

// Authorization used by the tunnel code, kept here because the policy is a
// node-level concern.
impl Node {
    pub(crate) fn check_authorization(
        &self,
        _data: &[u8],
        _fm_key_id: FmKeyId,
        _direction: crate::types::DataDirection,
    ) -> MeshAccessAuthorization {
        match self.auth_policy {
            AuthorizationPolicy::Default => MeshAccessAuthorization::Whitelist,
            AuthorizationPolicy::Fixed(a) => a,
        }
    }

    pub(crate) fn notify_connection_state_subscriber(
        &mut self,
        subscriber: NodeId,
        virtual_partner_id: NodeId,
        state: ConnectionState,
        counters: &mut SimCounters,
    ) {
        let packet = ModulePacket {
            header: ConnPacketHeader::new(MessageType::ModuleGeneral, self.config.node_id, subscriber),
            module_id: module_id::MESH_ACCESS,
            request_handle: 0,
            action_type: 0,
            data: {
                let mut d = virtual_partner_id.to_le_bytes().to_vec();
                d.push(state as u8);
                d
            },
        };
        self.send_mesh_message(&packet.encode(), counters);
    }

    /// True if the virtual partner id space of this slot contains `node_id`,
    /// or the id belongs to one of the routed ranges.
    pub(crate) fn should_send_data_to_node_id(&self, slot: usize, node_id: NodeId) -> bool {
        let Some(conn) = self.cm.get(slot) else { return false };
        let Some(ma) = conn.mesh_access() else { return false };
        node_id == ma.virtual_partner_id
            || node_id == NODE_ID_BROADCAST
            || node_id == NODE_ID_ANYCAST_THEN_BROADCAST
            || (node_id >= NODE_ID_HOPS_BASE && node_id < NODE_ID_HOPS_BASE + NODE_ID_HOPS_BASE_SIZE)
            || (node_id >= NODE_ID_APP_BASE && node_id < NODE_ID_APP_BASE + NODE_ID_APP_BASE_SIZE)
            || is_global_device_id(node_id)
            || (node_id >= crate::types::NODE_ID_GROUP_BASE
                && node_id < crate::types::NODE_ID_GROUP_BASE + crate::types::NODE_ID_GROUP_BASE_SIZE)
            || (ma.fm_key_id == FmKeyId::NETWORK
                && ma.tunnel_type == TunnelType::RemoteMesh
                && conn.direction == ConnectionDirection::Out)
    }
}

// =============================================================================
// NODE TERMINAL
// =============================================================================
// Firmware commands reachable over the (simulated) UART. Output lines land in
// `terminal_output`; structured observables in `json_log`.

impl Node {
    pub fn handle_uart_line(&mut self, line: &str, counters: &mut SimCounters) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else { return };
        match command {
            "reset" => {
                self.queue_reset(RebootReason::LocalReset);
            }
            "status" => {
                let mut out = format!(
                    "Node {} (serial {}) cluster {:x} size {} hops {}",
                    self.config.node_id,
                    self.serial_index,
                    self.cluster_id,
                    self.cluster_size,
                    self.hops_to_sink()
                );
                for slot in self.cm.occupied_slots() {
                    let Some(conn) = self.cm.get(slot) else { continue };
                    out.push_str(&format!(
                        "\nconn {} dir {:?} state {:?} partner {} queue {}",
                        slot,
                        conn.direction,
                        conn.state,
                        conn.partner_id,
                        conn.queue.amount_of_packets()
                    ));
                }
                self.terminal_output.push(out);
            }
            "settime" => {
                if tokens.len() >= 3 {
                    let ts: u32 = tokens[1].parse().unwrap_or(0);
                    let offset: i32 = tokens[2].parse().unwrap_or(0);
                    self.time.set_time(ts, offset);
                    self.reset_time_sync();
                    self.terminal_output.push("Time set".to_string());
                }
            }
            "gettime" => {
                let out = if self.time.is_time_set() {
                    format!("Time is currently set: {}", self.time.unix_time_s())
                } else {
                    "Time is currently not set".to_string()
                };
                self.terminal_output.push(out);
            }
            "action" => {
                self.handle_action_command(&tokens, counters);
            }
            "raw_data_light" => {
                // raw_data_light <receiver> <moduleId> <protocolId> <payloadHex>
                if tokens.len() >= 5 {
                    let receiver: NodeId = tokens[1].parse().unwrap_or(0);
                    let module: u8 = tokens[2].parse().unwrap_or(0);
                    let protocol: u8 = tokens[3].parse().unwrap_or(0);
                    let Ok(payload) = hex::decode(tokens[4]) else { return };
                    let packet = crate::proto::ModulePacket {
                        header: ConnPacketHeader::new(
                            MessageType::ModuleRawDataLight,
                            self.config.node_id,
                            receiver,
                        ),
                        module_id: module,
                        request_handle: 0,
                        action_type: protocol,
                        data: payload,
                    };
                    self.send_mesh_message(&packet.encode(), counters);
                }
            }
            _ => {
                self.terminal_output.push(format!("Unknown command: {}", command));
            }
        }
    }

    /// `action <id|this> ma connect <addr> <fmKeyId> [tunnelType]` and the
    /// matching disconnect.
    fn handle_action_command(&mut self, tokens: &[&str], counters: &mut SimCounters) {
        if tokens.len() < 4 {
            return;
        }
        let target = tokens[1];
        if target != "this" && target.parse::<NodeId>() != Ok(self.config.node_id) {
            return;
        }
        if tokens[2] != "ma" {
            return;
        }
        match tokens[3] {
            "connect" if tokens.len() >= 5 => {
                let Some(address) = BleAddress::parse(tokens[4]) else { return };
                let fm_key_id = FmKeyId(
                    tokens.get(5).and_then(|t| t.parse().ok()).unwrap_or(FmKeyId::NETWORK.0),
                );
                let tunnel_type = tokens
                    .get(6)
                    .and_then(|t| t.parse::<u8>().ok())
                    .map(TunnelType::from_u8)
                    .unwrap_or(TunnelType::LocalMesh);
                self.mesh_access_connect_as_master(
                    address,
                    fm_key_id,
                    tunnel_type,
                    None,
                    0,
                    counters,
                );
            }
            "disconnect" if tokens.len() >= 5 => {
                let Some(address) = BleAddress::parse(tokens[4]) else { return };
                let slot = self.cm.mesh_access_slots().into_iter().find(|&i| {
                    self.cm.get(i).map(|c| c.partner_address == address).unwrap_or(false)
                });
                if let Some(slot) = slot {
                    self.disconnect_and_remove(slot, AppDisconnectReason::UserRequest, counters);
                }
            }
            _ => {}
        }
    }
}
