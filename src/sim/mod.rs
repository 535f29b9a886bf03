//! The central scheduler.
//!
//! One tick advances virtual time by `sim_tick_duration_ms` and steps every
//! node in index order through a fixed sequence of phases. After all nodes
//! ran, the RNG is reseeded from `(sim_time_ms + seed)` so any tick can be
//! re-simulated in isolation.

pub mod gatt;
pub mod placement;
pub mod terminal;
pub mod validator;

use crate::config::{SimConfig, FLASH_TO_FILE_WRITE_INTERVAL};
use crate::flash;
use crate::node::{Node, PumpOutcome, SimCounters, SimRequest};
use crate::types::{DeviceType, NodeId, SimErrorType};
use std::collections::HashSet;
use tracing::{info, warn};

pub struct Simulator {
    pub config: SimConfig,
    pub nodes: Vec<Node>,
    pub counters: SimCounters,
    /// Handle counter for GAP links, shared across all nodes.
    pub global_conn_handle_counter: u32,
    /// When set, no connection events are simulated at all.
    pub block_connections: bool,
    /// Internal consistency problems noticed so far.
    pub sim_errors: Vec<SimErrorType>,
    disabled_errors: HashSet<SimErrorType>,
    /// All emitted JSON lines; test harnesses match against these.
    pub json_journal: Vec<String>,
    /// Connection losses injected by `connection_timeout_probability_per_sec`.
    pub simulated_connection_losses: u32,
    flash_write_cycle: u32,
    /// Node id the terminal forwards non-sim commands to; None means all.
    pub terminal_target: Option<NodeId>,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Simulator {
        let mut sim = Simulator {
            counters: SimCounters::new(config.seed),
            config,
            nodes: Vec::new(),
            global_conn_handle_counter: 0,
            block_connections: false,
            sim_errors: Vec::new(),
            disabled_errors: HashSet::new(),
            json_journal: Vec::new(),
            simulated_connection_losses: 0,
            flash_write_cycle: 0,
            terminal_target: None,
        };
        sim.init_nodes();
        placement::position_nodes_randomly(&mut sim);
        sim
    }

    fn init_nodes(&mut self) {
        self.nodes.clear();
        let total = self.config.total_nodes();
        for index in 0..total {
            let mut node = Node::init(index, self.config.flash_size);
            let device_type = if index >= self.config.num_nodes {
                DeviceType::Asset
            } else if Some(index) == self.config.sink_node_index {
                DeviceType::Sink
            } else {
                DeviceType::Static
            };
            node.config.device_type = device_type;
            node.reestablishment_timeout_sec_value =
                self.config.mesh_extended_connection_timeout_sec;
            node.flash_defaults(self.config.default_network_id, device_type);
            node.boot();
            self.nodes.push(node);
        }
        info!(nodes = total, seed = self.config.seed, "simulator initialized");
    }

    // =========================================================================
    // CONTROL API
    // =========================================================================

    pub fn sim_time_ms(&self) -> u32 {
        self.counters.sim_time_ms
    }

    pub fn set_seed(&mut self, seed: u32) {
        self.config.seed = seed;
        self.counters.rng.reseed(self.counters.sim_time_ms.wrapping_add(seed));
    }

    /// Rebuilds the simulation with a different node count.
    pub fn set_num_nodes(&mut self, num_nodes: usize) {
        self.config.num_nodes = num_nodes;
        self.reset_simulation();
    }

    pub fn set_num_asset_nodes(&mut self, num_asset_nodes: usize) {
        self.config.num_asset_nodes = num_asset_nodes;
        self.reset_simulation();
    }

    pub fn set_map_dimensions(&mut self, width_m: f32, height_m: f32) {
        self.config.map_width_in_meters = width_m;
        self.config.map_height_in_meters = height_m;
    }

    /// Restarts the run from scratch, keeping the configuration.
    pub fn reset_simulation(&mut self) {
        self.counters = SimCounters::new(self.config.seed);
        self.global_conn_handle_counter = 0;
        self.sim_errors.clear();
        self.json_journal.clear();
        self.simulated_connection_losses = 0;
        self.flash_write_cycle = 0;
        self.init_nodes();
        placement::position_nodes_randomly(self);
    }

    /// Positions a node by its serial index; `x`/`y` are meters.
    pub fn set_position(&mut self, serial_index: u32, x_m: f32, y_m: f32, z: f32) -> bool {
        let width = self.config.map_width_in_meters;
        let height = self.config.map_height_in_meters;
        let Some(node) = self.nodes.iter_mut().find(|n| n.serial_index == serial_index) else {
            return false;
        };
        node.position.x = x_m / width;
        node.position.y = y_m / height;
        node.position.z = z;
        true
    }

    /// Moves a node relative to its current position; `x`/`y` are meters.
    pub fn add_position(&mut self, serial_index: u32, dx_m: f32, dy_m: f32, dz: f32) -> bool {
        let width = self.config.map_width_in_meters;
        let height = self.config.map_height_in_meters;
        let Some(node) = self.nodes.iter_mut().find(|n| n.serial_index == serial_index) else {
            return false;
        };
        node.position.x += dx_m / width;
        node.position.y += dy_m / height;
        node.position.z += dz;
        true
    }

    pub fn find_node_index_by_id(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Injects a terminal line into a node's UART buffer.
    pub fn send_uart_command(&mut self, node_id: NodeId, line: &str) -> bool {
        let Some(index) = self.find_node_index_by_id(node_id) else { return false };
        self.nodes[index].sd.uart_rx_lines.push_back(line.to_string());
        true
    }

    /// Records an internal consistency problem unless muted.
    pub fn report_error(&mut self, error: SimErrorType) {
        if self.disabled_errors.contains(&error) {
            return;
        }
        warn!(?error, time_ms = self.counters.sim_time_ms, "simulation error");
        self.sim_errors.push(error);
    }

    /// Mutes an expected error type, e.g. inside tests.
    pub fn disable_error(&mut self, error: SimErrorType) {
        self.disabled_errors.insert(error);
    }

    pub fn enable_error(&mut self, error: SimErrorType) {
        self.disabled_errors.remove(&error);
    }

    pub(crate) fn emit_json(&mut self, line: String) {
        if self.config.verbose {
            println!("{}", line);
        }
        self.json_journal.push(line);
    }

    // =========================================================================
    // STEP DRIVER
    // =========================================================================

    /// Advances the whole simulation by one tick.
    pub fn step_all_nodes(&mut self) {
        let tick_ms = self.config.sim_tick_duration_ms;
        let num_nodes = self.nodes.len();
        if num_nodes == 0 {
            return;
        }

        let sum_of_frames: i64 = self.nodes.iter().map(|n| n.simulated_frames).sum();
        let avg_frames = sum_of_frames / num_nodes as i64;

        for i in 0..num_nodes {
            if self.config.simulate_jittering {
                let frame_offset = self.nodes[i].simulated_frames - avg_frames;
                // Sigmoid flipped on the y-axis: nodes ahead of the average
                // are skipped more often so lagging nodes catch up.
                let probability = 1.0 / (1.0 + ((frame_offset as f64) * 0.1).exp());
                if self.counters.rng.next_f64() > probability {
                    continue;
                }
            }

            self.nodes[i].simulated_frames += 1;
            self.nodes[i].simulate_timer(tick_ms, &mut self.counters);
            self.simulate_timeouts(i);
            self.simulate_broadcast(i);
            self.simulate_connections(i);
            self.simulate_service_discovery(i);
            self.simulate_uart_interrupts(i);

            match self.nodes[i].pump_events(&mut self.counters) {
                PumpOutcome::Done => {}
                PumpOutcome::Reset(reason) => {
                    // The node broke out of its frame and reboots; the rest of
                    // the frame continues normally.
                    info!(node = self.nodes[i].id, ?reason, "node reset during frame");
                    self.reset_node(i, reason);
                }
            }

            self.simulate_flash_commit(i);
            self.nodes[i].simulate_battery_usage(tick_ms);
            self.nodes[i].simulate_watchdog();

            self.process_outbox(i);
            self.collect_node_json(i);
        }

        if self.config.enable_clustering_validity_check {
            validator::check_meshing_consistency(self);
        }

        self.counters.sim_time_ms += tick_ms;
        // The determinism contract: every tick starts from a fresh seed that
        // is derived only from the tick number and the global seed.
        self.counters
            .rng
            .reseed(self.counters.sim_time_ms.wrapping_add(self.config.seed));

        self.flash_write_cycle += 1;
        if self.config.store_flash_to_file.is_some()
            && self.flash_write_cycle % FLASH_TO_FILE_WRITE_INTERVAL == 0
        {
            self.store_flash_to_file();
        }
    }

    /// Resets one node, tearing down all of its GAP links first.
    pub fn reset_node(&mut self, index: usize, reason: crate::types::RebootReason) {
        for slot in 0..self.nodes[index].sd.connections.len() {
            if self.nodes[index].sd.connections[slot].active {
                let handle = self.nodes[index].sd.connections[slot].handle;
                self.disconnect_simulator_connection(
                    index,
                    handle,
                    crate::types::HciError::RemoteUserTerminatedConnection as u8,
                    crate::types::HciError::RemoteUserTerminatedConnection as u8,
                );
            }
        }
        self.nodes[index].reset(reason);
    }

    fn process_outbox(&mut self, index: usize) {
        let requests = std::mem::take(&mut self.nodes[index].outbox);
        for request in requests {
            match request {
                SimRequest::GapDisconnect { conn_handle, hci_reason, hci_reason_partner } => {
                    self.disconnect_simulator_connection(
                        index,
                        conn_handle,
                        hci_reason as u8,
                        hci_reason_partner as u8,
                    );
                }
            }
        }
    }

    fn collect_node_json(&mut self, index: usize) {
        let lines = std::mem::take(&mut self.nodes[index].json_log);
        for line in lines {
            self.emit_json(line);
        }
    }

    fn simulate_uart_interrupts(&mut self, index: usize) {
        while let Some(line) = self.nodes[index].sd.uart_rx_lines.pop_front() {
            self.nodes[index].handle_uart_line(&line, &mut self.counters);
        }
    }

    fn simulate_flash_commit(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        if node.flash.pending_async_operations > 0
            && self
                .counters
                .rng
                .roll(self.config.async_flash_commit_time_probability)
        {
            node.flash.pending_async_operations -= 1;
        }
    }

    // =========================================================================
    // FLASH SNAPSHOTS
    // =========================================================================

    pub fn store_flash_to_file(&mut self) {
        let Some(path) = self.config.store_flash_to_file.clone() else { return };
        let images: Vec<&[u8]> = self.nodes.iter().map(|n| n.flash.image()).collect();
        let data = flash::store_flash_snapshot(&images);
        if let Err(e) = std::fs::write(&path, data) {
            warn!(path, error = %e, "failed to persist flash snapshot");
        }
    }

    /// Loads a previously stored snapshot. A rejected snapshot is ignored and
    /// the file kept as is.
    pub fn load_flash_from_file(&mut self) -> bool {
        let Some(path) = self.config.store_flash_to_file.clone() else { return false };
        let Ok(data) = std::fs::read(&path) else { return false };
        match flash::load_flash_snapshot(&data, self.config.flash_size, self.nodes.len()) {
            Ok(images) => {
                for (node, image) in self.nodes.iter_mut().zip(images) {
                    node.flash.load_image(image);
                    node.boot();
                }
                true
            }
            Err(_) => {
                self.report_error(SimErrorType::CorruptOrOutdatedSavefile);
                false
            }
        }
    }

    // =========================================================================
    // INSPECTION HELPERS
    // =========================================================================

    /// Digest over all event queues, used by determinism tests.
    pub fn event_queue_digest(&self) -> u64 {
        self.nodes
            .iter()
            .fold(0u64, |acc, n| acc.wrapping_mul(0x1_0000_01b3) ^ n.event_queue.digest())
    }

    /// True once every non-asset node agrees on one cluster of full size.
    pub fn is_clustering_done(&self) -> bool {
        let mesh_nodes: Vec<&Node> =
            self.nodes.iter().filter(|n| n.config.device_type != DeviceType::Asset).collect();
        let Some(first) = mesh_nodes.first() else { return true };
        let expected = mesh_nodes.len() as i16;
        mesh_nodes
            .iter()
            .all(|n| n.cluster_size == expected && n.cluster_id == first.cluster_id)
    }
}
