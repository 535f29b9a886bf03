//! Simulator and firmware configuration.

// =============================================================================
// FIRMWARE CONSTANTS (Conf)
// =============================================================================
// These mirror the values compiled into the firmware image. All nodes in one
// simulation run the same image, so they are global here.

/// Total connection slots per node (mesh + tunnel + resolver).
pub const TOTAL_NUM_CONNECTIONS: usize = 5;

/// Mesh connections where we act as peripheral.
pub const MAX_MESH_IN_CONNECTIONS: usize = 1;
/// Mesh connections where we act as central.
pub const MAX_MESH_OUT_CONNECTIONS: usize = 3;

/// Peripheral links the softdevice is configured for.
pub const CONFIGURED_PERIPHERAL_CONNECTION_COUNT: u8 = 2;
/// Central links the softdevice is configured for.
pub const CONFIGURED_CENTRAL_CONNECTION_COUNT: u8 = 3;
/// All softdevice links.
pub const CONFIGURED_TOTAL_CONNECTION_COUNT: usize = 5;

/// Unreliable TX buffers the simulated softdevice offers per connection.
pub const SIM_NUM_UNRELIABLE_BUFFERS: usize = 7;
/// Reliable TX buffers (write requests) per connection.
pub const SIM_NUM_RELIABLE_BUFFERS: usize = 1;

/// Default GATT MTU before the exchange.
pub const GATT_MTU_SIZE_DEFAULT: u16 = 23;
/// MTU granted by the simulated data-length extension.
pub const GATT_MTU_SIZE_UPGRADED: u16 = 63;

/// Mesh connection interval in milliseconds.
pub const MESH_CONNECTION_INTERVAL_MS: u16 = 10;

/// Seconds the handshake may take before the connection is dropped.
pub const MESH_HANDSHAKE_TIMEOUT_DS: u32 = 70;

/// Deciseconds between connect attempt and GAP connecting timeout.
pub const GAP_CONNECTING_TIMEOUT_DS: u32 = 30;

/// Clustering decision cadence while discovery is HIGH.
pub const DISCOVERY_HIGH_DECISION_INTERVAL_DS: u32 = 10;
/// Clustering decision cadence while discovery is LOW.
pub const DISCOVERY_LOW_DECISION_INTERVAL_DS: u32 = 50;

/// Advertising interval per discovery state, milliseconds.
pub const ADV_INTERVAL_HIGH_MS: u32 = 100;
pub const ADV_INTERVAL_LOW_MS: u32 = 1000;

/// Deciseconds between time-sync rounds on each connection.
pub const TIME_BETWEEN_TIME_SYNC_INTERVALS_DS: u32 = 50;

/// Deciseconds between enrolled-node-count gossip rounds.
pub const ENROLLED_NODES_SYNC_INTERVAL_DS: u32 = 100;

/// Watchdog starvation budget. A node that does not feed for this long is
/// reset with `RebootReason::Watchdog`. 0 disables the watchdog.
pub const WATCHDOG_TIMEOUT_DS: u32 = 0;

/// Default transmit power in dBm.
pub const DEFAULT_DBM_TX: i8 = 4;
/// Calibrated RSSI at 1 m for the default boards.
pub const DEFAULT_CALIBRATED_TX: i8 = -59;

/// RSSI below which a connection is assumed too unstable to be set up on
/// purpose. Used for the random placement connectivity check.
pub const STABLE_CONNECTION_RSSI_THRESHOLD: i32 = -85;

/// Path loss exponent of the radio model.
pub const PATH_LOSS_EXPONENT_N: f32 = 2.5;

// Battery draw table, nano-ampere per simulated millisecond. The absolute
// values are rough board measurements; what matters is that a given config
// always produces the same totals.
pub const BATTERY_IDLE_DRAW: u32 = 10;
pub const BATTERY_LED_DRAW: u32 = 10_000;
pub const BATTERY_ADV_HIGH_DRAW: u32 = 1_000;
pub const BATTERY_ADV_LOW_DRAW: u32 = 100;
pub const BATTERY_SCAN_DRAW: u32 = 12_000;
pub const BATTERY_PER_CONNECTION_DRAW: u32 = 300;

/// Flash snapshots are written every this many ticks when enabled.
pub const FLASH_TO_FILE_WRITE_INTERVAL: u32 = 128;

// =============================================================================
// SIM CONFIG
// =============================================================================

/// Everything that defines a simulation run. Seed plus config must yield
/// identical mesh behavior across runs.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Global RNG seed. Reseeded each tick as `sim_time_ms + seed`.
    pub seed: u32,
    /// Virtual milliseconds one tick advances.
    pub sim_tick_duration_ms: u32,
    /// Number of normal mesh nodes.
    pub num_nodes: usize,
    /// Number of broadcast-only asset devices appended after the mesh nodes.
    pub num_asset_nodes: usize,
    /// Map width in meters. Node x positions are normalized against this.
    pub map_width_in_meters: f32,
    /// Map height in meters.
    pub map_height_in_meters: f32,
    /// Network id all nodes are preconfigured with.
    pub default_network_id: u16,
    /// Add log-normal noise to every RSSI sample.
    pub rssi_noise: bool,
    /// Per-second probability that an active connection is lost.
    pub connection_timeout_probability_per_sec: f64,
    /// Probability per tick that one pending async flash op commits.
    pub async_flash_commit_time_probability: f64,
    /// Probabilistically skip nodes so their frame counters diverge.
    pub simulate_jittering: bool,
    /// Run the clustering validator after every tick.
    pub enable_clustering_validity_check: bool,
    /// Emit `sim_connect` / `sim_data` / ... JSON lines on stdout.
    pub verbose: bool,
    /// Persist flash images to this path every snapshot interval.
    pub store_flash_to_file: Option<String>,
    /// Reestablishment budget in seconds; 0 disables reestablishment.
    pub mesh_extended_connection_timeout_sec: u32,
    /// Bytes of flash per node.
    pub flash_size: usize,
    /// Index of the node acting as sink, if any.
    pub sink_node_index: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            sim_tick_duration_ms: 50,
            num_nodes: 10,
            num_asset_nodes: 0,
            map_width_in_meters: 40.0,
            map_height_in_meters: 30.0,
            default_network_id: 10,
            rssi_noise: false,
            connection_timeout_probability_per_sec: 0.0,
            async_flash_commit_time_probability: 0.5,
            simulate_jittering: false,
            enable_clustering_validity_check: false,
            verbose: false,
            store_flash_to_file: None,
            mesh_extended_connection_timeout_sec: 10,
            flash_size: 128 * 1024,
            sink_node_index: Some(0),
        }
    }
}

impl SimConfig {
    pub fn total_nodes(&self) -> usize {
        self.num_nodes + self.num_asset_nodes
    }
}
