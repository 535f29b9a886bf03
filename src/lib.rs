pub mod ble;
pub mod config;
pub mod crypto;
pub mod flash;
pub mod mesh;
pub mod node;
pub mod proto;
pub mod radio;
pub mod rng;
pub mod sim;
pub mod time;
pub mod types;

pub use config::SimConfig;
pub use node::{AuthorizationPolicy, Node, PumpOutcome, SimCounters};
pub use rng::RngStream;
pub use sim::terminal::TerminalError;
pub use sim::Simulator;
pub use types::*;
