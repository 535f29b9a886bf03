//! Simulator terminal command surface.
//!
//! Commands the simulator itself understands; anything unknown is forwarded
//! to the selected node's UART. A command may carry a trailing `CRC: N`
//! token pair whose CRC-32 must match the command text in front of it.

use crate::types::NodeId;
use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

use super::{placement, Simulator};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TerminalError {
    #[error("crc of command is invalid")]
    CrcInvalid,
    #[error("unknown command")]
    UnknownCommand,
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("io error: {0}")]
    Io(String),
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Executes one terminal line against the simulator. Returns the textual
/// response for interactive use.
pub fn execute(sim: &mut Simulator, line: &str) -> Result<String, TerminalError> {
    let mut tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(String::new());
    }

    // Optional trailing "CRC: <n>" pair.
    if tokens.len() >= 2 && tokens[tokens.len() - 2] == "CRC:" {
        let given: u32 =
            tokens[tokens.len() - 1].parse().map_err(|_| TerminalError::CrcInvalid)?;
        let command_text = tokens[..tokens.len() - 2].join(" ");
        if CRC32.checksum(command_text.as_bytes()) != given {
            return Err(TerminalError::CrcInvalid);
        }
        tokens.truncate(tokens.len() - 2);
    }

    match tokens[0] {
        "simstat" => {
            let mut out = format!(
                "time: {} ms, nodes: {}, seed: {}, map: {}x{} m",
                sim.sim_time_ms(),
                sim.nodes.len(),
                sim.config.seed,
                sim.config.map_width_in_meters,
                sim.config.map_height_in_meters
            );
            for node in &sim.nodes {
                out.push_str(&format!(
                    "\nnode {}: cluster {:x} size {} frames {}",
                    node.id, node.cluster_id, node.cluster_size, node.simulated_frames
                ));
            }
            Ok(out)
        }
        "term" => {
            let target = tokens.get(1).ok_or(TerminalError::InvalidArgs)?;
            sim.terminal_target = if *target == "all" {
                None
            } else {
                Some(target.parse::<NodeId>().map_err(|_| TerminalError::InvalidArgs)?)
            };
            Ok(format!("terminal routed to {}", target))
        }
        "nodes" => {
            let n = parse_arg(&tokens, 1)?;
            sim.set_num_nodes(n);
            Ok(format!("simulation restarted with {} nodes", n))
        }
        "assetnodes" => {
            let n = parse_arg(&tokens, 1)?;
            sim.set_num_asset_nodes(n);
            Ok(format!("simulation restarted with {} asset nodes", n))
        }
        "seed" | "seedr" => {
            if let Some(value) = tokens.get(1) {
                let seed = value.parse().map_err(|_| TerminalError::InvalidArgs)?;
                sim.set_seed(seed);
                if tokens[0] == "seedr" {
                    sim.reset_simulation();
                }
                Ok(format!("seed set to {}", seed))
            } else {
                Ok(format!("seed is {}", sim.config.seed))
            }
        }
        "width" => {
            let w: f32 = parse_arg(&tokens, 1)?;
            sim.set_map_dimensions(w, sim.config.map_height_in_meters);
            Ok(format!("width set to {}", w))
        }
        "height" => {
            let h: f32 = parse_arg(&tokens, 1)?;
            sim.set_map_dimensions(sim.config.map_width_in_meters, h);
            Ok(format!("height set to {}", h))
        }
        "lossprob" => {
            let p: f64 = parse_arg(&tokens, 1)?;
            sim.config.connection_timeout_probability_per_sec = p;
            Ok(format!("connection loss probability set to {}", p))
        }
        "delay" => {
            // Terminal pacing only matters for interactive runs.
            let _d: u32 = parse_arg(&tokens, 1)?;
            Ok(String::new())
        }
        "json" => {
            let v: u32 = parse_arg(&tokens, 1)?;
            sim.config.verbose = v != 0;
            Ok(format!("json output {}", if v != 0 { "on" } else { "off" }))
        }
        "site" => {
            let path = tokens.get(1).ok_or(TerminalError::InvalidArgs)?;
            let text = std::fs::read_to_string(path).map_err(|e| TerminalError::Io(e.to_string()))?;
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| TerminalError::Io(e.to_string()))?;
            if placement::import_site(sim, &json) {
                Ok("site imported".to_string())
            } else {
                Err(TerminalError::InvalidArgs)
            }
        }
        "devices" => {
            let path = tokens.get(1).ok_or(TerminalError::InvalidArgs)?;
            let text = std::fs::read_to_string(path).map_err(|e| TerminalError::Io(e.to_string()))?;
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| TerminalError::Io(e.to_string()))?;
            Ok(format!("{} devices placed", placement::import_devices(sim, &json)))
        }
        "sim" => execute_sim_subcommand(sim, &tokens),
        "flush" => {
            for node in &mut sim.nodes {
                node.flash.pending_async_operations = 0;
            }
            Ok("flash operations committed".to_string())
        }
        "flushfail" => {
            // Pending operations are dropped without being applied.
            let mut dropped = 0;
            for node in &mut sim.nodes {
                dropped += node.flash.pending_async_operations;
                node.flash.pending_async_operations = 0;
            }
            Ok(format!("{} flash operations failed", dropped))
        }
        "blockconn" => {
            sim.block_connections = !sim.block_connections;
            Ok(format!("connections blocked: {}", sim.block_connections))
        }
        "rees" => {
            let handle: u16 = parse_arg(&tokens, 1)?;
            // Drop the GAP link with a timeout so both sides try to recover.
            let index = (0..sim.nodes.len())
                .find(|&i| sim.nodes[i].sd.find_connection_by_handle(handle).is_some())
                .ok_or(TerminalError::InvalidArgs)?;
            sim.disconnect_simulator_connection(index, handle, 0x08, 0x08);
            Ok(format!("connection {} dropped for reestablishment", handle))
        }
        "simloss" => Ok(format!("{} simulated losses", sim.simulated_connection_losses)),
        "sendstat" => {
            let filter: Option<NodeId> = tokens.get(1).and_then(|t| t.parse().ok());
            let mut out = String::new();
            for node in &sim.nodes {
                if filter.map(|id| id != node.id).unwrap_or(false) {
                    continue;
                }
                let (mut reliable, mut unreliable, mut dropped) = (0u32, 0u32, 0u32);
                for slot in node.cm.occupied_slots() {
                    if let Some(conn) = node.cm.get(slot) {
                        reliable += conn.sent_reliable as u32;
                        unreliable += conn.sent_unreliable as u32;
                        dropped += conn.dropped_packets as u32;
                    }
                }
                out.push_str(&format!(
                    "node {}: sent {} reliable, {} unreliable, dropped {}\n",
                    node.id, reliable, unreliable, dropped
                ));
            }
            Ok(out)
        }
        "routestat" => {
            let filter: Option<NodeId> = tokens.get(1).and_then(|t| t.parse().ok());
            let mut out = String::new();
            for node in &sim.nodes {
                if filter.map(|id| id != node.id).unwrap_or(false) {
                    continue;
                }
                out.push_str(&format!(
                    "node {}: hops to sink {}, received {} messages, dropped {}\n",
                    node.id,
                    node.hops_to_sink(),
                    node.received_messages.len(),
                    node.cm.dropped_mesh_packets
                ));
            }
            Ok(out)
        }
        _ => {
            // Not a simulator command: forward to the selected node(s).
            match sim.terminal_target {
                Some(id) => {
                    if sim.send_uart_command(id, line) {
                        Ok(String::new())
                    } else {
                        Err(TerminalError::InvalidArgs)
                    }
                }
                None => {
                    let ids: Vec<NodeId> = sim.nodes.iter().map(|n| n.id).collect();
                    for id in ids {
                        sim.send_uart_command(id, line);
                    }
                    Ok(String::new())
                }
            }
        }
    }
}

fn execute_sim_subcommand(sim: &mut Simulator, tokens: &[&str]) -> Result<String, TerminalError> {
    match tokens.get(1) {
        Some(&"set_position") if tokens.len() >= 6 => {
            let serial: u32 = tokens[2].parse().map_err(|_| TerminalError::InvalidArgs)?;
            let x: f32 = tokens[3].parse().map_err(|_| TerminalError::InvalidArgs)?;
            let y: f32 = tokens[4].parse().map_err(|_| TerminalError::InvalidArgs)?;
            let z: f32 = tokens[5].parse().map_err(|_| TerminalError::InvalidArgs)?;
            if sim.set_position(serial, x, y, z) {
                Ok("position set".to_string())
            } else {
                Err(TerminalError::InvalidArgs)
            }
        }
        Some(&"add_position") if tokens.len() >= 6 => {
            let serial: u32 = tokens[2].parse().map_err(|_| TerminalError::InvalidArgs)?;
            let x: f32 = tokens[3].parse().map_err(|_| TerminalError::InvalidArgs)?;
            let y: f32 = tokens[4].parse().map_err(|_| TerminalError::InvalidArgs)?;
            let z: f32 = tokens[5].parse().map_err(|_| TerminalError::InvalidArgs)?;
            if sim.add_position(serial, x, y, z) {
                Ok("position updated".to_string())
            } else {
                Err(TerminalError::InvalidArgs)
            }
        }
        _ => Err(TerminalError::UnknownCommand),
    }
}

fn parse_arg<T: std::str::FromStr>(tokens: &[&str], index: usize) -> Result<T, TerminalError> {
    tokens
        .get(index)
        .ok_or(TerminalError::InvalidArgs)?
        .parse()
        .map_err(|_| TerminalError::InvalidArgs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    fn small_sim() -> Simulator {
        Simulator::new(SimConfig { num_nodes: 2, ..Default::default() })
    }

    #[test]
    fn crc_suffix_is_checked() {
        let mut sim = small_sim();
        let command = "width 50";
        let crc = CRC32.checksum(command.as_bytes());

        let ok = execute(&mut sim, &format!("{} CRC: {}", command, crc));
        assert!(ok.is_ok());
        assert_eq!(sim.config.map_width_in_meters, 50.0);

        let bad = execute(&mut sim, &format!("{} CRC: {}", command, crc.wrapping_add(1)));
        assert_eq!(bad, Err(TerminalError::CrcInvalid));
    }

    #[test]
    fn set_position_command() {
        let mut sim = small_sim();
        let serial = sim.nodes[0].serial_index;
        execute(&mut sim, &format!("sim set_position {} 10 5 0", serial)).unwrap();
        assert!((sim.nodes[0].position.x - 10.0 / sim.config.map_width_in_meters).abs() < 1e-6);
    }

    #[test]
    fn unknown_commands_are_forwarded_to_nodes() {
        let mut sim = small_sim();
        execute(&mut sim, "term 1").unwrap();
        execute(&mut sim, "gettime").unwrap();
        assert_eq!(sim.nodes[0].sd.uart_rx_lines.len(), 1);
        assert_eq!(sim.nodes[1].sd.uart_rx_lines.len(), 0);
    }

    #[test]
    fn blockconn_toggles() {
        let mut sim = small_sim();
        assert!(!sim.block_connections);
        execute(&mut sim, "blockconn").unwrap();
        assert!(sim.block_connections);
    }
}
