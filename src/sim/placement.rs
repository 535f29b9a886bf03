//! Node placement: random positions with a connectivity guarantee, and the
//! site/devices JSON import.

use crate::config::{
    DEFAULT_CALIBRATED_TX, DEFAULT_DBM_TX, PATH_LOSS_EXPONENT_N, STABLE_CONNECTION_RSSI_THRESHOLD,
};
use crate::radio;
use serde_json::Value;
use tracing::{debug, warn};

use super::Simulator;

/// Passes over the placement loop before giving up on connectivity. On very
/// small maps with many nodes the loop converges in one or two passes; the
/// cap only guards against impossible configurations.
const MAX_PLACEMENT_ATTEMPTS: u32 = 1000;

/// Distance in meters below which two nodes can sustain a stable connection.
pub fn stable_connection_distance() -> f32 {
    radio::rssi_to_distance(
        STABLE_CONNECTION_RSSI_THRESHOLD,
        DEFAULT_CALIBRATED_TX as i32 + DEFAULT_DBM_TX as i32,
    )
}

/// Assigns random positions, then re-randomizes outliers until a DBSCAN run
/// with eps derived from the stable-RSSI threshold and minPts 1 places every
/// node in the cluster of node 0.
pub fn position_nodes_randomly(sim: &mut Simulator) {
    let n = sim.nodes.len();
    if n == 0 {
        return;
    }
    for i in 0..n {
        randomize(sim, i);
    }

    let eps_m = stable_connection_distance();
    let mut attempts = 0;
    loop {
        let labels = dbscan_labels(sim, eps_m);
        let outliers: Vec<usize> =
            (0..n).filter(|&i| labels[i] != labels[0]).collect();
        if outliers.is_empty() {
            debug!(nodes = n, eps_m, attempts, "placement converged");
            return;
        }
        attempts += 1;
        if attempts > MAX_PLACEMENT_ATTEMPTS {
            warn!(outliers = outliers.len(), "placement did not converge, keeping layout");
            return;
        }
        for i in outliers {
            randomize(sim, i);
        }
    }
}

fn randomize(sim: &mut Simulator, index: usize) {
    sim.nodes[index].position.x = sim.counters.rng.next_f64() as f32;
    sim.nodes[index].position.y = sim.counters.rng.next_f64() as f32;
    sim.nodes[index].position.z = 0.0;
}

/// DBSCAN with minPts 1 degenerates to connected components over the eps
/// neighborhood graph; the label is the component id.
fn dbscan_labels(sim: &Simulator, eps_m: f32) -> Vec<usize> {
    let n = sim.nodes.len();
    let mut labels = vec![usize::MAX; n];
    let mut next_label = 0;
    for start in 0..n {
        if labels[start] != usize::MAX {
            continue;
        }
        labels[start] = next_label;
        let mut queue = vec![start];
        while let Some(current) = queue.pop() {
            for other in 0..n {
                if labels[other] != usize::MAX {
                    continue;
                }
                let dist = radio::distance(
                    &sim.nodes[current].position,
                    &sim.nodes[other].position,
                    sim.config.map_width_in_meters,
                    sim.config.map_height_in_meters,
                );
                if dist <= eps_m {
                    labels[other] = next_label;
                    queue.push(other);
                }
            }
        }
        next_label += 1;
    }
    labels
}

// =============================================================================
// SITE / DEVICES JSON
// =============================================================================

/// Reads map dimensions from `results[0].lengthInMeter/heightInMeter`.
pub fn import_site(sim: &mut Simulator, json: &Value) -> bool {
    let Some(result) = json.get("results").and_then(|r| r.get(0)) else {
        return false;
    };
    let Some(length) = number(result.get("lengthInMeter")) else { return false };
    let Some(height) = number(result.get("heightInMeter")) else { return false };
    sim.set_map_dimensions(length as f32, height as f32);
    true
}

/// Places devices from a devices JSON export. Only `BLENODE` entries that are
/// on the map carry positions; `z` defaults to 0.
pub fn import_devices(sim: &mut Simulator, json: &Value) -> usize {
    let Some(devices) = json.get("results").and_then(|r| r.as_array()) else {
        return 0;
    };
    let mut placed = 0;
    for (index, device) in devices.iter().enumerate() {
        if device.get("platform").and_then(|p| p.as_str()) != Some("BLENODE") {
            continue;
        }
        let Some(properties) = device.get("properties") else { continue };
        let on_map = match properties.get("onMap") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        };
        if !on_map {
            continue;
        }
        let Some(x) = number(properties.get("x")) else { continue };
        let Some(y) = number(properties.get("y")) else { continue };
        let z = number(properties.get("z")).unwrap_or(0.0);
        if index < sim.nodes.len() {
            let serial = sim.nodes[index].serial_index;
            sim.set_position(serial, x as f32, y as f32, z as f32);
            placed += 1;
        }
    }
    placed
}

/// Accepts both JSON numbers and decimal strings.
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    #[test]
    fn stable_distance_is_sane() {
        // -85 threshold, -55 at one meter, N = 2.5 => about 16 meters.
        let d = stable_connection_distance();
        assert!(d > 10.0 && d < 25.0, "distance {}", d);
    }

    #[test]
    fn random_placement_is_connected() {
        let config = SimConfig { num_nodes: 12, ..Default::default() };
        let sim = Simulator::new(config);
        let eps = stable_connection_distance();
        let labels = dbscan_labels(&sim, eps);
        assert!(labels.iter().all(|&l| l == labels[0]));
    }

    #[test]
    fn site_and_devices_import() {
        let mut sim = Simulator::new(SimConfig { num_nodes: 2, ..Default::default() });
        let site: serde_json::Value = serde_json::json!({
            "results": [{"lengthInMeter": 100, "heightInMeter": 50}]
        });
        assert!(import_site(&mut sim, &site));
        assert_eq!(sim.config.map_width_in_meters, 100.0);

        let devices: serde_json::Value = serde_json::json!({
            "results": [
                {"platform": "BLENODE", "properties": {"onMap": true, "x": 10, "y": 5}},
                {"platform": "BLENODE", "properties": {"onMap": "true", "x": "20.5", "y": "2.5", "z": "1.0"}},
                {"platform": "GATEWAY", "properties": {"onMap": true, "x": 1, "y": 1}}
            ]
        });
        assert_eq!(import_devices(&mut sim, &devices), 2);
        assert!((sim.nodes[0].position.x - 0.1).abs() < 1e-6);
        assert!((sim.nodes[1].position.y - 0.05).abs() < 1e-6);
        assert_eq!(sim.nodes[1].position.z, 1.0);
    }
}
