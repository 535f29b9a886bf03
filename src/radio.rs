//! Radio propagation model.
//!
//! RSSI follows the log-distance path loss model with exponent N. The
//! optional noise term follows the measurement model of Bardella et al.
//! (sigma grows linearly with the attenuation).

use crate::config::{DEFAULT_CALIBRATED_TX, DEFAULT_DBM_TX, PATH_LOSS_EXPONENT_N};
use crate::rng::RngStream;
use crate::types::Position;

/// RSSI reported when a connection is marked impossible.
pub const IMPOSSIBLE_RSSI: f32 = -10000.0;

/// Euclidean distance in meters. `x`/`y` are stored normalized and scaled by
/// the map dimensions, `z` is kept in meters.
pub fn distance(a: &Position, b: &Position, map_width_m: f32, map_height_m: f32) -> f32 {
    let dx = (a.x - b.x).abs() * map_width_m;
    let dy = (a.y - b.y).abs() * map_height_m;
    let dz = a.z - b.z;
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Inverse of the path loss model: distance at which `rssi` is observed.
pub fn rssi_to_distance(rssi: i32, calibrated_rssi: i32) -> f32 {
    10f32.powf((calibrated_rssi - rssi) as f32 / (10.0 * PATH_LOSS_EXPONENT_N))
}

/// Free-space RSSI between two positions without noise.
pub fn reception_rssi_clean(
    sender: &Position,
    receiver: &Position,
    sender_dbm_tx: i8,
    sender_calibrated_tx: i8,
    map_width_m: f32,
    map_height_m: f32,
) -> f32 {
    let dist = distance(sender, receiver, map_width_m, map_height_m);
    (sender_dbm_tx as f32 + sender_calibrated_tx as f32) - dist.log10() * 10.0 * PATH_LOSS_EXPONENT_N
}

/// RSSI with the optional log-normal noise term applied.
pub fn reception_rssi(
    sender: &Position,
    receiver: &Position,
    map_width_m: f32,
    map_height_m: f32,
    noise: Option<&mut RngStream>,
) -> f32 {
    let rssi = reception_rssi_clean(
        sender,
        receiver,
        DEFAULT_DBM_TX,
        DEFAULT_CALIBRATED_TX,
        map_width_m,
        map_height_m,
    );
    match noise {
        None => rssi,
        Some(rng) => {
            let std_dev = 0.0497 * rssi as f64 + 6.3438;
            rssi + rng.next_normal(0.0, std_dev) as f32
        }
    }
}

/// Maps RSSI to the probability that a packet is received.
pub fn reception_probability(rssi: f32) -> f64 {
    if rssi > -60.0 {
        0.9
    } else if rssi > -80.0 {
        0.8
    } else if rssi > -85.0 {
        0.5
    } else if rssi > -90.0 {
        0.3
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: f32, y: f32) -> Position {
        Position { x, y, z: 0.0 }
    }

    #[test]
    fn distance_scales_with_map() {
        let a = pos(0.0, 0.0);
        let b = pos(0.5, 0.0);
        assert_eq!(distance(&a, &b, 100.0, 100.0), 50.0);
        assert_eq!(distance(&a, &b, 10.0, 10.0), 5.0);
    }

    #[test]
    fn rssi_decreases_with_distance() {
        let a = pos(0.0, 0.0);
        let near = pos(0.001, 0.0);
        let far = pos(0.5, 0.0);
        let r_near = reception_rssi(&a, &near, 100.0, 100.0, None);
        let r_far = reception_rssi(&a, &far, 100.0, 100.0, None);
        assert!(r_near > r_far);
    }

    #[test]
    fn close_nodes_have_good_reception() {
        let a = pos(0.0, 0.0);
        let b = pos(0.001, 0.0); // 0.1 m on a 100 m map
        let rssi = reception_rssi(&a, &b, 100.0, 100.0, None);
        assert_eq!(reception_probability(rssi), 0.9);
    }

    #[test]
    fn probability_steps() {
        assert_eq!(reception_probability(-59.0), 0.9);
        assert_eq!(reception_probability(-79.0), 0.8);
        assert_eq!(reception_probability(-84.0), 0.5);
        assert_eq!(reception_probability(-89.0), 0.3);
        assert_eq!(reception_probability(-95.0), 0.0);
        assert_eq!(reception_probability(IMPOSSIBLE_RSSI), 0.0);
    }

    #[test]
    fn rssi_to_distance_inverts_model() {
        let d = 12.0f32;
        let rssi = (DEFAULT_DBM_TX as f32 + DEFAULT_CALIBRATED_TX as f32)
            - d.log10() * 10.0 * PATH_LOSS_EXPONENT_N;
        let back = rssi_to_distance(
            rssi.round() as i32,
            DEFAULT_DBM_TX as i32 + DEFAULT_CALIBRATED_TX as i32,
        );
        assert!((back - d).abs() < 1.0);
    }
}
