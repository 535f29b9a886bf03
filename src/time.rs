//! Per-node wall-clock state.
//!
//! Virtual time only advances through the step driver; a node considers its
//! clock valid once it was set locally (`settime`) or corrected through the
//! time-sync protocol of a mesh connection.

use crate::proto::{ConnPacketHeader, MessageType, TimeSyncPacket, TimeSyncType};
use crate::types::NodeId;

#[derive(Debug, Clone, Default)]
pub struct TimeManager {
    /// Unix timestamp at the moment of the last sync, 0 when never synced.
    sync_time_s: u32,
    /// Deciseconds elapsed since `sync_time_s` was established.
    time_since_sync_ds: u32,
    /// Offset in seconds applied on top (timezone handling).
    offset_s: i32,
    /// Set while an initial sync was received but the correction is pending.
    waiting_for_correction: bool,
}

impl TimeManager {
    /// Advances the local clock. Called once per firmware timer tick.
    pub fn add_ticks(&mut self, passed_ds: u32) {
        if self.sync_time_s != 0 {
            self.time_since_sync_ds += passed_ds;
        }
    }

    pub fn set_time(&mut self, unix_s: u32, offset_s: i32) {
        self.sync_time_s = unix_s;
        self.offset_s = offset_s;
        self.time_since_sync_ds = 0;
        self.waiting_for_correction = false;
    }

    /// A clock is usable once synced and not mid-correction.
    pub fn is_time_corrected(&self) -> bool {
        self.sync_time_s != 0 && !self.waiting_for_correction
    }

    pub fn is_time_set(&self) -> bool {
        self.sync_time_s != 0
    }

    /// Current unix time including the elapsed deciseconds.
    pub fn unix_time_s(&self) -> u32 {
        if self.sync_time_s == 0 {
            return 0;
        }
        (self.sync_time_s as i64 + (self.time_since_sync_ds / 10) as i64 + self.offset_s as i64)
            .max(0) as u32
    }

    pub fn initial_message(&self, sender: NodeId, receiver: NodeId) -> TimeSyncPacket {
        TimeSyncPacket {
            header: ConnPacketHeader::new(MessageType::TimeSync, sender, receiver),
            sync_type: TimeSyncType::Initial,
            sync_time_s: self.sync_time_s,
            time_since_sync_ds: self.time_since_sync_ds,
            correction_ticks: 0,
        }
    }

    /// Applies an incoming INITIAL. The correction is still outstanding.
    pub fn handle_initial(&mut self, packet: &TimeSyncPacket) {
        self.sync_time_s = packet.sync_time_s;
        self.time_since_sync_ds = packet.time_since_sync_ds;
        self.offset_s = 0;
        self.waiting_for_correction = true;
    }

    /// Applies the CORRECTION latency compensation and validates the clock.
    pub fn handle_correction(&mut self, packet: &TimeSyncPacket) {
        if self.sync_time_s != 0 {
            self.time_since_sync_ds += packet.correction_ticks;
            self.waiting_for_correction = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsynced_clock_is_invalid() {
        let t = TimeManager::default();
        assert!(!t.is_time_corrected());
        assert_eq!(t.unix_time_s(), 0);
    }

    #[test]
    fn set_time_and_advance() {
        let mut t = TimeManager::default();
        t.set_time(1_560_262_597, 0);
        assert!(t.is_time_corrected());
        t.add_ticks(100); // 10 s
        assert_eq!(t.unix_time_s(), 1_560_262_607);
    }

    #[test]
    fn initial_plus_correction() {
        let mut sender = TimeManager::default();
        sender.set_time(1_560_262_597, 0);
        sender.add_ticks(50);

        let packet = sender.initial_message(1, 2);
        let mut receiver = TimeManager::default();
        receiver.handle_initial(&packet);
        assert!(!receiver.is_time_corrected());

        let correction = TimeSyncPacket {
            header: ConnPacketHeader::new(MessageType::TimeSync, 1, 2),
            sync_type: TimeSyncType::Correction,
            sync_time_s: 0,
            time_since_sync_ds: 0,
            correction_ticks: 3,
        };
        receiver.handle_correction(&correction);
        assert!(receiver.is_time_corrected());
        // 5.0 s elapsed at sender + 0.3 s correction, truncated to seconds.
        assert_eq!(receiver.unix_time_s(), 1_560_262_597 + 5);
    }
}
