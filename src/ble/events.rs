//! Simulated BLE events.
//!
//! Every event carries a globally monotonic id so the exact interleaving of
//! radio activity is reproducible and comparable between runs.

use crate::types::{BleAddress, ADV_PACKET_BUFFER_SIZE};
use std::collections::VecDeque;

/// Source of a GAP timeout event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSource {
    Connection,
    Scan,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BleEventKind {
    AdvReport {
        peer_addr: BleAddress,
        rssi: i8,
        adv_type: u8,
        data: [u8; ADV_PACKET_BUFFER_SIZE],
        data_len: u8,
    },
    Connected {
        conn_handle: u16,
        is_central: bool,
        peer_addr: BleAddress,
        conn_interval_ms: u16,
    },
    Disconnected {
        conn_handle: u16,
        hci_reason: u8,
    },
    /// A write arrived on one of our GATT characteristics.
    GattsWrite {
        conn_handle: u16,
        characteristic_handle: u16,
        is_write_req: bool,
        data: Vec<u8>,
        /// Id of the buffered packet that generated this write.
        global_packet_id: u32,
    },
    /// A notification arrived from the partner's characteristic.
    GattcHvx {
        conn_handle: u16,
        characteristic_handle: u16,
        data: Vec<u8>,
        global_packet_id: u32,
    },
    /// Coalesced acknowledgement for unreliable sends.
    TxComplete {
        conn_handle: u16,
        count: u8,
    },
    /// Acknowledgement of a reliable write, echoing the packet id.
    WriteRsp {
        conn_handle: u16,
        global_packet_id: u32,
    },
    GapTimeout {
        source: TimeoutSource,
    },
    RssiChanged {
        conn_handle: u16,
        rssi: i8,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimBleEvent {
    pub global_id: u32,
    pub kind: BleEventKind,
}

/// Per-node FIFO of pending BLE events.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<SimBleEvent>,
}

impl EventQueue {
    pub fn push(&mut self, event: SimBleEvent) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<SimBleEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &SimBleEvent> {
        self.events.iter()
    }

    /// Stable digest of the queued events, used by determinism tests.
    pub fn digest(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for ev in &self.events {
            h = h.wrapping_mul(0x100_0000_01b3) ^ ev.global_id as u64;
            let kind_tag = match &ev.kind {
                BleEventKind::AdvReport { .. } => 1u64,
                BleEventKind::Connected { .. } => 2,
                BleEventKind::Disconnected { .. } => 3,
                BleEventKind::GattsWrite { data, .. } => {
                    4 ^ data.iter().fold(0u64, |a, b| a.wrapping_mul(31) ^ *b as u64)
                }
                BleEventKind::GattcHvx { data, .. } => {
                    5 ^ data.iter().fold(0u64, |a, b| a.wrapping_mul(31) ^ *b as u64)
                }
                BleEventKind::TxComplete { count, .. } => 6 ^ (*count as u64) << 8,
                BleEventKind::WriteRsp { global_packet_id, .. } => 7 ^ (*global_packet_id as u64) << 8,
                BleEventKind::GapTimeout { .. } => 8,
                BleEventKind::RssiChanged { .. } => 9,
            };
            h = h.wrapping_mul(0x100_0000_01b3) ^ kind_tag;
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = EventQueue::default();
        for id in 0..3 {
            q.push(SimBleEvent {
                global_id: id,
                kind: BleEventKind::GapTimeout { source: TimeoutSource::Connection },
            });
        }
        assert_eq!(q.pop().unwrap().global_id, 0);
        assert_eq!(q.pop().unwrap().global_id, 1);
        assert_eq!(q.pop().unwrap().global_id, 2);
        assert!(q.pop().is_none());
    }

    #[test]
    fn digest_reflects_content() {
        let mut a = EventQueue::default();
        let mut b = EventQueue::default();
        assert_eq!(a.digest(), b.digest());
        a.push(SimBleEvent {
            global_id: 1,
            kind: BleEventKind::TxComplete { conn_handle: 5, count: 2 },
        });
        assert_ne!(a.digest(), b.digest());
        b.push(SimBleEvent {
            global_id: 1,
            kind: BleEventKind::TxComplete { conn_handle: 5, count: 2 },
        });
        assert_eq!(a.digest(), b.digest());
    }
}
