//! Per-connection send queue.
//!
//! Four priorities, FIFO within each. Messages are split into chunks at
//! hand-out time; a look-ahead cursor tracks chunks that were handed to the
//! softdevice but not yet acknowledged. After a reestablishment the cursor is
//! rolled back so every unacknowledged message is transmitted again.

use crate::proto::split_message;
use crate::types::{DeliveryOption, DeliveryPriority, AMOUNT_OF_SEND_QUEUE_PRIORITIES};
use std::collections::VecDeque;

/// Messages one priority level can hold.
const MAX_PACKETS_PER_PRIORITY: usize = 30;

/// Chunk origins that can be in flight at once.
const MAX_QUEUE_ORIGINS: usize = 32;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message_handle: u32,
    pub delivery: DeliveryOption,
    pub characteristic_handle: u16,
    pub data: Vec<u8>,
    /// Chunks handed to the softdevice (look-ahead position).
    pub sent_chunks: usize,
    /// Chunks confirmed on air.
    pub acked_chunks: usize,
}

/// A chunk ready to be placed into a softdevice buffer.
#[derive(Debug, Clone)]
pub struct OutboundChunk {
    pub priority: DeliveryPriority,
    pub delivery: DeliveryOption,
    pub characteristic_handle: u16,
    pub data: Vec<u8>,
    pub message_handle: u32,
    pub is_last_chunk: bool,
}

#[derive(Debug, Default)]
pub struct ChunkedPriorityQueue {
    queues: [VecDeque<QueuedMessage>; AMOUNT_OF_SEND_QUEUE_PRIORITIES],
    /// Priority of each chunk handed to the softdevice, in hand-out order.
    /// Acknowledgements consume from the front.
    queue_origins: VecDeque<DeliveryPriority>,
}

impl ChunkedPriorityQueue {
    pub fn queue_data(
        &mut self,
        priority: DeliveryPriority,
        delivery: DeliveryOption,
        characteristic_handle: u16,
        data: Vec<u8>,
        message_handle: u32,
    ) -> bool {
        let q = &mut self.queues[priority as usize];
        if q.len() >= MAX_PACKETS_PER_PRIORITY {
            return false;
        }
        q.push_back(QueuedMessage {
            message_handle,
            delivery,
            characteristic_handle,
            data,
            sent_chunks: 0,
            acked_chunks: 0,
        });
        true
    }

    /// Total queued messages over all priorities.
    pub fn amount_of_packets(&self) -> u32 {
        self.queues.iter().map(|q| q.len() as u32).sum()
    }

    /// All queued messages in priority order. Used by consistency checks.
    pub fn iter_messages(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.queues.iter().flat_map(|q| q.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    /// Hands out the next chunk in priority order, or `None` when everything
    /// was already handed to the softdevice.
    pub fn next_chunk(&mut self, payload_size: usize) -> Option<OutboundChunk> {
        if self.queue_origins.len() >= MAX_QUEUE_ORIGINS {
            return None;
        }
        for (prio_idx, queue) in self.queues.iter_mut().enumerate() {
            for msg in queue.iter_mut() {
                let chunks = split_message(&msg.data, payload_size);
                if msg.sent_chunks >= chunks.len() {
                    continue;
                }
                let chunk = chunks[msg.sent_chunks].clone();
                let is_last = msg.sent_chunks == chunks.len() - 1;
                msg.sent_chunks += 1;
                let priority = priority_from_index(prio_idx);
                self.queue_origins.push_back(priority);
                return Some(OutboundChunk {
                    priority,
                    delivery: msg.delivery,
                    characteristic_handle: msg.characteristic_handle,
                    data: chunk,
                    message_handle: msg.message_handle,
                    is_last_chunk: is_last,
                });
            }
        }
        None
    }

    /// Acknowledges `count` chunks in hand-out order. Returns the message
    /// handles of messages that became fully acknowledged.
    pub fn ack_chunks(&mut self, count: usize, payload_size: usize) -> Vec<u32> {
        let mut finished = Vec::new();
        for _ in 0..count {
            let Some(priority) = self.queue_origins.pop_front() else {
                break;
            };
            let queue = &mut self.queues[priority as usize];
            if let Some(front) = queue.front_mut() {
                front.acked_chunks += 1;
                let total = split_message(&front.data, payload_size).len();
                if front.acked_chunks >= total {
                    finished.push(front.message_handle);
                    queue.pop_front();
                }
            }
        }
        finished
    }

    /// Undoes the most recent `next_chunk` when no softdevice buffer of the
    /// matching class was free after all.
    pub fn unsend_last_chunk(&mut self) {
        let Some(priority) = self.queue_origins.pop_back() else {
            return;
        };
        let queue = &mut self.queues[priority as usize];
        // Messages are handed out in order, so the last touched one is the
        // rearmost message with any handed-out chunk.
        for msg in queue.iter_mut().rev() {
            if msg.sent_chunks > 0 {
                msg.sent_chunks -= 1;
                return;
            }
        }
    }

    /// Resets the look-ahead: every remaining message is sent from its first
    /// chunk again. Used when a dropped connection was reestablished.
    pub fn rollback_look_ahead(&mut self) {
        for queue in &mut self.queues {
            for msg in queue.iter_mut() {
                msg.sent_chunks = 0;
                msg.acked_chunks = 0;
            }
        }
        self.queue_origins.clear();
    }

    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        self.queue_origins.clear();
    }
}

fn priority_from_index(idx: usize) -> DeliveryPriority {
    match idx {
        0 => DeliveryPriority::Vital,
        1 => DeliveryPriority::High,
        2 => DeliveryPriority::Medium,
        _ => DeliveryPriority::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(data: Vec<u8>) -> (DeliveryOption, u16, Vec<u8>) {
        (DeliveryOption::WriteCmd, 0x12, data)
    }

    #[test]
    fn vital_drains_before_low() {
        let mut q = ChunkedPriorityQueue::default();
        let (d, h, data) = msg(vec![1; 5]);
        q.queue_data(DeliveryPriority::Low, d, h, data, 1);
        let (d, h, data) = msg(vec![2; 5]);
        q.queue_data(DeliveryPriority::Vital, d, h, data, 2);

        let first = q.next_chunk(20).unwrap();
        assert_eq!(first.priority, DeliveryPriority::Vital);
        let second = q.next_chunk(20).unwrap();
        assert_eq!(second.priority, DeliveryPriority::Low);
        assert!(q.next_chunk(20).is_none());
    }

    #[test]
    fn large_message_splits_and_acks() {
        let mut q = ChunkedPriorityQueue::default();
        let (d, h, data) = msg((0..50u8).collect());
        q.queue_data(DeliveryPriority::Medium, d, h, data, 7);

        let mut chunks = 0;
        while q.next_chunk(20).is_some() {
            chunks += 1;
        }
        assert_eq!(chunks, 3);

        assert_eq!(q.ack_chunks(2, 20), Vec::<u32>::new());
        assert_eq!(q.amount_of_packets(), 1);
        assert_eq!(q.ack_chunks(1, 20), vec![7]);
        assert_eq!(q.amount_of_packets(), 0);
    }

    #[test]
    fn rollback_resends_unacked() {
        let mut q = ChunkedPriorityQueue::default();
        let (d, h, data) = msg((0..50u8).collect());
        q.queue_data(DeliveryPriority::High, d, h, data, 3);

        // Hand out everything, ack only the first chunk.
        while q.next_chunk(20).is_some() {}
        q.ack_chunks(1, 20);
        assert!(q.next_chunk(20).is_none());

        q.rollback_look_ahead();
        // The whole message is handed out again from chunk zero.
        let first = q.next_chunk(20).unwrap();
        assert_eq!(first.data[1], 0); // split counter restarts
        let mut rest = 0;
        while q.next_chunk(20).is_some() {
            rest += 1;
        }
        assert_eq!(rest, 2);
    }

    #[test]
    fn capacity_limit() {
        let mut q = ChunkedPriorityQueue::default();
        for i in 0..MAX_PACKETS_PER_PRIORITY {
            let (d, h, data) = msg(vec![0; 4]);
            assert!(q.queue_data(DeliveryPriority::Low, d, h, data, i as u32));
        }
        let (d, h, data) = msg(vec![0; 4]);
        assert!(!q.queue_data(DeliveryPriority::Low, d, h, data, 999));
    }
}
