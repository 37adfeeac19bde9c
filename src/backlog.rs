//! Bounded backlog of serialized payloads awaiting a broker session.
//!
//! Used by the publisher under [`DisconnectedPolicy::Buffer`](crate::config::DisconnectedPolicy::Buffer).
//! Payloads leave in the order they arrived. When the backlog is full the
//! oldest tenth is discarded to make room.

use std::collections::VecDeque;

use tracing::{debug, warn};

/// Statistics about backlog operations.
#[derive(Debug, Clone, Default)]
pub struct BacklogStats {
    /// Total number of payloads queued
    pub payloads_received: u64,

    /// Total number of payloads handed back for publishing
    pub payloads_flushed: u64,

    /// Total number of payloads discarded due to overflow
    pub payloads_dropped: u64,
}

/// FIFO of payloads with a hard capacity.
#[derive(Debug)]
pub struct Backlog {
    entries: VecDeque<Vec<u8>>,
    max_capacity: usize,
    stats: BacklogStats,
}

impl Backlog {
    /// Create an empty backlog holding at most `max_capacity` payloads.
    pub fn new(max_capacity: usize) -> Self {
        let max_capacity = max_capacity.max(1);
        Self {
            entries: VecDeque::new(),
            max_capacity,
            stats: BacklogStats::default(),
        }
    }

    /// Queue a payload, discarding the oldest entries if the backlog is full.
    pub fn push(&mut self, payload: Vec<u8>) {
        self.stats.payloads_received += 1;

        if self.entries.len() >= self.max_capacity {
            // Drop 10% to avoid dropping on every push
            let drop_count = (self.entries.len() / 10).max(1);

            warn!(
                backlog_size = self.entries.len(),
                drop_count = drop_count,
                max_capacity = self.max_capacity,
                "Backlog overflow: dropping oldest payloads"
            );

            self.entries.drain(0..drop_count);
            self.stats.payloads_dropped += drop_count as u64;
        }

        self.entries.push_back(payload);
    }

    /// Take the oldest payload.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let payload = self.entries.pop_front()?;
        self.stats.payloads_flushed += 1;
        Some(payload)
    }

    /// Put back a payload that could not be published, keeping its position.
    pub fn requeue(&mut self, payload: Vec<u8>) {
        debug!(backlog_size = self.entries.len(), "Requeueing unpublished payload");
        self.stats.payloads_flushed = self.stats.payloads_flushed.saturating_sub(1);
        self.entries.push_front(payload);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn stats(&self) -> &BacklogStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Vec<u8> {
        vec![n]
    }

    #[test]
    fn test_fifo_order() {
        let mut backlog = Backlog::new(10);
        backlog.push(payload(1));
        backlog.push(payload(2));
        backlog.push(payload(3));

        assert_eq!(backlog.pop(), Some(payload(1)));
        assert_eq!(backlog.pop(), Some(payload(2)));
        assert_eq!(backlog.pop(), Some(payload(3)));
        assert_eq!(backlog.pop(), None);
        assert_eq!(backlog.stats().payloads_flushed, 3);
        assert_eq!(backlog.stats().payloads_received, 3);
    }

    #[test]
    fn test_overflow_drops_oldest_tenth() {
        let mut backlog = Backlog::new(20);
        for n in 0..20 {
            backlog.push(payload(n));
        }
        assert_eq!(backlog.len(), 20);

        backlog.push(payload(20));

        // 2 oldest dropped, newest appended
        assert_eq!(backlog.len(), 19);
        assert_eq!(backlog.stats().payloads_dropped, 2);
        assert_eq!(backlog.pop(), Some(payload(2)));
    }

    #[test]
    fn test_overflow_small_capacity_drops_at_least_one() {
        let mut backlog = Backlog::new(3);
        for n in 0..4 {
            backlog.push(payload(n));
        }

        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog.stats().payloads_dropped, 1);
        assert_eq!(backlog.pop(), Some(payload(1)));
    }

    #[test]
    fn test_requeue_restores_front() {
        let mut backlog = Backlog::new(10);
        backlog.push(payload(1));
        backlog.push(payload(2));

        let first = backlog.pop().unwrap();
        backlog.requeue(first);

        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog.pop(), Some(payload(1)));
        assert_eq!(backlog.stats().payloads_flushed, 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let backlog = Backlog::new(0);
        assert_eq!(backlog.capacity(), 1);
        assert!(backlog.is_empty());
    }
}
