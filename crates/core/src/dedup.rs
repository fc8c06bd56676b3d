use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Remembers processed EventSub message ids so redeliveries are no-ops.
///
/// Memory-resident and best-effort: ids are forgotten after `ttl`, or oldest
/// first once `capacity` is reached.
#[derive(Debug)]
pub struct DedupGate {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl Default for DedupGate {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl DedupGate {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn should_process(&self, message_id: &str, now: Instant) -> bool {
        match self.seen.get(message_id) {
            Some(marked_at) => now.saturating_duration_since(*marked_at) >= self.ttl,
            None => true,
        }
    }

    pub fn mark_processed(&mut self, message_id: &str, now: Instant) {
        self.evict(now);
        self.seen.insert(message_id.to_string(), now);
        self.order.push_back((message_id.to_string(), now));
        while self.seen.len() > self.capacity {
            let Some((oldest, marked_at)) = self.order.pop_front() else {
                break;
            };
            self.forget(&oldest, marked_at);
        }
    }

    /// Returns `true` and records the id when it has not been seen yet.
    pub fn check_and_mark(&mut self, message_id: &str, now: Instant) -> bool {
        if !self.should_process(message_id, now) {
            return false;
        }
        self.mark_processed(message_id, now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((_, marked_at)) = self.order.front() {
            if now.saturating_duration_since(*marked_at) < self.ttl {
                break;
            }
            if let Some((id, marked_at)) = self.order.pop_front() {
                self.forget(&id, marked_at);
            }
        }
    }

    // A re-marked id leaves a stale queue entry behind; only drop the map
    // entry when it still belongs to that queue entry.
    fn forget(&mut self, message_id: &str, marked_at: Instant) {
        if self.seen.get(message_id) == Some(&marked_at) {
            self.seen.remove(message_id);
        }
    }
}
