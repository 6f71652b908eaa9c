//! Duplicate suppression for redelivered log events.
//!
//! Remembers event ids for a TTL, bounded in size. When full the oldest id is
//! forgotten first.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) struct SeenEvents {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl SeenEvents {
    pub(crate) fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
            ttl,
        }
    }

    /// Returns `true` if `id` was seen within the TTL; otherwise records it.
    pub(crate) fn is_duplicate(&mut self, id: &str) -> bool {
        let now = Instant::now();
        self.cleanup_expired(now);

        if self.seen.contains_key(id) {
            return true;
        }

        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));
        while self.seen.len() > self.max_size {
            self.evict_oldest();
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.seen.len()
    }

    pub(crate) fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    fn cleanup_expired(&mut self, now: Instant) {
        while let Some((_, inserted)) = self.order.front() {
            if now.duration_since(*inserted) < self.ttl {
                break;
            }
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((id, inserted)) = self.order.pop_front() {
            // Only forget the id if this queue entry is the live one.
            if self.seen.get(&id) == Some(&inserted) {
                self.seen.remove(&id);
            }
        }
    }
}
