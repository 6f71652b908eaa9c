//! Acknowledged delivery of outbound log events.
//!
//! Every event gets a sequence number. Entries stay in the outbox until the
//! backend acknowledges a sequence at or above theirs; entries written to a
//! connection that is then lost are sent again on the next one. Delivery is
//! therefore at least once, and receivers deduplicate by event id.

use std::collections::VecDeque;

use mdk_protocol::LogEvent;

#[derive(Debug)]
struct Entry {
    sequence: u64,
    event: LogEvent,
    sent: bool,
}

/// Snapshot of the outbox counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStats {
    /// Events not yet acknowledged, sent or not
    pub pending: usize,
    /// Events written to the current connection and awaiting an ack
    pub in_flight: usize,
    /// Events discarded because the outbox was full
    pub dropped: u64,
    /// Events acknowledged by the backend
    pub acknowledged: u64,
}

#[derive(Debug)]
pub(crate) struct LogOutbox {
    capacity: usize,
    next_sequence: u64,
    entries: VecDeque<Entry>,
    dropped: u64,
    acknowledged: u64,
}

impl LogOutbox {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_sequence: 1,
            entries: VecDeque::new(),
            dropped: 0,
            acknowledged: 0,
        }
    }

    /// Queues an event, evicting the oldest entry when full.
    ///
    /// Returns the assigned sequence and the evicted event, if any.
    pub(crate) fn push(&mut self, event: LogEvent) -> (u64, Option<LogEvent>) {
        let evicted = if self.entries.len() >= self.capacity {
            self.dropped += 1;
            self.entries.pop_front().map(|entry| entry.event)
        } else {
            None
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push_back(Entry {
            sequence,
            event,
            sent: false,
        });
        (sequence, evicted)
    }

    /// Marks every unsent entry as sent and returns them in sequence order.
    pub(crate) fn take_unsent(&mut self) -> Vec<(u64, LogEvent)> {
        self.entries
            .iter_mut()
            .filter(|entry| !entry.sent)
            .map(|entry| {
                entry.sent = true;
                (entry.sequence, entry.event.clone())
            })
            .collect()
    }

    /// Cumulative acknowledgement; returns how many entries were released.
    pub(crate) fn ack(&mut self, sequence: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.sequence > sequence);
        let released = before - self.entries.len();
        self.acknowledged += released as u64;
        released
    }

    /// Makes in-flight entries eligible for sending again.
    pub(crate) fn requeue(&mut self) -> usize {
        let mut requeued = 0;
        for entry in self.entries.iter_mut().filter(|entry| entry.sent) {
            entry.sent = false;
            requeued += 1;
        }
        requeued
    }

    #[cfg(test)]
    pub(crate) fn has_unsent(&self) -> bool {
        self.entries.iter().any(|entry| !entry.sent)
    }

    pub(crate) fn stats(&self) -> OutboxStats {
        OutboxStats {
            pending: self.entries.len(),
            in_flight: self.entries.iter().filter(|entry| entry.sent).count(),
            dropped: self.dropped,
            acknowledged: self.acknowledged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdk_protocol::Severity;
    use pretty_assertions::assert_eq;

    fn event(text: &str) -> LogEvent {
        LogEvent::new("trace", "node", Severity::Info, "outbox", text)
    }

    fn texts(batch: &[(u64, LogEvent)]) -> Vec<String> {
        batch.iter().map(|(_, event)| event.text.clone()).collect()
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let mut outbox = LogOutbox::new(8);
        assert_eq!(outbox.push(event("a")).0, 1);
        assert_eq!(outbox.push(event("b")).0, 2);
        assert_eq!(outbox.push(event("c")).0, 3);
    }

    #[test]
    fn unsent_entries_are_taken_once() {
        let mut outbox = LogOutbox::new(8);
        outbox.push(event("a"));
        outbox.push(event("b"));

        assert_eq!(texts(&outbox.take_unsent()), vec!["a", "b"]);
        assert!(outbox.take_unsent().is_empty());
        assert!(!outbox.has_unsent());
        assert_eq!(outbox.stats().in_flight, 2);
    }

    #[test]
    fn ack_is_cumulative() {
        let mut outbox = LogOutbox::new(8);
        for text in ["a", "b", "c"] {
            outbox.push(event(text));
        }
        outbox.take_unsent();

        assert_eq!(outbox.ack(2), 2);
        assert_eq!(outbox.ack(1), 0);
        let stats = outbox.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.acknowledged, 2);
    }

    #[test]
    fn requeue_resends_in_flight_entries_in_order() {
        let mut outbox = LogOutbox::new(8);
        outbox.push(event("a"));
        outbox.push(event("b"));
        outbox.take_unsent();
        outbox.push(event("c"));

        assert_eq!(outbox.requeue(), 2);
        assert_eq!(texts(&outbox.take_unsent()), vec!["a", "b", "c"]);
    }

    #[test]
    fn full_outbox_drops_oldest() {
        let mut outbox = LogOutbox::new(2);
        outbox.push(event("a"));
        outbox.push(event("b"));
        let (sequence, evicted) = outbox.push(event("c"));

        assert_eq!(sequence, 3);
        assert_eq!(evicted.map(|e| e.text), Some("a".to_string()));
        assert_eq!(outbox.stats().dropped, 1);
        assert_eq!(texts(&outbox.take_unsent()), vec!["b", "c"]);
    }
}
