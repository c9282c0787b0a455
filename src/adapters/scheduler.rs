use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::time::Instant;

/// A call waiting for its next fire time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub at: Instant,
    pub priority: i64,
    seq: u64,
    pub call: String,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .cmp(&other.at)
            .then(self.priority.cmp(&other.priority))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of throttled calls keyed by (fire time, priority, insertion order).
#[derive(Debug, Default)]
pub struct Scheduler {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self, at: Instant, priority: i64, call: &str) {
        self.seq += 1;
        self.heap.push(Reverse(Entry {
            at,
            priority,
            seq: self.seq,
            call: call.to_string(),
        }));
    }

    /// Removes and returns the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Entry> {
        match self.heap.peek() {
            Some(Reverse(e)) if e.at <= now => self.heap.pop().map(|Reverse(e)| e),
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_time_then_priority_order() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        s.enter(t0 + Duration::from_secs(5), 0, "late");
        s.enter(t0 + Duration::from_secs(1), 2, "low");
        s.enter(t0 + Duration::from_secs(1), 1, "high");
        s.enter(t0 + Duration::from_secs(1), 1, "high-second");

        let now = t0 + Duration::from_secs(2);
        let order: Vec<String> = std::iter::from_fn(|| s.pop_due(now)).map(|e| e.call).collect();
        assert_eq!(order, vec!["high", "high-second", "low"]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.next_deadline(), Some(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn nothing_due_before_deadline() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        s.enter(t0 + Duration::from_secs(1), 0, "x");
        assert!(s.pop_due(t0).is_none());
        assert!(!s.is_empty());
    }
}
