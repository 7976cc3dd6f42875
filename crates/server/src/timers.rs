//! Deadline queue for the server actor.
//!
//! Each key has at most one live deadline. Rescheduling or cancelling a key
//! bumps its generation, so entries left behind in the heap are skipped when
//! they come due.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

use tokio::time::Instant;

pub struct TimerQueue<K> {
    heap: BinaryHeap<Reverse<(Instant, u64, K)>>,
    live: HashMap<K, u64>,
    next_gen: u64,
}

impl<K: Clone + Eq + Hash + Ord> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_gen: 0,
        }
    }

    /// Schedule `key` to fire at `deadline`, replacing any earlier schedule
    pub fn schedule(&mut self, key: K, deadline: Instant) {
        self.next_gen += 1;
        self.live.insert(key.clone(), self.next_gen);
        self.heap.push(Reverse((deadline, self.next_gen, key)));
    }

    pub fn cancel(&mut self, key: &K) {
        self.live.remove(key);
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_stale();
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pop every key whose deadline is at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        loop {
            self.drop_stale();
            match self.heap.peek() {
                Some(Reverse((deadline, _, _))) if *deadline <= now => {}
                _ => break,
            }
            if let Some(Reverse((_, _, key))) = self.heap.pop() {
                self.live.remove(&key);
                due.push(key);
            }
        }
        due
    }

    fn drop_stale(&mut self) {
        while let Some(Reverse((_, generation, key))) = self.heap.peek() {
            if self.live.get(key) == Some(generation) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<K: Clone + Eq + Hash + Ord> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule("b", now + Duration::from_secs(2));
        q.schedule("a", now + Duration::from_secs(1));
        q.schedule("c", now + Duration::from_secs(5));

        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(q.pop_due(now + Duration::from_secs(3)), vec!["a", "b"]);
        assert!(q.is_scheduled(&"c"));
    }

    #[test]
    fn reschedule_replaces_previous_deadline() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(1u32, now + Duration::from_secs(1));
        q.schedule(1u32, now + Duration::from_secs(10));

        assert!(q.pop_due(now + Duration::from_secs(5)).is_empty());
        assert_eq!(q.pop_due(now + Duration::from_secs(10)), vec![1]);
    }

    #[test]
    fn cancelled_keys_never_fire() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(7u32, now);
        q.cancel(&7);

        assert_eq!(q.next_deadline(), None);
        assert!(q.pop_due(now + Duration::from_secs(60)).is_empty());
    }
}
