//! Local queue of work not yet submitted to the device.
//!
//! Items stay here, in enqueue order, until a transaction reports them
//! accepted. The queue itself is unbounded storage; the bound comes from
//! the [`QueueCapacity`](crate::capacity::QueueCapacity) the caller passes
//! in, since that estimate can grow between calls.

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::time::Instant;

use crate::capacity::QueueCapacity;
use crate::staleness::StalenessOracle;
use crate::work::WorkItem;

/// FIFO of pending work.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<WorkItem>,
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending items.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append `item` if there is room.
    ///
    /// When the queue is at capacity, stale items are pruned first. If it
    /// is still full the item is handed back in `Err`.
    pub fn enqueue<S>(
        &mut self,
        item: WorkItem,
        capacity: &QueueCapacity,
        oracle: &S,
        now: Instant,
    ) -> Result<(), WorkItem>
    where
        S: StalenessOracle + ?Sized,
    {
        if capacity.is_full(self.items.len()) {
            self.prune_stale(oracle, now);
            if capacity.is_full(self.items.len()) {
                return Err(item);
            }
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Drop every item the oracle judges stale under a lenient check.
    ///
    /// Returns how many items were removed.
    pub fn prune_stale<S>(&mut self, oracle: &S, now: Instant) -> usize
    where
        S: StalenessOracle + ?Sized,
    {
        let before = self.items.len();
        self.items.retain(|item| !oracle.is_stale(item, now, false));
        before - self.items.len()
    }

    /// Pending items in submission order, left in place.
    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter()
    }

    /// Remove and return the first `count` items, in order.
    pub fn take_accepted(&mut self, count: usize) -> Drain<'_, WorkItem> {
        let count = count.min(self.items.len());
        self.items.drain(..count)
    }

    /// Discard everything. Returns how many items were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn never_stale(_: &WorkItem, _: Instant, _: bool) -> bool {
        false
    }

    fn work(tag: u8, t: Instant) -> WorkItem {
        WorkItem::new([tag; 32], [tag; 12], t)
    }

    #[test]
    fn test_enqueue_until_full() {
        let now = Instant::now();
        let cap = QueueCapacity::new(2);
        let mut queue = PendingQueue::new();

        assert!(queue.enqueue(work(1, now), &cap, &never_stale, now).is_ok());
        assert!(queue.enqueue(work(2, now), &cap, &never_stale, now).is_ok());
        let rejected = queue.enqueue(work(3, now), &cap, &never_stale, now);
        assert_eq!(rejected.unwrap_err().midstate, [3; 32]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_full_queue_prunes_before_rejecting() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let cap = QueueCapacity::new(1);
        let mut queue = PendingQueue::new();
        let stale_before_t1 = move |item: &WorkItem, _: Instant, _: bool| item.submit_time < t1;

        queue.enqueue(work(1, t0), &cap, &never_stale, t0).unwrap();
        assert!(queue.enqueue(work(2, t1), &cap, &stale_before_t1, t1).is_ok());
        assert_eq!(queue.len(), 1);
        let left: Vec<u8> = queue.iter().map(|w| w.midstate[0]).collect();
        assert_eq!(left, vec![2]);
    }

    #[test]
    fn test_prune_uses_lenient_check() {
        let now = Instant::now();
        let cap = QueueCapacity::new(8);
        let mut queue = PendingQueue::new();
        for tag in 0..4 {
            queue.enqueue(work(tag, now), &cap, &never_stale, now).unwrap();
        }

        let strict_seen = std::cell::Cell::new(false);
        let oracle = |item: &WorkItem, _: Instant, strict: bool| {
            if strict {
                strict_seen.set(true);
            }
            item.midstate[0] % 2 == 0
        };
        assert_eq!(queue.prune_stale(&oracle, now), 2);
        assert!(!strict_seen.get());

        let left: Vec<u8> = queue.iter().map(|w| w.midstate[0]).collect();
        assert_eq!(left, vec![1, 3]);
    }

    #[test]
    fn test_take_accepted_prefix() {
        let now = Instant::now();
        let cap = QueueCapacity::new(8);
        let mut queue = PendingQueue::new();
        for tag in 0..5 {
            queue.enqueue(work(tag, now), &cap, &never_stale, now).unwrap();
        }

        let taken: Vec<u8> = queue.take_accepted(3).map(|w| w.midstate[0]).collect();
        assert_eq!(taken, vec![0, 1, 2]);
        assert_eq!(queue.len(), 2);

        let rest: Vec<u8> = queue.take_accepted(10).map(|w| w.midstate[0]).collect();
        assert_eq!(rest, vec![3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let now = Instant::now();
        let cap = QueueCapacity::new(4);
        let mut queue = PendingQueue::new();
        queue.enqueue(work(0, now), &cap, &never_stale, now).unwrap();
        queue.enqueue(work(1, now), &cap, &never_stale, now).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.iter().count(), 0);
    }
}
