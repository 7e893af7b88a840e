//! Adaptive device queue capacity.
//!
//! The board never reports how deep its internal work queue is. The
//! [`QueueCapacity`] tracker starts pessimistic and widens every time the
//! device accepts more submissions in one transaction than the current
//! estimate, so the local pending queue never holds more than the device
//! has shown it can take.
//!
//! # Usage
//!
//! The dispatcher checks [`QueueCapacity::is_full`] before admitting work
//! into the local queue and feeds each transaction's accepted count into
//! [`QueueCapacity::observe_accepted`].

/// Default starting estimate of the device queue depth.
pub const DEFAULT_INITIAL_CAPACITY: usize = 1;

/// Monotonic estimate of how many submissions the device will hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCapacity {
    /// Current estimate. Never shrinks.
    max: usize,
}

impl QueueCapacity {
    /// Create a tracker starting at `initial` (at least 1).
    pub fn new(initial: usize) -> Self {
        Self {
            max: initial.max(1),
        }
    }

    /// Current capacity estimate.
    #[inline]
    pub fn get(&self) -> usize {
        self.max
    }

    /// Whether a queue holding `size` items is full.
    #[inline]
    pub fn is_full(&self, size: usize) -> bool {
        size >= self.max
    }

    /// Record how many submissions the device accepted in one transaction.
    ///
    /// Returns `true` if the estimate grew. Accepting exactly the current
    /// estimate is not growth and keeps the steady poll interval.
    pub fn observe_accepted(&mut self, accepted: usize) -> bool {
        if accepted > self.max {
            self.max = accepted;
            true
        } else {
            false
        }
    }
}

impl Default for QueueCapacity {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_CAPACITY)
    }
}
