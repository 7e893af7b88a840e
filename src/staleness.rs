//! Staleness checks for queued work.
//!
//! Work goes stale when the chain tip moves. The dispatcher asks a
//! [`StalenessOracle`] both when pruning its local queue (lenient checks)
//! and when deciding whether the device queue must be flushed (strict
//! checks, "definitely stale").

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::work::WorkItem;

/// Decides whether a work item is still worth searching.
pub trait StalenessOracle {
    /// Whether `item` is stale at `now`.
    ///
    /// `strict` checks must only report work that is certainly worthless.
    fn is_stale(&self, item: &WorkItem, now: Instant, strict: bool) -> bool;
}

impl<F> StalenessOracle for F
where
    F: Fn(&WorkItem, Instant, bool) -> bool,
{
    fn is_stale(&self, item: &WorkItem, now: Instant, strict: bool) -> bool {
        self(item, now, strict)
    }
}

/// Staleness based on chain tip changes and work age.
///
/// Cloning shares the tip state, so the producer keeps one clone to report
/// new blocks while the dispatcher holds another.
///
/// - Work generated before the latest tip change is stale under both checks.
/// - Lenient checks also expire work older than `max_age`.
#[derive(Debug, Clone)]
pub struct TipTracker {
    /// When the chain tip last changed.
    tip_changed_at: Arc<RwLock<Option<Instant>>>,
    /// Age at which pending work is pruned.
    max_age: Duration,
}

impl TipTracker {
    /// Create a tracker expiring pending work after `max_age`.
    pub fn new(max_age: Duration) -> Self {
        Self {
            tip_changed_at: Arc::new(RwLock::new(None)),
            max_age,
        }
    }

    /// Record a chain tip change at `at`.
    pub fn tip_changed(&self, at: Instant) {
        let mut tip = self
            .tip_changed_at
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *tip = Some(at);
    }

    /// When the chain tip last changed, if ever.
    pub fn last_tip_change(&self) -> Option<Instant> {
        *self
            .tip_changed_at
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Maximum age of pending work.
    #[inline]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

impl StalenessOracle for TipTracker {
    fn is_stale(&self, item: &WorkItem, now: Instant, strict: bool) -> bool {
        if let Some(tip) = self.last_tip_change() {
            if item.submit_time < tip {
                return true;
            }
        }
        !strict && now.saturating_duration_since(item.submit_time) > self.max_age
    }
}
