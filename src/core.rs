//! Routing of reply records to compute cores.
//!
//! A board reports results per `(chip, core)` pair. The dispatcher never
//! walks board topology itself; it asks a [`CoreRegistry`] for the consumer
//! behind a [`CoreId`] and hands the result over.

use std::collections::HashMap;

use crate::work::WorkItem;

/// Hashes covered by one completed work item (the full 32-bit nonce range).
pub const HASHES_PER_WORK_UNIT: u64 = 1 << 32;

/// Physical identity of one compute core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId {
    /// Chip index on the board.
    pub chip: u8,
    /// Core offset within the chip.
    pub core: u32,
}

impl CoreId {
    /// Create a core identity.
    #[inline]
    pub const fn new(chip: u8, core: u32) -> Self {
        Self { chip, core }
    }
}

impl std::fmt::Display for CoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:03}", self.chip, self.core)
    }
}

/// Consumer of results for one core.
pub trait CoreHandle {
    /// A nonce was found for `item`. The item stays in flight.
    fn on_nonce(&mut self, item: &WorkItem, nonce: u32);

    /// `count` work units were fully searched.
    fn on_hash_units_done(&mut self, count: u64);

    /// A result could not be matched to work.
    ///
    /// `nonce` is set when the record was a nonce report.
    fn on_hardware_event(&mut self, nonce: Option<u32>);
}

/// Maps core identities to their consumers.
pub trait CoreRegistry {
    /// The consumer for `core`, if it is currently known.
    fn route(&mut self, core: CoreId) -> Option<&mut dyn CoreHandle>;
}

/// Counters kept for one core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreStats {
    /// Nonces reported against known work.
    pub nonces: Vec<(Option<u16>, u32)>,
    /// Completed work units.
    pub work_units: u64,
    /// Unmatched results.
    pub hardware_errors: u64,
    /// Nonces carried by unmatched results.
    pub spurious_nonces: Vec<u32>,
}

impl CoreStats {
    /// Hashes done, derived from completed work units.
    #[inline]
    pub fn hashes(&self) -> u64 {
        self.work_units.saturating_mul(HASHES_PER_WORK_UNIT)
    }
}

impl CoreHandle for CoreStats {
    fn on_nonce(&mut self, item: &WorkItem, nonce: u32) {
        self.nonces.push((item.device_id, nonce));
    }

    fn on_hash_units_done(&mut self, count: u64) {
        self.work_units += count;
    }

    fn on_hardware_event(&mut self, nonce: Option<u32>) {
        self.hardware_errors += 1;
        if let Some(nonce) = nonce {
            self.spurious_nonces.push(nonce);
        }
    }
}

/// In-memory registry that records per-core counters.
#[derive(Debug, Default)]
pub struct CoreTable {
    cores: HashMap<CoreId, CoreStats>,
}

impl CoreTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with `cores_per_chip` cores on each of `chips`.
    pub fn with_layout(chips: impl IntoIterator<Item = u8>, cores_per_chip: u32) -> Self {
        let mut table = Self::new();
        for chip in chips {
            for core in 0..cores_per_chip {
                table.add(CoreId::new(chip, core));
            }
        }
        table
    }

    /// Register a core.
    pub fn add(&mut self, core: CoreId) {
        self.cores.entry(core).or_default();
    }

    /// Forget a core; later records for it become unroutable.
    pub fn remove(&mut self, core: CoreId) -> Option<CoreStats> {
        self.cores.remove(&core)
    }

    /// Counters for a core.
    pub fn stats(&self, core: CoreId) -> Option<&CoreStats> {
        self.cores.get(&core)
    }

    /// Number of registered cores.
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    /// Whether no cores are registered.
    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// Sum of hardware errors across all cores.
    pub fn total_hardware_errors(&self) -> u64 {
        self.cores.values().map(|s| s.hardware_errors).sum()
    }

    /// Sum of completed work units across all cores.
    pub fn total_work_units(&self) -> u64 {
        self.cores.values().map(|s| s.work_units).sum()
    }
}

impl CoreRegistry for CoreTable {
    fn route(&mut self, core: CoreId) -> Option<&mut dyn CoreHandle> {
        self.cores
            .get_mut(&core)
            .map(|stats| stats as &mut dyn CoreHandle)
    }
}
