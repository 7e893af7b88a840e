//! In-flight registry keyed by device identifier.
//!
//! Every item the device has accepted lives here until a WorkDone record
//! releases it or a flush abandons it. Identifiers are 15 bits and wrap, so
//! an insert can land on an identifier that is still live; that means the
//! old item was never reported done and is evicted.
//!
//! # Example
//!
//! ```
//! use std::time::Instant;
//! use knc_dispatch::registry::InFlightRegistry;
//! use knc_dispatch::WorkItem;
//!
//! let mut registry = InFlightRegistry::new();
//! registry.insert(7, WorkItem::new([0; 32], [0; 12], Instant::now())).unwrap();
//! assert!(registry.lookup(7).is_some());
//! assert!(registry.remove(7).is_some());
//! assert!(registry.is_empty());
//! ```

use std::collections::HashMap;

use crate::error::{DispatchError, Result};
use crate::work::WorkItem;

/// Entry for one accepted work item.
#[derive(Debug)]
struct Entry {
    /// Insertion sequence, for finding the most recent entry.
    seq: u64,
    /// The work item.
    item: WorkItem,
}

/// Registry of work the device is searching.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    /// Entries by device identifier.
    entries: HashMap<u16, Entry>,
    /// Next insertion sequence number.
    next_seq: u64,
}

impl InFlightRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `device_id` is live.
    #[inline]
    pub fn contains(&self, device_id: u16) -> bool {
        self.entries.contains_key(&device_id)
    }

    /// Insert an item under a free identifier.
    ///
    /// Fails with `IdentifierCollision` and leaves the registry unchanged
    /// if `device_id` is already live.
    pub fn insert(&mut self, device_id: u16, item: WorkItem) -> Result<()> {
        if self.entries.contains_key(&device_id) {
            return Err(DispatchError::IdentifierCollision(device_id));
        }
        self.insert_evicting(device_id, item);
        Ok(())
    }

    /// Insert an item, evicting any live entry with the same identifier.
    ///
    /// Returns the evicted item.
    pub fn insert_evicting(&mut self, device_id: u16, mut item: WorkItem) -> Option<WorkItem> {
        item.device_id = Some(device_id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(device_id, Entry { seq, item })
            .map(|old| old.item)
    }

    /// Look up an item by identifier.
    pub fn lookup(&self, device_id: u16) -> Option<&WorkItem> {
        self.entries.get(&device_id).map(|e| &e.item)
    }

    /// Remove an item by identifier.
    pub fn remove(&mut self, device_id: u16) -> Option<WorkItem> {
        self.entries.remove(&device_id).map(|e| e.item)
    }

    /// The most recently inserted item still live.
    pub fn most_recent(&self) -> Option<&WorkItem> {
        self.entries
            .values()
            .max_by_key(|e| e.seq)
            .map(|e| &e.item)
    }

    /// Discard every entry. Returns how many were abandoned.
    pub fn drain_all(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    /// Live identifiers, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.keys().copied()
    }
}
