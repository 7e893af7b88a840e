//! Work items handed to the device.
//!
//! A [`WorkItem`] carries the two pieces of a block header the ASIC needs
//! to search a nonce range: the SHA-256 midstate over the first 64 bytes,
//! and the 12-byte tail (merkle root end, ntime, nbits) that follows it.

use std::time::Instant;

/// Length of the SHA-256 midstate.
pub const MIDSTATE_LEN: usize = 32;

/// Length of the block header tail sent alongside the midstate.
pub const DATA_TAIL_LEN: usize = 12;

/// Offset of the tail within an 80-byte block header.
pub const DATA_TAIL_OFFSET: usize = 0x40;

/// A unit of work owned by the dispatcher from enqueue until completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Hash chaining state, in block header byte order.
    pub midstate: [u8; MIDSTATE_LEN],
    /// Variable tail of the block header, in block header byte order.
    pub data_tail: [u8; DATA_TAIL_LEN],
    /// When the producer generated this work.
    pub submit_time: Instant,
    /// Identifier assigned once the device accepted the item.
    pub device_id: Option<u16>,
}

impl WorkItem {
    /// Create a pending work item.
    pub fn new(
        midstate: [u8; MIDSTATE_LEN],
        data_tail: [u8; DATA_TAIL_LEN],
        submit_time: Instant,
    ) -> Self {
        Self {
            midstate,
            data_tail,
            submit_time,
            device_id: None,
        }
    }

    /// Build a work item from a midstate and a full block header.
    ///
    /// Returns `None` if `header` is too short to contain the tail.
    pub fn from_header(
        midstate: [u8; MIDSTATE_LEN],
        header: &[u8],
        submit_time: Instant,
    ) -> Option<Self> {
        let tail = header.get(DATA_TAIL_OFFSET..DATA_TAIL_OFFSET + DATA_TAIL_LEN)?;
        let mut data_tail = [0u8; DATA_TAIL_LEN];
        data_tail.copy_from_slice(tail);
        Some(Self::new(midstate, data_tail, submit_time))
    }
}
