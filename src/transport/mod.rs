//! Transport module - the full-duplex bus the board sits on.
//!
//! The dispatcher only needs one primitive: write a fixed-size buffer and
//! read back a buffer of the same size in the same operation. Opening and
//! configuring the underlying device node is left to the [`BusTransport`]
//! implementation.

mod scripted;

pub use scripted::{ScriptedBus, ScriptedBusHandle};

use crate::error::Result;

/// One blocking full-duplex exchange per call.
pub trait BusTransport {
    /// Clock out `tx` and return what the device clocked in.
    ///
    /// Implementations either return a buffer or an error; there is no
    /// partial completion. The dispatcher rejects replies whose length
    /// differs from `tx`.
    fn exchange(&mut self, tx: &[u8]) -> Result<Vec<u8>>;
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn exchange(&mut self, tx: &[u8]) -> Result<Vec<u8>> {
        (**self).exchange(tx)
    }
}
