//! Outgoing transaction buffer.
//!
//! Uses `bytes::BytesMut` so the buffer is allocated once per device and
//! reused for every poll. Frames are appended in submission order and the
//! remainder is padded with no-op bytes up to the fixed transaction size.
//!
//! # Example
//!
//! ```
//! use knc_dispatch::protocol::{RequestBuffer, REQUEST_FRAME_SIZE};
//!
//! let mut tx = RequestBuffer::new(0x1000);
//! tx.emit_flush();
//! assert!(tx.emit_submit(0, &[0; 32], &[0; 12]));
//! assert_eq!(tx.submitted(), 1);
//! assert_eq!(tx.finish().len(), 0x1000);
//! ```

use bytes::{BufMut, BytesMut};

use super::wire_format::{
    encode_submit_frame, RequestCommand, NOP_BYTE, REQUEST_FRAME_SIZE,
};
use crate::work::{DATA_TAIL_LEN, MIDSTATE_LEN};

/// Builder for one outgoing bus transaction.
#[derive(Debug)]
pub struct RequestBuffer {
    /// Encoded frames so far.
    buf: BytesMut,
    /// Fixed transaction size.
    size: usize,
    /// Submission frames written since the last clear.
    submitted: usize,
    /// Whether a flush command leads the buffer.
    flush: bool,
}

impl RequestBuffer {
    /// Create an empty buffer for transactions of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(size),
            size,
            submitted: 0,
            flush: false,
        }
    }

    /// Reset for the next transaction, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.submitted = 0;
        self.flush = false;
    }

    /// Number of submission frames in the buffer.
    #[inline]
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Whether the buffer carries a flush command.
    #[inline]
    pub fn has_flush(&self) -> bool {
        self.flush
    }

    /// Bytes written so far, before padding.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// How many more submission frames fit.
    #[inline]
    pub fn remaining_frames(&self) -> usize {
        self.size.saturating_sub(self.buf.len()) / REQUEST_FRAME_SIZE
    }

    /// Append a flush command.
    ///
    /// The command byte is followed by padding up to one frame slot so
    /// submission frames after it stay frame aligned.
    pub fn emit_flush(&mut self) {
        let room = self.size.saturating_sub(self.buf.len());
        if room == 0 {
            return;
        }
        self.buf.put_u8(RequestCommand::FlushQueue.command_byte());
        self.buf.put_bytes(NOP_BYTE, room.min(REQUEST_FRAME_SIZE) - 1);
        self.flush = true;
    }

    /// Append one submission frame.
    ///
    /// Returns `false` without writing anything if the frame does not fit.
    pub fn emit_submit(
        &mut self,
        device_id: u16,
        midstate: &[u8; MIDSTATE_LEN],
        data_tail: &[u8; DATA_TAIL_LEN],
    ) -> bool {
        if self.remaining_frames() == 0 {
            return false;
        }
        let mut frame = [0u8; REQUEST_FRAME_SIZE];
        encode_submit_frame(&mut frame, device_id, midstate, data_tail);
        self.buf.put_slice(&frame);
        self.submitted += 1;
        true
    }

    /// Pad to the transaction size and return the bytes to exchange.
    pub fn finish(&mut self) -> &[u8] {
        let pad = self.size.saturating_sub(self.buf.len());
        self.buf.put_bytes(NOP_BYTE, pad);
        &self.buf[..]
    }
}

/// Build the stand-alone flush transaction issued when a device is attached.
///
/// This is a single command byte followed by padding.
pub fn clean_flush_request(size: usize) -> Vec<u8> {
    let mut buf = vec![NOP_BYTE; size];
    if let Some(first) = buf.first_mut() {
        *first = RequestCommand::FlushQueue.command_byte();
    }
    buf
}
