//! Wire format of the bus transaction.
//!
//! Every transaction is one fixed-size full-duplex exchange. The host side
//! carries request frames, the device side carries a header followed by
//! reply records:
//!
//! ```text
//! request frame (48 bytes)
//! ┌─────┬──────┬──────────┬────────────────────┬───────────────────┐
//! │ Cmd │ 0x00 │ Work ID  │ Midstate (rev.)    │ Data tail (rev.)  │
//! │ hi4 │      │ 15 bit BE│ 32 bytes           │ 12 bytes          │
//! └─────┴──────┴──────────┴────────────────────┴───────────────────┘
//!
//! transaction header (12 bytes)
//! ┌──────────┬────────┬──────────┬──────────┬──────────┐
//! │ 3 bytes  │ Status │ 2 bytes  │ Accepted │ 4 bytes  │
//! │          │ bit0=OV│          │ uint16 BE│          │
//! └──────────┴────────┴──────────┴──────────┴──────────┘
//!
//! reply record (12 bytes)
//! ┌───────────────┬──────┬──────────┬──────────┬──────────┐
//! │ Type │ Chip   │      │ Work ID  │ Nonce    │ Core     │
//! │ b7-6 │ b5-3   │      │ uint16 BE│ uint32 BE│ uint32 BE│
//! └───────────────┴──────┴──────────┴──────────┴──────────┘
//! ```

use crate::work::{DATA_TAIL_LEN, MIDSTATE_LEN};

/// Default size of one bus transaction in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 0x1000;

/// Size of one submission frame.
pub const REQUEST_FRAME_SIZE: usize = 0x30;

/// Size of the transaction header at the start of the reply.
pub const TRANSACTION_HEADER_SIZE: usize = 0xc;

/// Size of one reply record.
pub const REPLY_RECORD_SIZE: usize = 0xc;

/// Padding byte filling unused request space.
pub const NOP_BYTE: u8 = 0x00;

/// Device identifiers are 15 bits wide.
pub const DEVICE_ID_MASK: u16 = 0x7fff;

/// Offset of the midstate within a request frame.
pub const MIDSTATE_OFFSET: usize = 4;

/// Offset of the data tail within a request frame.
pub const DATA_TAIL_FRAME_OFFSET: usize = MIDSTATE_OFFSET + MIDSTATE_LEN;

const _: () = assert!(DATA_TAIL_FRAME_OFFSET + DATA_TAIL_LEN == REQUEST_FRAME_SIZE);

/// Request commands, carried in the high nibble of the first frame byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCommand {
    /// Queue a work item on the device.
    SubmitWork = 2,
    /// Discard everything queued on the device.
    FlushQueue = 3,
}

impl RequestCommand {
    /// The first byte of a frame carrying this command.
    #[inline]
    pub const fn command_byte(self) -> u8 {
        (self as u8) << 4
    }
}

/// Kind of a reply record, from the top two bits of its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Empty slot.
    None,
    /// A core found a nonce for the referenced work.
    NonceFound,
    /// A core exhausted the nonce range of the referenced work.
    WorkDone,
    /// Unassigned type code.
    Reserved,
}

impl ReplyKind {
    /// Decode from the first byte of a record.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        match byte >> 6 {
            1 => ReplyKind::NonceFound,
            2 => ReplyKind::WorkDone,
            0 => ReplyKind::None,
            _ => ReplyKind::Reserved,
        }
    }

    /// Whether records of this kind carry a result to route.
    #[inline]
    pub fn is_result(self) -> bool {
        matches!(self, ReplyKind::NonceFound | ReplyKind::WorkDone)
    }
}

/// Decoded transaction header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHeader {
    /// The device dropped reply data since the last transaction.
    pub overflow: bool,
    /// Number of submitted frames admitted into the device queue.
    pub accepted: u16,
}

impl TransactionHeader {
    /// Decode the header from the start of a reply buffer.
    ///
    /// Returns `None` if the buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use knc_dispatch::protocol::TransactionHeader;
    ///
    /// let bytes = [0, 0, 0, 1, 0, 0, 0, 3, 0, 0, 0, 0];
    /// let header = TransactionHeader::decode(&bytes).unwrap();
    /// assert!(header.overflow);
    /// assert_eq!(header.accepted, 3);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < TRANSACTION_HEADER_SIZE {
            return None;
        }
        Some(Self {
            overflow: buf[3] & 1 != 0,
            accepted: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }

    /// Encode the header, as the device would.
    pub fn encode(&self) -> [u8; TRANSACTION_HEADER_SIZE] {
        let mut buf = [0u8; TRANSACTION_HEADER_SIZE];
        buf[3] = self.overflow as u8;
        buf[6..8].copy_from_slice(&self.accepted.to_be_bytes());
        buf
    }
}

/// Decoded reply record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyRecord {
    /// Record type.
    pub kind: ReplyKind,
    /// Chip that produced the record (0-7).
    pub chip: u8,
    /// Identifier of the work the record concerns.
    pub device_id: u16,
    /// Nonce value, meaningful for `NonceFound` only.
    pub nonce: u32,
    /// Core offset within the chip.
    pub core: u32,
}

impl ReplyRecord {
    /// Decode one record.
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < REPLY_RECORD_SIZE {
            return None;
        }
        Some(Self {
            kind: ReplyKind::from_byte(buf[0]),
            chip: (buf[0] & 0x38) >> 3,
            device_id: u16::from_be_bytes([buf[2], buf[3]]),
            // The device emits the nonce least significant byte first.
            nonce: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            core: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Encode a record, as the device would.
    pub fn encode(&self) -> [u8; REPLY_RECORD_SIZE] {
        let kind: u8 = match self.kind {
            ReplyKind::None => 0,
            ReplyKind::NonceFound => 1,
            ReplyKind::WorkDone => 2,
            ReplyKind::Reserved => 3,
        };
        let mut buf = [0u8; REPLY_RECORD_SIZE];
        buf[0] = (kind << 6) | ((self.chip & 0x7) << 3);
        buf[2..4].copy_from_slice(&self.device_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.nonce.to_be_bytes());
        buf[8..12].copy_from_slice(&self.core.to_be_bytes());
        buf
    }

    /// Nonce carried by the record, if it is a `NonceFound` record.
    #[inline]
    pub fn found_nonce(&self) -> Option<u32> {
        (self.kind == ReplyKind::NonceFound).then_some(self.nonce)
    }
}

/// Encode one submission frame into `buf`.
///
/// Midstate and data tail are written byte-reversed; the device expects
/// them least significant byte first.
///
/// # Panics
///
/// Panics if `buf` is smaller than `REQUEST_FRAME_SIZE`.
pub fn encode_submit_frame(
    buf: &mut [u8],
    device_id: u16,
    midstate: &[u8; MIDSTATE_LEN],
    data_tail: &[u8; DATA_TAIL_LEN],
) {
    let buf = &mut buf[..REQUEST_FRAME_SIZE];
    buf[0] = RequestCommand::SubmitWork.command_byte();
    buf[1] = 0;
    buf[2] = ((device_id >> 8) as u8) & 0x7f;
    buf[3] = device_id as u8;
    for (dst, src) in buf[MIDSTATE_OFFSET..DATA_TAIL_FRAME_OFFSET]
        .iter_mut()
        .zip(midstate.iter().rev())
    {
        *dst = *src;
    }
    for (dst, src) in buf[DATA_TAIL_FRAME_OFFSET..]
        .iter_mut()
        .zip(data_tail.iter().rev())
    {
        *dst = *src;
    }
}

/// Fields recovered from a submission frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitFrame {
    /// 15-bit work identifier.
    pub device_id: u16,
    /// Midstate in block header byte order.
    pub midstate: [u8; MIDSTATE_LEN],
    /// Data tail in block header byte order.
    pub data_tail: [u8; DATA_TAIL_LEN],
}

/// Decode a submission frame, as the device would.
///
/// Returns `None` if the buffer is too short or carries another command.
pub fn decode_submit_frame(buf: &[u8]) -> Option<SubmitFrame> {
    if buf.len() < REQUEST_FRAME_SIZE || buf[0] != RequestCommand::SubmitWork.command_byte() {
        return None;
    }
    let mut midstate = [0u8; MIDSTATE_LEN];
    let mut data_tail = [0u8; DATA_TAIL_LEN];
    for (dst, src) in midstate
        .iter_mut()
        .zip(buf[MIDSTATE_OFFSET..DATA_TAIL_FRAME_OFFSET].iter().rev())
    {
        *dst = *src;
    }
    for (dst, src) in data_tail
        .iter_mut()
        .zip(buf[DATA_TAIL_FRAME_OFFSET..REQUEST_FRAME_SIZE].iter().rev())
    {
        *dst = *src;
    }
    Some(SubmitFrame {
        device_id: u16::from_be_bytes([buf[2], buf[3]]) & DEVICE_ID_MASK,
        midstate,
        data_tail,
    })
}
