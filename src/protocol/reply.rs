//! Incoming transaction buffer.
//!
//! A reply is the transaction header followed by as many 12-byte records
//! as fit in the remaining space. Iteration stops when less than one full
//! record remains.

use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{
    ReplyKind, ReplyRecord, TransactionHeader, REPLY_RECORD_SIZE, TRANSACTION_HEADER_SIZE,
};

/// A decoded view over one reply buffer.
#[derive(Debug, Clone, Copy)]
pub struct Reply<'a> {
    /// Transaction header.
    pub header: TransactionHeader,
    /// Record area after the header.
    body: &'a [u8],
}

impl<'a> Reply<'a> {
    /// Parse a reply buffer.
    ///
    /// Returns `None` if the buffer cannot hold a transaction header.
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        let header = TransactionHeader::decode(buf)?;
        Some(Self {
            header,
            body: &buf[TRANSACTION_HEADER_SIZE..],
        })
    }

    /// Iterate over every record slot, empty ones included.
    pub fn records(&self) -> ReplyRecords<'a> {
        ReplyRecords {
            chunks: self.body.chunks_exact(REPLY_RECORD_SIZE),
        }
    }
}

/// One record together with its raw bytes.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord<'a> {
    /// Decoded fields.
    pub record: ReplyRecord,
    /// The 12 bytes the record was decoded from.
    pub bytes: &'a [u8],
}

impl RawRecord<'_> {
    /// Lower-case hex dump of the raw record.
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(self.bytes.len() * 2);
        for b in self.bytes {
            let _ = write!(out, "{b:02x}");
        }
        out
    }
}

/// Iterator over reply records.
#[derive(Debug, Clone)]
pub struct ReplyRecords<'a> {
    chunks: std::slice::ChunksExact<'a, u8>,
}

impl<'a> Iterator for ReplyRecords<'a> {
    type Item = RawRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.chunks.next()?;
        let record = ReplyRecord::decode(bytes)?;
        Some(RawRecord { record, bytes })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

/// Builds reply buffers the way the device lays them out.
///
/// Used by test transports to script device behaviour.
///
/// # Example
///
/// ```
/// use knc_dispatch::protocol::{Reply, ReplyBuilder, ReplyKind};
///
/// let bytes = ReplyBuilder::new(0x1000)
///     .accepted(2)
///     .work_done(0, 3, 17)
///     .build();
/// let reply = Reply::parse(&bytes).unwrap();
/// assert_eq!(reply.header.accepted, 2);
/// let first = reply.records().next().unwrap();
/// assert_eq!(first.record.kind, ReplyKind::WorkDone);
/// ```
#[derive(Debug, Clone)]
pub struct ReplyBuilder {
    size: usize,
    header: TransactionHeader,
    records: Vec<ReplyRecord>,
}

impl ReplyBuilder {
    /// Start an empty reply of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            header: TransactionHeader {
                overflow: false,
                accepted: 0,
            },
            records: Vec::new(),
        }
    }

    /// Set the accepted count.
    pub fn accepted(mut self, accepted: u16) -> Self {
        self.header.accepted = accepted;
        self
    }

    /// Set the overflow flag.
    pub fn overflow(mut self) -> Self {
        self.header.overflow = true;
        self
    }

    /// Append an arbitrary record.
    pub fn record(mut self, record: ReplyRecord) -> Self {
        self.records.push(record);
        self
    }

    /// Append a nonce found record.
    pub fn nonce_found(self, chip: u8, core: u32, device_id: u16, nonce: u32) -> Self {
        self.record(ReplyRecord {
            kind: ReplyKind::NonceFound,
            chip,
            device_id,
            nonce,
            core,
        })
    }

    /// Append a work done record.
    pub fn work_done(self, chip: u8, core: u32, device_id: u16) -> Self {
        self.record(ReplyRecord {
            kind: ReplyKind::WorkDone,
            chip,
            device_id,
            nonce: 0,
            core,
        })
    }

    /// Encode the reply, zero filling unused space.
    ///
    /// Records that do not fit in the buffer are dropped.
    pub fn build(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size);
        let header = self.header.encode();
        buf.put_slice(&header[..self.size.min(TRANSACTION_HEADER_SIZE)]);
        for record in &self.records {
            if self.size - buf.len() < REPLY_RECORD_SIZE {
                break;
            }
            buf.put_slice(&record.encode());
        }
        let pad = self.size - buf.len();
        buf.put_bytes(0, pad);
        buf.freeze()
    }
}
