//! Protocol module - wire format and transaction buffers.
//!
//! This module implements the binary protocol spoken with the board:
//! - Request frames (submit work, flush queue) and their byte layout
//! - Outgoing transaction buffer with fixed-size padding
//! - Transaction header and reply record decoding

mod reply;
mod request;
mod wire_format;

pub use reply::{RawRecord, Reply, ReplyBuilder, ReplyRecords};
pub use request::{clean_flush_request, RequestBuffer};
pub use wire_format::{
    decode_submit_frame, encode_submit_frame, ReplyKind, ReplyRecord, RequestCommand,
    SubmitFrame, TransactionHeader, DEFAULT_BUFFER_SIZE, DEVICE_ID_MASK, NOP_BYTE,
    REPLY_RECORD_SIZE, REQUEST_FRAME_SIZE, TRANSACTION_HEADER_SIZE,
};
