//! Wire Codec — byte formats exchanged between hops
//!
//! - Cell: fixed 512-byte unit carrying control and stream data
//! - OnionEnvelope: variable-length container carrying one hop's onion blob

pub mod cell;
pub mod envelope;

pub use cell::{
    Cell, CellCommand, CELL_HEADER_SIZE, CELL_PAYLOAD_SIZE, CELL_SIZE, CIRCUIT_LEVEL_STREAM,
};
pub use envelope::{OnionEnvelope, LAYER_TAG_SIZE};

use thiserror::Error;

/// Cell framing errors (all are `MalformedCell` conditions)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CellError {
    #[error("Malformed cell: expected {SIZE} bytes, got {0}", SIZE = CELL_SIZE)]
    WrongSize(usize),

    #[error("Malformed cell: unknown command 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("Malformed cell: length {0} exceeds {MAX}", MAX = CELL_PAYLOAD_SIZE)]
    LengthOutOfBounds(usize),

    #[error("Cell payload too large: {0} bytes (max {MAX})", MAX = CELL_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),
}

/// Envelope encoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Envelope encoding failed: {0}")]
    Encoding(String),
}
