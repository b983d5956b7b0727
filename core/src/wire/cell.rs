//! Cell — fixed-size protocol unit exchanged between adjacent hops

use super::CellError;

/// Total serialized cell size (bytes)
pub const CELL_SIZE: usize = 512;

/// Header: circuit_id (4) + command (1) + stream_id (2) + length (2)
pub const CELL_HEADER_SIZE: usize = 9;

/// Maximum meaningful payload bytes carried by one cell
pub const CELL_PAYLOAD_SIZE: usize = CELL_SIZE - CELL_HEADER_SIZE;

/// Stream id reserved for circuit-level cells
pub const CIRCUIT_LEVEL_STREAM: u16 = 0;

/// Cell command enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellCommand {
    /// Stream data (0x02)
    Data = 0x02,
    /// Open a stream (0x03)
    Begin = 0x03,
    /// Close a stream (0x04)
    End = 0x04,
    /// Flow-control window credit (0x05)
    Sendme = 0x05,
    /// Opaque relay cell (0x06)
    Relay = 0x06,
    /// Circuit creation request (0x07)
    Create = 0x07,
    /// Circuit creation acknowledgement (0x08)
    Created = 0x08,
    /// Circuit teardown (0x09)
    Destroy = 0x09,
}

impl CellCommand {
    /// Convert from u8 to CellCommand
    pub fn from_u8(value: u8) -> Result<Self, CellError> {
        match value {
            0x02 => Ok(CellCommand::Data),
            0x03 => Ok(CellCommand::Begin),
            0x04 => Ok(CellCommand::End),
            0x05 => Ok(CellCommand::Sendme),
            0x06 => Ok(CellCommand::Relay),
            0x07 => Ok(CellCommand::Create),
            0x08 => Ok(CellCommand::Created),
            0x09 => Ok(CellCommand::Destroy),
            other => Err(CellError::UnknownCommand(other)),
        }
    }

    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Control cells jump the fair queue
    pub fn is_control(&self) -> bool {
        !matches!(self, CellCommand::Data | CellCommand::Relay)
    }
}

/// Fixed 512-byte cell
///
/// Format (big-endian):
/// [4 bytes] circuit_id
/// [1 byte]  command
/// [2 bytes] stream_id (0 = circuit-level)
/// [2 bytes] length of meaningful payload prefix
/// [503 bytes] payload, zero-padded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circuit_id: u32,
    pub command: CellCommand,
    pub stream_id: u16,
    /// Only `new`, `control` and `from_bytes` set it, so it always fits
    payload: Vec<u8>,
}

impl Cell {
    /// Build a cell, rejecting oversized payloads
    pub fn new(
        circuit_id: u32,
        command: CellCommand,
        stream_id: u16,
        payload: Vec<u8>,
    ) -> Result<Self, CellError> {
        if payload.len() > CELL_PAYLOAD_SIZE {
            return Err(CellError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            circuit_id,
            command,
            stream_id,
            payload,
        })
    }

    /// Control cell with an empty payload
    pub fn control(circuit_id: u32, command: CellCommand, stream_id: u16) -> Self {
        Self {
            circuit_id,
            command,
            stream_id,
            payload: Vec::new(),
        }
    }

    /// Meaningful payload, never longer than `CELL_PAYLOAD_SIZE`
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Whether this cell addresses the circuit rather than a stream
    pub fn is_circuit_level(&self) -> bool {
        self.stream_id == CIRCUIT_LEVEL_STREAM
    }

    /// Serialize to exactly `CELL_SIZE` bytes
    pub fn to_bytes(&self) -> [u8; CELL_SIZE] {
        let mut buf = [0u8; CELL_SIZE];
        let len = self.payload.len();

        buf[0..4].copy_from_slice(&self.circuit_id.to_be_bytes());
        buf[4] = self.command.as_u8();
        buf[5..7].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[7..9].copy_from_slice(&(len as u16).to_be_bytes());
        buf[CELL_HEADER_SIZE..CELL_HEADER_SIZE + len].copy_from_slice(&self.payload[..len]);

        buf
    }

    /// Deserialize from exactly `CELL_SIZE` bytes
    ///
    /// Returns error if:
    /// - Buffer is not exactly one cell
    /// - Command byte is unknown
    /// - Length field exceeds the payload area
    pub fn from_bytes(data: &[u8]) -> Result<Self, CellError> {
        if data.len() != CELL_SIZE {
            return Err(CellError::WrongSize(data.len()));
        }

        let circuit_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let command = CellCommand::from_u8(data[4])?;
        let stream_id = u16::from_be_bytes([data[5], data[6]]);
        let length = u16::from_be_bytes([data[7], data[8]]) as usize;

        if length > CELL_PAYLOAD_SIZE {
            return Err(CellError::LengthOutOfBounds(length));
        }

        Ok(Cell {
            circuit_id,
            command,
            stream_id,
            payload: data[CELL_HEADER_SIZE..CELL_HEADER_SIZE + length].to_vec(),
        })
    }
}
