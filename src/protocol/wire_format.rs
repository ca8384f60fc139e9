//! Wire format encoding and decoding.
//!
//! Every message on the transport is a 4-byte header followed by the payload:
//!
//! ```text
//! ┌──────────┬──────────┐
//! │ Kind     │ Length   │
//! │ 2 bytes  │ 2 bytes  │ payload[0..len]
//! │ u16 LE   │ u16 LE   │
//! └──────────┴──────────┘
//! ```
//!
//! Integers are Little Endian, fixed on the wire so that client and server
//! architectures need not match.

use crate::error::{CdbaError, Result};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Maximum payload per frame. Senders chunk larger payloads into multiple
/// frames; a header claiming more than this is a protocol violation.
pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024;

/// The closed set of message kinds.
///
/// Numeric codes are part of the wire protocol and stable across versions.
/// A kind outside this enumeration is fatal for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    /// Bind the session to a named board. First and only per session.
    SelectBoard = 0,
    /// Console bytes, in either direction.
    Console = 1,
    /// Reserved; accepted and ignored.
    HardReset = 2,
    /// Power-on request, acknowledged with the same kind.
    PowerOn = 3,
    /// Power-off request, acknowledged with the same kind.
    PowerOff = 4,
    /// Payload byte 1: target entered flashing mode; 0: it left.
    FastbootPresent = 5,
    /// One image chunk; empty payload is the end-of-image sentinel and,
    /// from the server, the flash-completed acknowledgement.
    FastbootDownload = 6,
    /// Reserved; accepted and ignored.
    FastbootBoot = 7,
    /// Ask the flasher to let the target continue booting.
    FastbootContinue = 8,
    /// One line of board status telemetry.
    StatusUpdate = 9,
    /// Switch USB VBUS on.
    VbusOn = 10,
    /// Switch USB VBUS off.
    VbusOff = 11,
    /// Assert a break condition on the console UART.
    SendBreak = 12,
    /// One board name per frame; empty frame terminates the list.
    ListDevices = 13,
    /// Human-readable description of one board.
    BoardInfo = 14,
}

impl MessageKind {
    /// Map a raw wire code back to a kind.
    pub fn from_wire(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => Self::SelectBoard,
            1 => Self::Console,
            2 => Self::HardReset,
            3 => Self::PowerOn,
            4 => Self::PowerOff,
            5 => Self::FastbootPresent,
            6 => Self::FastbootDownload,
            7 => Self::FastbootBoot,
            8 => Self::FastbootContinue,
            9 => Self::StatusUpdate,
            10 => Self::VbusOn,
            11 => Self::VbusOff,
            12 => Self::SendBreak,
            13 => Self::ListDevices,
            14 => Self::BoardInfo,
            _ => return None,
        })
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message kind.
    pub kind: MessageKind,
    /// Payload length in bytes.
    pub len: u16,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: MessageKind, len: u16) -> Self {
        Self { kind, len }
    }

    /// Encode header to bytes (Little Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&(self.kind as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Decode a header from exactly [`HEADER_SIZE`] bytes.
    ///
    /// Fails on an unknown kind or a payload length above
    /// [`MAX_PAYLOAD_SIZE`]; both are unrecoverable for the session.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let raw_kind = u16::from_le_bytes([buf[0], buf[1]]);
        let len = u16::from_le_bytes([buf[2], buf[3]]);

        let kind = MessageKind::from_wire(raw_kind).ok_or(CdbaError::UnknownMessage(raw_kind))?;

        if len as usize > MAX_PAYLOAD_SIZE {
            return Err(CdbaError::PayloadTooLarge(len as usize));
        }

        Ok(Self { kind, len })
    }
}
