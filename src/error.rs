//! Error types for cdba.

use thiserror::Error;

/// Main error type for all cdba operations.
#[derive(Debug, Error)]
pub enum CdbaError {
    /// I/O error on the transport, a serial port or a local file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Board file missing, unreadable or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// JSON deserialization error while reading the board file.
    #[error("board file error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol violation (bad frame, out-of-sequence message, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Message kind outside the closed enumeration. Fatal for the session.
    #[error("unknown message kind {0}")]
    UnknownMessage(u16),

    /// Frame payload larger than the per-frame limit.
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    /// Receive ring exhausted without a decodable frame. The peer is
    /// misbehaving; the session terminates.
    #[error("receive ring overflow")]
    RingOverflow,

    /// Board exists but the effective user is not on its access list,
    /// or the board is not configured at all.
    #[error("board \"{board}\" is not available to user \"{user}\"")]
    NotAuthorized { board: String, user: String },

    /// Driver failure reported by a board back-end.
    #[error("device error: {0}")]
    Device(String),

    /// Serial port error from the console or a relay back-end.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Transport closed while frames were still expected.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using CdbaError.
pub type Result<T> = std::result::Result<T, CdbaError>;
