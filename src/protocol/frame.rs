//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.

use bytes::Bytes;

use super::wire_format::{Header, MessageKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from a kind and payload.
    ///
    /// The payload must fit in a single frame; senders chunk anything
    /// larger before reaching this point.
    pub fn new(kind: MessageKind, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        Self {
            header: Header::new(kind, payload.len() as u16),
            payload,
        }
    }

    /// Create a frame with an empty payload (requests, acks, sentinels).
    pub fn empty(kind: MessageKind) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Create a frame copying the given payload bytes.
    pub fn from_slice(kind: MessageKind, payload: &[u8]) -> Self {
        Self::new(kind, Bytes::copy_from_slice(payload))
    }

    /// Get the message kind.
    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encode the whole frame (header then payload) into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::from_slice(MessageKind::Console, b"hello");

        assert_eq!(frame.kind(), MessageKind::Console);
        assert_eq!(frame.header.len, 5);
        assert_eq!(frame.payload(), b"hello");
    }

    #[test]
    fn test_empty_frame() {
        let frame = Frame::empty(MessageKind::PowerOn);

        assert_eq!(frame.kind(), MessageKind::PowerOn);
        assert_eq!(frame.header.len, 0);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::from_slice(MessageKind::StatusUpdate, b"ok");
        let bytes = frame.encode();

        assert_eq!(bytes.len(), HEADER_SIZE + 2);
        assert_eq!(&bytes[..2], &(MessageKind::StatusUpdate as u16).to_le_bytes());
        assert_eq!(&bytes[2..4], &2u16.to_le_bytes());
        assert_eq!(&bytes[HEADER_SIZE..], b"ok");
    }

    #[test]
    fn test_encode_empty_payload() {
        let bytes = Frame::empty(MessageKind::ListDevices).encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
    }
}
