//! Decode loop over an async byte stream.
//!
//! [`FrameReader`] owns the receive ring and turns raw reads into complete
//! frames: while at least a header is buffered, peek it; stop on a partial
//! frame; otherwise consume header plus payload and hand the frame out.
//! A zero-byte read is EOF, which ends the session.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{CdbaError, Result};

use super::ring::RingBuffer;
use super::wire_format::{Header, HEADER_SIZE};
use super::Frame;

/// Reads complete frames from an async byte stream via the receive ring.
pub struct FrameReader<R> {
    reader: R,
    ring: RingBuffer,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a byte stream with a default-capacity ring.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            ring: RingBuffer::new(),
        }
    }

    /// Next complete frame, or `None` on clean EOF.
    ///
    /// Cancel safe: a partial frame stays buffered in the ring and decoding
    /// resumes on the next call.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.try_decode()? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; 4096];
            let room = self.ring.free().min(chunk.len());
            if room == 0 {
                // Full ring without a decodable frame: the peer is
                // misbehaving or the capacity is too small.
                return Err(CdbaError::RingOverflow);
            }

            let n = self.reader.read(&mut chunk[..room]).await?;
            if n == 0 {
                if self.ring.available() > 0 {
                    return Err(CdbaError::ConnectionClosed);
                }
                return Ok(None);
            }
            self.ring.push(&chunk[..n])?;
        }
    }

    fn try_decode(&mut self) -> Result<Option<Frame>> {
        let mut hdr = [0u8; HEADER_SIZE];
        if !self.ring.peek(&mut hdr) {
            return Ok(None);
        }

        let header = Header::decode(&hdr)?;
        if self.ring.available() < HEADER_SIZE + header.len as usize {
            return Ok(None);
        }

        self.ring.skip(HEADER_SIZE);
        let mut payload = vec![0u8; header.len as usize];
        let complete = self.ring.read(&mut payload);
        debug_assert!(complete, "length was checked above");

        Ok(Some(Frame {
            header,
            payload: Bytes::from(payload),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use tokio::io::AsyncWriteExt;

    fn frames_fixture() -> (Vec<u8>, Vec<(MessageKind, Vec<u8>)>) {
        let msgs = vec![
            (MessageKind::SelectBoard, b"boardA\0".to_vec()),
            (MessageKind::Console, b"~~~ booting ~~~".to_vec()),
            (MessageKind::PowerOn, Vec::new()),
            (MessageKind::FastbootDownload, vec![0xAB; 2048]),
            (MessageKind::FastbootDownload, Vec::new()),
        ];
        let mut wire = Vec::new();
        for (kind, payload) in &msgs {
            wire.extend_from_slice(&Frame::from_slice(*kind, payload).encode());
        }
        (wire, msgs)
    }

    #[tokio::test]
    async fn test_roundtrip_single_write() {
        let (wire, msgs) = frames_fixture();
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&wire).await.unwrap();
        drop(tx);

        let mut reader = FrameReader::new(rx);
        for (kind, payload) in &msgs {
            let frame = reader.next_frame().await.unwrap().unwrap();
            assert_eq!(frame.kind(), *kind);
            assert_eq!(frame.payload(), &payload[..]);
        }
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_roundtrip_arbitrary_split_boundaries() {
        let (wire, msgs) = frames_fixture();

        // Split the stream at a handful of awkward chunk sizes, including
        // byte-at-a-time across a header.
        for chunk_size in [1usize, 3, HEADER_SIZE, 7, 100, 2047] {
            let (mut tx, rx) = tokio::io::duplex(64 * 1024);
            let wire = wire.clone();
            let writer = tokio::spawn(async move {
                for chunk in wire.chunks(chunk_size) {
                    tx.write_all(chunk).await.unwrap();
                }
            });

            let mut reader = FrameReader::new(rx);
            for (kind, payload) in &msgs {
                let frame = reader.next_frame().await.unwrap().unwrap();
                assert_eq!(frame.kind(), *kind, "chunk size {chunk_size}");
                assert_eq!(frame.payload(), &payload[..]);
            }
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_is_fatal() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(&[0xFF, 0xFF, 0, 0]).await.unwrap();

        let mut reader = FrameReader::new(rx);
        let result = reader.next_frame().await;
        assert!(matches!(result, Err(CdbaError::UnknownMessage(0xFFFF))));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_an_error() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let full = Frame::from_slice(MessageKind::Console, b"truncated").encode();
        tx.write_all(&full[..full.len() - 2]).await.unwrap();
        drop(tx);

        let mut reader = FrameReader::new(rx);
        let result = reader.next_frame().await;
        assert!(matches!(result, Err(CdbaError::ConnectionClosed)));
    }
}
