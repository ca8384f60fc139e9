//! The framed control channel shared by client and server.
//!
//! This module implements the binary protocol carried over the transport:
//! - 4-byte header encoding/decoding and the closed message enumeration
//! - fixed-capacity ring buffer for reassembling frames from stream reads
//! - [`FrameReader`] driving the decode loop over an async byte stream
//! - [`Frame`] with typed accessors

mod codec;
mod frame;
mod ring;
mod wire_format;

pub use codec::FrameReader;
pub use frame::Frame;
pub use ring::{RingBuffer, RING_CAPACITY};
pub use wire_format::{Header, MessageKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};
