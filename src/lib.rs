//! # cdba
//!
//! Remote control of development boards for embedded development and CI.
//!
//! An operator's workstation runs the `cdba` client, which launches
//! `cdba-server` on the host the hardware is attached to (over ssh) and
//! reuses the child's stdin/stdout as a framed, bidirectional message
//! channel. Through it the operator drives board power, the serial
//! console, USB VBUS and fastboot flashing, and watches the boot.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): 4-byte header frames over a byte pipe,
//!   reassembled through a fixed-capacity ring buffer.
//! - **Event loops** ([`event_loop`]): both processes are single-threaded
//!   cooperative loops; timers are explicit deadline queues and no
//!   handler blocks.
//! - **Client** ([`client`]): the session controller — boot state
//!   machine, timeouts, power-cycle retries, operator escapes.
//! - **Server** ([`server`]): board registry with per-user access
//!   control, the device abstraction over interchangeable back-ends, and
//!   the flashing adapter.

pub mod client;
pub mod error;
pub mod event_loop;
pub mod protocol;
pub mod server;

pub use error::{CdbaError, Result};
