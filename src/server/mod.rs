//! The board-side half of cdba.
//!
//! Runs on the host the hardware is attached to, spawned by the client
//! over ssh. Stdin/stdout carry the framed channel; stderr carries
//! diagnostics back to the operator.

mod device;
mod dispatcher;
mod fastboot;
mod registry;

pub use device::{ControlBackend, Device, Flasher, RelayBackend, StubBackend};
pub use dispatcher::Server;
pub use fastboot::{DownloadBuffer, FastbootEvent, FastbootMonitor};
pub use registry::{
    effective_user, BoardConfig, ConsoleConfig, ControlConfig, FastbootConfig, Registry,
    CONFIG_PATHS,
};
