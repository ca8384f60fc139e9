//! The operator-side half of cdba.
//!
//! A session launches the server over ssh, reuses the child's stdio as
//! the framed transport and drives one boot attempt (or a list/info
//! query) against the selected board.

mod console;
mod jobs;
mod remote;
mod session;

pub use console::{
    EscapeAction, EscapeParser, OperatorInput, PowerOffDetector, RawGuard, POWER_OFF_MARKER_LEN,
};
pub use jobs::{FrameJob, ImageStream, JobStep, SendJob, SendQueue, DOWNLOAD_CHUNK};
pub use remote::RemoteTransport;
pub use session::{Mode, Outcome, Session, SessionConfig};
