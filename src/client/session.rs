//! The client session controller.
//!
//! One [`Session`] is one end-to-end invocation against one board. It owns
//! the boot state machine, both timeouts, the power-cycle budget and the
//! outbound work queue, and runs them all on a single task: a `select!`
//! over inbound frames, timer expiry, operator keystrokes, remote
//! diagnostics and queue drains.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CdbaError, Result};
use crate::event_loop::{read_opt, LoopControl, TimerQueue};
use crate::protocol::{Frame, FrameReader, MessageKind};

use super::console::{EscapeAction, EscapeParser, OperatorInput, PowerOffDetector};
use super::jobs::{FrameJob, ImageStream, SendQueue};

/// Settle delay between the power-off of an automatic cycle and the
/// follow-up power-on.
const POWER_CYCLE_SETTLE: Duration = Duration::from_secs(2);

/// What the operator asked this session to do.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Select a board, power it, flash the image, watch the console.
    Boot {
        board: String,
        image: PathBuf,
        /// Re-send the image on every re-entry into flashing mode.
        repeat: bool,
    },
    /// Print the boards the user may access, one per line.
    List,
    /// Print one board's human-readable details.
    Info { board: String },
}

/// Knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: Mode,
    /// Upper bound on the whole session; never extended.
    pub timeout_total: Duration,
    /// Re-armed whenever an inbound message is processed. `None` disables.
    pub timeout_inactivity: Option<Duration>,
    /// Remaining automatic power cycles.
    pub power_cycles: u32,
    /// Whether a timeout (as opposed to a graceful power-off) may spend
    /// the cycle budget.
    pub cycle_on_timeout: bool,
}

impl SessionConfig {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            timeout_total: Duration::from_secs(600),
            timeout_inactivity: None,
            power_cycles: 0,
            cycle_on_timeout: true,
        }
    }
}

/// How a session ended. Maps onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Operator quit, list/info completed, or graceful in-band power-off.
    Clean,
    /// The transport dropped without a success signal.
    Dropped,
    /// A timeout spent the retry budget.
    TimedOut {
        /// Whether an image had been flashed before the timeout.
        flashed: bool,
    },
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Clean => 0,
            Outcome::Dropped => 1,
            Outcome::TimedOut { flashed: false } => 2,
            Outcome::TimedOut { flashed: true } => 110,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKey {
    Total,
    Inactivity,
    PowerOnSettle,
}

enum Event {
    Frame(Option<Frame>),
    Timer(TimerKey),
    Operator(Vec<u8>),
    RemoteErr(Vec<u8>),
    Drained,
}

/// A running client session over a framed transport.
pub struct Session<R, W> {
    cfg: SessionConfig,
    frames: FrameReader<R>,
    transport: W,
    operator: Option<Box<dyn AsyncRead + Unpin + Send>>,
    remote_stderr: Option<Box<dyn AsyncRead + Unpin + Send>>,
    queue: SendQueue,
    timers: TimerQueue<TimerKey>,
    escape: EscapeParser,
    marker: PowerOffDetector,
    /// Boot image, loaded on first entry into flashing mode and reused
    /// when the repeat flag re-streams it.
    image: Option<Bytes>,
    flashed: bool,
    power_off_seen: bool,
    timed_out: bool,
    auto_power_on: bool,
    cycles_left: u32,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a session over the transport's read and write halves.
    pub fn new(cfg: SessionConfig, rx: R, tx: W) -> Self {
        let cycles_left = cfg.power_cycles;
        Self {
            cfg,
            frames: FrameReader::new(rx),
            transport: tx,
            operator: None,
            remote_stderr: None,
            queue: SendQueue::new(),
            timers: TimerQueue::new(),
            escape: EscapeParser::new(),
            marker: PowerOffDetector::new(),
            image: None,
            flashed: false,
            power_off_seen: false,
            timed_out: false,
            auto_power_on: false,
            cycles_left,
        }
    }

    /// Forward keystrokes from this stream as console data and escapes.
    pub fn with_operator_input(mut self, input: impl AsyncRead + Unpin + Send + 'static) -> Self {
        self.operator = Some(Box::new(input));
        self
    }

    /// Surface the remote side's diagnostic stream on local stderr.
    pub fn with_remote_stderr(mut self, stderr: impl AsyncRead + Unpin + Send + 'static) -> Self {
        self.remote_stderr = Some(Box::new(stderr));
        self
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> Result<Outcome> {
        self.start()?;

        loop {
            if self.power_off_seen || self.timed_out {
                if let Some(outcome) = self.power_cycle_or_stop() {
                    return Ok(outcome);
                }
            }

            let mut op_buf = [0u8; 64];
            let mut err_buf = [0u8; 512];
            let event = {
                let frames = &mut self.frames;
                let timers = &mut self.timers;
                let queue = &mut self.queue;
                let transport = &mut self.transport;
                let operator = self.operator.as_deref_mut();
                let remote_stderr = self.remote_stderr.as_deref_mut();

                tokio::select! {
                    frame = frames.next_frame() => Event::Frame(frame?),
                    key = timers.expired() => Event::Timer(key),
                    n = read_opt(operator, &mut op_buf) => Event::Operator(op_buf[..n?].to_vec()),
                    n = read_opt(remote_stderr, &mut err_buf) => Event::RemoteErr(err_buf[..n?].to_vec()),
                    res = queue.drain_one(transport), if queue.has_work() => {
                        res?;
                        Event::Drained
                    }
                }
            };

            match event {
                Event::Frame(Some(frame)) => {
                    let control = self.handle_message(frame).await?;
                    self.touch_inactivity();
                    if control == LoopControl::Quit {
                        return Ok(Outcome::Clean);
                    }
                }
                Event::Frame(None) => {
                    warn!("remote closed the transport");
                    return Ok(Outcome::Dropped);
                }
                Event::Timer(key) => self.handle_timer(key),
                Event::Operator(data) if data.is_empty() => {
                    // Operator input gone; keep the session alive on the
                    // transport alone.
                    self.operator = None;
                }
                Event::Operator(data) => {
                    if self.handle_operator(&data) == LoopControl::Quit {
                        return Ok(Outcome::Clean);
                    }
                }
                Event::RemoteErr(data) if data.is_empty() => {
                    warn!("EOF on remote stderr");
                    return Ok(Outcome::Dropped);
                }
                Event::RemoteErr(data) => forward_remote_stderr(&data),
                Event::Drained => {}
            }
        }
    }

    /// Validate inputs, queue the opening request and arm the deadlines.
    fn start(&mut self) -> Result<()> {
        match &self.cfg.mode {
            Mode::Boot { board, image, .. } => {
                validate_image(image)?;
                self.queue.push(FrameJob::with_payload(
                    MessageKind::SelectBoard,
                    Bytes::from(board.clone().into_bytes()),
                ));
            }
            Mode::List => {
                self.queue.push(FrameJob::request(MessageKind::ListDevices));
            }
            Mode::Info { board } => {
                self.queue.push(FrameJob::with_payload(
                    MessageKind::BoardInfo,
                    Bytes::from(board.clone().into_bytes()),
                ));
            }
        }

        self.timers
            .arm(TimerKey::Total, Instant::now() + self.cfg.timeout_total);
        self.touch_inactivity();
        Ok(())
    }

    /// Retry gate at the top of the loop: consume a power-off or timeout
    /// trigger, either by spending one power cycle or by ending the
    /// session.
    fn power_cycle_or_stop(&mut self) -> Option<Outcome> {
        let stop = self.cycles_left == 0 || (self.timed_out && !self.cfg.cycle_on_timeout);
        if stop {
            return Some(if self.timed_out {
                Outcome::TimedOut {
                    flashed: self.flashed,
                }
            } else {
                Outcome::Clean
            });
        }

        println!("power cycle ({} left)", self.cycles_left);
        self.cycles_left -= 1;
        self.auto_power_on = true;
        self.power_off_seen = false;
        self.timed_out = false;
        self.queue.push(FrameJob::request(MessageKind::PowerOff));
        self.touch_inactivity();
        None
    }

    async fn handle_message(&mut self, frame: Frame) -> Result<LoopControl> {
        match frame.kind() {
            MessageKind::SelectBoard => {
                // Selection acknowledged; the server drives power from here.
                debug!("board selected");
            }
            MessageKind::Console => {
                let mut out = std::io::stdout().lock();
                out.write_all(frame.payload())?;
                out.flush()?;
                if self.marker.feed(frame.payload()) {
                    self.power_off_seen = true;
                }
            }
            MessageKind::PowerOn => debug!("power on acknowledged"),
            MessageKind::PowerOff => {
                debug!("power off acknowledged");
                if self.auto_power_on {
                    self.timers
                        .arm(TimerKey::PowerOnSettle, Instant::now() + POWER_CYCLE_SETTLE);
                }
            }
            MessageKind::FastbootPresent => {
                if frame.payload().first() == Some(&1) {
                    let repeat = matches!(self.cfg.mode, Mode::Boot { repeat: true, .. });
                    if !self.flashed || repeat {
                        self.start_image_stream().await?;
                    } else {
                        // Flashed and back in fastboot: the boot attempt
                        // succeeded.
                        return Ok(LoopControl::Quit);
                    }
                } else {
                    self.flashed = true;
                }
            }
            MessageKind::FastbootDownload => debug!("flash acknowledged"),
            MessageKind::HardReset | MessageKind::FastbootBoot => {
                debug!(kind = ?frame.kind(), "ignored");
            }
            MessageKind::StatusUpdate => print_line(frame.payload()),
            MessageKind::ListDevices => {
                if frame.payload().is_empty() {
                    return Ok(LoopControl::Quit);
                }
                print_line(frame.payload());
            }
            MessageKind::BoardInfo => {
                print_line(frame.payload());
                return Ok(LoopControl::Quit);
            }
            kind @ (MessageKind::VbusOn
            | MessageKind::VbusOff
            | MessageKind::SendBreak
            | MessageKind::FastbootContinue) => {
                return Err(CdbaError::Protocol(format!(
                    "unexpected {kind:?} from the server"
                )));
            }
        }
        Ok(LoopControl::Continue)
    }

    fn handle_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Total => {
                warn!("timeout reached");
                self.timed_out = true;
            }
            TimerKey::Inactivity => {
                warn!("timeout due to inactivity");
                self.timed_out = true;
            }
            TimerKey::PowerOnSettle => {
                self.queue.push(FrameJob::request(MessageKind::PowerOn));
            }
        }
    }

    fn handle_operator(&mut self, data: &[u8]) -> LoopControl {
        for &byte in data {
            let Some(input) = self.escape.feed(byte) else {
                continue;
            };
            let kind = match input {
                OperatorInput::Console(b) => {
                    self.queue.push(FrameJob::with_payload(
                        MessageKind::Console,
                        Bytes::copy_from_slice(&[b]),
                    ));
                    continue;
                }
                OperatorInput::Action(EscapeAction::Quit) => return LoopControl::Quit,
                OperatorInput::Action(EscapeAction::PowerOn) => MessageKind::PowerOn,
                OperatorInput::Action(EscapeAction::PowerOff) => MessageKind::PowerOff,
                OperatorInput::Action(EscapeAction::Status) => MessageKind::StatusUpdate,
                OperatorInput::Action(EscapeAction::VbusOn) => MessageKind::VbusOn,
                OperatorInput::Action(EscapeAction::VbusOff) => MessageKind::VbusOff,
                OperatorInput::Action(EscapeAction::SendBreak) => MessageKind::SendBreak,
            };
            self.queue.push(FrameJob::request(kind));
        }
        LoopControl::Continue
    }

    async fn start_image_stream(&mut self) -> Result<()> {
        let data = match &self.image {
            Some(data) => data.clone(),
            None => {
                let Mode::Boot { image, .. } = &self.cfg.mode else {
                    return Err(CdbaError::Protocol(
                        "flashing mode reported outside a boot session".into(),
                    ));
                };
                let data = Bytes::from(tokio::fs::read(image).await?);
                self.image = Some(data.clone());
                data
            }
        };
        self.queue.push(ImageStream::new(data));
        Ok(())
    }

    fn touch_inactivity(&mut self) {
        if let Some(interval) = self.cfg.timeout_inactivity {
            self.timers
                .arm(TimerKey::Inactivity, Instant::now() + interval);
        }
    }
}

/// The boot image must be a regular file (or a symlink to one).
fn validate_image(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|err| CdbaError::Config(format!("unable to read \"{}\": {err}", path.display())))?;
    if !meta.is_file() {
        return Err(CdbaError::Config(format!(
            "\"{}\" is not a regular file",
            path.display()
        )));
    }
    Ok(())
}

fn print_line(payload: &[u8]) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(payload);
    let _ = out.write_all(b"\n");
    let _ = out.flush();
}

/// Remote diagnostics show up in blue so they cannot be confused with
/// local output.
fn forward_remote_stderr(data: &[u8]) {
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(b"\x1b[94m");
    let _ = err.write_all(data);
    let _ = err.write_all(b"\x1b[0m");
    let _ = err.flush();
}
