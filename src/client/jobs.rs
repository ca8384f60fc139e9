//! Outbound work queue.
//!
//! The client never writes to the transport from a message handler;
//! it appends a [`SendJob`] instead. The session loop drains the queue
//! whenever the transport accepts writes, one frame per turn, in FIFO
//! order. A job that has more to send after its turn is re-queued at the
//! tail, so a long image stream cannot starve interleaved keypresses.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{CdbaError, Result};
use crate::protocol::{Frame, MessageKind};

/// Image bytes carried per `FASTBOOT_DOWNLOAD` frame.
pub const DOWNLOAD_CHUNK: usize = 2048;

/// One frame produced by a job's turn at the head of the queue.
pub enum JobStep {
    /// Send this frame; the job is finished.
    Done(Frame),
    /// Send this frame, then re-queue the job at the tail.
    Yield(Frame),
}

/// A unit of outbound work. Each turn emits exactly one frame.
pub trait SendJob: Send {
    fn next_frame(&mut self) -> JobStep;
}

/// Single-frame job: requests, acked commands, console bytes.
pub struct FrameJob {
    frame: Option<Frame>,
}

impl FrameJob {
    /// An empty-payload request (`POWER_ON`, `LIST_DEVICES`, ...).
    pub fn request(kind: MessageKind) -> Self {
        Self {
            frame: Some(Frame::empty(kind)),
        }
    }

    /// A request carrying a payload (`SELECT_BOARD(name)`, console data).
    pub fn with_payload(kind: MessageKind, payload: Bytes) -> Self {
        Self {
            frame: Some(Frame::new(kind, payload)),
        }
    }
}

impl SendJob for FrameJob {
    fn next_frame(&mut self) -> JobStep {
        match self.frame.take() {
            Some(frame) => JobStep::Done(frame),
            // A finished job never gets another turn; hand the queue an
            // empty console frame rather than panic in release builds.
            None => {
                debug_assert!(false, "FrameJob polled after completion");
                JobStep::Done(Frame::empty(MessageKind::Console))
            }
        }
    }
}

/// Streams a boot image as `FASTBOOT_DOWNLOAD` chunks.
///
/// Each turn sends up to [`DOWNLOAD_CHUNK`] bytes from the current offset
/// and yields; after the last non-empty chunk the next turn sends the
/// empty end-of-image sentinel and completes.
pub struct ImageStream {
    data: Bytes,
    offset: usize,
}

impl ImageStream {
    pub fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }
}

impl SendJob for ImageStream {
    fn next_frame(&mut self) -> JobStep {
        let left = DOWNLOAD_CHUNK.min(self.data.len() - self.offset);
        let chunk = self.data.slice(self.offset..self.offset + left);
        self.offset += left;

        let frame = Frame::new(MessageKind::FastbootDownload, chunk);
        if left == 0 {
            JobStep::Done(frame)
        } else {
            JobStep::Yield(frame)
        }
    }
}

/// FIFO of pending sends, with the in-flight frame's resume state.
pub struct SendQueue {
    jobs: VecDeque<Box<dyn SendJob>>,
    /// Encoded frame currently on the wire; survives a cancelled drain so
    /// the next turn resumes mid-frame instead of corrupting the stream.
    pending: Vec<u8>,
    pending_off: usize,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
            pending: Vec::new(),
            pending_off: 0,
        }
    }

    /// Append a job at the tail.
    pub fn push(&mut self, job: impl SendJob + 'static) {
        self.jobs.push_back(Box::new(job));
    }

    /// Whether a drain turn would do anything.
    #[inline]
    pub fn has_work(&self) -> bool {
        !self.jobs.is_empty() || self.pending_off < self.pending.len()
    }

    /// Give the head job one turn and write its frame.
    ///
    /// Cancel safe: an interrupted write leaves the remainder in `pending`
    /// and the next call picks up at the same offset.
    pub async fn drain_one<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<()> {
        if self.pending_off >= self.pending.len() {
            let Some(mut job) = self.jobs.pop_front() else {
                return Ok(());
            };
            let frame = match job.next_frame() {
                JobStep::Done(frame) => frame,
                JobStep::Yield(frame) => {
                    self.jobs.push_back(job);
                    frame
                }
            };
            self.pending = frame.encode();
            self.pending_off = 0;
        }

        while self.pending_off < self.pending.len() {
            let n = writer.write(&self.pending[self.pending_off..]).await?;
            if n == 0 {
                return Err(CdbaError::ConnectionClosed);
            }
            self.pending_off += n;
        }
        self.pending.clear();
        self.pending_off = 0;
        writer.flush().await?;
        Ok(())
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}
