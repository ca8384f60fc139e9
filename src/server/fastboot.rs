//! Flashing-mode detection and image accumulation.
//!
//! The monitor watches for the target's fastboot device node appearing or
//! vanishing, standing in for the USB enumeration event the concrete
//! engine would deliver. The download buffer collects streamed image
//! chunks until the empty end-of-image sentinel arrives.

use std::path::PathBuf;
use std::time::Duration;

/// Presence change of the flashing-mode target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastbootEvent {
    /// The target entered flashing mode.
    Opened,
    /// The target left flashing mode.
    Disconnected,
}

/// Polls for the fastboot device node and reports presence edges.
pub struct FastbootMonitor {
    node: PathBuf,
    period: Duration,
    present: bool,
}

impl FastbootMonitor {
    pub fn new(node: PathBuf, period: Duration) -> Self {
        Self {
            node,
            period,
            present: false,
        }
    }

    /// The next presence change. Cancel safe; only the edge is consumed.
    pub async fn next_event(&mut self) -> FastbootEvent {
        loop {
            tokio::time::sleep(self.period).await;
            let present = self.node.exists();
            if present != self.present {
                self.present = present;
                return if present {
                    FastbootEvent::Opened
                } else {
                    FastbootEvent::Disconnected
                };
            }
        }
    }
}

/// Accumulates streamed `FASTBOOT_DOWNLOAD` chunks between the flashing
/// target opening and the end-of-image sentinel.
#[derive(Debug, Default)]
pub struct DownloadBuffer {
    data: Vec<u8>,
}

impl DownloadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Hand the complete image over, leaving the buffer ready for a
    /// repeat download.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_accumulates_and_resets() {
        let mut buf = DownloadBuffer::new();
        buf.push(&[1, 2, 3]);
        buf.push(&[4, 5]);
        assert_eq!(buf.len(), 5);

        let image = buf.take();
        assert_eq!(image, [1, 2, 3, 4, 5]);
        assert!(buf.is_empty());

        // A repeat download starts clean.
        buf.push(&[9]);
        assert_eq!(buf.take(), [9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_presence_edges() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("fastboot-dev");
        let mut monitor = FastbootMonitor::new(node.clone(), Duration::from_millis(100));

        std::fs::write(&node, b"").unwrap();
        assert_eq!(monitor.next_event().await, FastbootEvent::Opened);

        std::fs::remove_file(&node).unwrap();
        assert_eq!(monitor.next_event().await, FastbootEvent::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_silent_without_edges() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("absent");
        let mut monitor = FastbootMonitor::new(node, Duration::from_millis(100));

        let wait = tokio::time::timeout(Duration::from_secs(5), monitor.next_event());
        assert!(wait.await.is_err());
    }
}
