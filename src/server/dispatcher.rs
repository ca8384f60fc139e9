//! The request dispatcher: the server's half of the session.
//!
//! Decodes inbound frames from the transport (the process's stdin),
//! routes each to the registry or the selected device, and writes replies
//! to stdout. Stdout is a pure framed channel; every diagnostic line goes
//! to stderr via `tracing`.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CdbaError, Result};
use crate::event_loop::{read_opt, TimerQueue};
use crate::protocol::{Frame, FrameReader, MessageKind};

use super::device::Device;
use super::fastboot::{DownloadBuffer, FastbootEvent, FastbootMonitor};
use super::registry::Registry;

/// How long a requested break condition is held on the console UART.
const BREAK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ServerTimer {
    BreakRelease,
}

enum ServerEvent {
    Inbound(Option<Frame>),
    Fastboot(FastbootEvent),
    Console(Vec<u8>),
    FlashDone(Result<()>),
    Timer(ServerTimer),
}

/// One server session: at most one selected device, driven by a single
/// task selecting over the transport, the console, the flashing monitor
/// and timers.
pub struct Server<R, W> {
    registry: Registry,
    frames: FrameReader<R>,
    transport: W,
    device: Option<Device>,
    monitor: Option<FastbootMonitor>,
    download: DownloadBuffer,
    flash_task: Option<JoinHandle<Result<()>>>,
    timers: TimerQueue<ServerTimer>,
}

impl<R, W> Server<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(registry: Registry, rx: R, tx: W) -> Self {
        Self {
            registry,
            frames: FrameReader::new(rx),
            transport: tx,
            device: None,
            monitor: None,
            download: DownloadBuffer::new(),
            flash_task: None,
            timers: TimerQueue::new(),
        }
    }

    /// Serve until the client disconnects or a fatal error, then tear the
    /// device down (which powers the board off when its policy says so).
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        if let Some(device) = self.device.as_mut() {
            device.close();
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let mut console_buf = [0u8; 2048];
            let event = {
                let frames = &mut self.frames;
                let timers = &mut self.timers;
                let monitor = self.monitor.as_mut();
                let console = self.device.as_mut().and_then(|d| d.console_mut());
                let flash = self.flash_task.as_mut();

                tokio::select! {
                    frame = frames.next_frame() => ServerEvent::Inbound(frame?),
                    event = monitor_event(monitor) => ServerEvent::Fastboot(event),
                    n = read_opt(console, &mut console_buf) => match n {
                        Ok(n) => ServerEvent::Console(console_buf[..n].to_vec()),
                        Err(err) => {
                            warn!("console read failed: {err}");
                            ServerEvent::Console(Vec::new())
                        }
                    },
                    res = flash_result(flash) => ServerEvent::FlashDone(res),
                    key = timers.expired() => ServerEvent::Timer(key),
                }
            };

            match event {
                ServerEvent::Inbound(Some(frame)) => self.dispatch(frame).await?,
                ServerEvent::Inbound(None) => {
                    debug!("client disconnected");
                    return Ok(());
                }
                ServerEvent::Fastboot(FastbootEvent::Opened) => {
                    self.send(Frame::new(
                        MessageKind::FastbootPresent,
                        Bytes::from_static(&[1]),
                    ))
                    .await?;
                    // The target reached flashing mode; stop forcing it
                    // there.
                    if let Some(device) = self.device.as_mut() {
                        if let Err(err) = device.hold_fastboot_key(false) {
                            warn!("failed to release fastboot key: {err}");
                        }
                    }
                }
                ServerEvent::Fastboot(FastbootEvent::Disconnected) => {
                    self.send(Frame::new(
                        MessageKind::FastbootPresent,
                        Bytes::from_static(&[0]),
                    ))
                    .await?;
                }
                ServerEvent::Console(data) if data.is_empty() => {
                    warn!("console went away");
                    if let Some(device) = self.device.as_mut() {
                        device.drop_console();
                    }
                }
                ServerEvent::Console(data) => {
                    self.send(Frame::new(MessageKind::Console, Bytes::from(data)))
                        .await?;
                }
                ServerEvent::FlashDone(result) => {
                    self.flash_task = None;
                    match result {
                        Ok(()) => {
                            self.send(Frame::empty(MessageKind::FastbootDownload))
                                .await?;
                        }
                        Err(err) => warn!("flashing failed: {err}"),
                    }
                }
                ServerEvent::Timer(ServerTimer::BreakRelease) => {
                    if let Some(device) = self.device.as_mut() {
                        if let Err(err) = device.release_break() {
                            warn!("failed to release break: {err}");
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<()> {
        match frame.kind() {
            MessageKind::SelectBoard => self.select_board(&frame).await?,
            MessageKind::Console => match self.device.as_mut() {
                Some(device) => {
                    if let Err(err) = device.write_console(frame.payload()).await {
                        warn!("console write failed: {err}");
                    }
                }
                None => warn!("console data before board selection"),
            },
            MessageKind::PowerOn => self.drive_power(true).await?,
            MessageKind::PowerOff => self.drive_power(false).await?,
            MessageKind::FastbootDownload => {
                if frame.payload().is_empty() {
                    let image = self.download.take();
                    debug!(bytes = image.len(), "image download complete");
                    match self.device.as_ref() {
                        Some(device) => {
                            self.flash_task = Some(device.boot(Bytes::from(image)));
                        }
                        None => warn!("image download without a selected board"),
                    }
                } else {
                    self.download.push(frame.payload());
                }
            }
            MessageKind::FastbootContinue => {
                if let Some(device) = self.device.as_ref() {
                    device.fastboot_continue();
                }
            }
            MessageKind::StatusUpdate => {
                let lines = match self.device.as_mut() {
                    Some(device) => {
                        device.enable_status();
                        device.status_lines()
                    }
                    None => Vec::new(),
                };
                for line in lines {
                    self.send(Frame::new(MessageKind::StatusUpdate, Bytes::from(line)))
                        .await?;
                }
            }
            MessageKind::VbusOn | MessageKind::VbusOff => {
                let on = frame.kind() == MessageKind::VbusOn;
                match self.device.as_mut() {
                    Some(device) => {
                        if let Err(err) = device.usb(on) {
                            warn!("vbus switch failed: {err}");
                        }
                    }
                    None => warn!("vbus request before board selection"),
                }
            }
            MessageKind::SendBreak => {
                if let Some(device) = self.device.as_mut() {
                    match device.assert_break() {
                        Ok(()) => self
                            .timers
                            .arm(ServerTimer::BreakRelease, now_plus(BREAK_INTERVAL)),
                        Err(err) => warn!("break failed: {err}"),
                    }
                }
            }
            MessageKind::ListDevices => self.list_devices().await?,
            MessageKind::BoardInfo => self.board_info(&frame).await?,
            MessageKind::HardReset | MessageKind::FastbootBoot => {
                debug!(kind = ?frame.kind(), "ignored");
            }
            MessageKind::FastbootPresent => {
                debug!("ignoring fastboot presence from the client");
            }
        }
        Ok(())
    }

    /// Bind the session to a board. On any failure the session terminates
    /// without a reply; the client observes EOF.
    async fn select_board(&mut self, frame: &Frame) -> Result<()> {
        if self.device.is_some() {
            return Err(CdbaError::Protocol("board already selected".into()));
        }

        let name = payload_str(frame.payload());
        let cfg = self.registry.authorize(&name)?;
        let device = Device::open(cfg)?;
        self.monitor = cfg
            .fastboot
            .as_ref()
            .map(|f| FastbootMonitor::new(f.node.clone(), Duration::from_millis(f.poll_ms)));
        self.device = Some(device);

        self.send(Frame::empty(MessageKind::SelectBoard)).await?;
        // Selection implies bringing the board up; the client only watches.
        self.drive_power(true).await
    }

    async fn drive_power(&mut self, on: bool) -> Result<()> {
        match self.device.as_mut() {
            Some(device) => {
                if let Err(err) = device.power(on) {
                    warn!("power switch failed: {err}");
                }
            }
            None => warn!("power request before board selection"),
        }
        let ack = if on {
            MessageKind::PowerOn
        } else {
            MessageKind::PowerOff
        };
        self.send(Frame::empty(ack)).await
    }

    async fn list_devices(&mut self) -> Result<()> {
        let names: Vec<Bytes> = self
            .registry
            .visible()
            .map(|b| Bytes::from(b.name.clone().into_bytes()))
            .collect();
        for name in names {
            self.send(Frame::new(MessageKind::ListDevices, name)).await?;
        }
        self.send(Frame::empty(MessageKind::ListDevices)).await
    }

    async fn board_info(&mut self, frame: &Frame) -> Result<()> {
        let name = payload_str(frame.payload());
        match self.registry.info(&name) {
            Ok(line) => {
                self.send(Frame::new(
                    MessageKind::BoardInfo,
                    Bytes::from(line.into_bytes()),
                ))
                .await
            }
            Err(err) => {
                // Report the refusal, then terminate the session.
                self.send(Frame::empty(MessageKind::BoardInfo)).await?;
                Err(err)
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.transport.write_all(&frame.encode()).await?;
        self.transport.flush().await?;
        Ok(())
    }
}

fn now_plus(delta: Duration) -> tokio::time::Instant {
    tokio::time::Instant::now() + delta
}

/// Board names arrive as raw payload bytes; tolerate a trailing NUL from
/// C-style senders.
fn payload_str(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .trim_end_matches('\0')
        .to_string()
}

async fn monitor_event(monitor: Option<&mut FastbootMonitor>) -> FastbootEvent {
    match monitor {
        Some(monitor) => monitor.next_event().await,
        None => std::future::pending().await,
    }
}

async fn flash_result(task: Option<&mut JoinHandle<Result<()>>>) -> Result<()> {
    match task {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(err) => Err(CdbaError::Device(format!("flasher task failed: {err}"))),
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::BoardConfig;
    use tokio::io::{duplex, split};

    fn test_registry(user: &str) -> Registry {
        let boards: Vec<BoardConfig> = serde_json::from_str(
            r#"[
                { "name": "virt-1", "description": "virtual board" },
                { "name": "locked", "users": ["alice"] }
            ]"#,
        )
        .unwrap();
        Registry::from_boards(boards, user.to_string())
    }

    async fn expect_frame<R: AsyncRead + Unpin>(
        reader: &mut FrameReader<R>,
        kind: MessageKind,
    ) -> Frame {
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.kind(), kind);
        frame
    }

    #[tokio::test]
    async fn test_select_board_acks_then_powers_on() {
        let (client_end, server_end) = duplex(64 * 1024);
        let (srx, stx) = split(server_end);
        let server = tokio::spawn(Server::new(test_registry("bob"), srx, stx).run());

        let (crx, mut ctx) = split(client_end);
        let mut reader = FrameReader::new(crx);

        ctx.write_all(&Frame::from_slice(MessageKind::SelectBoard, b"virt-1").encode())
            .await
            .unwrap();

        expect_frame(&mut reader, MessageKind::SelectBoard).await;
        expect_frame(&mut reader, MessageKind::PowerOn).await;

        drop(ctx);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_select_terminates_without_reply() {
        let (client_end, server_end) = duplex(64 * 1024);
        let (srx, stx) = split(server_end);
        let server = tokio::spawn(Server::new(test_registry("bob"), srx, stx).run());

        let (crx, mut ctx) = split(client_end);
        let mut reader = FrameReader::new(crx);

        ctx.write_all(&Frame::from_slice(MessageKind::SelectBoard, b"locked").encode())
            .await
            .unwrap();

        // The server exits with an authorization error and the client
        // observes EOF with no frames.
        let result = server.await.unwrap();
        assert!(matches!(result, Err(CdbaError::NotAuthorized { .. })));
        drop(ctx);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_devices_filters_and_terminates() {
        let (client_end, server_end) = duplex(64 * 1024);
        let (srx, stx) = split(server_end);
        let server = tokio::spawn(Server::new(test_registry("bob"), srx, stx).run());

        let (crx, mut ctx) = split(client_end);
        let mut reader = FrameReader::new(crx);

        ctx.write_all(&Frame::empty(MessageKind::ListDevices).encode())
            .await
            .unwrap();

        let first = expect_frame(&mut reader, MessageKind::ListDevices).await;
        assert_eq!(first.payload(), b"virt-1");
        let terminator = expect_frame(&mut reader, MessageKind::ListDevices).await;
        assert!(terminator.payload().is_empty());

        drop(ctx);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_board_info_unauthorized_reports_and_quits() {
        let (client_end, server_end) = duplex(64 * 1024);
        let (srx, stx) = split(server_end);
        let server = tokio::spawn(Server::new(test_registry("bob"), srx, stx).run());

        let (crx, mut ctx) = split(client_end);
        let mut reader = FrameReader::new(crx);

        ctx.write_all(&Frame::from_slice(MessageKind::BoardInfo, b"locked").encode())
            .await
            .unwrap();

        let reply = expect_frame(&mut reader, MessageKind::BoardInfo).await;
        assert!(reply.payload().is_empty());
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_download_flashes_on_sentinel_and_acks() {
        let (client_end, server_end) = duplex(64 * 1024);
        let (srx, stx) = split(server_end);
        let server = tokio::spawn(Server::new(test_registry("bob"), srx, stx).run());

        let (crx, mut ctx) = split(client_end);
        let mut reader = FrameReader::new(crx);

        ctx.write_all(&Frame::from_slice(MessageKind::SelectBoard, b"virt-1").encode())
            .await
            .unwrap();
        expect_frame(&mut reader, MessageKind::SelectBoard).await;
        expect_frame(&mut reader, MessageKind::PowerOn).await;

        for chunk in [&[0xAAu8; 2048][..], &[0xBB][..], &[][..]] {
            ctx.write_all(&Frame::from_slice(MessageKind::FastbootDownload, chunk).encode())
                .await
                .unwrap();
        }

        // Stub flasher accepts the image; the ack is the completion signal.
        let ack = expect_frame(&mut reader, MessageKind::FastbootDownload).await;
        assert!(ack.payload().is_empty());

        drop(ctx);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_status_update_streams_lines() {
        let (client_end, server_end) = duplex(64 * 1024);
        let (srx, stx) = split(server_end);
        let server = tokio::spawn(Server::new(test_registry("bob"), srx, stx).run());

        let (crx, mut ctx) = split(client_end);
        let mut reader = FrameReader::new(crx);

        ctx.write_all(&Frame::from_slice(MessageKind::SelectBoard, b"virt-1").encode())
            .await
            .unwrap();
        expect_frame(&mut reader, MessageKind::SelectBoard).await;
        expect_frame(&mut reader, MessageKind::PowerOn).await;

        ctx.write_all(&Frame::empty(MessageKind::StatusUpdate).encode())
            .await
            .unwrap();

        let line = expect_frame(&mut reader, MessageKind::StatusUpdate).await;
        assert_eq!(line.payload(), b"board: virt-1");
        let power = expect_frame(&mut reader, MessageKind::StatusUpdate).await;
        assert_eq!(power.payload(), b"power: on");

        drop(ctx);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_select_is_a_protocol_error() {
        let (client_end, server_end) = duplex(64 * 1024);
        let (srx, stx) = split(server_end);
        let server = tokio::spawn(Server::new(test_registry("bob"), srx, stx).run());

        let (crx, mut ctx) = split(client_end);
        let mut reader = FrameReader::new(crx);

        for _ in 0..2 {
            ctx.write_all(&Frame::from_slice(MessageKind::SelectBoard, b"virt-1").encode())
                .await
                .unwrap();
        }
        expect_frame(&mut reader, MessageKind::SelectBoard).await;
        expect_frame(&mut reader, MessageKind::PowerOn).await;

        assert!(matches!(
            server.await.unwrap(),
            Err(CdbaError::Protocol(_))
        ));
    }
}
