//! The board-instance device abstraction.
//!
//! One [`Device`] exists per session, created by `SELECT_BOARD` and owned
//! exclusively by the server loop. The dispatcher talks to the capability
//! surface; the concrete way power, VBUS and the fastboot key are driven
//! hides behind [`ControlBackend`], and the flashing engine behind
//! [`Flasher`].

use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::error::{CdbaError, Result};

use super::registry::{BoardConfig, ControlConfig};

/// Back-end dispatch for power, VBUS and the fastboot key.
///
/// Implementations return quickly; anything long-running belongs on the
/// event loop, not in here.
pub trait ControlBackend: Send {
    fn power(&mut self, on: bool) -> Result<()>;
    fn usb(&mut self, on: bool) -> Result<()>;
    /// Hold or release the key combination that forces the target into
    /// flashing mode. A no-op for boards without one.
    fn fastboot_key(&mut self, asserted: bool) -> Result<()>;
}

/// Virtual board: every operation logs and succeeds. Used for bring-up
/// of new lab hosts and for exercising the protocol without hardware.
pub struct StubBackend {
    board: String,
}

impl StubBackend {
    pub fn new(board: &str) -> Self {
        Self {
            board: board.to_string(),
        }
    }
}

impl ControlBackend for StubBackend {
    fn power(&mut self, on: bool) -> Result<()> {
        info!(board = %self.board, on, "stub power");
        Ok(())
    }

    fn usb(&mut self, on: bool) -> Result<()> {
        info!(board = %self.board, on, "stub vbus");
        Ok(())
    }

    fn fastboot_key(&mut self, asserted: bool) -> Result<()> {
        info!(board = %self.board, asserted, "stub fastboot key");
        Ok(())
    }
}

/// Serial-controlled relay board, one channel per function.
pub struct RelayBackend {
    port: Box<dyn SerialPort>,
    power_channel: u8,
    usb_channel: Option<u8>,
    key_channel: Option<u8>,
}

impl RelayBackend {
    pub fn open(
        path: &str,
        baud: u32,
        power_channel: u8,
        usb_channel: Option<u8>,
        key_channel: Option<u8>,
    ) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(500))
            .open()?;
        Ok(Self {
            port,
            power_channel,
            usb_channel,
            key_channel,
        })
    }

    /// Four-byte command of the common LC-style relay modules:
    /// start byte, channel, state, additive checksum.
    fn set(&mut self, channel: u8, on: bool) -> Result<()> {
        let state = u8::from(on);
        let cmd = [
            0xA0,
            channel,
            state,
            0xA0u8.wrapping_add(channel).wrapping_add(state),
        ];
        self.port
            .write_all(&cmd)
            .map_err(|err| CdbaError::Device(format!("relay write failed: {err}")))
    }

    fn set_optional(&mut self, channel: Option<u8>, on: bool, what: &str) -> Result<()> {
        match channel {
            Some(channel) => self.set(channel, on),
            None => {
                debug!("board has no {what} channel");
                Ok(())
            }
        }
    }
}

impl ControlBackend for RelayBackend {
    fn power(&mut self, on: bool) -> Result<()> {
        self.set(self.power_channel, on)
    }

    fn usb(&mut self, on: bool) -> Result<()> {
        self.set_optional(self.usb_channel, on, "vbus")
    }

    fn fastboot_key(&mut self, asserted: bool) -> Result<()> {
        self.set_optional(self.key_channel, asserted, "fastboot key")
    }
}

fn backend_from(cfg: &ControlConfig, board: &str) -> Result<Box<dyn ControlBackend>> {
    Ok(match cfg {
        ControlConfig::Stub => Box::new(StubBackend::new(board)),
        ControlConfig::Relay {
            port,
            baud,
            power_channel,
            usb_channel,
            key_channel,
        } => Box::new(RelayBackend::open(
            port,
            *baud,
            *power_channel,
            *usb_channel,
            *key_channel,
        )?),
    })
}

/// Hand-off point to the flashing engine.
#[derive(Debug, Clone)]
pub enum Flasher {
    /// Drive the host's `fastboot` tool against the enumerated target.
    Tool { serial: Option<String> },
    /// Virtual flasher: log the image and succeed.
    Stub,
}

impl Flasher {
    /// Push the accumulated image and boot it. Engine chatter goes to the
    /// log, never onto the framed channel.
    pub async fn flash(&self, image: &[u8]) -> Result<()> {
        match self {
            Flasher::Stub => {
                info!(bytes = image.len(), "stub flasher accepted image");
                Ok(())
            }
            Flasher::Tool { serial } => {
                let path =
                    std::env::temp_dir().join(format!("cdba-{}.img", std::process::id()));
                tokio::fs::write(&path, image).await?;

                let mut cmd = tokio::process::Command::new("fastboot");
                if let Some(serial) = serial {
                    cmd.arg("-s").arg(serial);
                }
                let output = cmd.arg("boot").arg(&path).output().await;
                let _ = tokio::fs::remove_file(&path).await;

                let output = output?;
                for line in String::from_utf8_lossy(&output.stderr).lines() {
                    info!(target: "fastboot", "{line}");
                }
                if !output.status.success() {
                    return Err(CdbaError::Device(format!(
                        "fastboot exited with {}",
                        output.status
                    )));
                }
                Ok(())
            }
        }
    }

    /// Tell the target to continue booting out of flashing mode.
    pub async fn resume(&self) -> Result<()> {
        match self {
            Flasher::Stub => {
                info!("stub flasher continue");
                Ok(())
            }
            Flasher::Tool { serial } => {
                let mut cmd = tokio::process::Command::new("fastboot");
                if let Some(serial) = serial {
                    cmd.arg("-s").arg(serial);
                }
                let status = cmd.arg("continue").status().await?;
                if !status.success() {
                    return Err(CdbaError::Device(format!(
                        "fastboot continue exited with {status}"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// A selected board: console port, control back-end, flasher and the
/// little state the dispatcher reports in `STATUS_UPDATE`.
pub struct Device {
    name: String,
    console: Option<SerialStream>,
    backend: Box<dyn ControlBackend>,
    flasher: Flasher,
    powered: bool,
    vbus: bool,
    status_enabled: bool,
    power_off_on_close: bool,
}

impl Device {
    /// Instantiate the board from its registry record. Any driver failure
    /// here aborts the session before a `SELECT_BOARD` reply goes out.
    pub fn open(cfg: &BoardConfig) -> Result<Self> {
        let console = match &cfg.console {
            Some(console) => Some(
                tokio_serial::new(&console.port, console.baud)
                    .open_native_async()
                    .map_err(|err| {
                        CdbaError::Device(format!(
                            "unable to open console {}: {err}",
                            console.port
                        ))
                    })?,
            ),
            None => None,
        };

        let backend = backend_from(&cfg.control, &cfg.name)?;
        let flasher = match &cfg.fastboot {
            Some(fastboot) => Flasher::Tool {
                serial: fastboot.serial.clone(),
            },
            None => Flasher::Stub,
        };

        Ok(Self {
            name: cfg.name.clone(),
            console,
            backend,
            flasher,
            powered: false,
            vbus: false,
            status_enabled: false,
            power_off_on_close: cfg.power_off_on_close,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drive board power. Powering on also holds the fastboot key so the
    /// target wakes into flashing mode; the key is released when the
    /// flashing adapter reports the target present.
    pub fn power(&mut self, on: bool) -> Result<()> {
        if on {
            if let Err(err) = self.backend.fastboot_key(true) {
                warn!("failed to hold fastboot key: {err}");
            }
        }
        self.backend.power(on)?;
        self.powered = on;
        Ok(())
    }

    pub async fn write_console(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.console {
            Some(console) => {
                AsyncWriteExt::write_all(console, data).await?;
                Ok(())
            }
            None => Err(CdbaError::Device(format!(
                "board {} has no console",
                self.name
            ))),
        }
    }

    /// The console port, for the loop's read watch.
    #[inline]
    pub fn console_mut(&mut self) -> Option<&mut SerialStream> {
        self.console.as_mut()
    }

    /// Stop watching a console that reported EOF or a hard error.
    pub fn drop_console(&mut self) {
        self.console = None;
    }

    pub fn usb(&mut self, on: bool) -> Result<()> {
        self.backend.usb(on)?;
        self.vbus = on;
        Ok(())
    }

    pub fn hold_fastboot_key(&mut self, asserted: bool) -> Result<()> {
        self.backend.fastboot_key(asserted)
    }

    /// Start a break condition on the console UART. The caller releases
    /// it after the break interval via [`Device::release_break`].
    pub fn assert_break(&mut self) -> Result<()> {
        match &mut self.console {
            Some(console) => {
                console.set_break()?;
                Ok(())
            }
            None => Err(CdbaError::Device(format!(
                "board {} has no console",
                self.name
            ))),
        }
    }

    pub fn release_break(&mut self) -> Result<()> {
        match &mut self.console {
            Some(console) => {
                console.clear_break()?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Flash and boot the accumulated image on the event loop; the
    /// returned handle resolves when the engine finishes.
    pub fn boot(&self, image: Bytes) -> JoinHandle<Result<()>> {
        let flasher = self.flasher.clone();
        tokio::spawn(async move { flasher.flash(&image).await })
    }

    /// Fire-and-forget `fastboot continue`; failures are logged.
    pub fn fastboot_continue(&self) {
        let flasher = self.flasher.clone();
        tokio::spawn(async move {
            if let Err(err) = flasher.resume().await {
                warn!("fastboot continue failed: {err}");
            }
        });
    }

    /// Switch status telemetry on for the rest of the session. Idempotent.
    pub fn enable_status(&mut self) {
        if !self.status_enabled {
            debug!(board = %self.name, "status telemetry enabled");
            self.status_enabled = true;
        }
    }

    /// Status telemetry for `STATUS_UPDATE`, one line per frame.
    pub fn status_lines(&self) -> Vec<String> {
        vec![
            format!("board: {}", self.name),
            format!("power: {}", if self.powered { "on" } else { "off" }),
            format!("vbus: {}", if self.vbus { "on" } else { "off" }),
        ]
    }

    /// Session teardown. Powers the board off when its lifecycle policy
    /// says so; errors are logged, not propagated.
    pub fn close(&mut self) {
        if self.power_off_on_close && self.powered {
            if let Err(err) = self.power(false) {
                warn!("power off on close failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::BoardConfig;

    fn stub_board() -> BoardConfig {
        serde_json::from_str(r#"{ "name": "virt-1" }"#).unwrap()
    }

    #[test]
    fn test_stub_device_open_and_power() {
        let mut device = Device::open(&stub_board()).unwrap();
        assert_eq!(device.name(), "virt-1");
        assert!(device.power(true).is_ok());
        assert!(device.status_lines().iter().any(|l| l == "power: on"));
        assert!(device.power(false).is_ok());
        assert!(device.status_lines().iter().any(|l| l == "power: off"));
    }

    #[test]
    fn test_console_ops_fail_without_console() {
        let mut device = Device::open(&stub_board()).unwrap();
        assert!(device.assert_break().is_err());
        // Releasing a break on a console-less board is a harmless no-op.
        assert!(device.release_break().is_ok());
    }

    #[tokio::test]
    async fn test_stub_flasher_accepts_image() {
        let flasher = Flasher::Stub;
        assert!(flasher.flash(&[0u8; 128]).await.is_ok());
        assert!(flasher.resume().await.is_ok());
    }

    #[tokio::test]
    async fn test_boot_task_resolves() {
        let device = Device::open(&stub_board()).unwrap();
        let task = device.boot(Bytes::from_static(b"image"));
        task.await.unwrap().unwrap();
    }
}
