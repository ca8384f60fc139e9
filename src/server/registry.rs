//! Board registry and access control.
//!
//! The server loads a declarative board file at startup and answers the
//! list/info/select queries against it. Every query is filtered by the
//! effective user's allow-list; the registry is read-only after load.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{CdbaError, Result};

/// Candidate board file locations, in preference order.
pub const CONFIG_PATHS: [&str; 2] = ["./.cdba", "/etc/cdba"];

fn default_console_baud() -> u32 {
    115_200
}

fn default_relay_baud() -> u32 {
    9_600
}

fn default_poll_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

/// Console UART attached to the board.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    #[serde(default = "default_console_baud")]
    pub baud: u32,
}

/// How power, VBUS and the fastboot key are driven.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlConfig {
    /// Virtual board: operations are logged but drive nothing.
    #[default]
    Stub,
    /// Serial-controlled relay board with one channel per function.
    Relay {
        port: String,
        #[serde(default = "default_relay_baud")]
        baud: u32,
        power_channel: u8,
        #[serde(default)]
        usb_channel: Option<u8>,
        #[serde(default)]
        key_channel: Option<u8>,
    },
}

/// Flashing-mode detection and engine hand-off.
#[derive(Debug, Clone, Deserialize)]
pub struct FastbootConfig {
    /// Device node that appears when the target enters flashing mode.
    pub node: PathBuf,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Target serial number passed to the flashing engine.
    #[serde(default)]
    pub serial: Option<String>,
}

/// One configured board.
#[derive(Debug, Clone, Deserialize)]
pub struct BoardConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Users allowed to drive this board. Empty opens it to everyone.
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub console: Option<ConsoleConfig>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub fastboot: Option<FastbootConfig>,
    /// Power the board off when the session tears down.
    #[serde(default = "default_true")]
    pub power_off_on_close: bool,
}

#[derive(Debug, Deserialize)]
struct BoardFile {
    boards: Vec<BoardConfig>,
}

/// Identity used for access control: `CDBA_USER`, else `USER`, else
/// `nobody`.
pub fn effective_user() -> String {
    std::env::var("CDBA_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "nobody".to_string())
}

/// The loaded board set plus the effective user, read-only after startup.
#[derive(Debug)]
pub struct Registry {
    boards: Vec<BoardConfig>,
    user: String,
}

impl Registry {
    /// Load from the first existing of [`CONFIG_PATHS`].
    pub fn load() -> Result<Self> {
        for path in CONFIG_PATHS {
            let path = Path::new(path);
            if path.exists() {
                return Self::load_from(path);
            }
        }
        Err(CdbaError::Config(format!(
            "no board file found (looked for {})",
            CONFIG_PATHS.join(", ")
        )))
    }

    /// Load a specific board file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|err| {
            CdbaError::Config(format!("unable to read \"{}\": {err}", path.display()))
        })?;
        let file: BoardFile = serde_json::from_slice(&raw)?;
        Ok(Self::from_boards(file.boards, effective_user()))
    }

    /// Build a registry directly, mainly for tests.
    pub fn from_boards(boards: Vec<BoardConfig>, user: String) -> Self {
        Self { boards, user }
    }

    #[inline]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Boards the effective user may access, in file order.
    pub fn visible(&self) -> impl Iterator<Item = &BoardConfig> {
        self.boards.iter().filter(|b| self.allowed(b))
    }

    /// Resolve a board name, enforcing the allow-list. An unknown name
    /// and a forbidden one are indistinguishable to the caller.
    pub fn authorize(&self, name: &str) -> Result<&BoardConfig> {
        self.boards
            .iter()
            .find(|b| b.name == name && self.allowed(b))
            .ok_or_else(|| CdbaError::NotAuthorized {
                board: name.to_string(),
                user: self.user.clone(),
            })
    }

    /// Human-readable one-liner for `BOARD_INFO`.
    pub fn info(&self, name: &str) -> Result<String> {
        let board = self.authorize(name)?;
        let mut line = board.name.clone();
        if let Some(desc) = &board.description {
            line.push_str(": ");
            line.push_str(desc);
        }
        if let Some(console) = &board.console {
            line.push_str(&format!(" (console {} @ {})", console.port, console.baud));
        }
        if board.fastboot.is_some() {
            line.push_str(" [fastboot]");
        }
        Ok(line)
    }

    fn allowed(&self, board: &BoardConfig) -> bool {
        board.users.is_empty() || board.users.iter().any(|u| u == &self.user)
    }
}
