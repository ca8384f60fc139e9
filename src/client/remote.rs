//! Transport to the board host: an ssh child whose stdio carries the
//! framed channel (stdin/stdout) and diagnostics (stderr).

use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::error::{CdbaError, Result};

/// A spawned remote server and its three pipes.
pub struct RemoteTransport {
    child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl RemoteTransport {
    /// Launch `ssh <host> <server>` with fully piped stdio.
    pub fn spawn(host: &str, server: &str) -> Result<Self> {
        let mut child = Command::new("ssh")
            .arg(host)
            .arg(server)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|err| {
                CdbaError::Config(format!("failed to connect to \"{host}\": {err}"))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(CdbaError::ConnectionClosed)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(CdbaError::ConnectionClosed)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(CdbaError::ConnectionClosed)?;

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    /// Split into the framed pipes, keeping the child for reaping.
    pub fn into_parts(self) -> (Child, ChildStdin, ChildStdout, ChildStderr) {
        (self.child, self.stdin, self.stdout, self.stderr)
    }
}
