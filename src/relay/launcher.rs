//! Launching the relay through a privileged command.
//!
//! The caller builds the command that runs `devtools-relay` with enough
//! privilege to reach the devtools sockets (e.g. through `su -c`). The relay
//! prints its bound port as the first stdout line; the launcher reads it and
//! keeps the process alive until it is killed or dropped.

// ============================================================================
// Imports
// ============================================================================

use std::net::{Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default bound on the relay reporting its port.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// RelayProcess
// ============================================================================

/// Running relay process; killed when dropped.
#[derive(Debug)]
pub struct RelayProcess {
    child: Option<Child>,
    pid: u32,
    port: u16,
    /// Held so later writes by the relay do not hit a closed pipe.
    _stdout: Lines<BufReader<ChildStdout>>,
}

impl RelayProcess {
    /// Spawns `command` and waits for the port line with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`RelayProcess::spawn_with_timeout`].
    pub async fn spawn(command: Command) -> Result<Self> {
        Self::spawn_with_timeout(command, DEFAULT_STARTUP_TIMEOUT).await
    }

    /// Spawns `command` and waits up to `startup` for the port line.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the command cannot be spawned
    /// - [`Error::Relay`] if the process exits without a port or prints
    ///   something that is not a port
    /// - [`Error::Timeout`] if no line arrives within `startup`
    pub async fn spawn_with_timeout(mut command: Command, startup: Duration) -> Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or(0);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::relay("relay stdout was not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        debug!(pid, "Relay process spawned, waiting for port");

        let line = match timeout(startup, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(Error::relay("relay exited without reporting a port"));
            }
            Ok(Err(e)) => return Err(Error::relay(format!("reading relay output: {e}"))),
            Err(_) => {
                return Err(Error::timeout(
                    "relay startup",
                    startup.as_millis() as u64,
                ));
            }
        };

        let port = parse_port(&line)?;
        info!(pid, port, "Relay ready");

        Ok(Self {
            child: Some(child),
            pid,
            port,
            _stdout: lines,
        })
    }

    /// Returns the relay's TCP port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the loopback address of the relay.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    /// Returns the process id (0 if unknown).
    #[inline]
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Kills the relay and waits for it to exit.
    pub async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(pid = self.pid, error = %e, "Failed to kill relay");
            }
            info!(pid = self.pid, "Relay terminated");
        }
    }
}

impl Drop for RelayProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.start_kill()
        {
            debug!(pid = self.pid, error = %e, "Failed to send kill signal in Drop");
        }
    }
}

fn parse_port(line: &str) -> Result<u16> {
    match line.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(Error::relay(format!("invalid port from relay: {line:?}"))),
    }
}

// ============================================================================
// Tests
// ============================================================================
