//! On-device discovery from `/proc` text.
//!
//! The caller reads the files (directly, or through a privileged shell) and
//! passes their contents here.
//!
//! | Source | Parser | Yields |
//! |--------|--------|--------|
//! | `/proc/net/unix` | [`devtools_pids`] | pids with a devtools socket |
//! | `/proc/net/tcp6` | [`adb_port_from_tcp6`] | port the shell user listens on |
//! | `/proc/<pid>/cmdline` | [`process_name`] | process name |
//!
//! [`scan_local`] applies them to this host's own `/proc`.

// ============================================================================
// Imports
// ============================================================================

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::error::Result;

// ============================================================================
// Constants
// ============================================================================

/// Uid of the `shell` user, which owns the debug-bridge daemon.
pub const SHELL_UID: u32 = 2000;

/// Socket state `TCP_LISTEN` as printed in `/proc/net/tcp6`.
const TCP_LISTEN: &str = "0A";

static DEVTOOLS_SOCKET: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"webview_devtools_remote_(\d+)").ok());

// ============================================================================
// Parsers
// ============================================================================

/// Extracts the pids of `webview_devtools_remote_<pid>` sockets, in order of
/// first appearance, without duplicates.
#[must_use]
pub fn devtools_pids(proc_net_unix: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    let Some(pattern) = DEVTOOLS_SOCKET.as_ref() else {
        return pids;
    };
    for captures in pattern.captures_iter(proc_net_unix) {
        if let Ok(pid) = captures[1].parse::<u32>()
            && !pids.contains(&pid)
        {
            pids.push(pid);
        }
    }
    pids
}

/// Finds the first listening TCP port owned by `uid` (usually
/// [`SHELL_UID`]).
///
/// Lines have the form
/// `sl local_address rem_address st tx:rx tr:when retrnsmt uid ...`.
#[must_use]
pub fn listening_port_for_uid(proc_net_tcp6: &str, uid: u32) -> Option<u16> {
    let uid = uid.to_string();
    proc_net_tcp6.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 || fields[3] != TCP_LISTEN || fields[7] != uid {
            return None;
        }
        let (_, port_hex) = fields[1].rsplit_once(':')?;
        u16::from_str_radix(port_hex, 16).ok().filter(|&port| port != 0)
    })
}

/// Finds the bridge daemon's TCP port: the one the shell user listens on.
#[must_use]
pub fn adb_port_from_tcp6(proc_net_tcp6: &str) -> Option<u16> {
    listening_port_for_uid(proc_net_tcp6, SHELL_UID)
}

/// Turns `/proc/<pid>/cmdline` into a display name.
///
/// NUL separators are removed; an empty command line yields `PID <pid>`.
#[must_use]
pub fn process_name(cmdline: &[u8], pid: u32) -> String {
    let name: String = String::from_utf8_lossy(cmdline)
        .chars()
        .filter(|&c| c != '\0')
        .collect();
    let name = name.trim();
    if name.is_empty() {
        format!("PID {pid}")
    } else {
        name.to_string()
    }
}

// ============================================================================
// Local Scan
// ============================================================================

/// A process that exposes a devtools socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevtoolsProcess {
    /// Process id.
    pub pid: u32,
    /// Name from its command line.
    pub name: String,
}

/// Scans this host's `/proc` for devtools sockets.
///
/// A process that exits between the two reads keeps a `PID <pid>` name.
///
/// # Errors
///
/// [`Error::Io`](crate::Error::Io) if `/proc/net/unix` cannot be read.
pub async fn scan_local() -> Result<Vec<DevtoolsProcess>> {
    let net_unix = tokio::fs::read_to_string("/proc/net/unix").await?;
    let mut processes = Vec::new();
    for pid in devtools_pids(&net_unix) {
        let cmdline = tokio::fs::read(format!("/proc/{pid}/cmdline"))
            .await
            .unwrap_or_default();
        processes.push(DevtoolsProcess {
            pid,
            name: process_name(&cmdline, pid),
        });
    }
    debug!(count = processes.len(), "Scanned local devtools sockets");
    Ok(processes)
}

// ============================================================================
// Tests
// ============================================================================
