//! Script injection into devtools pages.
//!
//! Each web view process exposes its devtools endpoint on an abstract socket.
//! To reach it, a local TCP port is opened either by forwarding over a bridge
//! [`Connection`] or by launching a privileged relay. The page list is read
//! over HTTP and each selected page receives one `Runtime.evaluate`.
//!
//! Results are per page: one page failing never stops the others.

// ============================================================================
// Imports
// ============================================================================

use std::net::{Ipv4Addr, SocketAddr};

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::forward::ForwardHandle;
use crate::relay::{RelayProcess, RelayTarget};
use crate::transport::Connection;

use super::pages::{TargetPage, list_pages, list_targets};
use super::websocket::send_command;

// ============================================================================
// Constants
// ============================================================================

/// Loads vConsole into the page and opens it.
pub const VCONSOLE_SCRIPT: &str = r#"(function(){fetch("https://unpkg.com/vconsole@latest/dist/vconsole.min.js").then(r=>r.text()).then(eval).then(()=>{new VConsole();})})()"#;

// ============================================================================
// Types
// ============================================================================

/// Builds the privileged command that runs the relay for a target.
pub type RelayCommand = dyn Fn(&RelayTarget) -> Command + Send + Sync;

/// How the devtools socket of a process is reached.
#[derive(Clone, Copy)]
pub enum Route<'a> {
    /// Forward a local port over a bridge connection.
    Bridge(&'a Connection),
    /// Launch a relay with elevated privilege.
    Relay(&'a RelayCommand),
}

impl std::fmt::Debug for Route<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bridge(connection) => f.debug_tuple("Bridge").field(connection).finish(),
            Self::Relay(_) => f.write_str("Relay"),
        }
    }
}

/// Outcome of injecting into one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionResult {
    /// The page.
    pub page: TargetPage,
    /// Why injection failed; `None` on success.
    pub error: Option<String>,
}

impl InjectionResult {
    fn ok(page: &TargetPage) -> Self {
        Self {
            page: page.clone(),
            error: None,
        }
    }

    fn failed(page: &TargetPage, error: impl ToString) -> Self {
        Self {
            page: page.clone(),
            error: Some(error.to_string()),
        }
    }

    /// Returns `true` if the script was delivered.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

// ============================================================================
// CDP Command
// ============================================================================

#[derive(Serialize)]
struct CdpCommand<'a, P> {
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Serialize)]
struct EvaluateParams<'a> {
    expression: &'a str,
}

/// Serializes a `Runtime.evaluate` command for `expression`.
///
/// # Errors
///
/// [`Error::Json`] if serialization fails.
pub fn runtime_evaluate(id: u64, expression: &str) -> Result<String> {
    Ok(serde_json::to_string(&CdpCommand {
        id,
        method: "Runtime.evaluate",
        params: EvaluateParams { expression },
    })?)
}

// ============================================================================
// Devtools Access
// ============================================================================

/// Local TCP access to one process's devtools socket; closed on drop.
enum Access {
    Forward(ForwardHandle),
    Relay(RelayProcess),
}

impl Access {
    async fn open(route: Route<'_>, pid: u32) -> Result<Self> {
        let target = RelayTarget::devtools(pid);
        match route {
            Route::Bridge(connection) => {
                let forward = ForwardHandle::bind(
                    connection.clone(),
                    (Ipv4Addr::LOCALHOST, 0),
                    target.destination(),
                )
                .await?;
                Ok(Self::Forward(forward))
            }
            Route::Relay(command) => Ok(Self::Relay(RelayProcess::spawn(command(&target)).await?)),
        }
    }

    fn addr(&self) -> SocketAddr {
        match self {
            Self::Forward(forward) => forward.local_addr(),
            Self::Relay(relay) => relay.local_addr(),
        }
    }

    async fn close(self) {
        match self {
            Self::Forward(forward) => forward.close().await,
            Self::Relay(mut relay) => relay.kill().await,
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Lists the injectable pages of process `pid`.
///
/// # Errors
///
/// - [`Error::Relay`] / [`Error::Timeout`] if the relay cannot be launched
/// - [`Error::Http`] if the page list cannot be fetched
pub async fn discover_pages(route: Route<'_>, pid: u32, process_name: &str) -> Result<Vec<TargetPage>> {
    let access = Access::open(route, pid).await?;
    let result = list_targets(access.addr(), pid, process_name).await;
    access.close().await;

    let pages = result?;
    debug!(pid, count = pages.len(), "Discovered injectable pages");
    Ok(pages)
}

/// Injects `script` into every page in `pages`.
///
/// Pages are grouped by process so each process's devtools socket is opened
/// once. Returns one result per page, grouped in first-seen process order.
pub async fn inject_pages(route: Route<'_>, pages: &[TargetPage], script: &str) -> Vec<InjectionResult> {
    let mut groups: Vec<(u32, Vec<&TargetPage>)> = Vec::new();
    for page in pages {
        match groups.iter_mut().find(|(pid, _)| *pid == page.pid) {
            Some((_, group)) => group.push(page),
            None => groups.push((page.pid, vec![page])),
        }
    }

    let mut results = Vec::with_capacity(pages.len());
    for (pid, group) in groups {
        results.extend(inject_process(route, pid, &group, script).await);
    }

    let injected = results.iter().filter(|r| r.is_success()).count();
    info!(injected, total = results.len(), "Injection finished");
    results
}

async fn inject_process(
    route: Route<'_>,
    pid: u32,
    pages: &[&TargetPage],
    script: &str,
) -> Vec<InjectionResult> {
    let access = match Access::open(route, pid).await {
        Ok(access) => access,
        Err(e) => {
            warn!(pid, error = %e, "Cannot reach devtools socket");
            return pages.iter().map(|p| InjectionResult::failed(p, &e)).collect();
        }
    };

    let results = inject_via(access.addr(), pages, script).await;
    access.close().await;
    results
}

async fn inject_via(addr: SocketAddr, pages: &[&TargetPage], script: &str) -> Vec<InjectionResult> {
    let live = match list_pages(addr).await {
        Ok(live) => live,
        Err(e) => {
            warn!(%addr, error = %e, "Cannot list pages");
            return pages.iter().map(|p| InjectionResult::failed(p, &e)).collect();
        }
    };

    let command = match runtime_evaluate(1, script) {
        Ok(command) => command,
        Err(e) => return pages.iter().map(|p| InjectionResult::failed(p, &e)).collect(),
    };

    let mut results = Vec::with_capacity(pages.len());
    for page in pages {
        let ws_url = live
            .iter()
            .find(|candidate| candidate.id.as_deref() == Some(page.page_id.as_str()))
            .map(|candidate| candidate.web_socket_debugger_url.as_deref());

        let result = match ws_url {
            None => InjectionResult::failed(page, "page is gone"),
            Some(None) => InjectionResult::failed(page, "page has no debugger URL"),
            Some(Some(ws_url)) => match send_command(ws_url, &command).await {
                Ok(_) => {
                    debug!(page_id = %page.page_id, "Injected");
                    InjectionResult::ok(page)
                }
                Err(e) => {
                    warn!(page_id = %page.page_id, error = %e, "Injection failed");
                    InjectionResult::failed(page, e)
                }
            },
        };
        results.push(result);
    }

    results
}

/// Convenience for [`Error`]-returning callers that want all-or-nothing.
///
/// # Errors
///
/// [`Error::Protocol`] naming the first failed page.
pub fn all_succeeded(results: &[InjectionResult]) -> Result<()> {
    match results.iter().find(|r| !r.is_success()) {
        Some(failed) => Err(Error::protocol(format!(
            "injection into page {} ({}) failed: {}",
            failed.page.page_id,
            failed.page.url,
            failed.error.as_deref().unwrap_or_default()
        ))),
        None => Ok(()),
    }
}

// ============================================================================
// Tests
// ============================================================================
