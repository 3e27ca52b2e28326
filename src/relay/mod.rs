//! TCP to Unix-domain socket relay.
//!
//! Devtools sockets live in the abstract Unix namespace and are only
//! reachable by privileged processes. The relay runs with that privilege,
//! listens on TCP, and splices each accepted connection to the target
//! socket.
//!
//! # Half-Close
//!
//! ```text
//! TCP client ──► tcp read ──copy──► unix write   (EOF → shutdown unix write)
//! TCP client ◄── tcp write ◄─copy── unix read    (EOF → shutdown tcp write)
//! ```
//!
//! Both sockets are dropped once both directions have finished.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `launcher` | Spawns the relay binary through a privileged command |

// ============================================================================
// Submodules
// ============================================================================

/// Privileged relay process launcher.
pub mod launcher;

pub use launcher::RelayProcess;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, copy};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Prefix of the abstract socket a debuggable web view listens on.
pub const DEVTOOLS_SOCKET_PREFIX: &str = "webview_devtools_remote_";

// ============================================================================
// RelayTarget
// ============================================================================

/// Unix-domain socket the relay connects each client to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTarget {
    /// Abstract-namespace name, without the leading NUL.
    Abstract(String),
    /// Filesystem socket path.
    Path(PathBuf),
}

impl RelayTarget {
    /// Devtools socket of the web view in process `pid`.
    #[must_use]
    pub fn devtools(pid: u32) -> Self {
        Self::Abstract(format!("{DEVTOOLS_SOCKET_PREFIX}{pid}"))
    }

    /// Bridge destination string for the same socket, e.g.
    /// `localabstract:webview_devtools_remote_1234`.
    #[must_use]
    pub fn destination(&self) -> String {
        match self {
            Self::Abstract(name) => format!("localabstract:{name}"),
            Self::Path(path) => format!("localfilesystem:{}", path.display()),
        }
    }

    /// Connects to the target.
    ///
    /// # Errors
    ///
    /// [`Error::Relay`] if the socket cannot be reached.
    pub async fn connect(&self) -> Result<UnixStream> {
        match self {
            Self::Path(path) => UnixStream::connect(path)
                .await
                .map_err(|e| Error::relay(format!("connect {}: {e}", path.display()))),
            Self::Abstract(name) => connect_abstract(name).await,
        }
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abstract(name) => write!(f, "@{name}"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
async fn connect_abstract(name: &str) -> Result<UnixStream> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr as UnixAddr, UnixStream as StdUnixStream};

    let owned = name.to_string();
    let connected = tokio::task::spawn_blocking(move || {
        let addr = UnixAddr::from_abstract_name(owned.as_bytes())?;
        let stream = StdUnixStream::connect_addr(&addr)?;
        stream.set_nonblocking(true)?;
        Ok::<_, std::io::Error>(stream)
    })
    .await
    .map_err(|e| Error::relay(format!("connect @{name}: {e}")))?;

    let stream = connected.map_err(|e| Error::relay(format!("connect @{name}: {e}")))?;
    UnixStream::from_std(stream).map_err(|e| Error::relay(format!("connect @{name}: {e}")))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
async fn connect_abstract(name: &str) -> Result<UnixStream> {
    Err(Error::relay(format!(
        "abstract socket @{name} is only reachable on Linux and Android"
    )))
}

// ============================================================================
// Relay
// ============================================================================

/// TCP listener relaying to a Unix-domain socket.
#[derive(Debug)]
pub struct Relay {
    listener: TcpListener,
}

impl Relay {
    /// Binds the TCP side. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the address cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Returns the bound TCP address.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections forever.
    ///
    /// # Errors
    ///
    /// Only returns on a fatal accept error.
    pub async fn run(self, target: RelayTarget) -> Result<()> {
        self.run_until(target, CancellationToken::new()).await
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// A target that cannot be reached only drops that client.
    ///
    /// # Errors
    ///
    /// Only returns an error on a fatal accept error.
    pub async fn run_until(self, target: RelayTarget, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, %target, "Relay listening");

        loop {
            let (client, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted?,
            };

            let target = target.clone();
            tokio::spawn(async move {
                let local = match target.connect().await {
                    Ok(local) => local,
                    Err(e) => {
                        warn!(%peer, error = %e, "Relay target unreachable, dropping client");
                        return;
                    }
                };

                debug!(%peer, %target, "Relaying");
                let (sent, received) = bridge(client, local).await;
                debug!(%peer, sent, received, "Relay connection finished");
            });
        }

        debug!("Relay stopped");
        Ok(())
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Copies both directions between `tcp` and `local` until each reaches EOF.
///
/// Returns the bytes copied `(tcp → local, local → tcp)`.
pub async fn bridge(tcp: TcpStream, local: UnixStream) -> (u64, u64) {
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let (mut local_read, mut local_write) = local.into_split();

    tokio::join!(
        pump(&mut tcp_read, &mut local_write, "tcp → unix"),
        pump(&mut local_read, &mut tcp_write, "unix → tcp"),
    )
}

/// One direction: copy to EOF, then shut down the writer.
async fn pump<R, W>(reader: &mut R, writer: &mut W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = match copy(reader, writer).await {
        Ok(n) => n,
        Err(e) => {
            debug!(direction, error = %e, "Relay copy ended with error");
            0
        }
    };
    let _ = writer.shutdown().await;
    copied
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;
    use tokio::time::timeout;

    /// Unix server that reads to EOF, then answers and closes.
    fn spawn_reply_server(listener: UnixListener) -> tokio::task::JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.expect("read");
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&request);
            socket.write_all(&reply).await.expect("write");
            socket.shutdown().await.expect("shutdown");
            request
        })
    }

    async fn start_relay(target: RelayTarget) -> (SocketAddr, CancellationToken) {
        let relay = Relay::bind("127.0.0.1:0").await.expect("bind");
        let addr = relay.local_addr().expect("addr");
        let shutdown = CancellationToken::new();
        tokio::spawn(relay.run_until(target, shutdown.clone()));
        (addr, shutdown)
    }

    #[test]
    fn test_devtools_target() {
        let target = RelayTarget::devtools(1234);
        assert_eq!(
            target,
            RelayTarget::Abstract("webview_devtools_remote_1234".into())
        );
        assert_eq!(
            target.destination(),
            "localabstract:webview_devtools_remote_1234"
        );
        assert_eq!(target.to_string(), "@webview_devtools_remote_1234");
    }

    #[tokio::test]
    async fn test_half_close_propagates_through_path_target() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("devtools.sock");
        let server = spawn_reply_server(UnixListener::bind(&path)?);
        let (addr, shutdown) = start_relay(RelayTarget::Path(path)).await;

        let mut client = TcpStream::connect(addr).await?;
        client.write_all(b"GET /json/list").await?;
        client.shutdown().await?;

        let mut reply = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut reply)).await??;

        assert_eq!(reply, b"echo:GET /json/list");
        assert_eq!(server.await?, b"GET /json/list");
        shutdown.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_target_drops_only_that_client() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("late.sock");
        let (addr, shutdown) = start_relay(RelayTarget::Path(path.clone())).await;

        let mut first = TcpStream::connect(addr).await?;
        let mut sink = Vec::new();
        timeout(Duration::from_secs(2), first.read_to_end(&mut sink)).await??;
        assert!(sink.is_empty());

        let server = spawn_reply_server(UnixListener::bind(&path)?);
        let mut second = TcpStream::connect(addr).await?;
        second.write_all(b"ping").await?;
        second.shutdown().await?;

        let mut reply = Vec::new();
        timeout(Duration::from_secs(2), second.read_to_end(&mut reply)).await??;
        assert_eq!(reply, b"echo:ping");
        server.await?;
        shutdown.cancel();
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_abstract_target() -> anyhow::Result<()> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr as UnixAddr, UnixListener as StdUnixListener};

        let name = format!("devtools_bridge_test_{}", uuid::Uuid::new_v4().simple());
        let std_listener = StdUnixListener::bind_addr(&UnixAddr::from_abstract_name(&name)?)?;
        std_listener.set_nonblocking(true)?;
        let server = spawn_reply_server(UnixListener::from_std(std_listener)?);

        let (addr, shutdown) = start_relay(RelayTarget::Abstract(name)).await;

        let mut client = TcpStream::connect(addr).await?;
        client.write_all(b"abstract").await?;
        client.shutdown().await?;

        let mut reply = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut reply)).await??;
        assert_eq!(reply, b"echo:abstract");
        server.await?;
        shutdown.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_abstract_name_is_relay_error() {
        let target = RelayTarget::Abstract(format!(
            "devtools_bridge_missing_{}",
            uuid::Uuid::new_v4().simple()
        ));
        let err = target.connect().await.unwrap_err();
        assert!(matches!(err, Error::Relay { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() -> anyhow::Result<()> {
        let relay = Relay::bind("127.0.0.1:0").await?;
        let addr = relay.local_addr()?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(relay.run_until(RelayTarget::devtools(1), shutdown.clone()));

        shutdown.cancel();
        timeout(Duration::from_secs(1), task).await???;

        assert!(TcpStream::connect(addr).await.is_err());
        Ok(())
    }
}
