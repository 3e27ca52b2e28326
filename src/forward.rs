//! Local TCP port forwarding over a bridge connection.
//!
//! Every socket accepted on the local listener gets its own stream to the
//! same device-side destination, and bytes are pumped both ways until either
//! side finishes.
//!
//! # Teardown
//!
//! | Trigger | Effect |
//! |---------|--------|
//! | local EOF or read error | stream closed (CLSE sent) |
//! | peer CLSE | pending data flushed, local write side shut down |
//! | write failure either way | both sides closed |
//! | [`ForwardHandle::close`] | listener stopped, workers cancelled, bounded wait |

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::{Connection, StreamHandler};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on waiting for workers in [`ForwardHandle::close`].
pub const DISPOSE_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Types
// ============================================================================

/// What the stream's callbacks hand to the local writer.
enum Inbound {
    Data(Vec<u8>),
    Closed,
}

// ============================================================================
// ForwardHandle
// ============================================================================

/// Running port forward.
///
/// Dropping the handle cancels everything without waiting; call
/// [`ForwardHandle::close`] to wait for the workers.
pub struct ForwardHandle {
    local_addr: SocketAddr,
    destination: String,
    cancel: CancellationToken,
    workers: TaskTracker,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ForwardHandle {
    /// Binds `addr` and forwards every accepted socket to `destination`.
    ///
    /// Port 0 picks an ephemeral port; see [`ForwardHandle::local_addr`].
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if `connection` is already closed
    /// - [`Error::Io`] if the listener cannot be bound
    pub async fn bind(
        connection: Connection,
        addr: impl ToSocketAddrs,
        destination: impl Into<String>,
    ) -> Result<Self> {
        if connection.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let destination = destination.into();
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let workers = TaskTracker::new();

        let task = tokio::spawn(accept_loop(
            listener,
            connection,
            destination.clone(),
            cancel.clone(),
            workers.clone(),
        ));

        info!(%local_addr, %destination, "Port forward listening");

        Ok(Self {
            local_addr,
            destination,
            cancel,
            workers,
            listener: Mutex::new(Some(task)),
        })
    }

    /// Returns the bound local address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the device-side destination.
    #[inline]
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Returns the number of forwarded sockets still being served.
    #[inline]
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.workers.len()
    }

    /// Returns `true` once the forward has been closed or dropped.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops accepting, cancels workers and waits up to
    /// [`DISPOSE_TIMEOUT`] for them to finish. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }

        self.workers.close();
        if timeout(DISPOSE_TIMEOUT, self.workers.wait()).await.is_err() {
            warn!(
                remaining = self.workers.len(),
                local_addr = %self.local_addr,
                "Forward workers did not stop in time"
            );
        } else {
            debug!(local_addr = %self.local_addr, "Port forward closed");
        }
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ForwardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardHandle")
            .field("local_addr", &self.local_addr)
            .field("destination", &self.destination)
            .field("active_connections", &self.active_connections())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Workers
// ============================================================================

async fn accept_loop(
    listener: TcpListener,
    connection: Connection,
    destination: String,
    cancel: CancellationToken,
    workers: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                if connection.is_closed() {
                    warn!(%peer, "Bridge connection closed, stopping forward");
                    break;
                }
                let _ = socket.set_nodelay(true);
                debug!(%peer, %destination, "Accepted forward client");
                workers.spawn(serve(
                    connection.clone(),
                    socket,
                    destination.clone(),
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "Forward accept failed");
            }
        }
    }

    debug!(%destination, "Forward listener stopped");
}

/// Serves one accepted socket until either side finishes.
async fn serve(
    connection: Connection,
    socket: TcpStream,
    destination: String,
    cancel: CancellationToken,
) {
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let close_tx = inbound_tx.clone();
    let handler = StreamHandler::new(
        move |data| {
            let _ = inbound_tx.send(Inbound::Data(data));
        },
        move || {
            let _ = close_tx.send(Inbound::Closed);
        },
    );

    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = connection.open(&destination, handler) => match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%destination, error = %e, "Forward open failed, dropping client");
                return;
            }
        },
    };

    let local_id = stream.local_id();
    let chunk_size = connection.max_payload().max(1) as usize;
    let (mut local_read, mut local_write) = socket.into_split();

    let upstream = async {
        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = local_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, Error>("local EOF");
            }
            stream.write(&buf[..n]).await?;
        }
    };

    let downstream = async {
        while let Some(Inbound::Data(data)) = inbound_rx.recv().await {
            local_write.write_all(&data).await?;
        }
        Ok::<_, Error>("peer closed stream")
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Ok("cancelled"),
        result = upstream => result,
        result = downstream => result,
    };

    match outcome {
        Ok(reason) => debug!(%local_id, reason, "Forward pump finished"),
        Err(e) => debug!(%local_id, error = %e, "Forward pump failed"),
    }

    stream.close().await;
    let _ = local_write.shutdown().await;
}

// ============================================================================
// Tests
// ============================================================================
