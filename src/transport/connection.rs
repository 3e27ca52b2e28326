//! Bridge connection and stream multiplexer.
//!
//! A [`Connection`] owns one negotiated transport and multiplexes any number
//! of logical [`Stream`]s over it.
//!
//! # Reader Task
//!
//! A single tokio task reads frames and dispatches them:
//!
//! | Frame | Effect |
//! |-------|--------|
//! | `OKAY(remote, local)` | resolves a pending open, or restores a stream's write credit |
//! | `WRTE(remote, local)` | data callback then `OKAY(local, remote)`; unknown stream gets `CLSE(local, remote)` |
//! | `CLSE(remote, local)` | fails a pending open and closes the stream |
//!
//! All outbound frames go through one async write lock. The stream and
//! pending-open tables sit behind synchronous locks that are never held
//! across an `.await`.
//!
//! # Shutdown
//!
//! [`Connection::close`] is terminal and idempotent. A read error or EOF on
//! the transport closes the connection the same way.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf, split};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{LocalId, RemoteId};
use crate::protocol::{Command, Frame, read_frame, write_frame};

use super::auth::KeyProvider;
use super::handshake::{Handshake, Negotiated};
use super::io::BoxedTransport;
use super::options::ClientOptions;
use super::stream::{Stream, StreamHandler, StreamInner};

// ============================================================================
// Types
// ============================================================================

/// Map of local ids to open-completion channels.
type PendingMap = FxHashMap<LocalId, oneshot::Sender<Result<RemoteId>>>;

/// Map of local ids to live streams.
type StreamMap = FxHashMap<LocalId, Arc<StreamInner>>;

// ============================================================================
// ConnectionInner
// ============================================================================

/// Shared connection state.
///
/// Owned by [`Connection`] handles; the reader task and [`Stream`] handles
/// only hold weak references.
pub(crate) struct ConnectionInner {
    writer: AsyncMutex<Option<WriteHalf<BoxedTransport>>>,
    streams: Mutex<StreamMap>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU32,
    closed: AtomicBool,
    cancel: CancellationToken,
    version: u32,
    max_payload: u32,
    banner: String,
    tls: bool,
    open_timeout: Duration,
}

impl ConnectionInner {
    fn allocate_id(&self) -> LocalId {
        LocalId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends one frame under the write lock.
    async fn send(&self, frame: &Frame) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        trace!(%frame, "Sending frame");
        write_frame(writer, frame).await
    }

    pub(crate) async fn write_stream(&self, stream: &StreamInner, data: &[u8]) -> Result<()> {
        let chunk_size = self.max_payload.max(1) as usize;

        for chunk in data.chunks(chunk_size) {
            if stream.is_closed() {
                return Err(Error::stream_closed(stream.local_id()));
            }
            stream.take_credit().await?;

            let frame = Frame::new(
                Command::Write,
                stream.local_id().as_u32(),
                stream.remote_id().as_u32(),
                chunk,
            );
            self.send(&frame).await?;
        }

        Ok(())
    }

    pub(crate) async fn close_stream(&self, stream: &StreamInner) {
        if !stream.latch_closed() {
            return;
        }

        let local_id = stream.local_id();
        let frame = Frame::empty(Command::Close, local_id.as_u32(), stream.remote_id().as_u32());
        if let Err(e) = self.send(&frame).await {
            debug!(%local_id, error = %e, "CLSE not sent");
        }

        self.streams.lock().remove(&local_id);
        stream.fire_close();
        debug!(%local_id, "Stream closed locally");
    }

    /// Removes a stream the peer (or a failed open) ended; no frame is sent.
    fn retire_stream(&self, local_id: LocalId) {
        let stream = self.streams.lock().remove(&local_id);
        if let Some(stream) = stream
            && stream.latch_closed()
        {
            stream.fire_close();
        }
    }

    fn fail_pending(&self, local_id: LocalId, error: Error) {
        let tx = self.pending.lock().remove(&local_id);
        if let Some(tx) = tx {
            let _ = tx.send(Err(error));
        }
    }

    /// Fails every pending open and closes every stream.
    fn teardown_tables(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        let streams: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();

        let pending_count = pending.len();
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        let stream_count = streams.len();
        for stream in streams {
            if stream.latch_closed() {
                stream.fire_close();
            }
        }

        if pending_count > 0 || stream_count > 0 {
            debug!(pending_count, stream_count, "Failed pending opens and streams");
        }
    }

    async fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();
        self.teardown_tables();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }

        info!(reason, "Bridge connection closed");
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn dispatch(&self, frame: Frame) {
        trace!(%frame, "Received frame");

        let remote_id = RemoteId::new(frame.arg0);
        let local_id = LocalId::new(frame.arg1);

        match frame.command {
            Command::Ready => self.on_ready(remote_id, local_id),
            Command::Write => self.on_write(remote_id, local_id, frame.payload).await,
            Command::Close => self.on_close(remote_id, local_id),
            Command::Unknown(code) => {
                warn!(command = format_args!("{code:#010x}"), "Ignoring unknown command");
            }
            other => debug!(command = %other, "Ignoring frame after handshake"),
        }
    }

    fn on_ready(&self, remote_id: RemoteId, local_id: LocalId) {
        let pending = self.pending.lock().remove(&local_id);
        let stream = self.streams.lock().get(&local_id).cloned();

        if let Some(tx) = pending {
            if let Some(stream) = &stream {
                stream.set_remote_id(remote_id);
            }
            let _ = tx.send(Ok(remote_id));
            return;
        }

        match stream {
            Some(stream) if !stream.is_closed() => {
                stream.set_remote_id(remote_id);
                stream.restore_credit();
            }
            _ => trace!(%local_id, "OKAY for unknown stream"),
        }
    }

    async fn on_write(&self, remote_id: RemoteId, local_id: LocalId, payload: Vec<u8>) {
        let stream = self
            .streams
            .lock()
            .get(&local_id)
            .filter(|s| !s.is_closed())
            .cloned();

        let reply = match stream {
            Some(stream) => {
                stream.deliver(payload);
                Frame::empty(Command::Ready, local_id.as_u32(), remote_id.as_u32())
            }
            None => {
                debug!(%local_id, %remote_id, "WRTE for unknown stream, answering CLSE");
                Frame::empty(Command::Close, local_id.as_u32(), remote_id.as_u32())
            }
        };

        if let Err(e) = self.send(&reply).await {
            debug!(%local_id, error = %e, "Reply to WRTE not sent");
        }
    }

    fn on_close(&self, remote_id: RemoteId, local_id: LocalId) {
        debug!(%local_id, %remote_id, "Stream closed by peer");
        self.fail_pending(local_id, Error::stream_closed(local_id));
        self.retire_stream(local_id);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        self.teardown_tables();
    }
}

// ============================================================================
// PendingOpen
// ============================================================================

/// Table entries of an open that has not resolved yet.
///
/// Dropping it without [`PendingOpen::complete`] undoes the registration,
/// also when the `open` future itself is dropped: the pending entry and the
/// stream are removed and the close callback runs once. A stream the peer
/// already accepted is closed with CLSE instead.
struct PendingOpen {
    inner: Arc<ConnectionInner>,
    stream: Arc<StreamInner>,
    completed: bool,
}

impl PendingOpen {
    fn new(inner: Arc<ConnectionInner>, stream: Arc<StreamInner>) -> Self {
        Self {
            inner,
            stream,
            completed: false,
        }
    }

    fn complete(mut self) -> Arc<StreamInner> {
        self.completed = true;
        Arc::clone(&self.stream)
    }
}

impl Drop for PendingOpen {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let local_id = self.stream.local_id();
        self.inner.pending.lock().remove(&local_id);

        if self.stream.remote_id().is_assigned()
            && !self.stream.is_closed()
            && let Ok(runtime) = Handle::try_current()
        {
            debug!(%local_id, "Open abandoned after OKAY, closing");
            let inner = Arc::clone(&self.inner);
            let stream = Arc::clone(&self.stream);
            runtime.spawn(async move { inner.close_stream(&stream).await });
            return;
        }

        self.inner.retire_stream(local_id);
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Live, negotiated bridge connection.
///
/// Cloning is cheap and shares the same connection. The reader task stops
/// when the connection is closed or the last handle is dropped.
///
/// # Example
///
/// ```ignore
/// let connection = ConnectionBuilder::new()
///     .host("127.0.0.1")
///     .port(5555)
///     .key_provider(key)
///     .connect()
///     .await?;
///
/// let stream = connection
///     .open("tcp:9222", StreamHandler::on_data(|data| println!("{data:?}")))
///     .await?;
/// stream.write(b"GET /json/list HTTP/1.1\r\n\r\n").await?;
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Runs the handshake over `transport` and starts the reader task.
    ///
    /// # Errors
    ///
    /// Any error from [`Handshake::run`].
    pub async fn handshake(
        transport: BoxedTransport,
        host: &str,
        key_provider: &dyn KeyProvider,
        options: &ClientOptions,
    ) -> Result<Self> {
        let negotiated = Handshake::new(host, key_provider, options.max_payload)
            .run(transport)
            .await?;

        Ok(Self::from_negotiated(negotiated, options))
    }

    fn from_negotiated(negotiated: Negotiated, options: &ClientOptions) -> Self {
        let Negotiated {
            transport,
            version,
            max_payload,
            banner,
            tls,
        } = negotiated;

        let (reader, writer) = split(transport);
        let cancel = CancellationToken::new();

        let inner = Arc::new(ConnectionInner {
            writer: AsyncMutex::new(Some(writer)),
            streams: Mutex::new(StreamMap::default()),
            pending: Mutex::new(PendingMap::default()),
            next_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            version,
            max_payload,
            banner,
            tls,
            open_timeout: options.open_timeout,
        });

        tokio::spawn(Self::run_reader(
            Arc::downgrade(&inner),
            reader,
            cancel,
            options.max_payload,
        ));

        Self { inner }
    }

    /// Opens a stream to `destination` with the configured open timeout.
    ///
    /// # Errors
    ///
    /// See [`Connection::open_with_timeout`].
    pub async fn open(&self, destination: &str, handler: StreamHandler) -> Result<Stream> {
        self.open_with_timeout(destination, handler, self.inner.open_timeout)
            .await
    }

    /// Opens a stream to `destination`, e.g. `"tcp:9222"` or
    /// `"localabstract:webview_devtools_remote_1234"`.
    ///
    /// On any failure the stream is removed and its close callback runs.
    ///
    /// # Errors
    ///
    /// - [`Error::OpenTimeout`] if the peer does not answer in time; the
    ///   connection stays usable
    /// - [`Error::StreamClosed`] if the peer refuses the destination
    /// - [`Error::ConnectionClosed`] if the connection closes first
    pub async fn open_with_timeout(
        &self,
        destination: &str,
        handler: StreamHandler,
        open_timeout: Duration,
    ) -> Result<Stream> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let local_id = inner.allocate_id();
        let stream = Arc::new(StreamInner::new(local_id, handler));
        let (tx, rx) = oneshot::channel();

        inner.streams.lock().insert(local_id, Arc::clone(&stream));
        inner.pending.lock().insert(local_id, tx);
        let registration = PendingOpen::new(Arc::clone(inner), stream);

        // close() may have drained the tables before our inserts
        if inner.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let mut payload = destination.as_bytes().to_vec();
        payload.push(0);
        let open = Frame::new(Command::Open, local_id.as_u32(), 0, payload);

        inner.send(&open).await?;
        debug!(%local_id, destination, "Sent OPEN");

        let outcome = match timeout(open_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::open_timeout(
                local_id,
                destination,
                open_timeout.as_millis() as u64,
            )),
        };

        match outcome {
            Ok(remote_id) => {
                debug!(%local_id, %remote_id, destination, "Stream opened");
                Ok(Stream::new(registration.complete(), Arc::downgrade(inner)))
            }
            Err(e) => {
                warn!(%local_id, destination, error = %e, "Open failed");
                Err(e)
            }
        }
    }

    /// Closes `stream`; same as [`Stream::close`].
    pub async fn close_stream(&self, stream: &Stream) {
        stream.close().await;
    }

    /// Closes the connection.
    ///
    /// Stops the reader, fails pending opens with
    /// [`Error::ConnectionClosed`], closes every stream and shuts the
    /// transport down. Further calls do nothing.
    pub async fn close(&self) {
        self.inner.shutdown("closed by caller").await;
    }

    /// Returns `true` once the connection has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Returns the negotiated maximum payload.
    #[inline]
    #[must_use]
    pub fn max_payload(&self) -> u32 {
        self.inner.max_payload
    }

    /// Returns the protocol version announced by the peer.
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.inner.version
    }

    /// Returns the peer's identity banner.
    #[inline]
    #[must_use]
    pub fn banner(&self) -> &str {
        &self.inner.banner
    }

    /// Returns `true` if the transport was upgraded to TLS.
    #[inline]
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.inner.tls
    }

    /// Returns the number of open streams.
    #[inline]
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Returns the number of opens awaiting the peer's answer.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Reader loop; exits on cancellation, transport error, or once every
    /// [`Connection`] handle is gone.
    async fn run_reader(
        inner: Weak<ConnectionInner>,
        mut reader: ReadHalf<BoxedTransport>,
        cancel: CancellationToken,
        max_payload: u32,
    ) {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = read_frame(&mut reader, max_payload) => result,
            };

            let Some(connection) = inner.upgrade() else {
                break;
            };

            match result {
                Ok(frame) => connection.dispatch(frame).await,
                Err(Error::ConnectionClosed) => {
                    connection.shutdown("peer hung up").await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Bridge read failed");
                    connection.shutdown("read error").await;
                    break;
                }
            }
        }

        debug!("Reader task terminated");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("banner", &self.inner.banner)
            .field("max_payload", &self.inner.max_payload)
            .field("tls", &self.inner.tls)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
