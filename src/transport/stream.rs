//! Logical streams multiplexed over one connection.
//!
//! A stream is identified by the pair of ids each side allocated for it. The
//! local id is ours and never changes; the remote id is learned from the
//! peer's first READY.
//!
//! # Write Credit
//!
//! Each stream may have one unacknowledged WRITE in flight. [`Stream::write`]
//! takes the credit before sending a chunk; the peer's READY gives it back.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::identifiers::{LocalId, RemoteId};

use super::connection::ConnectionInner;

// ============================================================================
// Types
// ============================================================================

/// Data callback, invoked on the connection's reader task for every WRITE.
pub type DataCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Close callback, invoked at most once per stream.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

// ============================================================================
// StreamHandler
// ============================================================================

/// Callbacks attached to a stream when it is opened.
///
/// The data callback runs on the reader task; the READY acknowledgement for a
/// WRITE is sent after it returns, so it should hand data off rather than
/// block.
pub struct StreamHandler {
    on_data: DataCallback,
    on_close: Mutex<Option<CloseCallback>>,
}

impl StreamHandler {
    /// Creates a handler from a data callback and a close callback.
    pub fn new<D, C>(on_data: D, on_close: C) -> Self
    where
        D: Fn(Vec<u8>) + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        Self {
            on_data: Box::new(on_data),
            on_close: Mutex::new(Some(Box::new(on_close))),
        }
    }

    /// Creates a handler that only receives data.
    pub fn on_data<D>(on_data: D) -> Self
    where
        D: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        Self {
            on_data: Box::new(on_data),
            on_close: Mutex::new(None),
        }
    }

    /// Creates a handler that discards everything.
    #[must_use]
    pub fn noop() -> Self {
        Self::on_data(|_| {})
    }
}

impl fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandler")
            .field("has_close_callback", &self.on_close.lock().is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// StreamInner
// ============================================================================

/// Per-stream state shared between the connection's table and [`Stream`]
/// handles.
pub(crate) struct StreamInner {
    local_id: LocalId,
    remote_id: AtomicU32,
    closed: AtomicBool,
    credit: Semaphore,
    handler: StreamHandler,
}

impl StreamInner {
    pub(crate) fn new(local_id: LocalId, handler: StreamHandler) -> Self {
        Self {
            local_id,
            remote_id: AtomicU32::new(RemoteId::UNASSIGNED.as_u32()),
            closed: AtomicBool::new(false),
            credit: Semaphore::new(1),
            handler,
        }
    }

    #[inline]
    pub(crate) fn local_id(&self) -> LocalId {
        self.local_id
    }

    #[inline]
    pub(crate) fn remote_id(&self) -> RemoteId {
        RemoteId::new(self.remote_id.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_remote_id(&self, remote_id: RemoteId) {
        self.remote_id.store(remote_id.as_u32(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the stream closed. Returns `true` only for the call that
    /// actually closed it.
    pub(crate) fn latch_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.credit.close();
        }
        first
    }

    pub(crate) fn deliver(&self, data: Vec<u8>) {
        (self.handler.on_data)(data);
    }

    /// Runs the close callback if it has not run yet.
    pub(crate) fn fire_close(&self) {
        let callback = self.handler.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Waits for the write credit and consumes it.
    pub(crate) async fn take_credit(&self) -> Result<()> {
        let permit = self
            .credit
            .acquire()
            .await
            .map_err(|_| Error::stream_closed(self.local_id))?;
        permit.forget();
        Ok(())
    }

    /// Gives the write credit back after the peer acknowledged a WRITE.
    pub(crate) fn restore_credit(&self) {
        if !self.is_closed() && self.credit.available_permits() == 0 {
            self.credit.add_permits(1);
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

/// Handle to an open logical stream.
///
/// Cloning is cheap. The handle only holds a weak reference to its
/// connection; once the connection is gone, writes fail with
/// [`Error::ConnectionClosed`].
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
    connection: Weak<ConnectionInner>,
}

impl Stream {
    pub(crate) fn new(inner: Arc<StreamInner>, connection: Weak<ConnectionInner>) -> Self {
        Self { inner, connection }
    }

    /// Returns our id for this stream.
    #[inline]
    #[must_use]
    pub fn local_id(&self) -> LocalId {
        self.inner.local_id()
    }

    /// Returns the peer's id for this stream.
    #[inline]
    #[must_use]
    pub fn remote_id(&self) -> RemoteId {
        self.inner.remote_id()
    }

    /// Returns `true` once the stream has been closed by either side.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Sends `data`, split into chunks of the negotiated maximum payload.
    ///
    /// Each chunk waits for the previous one to be acknowledged.
    ///
    /// # Errors
    ///
    /// - [`Error::StreamClosed`] if the stream is or becomes closed
    /// - [`Error::ConnectionClosed`] if the connection is gone
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let connection = self.connection.upgrade().ok_or(Error::ConnectionClosed)?;
        connection.write_stream(&self.inner, data).await
    }

    /// Closes the stream.
    ///
    /// Idempotent: only the first call sends CLOSE and runs the close
    /// callback.
    pub async fn close(&self) {
        match self.connection.upgrade() {
            Some(connection) => connection.close_stream(&self.inner).await,
            None => {
                if self.inner.latch_closed() {
                    self.inner.fire_close();
                }
            }
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("local_id", &self.local_id())
            .field("remote_id", &self.remote_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
