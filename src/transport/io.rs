//! Type-erased byte transport.
//!
//! The handshake may swap a plain TCP socket for a TLS session layered over
//! the same socket; everything after it only needs "something that reads and
//! writes bytes".

use tokio::io::{AsyncRead, AsyncWrite};

/// Bidirectional byte transport usable from any task.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed [`Transport`].
pub type BoxedTransport = Box<dyn Transport>;
