//! Error types for the debug bridge.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use devtools_bridge::{Error, Result};
//!
//! async fn example(connection: &Connection) -> Result<()> {
//!     let stream = connection.open("tcp:9222", StreamHandler::noop()).await?;
//!     stream.write(b"GET / HTTP/1.0\r\n\r\n").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Effect |
//! |----------|----------|--------|
//! | Wire | [`Error::Frame`] | Fatal to the connection |
//! | Handshake | [`Error::Handshake`], [`Error::Tls`] | Fatal to the connection attempt |
//! | Streams | [`Error::OpenTimeout`], [`Error::StreamClosed`] | Only that stream |
//! | Connection | [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] | Connection is gone |
//! | Relay | [`Error::Relay`] | Only that accepted socket |
//! | Devtools | [`Error::WebSocketHandshake`], [`Error::PayloadTooLarge`] | Only that target |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`], [`Error::Url`] | Propagated |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::LocalId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when builder or option values are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Wire Errors
    // ========================================================================
    /// Malformed or truncated frame.
    ///
    /// Bad magic, bad checksum, oversized or short payload. Always fatal to
    /// the connection that read it.
    #[error("Frame error: {message}")]
    Frame {
        /// Description including the offending frame.
        message: String,
    },

    /// Protocol violation that is not a framing problem.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// Bridge handshake failed.
    ///
    /// Unexpected command at a handshake step, signing failure, or TLS not
    /// available from the key provider.
    #[error("Handshake failed: {message}")]
    Handshake {
        /// Description of the failure.
        message: String,
    },

    /// TLS upgrade failed.
    #[error("TLS error: {message}")]
    Tls {
        /// Description of the TLS failure.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Timed out connecting to the bridge daemon.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed, locally or by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Stream Errors
    // ========================================================================
    /// Peer did not answer an OPEN in time.
    ///
    /// The connection remains usable.
    #[error("Opening stream {local_id} to {destination} timed out after {timeout_ms}ms")]
    OpenTimeout {
        /// Local id that was allocated for the stream.
        local_id: LocalId,
        /// Requested destination.
        destination: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Stream was closed (or refused by the peer).
    #[error("Stream {local_id} closed")]
    StreamClosed {
        /// Local id of the closed stream.
        local_id: LocalId,
    },

    // ========================================================================
    // Relay Errors
    // ========================================================================
    /// Relay could not reach its local-domain target.
    #[error("Relay error: {message}")]
    Relay {
        /// Description of the relay failure.
        message: String,
    },

    // ========================================================================
    // Devtools Errors
    // ========================================================================
    /// WebSocket upgrade was refused by the devtools endpoint.
    #[error("WebSocket handshake failed: {status}")]
    WebSocketHandshake {
        /// Status line (or summary) returned by the server.
        status: String,
    },

    /// Payload does not fit the frame format.
    #[error("Payload of {len} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Maximum supported length.
        max: usize,
    },

    /// Operation timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket frame error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP error talking to the devtools endpoint.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a frame error.
    #[inline]
    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a TLS error.
    #[inline]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an open timeout error.
    #[inline]
    pub fn open_timeout(local_id: LocalId, destination: impl Into<String>, timeout_ms: u64) -> Self {
        Self::OpenTimeout {
            local_id,
            destination: destination.into(),
            timeout_ms,
        }
    }

    /// Creates a stream closed error.
    #[inline]
    pub fn stream_closed(local_id: LocalId) -> Self {
        Self::StreamClosed { local_id }
    }

    /// Creates a relay error.
    #[inline]
    pub fn relay(message: impl Into<String>) -> Self {
        Self::Relay {
            message: message.into(),
        }
    }

    /// Creates a WebSocket handshake error.
    #[inline]
    pub fn websocket_handshake(status: impl Into<String>) -> Self {
        Self::WebSocketHandshake {
            status: status.into(),
        }
    }

    /// Creates a payload too large error.
    #[inline]
    pub fn payload_too_large(len: usize, max: usize) -> Self {
        Self::PayloadTooLarge { len, max }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::OpenTimeout { .. } | Self::Timeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::Frame { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if the connection that produced this error is still
    /// usable.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OpenTimeout { .. }
                | Self::StreamClosed { .. }
                | Self::Relay { .. }
                | Self::Timeout { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
