//! Client connection options.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use devtools_bridge::ClientOptions;
//!
//! let options = ClientOptions::new()
//!     .with_connect_timeout(Duration::from_secs(3))
//!     .with_open_timeout(Duration::from_secs(5));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::protocol::MAX_PAYLOAD;

// ============================================================================
// Constants
// ============================================================================

/// Default bound on establishing the TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on waiting for the peer to answer an OPEN.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ClientOptions
// ============================================================================

/// Tunables for a bridge connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Bound on the TCP connect.
    pub connect_timeout: Duration,

    /// Bound on each stream open.
    pub open_timeout: Duration,

    /// Largest payload we announce and accept.
    pub max_payload: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ClientOptions {
    /// Creates options with the default timeouts and payload limit.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            max_payload: MAX_PAYLOAD,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ClientOptions {
    /// Sets the TCP connect timeout.
    #[inline]
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the stream open timeout.
    #[inline]
    #[must_use]
    pub const fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Sets the maximum payload announced in CONNECT.
    ///
    /// Values above the protocol maximum are rejected by
    /// [`ConnectionBuilder`](super::ConnectionBuilder).
    #[inline]
    #[must_use]
    pub const fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ClientOptions::new();
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.open_timeout, Duration::from_secs(10));
        assert_eq!(options.max_payload, MAX_PAYLOAD);
        assert_eq!(options, ClientOptions::default());
    }

    #[test]
    fn test_builder_chain() {
        let options = ClientOptions::new()
            .with_connect_timeout(Duration::from_secs(2))
            .with_open_timeout(Duration::from_millis(500))
            .with_max_payload(4096);

        assert_eq!(options.connect_timeout, Duration::from_secs(2));
        assert_eq!(options.open_timeout, Duration::from_millis(500));
        assert_eq!(options.max_payload, 4096);
    }
}
