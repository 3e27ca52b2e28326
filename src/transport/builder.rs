//! Builder for bridge connections.
//!
//! # Example
//!
//! ```ignore
//! use devtools_bridge::ConnectionBuilder;
//!
//! let connection = ConnectionBuilder::new()
//!     .host("127.0.0.1")
//!     .port(5555)
//!     .key_provider(key)
//!     .connect()
//!     .await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::MAX_PAYLOAD;

use super::auth::KeyProvider;
use super::connection::Connection;
use super::options::ClientOptions;

// ============================================================================
// ConnectionBuilder
// ============================================================================

/// Builder for a [`Connection`] to a bridge daemon over TCP.
#[derive(Default, Clone)]
pub struct ConnectionBuilder {
    /// Daemon host.
    host: Option<String>,
    /// Daemon port.
    port: Option<u16>,
    /// Identity used during the handshake.
    key_provider: Option<Arc<dyn KeyProvider>>,
    /// Timeouts and payload limit.
    options: ClientOptions,
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("key_provider", &self.key_provider.is_some())
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// ConnectionBuilder Implementation
// ============================================================================

impl ConnectionBuilder {
    /// Creates a builder with no configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the daemon host.
    #[inline]
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the daemon port.
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the key provider used to answer AUTH and STLS.
    #[inline]
    #[must_use]
    pub fn key_provider(mut self, key_provider: Arc<dyn KeyProvider>) -> Self {
        self.key_provider = Some(key_provider);
        self
    }

    /// Replaces the connection options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Connects over TCP and runs the handshake.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if host, port or key provider is missing, or an
    ///   option is out of range
    /// - [`Error::ConnectionTimeout`] if the TCP connect exceeds the timeout
    /// - [`Error::Io`] if the TCP connect fails
    /// - any handshake error
    pub async fn connect(self) -> Result<Connection> {
        let (host, port) = self.validate_address()?;
        let key_provider = self.validate_key_provider()?;
        self.validate_options()?;

        let connect_timeout = self.options.connect_timeout;
        let tcp = timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| Error::connection_timeout(connect_timeout.as_millis() as u64))??;
        tcp.set_nodelay(true)?;
        debug!(%host, port, "TCP connected");

        Connection::handshake(Box::new(tcp), &host, key_provider.as_ref(), &self.options).await
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ConnectionBuilder {
    fn validate_address(&self) -> Result<(String, u16)> {
        let host = self.host.clone().ok_or_else(|| {
            Error::config(
                "Daemon host is required. Use .host() to set it.\n\
                 Example: ConnectionBuilder::new().host(\"127.0.0.1\")",
            )
        })?;

        if host.trim().is_empty() {
            return Err(Error::config("Daemon host must not be empty"));
        }

        match self.port {
            Some(0) => Err(Error::config("Daemon port must not be 0")),
            Some(port) => Ok((host, port)),
            None => Err(Error::config(
                "Daemon port is required. Use .port() to set it.\n\
                 Example: ConnectionBuilder::new().port(5555)",
            )),
        }
    }

    fn validate_key_provider(&self) -> Result<Arc<dyn KeyProvider>> {
        self.key_provider.clone().ok_or_else(|| {
            Error::config("Key provider is required. Use .key_provider() to set it.")
        })
    }

    fn validate_options(&self) -> Result<()> {
        let options = &self.options;

        if options.max_payload == 0 || options.max_payload > MAX_PAYLOAD {
            return Err(Error::config(format!(
                "max_payload must be in 1..={MAX_PAYLOAD}, got {}",
                options.max_payload
            )));
        }

        if options.connect_timeout.is_zero() || options.open_timeout.is_zero() {
            return Err(Error::config("Timeouts must be greater than zero"));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
