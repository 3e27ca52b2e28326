//! Bridge transport layer.
//!
//! This module owns the connection to the debug-bridge daemon: the
//! handshake, and the multiplexing of logical streams over one socket.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  Stream (Rust)  │                              │  Bridge daemon  │
//! │  Stream         │      one TCP (or TLS)        │                 │
//! │  Stream         │◄────────────────────────────►│  tcp:9222       │
//! │  → Connection   │   OPEN / OKAY / WRTE / CLSE  │  localabstract: │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `ConnectionBuilder::connect` - TCP connect, then `Handshake::run`
//! 2. `Connection::open` - Open a stream to a device-side destination
//! 3. `Stream::write` / data callback - Exchange bytes
//! 4. `Connection::close` - Fail pending opens, close streams
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `auth` | Key provider capability |
//! | `builder` | Validated TCP connection builder |
//! | `connection` | Multiplexer and reader task |
//! | `handshake` | CONNECT / STLS / AUTH state machine |
//! | `io` | Type-erased transport |
//! | `options` | Timeouts and payload limit |
//! | `stream` | Stream handles and callbacks |

// ============================================================================
// Submodules
// ============================================================================

/// Key provider capability.
pub mod auth;

/// Connection builder.
pub mod builder;

/// Multiplexed connection.
pub mod connection;

/// Handshake state machine.
pub mod handshake;

/// Type-erased transport.
pub mod io;

/// Connection options.
pub mod options;

/// Logical streams.
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use auth::KeyProvider;
pub use builder::ConnectionBuilder;
pub use connection::Connection;
pub use handshake::{Handshake, HandshakeState, Negotiated};
pub use io::{BoxedTransport, Transport};
pub use options::{ClientOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_OPEN_TIMEOUT};
pub use stream::{CloseCallback, DataCallback, Stream, StreamHandler};
