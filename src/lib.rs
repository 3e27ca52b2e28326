//! Devtools Bridge - debug-bridge client and web-view devtools injector.
//!
//! This library speaks the device debug-bridge wire protocol over TCP (with
//! optional TLS), multiplexes logical streams over one connection, and
//! forwards local TCP ports to on-device destinations such as a web view's
//! `webview_devtools_remote_<pid>` socket.
//!
//! # Architecture
//!
//! The client follows a single-reader model:
//!
//! - **Connection**: one transport, one reader task, one serialized writer
//! - **Streams**: identified by a local id (ours) and a remote id (peer's),
//!   with exactly one outstanding `WRTE` per stream
//! - **Forwarding**: each accepted local socket gets its own stream
//! - **Relay**: a privileged helper process can bridge TCP to local-domain
//!   sockets directly when no daemon is reachable
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use devtools_bridge::{ConnectionBuilder, ForwardHandle, KeyProvider, Result};
//!
//! async fn forward(keys: Arc<dyn KeyProvider>) -> Result<()> {
//!     let connection = ConnectionBuilder::new()
//!         .host("127.0.0.1")
//!         .port(5555)
//!         .key_provider(keys)
//!         .connect()
//!         .await?;
//!
//!     let forward = ForwardHandle::bind(
//!         connection.clone(),
//!         "127.0.0.1:0",
//!         "localabstract:webview_devtools_remote_4321",
//!     )
//!     .await?;
//!     println!("devtools at http://{}/json/list", forward.local_addr());
//!
//!     forward.close().await;
//!     connection.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`devtools`] | `/json/list`, minimal WebSocket client, script injection |
//! | [`discovery`] | Parsers for `/proc` text |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`forward`] | Local TCP port to remote destination forwarding |
//! | [`identifiers`] | Type-safe stream id wrappers |
//! | [`protocol`] | Bridge frame format and commands |
//! | [`relay`] | TCP to local-domain socket relay and its launcher |
//! | [`transport`] | Handshake, connection, stream multiplexer |

// ============================================================================
// Modules
// ============================================================================

/// Devtools client: page listing, WebSocket, injection.
pub mod devtools;

/// On-device discovery parsers.
pub mod discovery;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Port forwarding over a bridge connection.
pub mod forward;

/// Type-safe identifiers for streams.
///
/// Newtype wrappers keep local and remote ids apart at compile time.
pub mod identifiers;

/// Bridge wire protocol.
pub mod protocol;

/// Local-domain socket relay.
pub mod relay;

/// Bridge transport: handshake, connection, streams.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Transport types
pub use transport::{
    ClientOptions, Connection, ConnectionBuilder, KeyProvider, Stream, StreamHandler,
};

// Forwarding and relay
pub use forward::ForwardHandle;
pub use relay::{Relay, RelayProcess, RelayTarget};

// Devtools types
pub use devtools::{InjectionResult, PageInfo, Route, TargetPage};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{LocalId, RemoteId};
