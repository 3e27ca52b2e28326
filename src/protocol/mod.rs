//! Bridge wire protocol.
//!
//! This module defines the binary frame format spoken with the debug-bridge
//! daemon.
//!
//! # Protocol Overview
//!
//! | Command | arg0 | arg1 | payload |
//! |---------|------|------|---------|
//! | `CNXN` | version | max payload | `"host::\0"` or device banner |
//! | `STLS` | TLS version | 0 | none |
//! | `AUTH` | token / signature / public key | 0 | sub-type bytes |
//! | `OPEN` | sender's local id | 0 | destination + NUL |
//! | `OKAY` | sender's id | peer's id | none |
//! | `WRTE` | sender's id | peer's id | stream data |
//! | `CLSE` | sender's id | peer's id | none |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Command codes and protocol constants |
//! | `frame` | Frame header, encode/decode, async read/write |

// ============================================================================
// Submodules
// ============================================================================

/// Command codes and protocol constants.
pub mod command;

/// Frame encoding and decoding.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{AuthType, Command, HOST_BANNER, MAX_PAYLOAD, PROTOCOL_VERSION, TLS_VERSION};
pub use frame::{Frame, FrameHeader, HEADER_LEN, checksum, read_frame, write_frame};
