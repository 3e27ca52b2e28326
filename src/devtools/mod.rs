//! Remote-debugging (devtools) client.
//!
//! Talks to the devtools endpoint of a web view once a local TCP port reaches
//! it, through [`crate::forward`] or [`crate::relay`].
//!
//! # Flow
//!
//! ```text
//! GET /json/list ──► pages with http(s) URLs ──► WebSocket upgrade
//!                                                   │
//!                                   Runtime.evaluate(script) ──► one reply (logged)
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `inject` | Per-process, per-page injection orchestration |
//! | `pages` | `/json/list` model and fetch |
//! | `websocket` | Minimal masked-text-frame WebSocket client |

// ============================================================================
// Submodules
// ============================================================================

/// Injection orchestration.
pub mod inject;

/// Page listing.
pub mod pages;

/// Minimal WebSocket client.
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use inject::{
    InjectionResult, RelayCommand, Route, VCONSOLE_SCRIPT, all_succeeded, discover_pages,
    inject_pages, runtime_evaluate,
};
pub use pages::{PageInfo, TargetPage, list_pages, list_targets};
pub use websocket::{DevtoolsSocket, Reply, encode_text_frame, send_command};
