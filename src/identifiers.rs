//! Type-safe stream identifiers.
//!
//! Every stream multiplexed over a connection is named by a pair of ids:
//! the one this side allocated ([`LocalId`]) and the one the peer assigned
//! when it accepted the stream ([`RemoteId`]). Both travel in the `arg0` /
//! `arg1` header fields, so mixing them up silently misroutes data; the
//! newtypes make that a compile error.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// LocalId
// ============================================================================

/// Stream id allocated by this side of the connection.
///
/// Allocated from a per-connection counter starting at 1; never reused
/// while the connection is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(u32);

impl LocalId {
    /// Creates a local id from its wire value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the wire value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// RemoteId
// ============================================================================

/// Stream id assigned by the peer.
///
/// Zero until the peer acknowledges the OPEN with READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RemoteId(u32);

impl RemoteId {
    /// Placeholder used before the peer has accepted the stream.
    pub const UNASSIGNED: Self = Self(0);

    /// Creates a remote id from its wire value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the wire value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` once the peer has assigned an id.
    #[inline]
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
