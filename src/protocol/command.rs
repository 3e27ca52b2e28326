//! Wire command codes and their argument constants.
//!
//! Command codes are four ASCII characters packed little-endian, so the
//! raw header bytes read as `CNXN`, `OKAY`, `WRTE`, ... in a hex dump.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version sent in CONNECT.
pub const PROTOCOL_VERSION: u32 = 0x0100_0000;

/// Maximum payload this side accepts, advertised in CONNECT.
pub const MAX_PAYLOAD: u32 = 0x0010_0000;

/// TLS version sent when acknowledging START_TLS.
pub const TLS_VERSION: u32 = 0x0100_0000;

/// System identity sent in the CONNECT payload.
pub const HOST_BANNER: &str = "host::\0";

// ============================================================================
// Command
// ============================================================================

/// Frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `CNXN`: connection request / acceptance.
    Connect,
    /// `AUTH`: challenge, signature or public key.
    Auth,
    /// `OPEN`: request a new stream.
    Open,
    /// `OKAY`: stream accepted, or write acknowledged.
    Ready,
    /// `WRTE`: stream data.
    Write,
    /// `CLSE`: stream closed.
    Close,
    /// `STLS`: upgrade the transport to TLS.
    StartTls,
    /// Any code this client does not speak.
    Unknown(u32),
}

impl Command {
    /// Raw code of `CNXN`.
    pub const CONNECT: u32 = 0x4e58_4e43;
    /// Raw code of `AUTH`.
    pub const AUTH: u32 = 0x4854_5541;
    /// Raw code of `OPEN`.
    pub const OPEN: u32 = 0x4e45_504f;
    /// Raw code of `OKAY`.
    pub const READY: u32 = 0x5941_4b4f;
    /// Raw code of `WRTE`.
    pub const WRITE: u32 = 0x4554_5257;
    /// Raw code of `CLSE`.
    pub const CLOSE: u32 = 0x4553_4c43;
    /// Raw code of `STLS`.
    pub const START_TLS: u32 = 0x534c_5453;

    /// Decodes a raw command code.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            Self::CONNECT => Self::Connect,
            Self::AUTH => Self::Auth,
            Self::OPEN => Self::Open,
            Self::READY => Self::Ready,
            Self::WRITE => Self::Write,
            Self::CLOSE => Self::Close,
            Self::START_TLS => Self::StartTls,
            other => Self::Unknown(other),
        }
    }

    /// Returns the raw command code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Connect => Self::CONNECT,
            Self::Auth => Self::AUTH,
            Self::Open => Self::OPEN,
            Self::Ready => Self::READY,
            Self::Write => Self::WRITE,
            Self::Close => Self::CLOSE,
            Self::StartTls => Self::START_TLS,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("CNXN"),
            Self::Auth => f.write_str("AUTH"),
            Self::Open => f.write_str("OPEN"),
            Self::Ready => f.write_str("OKAY"),
            Self::Write => f.write_str("WRTE"),
            Self::Close => f.write_str("CLSE"),
            Self::StartTls => f.write_str("STLS"),
            Self::Unknown(code) => write!(f, "{code:#010x}"),
        }
    }
}

// ============================================================================
// AuthType
// ============================================================================

/// Sub-type carried in `arg0` of an AUTH frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Challenge sent by the peer.
    Token,
    /// Signature over a token.
    Signature,
    /// Public key offered for a one-time trust decision.
    PublicKey,
}

impl AuthType {
    /// Decodes the AUTH sub-type.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Token),
            2 => Some(Self::Signature),
            3 => Some(Self::PublicKey),
            _ => None,
        }
    }

    /// Returns the wire value.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Token => 1,
            Self::Signature => 2,
            Self::PublicKey => 3,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
