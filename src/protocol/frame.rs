//! Frame encoding and decoding.
//!
//! # Format
//!
//! ```text
//! ┌─────────┬──────┬──────┬─────────────┬──────────┬───────┬─────────┐
//! │ command │ arg0 │ arg1 │ payload_len │ checksum │ magic │ payload │
//! │   u32   │ u32  │ u32  │     u32     │   u32    │  u32  │  bytes  │
//! └─────────┴──────┴──────┴─────────────┴──────────┴───────┴─────────┘
//!  all header fields little-endian, 24 bytes total
//! ```
//!
//! `checksum` is the wrapping sum of the payload bytes, `magic` is
//! `!command`. Frames failing either check are rejected before dispatch.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Error, Result};

use super::command::{AuthType, Command};

// ============================================================================
// Constants
// ============================================================================

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 24;

// ============================================================================
// Frame
// ============================================================================

/// One unit of wire transmission.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// First argument; meaning depends on the command.
    pub arg0: u32,
    /// Second argument; meaning depends on the command.
    pub arg1: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame with a payload.
    #[inline]
    #[must_use]
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    /// Creates a frame without payload.
    #[inline]
    #[must_use]
    pub fn empty(command: Command, arg0: u32, arg1: u32) -> Self {
        Self::new(command, arg0, arg1, Vec::new())
    }

    /// Creates an AUTH frame.
    #[inline]
    #[must_use]
    pub fn auth(auth_type: AuthType, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Command::Auth, auth_type.code(), 0, payload)
    }

    /// Returns the AUTH sub-type, if this is an AUTH frame with a known one.
    #[inline]
    #[must_use]
    pub fn auth_type(&self) -> Option<AuthType> {
        match self.command {
            Command::Auth => AuthType::from_code(self.arg0),
            _ => None,
        }
    }

    /// Wrapping sum of the payload bytes.
    #[inline]
    #[must_use]
    pub fn checksum(&self) -> u32 {
        checksum(&self.payload)
    }

    /// Bitwise complement of the command code.
    #[inline]
    #[must_use]
    pub fn magic(&self) -> u32 {
        !self.command.code()
    }

    /// Encodes header and payload into one buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadTooLarge`] if the payload length does not fit
    /// in the 32-bit length field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| Error::payload_too_large(self.payload.len(), u32::MAX as usize))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.command.code().to_le_bytes());
        buf.extend_from_slice(&self.arg0.to_le_bytes());
        buf.extend_from_slice(&self.arg1.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.checksum().to_le_bytes());
        buf.extend_from_slice(&self.magic().to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes one complete frame from a buffer.
    ///
    /// The buffer must hold exactly one header plus its payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] on truncation, trailing bytes, or a failed
    /// magic/checksum check.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header_bytes: &[u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| Error::frame(format!("truncated header: {} bytes", bytes.len())))?;

        let header = FrameHeader::parse(header_bytes);
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != header.payload_len as usize {
            return Err(Error::frame(format!(
                "payload length mismatch for {}: header says {}, got {}",
                header.command(),
                header.payload_len,
                payload.len()
            )));
        }

        header.into_frame(payload.to_vec())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}, {}, {} bytes)",
            self.command,
            self.arg0,
            self.arg1,
            self.payload.len()
        )
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// FrameHeader
// ============================================================================

/// Raw header as read from the wire, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw command code.
    pub command: u32,
    /// First argument.
    pub arg0: u32,
    /// Second argument.
    pub arg1: u32,
    /// Declared payload length.
    pub payload_len: u32,
    /// Declared checksum.
    pub checksum: u32,
    /// Declared magic.
    pub magic: u32,
}

impl FrameHeader {
    /// Parses the 24 header bytes.
    #[must_use]
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        let field = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };

        Self {
            command: field(0),
            arg0: field(1),
            arg1: field(2),
            payload_len: field(3),
            checksum: field(4),
            magic: field(5),
        }
    }

    /// Returns the decoded command.
    #[inline]
    #[must_use]
    pub fn command(&self) -> Command {
        Command::from_code(self.command)
    }

    /// Checks magic and checksum against the payload and builds the frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Frame`] naming the offending frame.
    pub fn into_frame(self, payload: Vec<u8>) -> Result<Frame> {
        let frame = Frame {
            command: self.command(),
            arg0: self.arg0,
            arg1: self.arg1,
            payload,
        };

        if self.magic != !self.command {
            return Err(Error::frame(format!(
                "bad magic {:#010x} for {frame:?}",
                self.magic
            )));
        }

        let actual = frame.checksum();
        if self.checksum != actual {
            return Err(Error::frame(format!(
                "bad checksum for {frame:?}: header {:#010x}, payload {actual:#010x}",
                self.checksum
            )));
        }

        Ok(frame)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Wrapping sum of all bytes.
#[inline]
#[must_use]
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)))
}

/// Reads and validates one frame.
///
/// EOF before any header byte surfaces as [`Error::ConnectionClosed`]; a
/// short read anywhere after that is a fatal [`Error::Frame`].
///
/// # Errors
///
/// - [`Error::ConnectionClosed`] if the reader is at EOF
/// - [`Error::Frame`] on truncation, oversized payload, bad magic or checksum
/// - [`Error::Io`] on transport failure
pub async fn read_frame<R>(reader: &mut R, max_payload: u32) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_bytes = [0u8; HEADER_LEN];

    let first = reader.read(&mut header_bytes).await?;
    if first == 0 {
        return Err(Error::ConnectionClosed);
    }
    if first < HEADER_LEN {
        reader
            .read_exact(&mut header_bytes[first..])
            .await
            .map_err(|e| truncated(e, "header"))?;
    }

    let header = FrameHeader::parse(&header_bytes);
    if header.payload_len > max_payload {
        return Err(Error::frame(format!(
            "{}({}, {}) declares {} payload bytes, limit is {max_payload}",
            header.command(),
            header.arg0,
            header.arg1,
            header.payload_len
        )));
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| truncated(e, "payload"))?;

    let frame = header.into_frame(payload)?;
    trace!(frame = ?frame, "read");
    Ok(frame)
}

/// Encodes and writes one frame, then flushes.
///
/// # Errors
///
/// Returns [`Error::Io`] on transport failure.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    trace!(frame = ?frame, "write");
    Ok(())
}

fn truncated(err: std::io::Error, part: &str) -> Error {
    if err.kind() == ErrorKind::UnexpectedEof {
        Error::frame(format!("truncated {part}"))
    } else {
        Error::Io(err)
    }
}

// ============================================================================
// Tests
// ============================================================================
