//! Minimal WebSocket client for devtools commands.
//!
//! Only what one command needs: the HTTP upgrade, one masked text frame out,
//! and one best-effort reply read for logging. There is no ping/pong,
//! fragmentation, or closing handshake.
//!
//! # Frame Layout (client → server)
//!
//! | Bytes | Content |
//! |-------|---------|
//! | 0 | `0x81` (FIN + text) |
//! | 1 | `0x80 \| len` if `len <= 125`, else `0x80 \| 126` |
//! | 2..4 | `len` big-endian, only if `len > 125` |
//! | next 4 | mask |
//! | rest | payload XOR mask |

// ============================================================================
// Imports
// ============================================================================

use std::io::Cursor;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::FrameHeader;
use tokio_tungstenite::tungstenite::protocol::frame::coding::OpCode;
use tracing::{debug, trace, warn};
use url::{Host, Url};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Largest payload a single text frame can carry (16-bit length form only).
pub const MAX_TEXT_PAYLOAD: usize = u16::MAX as usize;

/// Default socket timeout for the upgrade and the reply read.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the upgrade response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Upper bound on a reply payload kept for logging.
const MAX_REPLY_PAYLOAD: u64 = 1024 * 1024;

// ============================================================================
// Frame Encoding
// ============================================================================

/// Encodes `payload` as a single masked text frame.
///
/// # Errors
///
/// [`Error::PayloadTooLarge`] if `payload` exceeds [`MAX_TEXT_PAYLOAD`].
pub fn encode_text_frame(payload: &[u8], mask: [u8; 4]) -> Result<Vec<u8>> {
    let len = payload.len();
    if len > MAX_TEXT_PAYLOAD {
        return Err(Error::payload_too_large(len, MAX_TEXT_PAYLOAD));
    }

    let mut frame = Vec::with_capacity(2 + 2 + 4 + len);
    frame.push(0x81);

    if len <= 125 {
        frame.push(0x80 | len as u8);
    } else {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    }

    frame.extend_from_slice(&mask);
    frame.extend(
        payload
            .iter()
            .zip(mask.iter().cycle())
            .map(|(byte, key)| byte ^ key),
    );

    Ok(frame)
}

/// Returns a fresh random mask.
#[must_use]
pub fn random_mask() -> [u8; 4] {
    let bytes = Uuid::new_v4().into_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Returns a fresh `Sec-WebSocket-Key` value.
#[must_use]
pub fn generate_key() -> String {
    BASE64.encode(Uuid::new_v4().as_bytes())
}

// ============================================================================
// Reply
// ============================================================================

/// A frame read back from the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Frame opcode.
    pub opcode: OpCode,
    /// Unmasked payload (possibly truncated for very large frames).
    pub payload: Vec<u8>,
}

impl Reply {
    /// Returns the payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// ============================================================================
// DevtoolsSocket
// ============================================================================

/// Upgraded WebSocket connection to a devtools target.
#[derive(Debug)]
pub struct DevtoolsSocket {
    stream: TcpStream,
    /// Bytes received after the upgrade response head.
    buffered: Vec<u8>,
    io_timeout: Duration,
}

impl DevtoolsSocket {
    /// Connects to `ws_url` and performs the upgrade.
    ///
    /// # Errors
    ///
    /// See [`DevtoolsSocket::connect_with_timeout`].
    pub async fn connect(ws_url: &str) -> Result<Self> {
        Self::connect_with_timeout(ws_url, DEFAULT_IO_TIMEOUT).await
    }

    /// Connects to `ws_url` and performs the upgrade, bounding each step by
    /// `io_timeout`.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] / [`Error::Config`] for a malformed or non-`ws` URL
    /// - [`Error::Timeout`] if connecting or the upgrade stalls
    /// - [`Error::WebSocketHandshake`] if the response is not `101`
    pub async fn connect_with_timeout(ws_url: &str, io_timeout: Duration) -> Result<Self> {
        let url = Url::parse(ws_url)?;
        if url.scheme() != "ws" {
            return Err(Error::config(format!(
                "unsupported WebSocket scheme {:?} in {ws_url}",
                url.scheme()
            )));
        }

        // IPv6 literals connect bare but appear bracketed in the Host header
        let (connect_host, host) = match url.host() {
            Some(Host::Domain(domain)) => (domain.to_string(), domain.to_string()),
            Some(Host::Ipv4(ip)) => (ip.to_string(), ip.to_string()),
            Some(Host::Ipv6(ip)) => (ip.to_string(), format!("[{ip}]")),
            None => return Err(Error::config(format!("WebSocket URL has no host: {ws_url}"))),
        };
        let port = url.port().unwrap_or(80);
        let path = request_target(&url);

        let stream = timeout(io_timeout, TcpStream::connect((connect_host.as_str(), port)))
            .await
            .map_err(|_| Error::timeout(format!("connect {host}:{port}"), millis(io_timeout)))??;
        stream.set_nodelay(true)?;

        let mut socket = Self {
            stream,
            buffered: Vec::new(),
            io_timeout,
        };

        let key = generate_key();
        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}:{port}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        socket.stream.write_all(request.as_bytes()).await?;

        let head = timeout(io_timeout, socket.read_response_head())
            .await
            .map_err(|_| Error::timeout("WebSocket upgrade", millis(io_timeout)))??;
        check_upgrade(&head, &key)?;

        debug!(%host, port, %path, "WebSocket upgraded");
        Ok(socket)
    }

    /// Sends `text` as one masked text frame.
    ///
    /// # Errors
    ///
    /// - [`Error::PayloadTooLarge`] above [`MAX_TEXT_PAYLOAD`]
    /// - [`Error::Io`] if the write fails
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        let frame = encode_text_frame(text.as_bytes(), random_mask())?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        trace!(len = text.len(), "Sent text frame");
        Ok(())
    }

    /// Reads one frame, giving up after `wait`.
    ///
    /// Best effort: any failure is logged and yields `None`.
    pub async fn read_reply(&mut self, wait: Duration) -> Option<Reply> {
        match timeout(wait, self.read_frame()).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(e)) => {
                debug!(error = %e, "No usable reply frame");
                None
            }
            Err(_) => {
                debug!(wait_ms = millis(wait), "No reply frame in time");
                None
            }
        }
    }

    /// Returns the configured socket timeout.
    #[inline]
    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        self.buffered.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    async fn read_response_head(&mut self) -> Result<String> {
        loop {
            if let Some(end) = find_head_end(&self.buffered) {
                let head = String::from_utf8_lossy(&self.buffered[..end]).into_owned();
                self.buffered.drain(..end + 4);
                return Ok(head);
            }
            if self.buffered.len() > MAX_RESPONSE_HEAD {
                return Err(Error::websocket_handshake("response head too large"));
            }
            self.fill().await.map_err(|e| match e {
                Error::ConnectionClosed => {
                    Error::websocket_handshake("connection closed during handshake")
                }
                other => other,
            })?;
        }
    }

    async fn read_frame(&mut self) -> Result<Reply> {
        let (header, len) = loop {
            let mut cursor = Cursor::new(self.buffered.as_slice());
            if let Some(parsed) = FrameHeader::parse(&mut cursor)? {
                let consumed = cursor.position() as usize;
                self.buffered.drain(..consumed);
                break parsed;
            }
            self.fill().await?;
        };

        let wanted = len.min(MAX_REPLY_PAYLOAD) as usize;
        while self.buffered.len() < wanted {
            self.fill().await?;
        }

        let mut payload: Vec<u8> = self.buffered.drain(..wanted).collect();
        if let Some(mask) = header.mask {
            for (byte, key) in payload.iter_mut().zip(mask.iter().cycle()) {
                *byte ^= key;
            }
        }

        Ok(Reply {
            opcode: header.opcode,
            payload,
        })
    }
}

/// Connects, sends `text`, and waits briefly for one reply.
///
/// The reply only serves diagnostics; its absence is not an error.
///
/// # Errors
///
/// Any error from [`DevtoolsSocket::connect`] or
/// [`DevtoolsSocket::send_text`].
pub async fn send_command(ws_url: &str, text: &str) -> Result<Option<Reply>> {
    let mut socket = DevtoolsSocket::connect(ws_url).await?;
    socket.send_text(text).await?;

    let reply = socket.read_reply(socket.io_timeout()).await;
    if let Some(reply) = &reply {
        debug!(opcode = ?reply.opcode, reply = %reply.text(), "Command reply");
    }
    Ok(reply)
}

// ============================================================================
// Helpers
// ============================================================================

fn request_target(url: &Url) -> String {
    let mut target = match url.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    };
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

fn check_upgrade(head: &str, key: &str) -> Result<()> {
    let status_line = head.lines().next().unwrap_or_default();
    let switching = status_line.split_whitespace().nth(1) == Some("101")
        || head.contains("WebSocket Protocol Handshake");

    if !switching {
        return Err(Error::websocket_handshake(status_line));
    }

    let expected = derive_accept_key(key.as_bytes());
    let accept = head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("sec-websocket-accept")
            .then(|| value.trim().to_string())
    });

    match accept {
        Some(accept) if accept == expected => {}
        Some(accept) => warn!(%accept, %expected, "Unexpected Sec-WebSocket-Accept"),
        None => warn!("Upgrade response has no Sec-WebSocket-Accept"),
    }

    Ok(())
}

#[inline]
fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::Data;

    use crate::devtools::testing::{FakeDevtools, server_text_frame};

    const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    fn parse_header(frame: &[u8]) -> (FrameHeader, u64, usize) {
        let mut cursor = Cursor::new(frame);
        let (header, len) = FrameHeader::parse(&mut cursor)
            .expect("valid header")
            .expect("complete header");
        (header, len, cursor.position() as usize)
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode_text_frame(b"", MASK).unwrap();
        assert_eq!(frame, vec![0x81, 0x80, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_single_byte_payload() {
        let frame = encode_text_frame(b"a", MASK).unwrap();
        assert_eq!(frame.len(), 2 + 4 + 1);
        assert_eq!(frame[1], 0x81);
        assert_eq!(frame[6], b'a' ^ 0x12);
    }

    #[test]
    fn test_seven_bit_length_boundary() {
        let frame = encode_text_frame(&[0u8; 125], MASK).unwrap();
        assert_eq!(frame[1], 0x80 | 125);
        assert_eq!(frame.len(), 2 + 4 + 125);
    }

    #[test]
    fn test_sixteen_bit_length() {
        let frame = encode_text_frame(&[0u8; 126], MASK).unwrap();
        assert_eq!(frame[1], 0x80 | 126);
        assert_eq!(&frame[2..4], &[0x00, 0x7e]);
        assert_eq!(&frame[4..8], &MASK);
        assert_eq!(frame.len(), 4 + 4 + 126);
    }

    #[test]
    fn test_largest_payload() {
        let frame = encode_text_frame(&vec![b'x'; 65_535], MASK).unwrap();
        assert_eq!(&frame[2..4], &[0xff, 0xff]);
        assert_eq!(frame.len(), 4 + 4 + 65_535);

        let (header, len, offset) = parse_header(&frame);
        assert_eq!(len, 65_535);
        assert_eq!(header.mask, Some(MASK));
        assert_eq!(offset, 8);
    }

    #[test]
    fn test_payload_too_large() {
        let err = encode_text_frame(&vec![0u8; 65_536], MASK).unwrap_err();
        assert!(matches!(
            err,
            Error::PayloadTooLarge {
                len: 65_536,
                max: 65_535
            }
        ));
    }

    #[test]
    fn test_mask_is_applied_cyclically() {
        let payload = b"Runtime.evaluate";
        let frame = encode_text_frame(payload, MASK).unwrap();

        let (header, len, offset) = parse_header(&frame);
        assert!(header.is_final);
        assert_eq!(header.opcode, OpCode::Data(Data::Text));
        assert_eq!(len as usize, payload.len());

        let unmasked: Vec<u8> = frame[offset..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ MASK[i % 4])
            .collect();
        assert_eq!(unmasked, payload);
    }

    #[test]
    fn test_generate_key_is_sixteen_bytes() {
        let key = generate_key();
        assert_eq!(BASE64.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_request_target() {
        let url = Url::parse("ws://127.0.0.1:9222/devtools/page/ABC?x=1").unwrap();
        assert_eq!(request_target(&url), "/devtools/page/ABC?x=1");

        let url = Url::parse("ws://localhost").unwrap();
        assert_eq!(request_target(&url), "/");
    }

    #[test]
    fn test_check_upgrade() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let head = "HTTP/1.1 101 Switching Protocols\r\n\
                    Upgrade: websocket\r\n\
                    sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
        assert!(check_upgrade(head, key).is_ok());

        // Wrong accept only warns.
        let head = "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: nope";
        assert!(check_upgrade(head, key).is_ok());

        let head = "HTTP/1.1 404 Not Found\r\nContent-Length: 0";
        let err = check_upgrade(head, key).unwrap_err();
        assert!(matches!(err, Error::WebSocketHandshake { ref status } if status.contains("404")));
    }

    #[tokio::test]
    async fn test_send_command_round_trip() {
        let server = FakeDevtools::start(serde_json::json!([])).await;

        let reply = send_command(&server.ws_url("PAGE1"), r#"{"id":1}"#)
            .await
            .expect("send")
            .expect("reply");

        assert_eq!(server.evaluated(), vec![r#"{"id":1}"#.to_string()]);
        assert!(reply.text().contains(r#""id":1"#));
    }

    #[tokio::test]
    async fn test_refused_upgrade() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await?;
            socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .await?;
            anyhow::Ok(())
        });

        let err = DevtoolsSocket::connect(&format!("ws://{addr}/devtools/page/X"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WebSocketHandshake { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_reply_read_is_best_effort() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await?;
            // Upgrade with an immediate frame in the same segment, then stall.
            let mut response = b"HTTP/1.1 101 Switching Protocols\r\n\r\n".to_vec();
            response.extend_from_slice(&server_text_frame(b"hello"));
            socket.write_all(&response).await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            anyhow::Ok(())
        });

        let mut socket = DevtoolsSocket::connect(&format!("ws://{addr}/")).await?;
        let first = socket.read_reply(Duration::from_millis(500)).await;
        assert_eq!(first.map(|r| r.text()), Some("hello".to_string()));

        assert!(socket.read_reply(Duration::from_millis(50)).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_connects_to_ipv6_literal() -> anyhow::Result<()> {
        // Hosts without IPv6 loopback have nothing to test.
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            return Ok(());
        };
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await?;
            socket
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
                .await?;
            anyhow::Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
        });

        let url = format!("ws://[::1]:{}/devtools/page/V6", addr.port());
        DevtoolsSocket::connect(&url).await?;

        let request = server.await??;
        assert!(request.starts_with("GET /devtools/page/V6 HTTP/1.1\r\n"));
        assert!(request.contains(&format!("Host: [::1]:{}\r\n", addr.port())));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_secure_scheme() {
        let err = DevtoolsSocket::connect("wss://127.0.0.1:9222/devtools/page/X")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let err = DevtoolsSocket::connect("not a url").await.unwrap_err();
        assert!(matches!(err, Error::Url(_)));
    }
}
