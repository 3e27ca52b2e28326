//! Connection handshake.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──CNXN──► AwaitingFirstResponse ──STLS──► NegotiatingTls ──┐
//!                                 │                                      │
//!                                 ├──AUTH(token)──► Authenticating ──────┤
//!                                 │                                      │
//!                                 └──CNXN────────────────────────────────┴──► Connected
//! ```
//!
//! Any frame other than the expected one at a step fails the handshake with
//! [`Error::Handshake`] naming the frame.

// ============================================================================
// Imports
// ============================================================================

use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{
    AuthType, Command, Frame, HOST_BANNER, PROTOCOL_VERSION, TLS_VERSION, read_frame, write_frame,
};

use super::auth::KeyProvider;
use super::io::BoxedTransport;

// ============================================================================
// HandshakeState
// ============================================================================

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet.
    Disconnected,
    /// CONNECT sent, waiting for the first reply.
    AwaitingFirstResponse,
    /// Peer asked for TLS; upgrading the transport.
    NegotiatingTls,
    /// Peer sent an AUTH challenge.
    Authenticating,
    /// Peer accepted the connection.
    Connected,
}

// ============================================================================
// Negotiated
// ============================================================================

/// Outcome of a successful handshake.
pub struct Negotiated {
    /// Transport to use from now on (TLS-wrapped if upgraded).
    pub transport: BoxedTransport,
    /// Protocol version announced by the peer.
    pub version: u32,
    /// Effective maximum payload: the smaller of both sides' limits.
    pub max_payload: u32,
    /// Peer's system identity banner.
    pub banner: String,
    /// Whether the transport was upgraded to TLS.
    pub tls: bool,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated")
            .field("version", &format_args!("{:#010x}", self.version))
            .field("max_payload", &self.max_payload)
            .field("banner", &self.banner)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Drives one handshake over a freshly opened transport.
pub struct Handshake<'a> {
    host: &'a str,
    key_provider: &'a dyn KeyProvider,
    max_payload: u32,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    /// Creates a handshake for the given peer host.
    ///
    /// `host` is used as the TLS server name if the peer asks for TLS.
    #[must_use]
    pub fn new(host: &'a str, key_provider: &'a dyn KeyProvider, max_payload: u32) -> Self {
        Self {
            host,
            key_provider,
            max_payload,
            state: HandshakeState::Disconnected,
        }
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Runs the handshake to completion.
    ///
    /// # Errors
    ///
    /// - [`Error::Handshake`] on an unexpected frame, signing failure, or
    ///   missing TLS identity
    /// - [`Error::Tls`] if the TLS upgrade fails
    /// - [`Error::Frame`] / [`Error::Io`] / [`Error::ConnectionClosed`] from
    ///   the transport
    pub async fn run(mut self, mut transport: BoxedTransport) -> Result<Negotiated> {
        let connect = Frame::new(
            Command::Connect,
            PROTOCOL_VERSION,
            self.max_payload,
            HOST_BANNER,
        );
        write_frame(&mut transport, &connect).await?;
        self.transition(HandshakeState::AwaitingFirstResponse);

        let mut tls = false;
        let mut frame = read_frame(&mut transport, self.max_payload).await?;

        match frame.command {
            Command::StartTls => {
                self.transition(HandshakeState::NegotiatingTls);
                write_frame(&mut transport, &Frame::empty(Command::StartTls, TLS_VERSION, 0))
                    .await?;
                transport = self.upgrade_tls(transport).await?;
                tls = true;
                frame = read_frame(&mut transport, self.max_payload).await?;
            }
            Command::Auth => {
                self.transition(HandshakeState::Authenticating);
                frame = self.authenticate(&mut transport, frame).await?;
            }
            _ => {}
        }

        if frame.command != Command::Connect {
            return Err(Error::handshake(format!(
                "expected CNXN, got {frame:?} in state {:?}",
                self.state
            )));
        }

        self.transition(HandshakeState::Connected);

        let max_payload = match frame.arg1 {
            0 => self.max_payload,
            peer => peer.min(self.max_payload),
        };
        let banner = String::from_utf8_lossy(&frame.payload)
            .trim_end_matches('\0')
            .to_string();

        info!(
            version = format_args!("{:#010x}", frame.arg0),
            max_payload,
            tls,
            banner = %banner,
            "Bridge handshake completed"
        );

        Ok(Negotiated {
            transport,
            version: frame.arg0,
            max_payload,
            banner,
            tls,
        })
    }

    /// Answers the token challenge; returns the frame that follows.
    ///
    /// The read after sending the public key has no timeout of its own: the
    /// peer may be waiting on its user to accept the key.
    async fn authenticate(
        &mut self,
        transport: &mut BoxedTransport,
        challenge: Frame,
    ) -> Result<Frame> {
        if challenge.auth_type() != Some(AuthType::Token) {
            return Err(Error::handshake(format!(
                "expected AUTH token, got {challenge:?}"
            )));
        }

        let signature = self
            .key_provider
            .sign(&challenge.payload)
            .await
            .map_err(|e| Error::handshake(format!("signing token failed: {e}")))?;
        write_frame(transport, &Frame::auth(AuthType::Signature, signature)).await?;
        debug!("Sent AUTH signature");

        let reply = read_frame(transport, self.max_payload).await?;
        if reply.auth_type() != Some(AuthType::Token) {
            return Ok(reply);
        }

        let public_key = self
            .key_provider
            .public_key()
            .await
            .map_err(|e| Error::handshake(format!("exporting public key failed: {e}")))?;
        write_frame(transport, &Frame::auth(AuthType::PublicKey, public_key)).await?;
        info!("Signature not recognised, offered public key; waiting for peer to accept");

        read_frame(transport, self.max_payload).await
    }

    /// Layers TLS over the already open transport.
    async fn upgrade_tls(&self, transport: BoxedTransport) -> Result<BoxedTransport> {
        let config = self.key_provider.tls_config()?;
        let server_name = ServerName::try_from(self.host.to_string())
            .map_err(|e| Error::tls(format!("invalid server name {}: {e}", self.host)))?;

        let stream = TlsConnector::from(config)
            .connect(server_name, transport)
            .await
            .map_err(|e| Error::tls(format!("TLS handshake failed: {e}")))?;

        debug!(host = %self.host, "TLS handshake succeeded");
        Ok(Box::new(stream))
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(from = ?self.state, to = ?next, "Handshake state");
        self.state = next;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::duplex;

    use crate::protocol::MAX_PAYLOAD;
    use crate::transport::testing::{PeerEnd, TestKey};

    #[tokio::test]
    async fn test_direct_connect() {
        let (client, server) = duplex(64 * 1024);
        let mut peer = PeerEnd::new(server);
        let key = TestKey::default();

        let task = tokio::spawn(async move {
            Handshake::new("127.0.0.1", &key, MAX_PAYLOAD)
                .run(Box::new(client))
                .await
        });

        let connect = peer.recv().await;
        assert_eq!(connect.command, Command::Connect);
        assert_eq!(connect.arg0, PROTOCOL_VERSION);
        assert_eq!(connect.arg1, MAX_PAYLOAD);
        assert_eq!(connect.payload, b"host::\0");

        peer.send(Frame::new(Command::Connect, PROTOCOL_VERSION, 4096, "device::ro.product.name=x;\0"))
            .await;

        let negotiated = task.await.expect("join").expect("handshake");
        assert_eq!(negotiated.max_payload, 4096);
        assert_eq!(negotiated.banner, "device::ro.product.name=x;");
        assert!(!negotiated.tls);
    }

    #[tokio::test]
    async fn test_auth_token_signature_public_key() {
        let (client, server) = duplex(64 * 1024);
        let mut peer = PeerEnd::new(server);
        let key = TestKey::default();
        let expected_key = key.public_key.clone();

        let task = tokio::spawn(async move {
            Handshake::new("127.0.0.1", &key, MAX_PAYLOAD)
                .run(Box::new(client))
                .await
        });

        peer.recv().await;
        peer.send(Frame::auth(AuthType::Token, vec![7u8; 20])).await;

        let signature = peer.recv().await;
        assert_eq!(signature.auth_type(), Some(AuthType::Signature));
        assert_eq!(signature.payload.len(), 256);
        assert_eq!(signature.payload[..20], [7u8; 20]);

        peer.send(Frame::auth(AuthType::Token, vec![9u8; 20])).await;

        let public_key = peer.recv().await;
        assert_eq!(public_key.auth_type(), Some(AuthType::PublicKey));
        assert_eq!(public_key.payload, expected_key);

        peer.send(Frame::new(Command::Connect, PROTOCOL_VERSION, MAX_PAYLOAD, "device::\0"))
            .await;

        let negotiated = task.await.expect("join").expect("handshake");
        assert_eq!(negotiated.max_payload, MAX_PAYLOAD);
    }

    #[tokio::test]
    async fn test_signature_accepted_skips_public_key() {
        let (client, server) = duplex(64 * 1024);
        let mut peer = PeerEnd::new(server);
        let key = TestKey::default();

        let task = tokio::spawn(async move {
            Handshake::new("127.0.0.1", &key, MAX_PAYLOAD)
                .run(Box::new(client))
                .await
        });

        peer.recv().await;
        peer.send(Frame::auth(AuthType::Token, vec![1u8; 20])).await;
        peer.recv().await;
        peer.send(Frame::new(Command::Connect, PROTOCOL_VERSION, 0, Vec::new()))
            .await;

        let negotiated = task.await.expect("join").expect("handshake");
        assert_eq!(negotiated.max_payload, MAX_PAYLOAD);
    }

    #[tokio::test]
    async fn test_unexpected_final_frame_fails() {
        let (client, server) = duplex(64 * 1024);
        let mut peer = PeerEnd::new(server);
        let key = TestKey::default();

        let task = tokio::spawn(async move {
            Handshake::new("127.0.0.1", &key, MAX_PAYLOAD)
                .run(Box::new(client))
                .await
        });

        peer.recv().await;
        peer.send(Frame::empty(Command::Ready, 1, 2)).await;

        let err = task.await.expect("join").unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
        assert!(err.to_string().contains("OKAY(1, 2, 0 bytes)"));
    }

    #[tokio::test]
    async fn test_auth_with_wrong_subtype_fails() {
        let (client, server) = duplex(64 * 1024);
        let mut peer = PeerEnd::new(server);
        let key = TestKey::default();

        let task = tokio::spawn(async move {
            Handshake::new("127.0.0.1", &key, MAX_PAYLOAD)
                .run(Box::new(client))
                .await
        });

        peer.recv().await;
        peer.send(Frame::auth(AuthType::Signature, vec![0u8; 4])).await;

        let err = task.await.expect("join").unwrap_err();
        assert!(err.to_string().contains("expected AUTH token"));
    }

    #[tokio::test]
    async fn test_signing_failure_is_handshake_error() {
        let (client, server) = duplex(64 * 1024);
        let mut peer = PeerEnd::new(server);
        let key = TestKey::failing();

        let task = tokio::spawn(async move {
            Handshake::new("127.0.0.1", &key, MAX_PAYLOAD)
                .run(Box::new(client))
                .await
        });

        peer.recv().await;
        peer.send(Frame::auth(AuthType::Token, vec![0u8; 20])).await;

        let err = task.await.expect("join").unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
        assert!(err.to_string().contains("signing token failed"));
    }

    #[tokio::test]
    async fn test_start_tls_without_identity_fails() {
        let (client, server) = duplex(64 * 1024);
        let mut peer = PeerEnd::new(server);
        let key = TestKey::default();

        let task = tokio::spawn(async move {
            Handshake::new("127.0.0.1", &key, MAX_PAYLOAD)
                .run(Box::new(client))
                .await
        });

        peer.recv().await;
        peer.send(Frame::empty(Command::StartTls, TLS_VERSION, 0)).await;

        let ack = peer.recv().await;
        assert_eq!(ack.command, Command::StartTls);
        assert_eq!(ack.arg0, TLS_VERSION);

        let err = task.await.expect("join").unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_peer_hangup_during_handshake() {
        let (client, server) = duplex(1024);
        drop(server);

        let key = TestKey::default();
        let result = Handshake::new("127.0.0.1", &key, MAX_PAYLOAD)
            .run(Box::new(client))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_initial_state() {
        let key = TestKey::default();
        let handshake = Handshake::new("127.0.0.1", &key, MAX_PAYLOAD);
        assert_eq!(handshake.state(), HandshakeState::Disconnected);
    }
}
