//! Key provider capability.
//!
//! Key generation, storage, signing and the TLS client identity live outside
//! this crate. The handshake only needs the three operations below.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use rustls::ClientConfig;

use crate::error::{Error, Result};

// ============================================================================
// KeyProvider
// ============================================================================

/// Supplies the client identity used during the bridge handshake.
///
/// # Example
///
/// ```ignore
/// struct StoredKey { /* ... */ }
///
/// #[async_trait]
/// impl KeyProvider for StoredKey {
///     async fn sign(&self, token: &[u8]) -> Result<Vec<u8>> {
///         self.rsa_sign_sha1(token)
///     }
///
///     async fn public_key(&self) -> Result<Vec<u8>> {
///         Ok(self.encoded_public_key())
///     }
/// }
/// ```
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Signs an authentication token sent by the peer.
    async fn sign(&self, token: &[u8]) -> Result<Vec<u8>>;

    /// Returns the public key offered when the peer does not recognise the
    /// signature, in the peer's expected encoding (NUL-terminated).
    async fn public_key(&self) -> Result<Vec<u8>>;

    /// Returns the TLS client configuration used when the peer requests a
    /// TLS upgrade.
    ///
    /// The default reports TLS as unsupported, which fails the handshake.
    fn tls_config(&self) -> Result<Arc<ClientConfig>> {
        Err(Error::handshake(
            "peer requested TLS but the key provider has no TLS identity",
        ))
    }
}
