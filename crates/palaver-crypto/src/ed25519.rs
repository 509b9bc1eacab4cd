//! Ed25519 signing and verification (RFC 8032).
//!
//! Ed25519 is the root signature algorithm for Palaver. It signs the
//! founder's shared state, every sanction entry, the sanctions
//! credentials, and the topic. This module wraps `ed25519-dalek` with
//! Palaver-specific types.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// An Ed25519 signing key (private key).
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl Clone for SigningKey {
    fn clone(&self) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(&self.inner.to_bytes()),
        }
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        let mut bytes = self.inner.to_bytes();
        bytes.zeroize();
    }
}

/// An Ed25519 verification key (public key).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

/// An Ed25519 signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

/// An Ed25519 keypair.
pub struct KeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl SigningKey {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Create a signing key from raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Get the raw bytes of this signing key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Get the corresponding verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Sign a message, producing a detached signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            inner: self.inner.sign(message),
        }
    }
}

impl VerifyingKey {
    /// Create a verifying key from raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Get the raw bytes of this verifying key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Convert to the corresponding X25519 public key (Montgomery form).
    ///
    /// A chat id is an Ed25519 verifying key; its encryption identity is
    /// this birational image on Curve25519.
    pub fn to_encryption_key(&self) -> [u8; 32] {
        self.inner.to_montgomery().to_bytes()
    }

    /// Verify a detached signature over `message`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerification`] if the signature
    /// does not verify.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.inner
            .verify(message, &signature.inner)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl Signature {
    /// Create a signature from raw bytes.
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self {
            inner: ed25519_dalek::Signature::from_bytes(bytes),
        }
    }

    /// Get the raw bytes of this signature.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate();
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }
}

/// Verify a detached signature given raw key and signature bytes.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] for malformed keys and
/// [`CryptoError::SignatureVerification`] on verification failure.
pub fn verify_detached(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
    let key = VerifyingKey::from_bytes(public_key)?;
    key.verify(message, &Signature::from_bytes(signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let pair = KeyPair::generate();
        let sig = pair.signing_key.sign(b"state v1");
        pair.verifying_key
            .verify(b"state v1", &sig)
            .expect("signature should verify");
        assert!(pair.verifying_key.verify(b"state v2", &sig).is_err());
    }

    #[test]
    fn detached_round_trip() {
        let pair = KeyPair::generate();
        let sig = pair.signing_key.sign(b"topic");
        verify_detached(
            &pair.verifying_key.to_bytes(),
            b"topic",
            &sig.to_bytes(),
        )
        .expect("detached signature should verify");
    }

    #[test]
    fn montgomery_conversion_is_deterministic() {
        let pair = KeyPair::generate();
        let enc_a = pair.verifying_key.to_encryption_key();
        let restored = VerifyingKey::from_bytes(&pair.verifying_key.to_bytes())
            .expect("valid key bytes");
        assert_eq!(enc_a, restored.to_encryption_key());
    }
}
