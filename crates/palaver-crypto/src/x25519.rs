//! X25519 key agreement (RFC 7748).
//!
//! Used for the long-term encryption half of a peer identity and for the
//! per-connection ephemeral session keys negotiated during the handshake.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// An X25519 secret key. Static rather than ephemeral because group
/// session keys must survive across ticks until the connection dies.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct X25519StaticSecret {
    inner: StaticSecret,
}

/// An X25519 shared secret.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

impl X25519StaticSecret {
    /// Generate a new random secret.
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Get the raw bytes of this secret.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Compute the corresponding public key.
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.inner).to_bytes()
    }

    /// Perform Diffie-Hellman key agreement with a raw public key.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> SharedSecret {
        let pk = PublicKey::from(*their_public);
        let shared = self.inner.diffie_hellman(&pk);
        SharedSecret {
            bytes: *shared.as_bytes(),
        }
    }
}

impl SharedSecret {
    /// Get the raw bytes of the shared secret.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// An X25519 keypair.
pub struct X25519KeyPair {
    pub secret: X25519StaticSecret,
    pub public: [u8; 32],
}

impl X25519KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = X25519StaticSecret::random();
        let public = secret.public_key();
        Self { secret, public }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_agreement() {
        let a = X25519KeyPair::generate();
        let b = X25519KeyPair::generate();

        let ab = a.secret.diffie_hellman(&b.public);
        let ba = b.secret.diffie_hellman(&a.public);
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn secret_round_trips_through_bytes() {
        let pair = X25519KeyPair::generate();
        let restored = X25519StaticSecret::from_bytes(pair.secret.to_bytes());
        assert_eq!(restored.public_key(), pair.public);
    }
}
