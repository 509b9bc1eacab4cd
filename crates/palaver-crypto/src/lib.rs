//! # palaver-crypto
//!
//! Cryptographic primitives for the Palaver group-chat protocol. The
//! suite is fixed; no algorithm negotiation is permitted.
//!
//! ## Modules
//!
//! - [`hash`] — Domain-separated BLAKE3 hashing and key derivation
//! - [`ed25519`] — Ed25519 signing and verification (RFC 8032)
//! - [`x25519`] — X25519 key agreement (RFC 7748)
//! - [`aead`] — XChaCha20-Poly1305 AEAD with the 24-byte wire nonce
//! - [`sealed`] — Static-key sealed boxes for handshake packets
//! - [`identity`] — Extended (encryption + signing) identity keypairs

pub mod aead;
pub mod ed25519;
pub mod hash;
pub mod identity;
pub mod sealed;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// Invalid key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
