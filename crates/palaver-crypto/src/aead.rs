//! XChaCha20-Poly1305 AEAD encryption.
//!
//! Every group packet payload is encrypted with the extended-nonce
//! ChaCha20-Poly1305 variant; the 24-byte nonce travels in the packet
//! framing, so random nonces are safe without per-peer counters.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::{CryptoError, Result};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// Generate a fresh random nonce.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key` and `nonce`.
///
/// Returns the ciphertext with the 16-byte authentication tag appended.
///
/// # Errors
///
/// Returns [`CryptoError::AeadDecryption`] if the underlying cipher
/// rejects the input (oversized plaintext).
pub fn encrypt(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::AeadDecryption)
}

/// Decrypt `ciphertext` (with appended tag) under `key` and `nonce`.
///
/// # Errors
///
/// Returns [`CryptoError::AeadDecryption`] if authentication fails.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AeadDecryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [3u8; KEY_SIZE];
        let nonce = random_nonce();
        let ct = encrypt(&key, &nonce, b"hello group").expect("encrypt");
        assert_eq!(ct.len(), b"hello group".len() + TAG_SIZE);

        let pt = decrypt(&key, &nonce, &ct).expect("decrypt");
        assert_eq!(pt, b"hello group");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [3u8; KEY_SIZE];
        let nonce = random_nonce();
        let mut ct = encrypt(&key, &nonce, b"hello group").expect("encrypt");
        ct[0] ^= 0x01;
        assert!(decrypt(&key, &nonce, &ct).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let nonce = random_nonce();
        let ct = encrypt(&[3u8; KEY_SIZE], &nonce, b"payload").expect("encrypt");
        assert!(decrypt(&[4u8; KEY_SIZE], &nonce, &ct).is_err());
    }
}
