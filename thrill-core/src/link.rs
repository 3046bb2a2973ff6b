//! Link encryption for host transports: X25519 key agreement, ChaCha20-Poly1305 frames.
//! Confidentiality only; the peer's name is still taken on trust.

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Ephemeral link keypair. One per process; never persisted.
pub struct LinkKeypair {
    secret: StaticSecret,
    public: [u8; 32],
}

impl LinkKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Shared secret with the remote side's public key.
    pub fn shared_secret(&self, other_public: &[u8; 32]) -> [u8; 32] {
        let other = X25519PublicKey::from(*other_public);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive the 32-byte link key from the shared secret.
pub fn derive_link_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"thrill-link-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

fn nonce_bytes(nonce: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..12].copy_from_slice(&nonce.to_le_bytes());
    out
}

/// Nonce is a per-direction counter; callers must never reuse one under the same key.
pub fn encrypt_frame(key: &[u8; 32], nonce: u64, plaintext: &[u8]) -> Result<Vec<u8>, LinkCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| LinkCryptoError::Key)?;
    let n = nonce_bytes(nonce);
    let nonce_arr =
        chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(&n);
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| LinkCryptoError::Encrypt)
}

pub fn decrypt_frame(key: &[u8; 32], nonce: u64, ciphertext: &[u8]) -> Result<Vec<u8>, LinkCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| LinkCryptoError::Key)?;
    let n = nonce_bytes(nonce);
    let nonce_arr =
        chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(&n);
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| LinkCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum LinkCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
