//! Session-keyed encryption of structured payloads.
//!
//! Payloads are JSON-serialized, sealed with ChaCha20-Poly1305, and carried on the
//! wire as base64(nonce || ciphertext). Keys are derived per session id from a
//! shared master secret, so every client of the same session can open the traffic.

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// ChaCha20-Poly1305 nonce size prepended to every envelope.
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid master secret: {0}")]
    Secret(String),
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid envelope encoding")]
    Envelope,
}

/// Encrypt/decrypt context for one session.
#[derive(Clone)]
pub struct SessionCrypto {
    key: [u8; 32],
}

impl SessionCrypto {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Serialize the payload and seal it. Returns base64(nonce || ciphertext).
    pub fn encrypt<T: Serialize>(&self, payload: &T) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(payload)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce_bytes).map_err(|_| CryptoError::Encrypt)?;
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }

    /// Open a base64(nonce || ciphertext) envelope and deserialize the payload.
    pub fn decrypt<T: DeserializeOwned>(&self, envelope: &str) -> Result<T, CryptoError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(envelope.as_bytes())
            .map_err(|_| CryptoError::Envelope)?;
        if bytes.len() <= NONCE_LEN {
            return Err(CryptoError::Envelope);
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// Derives per-session encryption contexts from a master secret.
pub struct Keyring {
    master: Vec<u8>,
}

impl Keyring {
    /// Build from a base64 master secret (config or TETHER_SESSION_SECRET).
    pub fn from_secret(secret: &str) -> Result<Self, CryptoError> {
        let master = base64::engine::general_purpose::STANDARD
            .decode(secret.trim().as_bytes())
            .map_err(|e| CryptoError::Secret(e.to_string()))?;
        if master.is_empty() {
            return Err(CryptoError::Secret("empty secret".to_string()));
        }
        Ok(Self { master })
    }

    /// Generate a fresh random master secret, base64-encoded (for `tether init`).
    pub fn generate_secret() -> Result<String, CryptoError> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Secret(e.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Session key = SHA-256(master || session_id).
    pub fn for_session(&self, session_id: &str) -> SessionCrypto {
        let mut hasher = Sha256::new();
        hasher.update(&self.master);
        hasher.update(session_id.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        SessionCrypto::new(key)
    }
}
