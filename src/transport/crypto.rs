// Shared-key frame encryption.
//
// Frames are sealed with ChaCha20-Poly1305 under a key derived from the shared
// secret with SHA-256. Each frame gets a fresh random 12-byte nonce which is
// prepended to the ciphertext; the whole blob travels hex-encoded.
//
// Format: hex(nonce ‖ ciphertext ‖ tag)  (12 + N + 16 bytes)

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};

/// ChaCha20-Poly1305 nonce length in bytes.
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext is not valid hex")]
    Hex,
    #[error("ciphertext too short (missing nonce)")]
    TooShort,
    #[error("encryption failed")]
    Seal,
    #[error("decryption failed (wrong key or tampered frame)")]
    Open,
}

/// Symmetric transform applied to whole serialized frames.
#[derive(Clone)]
pub struct FrameCipher {
    key: [u8; 32],
}

impl FrameCipher {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Builds a cipher only when a key is configured.
    pub fn from_optional(secret: Option<&str>) -> Option<Self> {
        secret.map(Self::new)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Seal)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(hex::encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, CryptoError> {
        let blob = hex::decode(encoded.trim()).map_err(|_| CryptoError::Hex)?;
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::TooShort);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher")
            .field("algorithm", &"chacha20poly1305")
            .finish_non_exhaustive()
    }
}
