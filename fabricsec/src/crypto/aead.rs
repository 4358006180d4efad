// AEAD key wrapping with ChaCha20-Poly1305 or AES-256-GCM.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use zeroize::Zeroizing;

use crate::error::{Result, SecurityError};

/// Cipher used to protect exported key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapCipher {
    ChaCha20Poly1305,
    Aes256Gcm,
}

/// Authenticated encryption with associated data under a 32-byte key.
pub struct AeadCipher {
    cipher: WrapCipher,
    key: Zeroizing<[u8; 32]>,
}

impl AeadCipher {
    pub fn new(cipher: WrapCipher, key: [u8; 32]) -> Self {
        Self {
            cipher,
            key: Zeroizing::new(key),
        }
    }

    /// Returns ciphertext || 16-byte tag.
    pub fn encrypt(&self, nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload { msg: plaintext, aad };
        let sealed = match self.cipher {
            WrapCipher::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&self.key[..])
                .map_err(|e| SecurityError::Crypto(format!("cipher init: {e}")))?
                .encrypt(nonce, payload),
            WrapCipher::Aes256Gcm => Aes256Gcm::new_from_slice(&self.key[..])
                .map_err(|e| SecurityError::Crypto(format!("cipher init: {e}")))?
                .encrypt(nonce, payload),
        };
        sealed.map_err(|e| SecurityError::Crypto(format!("encrypt: {e}")))
    }

    /// Decrypt ciphertext produced by [`AeadCipher::encrypt`] with the same
    /// nonce and associated data.
    pub fn decrypt(&self, nonce: &[u8; 12], ciphertext: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload { msg: ciphertext, aad };
        let opened = match self.cipher {
            WrapCipher::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&self.key[..])
                .map_err(|e| SecurityError::Crypto(format!("cipher init: {e}")))?
                .decrypt(nonce, payload),
            WrapCipher::Aes256Gcm => Aes256Gcm::new_from_slice(&self.key[..])
                .map_err(|e| SecurityError::Crypto(format!("cipher init: {e}")))?
                .decrypt(nonce, payload),
        };
        opened
            .map(Zeroizing::new)
            .map_err(|_| SecurityError::AuthenticationFailed)
    }
}
