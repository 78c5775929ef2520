//! AEAD record protection
//!
//! All suites use a 12-byte nonce and a 16-byte tag. The sealed form is
//! `ciphertext || tag`.

use openssl::error::ErrorStack;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};

/// AEAD nonce size
pub const NONCE_LEN: usize = 12;

/// AEAD tag size
pub const TAG_LEN: usize = 16;

/// Bulk cipher of a cipher suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl AeadAlgorithm {
    /// Key size in bytes
    pub fn key_len(self) -> usize {
        match self {
            AeadAlgorithm::Aes128Gcm => 16,
            AeadAlgorithm::Aes256Gcm | AeadAlgorithm::Chacha20Poly1305 => 32,
        }
    }

    fn cipher(self) -> Cipher {
        match self {
            AeadAlgorithm::Aes128Gcm => Cipher::aes_128_gcm(),
            AeadAlgorithm::Aes256Gcm => Cipher::aes_256_gcm(),
            AeadAlgorithm::Chacha20Poly1305 => Cipher::chacha20_poly1305(),
        }
    }

    /// Encrypt and authenticate `plaintext`, returning `ciphertext || tag`
    pub fn seal(
        self,
        key: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ErrorStack> {
        let mut tag = [0u8; TAG_LEN];
        let mut sealed = encrypt_aead(self.cipher(), key, Some(nonce), aad, plaintext, &mut tag)?;
        sealed.extend_from_slice(&tag);
        Ok(sealed)
    }

    /// Authenticate and decrypt `ciphertext || tag`
    ///
    /// Returns `None` when the input is too short or fails authentication.
    pub fn open(
        self,
        key: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        sealed: &[u8],
    ) -> Option<Vec<u8>> {
        if sealed.len() < TAG_LEN {
            return None;
        }
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        decrypt_aead(self.cipher(), key, Some(nonce), aad, ciphertext, tag).ok()
    }
}
