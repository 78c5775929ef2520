//! Cryptographic capability
//!
//! Thin wrappers over the `openssl` crate for everything the handshake and
//! record layer need: AEAD record protection, HKDF key derivation, transcript
//! hashing, X25519 key exchange and handshake signatures. No primitive is
//! implemented here; this module only fixes the parameters and formats.

pub mod aead;
pub mod key_schedule;
pub mod kx;
pub mod sign;

use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;

pub use aead::AeadAlgorithm;
pub use key_schedule::TrafficKeys;
pub use sign::SignatureScheme;

/// Hash function of a cipher suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub fn message_digest(self) -> MessageDigest {
        match self {
            HashAlgorithm::Sha256 => MessageDigest::sha256(),
            HashAlgorithm::Sha384 => MessageDigest::sha384(),
        }
    }

    /// Digest size in bytes
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }

    pub fn hash(self, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        Ok(openssl::hash::hash(self.message_digest(), data)?.to_vec())
    }
}

/// Fill a fixed-size array from the OpenSSL CSPRNG
pub fn random<const N: usize>() -> Result<[u8; N], ErrorStack> {
    let mut out = [0u8; N];
    openssl::rand::rand_bytes(&mut out)?;
    Ok(out)
}

/// Running record of every handshake message, hashed on demand
///
/// The hash function is only known once the cipher suite is negotiated, so
/// the raw messages are kept rather than a running digest.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    messages: Vec<u8>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, message: &[u8]) {
        self.messages.extend_from_slice(message);
    }

    pub fn hash(&self, alg: HashAlgorithm) -> Result<Vec<u8>, ErrorStack> {
        alg.hash(&self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_lengths() {
        assert_eq!(HashAlgorithm::Sha256.hash(b"abc").unwrap().len(), 32);
        assert_eq!(HashAlgorithm::Sha384.hash(b"abc").unwrap().len(), 48);
    }

    #[test]
    fn test_transcript_hash_depends_on_all_messages() {
        let mut transcript = Transcript::new();
        transcript.add(b"client hello");
        let first = transcript.hash(HashAlgorithm::Sha256).unwrap();
        transcript.add(b"server hello");
        let second = transcript.hash(HashAlgorithm::Sha256).unwrap();
        assert_ne!(first, second);
        assert_eq!(transcript.len(), 24);
    }

    #[test]
    fn test_random_is_not_constant() {
        let a: [u8; 32] = random().unwrap();
        let b: [u8; 32] = random().unwrap();
        assert_ne!(a, b);
    }
}
