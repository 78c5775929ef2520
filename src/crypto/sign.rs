//! Handshake signatures
//!
//! The scheme is fixed by the signing key: RSA keys sign with RSA-PSS, EC
//! keys with ECDSA on their own curve, Ed25519 keys with pure EdDSA.

use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, Id, PKeyRef, Private, Public};
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Signer, Verifier};

use crate::config::AuthAlgorithm;

/// Supported signature schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    RsaPssSha256,
    EcdsaP256Sha256,
    EcdsaP384Sha384,
    Ed25519,
}

impl SignatureScheme {
    pub const ALL: [SignatureScheme; 4] = [
        SignatureScheme::Ed25519,
        SignatureScheme::EcdsaP256Sha256,
        SignatureScheme::EcdsaP384Sha384,
        SignatureScheme::RsaPssSha256,
    ];

    pub fn id(&self) -> u16 {
        match self {
            SignatureScheme::RsaPssSha256 => 0x0804,
            SignatureScheme::EcdsaP256Sha256 => 0x0403,
            SignatureScheme::EcdsaP384Sha384 => 0x0503,
            SignatureScheme::Ed25519 => 0x0807,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.id() == id)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignatureScheme::RsaPssSha256 => "rsa_pss_rsae_sha256",
            SignatureScheme::EcdsaP256Sha256 => "ecdsa_secp256r1_sha256",
            SignatureScheme::EcdsaP384Sha384 => "ecdsa_secp384r1_sha384",
            SignatureScheme::Ed25519 => "ed25519",
        }
    }

    /// Scheme a key of this type signs with, if supported
    pub fn for_key<T: HasPublic>(key: &PKeyRef<T>) -> Option<Self> {
        match key.id() {
            Id::RSA => Some(SignatureScheme::RsaPssSha256),
            Id::ED25519 => Some(SignatureScheme::Ed25519),
            // Curve is identified by its order size
            Id::EC => match key.bits() {
                256 => Some(SignatureScheme::EcdsaP256Sha256),
                384 => Some(SignatureScheme::EcdsaP384Sha384),
                _ => None,
            },
            _ => None,
        }
    }

    /// TLS 1.2 authentication family of the scheme
    pub fn auth_algorithm(&self) -> AuthAlgorithm {
        match self {
            SignatureScheme::RsaPssSha256 => AuthAlgorithm::Rsa,
            _ => AuthAlgorithm::Ecdsa,
        }
    }

    fn digest(&self) -> Option<MessageDigest> {
        match self {
            SignatureScheme::RsaPssSha256 | SignatureScheme::EcdsaP256Sha256 => {
                Some(MessageDigest::sha256())
            }
            SignatureScheme::EcdsaP384Sha384 => Some(MessageDigest::sha384()),
            SignatureScheme::Ed25519 => None,
        }
    }

    pub fn sign(&self, key: &PKeyRef<Private>, message: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let mut signer = match self.digest() {
            Some(md) => Signer::new(md, key)?,
            None => Signer::new_without_digest(key)?,
        };
        if *self == SignatureScheme::RsaPssSha256 {
            signer.set_rsa_padding(Padding::PKCS1_PSS)?;
            signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        }
        signer.sign_oneshot_to_vec(message)
    }

    /// Check `signature` over `message`; any failure counts as invalid
    pub fn verify(&self, key: &PKeyRef<Public>, message: &[u8], signature: &[u8]) -> bool {
        if Self::for_key(key) != Some(*self) {
            return false;
        }
        let result = (|| -> Result<bool, ErrorStack> {
            let mut verifier = match self.digest() {
                Some(md) => Verifier::new(md, key)?,
                None => Verifier::new_without_digest(key)?,
            };
            if *self == SignatureScheme::RsaPssSha256 {
                verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
                verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
            }
            verifier.verify_oneshot(signature, message)
        })();
        result.unwrap_or(false)
    }
}
