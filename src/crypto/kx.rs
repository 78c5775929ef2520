//! X25519 key exchange

use openssl::derive::Deriver;
use openssl::error::ErrorStack;
use openssl::pkey::{Id, PKey, Private};
use zeroize::Zeroizing;

/// Size of an X25519 public key and of the shared secret
pub const X25519_LEN: usize = 32;

/// Ephemeral X25519 key pair, used for exactly one handshake
pub struct KeyExchange {
    key: PKey<Private>,
}

impl KeyExchange {
    pub fn generate() -> Result<Self, ErrorStack> {
        Ok(KeyExchange {
            key: PKey::generate_x25519()?,
        })
    }

    /// Raw public key sent in the key share
    pub fn public_key(&self) -> Result<Vec<u8>, ErrorStack> {
        self.key.raw_public_key()
    }

    /// Shared secret with the peer's raw public key
    ///
    /// Returns `None` for a peer share of the wrong size or one OpenSSL
    /// rejects (such as a low-order point).
    pub fn agree(self, peer_public: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        if peer_public.len() != X25519_LEN {
            return None;
        }
        let peer = PKey::public_key_from_raw_bytes(peer_public, Id::X25519).ok()?;
        let mut deriver = Deriver::new(&self.key).ok()?;
        deriver.set_peer(&peer).ok()?;
        let secret = deriver.derive_to_vec().ok()?;
        if secret.iter().all(|b| *b == 0) {
            return None;
        }
        Some(Zeroizing::new(secret))
    }
}
