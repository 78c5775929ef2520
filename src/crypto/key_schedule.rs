//! Key schedule
//!
//! HKDF (RFC 5869) over the suite hash, built on OpenSSL HMAC, and the
//! TLS 1.3 style derivation of handshake and application traffic secrets:
//!
//! ```text
//! early     = Extract(0, 0)
//! handshake = Extract(Derive-Secret(early, "derived", ""), x25519 secret)
//!   c hs traffic / s hs traffic over H(ClientHello..ServerHello)
//! master    = Extract(Derive-Secret(handshake, "derived", ""), 0)
//!   c ap traffic / s ap traffic over H(ClientHello..server Finished)
//! ```
//!
//! Every label is prefixed with the negotiated version's label prefix.

use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use zeroize::Zeroizing;

use super::aead::{AeadAlgorithm, NONCE_LEN};
use super::HashAlgorithm;
use crate::config::{CipherSuite, ProtocolVersion};
use crate::error::{Error, Result};

type Secret = Zeroizing<Vec<u8>>;
type OsslResult<T> = std::result::Result<T, ErrorStack>;

/// HMAC of `data` under `key`
pub fn hmac(hash: HashAlgorithm, key: &[u8], data: &[u8]) -> OsslResult<Vec<u8>> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(hash.message_digest(), &pkey)?;
    signer.update(data)?;
    signer.sign_to_vec()
}

/// HKDF-Extract
pub fn extract(hash: HashAlgorithm, salt: &[u8], ikm: &[u8]) -> OsslResult<Secret> {
    Ok(Zeroizing::new(hmac(hash, salt, ikm)?))
}

/// HKDF-Expand
pub fn expand(
    hash: HashAlgorithm,
    prk: &[u8],
    info: &[u8],
    len: usize,
) -> OsslResult<Secret> {
    let mut okm = Zeroizing::new(Vec::with_capacity(len));
    let mut block: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while okm.len() < len {
        let mut input = Zeroizing::new(block.clone());
        input.extend_from_slice(info);
        input.push(counter);
        block = hmac(hash, prk, &input)?;
        let take = (len - okm.len()).min(block.len());
        okm.extend_from_slice(&block[..take]);
        counter = counter.wrapping_add(1);
    }
    block.iter_mut().for_each(|b| *b = 0);
    Ok(okm)
}

/// HKDF-Expand-Label with the given label prefix
pub fn expand_label(
    hash: HashAlgorithm,
    prefix: &[u8],
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    len: usize,
) -> OsslResult<Secret> {
    let full_len = prefix.len() + label.len();
    let mut info = Vec::with_capacity(4 + full_len + context.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push(full_len as u8);
    info.extend_from_slice(prefix);
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    expand(hash, secret, &info, len)
}

/// Keys protecting one direction of the record layer
pub struct TrafficKeys {
    aead: AeadAlgorithm,
    key: Secret,
    iv: Zeroizing<[u8; NONCE_LEN]>,
}

impl TrafficKeys {
    pub fn new(aead: AeadAlgorithm, key: &[u8], iv: [u8; NONCE_LEN]) -> Self {
        TrafficKeys {
            aead,
            key: Zeroizing::new(key.to_vec()),
            iv: Zeroizing::new(iv),
        }
    }

    /// Derive record key and IV from a traffic secret
    pub fn from_secret(
        suite: CipherSuite,
        version: ProtocolVersion,
        secret: &[u8],
    ) -> OsslResult<Self> {
        let hash = suite.hash();
        let prefix = version.label_prefix();
        let aead = suite.aead();
        let key = expand_label(hash, prefix, secret, b"key", b"", aead.key_len())?;
        let iv_bytes = expand_label(hash, prefix, secret, b"iv", b"", NONCE_LEN)?;
        let mut iv = [0u8; NONCE_LEN];
        iv.copy_from_slice(&iv_bytes);
        Ok(TrafficKeys {
            aead,
            key,
            iv: Zeroizing::new(iv),
        })
    }

    pub fn aead(&self) -> AeadAlgorithm {
        self.aead
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Per-record nonce: the IV XORed with the big-endian sequence number
    pub fn nonce(&self, seq: u64) -> [u8; NONCE_LEN] {
        let mut nonce = *self.iv;
        for (n, s) in nonce[NONCE_LEN - 8..].iter_mut().zip(seq.to_be_bytes()) {
            *n ^= s;
        }
        nonce
    }
}

/// Traffic secrets of one direction pair
struct SecretPair {
    client: Secret,
    server: Secret,
}

/// Secrets of one handshake, advanced stage by stage
pub struct KeySchedule {
    suite: CipherSuite,
    version: ProtocolVersion,
    handshake_secret: Option<Secret>,
    handshake: Option<SecretPair>,
}

impl KeySchedule {
    pub fn new(suite: CipherSuite, version: ProtocolVersion) -> Self {
        KeySchedule {
            suite,
            version,
            handshake_secret: None,
            handshake: None,
        }
    }

    fn hash(&self) -> HashAlgorithm {
        self.suite.hash()
    }

    fn derive_secret(&self, secret: &[u8], label: &[u8], context: &[u8]) -> OsslResult<Secret> {
        let hash = self.hash();
        expand_label(
            hash,
            self.version.label_prefix(),
            secret,
            label,
            context,
            hash.output_len(),
        )
    }

    fn empty_hash(&self) -> OsslResult<Vec<u8>> {
        self.hash().hash(b"")
    }

    fn keys(&self, secret: &[u8]) -> OsslResult<TrafficKeys> {
        TrafficKeys::from_secret(self.suite, self.version, secret)
    }

    /// Mix in the key-exchange secret; returns (client, server) handshake keys
    pub fn handshake_keys(
        &mut self,
        shared_secret: &[u8],
        transcript_hash: &[u8],
    ) -> OsslResult<(TrafficKeys, TrafficKeys)> {
        let hash = self.hash();
        let zeros = vec![0u8; hash.output_len()];
        let early = extract(hash, &zeros, &zeros)?;
        let salt = self.derive_secret(&early, b"derived", &self.empty_hash()?)?;
        let hs_secret = extract(hash, &salt, shared_secret)?;

        let client = self.derive_secret(&hs_secret, b"c hs traffic", transcript_hash)?;
        let server = self.derive_secret(&hs_secret, b"s hs traffic", transcript_hash)?;
        let keys = (self.keys(&client)?, self.keys(&server)?);

        self.handshake_secret = Some(hs_secret);
        self.handshake = Some(SecretPair { client, server });
        Ok(keys)
    }

    /// Derive (client, server) application keys from the transcript
    /// through the server Finished
    pub fn application_keys(
        &mut self,
        transcript_hash: &[u8],
    ) -> Result<(TrafficKeys, TrafficKeys)> {
        let hash = self.hash();
        let hs_secret = self
            .handshake_secret
            .take()
            .ok_or_else(|| Error::State("handshake secret not derived".to_string()))?;
        let salt = self.derive_secret(&hs_secret, b"derived", &self.empty_hash()?)?;
        let master = extract(hash, &salt, &vec![0u8; hash.output_len()])?;

        let client = self.derive_secret(&master, b"c ap traffic", transcript_hash)?;
        let server = self.derive_secret(&master, b"s ap traffic", transcript_hash)?;
        Ok((self.keys(&client)?, self.keys(&server)?))
    }

    /// Finished verify_data of `client` (or server) side over `transcript_hash`
    ///
    /// Always keyed from the handshake traffic secret of that side.
    pub fn finished(&self, client: bool, transcript_hash: &[u8]) -> Result<Vec<u8>> {
        let pair = self
            .handshake
            .as_ref()
            .ok_or_else(|| Error::State("handshake secrets not derived".to_string()))?;
        let base = if client { &pair.client } else { &pair.server };
        let hash = self.hash();
        let finished_key = expand_label(
            hash,
            self.version.label_prefix(),
            base,
            b"finished",
            b"",
            hash.output_len(),
        )?;
        Ok(hmac(hash, &finished_key, transcript_hash)?)
    }
}

/// Constant-time comparison of two verify_data values
pub fn verify_data_eq(expected: &[u8], received: &[u8]) -> bool {
    expected.len() == received.len() && openssl::memcmp::eq(expected, received)
}
