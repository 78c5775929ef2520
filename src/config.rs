//! Negotiation policy
//!
//! Protocol versions, cipher suites and the verification knobs a
//! [`Context`](crate::Context) carries. All types here are plain values;
//! the context snapshots them into an `Arc` when it freezes.

use std::fmt;
use std::str::FromStr;

use crate::crypto::{AeadAlgorithm, HashAlgorithm};
use crate::error::{Error, Result};
use crate::verify::WildcardPolicy;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl ProtocolVersion {
    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::Tls12 => "TLSv1.2",
            ProtocolVersion::Tls13 => "TLSv1.3",
        }
    }

    /// Wire code point
    pub fn wire(&self) -> u16 {
        match self {
            ProtocolVersion::Tls12 => 0x0303,
            ProtocolVersion::Tls13 => 0x0304,
        }
    }

    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            0x0303 => Some(ProtocolVersion::Tls12),
            0x0304 => Some(ProtocolVersion::Tls13),
            _ => None,
        }
    }

    /// Prefix of every key-schedule label derived under this version
    pub(crate) fn label_prefix(&self) -> &'static [u8] {
        match self {
            ProtocolVersion::Tls12 => b"tls12 ",
            ProtocolVersion::Tls13 => b"tls13 ",
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(ProtocolVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(ProtocolVersion::Tls13),
            _ => Err(Error::Config(format!("invalid TLS version: {}", s))),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication algorithm a TLS 1.2 suite is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlgorithm {
    Rsa,
    /// ECDSA and Ed25519 identities
    Ecdsa,
}

/// Supported cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    Tls13Aes128GcmSha256,
    Tls13Aes256GcmSha384,
    Tls13Chacha20Poly1305Sha256,
    EcdheEcdsaAes128GcmSha256,
    EcdheRsaAes128GcmSha256,
    EcdheEcdsaAes256GcmSha384,
    EcdheRsaAes256GcmSha384,
    EcdheEcdsaChacha20Poly1305Sha256,
    EcdheRsaChacha20Poly1305Sha256,
}

impl CipherSuite {
    /// Every suite this crate implements
    pub const ALL: [CipherSuite; 9] = [
        CipherSuite::Tls13Aes256GcmSha384,
        CipherSuite::Tls13Chacha20Poly1305Sha256,
        CipherSuite::Tls13Aes128GcmSha256,
        CipherSuite::EcdheEcdsaAes256GcmSha384,
        CipherSuite::EcdheRsaAes256GcmSha384,
        CipherSuite::EcdheEcdsaChacha20Poly1305Sha256,
        CipherSuite::EcdheRsaChacha20Poly1305Sha256,
        CipherSuite::EcdheEcdsaAes128GcmSha256,
        CipherSuite::EcdheRsaAes128GcmSha256,
    ];

    /// Default preference order
    pub fn defaults() -> Vec<CipherSuite> {
        Self::ALL.to_vec()
    }

    pub fn id(&self) -> u16 {
        match self {
            CipherSuite::Tls13Aes128GcmSha256 => 0x1301,
            CipherSuite::Tls13Aes256GcmSha384 => 0x1302,
            CipherSuite::Tls13Chacha20Poly1305Sha256 => 0x1303,
            CipherSuite::EcdheEcdsaAes128GcmSha256 => 0xc02b,
            CipherSuite::EcdheRsaAes128GcmSha256 => 0xc02f,
            CipherSuite::EcdheEcdsaAes256GcmSha384 => 0xc02c,
            CipherSuite::EcdheRsaAes256GcmSha384 => 0xc030,
            CipherSuite::EcdheEcdsaChacha20Poly1305Sha256 => 0xcca9,
            CipherSuite::EcdheRsaChacha20Poly1305Sha256 => 0xcca8,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|suite| suite.id() == id)
    }

    /// Canonical (IANA) name
    pub fn name(&self) -> &'static str {
        match self {
            CipherSuite::Tls13Aes128GcmSha256 => "TLS_AES_128_GCM_SHA256",
            CipherSuite::Tls13Aes256GcmSha384 => "TLS_AES_256_GCM_SHA384",
            CipherSuite::Tls13Chacha20Poly1305Sha256 => "TLS_CHACHA20_POLY1305_SHA256",
            CipherSuite::EcdheEcdsaAes128GcmSha256 => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            CipherSuite::EcdheRsaAes128GcmSha256 => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            CipherSuite::EcdheEcdsaAes256GcmSha384 => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
            CipherSuite::EcdheRsaAes256GcmSha384 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            CipherSuite::EcdheEcdsaChacha20Poly1305Sha256 => {
                "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"
            }
            CipherSuite::EcdheRsaChacha20Poly1305Sha256 => {
                "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"
            }
        }
    }

    /// Look a suite up by canonical name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|suite| suite.name().eq_ignore_ascii_case(name))
    }

    /// Protocol version the suite belongs to
    pub fn version(&self) -> ProtocolVersion {
        match self {
            CipherSuite::Tls13Aes128GcmSha256
            | CipherSuite::Tls13Aes256GcmSha384
            | CipherSuite::Tls13Chacha20Poly1305Sha256 => ProtocolVersion::Tls13,
            _ => ProtocolVersion::Tls12,
        }
    }

    pub fn aead(&self) -> AeadAlgorithm {
        match self {
            CipherSuite::Tls13Aes128GcmSha256
            | CipherSuite::EcdheEcdsaAes128GcmSha256
            | CipherSuite::EcdheRsaAes128GcmSha256 => AeadAlgorithm::Aes128Gcm,
            CipherSuite::Tls13Aes256GcmSha384
            | CipherSuite::EcdheEcdsaAes256GcmSha384
            | CipherSuite::EcdheRsaAes256GcmSha384 => AeadAlgorithm::Aes256Gcm,
            CipherSuite::Tls13Chacha20Poly1305Sha256
            | CipherSuite::EcdheEcdsaChacha20Poly1305Sha256
            | CipherSuite::EcdheRsaChacha20Poly1305Sha256 => AeadAlgorithm::Chacha20Poly1305,
        }
    }

    pub fn hash(&self) -> HashAlgorithm {
        match self.aead() {
            AeadAlgorithm::Aes256Gcm => HashAlgorithm::Sha384,
            AeadAlgorithm::Aes128Gcm | AeadAlgorithm::Chacha20Poly1305 => HashAlgorithm::Sha256,
        }
    }

    /// Authentication algorithm; TLS 1.3 suites accept any key type
    pub fn authentication(&self) -> Option<AuthAlgorithm> {
        match self {
            CipherSuite::EcdheEcdsaAes128GcmSha256
            | CipherSuite::EcdheEcdsaAes256GcmSha384
            | CipherSuite::EcdheEcdsaChacha20Poly1305Sha256 => Some(AuthAlgorithm::Ecdsa),
            CipherSuite::EcdheRsaAes128GcmSha256
            | CipherSuite::EcdheRsaAes256GcmSha384
            | CipherSuite::EcdheRsaChacha20Poly1305Sha256 => Some(AuthAlgorithm::Rsa),
            _ => None,
        }
    }

    /// Whether the suite can be used with an identity of the given kind
    pub fn usable_with(&self, auth: Option<AuthAlgorithm>) -> bool {
        match (self.authentication(), auth) {
            (None, _) => true,
            (Some(required), Some(have)) => required == have,
            // A server without an identity cannot authenticate any 1.2 suite
            (Some(_), None) => false,
        }
    }

    /// Secret key size in bits, as reported by `Connection::cipher`
    pub fn key_bits(&self) -> u32 {
        self.aead().key_len() as u32 * 8
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Peer certificate verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Accept any peer certificate
    None,
    /// Verify the chain against the trust store
    Peer,
    /// Verify the chain and the expected hostname
    PeerAndHostname,
}

impl VerifyMode {
    pub fn verifies_chain(&self) -> bool {
        !matches!(self, VerifyMode::None)
    }

    pub fn checks_hostname(&self) -> bool {
        matches!(self, VerifyMode::PeerAndHostname)
    }
}

/// Client certificate verification mode (server-side)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVerify {
    /// Don't request client certificates
    None,
    /// Request client certificate but don't require it
    Optional,
    /// Require client certificate
    Required,
}

/// What a context's trust material is used to authenticate
///
/// Named after the peer being checked, as with Python's `ssl.Purpose`:
/// a client builds a `ServerAuth` context and gets
/// [`VerifyMode::PeerAndHostname`] by default, a server builds a
/// `ClientAuth` context and gets [`VerifyMode::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Authenticate servers; the default for client-side contexts
    ServerAuth,
    /// Authenticate clients; used for server-side contexts
    ClientAuth,
}

/// Side of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }

    /// Extended key usage the peer's leaf must allow
    pub fn peer_purpose(&self) -> Purpose {
        match self {
            Role::Client => Purpose::ServerAuth,
            Role::Server => Purpose::ClientAuth,
        }
    }
}

/// Negotiation and verification policy of a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub min_version: ProtocolVersion,
    pub max_version: ProtocolVersion,
    /// Cipher suites in preference order
    pub cipher_suites: Vec<CipherSuite>,
    pub verify_mode: VerifyMode,
    pub client_verify: ClientVerify,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub wildcard: WildcardPolicy,
}

impl Policy {
    /// Defaults for a context created for `purpose`
    pub fn for_purpose(purpose: Purpose) -> Self {
        let verify_mode = match purpose {
            Purpose::ServerAuth => VerifyMode::PeerAndHostname,
            Purpose::ClientAuth => VerifyMode::None,
        };
        Policy {
            min_version: ProtocolVersion::Tls12,
            max_version: ProtocolVersion::Tls13,
            cipher_suites: CipherSuite::defaults(),
            verify_mode,
            client_verify: ClientVerify::None,
            alpn_protocols: Vec::new(),
            wildcard: WildcardPolicy::default(),
        }
    }

    pub fn allows_version(&self, version: ProtocolVersion) -> bool {
        self.min_version <= version && version <= self.max_version
    }

    /// Enabled suites that belong to a version within bounds
    pub fn usable_suites(&self) -> impl Iterator<Item = CipherSuite> + '_ {
        self.cipher_suites
            .iter()
            .copied()
            .filter(|suite| self.allows_version(suite.version()))
    }

    /// Versions within bounds, highest first
    pub fn versions(&self) -> Vec<ProtocolVersion> {
        [ProtocolVersion::Tls13, ProtocolVersion::Tls12]
            .into_iter()
            .filter(|v| self.allows_version(*v))
            .collect()
    }

    /// Check the policy can produce at least one connection
    pub fn validate(&self) -> Result<()> {
        if self.min_version > self.max_version {
            return Err(Error::Config(format!(
                "minimum version {} is above maximum version {}",
                self.min_version, self.max_version
            )));
        }
        if self.usable_suites().next().is_none() {
            return Err(Error::Config(format!(
                "no enabled cipher suite is usable between {} and {}",
                self.min_version, self.max_version
            )));
        }
        Ok(())
    }
}

/// Parse a colon-separated list of suite names
pub fn parse_cipher_list(list: &str) -> Result<Vec<CipherSuite>> {
    let mut suites = Vec::new();
    for name in list.split(':').filter(|n| !n.trim().is_empty()) {
        let suite = CipherSuite::from_name(name)
            .ok_or_else(|| Error::Config(format!("unknown cipher suite: {}", name)))?;
        if !suites.contains(&suite) {
            suites.push(suite);
        }
    }
    if suites.is_empty() {
        return Err(Error::Config("cipher list is empty".to_string()));
    }
    Ok(suites)
}

/// Check every ALPN protocol fits a one-byte length prefix
pub(crate) fn validate_alpn(protocols: &[&str]) -> Result<Vec<Vec<u8>>> {
    protocols
        .iter()
        .map(|proto| {
            if proto.is_empty() || proto.len() > 255 {
                Err(Error::Config(format!(
                    "ALPN protocol must be 1 to 255 bytes: {:?}",
                    proto
                )))
            } else {
                Ok(proto.as_bytes().to_vec())
            }
        })
        .collect()
}
