//! Local identity: certificate chain and private key

use std::fmt;
use std::fs;
use std::path::Path;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::cert::common_name;
use crate::config::AuthAlgorithm;
use crate::crypto::SignatureScheme;
use crate::error::{Error, Result};

/// Certificate chain (leaf first) and the private key matching the leaf
#[derive(Clone)]
pub struct Identity {
    chain: Vec<X509>,
    key: PKey<Private>,
    scheme: SignatureScheme,
}

impl Identity {
    /// Build an identity, checking the key belongs to the leaf
    pub fn new(chain: Vec<X509>, key: PKey<Private>) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Config("certificate chain is empty".to_string()))?;
        let leaf_key = leaf
            .public_key()
            .map_err(|e| Error::Config(format!("unreadable certificate key: {}", e)))?;
        if !leaf_key.public_eq(&key) {
            return Err(Error::Config(
                "private key does not match the certificate".to_string(),
            ));
        }
        let scheme = SignatureScheme::for_key(&key)
            .ok_or_else(|| Error::Config(format!("unsupported key type {:?}", key.id())))?;
        Ok(Identity { chain, key, scheme })
    }

    /// Parse a PEM chain and a PEM private key
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain = X509::stack_from_pem(chain_pem)
            .map_err(|e| Error::Config(format!("failed to load certificate: {}", e)))?;
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| Error::Config(format!("failed to load private key: {}", e)))?;
        Self::new(chain, key)
    }

    /// Load a PEM chain file and a PEM key file
    ///
    /// The key file may be the chain file itself when it holds both.
    pub fn from_pem_files<P: AsRef<Path>, Q: AsRef<Path>>(chain_path: P, key_path: Q) -> Result<Self> {
        let read = |path: &Path| {
            fs::read(path)
                .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))
        };
        let chain_pem = read(chain_path.as_ref())?;
        let key_pem = read(key_path.as_ref())?;
        Self::from_pem(&chain_pem, &key_pem)
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    pub fn leaf(&self) -> &X509 {
        &self.chain[0]
    }

    pub fn key(&self) -> &PKey<Private> {
        &self.key
    }

    /// Signature scheme the key signs handshakes with
    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    pub fn auth_algorithm(&self) -> AuthAlgorithm {
        self.scheme.auth_algorithm()
    }

    /// DER encoding of every chain certificate, leaf first
    pub fn chain_der(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .chain
            .iter()
            .map(|cert| cert.to_der())
            .collect::<std::result::Result<_, _>>()?)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("subject", &common_name(self.leaf().subject_name()))
            .field("chain_len", &self.chain.len())
            .field("scheme", &self.scheme)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, KeyKind, Pki};
    use std::io::Write;

    #[test]
    fn test_identity_from_pem() {
        let pki = Pki::new();
        let identity = Identity::from_pem(&pki.chain_pem(), &pki.leaf_key_pem()).unwrap();
        assert_eq!(identity.chain().len(), 2);
        assert_eq!(identity.scheme(), SignatureScheme::EcdsaP256Sha256);
        assert_eq!(identity.auth_algorithm(), AuthAlgorithm::Ecdsa);
        assert_eq!(identity.chain_der().unwrap()[0], pki.leaf.to_der().unwrap());
        assert!(format!("{:?}", identity).contains("jimmies.local"));
    }

    #[test]
    fn test_identity_from_files() {
        let pki = Pki::new();
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(&pki.chain_pem()).unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(&pki.leaf_key_pem()).unwrap();
        assert!(Identity::from_pem_files(cert.path(), key.path()).is_ok());
        assert!(matches!(
            Identity::from_pem_files(cert.path(), "/nonexistent/key.pem"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_mismatched_key() {
        let pki = Pki::new();
        let other = testutil::new_key(KeyKind::EcdsaP256);
        let other_pem = other.private_key_to_pem_pkcs8().unwrap();
        let err = Identity::from_pem(&pki.chain_pem(), &other_pem).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_unparseable_input() {
        assert!(matches!(
            Identity::from_pem(b"garbage", b"garbage"),
            Err(Error::Config(_))
        ));
        let pki = Pki::new();
        assert!(matches!(
            Identity::from_pem(b"", &pki.leaf_key_pem()),
            Err(Error::Config(_))
        ));
    }
}
