//! Trust anchors
//!
//! A [`TrustStore`] holds the root certificates peer chains must lead to.
//! It is loaded once and never mutated after the owning context freezes.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use openssl::x509::{X509Ref, X509VerifyResult, X509};

use crate::error::{Error, Result};

/// Bundle files probed when no environment override is set
const SYSTEM_BUNDLES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
    "/etc/ssl/cert.pem",
    "/usr/local/etc/openssl/cert.pem",
];

/// Where a context's trust material comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustSource {
    /// PEM bundle file
    File(PathBuf),
    /// Directory of PEM files
    Directory(PathBuf),
    /// In-memory PEM text
    Pem(String),
    /// In-memory DER certificate
    Der(Vec<u8>),
    /// The platform's default bundle
    System,
}

#[derive(Clone)]
struct Anchor {
    cert: X509,
    der: Vec<u8>,
}

/// Set of trusted root certificates
#[derive(Clone, Default)]
pub struct TrustStore {
    anchors: Vec<Anchor>,
}

impl TrustStore {
    /// Store with no anchors; every verified chain fails with unknown issuer
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a store from `source`
    ///
    /// Fails with a configuration error when the source is unreadable or
    /// contains no certificate.
    pub fn load(source: &TrustSource) -> Result<Self> {
        match source {
            TrustSource::File(path) => Self::from_pem_file(path),
            TrustSource::Directory(path) => Self::from_directory(path),
            TrustSource::Pem(text) => Self::from_pem(text.as_bytes()),
            TrustSource::Der(der) => Self::from_der(der),
            TrustSource::System => Self::system(),
        }
    }

    pub fn from_pem_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let pem = fs::read(path).map_err(|e| {
            Error::Config(format!("cannot read CA file {}: {}", path.display(), e))
        })?;
        let store = Self::from_pem(&pem)
            .map_err(|_| Error::Config(format!("no certificate in CA file {}", path.display())))?;
        debug!("loaded {} trust anchors from {}", store.len(), path.display());
        Ok(store)
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let mut store = Self::empty();
        store.add_pem(pem)?;
        Ok(store)
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = X509::from_der(der)
            .map_err(|e| Error::Config(format!("invalid DER certificate: {}", e)))?;
        let mut store = Self::empty();
        store.add(cert)?;
        Ok(store)
    }

    /// Load every PEM file in `dir`; files without certificates are skipped
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read CA directory {}: {}", dir.display(), e))
        })?;

        let mut store = Self::empty();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match fs::read(&path) {
                Ok(pem) => {
                    if store.add_pem(&pem).is_err() {
                        trace!("skipping {}: no certificate", path.display());
                    }
                }
                Err(e) => trace!("skipping {}: {}", path.display(), e),
            }
        }

        if store.is_empty() {
            return Err(Error::Config(format!(
                "no certificate in CA directory {}",
                dir.display()
            )));
        }
        debug!("loaded {} trust anchors from {}", store.len(), dir.display());
        Ok(store)
    }

    /// Platform default bundle
    ///
    /// Honors `SSL_CERT_FILE` and `SSL_CERT_DIR` like OpenSSL does, then
    /// probes the usual distribution bundle paths.
    pub fn system() -> Result<Self> {
        if let Some(file) = std::env::var_os("SSL_CERT_FILE") {
            return Self::from_pem_file(PathBuf::from(file));
        }
        if let Some(dir) = std::env::var_os("SSL_CERT_DIR") {
            return Self::from_directory(PathBuf::from(dir));
        }
        for candidate in SYSTEM_BUNDLES {
            let path = Path::new(candidate);
            if path.is_file() {
                if let Ok(store) = Self::from_pem_file(path) {
                    return Ok(store);
                }
            }
        }
        Err(Error::Config("no system certificate bundle found".to_string()))
    }

    /// Add one anchor; duplicates are ignored
    pub fn add(&mut self, cert: X509) -> Result<()> {
        let der = cert.to_der()?;
        if !self.anchors.iter().any(|a| a.der == der) {
            self.anchors.push(Anchor { cert, der });
        }
        Ok(())
    }

    /// Add every certificate of a PEM bundle
    pub fn add_pem(&mut self, pem: &[u8]) -> Result<usize> {
        let certs = X509::stack_from_pem(pem)
            .map_err(|e| Error::Config(format!("invalid PEM certificate data: {}", e)))?;
        if certs.is_empty() {
            return Err(Error::Config("no certificate in PEM data".to_string()));
        }
        let count = certs.len();
        for cert in certs {
            self.add(cert)?;
        }
        Ok(count)
    }

    pub fn roots(&self) -> impl Iterator<Item = &X509> {
        self.anchors.iter().map(|a| &a.cert)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Whether `cert` is itself one of the anchors
    pub fn contains(&self, cert: &X509Ref) -> bool {
        match cert.to_der() {
            Ok(der) => self.anchors.iter().any(|a| a.der == der),
            Err(_) => false,
        }
    }

    /// Anchor whose subject and key identifiers match `cert`'s issuer
    pub fn find_issuer(&self, cert: &X509Ref) -> Option<&X509> {
        self.anchors
            .iter()
            .map(|a| &a.cert)
            .find(|anchor| anchor.issued(cert) == X509VerifyResult::OK)
    }
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStore")
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Pki;
    use std::io::Write;

    #[test]
    fn test_from_pem_file() {
        let pki = Pki::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&pki.root_pem()).unwrap();

        let store = TrustStore::load(&TrustSource::File(file.path().to_path_buf())).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains(&pki.root));
        assert!(!store.contains(&pki.intermediate));
        assert!(store.find_issuer(&pki.intermediate).is_some());
        assert!(store.find_issuer(&pki.leaf).is_none());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = TrustStore::from_pem_file("/nonexistent/ca.pem").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_garbage_is_config_error() {
        assert!(matches!(
            TrustStore::from_pem(b"not a certificate"),
            Err(Error::Config(_))
        ));
        assert!(matches!(TrustStore::from_der(b"\x30\x00"), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_der_and_pem_text() {
        let pki = Pki::new();
        let der = pki.root.to_der().unwrap();
        let store = TrustStore::load(&TrustSource::Der(der)).unwrap();
        assert!(store.contains(&pki.root));

        let text = String::from_utf8(pki.root_pem()).unwrap();
        let store = TrustStore::load(&TrustSource::Pem(text)).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_from_directory() {
        let pki = Pki::new();
        let other = Pki::new();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.pem"), pki.root_pem()).unwrap();
        fs::write(dir.path().join("b.pem"), other.root_pem()).unwrap();
        fs::write(dir.path().join("README"), b"not a certificate").unwrap();

        let store = TrustStore::from_directory(dir.path()).unwrap();
        assert_eq!(store.len(), 2);

        let empty = tempfile::tempdir().unwrap();
        assert!(TrustStore::from_directory(empty.path()).is_err());
    }

    #[test]
    fn test_duplicates_ignored() {
        let pki = Pki::new();
        let mut store = TrustStore::empty();
        store.add(pki.root.clone()).unwrap();
        store.add(pki.root.clone()).unwrap();
        assert_eq!(store.len(), 1);
    }
}
