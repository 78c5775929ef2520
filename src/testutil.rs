//! Throwaway PKI for tests
//!
//! A root, an intermediate it signs, and server and client leaves signed by
//! the intermediate. The parent module must provide `Identity` and
//! `TrustStore`, so integration tests can include this file as well.

#![allow(dead_code)]

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use super::{Identity, TrustStore};

const DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    EcdsaP256,
    EcdsaP384,
    Ed25519,
}

pub fn new_key(kind: KeyKind) -> PKey<Private> {
    let ec = |nid| {
        let group = EcGroup::from_curve_name(nid).unwrap();
        PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
    };
    match kind {
        KeyKind::Rsa => PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap(),
        KeyKind::EcdsaP256 => ec(Nid::X9_62_PRIME256V1),
        KeyKind::EcdsaP384 => ec(Nid::SECP384R1),
        KeyKind::Ed25519 => PKey::generate_ed25519().unwrap(),
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

fn digest_for(key: &PKey<Private>) -> MessageDigest {
    if key.id() == Id::ED25519 {
        MessageDigest::null()
    } else {
        MessageDigest::sha256()
    }
}

/// Optional extensions beyond what [`issue`] always adds
#[derive(Debug, Clone, Copy, Default)]
pub struct Extras {
    /// pathLenConstraint of a CA certificate
    pub path_len: Option<u32>,
    /// Restrict extended key usage to clientAuth
    pub client_auth_only: bool,
}

/// Certificate for `key` valid between the two offsets from now, in days
///
/// An empty `cn` leaves the subject empty. SAN entries that parse as IP
/// addresses become IP SANs.
pub fn issue(
    cn: &str,
    key: &PKey<Private>,
    sans: &[&str],
    issuer: Option<(&X509, &PKey<Private>)>,
    ca: bool,
    valid_days: (i64, i64),
) -> X509 {
    issue_with(cn, key, sans, issuer, ca, valid_days, Extras::default())
}

#[allow(clippy::too_many_arguments)]
pub fn issue_with(
    cn: &str,
    key: &PKey<Private>,
    sans: &[&str],
    issuer: Option<(&X509, &PKey<Private>)>,
    ca: bool,
    valid_days: (i64, i64),
    extras: Extras,
) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    if !cn.is_empty() {
        name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    }
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    match issuer {
        Some((cert, _)) => builder.set_issuer_name(cert.subject_name()).unwrap(),
        None => builder.set_issuer_name(&name).unwrap(),
    }
    builder.set_pubkey(key).unwrap();

    let start = now();
    let not_before = Asn1Time::from_unix((start + valid_days.0 * DAY) as libc::time_t).unwrap();
    let not_after = Asn1Time::from_unix((start + valid_days.1 * DAY) as libc::time_t).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();

    if ca {
        let mut constraints = BasicConstraints::new();
        constraints.critical().ca();
        if let Some(len) = extras.path_len {
            constraints.pathlen(len);
        }
        builder.append_extension(constraints.build().unwrap()).unwrap();
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()
                    .unwrap(),
            )
            .unwrap();
    } else {
        builder
            .append_extension(BasicConstraints::new().build().unwrap())
            .unwrap();
    }

    if extras.client_auth_only {
        builder
            .append_extension(ExtendedKeyUsage::new().client_auth().build().unwrap())
            .unwrap();
    }

    if !sans.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for entry in sans {
            if entry.parse::<IpAddr>().is_ok() {
                san.ip(entry);
            } else {
                san.dns(entry);
            }
        }
        let extension = san
            .build(&builder.x509v3_context(issuer.map(|(cert, _)| &**cert), None))
            .unwrap();
        builder.append_extension(extension).unwrap();
    }

    let signing_key = issuer.map(|(_, k)| k).unwrap_or(key);
    builder.sign(signing_key, digest_for(signing_key)).unwrap();
    builder.build()
}

/// Self-signed leaf valid for a year
pub fn self_signed(cn: &str, key: &PKey<Private>, sans: &[&str]) -> X509 {
    issue(cn, key, sans, None, false, (-1, 365))
}

pub const VALID: (i64, i64) = (-1, 365);
pub const EXPIRED: (i64, i64) = (-30, -1);

pub struct Pki {
    pub root: X509,
    pub root_key: PKey<Private>,
    pub intermediate: X509,
    pub intermediate_key: PKey<Private>,
    /// Server leaf for `jimmies.local`
    pub leaf: X509,
    pub leaf_key: PKey<Private>,
    /// Same name and key as `leaf`, validity ended yesterday
    pub expired_leaf: X509,
    pub client: X509,
    pub client_key: PKey<Private>,
}

impl Pki {
    pub fn new() -> Self {
        Self::with_leaf_key(KeyKind::EcdsaP256)
    }

    /// PKI whose server leaf has a `kind` key
    pub fn with_leaf_key(kind: KeyKind) -> Self {
        let root_key = new_key(KeyKind::EcdsaP256);
        let root = issue("Jimmies Test Root", &root_key, &[], None, true, VALID);

        let intermediate_key = new_key(KeyKind::EcdsaP256);
        let intermediate = issue(
            "Jimmies Test Intermediate",
            &intermediate_key,
            &[],
            Some((&root, &root_key)),
            true,
            VALID,
        );

        let signer = Some((&intermediate, &intermediate_key));
        let leaf_key = new_key(kind);
        let leaf = issue("jimmies.local", &leaf_key, &["jimmies.local"], signer, false, VALID);
        let expired_leaf = issue("jimmies.local", &leaf_key, &["jimmies.local"], signer, false, EXPIRED);

        let client_key = new_key(KeyKind::EcdsaP256);
        let client = issue("Jimmies Test Client", &client_key, &[], signer, false, VALID);

        Pki {
            root,
            root_key,
            intermediate,
            intermediate_key,
            leaf,
            leaf_key,
            expired_leaf,
            client,
            client_key,
        }
    }

    /// Certificate for `cn` signed by the intermediate
    pub fn issue_leaf(&self, cn: &str, key: &PKey<Private>, extras: Extras) -> X509 {
        let signer = Some((&self.intermediate, &self.intermediate_key));
        issue_with(cn, key, &[cn], signer, false, VALID, extras)
    }

    /// Leaf then intermediate, as a server presents them
    pub fn server_chain(&self) -> Vec<X509> {
        vec![self.leaf.clone(), self.intermediate.clone()]
    }

    pub fn client_chain(&self) -> Vec<X509> {
        vec![self.client.clone(), self.intermediate.clone()]
    }

    /// Store trusting only the root
    pub fn trust(&self) -> TrustStore {
        let mut store = TrustStore::empty();
        store.add(self.root.clone()).unwrap();
        store
    }

    pub fn root_pem(&self) -> Vec<u8> {
        self.root.to_pem().unwrap()
    }

    pub fn chain_pem(&self) -> Vec<u8> {
        let mut pem = self.leaf.to_pem().unwrap();
        pem.extend(self.intermediate.to_pem().unwrap());
        pem
    }

    pub fn leaf_key_pem(&self) -> Vec<u8> {
        self.leaf_key.private_key_to_pem_pkcs8().unwrap()
    }

    pub fn server_identity(&self) -> Identity {
        Identity::new(self.server_chain(), self.leaf_key.clone()).unwrap()
    }

    pub fn expired_identity(&self) -> Identity {
        let chain = vec![self.expired_leaf.clone(), self.intermediate.clone()];
        Identity::new(chain, self.leaf_key.clone()).unwrap()
    }

    pub fn client_identity(&self) -> Identity {
        Identity::new(self.client_chain(), self.client_key.clone()).unwrap()
    }
}
