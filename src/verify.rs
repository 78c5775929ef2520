//! Certificate verification
//!
//! [`ChainVerifier`] is the default [`CertificateVerifier`]. It walks a peer
//! chain (leaf first) and stops at the first failure, checking in order:
//!
//! 1. the chain is non-empty and every certificate is issued and signed by
//!    the next one;
//! 2. the top of the chain is a trust anchor or is signed by one, and that
//!    anchor is currently valid;
//! 3. every certificate of the chain is currently valid;
//! 4. every certificate above the leaf is a CA allowed to issue at its
//!    depth, and the leaf's extended key usage allows the expected purpose;
//! 5. the leaf names the expected host (RFC 6125 rules).
//!
//! Step 4 runs the chain through OpenSSL's own path validation, which
//! knows basicConstraints, pathLenConstraint, keyUsage and
//! extendedKeyUsage.

use std::cmp::Ordering;
use std::net::IpAddr;

use log::debug;
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::{X509VerifyFlags, X509VerifyParam};
use openssl::x509::{X509PurposeId, X509Ref, X509StoreContext, X509VerifyResult, X509};

use crate::alert::AlertDescription;
use crate::cert::PeerIdentity;
use crate::config::Purpose;
use crate::trust::TrustStore;

/// Why a peer certificate chain was rejected
///
/// Chain, trust and hostname failures all read "invalid certificate: ...",
/// matching the `TLSException` message of the socket API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("invalid certificate: empty certificate chain")]
    EmptyChain,

    #[error("invalid certificate: chain broken at depth {0}")]
    BrokenChain(usize),

    #[error("invalid certificate: bad signature at depth {0}")]
    BadSignature(usize),

    #[error("invalid certificate: unknown issuer")]
    UnknownIssuer,

    #[error("certificate expired at depth {0}")]
    Expired(usize),

    #[error("certificate not yet valid at depth {0}")]
    NotYetValid(usize),

    #[error("invalid certificate: issuer at depth {0} is not a CA")]
    NotCa(usize),

    #[error("invalid certificate: path length constraint exceeded at depth {0}")]
    PathLengthExceeded(usize),

    #[error("invalid certificate: not valid for {0}")]
    WrongPurpose(&'static str),

    #[error("invalid certificate: hostname mismatch for {0:?}")]
    HostnameMismatch(String),

    #[error("invalid certificate: peer sent no certificate")]
    NoCertificate,

    #[error("invalid certificate: {0}")]
    Malformed(String),
}

impl VerificationError {
    /// Alert that reports this failure to the peer
    pub fn alert(&self) -> AlertDescription {
        match self {
            VerificationError::UnknownIssuer => AlertDescription::UnknownCa,
            VerificationError::Expired(_) | VerificationError::NotYetValid(_) => {
                AlertDescription::CertificateExpired
            }
            VerificationError::NoCertificate => AlertDescription::CertificateRequired,
            _ => AlertDescription::BadCertificate,
        }
    }
}

/// Wildcard handling for dNSName matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WildcardPolicy {
    /// `*.example.com` matches exactly one leftmost label
    #[default]
    LeftmostLabel,
    /// Wildcard names never match
    Disabled,
}

/// Validates peer certificate chains
///
/// Implementations must be usable from every connection of a frozen
/// context at once.
pub trait CertificateVerifier: Send + Sync {
    /// Verify `chain` (leaf first) and return the leaf's identity
    ///
    /// `purpose` names what the leaf must be usable for: `ServerAuth` when
    /// a client checks a server, `ClientAuth` when a server checks a
    /// client.
    fn verify(
        &self,
        chain: &[X509],
        trust: &TrustStore,
        hostname: Option<&str>,
        wildcard: WildcardPolicy,
        purpose: Purpose,
    ) -> Result<PeerIdentity, VerificationError>;
}

/// Default chain and hostname verifier
#[derive(Debug, Clone, Default)]
pub struct ChainVerifier {
    /// Verification time as a Unix timestamp; `None` means now
    time: Option<i64>,
}

impl ChainVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify as if the current time were `unix_time`
    pub fn at_time(unix_time: i64) -> Self {
        ChainVerifier {
            time: Some(unix_time),
        }
    }

    fn now(&self) -> Result<Asn1Time, VerificationError> {
        match self.time {
            Some(t) => Asn1Time::from_unix(t as libc::time_t),
            None => Asn1Time::days_from_now(0),
        }
        .map_err(|e| VerificationError::Malformed(format!("clock: {}", e)))
    }

    fn check_validity(
        cert: &X509Ref,
        now: &Asn1TimeRef,
        depth: usize,
    ) -> Result<(), VerificationError> {
        let compare = |t: &Asn1TimeRef| {
            now.compare(t)
                .map_err(|e| VerificationError::Malformed(format!("validity time: {}", e)))
        };
        if compare(cert.not_before())? == Ordering::Less {
            return Err(VerificationError::NotYetValid(depth));
        }
        if compare(cert.not_after())? == Ordering::Greater {
            return Err(VerificationError::Expired(depth));
        }
        Ok(())
    }

    fn signed_by(cert: &X509Ref, issuer: &X509Ref) -> bool {
        issuer
            .public_key()
            .and_then(|key| cert.verify(&key))
            .unwrap_or(false)
    }

    /// CA, path length and key usage constraints of the whole path
    fn check_constraints(
        &self,
        chain: &[X509],
        trust: &TrustStore,
        purpose: Purpose,
    ) -> Result<(), VerificationError> {
        let outcome = self
            .run_store_context(chain, trust, purpose)
            .map_err(|e| VerificationError::Malformed(format!("path validation: {}", e)))?;
        match outcome {
            None => Ok(()),
            Some((result, depth)) => Err(constraint_error(result, depth, purpose)),
        }
    }

    /// Verify with OpenSSL; `Some((error, depth))` on rejection
    fn run_store_context(
        &self,
        chain: &[X509],
        trust: &TrustStore,
        purpose: Purpose,
    ) -> Result<Option<(X509VerifyResult, usize)>, ErrorStack> {
        let mut param = X509VerifyParam::new()?;
        // The chain top may itself be the configured anchor
        param.set_flags(X509VerifyFlags::PARTIAL_CHAIN)?;
        param.set_purpose(match purpose {
            Purpose::ServerAuth => X509PurposeId::SSL_SERVER,
            Purpose::ClientAuth => X509PurposeId::SSL_CLIENT,
        })?;
        if let Some(t) = self.time {
            param.set_time(t as libc::time_t);
        }

        let mut store = X509StoreBuilder::new()?;
        for root in trust.roots() {
            store.add_cert(root.clone())?;
        }
        store.set_param(&param)?;
        let store = store.build();

        let mut untrusted = Stack::new()?;
        for cert in &chain[1..] {
            untrusted.push(cert.clone())?;
        }

        let mut context = X509StoreContext::new()?;
        context.init(&store, &chain[0], &untrusted, |ctx| {
            if ctx.verify_cert()? {
                Ok(None)
            } else {
                Ok(Some((ctx.error(), ctx.error_depth() as usize)))
            }
        })
    }
}

/// Map an OpenSSL path validation failure onto a verification error
fn constraint_error(result: X509VerifyResult, depth: usize, purpose: Purpose) -> VerificationError {
    match result.as_raw() {
        openssl_sys::X509_V_ERR_INVALID_CA | openssl_sys::X509_V_ERR_KEYUSAGE_NO_CERTSIGN => {
            VerificationError::NotCa(depth)
        }
        openssl_sys::X509_V_ERR_PATH_LENGTH_EXCEEDED => VerificationError::PathLengthExceeded(depth),
        openssl_sys::X509_V_ERR_INVALID_PURPOSE => VerificationError::WrongPurpose(match purpose {
            Purpose::ServerAuth => "server authentication",
            Purpose::ClientAuth => "client authentication",
        }),
        openssl_sys::X509_V_ERR_CERT_HAS_EXPIRED => VerificationError::Expired(depth),
        openssl_sys::X509_V_ERR_CERT_NOT_YET_VALID => VerificationError::NotYetValid(depth),
        openssl_sys::X509_V_ERR_CERT_SIGNATURE_FAILURE => VerificationError::BadSignature(depth),
        openssl_sys::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY
        | openssl_sys::X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE => VerificationError::UnknownIssuer,
        _ => VerificationError::Malformed(format!(
            "{} at depth {}",
            result.error_string(),
            depth
        )),
    }
}

impl CertificateVerifier for ChainVerifier {
    fn verify(
        &self,
        chain: &[X509],
        trust: &TrustStore,
        hostname: Option<&str>,
        wildcard: WildcardPolicy,
        purpose: Purpose,
    ) -> Result<PeerIdentity, VerificationError> {
        let leaf = chain.first().ok_or(VerificationError::EmptyChain)?;

        for (depth, pair) in chain.windows(2).enumerate() {
            let (cert, issuer) = (&pair[0], &pair[1]);
            if issuer.issued(cert) != X509VerifyResult::OK {
                return Err(VerificationError::BrokenChain(depth));
            }
            if !Self::signed_by(cert, issuer) {
                return Err(VerificationError::BadSignature(depth));
            }
        }

        let now = self.now()?;
        let top_depth = chain.len() - 1;
        let top = &chain[top_depth];
        if trust.contains(top) {
            debug!("chain top at depth {} is a trust anchor", top_depth);
        } else {
            let anchor = trust
                .find_issuer(top)
                .filter(|anchor| Self::signed_by(top, anchor))
                .ok_or(VerificationError::UnknownIssuer)?;
            Self::check_validity(anchor, &now, chain.len())?;
        }

        for (depth, cert) in chain.iter().enumerate() {
            Self::check_validity(cert, &now, depth)?;
        }

        self.check_constraints(chain, trust, purpose)?;

        if let Some(name) = hostname {
            verify_hostname(leaf, name, wildcard)?;
        }

        let identity = PeerIdentity::from_x509(leaf)
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;
        debug!("verified peer certificate {}", identity.subject);
        Ok(identity)
    }
}

/// Check that `cert` names `hostname`
///
/// SAN entries take precedence; the subject CN is only consulted when the
/// certificate has no SAN extension. IP literals only match iPAddress SANs.
pub fn verify_hostname(
    cert: &X509Ref,
    hostname: &str,
    wildcard: WildcardPolicy,
) -> Result<(), VerificationError> {
    let mismatch = || VerificationError::HostnameMismatch(hostname.to_string());
    let name = hostname.trim();
    if name.is_empty() {
        return Err(mismatch());
    }

    let sans = cert.subject_alt_names();

    if let Ok(ip) = name.parse::<IpAddr>() {
        let octets = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let found = sans
            .iter()
            .flatten()
            .filter_map(|san| san.ipaddress())
            .any(|addr| addr == octets.as_slice());
        return if found { Ok(()) } else { Err(mismatch()) };
    }

    let matched = match sans {
        Some(sans) => sans
            .iter()
            .filter_map(|san| san.dnsname())
            .any(|pattern| matches_dns(pattern, name, wildcard)),
        None => cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .filter_map(|entry| std::str::from_utf8(entry.data().as_slice()).ok())
            // An embedded NUL must not cut the name short
            .filter(|cn| !cn.contains('\0'))
            .any(|cn| matches_dns(cn, name, wildcard)),
    };
    if matched {
        Ok(())
    } else {
        Err(mismatch())
    }
}

/// Match a certificate name pattern against a hostname, ignoring case
///
/// A wildcard must be the whole leftmost label, needs at least two labels
/// after it and stands for exactly one label.
pub fn matches_dns(pattern: &str, hostname: &str, wildcard: WildcardPolicy) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();

    if !pattern.contains('*') {
        return pattern == hostname;
    }
    if wildcard == WildcardPolicy::Disabled {
        return false;
    }

    let labels: Vec<&str> = pattern.split('.').collect();
    if labels.len() < 3 || labels[0] != "*" || labels[1..].iter().any(|l| l.contains('*')) {
        return false;
    }

    let host_labels: Vec<&str> = hostname.split('.').collect();
    host_labels.len() == labels.len()
        && !host_labels[0].is_empty()
        && labels[1..] == host_labels[1..]
}

/// Check an expected server name is a DNS name or an IP literal
pub fn validate_server_name(name: &str) -> Result<(), String> {
    if name.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let dns = name.strip_suffix('.').unwrap_or(name);
    if dns.is_empty() || dns.len() > 253 {
        return Err(format!("invalid server name {:?}", name));
    }
    for label in dns.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(format!("invalid server name {:?}", name));
        }
    }
    Ok(())
}
