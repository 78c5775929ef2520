//! Peer certificate information
//!
//! Summaries of X.509 certificates exposed to applications after a
//! verified handshake.

use std::net::{Ipv4Addr, Ipv6Addr};

use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509Ref};

/// Identity of a verified peer, taken from its leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Certificate subject (Common Name)
    pub subject: String,
    /// Certificate issuer (Common Name)
    pub issuer: String,
    /// Subject Alternative Names, as `DNS:name` or `IP:address`
    pub subject_alt_names: Vec<String>,
    /// DER encoding of the leaf certificate
    pub der: Vec<u8>,
}

impl PeerIdentity {
    /// Extract identity information from an X.509 certificate
    pub fn from_x509(cert: &X509Ref) -> Result<Self, ErrorStack> {
        Ok(PeerIdentity {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: subject_alt_names(cert),
            der: cert.to_der()?,
        })
    }

    /// DNS names from the SAN extension
    pub fn dns_names(&self) -> impl Iterator<Item = &str> {
        self.subject_alt_names
            .iter()
            .filter_map(|name| name.strip_prefix("DNS:"))
    }
}

/// Common Name of an X.509 name, or `<undef>` when absent
pub(crate) fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<undef>".to_string())
}

fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let Some(sans) = cert.subject_alt_names() else {
        return Vec::new();
    };
    sans.iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                return Some(format!("DNS:{}", dns));
            }
            let ip = name.ipaddress()?;
            match ip.len() {
                4 => {
                    let octets: [u8; 4] = ip.try_into().ok()?;
                    Some(format!("IP:{}", Ipv4Addr::from(octets)))
                }
                16 => {
                    let octets: [u8; 16] = ip.try_into().ok()?;
                    Some(format!("IP:{}", Ipv6Addr::from(octets)))
                }
                _ => None,
            }
        })
        .collect()
}
