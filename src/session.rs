//! Negotiated session parameters
//!
//! A [`Session`] is produced once per connection when the handshake
//! finishes and never changes afterwards.

use crate::cert::PeerIdentity;
use crate::config::{CipherSuite, ProtocolVersion};

/// Parameters agreed during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    version: ProtocolVersion,
    cipher_suite: CipherSuite,
    peer: Option<PeerIdentity>,
    alpn_protocol: Option<Vec<u8>>,
    server_name: Option<String>,
}

impl Session {
    pub(crate) fn new(
        version: ProtocolVersion,
        cipher_suite: CipherSuite,
        peer: Option<PeerIdentity>,
        alpn_protocol: Option<Vec<u8>>,
        server_name: Option<String>,
    ) -> Self {
        Session {
            version,
            cipher_suite,
            peer,
            alpn_protocol,
            server_name,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    /// `(suite name, version label, secret key bits)`
    pub fn cipher(&self) -> (&'static str, &'static str, u32) {
        (
            self.cipher_suite.name(),
            self.version.as_str(),
            self.cipher_suite.key_bits(),
        )
    }

    /// Verified peer identity
    ///
    /// `None` when verification was disabled or the peer sent no
    /// certificate.
    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn_protocol.as_deref()
    }

    /// SNI name: the expected hostname on the client, the requested one on
    /// the server
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_tuple() {
        let session = Session::new(
            ProtocolVersion::Tls13,
            CipherSuite::Tls13Aes256GcmSha384,
            None,
            Some(b"h2".to_vec()),
            Some("jimmies.local".to_string()),
        );
        assert_eq!(session.cipher(), ("TLS_AES_256_GCM_SHA384", "TLSv1.3", 256));
        assert_eq!(session.alpn_protocol(), Some(&b"h2"[..]));
        assert_eq!(session.server_name(), Some("jimmies.local"));
        assert!(session.peer().is_none());
    }
}
