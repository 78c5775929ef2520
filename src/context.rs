//! TLS contexts
//!
//! A [`Context`] bundles trust material, an optional local identity and the
//! negotiation policy. It is mutable until the first connection is wrapped;
//! from then on it is frozen and setters fail with a configuration error.
//! Connections share the frozen configuration, so a context can serve any
//! number of connections on any number of threads.

use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use log::debug;
use socket2::Socket;

use crate::config::{
    parse_cipher_list, validate_alpn, CipherSuite, ClientVerify, Policy, ProtocolVersion, Purpose,
    Role, VerifyMode,
};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::transport::{stream_socket, Transport};
use crate::trust::{TrustSource, TrustStore};
use crate::verify::{validate_server_name, CertificateVerifier, ChainVerifier, WildcardPolicy};

/// Everything a connection reads from its context
#[derive(Clone)]
pub struct ContextConfig {
    pub(crate) trust: TrustStore,
    pub(crate) identity: Option<Identity>,
    pub(crate) purpose: Purpose,
    pub(crate) policy: Policy,
    pub(crate) verifier: Arc<dyn CertificateVerifier>,
}

impl ContextConfig {
    pub(crate) fn new(trust: TrustStore, purpose: Purpose) -> Self {
        ContextConfig {
            trust,
            identity: None,
            purpose,
            policy: Policy::for_purpose(purpose),
            verifier: Arc::new(ChainVerifier::new()),
        }
    }
}

/// Factory for TLS connections
pub struct Context {
    config: ContextConfig,
    frozen: OnceLock<Arc<ContextConfig>>,
}

impl Context {
    /// Context with defaults for `purpose` and the given trust store
    ///
    /// `ServerAuth` contexts verify the server chain and hostname;
    /// `ClientAuth` contexts don't verify peers until configured to.
    pub fn new(trust: TrustStore, purpose: Purpose) -> Self {
        Context {
            config: ContextConfig::new(trust, purpose),
            frozen: OnceLock::new(),
        }
    }

    /// Load trust material from `source` and build a context for `purpose`
    pub fn create_default(source: &TrustSource, purpose: Purpose) -> Result<Self> {
        let trust = TrustStore::load(source)?;
        debug!(
            "created {:?} context with {} trust anchors",
            purpose,
            trust.len()
        );
        Ok(Self::new(trust, purpose))
    }

    fn config_mut(&mut self) -> Result<&mut ContextConfig> {
        if self.frozen.get().is_some() {
            return Err(Error::Config(
                "context is frozen once a connection has been created".to_string(),
            ));
        }
        Ok(&mut self.config)
    }

    /// Snapshot shared with every connection; freezes the context
    fn freeze(&self) -> Arc<ContextConfig> {
        self.frozen
            .get_or_init(|| {
                debug!("freezing context");
                Arc::new(self.config.clone())
            })
            .clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    /// Load a certificate chain and private key from PEM files
    pub fn load_identity<P: AsRef<Path>, Q: AsRef<Path>>(&mut self, chain_path: P, key_path: Q) -> Result<()> {
        let identity = Identity::from_pem_files(chain_path, key_path)?;
        self.set_identity(identity)
    }

    /// Load a certificate chain and private key from PEM text
    pub fn load_identity_pem(&mut self, chain_pem: &[u8], key_pem: &[u8]) -> Result<()> {
        let identity = Identity::from_pem(chain_pem, key_pem)?;
        self.set_identity(identity)
    }

    pub fn set_identity(&mut self, identity: Identity) -> Result<()> {
        self.config_mut()?.identity = Some(identity);
        Ok(())
    }

    /// Restrict negotiation to versions between `min` and `max`
    pub fn set_version_bounds(&mut self, min: ProtocolVersion, max: ProtocolVersion) -> Result<()> {
        if min > max {
            return Err(Error::Config(format!(
                "minimum version {} is above maximum version {}",
                min, max
            )));
        }
        let policy = &mut self.config_mut()?.policy;
        policy.min_version = min;
        policy.max_version = max;
        Ok(())
    }

    /// Enable exactly `suites`, most preferred first
    pub fn set_cipher_preferences(&mut self, suites: &[CipherSuite]) -> Result<()> {
        if suites.is_empty() {
            return Err(Error::Config("cipher suite list is empty".to_string()));
        }
        let mut ordered: Vec<CipherSuite> = Vec::with_capacity(suites.len());
        for suite in suites {
            if !ordered.contains(suite) {
                ordered.push(*suite);
            }
        }
        self.config_mut()?.policy.cipher_suites = ordered;
        Ok(())
    }

    /// Like [`set_cipher_preferences`](Self::set_cipher_preferences) with
    /// a colon-separated list of suite names
    pub fn set_cipher_list(&mut self, list: &str) -> Result<()> {
        let suites = parse_cipher_list(list)?;
        self.set_cipher_preferences(&suites)
    }

    pub fn set_verify_mode(&mut self, mode: VerifyMode) -> Result<()> {
        self.config_mut()?.policy.verify_mode = mode;
        Ok(())
    }

    /// Whether a server requests and requires client certificates
    pub fn set_client_verify(&mut self, mode: ClientVerify) -> Result<()> {
        self.config_mut()?.policy.client_verify = mode;
        Ok(())
    }

    /// ALPN protocols in preference order; empty disables ALPN
    pub fn set_alpn_protocols(&mut self, protocols: &[&str]) -> Result<()> {
        let protocols = validate_alpn(protocols)?;
        self.config_mut()?.policy.alpn_protocols = protocols;
        Ok(())
    }

    pub fn set_wildcard_policy(&mut self, wildcard: WildcardPolicy) -> Result<()> {
        self.config_mut()?.policy.wildcard = wildcard;
        Ok(())
    }

    /// Replace the certificate verifier
    pub fn set_verifier(&mut self, verifier: Arc<dyn CertificateVerifier>) -> Result<()> {
        self.config_mut()?.verifier = verifier;
        Ok(())
    }

    /// Wrap `transport` in a connection; the handshake runs on first use
    ///
    /// Clients checking hostnames must pass `server_hostname`. Servers must
    /// have an identity and must not pass a hostname.
    pub fn wrap<T: Transport>(&self, transport: T, role: Role, server_hostname: Option<&str>) -> Result<Connection<T>> {
        self.check_wrap(role, server_hostname)?;
        let config = self.freeze();
        debug!(
            "wrapping {} connection for {}",
            role.as_str(),
            server_hostname.unwrap_or("<no hostname>")
        );
        Ok(Connection::new(
            transport,
            config,
            role,
            server_hostname.map(str::to_string),
        ))
    }

    /// Wrap an owned descriptor, which must be a connected stream socket
    pub fn wrap_fd(&self, fd: OwnedFd, role: Role, server_hostname: Option<&str>) -> Result<Connection<Socket>> {
        self.check_wrap(role, server_hostname)?;
        let socket = stream_socket(fd)?;
        self.wrap(socket, role, server_hostname)
    }

    /// Connect over TCP and complete a client handshake
    pub fn connect<A: ToSocketAddrs>(&self, addr: A, server_hostname: Option<&str>) -> Result<Connection<TcpStream>> {
        self.check_wrap(Role::Client, server_hostname)?;
        let stream = TcpStream::connect(addr).map_err(Error::Connection)?;
        let mut conn = self.wrap(stream, Role::Client, server_hostname)?;
        conn.handshake()?;
        Ok(conn)
    }

    /// Complete a server handshake on an accepted TCP stream
    pub fn accept(&self, stream: TcpStream) -> Result<Connection<TcpStream>> {
        let mut conn = self.wrap(stream, Role::Server, None)?;
        conn.handshake()?;
        Ok(conn)
    }

    fn check_wrap(&self, role: Role, server_hostname: Option<&str>) -> Result<()> {
        let config = &self.config;
        config.policy.validate()?;
        match role {
            Role::Client => {
                match server_hostname {
                    Some(name) => validate_server_name(name).map_err(Error::Config)?,
                    None if config.policy.verify_mode.checks_hostname() => {
                        return Err(Error::Config(
                            "server_hostname is required when checking hostnames".to_string(),
                        ))
                    }
                    None => {}
                }
            }
            Role::Server => {
                if server_hostname.is_some() {
                    return Err(Error::Config(
                        "server_hostname is only valid for client connections".to_string(),
                    ));
                }
                if config.identity.is_none() {
                    return Err(Error::Config(
                        "server connections require a certificate and private key".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn purpose(&self) -> Purpose {
        self.config.purpose
    }

    pub fn policy(&self) -> &Policy {
        &self.config.policy
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.config.trust
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.config.identity.as_ref()
    }

    pub fn verify_mode(&self) -> VerifyMode {
        self.config.policy.verify_mode
    }

    pub fn client_verify(&self) -> ClientVerify {
        self.config.policy.client_verify
    }

    pub fn minimum_version(&self) -> ProtocolVersion {
        self.config.policy.min_version
    }

    pub fn maximum_version(&self) -> ProtocolVersion {
        self.config.policy.max_version
    }

    pub fn cipher_suites(&self) -> &[CipherSuite] {
        &self.config.policy.cipher_suites
    }
}

/// The copy is not frozen, even if `self` is
impl Clone for Context {
    fn clone(&self) -> Self {
        Context {
            config: self.config.clone(),
            frozen: OnceLock::new(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("purpose", &self.config.purpose)
            .field("policy", &self.config.policy)
            .field("trust_anchors", &self.config.trust.len())
            .field("identity", &self.config.identity.is_some())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Pki;
    use std::os::unix::net::UnixStream;

    fn server_context(pki: &Pki) -> Context {
        let mut ctx = Context::new(pki.trust(), Purpose::ClientAuth);
        ctx.set_identity(pki.server_identity()).unwrap();
        ctx
    }

    #[test]
    fn test_create_default_from_pem() {
        let pki = Pki::new();
        let pem = String::from_utf8(pki.root_pem()).unwrap();
        let ctx = Context::create_default(&TrustSource::Pem(pem), Purpose::ServerAuth).unwrap();
        assert_eq!(ctx.trust_store().len(), 1);
        assert_eq!(ctx.verify_mode(), VerifyMode::PeerAndHostname);
        assert_eq!(ctx.purpose(), Purpose::ServerAuth);
        assert!(!ctx.is_frozen());
    }

    #[test]
    fn test_create_default_missing_file() {
        let source = TrustSource::File("/nonexistent/jimmies/ca.pem".into());
        let err = Context::create_default(&source, Purpose::ServerAuth).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_frozen_after_wrap() {
        let pki = Pki::new();
        let mut ctx = Context::new(pki.trust(), Purpose::ServerAuth);
        let (a, _b) = UnixStream::pair().unwrap();
        let _conn = ctx.wrap(a, Role::Client, Some("jimmies.local")).unwrap();
        assert!(ctx.is_frozen());

        let err = ctx.set_verify_mode(VerifyMode::None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // A clone can be configured again
        let mut copy = ctx.clone();
        assert!(!copy.is_frozen());
        copy.set_verify_mode(VerifyMode::None).unwrap();
    }

    #[test]
    fn test_wrap_requires_hostname_when_checking() {
        let pki = Pki::new();
        let mut ctx = Context::new(pki.trust(), Purpose::ServerAuth);
        let (a, _b) = UnixStream::pair().unwrap();
        let err = ctx.wrap(a, Role::Client, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!ctx.is_frozen());

        ctx.set_verify_mode(VerifyMode::Peer).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(ctx.wrap(a, Role::Client, None).is_ok());
    }

    #[test]
    fn test_wrap_rejects_bad_hostname() {
        let pki = Pki::new();
        let ctx = Context::new(pki.trust(), Purpose::ServerAuth);
        let (a, _b) = UnixStream::pair().unwrap();
        let err = ctx.wrap(a, Role::Client, Some("bad host")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_server_requires_identity() {
        let pki = Pki::new();
        let ctx = Context::new(pki.trust(), Purpose::ClientAuth);
        let (a, _b) = UnixStream::pair().unwrap();
        let err = ctx.wrap(a, Role::Server, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let ctx = server_context(&pki);
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(ctx.wrap(a, Role::Server, None).is_ok());

        let (a, _b) = UnixStream::pair().unwrap();
        assert!(ctx.wrap(a, Role::Server, Some("jimmies.local")).is_err());
    }

    #[test]
    fn test_version_bounds() {
        let pki = Pki::new();
        let mut ctx = Context::new(pki.trust(), Purpose::ServerAuth);
        let err = ctx
            .set_version_bounds(ProtocolVersion::Tls13, ProtocolVersion::Tls12)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        ctx.set_version_bounds(ProtocolVersion::Tls13, ProtocolVersion::Tls13)
            .unwrap();
        assert_eq!(ctx.minimum_version(), ProtocolVersion::Tls13);

        // Only a 1.2 suite left while pinned to 1.3
        ctx.set_cipher_preferences(&[CipherSuite::EcdheEcdsaAes128GcmSha256])
            .unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(matches!(
            ctx.wrap(a, Role::Client, Some("jimmies.local")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_cipher_configuration() {
        let pki = Pki::new();
        let mut ctx = Context::new(pki.trust(), Purpose::ServerAuth);
        ctx.set_cipher_list("TLS_CHACHA20_POLY1305_SHA256:TLS_AES_128_GCM_SHA256:TLS_CHACHA20_POLY1305_SHA256")
            .unwrap();
        assert_eq!(
            ctx.cipher_suites(),
            &[
                CipherSuite::Tls13Chacha20Poly1305Sha256,
                CipherSuite::Tls13Aes128GcmSha256
            ]
        );
        assert!(ctx.set_cipher_preferences(&[]).is_err());
        assert!(ctx.set_cipher_list("NOT-A-SUITE").is_err());
        assert!(ctx.set_alpn_protocols(&["h2", ""]).is_err());
        ctx.set_alpn_protocols(&["h2", "http/1.1"]).unwrap();
        assert_eq!(ctx.policy().alpn_protocols.len(), 2);
    }

    #[test]
    fn test_wrap_fd_rejects_file() {
        let pki = Pki::new();
        let ctx = Context::new(pki.trust(), Purpose::ServerAuth);
        let file = tempfile::tempfile().unwrap();
        let err = ctx
            .wrap_fd(OwnedFd::from(file), Role::Client, Some("jimmies.local"))
            .unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }
}
