//! Handshake state machine
//!
//! [`HandshakeEngine`] performs no I/O. The connection feeds it complete
//! handshake messages and carries out the [`Action`]s it returns, in order:
//! sealing messages under the current write keys and switching record
//! keys at the points the protocol dictates.
//!
//! ```text
//! Start -> VersionNegotiated -> KeyExchanged -> PeerAuthenticated -> Finished
//!   \__________________________________________________________\-> Aborted
//! ```

mod client;
pub mod codec;
mod server;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};
use openssl::pkey::{PKey, Public};
use openssl::x509::X509;

use crate::cert::PeerIdentity;
use crate::config::{CipherSuite, ProtocolVersion, Role};
use crate::context::ContextConfig;
use crate::crypto::key_schedule::KeySchedule;
use crate::crypto::kx::KeyExchange;
use crate::crypto::{SignatureScheme, TrafficKeys, Transcript};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::verify::VerificationError;

pub use codec::{HandshakeJoiner, HandshakeMessage, HandshakeType};

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    VersionNegotiated,
    KeyExchanged,
    PeerAuthenticated,
    Finished,
    Aborted,
}

/// Work the connection must do on behalf of the engine
pub enum Action {
    /// Encoded handshake message to send under the current write keys
    Send(Bytes),
    /// Protect every later outgoing record with these keys
    InstallWriteKeys(TrafficKeys),
    /// Open every later incoming record with these keys
    InstallReadKeys(TrafficKeys),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Send(bytes) => write!(f, "Send({} bytes)", bytes.len()),
            Action::InstallWriteKeys(_) => f.write_str("InstallWriteKeys"),
            Action::InstallReadKeys(_) => f.write_str("InstallReadKeys"),
        }
    }
}

/// Next message the engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    ClientHello,
    ServerHello,
    Certificate,
    CertificateVerify,
    Finished,
    Nothing,
}

/// Context strings of CertificateVerify signatures
const SERVER_SIGNATURE_CONTEXT: &[u8] = b"TLS 1.3, server CertificateVerify";
const CLIENT_SIGNATURE_CONTEXT: &[u8] = b"TLS 1.3, client CertificateVerify";

/// Sans-IO handshake for one connection
pub struct HandshakeEngine {
    role: Role,
    config: Arc<ContextConfig>,
    server_name: Option<String>,
    state: HandshakeState,
    expect: Expect,
    transcript: Transcript,
    kx: Option<KeyExchange>,
    schedule: Option<KeySchedule>,
    version: Option<ProtocolVersion>,
    suite: Option<CipherSuite>,
    alpn_protocol: Option<Vec<u8>>,
    peer: Option<PeerIdentity>,
    peer_key: Option<PKey<Public>>,
    certificate_requested: bool,
    pending_read_keys: Option<TrafficKeys>,
    session: Option<Session>,
}

impl HandshakeEngine {
    pub fn new(role: Role, config: Arc<ContextConfig>, server_name: Option<String>) -> Self {
        HandshakeEngine {
            role,
            config,
            server_name,
            state: HandshakeState::Start,
            expect: match role {
                Role::Client => Expect::ServerHello,
                Role::Server => Expect::ClientHello,
            },
            transcript: Transcript::new(),
            kx: None,
            schedule: None,
            version: None,
            suite: None,
            alpn_protocol: None,
            peer: None,
            peer_key: None,
            certificate_requested: false,
            pending_read_keys: None,
            session: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_finished(&self) -> bool {
        self.state == HandshakeState::Finished
    }

    /// First flight; only the client has one
    pub fn start(&mut self) -> Result<Vec<Action>> {
        match self.role {
            Role::Client => self.client_start(),
            Role::Server => Ok(Vec::new()),
        }
    }

    /// Process one complete handshake message and its encoding
    pub fn handle(&mut self, message: HandshakeMessage, raw: &[u8]) -> Result<Vec<Action>> {
        if matches!(self.state, HandshakeState::Finished | HandshakeState::Aborted) {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} after the handshake ended",
                message.typ()
            )));
        }
        trace!("{} received {:?}", self.role.as_str(), message.typ());
        match self.role {
            Role::Client => self.client_handle(message, raw),
            Role::Server => self.server_handle(message, raw),
        }
    }

    /// Mark the handshake failed; every later message is rejected
    pub fn abort(&mut self) {
        if self.state != HandshakeState::Aborted {
            debug!("{} handshake aborted in state {:?}", self.role.as_str(), self.state);
            self.state = HandshakeState::Aborted;
            self.expect = Expect::Nothing;
            self.kx = None;
            self.schedule = None;
            self.pending_read_keys = None;
        }
    }

    /// Session produced by a finished handshake; taken once
    pub fn take_session(&mut self) -> Option<Session> {
        self.session.take()
    }

    fn set_state(&mut self, state: HandshakeState) {
        debug!("{} handshake {:?} -> {:?}", self.role.as_str(), self.state, state);
        self.state = state;
    }

    fn unexpected(&self, message: &HandshakeMessage) -> Error {
        Error::UnexpectedMessage(format!(
            "expected {:?}, got {:?}",
            self.expect,
            message.typ()
        ))
    }

    fn suite(&self) -> Result<CipherSuite> {
        self.suite
            .ok_or_else(|| Error::State("cipher suite not negotiated".to_string()))
    }

    fn schedule(&mut self) -> Result<&mut KeySchedule> {
        self.schedule
            .as_mut()
            .ok_or_else(|| Error::State("key schedule not started".to_string()))
    }

    fn transcript_hash(&self) -> Result<Vec<u8>> {
        Ok(self.transcript.hash(self.suite()?.hash())?)
    }

    /// Encode `message`, add it to the transcript and queue it
    fn send(&mut self, message: HandshakeMessage, actions: &mut Vec<Action>) {
        trace!("{} sending {:?}", self.role.as_str(), message.typ());
        let encoded = message.encode();
        self.transcript.add(&encoded);
        actions.push(Action::Send(encoded));
    }

    /// Parse a peer certificate message and run the verifier on it
    ///
    /// Returns whether the peer presented a certificate.
    fn accept_certificate(&mut self, chain_der: &[Vec<u8>], hostname: Option<&str>, verify: bool) -> Result<bool> {
        if chain_der.is_empty() {
            return Ok(false);
        }
        let chain = chain_der
            .iter()
            .map(|der| X509::from_der(der))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VerificationError::Malformed(format!("unparseable certificate: {}", e)))?;

        if verify {
            let identity = self.config.verifier.verify(
                &chain,
                &self.config.trust,
                hostname,
                self.config.policy.wildcard,
                self.role.peer_purpose(),
            )?;
            self.peer = Some(identity);
        } else {
            debug!("{} skipping peer certificate verification", self.role.as_str());
        }

        let key = chain[0]
            .public_key()
            .map_err(|e| VerificationError::Malformed(format!("unreadable public key: {}", e)))?;
        self.peer_key = Some(key);
        Ok(true)
    }

    /// Check the peer's CertificateVerify over the transcript so far
    fn check_certificate_verify(&self, scheme: u16, signature: &[u8], peer_is_server: bool) -> Result<()> {
        let scheme = SignatureScheme::from_id(scheme).ok_or_else(|| {
            Error::Protocol(format!("unsupported signature scheme {:#06x}", scheme))
        })?;
        let key = self
            .peer_key
            .as_ref()
            .ok_or_else(|| Error::UnexpectedMessage("CertificateVerify without certificate".to_string()))?;
        let content = signed_content(peer_is_server, &self.transcript_hash()?);
        if !scheme.verify(key, &content, signature) {
            return Err(Error::Protocol(format!(
                "invalid {} signature in CertificateVerify",
                scheme.name()
            )));
        }
        Ok(())
    }

    /// Produce our CertificateVerify from the loaded identity
    fn certificate_verify(&self, server: bool) -> Result<HandshakeMessage> {
        let identity = self
            .config
            .identity
            .as_ref()
            .ok_or_else(|| Error::Config("no identity loaded".to_string()))?;
        let content = signed_content(server, &self.transcript_hash()?);
        let signature = identity.scheme().sign(identity.key(), &content)?;
        Ok(HandshakeMessage::CertificateVerify {
            scheme: identity.scheme().id(),
            signature,
        })
    }

    fn finish(&mut self) -> Result<()> {
        let version = self
            .version
            .ok_or_else(|| Error::State("version not negotiated".to_string()))?;
        let suite = self.suite()?;
        self.session = Some(Session::new(
            version,
            suite,
            self.peer.take(),
            self.alpn_protocol.take(),
            self.server_name.clone(),
        ));
        self.kx = None;
        self.schedule = None;
        self.expect = Expect::Nothing;
        self.set_state(HandshakeState::Finished);
        debug!(
            "{} negotiated {} with {}",
            self.role.as_str(),
            version,
            suite
        );
        Ok(())
    }
}

impl fmt::Debug for HandshakeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("expect", &self.expect)
            .field("version", &self.version)
            .field("suite", &self.suite)
            .finish()
    }
}

/// Bytes covered by a CertificateVerify signature
fn signed_content(server: bool, transcript_hash: &[u8]) -> Vec<u8> {
    let context = if server {
        SERVER_SIGNATURE_CONTEXT
    } else {
        CLIENT_SIGNATURE_CONTEXT
    };
    let mut content = vec![0x20u8; 64];
    content.extend_from_slice(context);
    content.push(0);
    content.extend_from_slice(transcript_hash);
    content
}
