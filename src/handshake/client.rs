//! Client side of the handshake

use log::debug;

use super::codec::{ClientHello, HandshakeMessage, ServerHello};
use super::{Action, Expect, HandshakeEngine, HandshakeState};
use crate::config::{CipherSuite, ProtocolVersion};
use crate::crypto::key_schedule::{verify_data_eq, KeySchedule};
use crate::crypto::kx::KeyExchange;
use crate::crypto::{self, SignatureScheme};
use crate::error::{Error, Result};
use crate::verify::VerificationError;

impl HandshakeEngine {
    pub(super) fn client_start(&mut self) -> Result<Vec<Action>> {
        if self.state != HandshakeState::Start || self.kx.is_some() {
            return Err(Error::State("handshake already started".to_string()));
        }
        let policy = &self.config.policy;
        let kx = KeyExchange::generate()?;
        let hello = ClientHello {
            random: crypto::random()?,
            versions: policy.versions().iter().map(|v| v.wire()).collect(),
            cipher_suites: policy.usable_suites().map(|s| s.id()).collect(),
            key_share: kx.public_key()?,
            server_name: self.server_name.clone(),
            alpn_protocols: policy.alpn_protocols.clone(),
            signature_schemes: SignatureScheme::ALL.iter().map(|s| s.id()).collect(),
        };
        self.kx = Some(kx);

        let mut actions = Vec::new();
        self.send(HandshakeMessage::ClientHello(hello), &mut actions);
        Ok(actions)
    }

    pub(super) fn client_handle(&mut self, message: HandshakeMessage, raw: &[u8]) -> Result<Vec<Action>> {
        match (self.expect, message) {
            (Expect::ServerHello, HandshakeMessage::ServerHello(hello)) => {
                self.client_server_hello(hello, raw)
            }
            (Expect::Certificate, HandshakeMessage::Certificate(chain)) => {
                let verify = self.config.policy.verify_mode.verifies_chain();
                let hostname = if self.config.policy.verify_mode.checks_hostname() {
                    self.server_name.clone()
                } else {
                    None
                };
                if !self.accept_certificate(&chain, hostname.as_deref(), verify)? {
                    return Err(VerificationError::NoCertificate.into());
                }
                self.transcript.add(raw);
                self.set_state(HandshakeState::PeerAuthenticated);
                self.expect = Expect::CertificateVerify;
                Ok(Vec::new())
            }
            (Expect::CertificateVerify, HandshakeMessage::CertificateVerify { scheme, signature }) => {
                self.check_certificate_verify(scheme, &signature, true)?;
                self.transcript.add(raw);
                self.expect = Expect::Finished;
                Ok(Vec::new())
            }
            (Expect::Finished, HandshakeMessage::Finished(verify_data)) => {
                self.client_server_finished(&verify_data, raw)
            }
            (_, message) => Err(self.unexpected(&message)),
        }
    }

    fn client_server_hello(&mut self, hello: ServerHello, raw: &[u8]) -> Result<Vec<Action>> {
        let policy = &self.config.policy;
        let version = ProtocolVersion::from_wire(hello.version)
            .filter(|v| policy.allows_version(*v))
            .ok_or_else(|| {
                Error::Negotiation(format!(
                    "server selected unsupported version {:#06x}",
                    hello.version
                ))
            })?;
        let suite = CipherSuite::from_id(hello.cipher_suite)
            .filter(|s| policy.cipher_suites.contains(s) && s.version() == version)
            .ok_or_else(|| {
                Error::Negotiation(format!(
                    "server selected cipher suite {:#06x} not offered for {}",
                    hello.cipher_suite, version
                ))
            })?;
        if let Some(proto) = &hello.alpn_protocol {
            if !policy.alpn_protocols.contains(proto) {
                return Err(Error::Protocol(format!(
                    "server selected ALPN protocol {:?} that was not offered",
                    String::from_utf8_lossy(proto)
                )));
            }
        }

        self.version = Some(version);
        self.suite = Some(suite);
        self.alpn_protocol = hello.alpn_protocol.clone();
        self.certificate_requested = hello.certificate_requested;
        self.transcript.add(raw);
        self.set_state(HandshakeState::VersionNegotiated);

        let kx = self
            .kx
            .take()
            .ok_or_else(|| Error::State("no key share generated".to_string()))?;
        let shared = kx
            .agree(&hello.key_share)
            .ok_or_else(|| Error::Protocol("invalid server key share".to_string()))?;

        let mut schedule = KeySchedule::new(suite, version);
        let (client_keys, server_keys) = schedule.handshake_keys(&shared, &self.transcript_hash()?)?;
        self.schedule = Some(schedule);
        self.set_state(HandshakeState::KeyExchanged);
        self.expect = Expect::Certificate;

        Ok(vec![
            Action::InstallReadKeys(server_keys),
            Action::InstallWriteKeys(client_keys),
        ])
    }

    fn client_server_finished(&mut self, verify_data: &[u8], raw: &[u8]) -> Result<Vec<Action>> {
        let transcript_hash = self.transcript_hash()?;
        let expected = self.schedule()?.finished(false, &transcript_hash)?;
        if !verify_data_eq(&expected, verify_data) {
            return Err(Error::Protocol("server Finished does not verify".to_string()));
        }
        self.transcript.add(raw);

        let transcript_hash = self.transcript_hash()?;
        let (client_app, server_app) = self.schedule()?.application_keys(&transcript_hash)?;

        let mut actions = Vec::new();
        if self.certificate_requested {
            let identity = self.config.identity.clone();
            let chain = match &identity {
                Some(identity) => identity.chain_der()?,
                None => Vec::new(),
            };
            debug!("sending client certificate chain of {} certificates", chain.len());
            self.send(HandshakeMessage::Certificate(chain), &mut actions);
            if identity.is_some() {
                let verify = self.certificate_verify(false)?;
                self.send(verify, &mut actions);
            }
        }

        let transcript_hash = self.transcript_hash()?;
        let finished = self.schedule()?.finished(true, &transcript_hash)?;
        self.send(HandshakeMessage::Finished(finished), &mut actions);

        actions.push(Action::InstallWriteKeys(client_app));
        actions.push(Action::InstallReadKeys(server_app));
        self.finish()?;
        Ok(actions)
    }
}
