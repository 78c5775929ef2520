//! Server side of the handshake

use log::{debug, warn};

use super::codec::{ClientHello, HandshakeMessage, ServerHello};
use super::{Action, Expect, HandshakeEngine, HandshakeState};
use crate::config::{ClientVerify, CipherSuite, Policy, ProtocolVersion};
use crate::crypto::key_schedule::{verify_data_eq, KeySchedule};
use crate::crypto::kx::KeyExchange;
use crate::crypto::{self, SignatureScheme};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::verify::VerificationError;

/// Highest version within bounds the client offers that has a usable suite
///
/// The suite is the first in server preference order that the client
/// offered, belongs to that version and fits the identity's key type.
pub(crate) fn choose_parameters(
    policy: &Policy,
    identity: &Identity,
    hello: &ClientHello,
) -> Option<(ProtocolVersion, CipherSuite)> {
    let auth = Some(identity.auth_algorithm());
    policy
        .versions()
        .into_iter()
        .filter(|v| hello.versions.contains(&v.wire()))
        .find_map(|version| {
            policy
                .cipher_suites
                .iter()
                .copied()
                .find(|suite| {
                    suite.version() == version
                        && hello.cipher_suites.contains(&suite.id())
                        && suite.usable_with(auth)
                })
                .map(|suite| (version, suite))
        })
}

/// First of our ALPN protocols the client also offered
fn choose_alpn(ours: &[Vec<u8>], offered: &[Vec<u8>]) -> Option<Vec<u8>> {
    ours.iter().find(|proto| offered.contains(proto)).cloned()
}

impl HandshakeEngine {
    pub(super) fn server_handle(&mut self, message: HandshakeMessage, raw: &[u8]) -> Result<Vec<Action>> {
        match (self.expect, message) {
            (Expect::ClientHello, HandshakeMessage::ClientHello(hello)) => {
                self.server_client_hello(hello, raw)
            }
            (Expect::Certificate, HandshakeMessage::Certificate(chain)) => {
                let presented = self.accept_certificate(&chain, None, true)?;
                self.transcript.add(raw);
                if presented {
                    self.expect = Expect::CertificateVerify;
                } else if self.config.policy.client_verify == ClientVerify::Required {
                    return Err(VerificationError::NoCertificate.into());
                } else {
                    debug!("client sent no certificate");
                    self.set_state(HandshakeState::PeerAuthenticated);
                    self.expect = Expect::Finished;
                }
                Ok(Vec::new())
            }
            (Expect::CertificateVerify, HandshakeMessage::CertificateVerify { scheme, signature }) => {
                self.check_certificate_verify(scheme, &signature, false)?;
                self.transcript.add(raw);
                self.set_state(HandshakeState::PeerAuthenticated);
                self.expect = Expect::Finished;
                Ok(Vec::new())
            }
            (Expect::Finished, HandshakeMessage::Finished(verify_data)) => {
                let transcript_hash = self.transcript_hash()?;
                let expected = self.schedule()?.finished(true, &transcript_hash)?;
                if !verify_data_eq(&expected, &verify_data) {
                    return Err(Error::Protocol("client Finished does not verify".to_string()));
                }
                self.transcript.add(raw);
                let client_app = self
                    .pending_read_keys
                    .take()
                    .ok_or_else(|| Error::State("client traffic keys missing".to_string()))?;
                self.finish()?;
                Ok(vec![Action::InstallReadKeys(client_app)])
            }
            (_, message) => Err(self.unexpected(&message)),
        }
    }

    fn server_client_hello(&mut self, hello: ClientHello, raw: &[u8]) -> Result<Vec<Action>> {
        let config = self.config.clone();
        let policy = &config.policy;
        let identity = config
            .identity
            .as_ref()
            .ok_or_else(|| Error::Config("server context has no identity".to_string()))?;

        let (version, suite) = choose_parameters(policy, identity, &hello).ok_or_else(|| {
            Error::Negotiation(
                "no mutually acceptable protocol version and cipher suite".to_string(),
            )
        })?;
        if !hello.signature_schemes.contains(&identity.scheme().id()) {
            return Err(Error::Negotiation(format!(
                "client does not accept {} signatures",
                identity.scheme().name()
            )));
        }
        let alpn = choose_alpn(&policy.alpn_protocols, &hello.alpn_protocols);
        if alpn.is_none() && !policy.alpn_protocols.is_empty() && !hello.alpn_protocols.is_empty() {
            warn!("no ALPN protocol in common with the client");
        }

        self.transcript.add(raw);
        self.version = Some(version);
        self.suite = Some(suite);
        self.alpn_protocol = alpn.clone();
        self.server_name = hello.server_name.clone();
        self.set_state(HandshakeState::VersionNegotiated);

        let kx = KeyExchange::generate()?;
        let key_share = kx.public_key()?;
        let shared = kx
            .agree(&hello.key_share)
            .ok_or_else(|| Error::Protocol("invalid client key share".to_string()))?;

        let request_certificate = policy.client_verify != ClientVerify::None;
        let server_hello = ServerHello {
            random: crypto::random()?,
            version: version.wire(),
            cipher_suite: suite.id(),
            key_share,
            alpn_protocol: alpn,
            certificate_requested: request_certificate,
        };
        let mut actions = Vec::new();
        self.send(HandshakeMessage::ServerHello(server_hello), &mut actions);

        let mut schedule = KeySchedule::new(suite, version);
        let (client_keys, server_keys) = schedule.handshake_keys(&shared, &self.transcript_hash()?)?;
        self.schedule = Some(schedule);
        actions.push(Action::InstallWriteKeys(server_keys));
        actions.push(Action::InstallReadKeys(client_keys));
        self.set_state(HandshakeState::KeyExchanged);

        self.send(HandshakeMessage::Certificate(identity.chain_der()?), &mut actions);
        let verify = self.certificate_verify(true)?;
        self.send(verify, &mut actions);

        let transcript_hash = self.transcript_hash()?;
        let finished = self.schedule()?.finished(false, &transcript_hash)?;
        self.send(HandshakeMessage::Finished(finished), &mut actions);

        let transcript_hash = self.transcript_hash()?;
        let (client_app, server_app) = self.schedule()?.application_keys(&transcript_hash)?;
        actions.push(Action::InstallWriteKeys(server_app));
        self.pending_read_keys = Some(client_app);

        self.expect = if request_certificate {
            Expect::Certificate
        } else {
            self.set_state(HandshakeState::PeerAuthenticated);
            Expect::Finished
        };
        Ok(actions)
    }
}
