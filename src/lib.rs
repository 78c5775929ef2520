//! jimmies - secure sockets over openssl primitives
//!
//! This crate wraps a reliable byte stream (TCP, a Unix domain socket or any
//! [`Transport`]) in an authenticated, encrypted connection. The handshake,
//! key schedule and record protection are implemented here; openssl
//! supplies the ciphers, signatures, key exchange and X.509 parsing.
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use jimmies::{create_default_context, Purpose, TrustSource};
//!
//! let ctx = create_default_context(&TrustSource::System, Purpose::ServerAuth)?;
//! let mut conn = ctx.connect("example.com:443", Some("example.com"))?;
//! conn.write_all(b"GET / HTTP/1.0\r\n\r\n")?;
//! let mut response = Vec::new();
//! conn.read_to_end(&mut response)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod alert;
pub mod cert;
pub mod config;
pub mod connection;
pub mod context;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod record;
pub mod session;
pub mod transport;
pub mod trust;
pub mod verify;

#[cfg(test)]
pub(crate) mod testutil;

pub use cert::PeerIdentity;
pub use config::{CipherSuite, ClientVerify, Policy, ProtocolVersion, Purpose, Role, VerifyMode};
pub use connection::{Connection, ConnectionState};
pub use context::Context;
pub use error::{Error, ErrorKind, Result};
pub use identity::Identity;
pub use session::Session;
pub use transport::{PollEvents, Transport};
pub use trust::{TrustSource, TrustStore};
pub use verify::{CertificateVerifier, ChainVerifier, VerificationError, WildcardPolicy};

/// Context for `purpose` trusting the certificates in `source`
///
/// Same as [`Context::create_default`].
pub fn create_default_context(source: &TrustSource, purpose: Purpose) -> Result<Context> {
    Context::create_default(source, purpose)
}
