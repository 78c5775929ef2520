//! Error types
//!
//! Every failure surfaced by this crate is an [`Error`]. Callers that need to
//! branch on the failure class match on [`Error::kind`], which folds the
//! variants into the categories of the secure-sockets API:
//! configuration, type mismatch, negotiation, protocol, certificate
//! verification (`TLSException`), connection, would-block and state.

use std::io;

use crate::alert::AlertDescription;
use crate::verify::VerificationError;

/// Failure class of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad context setup; fix the configuration
    Config,
    /// Wrong kind of stream handed to `wrap`
    Type,
    /// No mutually acceptable protocol version or cipher suite
    Negotiation,
    /// Malformed, unexpected or unauthenticated protocol data
    Protocol,
    /// Certificate or hostname verification failed
    Tls,
    /// Underlying stream I/O failure, timeout or premature close
    Connection,
    /// Non-blocking stream is not ready; retry the same call later
    WouldBlock,
    /// Operation not valid in the connection's current state
    State,
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Protocol error: bad record MAC")]
    BadRecordMac,

    #[error("Peer sent fatal alert: {0}")]
    Alert(AlertDescription),

    /// Certificate verification failure (the `TLSException` of the socket API)
    #[error("{0}")]
    Tls(#[from] VerificationError),

    #[error("Connection error: {0}")]
    Connection(io::Error),

    #[error("Operation would block")]
    WouldBlock,

    #[error("Invalid state: {0}")]
    State(String),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

impl Error {
    /// Failure class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Type(_) => ErrorKind::Type,
            Error::Negotiation(_) => ErrorKind::Negotiation,
            Error::Protocol(_)
            | Error::UnexpectedMessage(_)
            | Error::BadRecordMac
            | Error::Alert(_)
            | Error::OpenSsl(_) => ErrorKind::Protocol,
            Error::Tls(_) => ErrorKind::Tls,
            Error::Connection(_) => ErrorKind::Connection,
            Error::WouldBlock => ErrorKind::WouldBlock,
            Error::State(_) => ErrorKind::State,
        }
    }

    /// Whether the same call may succeed later without reconnecting
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }

    /// Alert to send the peer when this error aborts a connection
    pub(crate) fn alert(&self) -> Option<AlertDescription> {
        match self {
            Error::Negotiation(_) => Some(AlertDescription::HandshakeFailure),
            Error::Protocol(_) => Some(AlertDescription::DecodeError),
            Error::UnexpectedMessage(_) => Some(AlertDescription::UnexpectedMessage),
            Error::BadRecordMac => Some(AlertDescription::BadRecordMac),
            Error::Tls(err) => Some(err.alert()),
            Error::OpenSsl(_) => Some(AlertDescription::InternalError),
            // The peer already knows, or the transport is gone
            Error::Alert(_) | Error::Connection(_) => None,
            Error::Config(_) | Error::Type(_) | Error::WouldBlock | Error::State(_) => None,
        }
    }

    /// Rebuild an equivalent error so a terminal failure can be raised again
    pub(crate) fn replay(&self) -> Error {
        match self {
            Error::Config(msg) => Error::Config(msg.clone()),
            Error::Type(msg) => Error::Type(msg.clone()),
            Error::Negotiation(msg) => Error::Negotiation(msg.clone()),
            Error::Protocol(msg) => Error::Protocol(msg.clone()),
            Error::UnexpectedMessage(msg) => Error::UnexpectedMessage(msg.clone()),
            Error::BadRecordMac => Error::BadRecordMac,
            Error::Alert(desc) => Error::Alert(*desc),
            Error::Tls(err) => Error::Tls(err.clone()),
            Error::Connection(err) => Error::Connection(io::Error::new(err.kind(), err.to_string())),
            Error::WouldBlock => Error::WouldBlock,
            Error::State(msg) => Error::State(msg.clone()),
            Error::OpenSsl(stack) => Error::OpenSsl(stack.clone()),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::WouldBlock {
            Error::WouldBlock
        } else {
            Error::Connection(err)
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Connection(inner) => inner,
            Error::WouldBlock => io::Error::from(io::ErrorKind::WouldBlock),
            Error::Config(_) | Error::Type(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::State(_) => io::Error::new(io::ErrorKind::NotConnected, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::Config);
        assert_eq!(Error::BadRecordMac.kind(), ErrorKind::Protocol);
        assert_eq!(Error::Alert(AlertDescription::UnknownCa).kind(), ErrorKind::Protocol);
        assert_eq!(
            Error::Tls(VerificationError::UnknownIssuer).kind(),
            ErrorKind::Tls
        );
        assert!(Error::WouldBlock.is_retryable());
        assert!(!Error::BadRecordMac.is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(err, Error::WouldBlock));

        let err: Error = io::Error::from(io::ErrorKind::TimedOut).into();
        assert_eq!(err.kind(), ErrorKind::Connection);

        let io_err: io::Error = Error::State("closed".into()).into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_replay_preserves_message() {
        let err = Error::Tls(VerificationError::HostnameMismatch("other.domain".into()));
        let replayed = err.replay();
        assert_eq!(err.to_string(), replayed.to_string());
        assert!(replayed.to_string().contains("invalid certificate"));

        let err = Error::Connection(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        match err.replay() {
            Error::Connection(inner) => assert_eq!(inner.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected replay: {:?}", other),
        }
    }
}
