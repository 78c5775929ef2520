//! TLS alert messages
//!
//! Alerts travel in their own record type and carry a level and a
//! description. `close_notify` announces a clean shutdown; every other
//! alert aborts the connection.

use std::fmt;

use crate::error::{Error, Result};

/// Alert level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Fatal,
}

impl AlertLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            AlertLevel::Warning => 1,
            AlertLevel::Fatal => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AlertLevel::Warning),
            2 => Some(AlertLevel::Fatal),
            _ => None,
        }
    }
}

/// Alert description codes (RFC 8446 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDescription {
    /// Orderly shutdown of the sending direction
    CloseNotify,
    UnexpectedMessage,
    /// Record failed authentication
    BadRecordMac,
    RecordOverflow,
    /// No acceptable set of security parameters
    HandshakeFailure,
    BadCertificate,
    CertificateExpired,
    /// Chain did not lead to a trusted root
    UnknownCa,
    DecodeError,
    DecryptError,
    ProtocolVersion,
    InternalError,
    CertificateRequired,
    NoApplicationProtocol,
    /// Any code this implementation does not know
    Unknown(u8),
}

impl AlertDescription {
    pub fn as_u8(self) -> u8 {
        match self {
            AlertDescription::CloseNotify => 0,
            AlertDescription::UnexpectedMessage => 10,
            AlertDescription::BadRecordMac => 20,
            AlertDescription::RecordOverflow => 22,
            AlertDescription::HandshakeFailure => 40,
            AlertDescription::BadCertificate => 42,
            AlertDescription::CertificateExpired => 45,
            AlertDescription::UnknownCa => 48,
            AlertDescription::DecodeError => 50,
            AlertDescription::DecryptError => 51,
            AlertDescription::ProtocolVersion => 70,
            AlertDescription::InternalError => 80,
            AlertDescription::CertificateRequired => 116,
            AlertDescription::NoApplicationProtocol => 120,
            AlertDescription::Unknown(code) => code,
        }
    }

    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => AlertDescription::CloseNotify,
            10 => AlertDescription::UnexpectedMessage,
            20 => AlertDescription::BadRecordMac,
            22 => AlertDescription::RecordOverflow,
            40 => AlertDescription::HandshakeFailure,
            42 => AlertDescription::BadCertificate,
            45 => AlertDescription::CertificateExpired,
            48 => AlertDescription::UnknownCa,
            50 => AlertDescription::DecodeError,
            51 => AlertDescription::DecryptError,
            70 => AlertDescription::ProtocolVersion,
            80 => AlertDescription::InternalError,
            116 => AlertDescription::CertificateRequired,
            120 => AlertDescription::NoApplicationProtocol,
            other => AlertDescription::Unknown(other),
        }
    }

    /// Get alert name
    pub fn name(&self) -> &'static str {
        match self {
            AlertDescription::CloseNotify => "close_notify",
            AlertDescription::UnexpectedMessage => "unexpected_message",
            AlertDescription::BadRecordMac => "bad_record_mac",
            AlertDescription::RecordOverflow => "record_overflow",
            AlertDescription::HandshakeFailure => "handshake_failure",
            AlertDescription::BadCertificate => "bad_certificate",
            AlertDescription::CertificateExpired => "certificate_expired",
            AlertDescription::UnknownCa => "unknown_ca",
            AlertDescription::DecodeError => "decode_error",
            AlertDescription::DecryptError => "decrypt_error",
            AlertDescription::ProtocolVersion => "protocol_version",
            AlertDescription::InternalError => "internal_error",
            AlertDescription::CertificateRequired => "certificate_required",
            AlertDescription::NoApplicationProtocol => "no_application_protocol",
            AlertDescription::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for AlertDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

/// A decoded alert record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    pub fn close_notify() -> Self {
        Alert {
            level: AlertLevel::Warning,
            description: AlertDescription::CloseNotify,
        }
    }

    pub fn fatal(description: AlertDescription) -> Self {
        Alert {
            level: AlertLevel::Fatal,
            description,
        }
    }

    pub fn encode(&self) -> [u8; 2] {
        [self.level.as_u8(), self.description.as_u8()]
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload {
            [level, description] => {
                let level = AlertLevel::from_u8(*level)
                    .ok_or_else(|| Error::Protocol(format!("invalid alert level {}", level)))?;
                Ok(Alert {
                    level,
                    description: AlertDescription::from_u8(*description),
                })
            }
            _ => Err(Error::Protocol(format!(
                "alert record must be 2 bytes, got {}",
                payload.len()
            ))),
        }
    }

    /// close_notify is the only alert that does not abort the connection
    pub fn is_close_notify(&self) -> bool {
        self.description == AlertDescription::CloseNotify
    }
}
