//! Record layer
//!
//! Frames outgoing payloads into records of at most [`MAX_PLAINTEXT`] bytes
//! and reassembles incoming records from whatever the transport delivers.
//! Once keys are installed for a direction every record in it is AEAD
//! protected:
//!
//! ```text
//! header     = 23 || 0x0303 || length
//! inner      = payload || content type
//! nonce      = iv XOR sequence number
//! ciphertext = AEAD(key, nonce, aad = header, inner)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use log::trace;

use crate::crypto::aead::TAG_LEN;
use crate::crypto::TrafficKeys;
use crate::error::{Error, Result};

/// Record header size: type(1) version(2) length(2)
pub const RECORD_HEADER_SIZE: usize = 5;

/// Largest plaintext fragment per record
pub const MAX_PLAINTEXT: usize = 16384;

/// Largest protected record body accepted
pub const MAX_CIPHERTEXT: usize = MAX_PLAINTEXT + 256;

const RECORD_VERSION: u16 = 0x0303;

/// Record content types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Alert,
    Handshake,
    ApplicationData,
}

impl ContentType {
    pub fn as_u8(self) -> u8 {
        match self {
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }
}

/// One decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub typ: ContentType,
    pub payload: Bytes,
}

/// Keys and sequence number of one direction
#[derive(Default)]
struct Direction {
    keys: Option<TrafficKeys>,
    seq: u64,
}

impl Direction {
    fn install(&mut self, keys: TrafficKeys) {
        self.keys = Some(keys);
        self.seq = 0;
    }

    /// Take the next sequence number; never wraps
    fn next_seq(&mut self) -> Result<u64> {
        let seq = self.seq;
        self.seq = seq
            .checked_add(1)
            .ok_or_else(|| Error::Protocol("record sequence number exhausted".to_string()))?;
        Ok(seq)
    }
}

/// Record protection for both directions of a connection
pub struct RecordLayer {
    write: Direction,
    read: Direction,
    /// Whether a bare plaintext alert may arrive under read keys
    plaintext_alerts: bool,
}

impl Default for RecordLayer {
    fn default() -> Self {
        RecordLayer {
            write: Direction::default(),
            read: Direction::default(),
            plaintext_alerts: true,
        }
    }
}

impl RecordLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every later incoming record to be protected
    ///
    /// Called once application read keys are in place; until then a peer
    /// that failed before installing its own write keys may still report
    /// why with a plaintext alert.
    pub fn reject_plaintext_alerts(&mut self) {
        self.plaintext_alerts = false;
    }

    /// Protect every later outgoing record with `keys`
    pub fn set_write_keys(&mut self, keys: TrafficKeys) {
        trace!("record layer: new write keys");
        self.write.install(keys);
    }

    /// Open every later incoming record with `keys`
    pub fn set_read_keys(&mut self, keys: TrafficKeys) {
        trace!("record layer: new read keys");
        self.read.install(keys);
    }

    #[cfg(test)]
    fn set_write_seq(&mut self, seq: u64) {
        self.write.seq = seq;
    }

    /// Append `payload` to `out` as one or more records
    pub fn seal(&mut self, typ: ContentType, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        if payload.is_empty() {
            return self.seal_fragment(typ, payload, out);
        }
        for fragment in payload.chunks(MAX_PLAINTEXT) {
            self.seal_fragment(typ, fragment, out)?;
        }
        Ok(())
    }

    fn seal_fragment(&mut self, typ: ContentType, fragment: &[u8], out: &mut BytesMut) -> Result<()> {
        let seq = match self.write.keys {
            Some(_) => self.write.next_seq()?,
            None => {
                out.reserve(RECORD_HEADER_SIZE + fragment.len());
                out.put_u8(typ.as_u8());
                out.put_u16(RECORD_VERSION);
                out.put_u16(fragment.len() as u16);
                out.put_slice(fragment);
                return Ok(());
            }
        };
        let keys = self
            .write
            .keys
            .as_ref()
            .ok_or_else(|| Error::State("write keys missing".to_string()))?;

        let mut inner = Vec::with_capacity(fragment.len() + 1);
        inner.extend_from_slice(fragment);
        inner.push(typ.as_u8());

        let header = record_header(ContentType::ApplicationData, inner.len() + TAG_LEN);
        let sealed = keys
            .aead()
            .seal(keys.key(), &keys.nonce(seq), &header, &inner)?;

        out.reserve(RECORD_HEADER_SIZE + sealed.len());
        out.put_slice(&header);
        out.put_slice(&sealed);
        trace!("sealed {:?} record of {} bytes, seq {}", typ, fragment.len(), seq);
        Ok(())
    }

    /// Split the next complete record off `incoming`
    ///
    /// Returns `Ok(None)` until a whole record is buffered.
    pub fn open(&mut self, incoming: &mut BytesMut) -> Result<Option<Record>> {
        if incoming.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        let outer = incoming[0];
        let version = u16::from_be_bytes([incoming[1], incoming[2]]);
        let len = u16::from_be_bytes([incoming[3], incoming[4]]) as usize;

        let typ = ContentType::from_u8(outer)
            .ok_or_else(|| Error::UnexpectedMessage(format!("unknown record type {}", outer)))?;
        if version != RECORD_VERSION {
            return Err(Error::Protocol(format!("bad record version {:#06x}", version)));
        }
        let plaintext_alert = self.plaintext_alerts && typ == ContentType::Alert && len == 2;
        let protected = self.read.keys.is_some() && !plaintext_alert;
        let limit = if protected { MAX_CIPHERTEXT } else { MAX_PLAINTEXT };
        if len > limit {
            return Err(Error::Protocol(format!(
                "record of {} bytes exceeds limit of {}",
                len, limit
            )));
        }
        if incoming.len() < RECORD_HEADER_SIZE + len {
            return Ok(None);
        }

        let record = incoming.split_to(RECORD_HEADER_SIZE + len).freeze();
        let (header, body) = record.split_at(RECORD_HEADER_SIZE);

        if !protected {
            if typ != ContentType::ApplicationData && body.is_empty() {
                return Err(Error::Protocol(format!("empty {:?} record", typ)));
            }
            if typ == ContentType::ApplicationData {
                return Err(Error::UnexpectedMessage(
                    "application data before keys were established".to_string(),
                ));
            }
            // Only a failure report may skip protection, never a clean close
            if self.read.keys.is_some() && body[1] == 0 {
                return Err(Error::UnexpectedMessage(
                    "unprotected close_notify after keys were established".to_string(),
                ));
            }
            return Ok(Some(Record {
                typ,
                payload: record.slice(RECORD_HEADER_SIZE..),
            }));
        }

        if typ != ContentType::ApplicationData {
            return Err(Error::UnexpectedMessage(format!(
                "unprotected {:?} record after keys were established",
                typ
            )));
        }
        let seq = self.read.next_seq()?;
        let keys = self
            .read
            .keys
            .as_ref()
            .ok_or_else(|| Error::State("read keys missing".to_string()))?;
        let mut inner = keys
            .aead()
            .open(keys.key(), &keys.nonce(seq), header, body)
            .ok_or(Error::BadRecordMac)?;

        let inner_type = inner
            .pop()
            .ok_or_else(|| Error::Protocol("protected record without content type".to_string()))?;
        let typ = ContentType::from_u8(inner_type)
            .ok_or_else(|| Error::UnexpectedMessage(format!("unknown inner record type {}", inner_type)))?;
        if inner.len() > MAX_PLAINTEXT {
            return Err(Error::Protocol("decrypted record exceeds plaintext limit".to_string()));
        }
        if typ != ContentType::ApplicationData && inner.is_empty() {
            return Err(Error::Protocol(format!("empty {:?} record", typ)));
        }
        trace!("opened {:?} record of {} bytes, seq {}", typ, inner.len(), seq);
        Ok(Some(Record {
            typ,
            payload: Bytes::from(inner),
        }))
    }
}

fn record_header(typ: ContentType, len: usize) -> [u8; RECORD_HEADER_SIZE] {
    let len = (len as u16).to_be_bytes();
    let version = RECORD_VERSION.to_be_bytes();
    [typ.as_u8(), version[0], version[1], len[0], len[1]]
}
