//! Handshake message encoding and decoding
//!
//! Every message is `type(1) length(3) body`. Vectors inside bodies carry
//! a big-endian length prefix of 1, 2 or 3 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Handshake message header size
pub const HEADER_SIZE: usize = 4;

/// Largest handshake message accepted from a peer
pub const MAX_MESSAGE_SIZE: usize = 1 << 16;

/// Size of the hello random values
pub const RANDOM_LEN: usize = 32;

/// Handshake message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    ClientHello,
    ServerHello,
    Certificate,
    CertificateVerify,
    Finished,
}

impl HandshakeType {
    pub fn as_u8(self) -> u8 {
        match self {
            HandshakeType::ClientHello => 1,
            HandshakeType::ServerHello => 2,
            HandshakeType::Certificate => 11,
            HandshakeType::CertificateVerify => 15,
            HandshakeType::Finished => 20,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(HandshakeType::ClientHello),
            2 => Some(HandshakeType::ServerHello),
            11 => Some(HandshakeType::Certificate),
            15 => Some(HandshakeType::CertificateVerify),
            20 => Some(HandshakeType::Finished),
            _ => None,
        }
    }
}

/// Read from a byte slice
pub struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Reader { buf, what }
    }

    fn truncated(&self) -> Error {
        Error::Protocol(format!("truncated {}", self.what))
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < len {
            return Err(self.truncated());
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u24(&mut self) -> Result<usize> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    /// Vector with a one-byte length prefix
    pub fn vec_u8(&mut self) -> Result<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    pub fn vec_u16(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    pub fn vec_u24(&mut self) -> Result<&'a [u8]> {
        let len = self.u24()?;
        self.take(len)
    }

    pub fn sub(&mut self, body: &'a [u8]) -> Reader<'a> {
        Reader::new(body, self.what)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Fail if anything is left over
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "{} trailing bytes after {}",
                self.buf.len(),
                self.what
            )))
        }
    }
}

fn put_u24(out: &mut BytesMut, value: usize) {
    out.put_uint(value as u64, 3);
}

fn put_vec_u8(out: &mut BytesMut, data: &[u8]) {
    out.put_u8(data.len() as u8);
    out.put_slice(data);
}

fn put_vec_u16(out: &mut BytesMut, data: &[u8]) {
    out.put_u16(data.len() as u16);
    out.put_slice(data);
}

fn put_vec_u24(out: &mut BytesMut, data: &[u8]) {
    put_u24(out, data.len());
    out.put_slice(data);
}

fn u16_list(reader: &mut Reader<'_>, body: &[u8]) -> Result<Vec<u16>> {
    if body.len() % 2 != 0 {
        return Err(Error::Protocol(format!("odd-length list in {}", reader.what)));
    }
    Ok(body
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// First flight of the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; RANDOM_LEN],
    /// Offered protocol versions, wire code points
    pub versions: Vec<u16>,
    /// Offered cipher suites in client preference order
    pub cipher_suites: Vec<u16>,
    /// X25519 public key
    pub key_share: Vec<u8>,
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub signature_schemes: Vec<u16>,
}

impl ClientHello {
    fn encode_body(&self, out: &mut BytesMut) {
        out.put_slice(&self.random);

        out.put_u8((self.versions.len() * 2) as u8);
        self.versions.iter().for_each(|v| out.put_u16(*v));

        out.put_u16((self.cipher_suites.len() * 2) as u16);
        self.cipher_suites.iter().for_each(|s| out.put_u16(*s));

        put_vec_u16(out, &self.key_share);
        put_vec_u16(out, self.server_name.as_deref().unwrap_or("").as_bytes());

        let mut alpn = BytesMut::new();
        for proto in &self.alpn_protocols {
            put_vec_u8(&mut alpn, proto);
        }
        put_vec_u16(out, &alpn);

        out.put_u16((self.signature_schemes.len() * 2) as u16);
        self.signature_schemes.iter().for_each(|s| out.put_u16(*s));
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body, "ClientHello");
        let mut random = [0u8; RANDOM_LEN];
        random.copy_from_slice(r.take(RANDOM_LEN)?);

        let raw = r.vec_u8()?;
        let versions = u16_list(&mut r, raw)?;
        let raw = r.vec_u16()?;
        let cipher_suites = u16_list(&mut r, raw)?;
        let key_share = r.vec_u16()?.to_vec();

        let name = r.vec_u16()?;
        let server_name = if name.is_empty() {
            None
        } else {
            Some(
                std::str::from_utf8(name)
                    .map_err(|_| Error::Protocol("server name is not UTF-8".to_string()))?
                    .to_string(),
            )
        };

        let alpn_raw = r.vec_u16()?;
        let mut alpn_reader = r.sub(alpn_raw);
        let mut alpn_protocols = Vec::new();
        while !alpn_reader.is_empty() {
            let proto = alpn_reader.vec_u8()?;
            if proto.is_empty() {
                return Err(Error::Protocol("empty ALPN protocol name".to_string()));
            }
            alpn_protocols.push(proto.to_vec());
        }

        let raw = r.vec_u16()?;
        let signature_schemes = u16_list(&mut r, raw)?;
        r.finish()?;

        Ok(ClientHello {
            random,
            versions,
            cipher_suites,
            key_share,
            server_name,
            alpn_protocols,
            signature_schemes,
        })
    }
}

/// Server's answer fixing version, suite and key share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; RANDOM_LEN],
    pub version: u16,
    pub cipher_suite: u16,
    pub key_share: Vec<u8>,
    pub alpn_protocol: Option<Vec<u8>>,
    /// The server wants a client certificate
    pub certificate_requested: bool,
}

impl ServerHello {
    fn encode_body(&self, out: &mut BytesMut) {
        out.put_slice(&self.random);
        out.put_u16(self.version);
        out.put_u16(self.cipher_suite);
        put_vec_u16(out, &self.key_share);
        put_vec_u8(out, self.alpn_protocol.as_deref().unwrap_or(&[]));
        out.put_u8(self.certificate_requested as u8);
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body, "ServerHello");
        let mut random = [0u8; RANDOM_LEN];
        random.copy_from_slice(r.take(RANDOM_LEN)?);
        let version = r.u16()?;
        let cipher_suite = r.u16()?;
        let key_share = r.vec_u16()?.to_vec();
        let alpn = r.vec_u8()?;
        let flags = r.u8()?;
        if flags & !1 != 0 {
            return Err(Error::Protocol(format!("unknown ServerHello flags {:#x}", flags)));
        }
        r.finish()?;

        Ok(ServerHello {
            random,
            version,
            cipher_suite,
            key_share,
            alpn_protocol: (!alpn.is_empty()).then(|| alpn.to_vec()),
            certificate_requested: flags & 1 == 1,
        })
    }
}

/// Handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    /// DER certificates, leaf first; empty when the client has none
    Certificate(Vec<Vec<u8>>),
    CertificateVerify { scheme: u16, signature: Vec<u8> },
    Finished(Vec<u8>),
}

impl HandshakeMessage {
    pub fn typ(&self) -> HandshakeType {
        match self {
            HandshakeMessage::ClientHello(_) => HandshakeType::ClientHello,
            HandshakeMessage::ServerHello(_) => HandshakeType::ServerHello,
            HandshakeMessage::Certificate(_) => HandshakeType::Certificate,
            HandshakeMessage::CertificateVerify { .. } => HandshakeType::CertificateVerify,
            HandshakeMessage::Finished(_) => HandshakeType::Finished,
        }
    }

    /// Encode with the four-byte header
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            HandshakeMessage::ClientHello(hello) => hello.encode_body(&mut body),
            HandshakeMessage::ServerHello(hello) => hello.encode_body(&mut body),
            HandshakeMessage::Certificate(chain) => {
                let mut list = BytesMut::new();
                for cert in chain {
                    put_vec_u24(&mut list, cert);
                }
                put_vec_u24(&mut body, &list);
            }
            HandshakeMessage::CertificateVerify { scheme, signature } => {
                body.put_u16(*scheme);
                put_vec_u16(&mut body, signature);
            }
            HandshakeMessage::Finished(verify_data) => body.put_slice(verify_data),
        }

        let mut out = BytesMut::with_capacity(HEADER_SIZE + body.len());
        out.put_u8(self.typ().as_u8());
        put_u24(&mut out, body.len());
        out.put_slice(&body);
        out.freeze()
    }

    pub fn decode(typ: HandshakeType, body: &[u8]) -> Result<Self> {
        match typ {
            HandshakeType::ClientHello => Ok(HandshakeMessage::ClientHello(ClientHello::decode_body(body)?)),
            HandshakeType::ServerHello => Ok(HandshakeMessage::ServerHello(ServerHello::decode_body(body)?)),
            HandshakeType::Certificate => {
                let mut r = Reader::new(body, "Certificate");
                let list = r.vec_u24()?;
                r.finish()?;
                let mut certs = r.sub(list);
                let mut chain = Vec::new();
                while !certs.is_empty() {
                    let der = certs.vec_u24()?;
                    if der.is_empty() {
                        return Err(Error::Protocol("empty certificate entry".to_string()));
                    }
                    chain.push(der.to_vec());
                }
                Ok(HandshakeMessage::Certificate(chain))
            }
            HandshakeType::CertificateVerify => {
                let mut r = Reader::new(body, "CertificateVerify");
                let scheme = r.u16()?;
                let signature = r.vec_u16()?.to_vec();
                r.finish()?;
                Ok(HandshakeMessage::CertificateVerify { scheme, signature })
            }
            HandshakeType::Finished => Ok(HandshakeMessage::Finished(body.to_vec())),
        }
    }
}

/// Reassembles handshake messages from record payloads
///
/// A message may span several records and one record may carry several
/// messages.
#[derive(Debug, Default)]
pub struct HandshakeJoiner {
    buf: BytesMut,
}

impl HandshakeJoiner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: &[u8]) {
        self.buf.extend_from_slice(payload);
    }

    /// Whether a partial message is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Next complete message and its encoding (for the transcript)
    pub fn next_message(&mut self) -> Result<Option<(HandshakeMessage, Bytes)>> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let typ_byte = self.buf[0];
        let len = ((self.buf[1] as usize) << 16) | ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "handshake message of {} bytes exceeds limit of {}",
                len, MAX_MESSAGE_SIZE
            )));
        }
        let typ = HandshakeType::from_u8(typ_byte).ok_or_else(|| {
            Error::UnexpectedMessage(format!("unknown handshake message type {}", typ_byte))
        })?;
        if self.buf.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        let raw = self.buf.split_to(HEADER_SIZE + len).freeze();
        let mut body = raw.clone();
        body.advance(HEADER_SIZE);
        let message = HandshakeMessage::decode(typ, &body)?;
        Ok(Some((message, raw)))
    }
}
