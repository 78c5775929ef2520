//! TLS connections
//!
//! A [`Connection`] owns its transport, one handshake engine and the record
//! layer. It moves through
//!
//! ```text
//! Uninitialized -> Handshaking -> Established -> Closed
//!                       \______________\-> Failed
//! ```
//!
//! `Failed` and `Closed` are terminal. A failed connection raises the error
//! that failed it from every later call.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};

use crate::alert::{Alert, AlertDescription};
use crate::cert::PeerIdentity;
use crate::config::Role;
use crate::context::ContextConfig;
use crate::error::{Error, Result};
use crate::handshake::{Action, HandshakeEngine, HandshakeJoiner, HandshakeState};
use crate::record::{ContentType, Record, RecordLayer, MAX_CIPHERTEXT, RECORD_HEADER_SIZE};
use crate::session::Session;
use crate::transport::{PollEvents, Transport};

/// Bytes requested from the transport per read
const READ_CHUNK: usize = RECORD_HEADER_SIZE + MAX_CIPHERTEXT;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Handshaking,
    Established,
    Closed,
    Failed,
}

/// TLS connection over a transport
pub struct Connection<T: Transport> {
    transport: T,
    role: Role,
    server_name: Option<String>,
    state: ConnectionState,
    engine: HandshakeEngine,
    record: RecordLayer,
    joiner: HandshakeJoiner,
    /// Raw bytes read but not yet opened as records
    incoming: BytesMut,
    /// Sealed records not yet written
    outgoing: BytesMut,
    /// Application data opened but not yet returned
    plaintext: BytesMut,
    session: Option<Session>,
    failure: Option<Error>,
    peer_closed: bool,
    sent_close_notify: bool,
    transport_closed: bool,
    timeout: Option<Duration>,
}

impl<T: Transport> Connection<T> {
    pub(crate) fn new(
        transport: T,
        config: Arc<ContextConfig>,
        role: Role,
        server_name: Option<String>,
    ) -> Self {
        let engine = HandshakeEngine::new(role, config, server_name.clone());
        Connection {
            transport,
            role,
            server_name,
            state: ConnectionState::Uninitialized,
            engine,
            record: RecordLayer::new(),
            joiner: HandshakeJoiner::new(),
            incoming: BytesMut::new(),
            outgoing: BytesMut::new(),
            plaintext: BytesMut::new(),
            session: None,
            failure: None,
            peer_closed: false,
            sent_close_notify: false,
            transport_closed: false,
            timeout: None,
        }
    }

    /// Run the handshake to completion
    ///
    /// Idempotent once established: later calls return the same session
    /// without I/O. On a non-blocking transport this returns
    /// [`Error::WouldBlock`] until the handshake can make progress; call it
    /// again when the transport is ready.
    pub fn handshake(&mut self) -> Result<&Session> {
        match self.state {
            ConnectionState::Established => return self.established_session(),
            ConnectionState::Failed => return Err(self.terminal_error()),
            ConnectionState::Closed => {
                return Err(Error::State("connection is closed".to_string()))
            }
            ConnectionState::Uninitialized => {
                debug!("{} starting handshake", self.role.as_str());
                self.state = ConnectionState::Handshaking;
                let started = self.engine.start().and_then(|actions| self.apply(actions));
                if let Err(e) = started {
                    return Err(self.fail(e));
                }
            }
            ConnectionState::Handshaking => {}
        }

        match self.drive_handshake() {
            Ok(()) => {
                self.session = self.engine.take_session();
                self.state = ConnectionState::Established;
                debug!("{} connection established", self.role.as_str());
                self.established_session()
            }
            Err(Error::WouldBlock) => Err(Error::WouldBlock),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn drive_handshake(&mut self) -> Result<()> {
        loop {
            self.flush_outgoing()?;
            if self.engine.is_finished() {
                return Ok(());
            }
            if self.process_handshake_records()? {
                continue;
            }
            if !self.read_more()? {
                return Err(Error::Connection(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                )));
            }
        }
    }

    /// Open buffered records until the engine finishes or input runs out
    fn process_handshake_records(&mut self) -> Result<bool> {
        let mut progressed = false;
        while !self.engine.is_finished() {
            match self.record.open(&mut self.incoming)? {
                Some(record) => {
                    self.process_record(record)?;
                    progressed = true;
                }
                None => break,
            }
        }
        Ok(progressed)
    }

    fn process_record(&mut self, record: Record) -> Result<()> {
        match record.typ {
            ContentType::Handshake => {
                if self.engine.is_finished() {
                    return Err(Error::UnexpectedMessage(
                        "handshake message after the handshake finished".to_string(),
                    ));
                }
                self.joiner.push(&record.payload);
                while let Some((message, raw)) = self.joiner.next_message()? {
                    let actions = self.engine.handle(message, &raw)?;
                    self.apply(actions)?;
                }
                Ok(())
            }
            ContentType::ApplicationData => {
                if self.state != ConnectionState::Established {
                    return Err(Error::UnexpectedMessage(
                        "application data during the handshake".to_string(),
                    ));
                }
                trace!("received {} bytes of application data", record.payload.len());
                self.plaintext.extend_from_slice(&record.payload);
                Ok(())
            }
            ContentType::Alert => {
                let alert = Alert::decode(&record.payload)?;
                if alert.is_close_notify() {
                    debug!("{} received close_notify", self.role.as_str());
                    if self.state != ConnectionState::Established {
                        return Err(Error::Connection(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed the connection during the handshake",
                        )));
                    }
                    self.peer_closed = true;
                    Ok(())
                } else {
                    warn!("{} received alert {}", self.role.as_str(), alert.description);
                    Err(Error::Alert(alert.description))
                }
            }
        }
    }

    fn apply(&mut self, actions: Vec<Action>) -> Result<()> {
        for action in actions {
            match action {
                Action::Send(message) => {
                    self.record
                        .seal(ContentType::Handshake, &message, &mut self.outgoing)?;
                }
                Action::InstallWriteKeys(keys) => self.record.set_write_keys(keys),
                Action::InstallReadKeys(keys) => {
                    if !self.joiner.is_empty() {
                        return Err(Error::UnexpectedMessage(
                            "handshake data spans a key change".to_string(),
                        ));
                    }
                    self.record.set_read_keys(keys);
                    // Application keys arrive with the engine's last step
                    if self.engine.is_finished() {
                        self.record.reject_plaintext_alerts();
                    }
                }
            }
        }
        Ok(())
    }

    fn timed_out(&self) -> Error {
        Error::Connection(io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))
    }

    /// Write every sealed record to the transport
    fn flush_outgoing(&mut self) -> Result<()> {
        while !self.outgoing.is_empty() {
            if let Some(timeout) = self.timeout {
                if !self.transport.poll(PollEvents::Write, Some(timeout))? {
                    return Err(self.timed_out());
                }
            }
            let n = self.transport.write(&self.outgoing)?;
            if n == 0 {
                return Err(Error::Connection(io::Error::from(io::ErrorKind::WriteZero)));
            }
            trace!("wrote {} bytes", n);
            self.outgoing.advance(n);
        }
        self.transport.flush()?;
        Ok(())
    }

    /// Read more raw bytes; false on end of stream
    fn read_more(&mut self) -> Result<bool> {
        if let Some(timeout) = self.timeout {
            if !self.transport.poll(PollEvents::Read, Some(timeout))? {
                return Err(self.timed_out());
            }
        }
        let mut buf = [0u8; READ_CHUNK];
        let n = self.transport.read(&mut buf)?;
        trace!("read {} bytes", n);
        self.incoming.extend_from_slice(&buf[..n]);
        Ok(n > 0)
    }

    /// Abort the connection with `err`, telling the peer when appropriate
    fn fail(&mut self, err: Error) -> Error {
        self.engine.abort();
        if let Some(description) = err.alert() {
            self.send_fatal_alert(description);
        }
        warn!("{} connection failed: {}", self.role.as_str(), err);
        self.state = ConnectionState::Failed;
        self.failure = Some(err.replay());
        err
    }

    /// Best effort; the connection is failing anyway
    fn send_fatal_alert(&mut self, description: AlertDescription) {
        if self.transport_closed {
            return;
        }
        let alert = Alert::fatal(description);
        if self
            .record
            .seal(ContentType::Alert, &alert.encode(), &mut self.outgoing)
            .is_ok()
        {
            debug!("{} sending alert {}", self.role.as_str(), description);
            if let Err(e) = self.flush_outgoing() {
                trace!("alert not delivered: {}", e);
            }
        }
    }

    fn terminal_error(&self) -> Error {
        match &self.failure {
            Some(err) => err.replay(),
            None => Error::State("connection failed".to_string()),
        }
    }

    fn established_session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::State("handshake produced no session".to_string()))
    }

    /// Check application data may flow
    fn ensure_established(&self) -> Result<()> {
        match self.state {
            ConnectionState::Established => Ok(()),
            ConnectionState::Failed => Err(self.terminal_error()),
            ConnectionState::Closed => Err(Error::State("connection is closed".to_string())),
            ConnectionState::Uninitialized | ConnectionState::Handshaking => Err(Error::State(
                "handshake has not completed".to_string(),
            )),
        }
    }

    /// Encrypt and send application data, returning the bytes accepted
    ///
    /// All of `data` is accepted. On a non-blocking transport part of it may
    /// still be buffered; [`flush`](Self::flush) writes the rest.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_established()?;
        if self.sent_close_notify {
            return Err(Error::State("connection has been shut down".to_string()));
        }
        // Earlier records go first
        match self.flush_outgoing() {
            Ok(()) => {}
            Err(Error::WouldBlock) => return Err(Error::WouldBlock),
            Err(e) => return Err(self.fail(e)),
        }
        if let Err(e) = self
            .record
            .seal(ContentType::ApplicationData, data, &mut self.outgoing)
        {
            return Err(self.fail(e));
        }
        trace!("sending {} bytes of application data", data.len());
        match self.flush_outgoing() {
            Ok(()) | Err(Error::WouldBlock) => Ok(data.len()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Send all of `data` and wait until it is written
    pub fn send_all(&mut self, data: &[u8]) -> Result<()> {
        self.send(data)?;
        self.flush()
    }

    /// Write any buffered records to the transport
    pub fn flush(&mut self) -> Result<()> {
        if self.state == ConnectionState::Failed {
            return Err(self.terminal_error());
        }
        match self.flush_outgoing() {
            Ok(()) => Ok(()),
            Err(Error::WouldBlock) => Err(Error::WouldBlock),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Make application data available in `self.plaintext`
    ///
    /// Returns false when the peer closed cleanly and nothing is buffered.
    fn fill_plaintext(&mut self) -> Result<bool> {
        loop {
            if !self.plaintext.is_empty() {
                return Ok(true);
            }
            if self.peer_closed {
                return Ok(false);
            }
            if let Some(record) = self.record.open(&mut self.incoming)? {
                self.process_record(record)?;
                continue;
            }
            if !self.read_more()? {
                return Err(Error::Connection(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection without close_notify",
                )));
            }
        }
    }

    fn receive_with<F: FnOnce(&mut BytesMut) -> R, R>(&mut self, take: F) -> Result<Option<R>> {
        self.ensure_established()?;
        match self.fill_plaintext() {
            Ok(true) => Ok(Some(take(&mut self.plaintext))),
            Ok(false) => Ok(None),
            Err(Error::WouldBlock) => Err(Error::WouldBlock),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Receive up to `max_len` bytes of application data
    ///
    /// Returns an empty vector once the peer has sent close_notify.
    pub fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
        if max_len == 0 {
            self.ensure_established()?;
            return Ok(Vec::new());
        }
        let data = self.receive_with(|plaintext| {
            let n = max_len.min(plaintext.len());
            plaintext.split_to(n).to_vec()
        })?;
        Ok(data.unwrap_or_default())
    }

    /// Receive application data into `buf`, returning the bytes written
    ///
    /// Returns 0 once the peer has sent close_notify.
    pub fn receive_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            self.ensure_established()?;
            return Ok(0);
        }
        let n = self.receive_with(|plaintext| {
            let n = buf.len().min(plaintext.len());
            buf[..n].copy_from_slice(&plaintext[..n]);
            plaintext.advance(n);
            n
        })?;
        Ok(n.unwrap_or(0))
    }

    /// Send close_notify (best effort) and stop application data
    ///
    /// The transport stays open; see [`close`](Self::close).
    pub fn shutdown(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Failed => return Ok(()),
            ConnectionState::Uninitialized => {}
            ConnectionState::Handshaking | ConnectionState::Established => {
                if !self.sent_close_notify && !self.transport_closed {
                    self.sent_close_notify = true;
                    let alert = Alert::close_notify().encode();
                    if self
                        .record
                        .seal(ContentType::Alert, &alert, &mut self.outgoing)
                        .is_ok()
                    {
                        debug!("{} sending close_notify", self.role.as_str());
                        if let Err(e) = self.flush_outgoing() {
                            trace!("close_notify not delivered: {}", e);
                        }
                    }
                }
            }
        }
        if !self.engine.is_finished() {
            self.engine.abort();
        }
        self.state = ConnectionState::Closed;
        Ok(())
    }

    /// Shut down and close the transport; repeated calls do nothing
    pub fn close(&mut self) -> Result<()> {
        self.shutdown()?;
        if !self.transport_closed {
            self.transport_closed = true;
            self.transport.close()?;
        }
        Ok(())
    }

    /// Bound every blocking transport wait; `None` waits forever
    ///
    /// An expired wait fails the connection with a timed-out connection
    /// error.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Negotiated version label, `TLSv1.2` or `TLSv1.3`
    pub fn version(&self) -> Option<&'static str> {
        self.session.as_ref().map(|s| s.version().as_str())
    }

    /// `(suite name, version label, secret key bits)`
    pub fn cipher(&self) -> Option<(&'static str, &'static str, u32)> {
        self.session.as_ref().map(|s| s.cipher())
    }

    /// Verified peer certificate
    pub fn peer_certificate(&self) -> Option<&PeerIdentity> {
        self.session.as_ref().and_then(|s| s.peer())
    }

    pub fn selected_alpn_protocol(&self) -> Option<&[u8]> {
        self.session.as_ref().and_then(|s| s.alpn_protocol())
    }

    /// Hostname this client connection expects the server to have
    pub fn server_hostname(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.engine.state()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the peer has sent close_notify
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give the transport back; buffered data is discarded
    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T: Transport> io::Read for Connection<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.receive_into(buf)?)
    }
}

impl<T: Transport> io::Write for Connection<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.send(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(Connection::flush(self)?)
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("server_name", &self.server_name)
            .field("version", &self.version())
            .field("peer_closed", &self.peer_closed)
            .finish()
    }
}
