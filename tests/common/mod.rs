//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use jimmies::{Connection, Context, Error, Purpose, Role, Transport};

pub use jimmies::{Identity, TrustStore};

#[path = "../../src/testutil.rs"]
pub mod testutil;

pub use testutil::{KeyKind, Pki};

pub const HOSTNAME: &str = "jimmies.local";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Client context trusting the test root
pub fn client_context(pki: &Pki) -> Context {
    Context::new(pki.trust(), Purpose::ServerAuth)
}

/// Server context presenting the test server identity
pub fn server_context(pki: &Pki) -> Context {
    let mut ctx = Context::new(pki.trust(), Purpose::ClientAuth);
    ctx.set_identity(pki.server_identity()).unwrap();
    ctx
}

/// Accept one TCP connection and hand the wrapped server side to `handler`
pub fn spawn_server<F, R>(ctx: Context, handler: F) -> (SocketAddr, JoinHandle<R>)
where
    F: FnOnce(Connection<TcpStream>) -> R + Send + 'static,
    R: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let conn = ctx.wrap(stream, Role::Server, None).unwrap();
        handler(conn)
    });
    (addr, handle)
}

/// Read until `len` bytes arrived or the peer closed
pub fn receive_exact<T: Transport>(conn: &mut Connection<T>, len: usize) -> jimmies::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        let chunk = conn.receive(len - data.len())?;
        if chunk.is_empty() {
            break;
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

#[derive(Default)]
struct Channel {
    data: VecDeque<u8>,
    closed: bool,
    /// Flip a byte of the next write at this offset
    corrupt_at: Option<usize>,
}

/// One end of an in-memory, non-blocking byte pipe
///
/// Reads and writes move at most `chunk` bytes per call. An empty pipe
/// reports `WouldBlock` until the other end closes.
pub struct MemoryStream {
    incoming: Arc<Mutex<Channel>>,
    outgoing: Arc<Mutex<Channel>>,
    chunk: usize,
}

pub fn memory_pair(chunk: usize) -> (MemoryStream, MemoryStream) {
    let a_to_b = Arc::new(Mutex::new(Channel::default()));
    let b_to_a = Arc::new(Mutex::new(Channel::default()));
    (
        MemoryStream {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
            chunk,
        },
        MemoryStream {
            incoming: a_to_b,
            outgoing: b_to_a,
            chunk,
        },
    )
}

impl MemoryStream {
    /// Corrupt the byte at `offset` of the next write
    pub fn corrupt_next_write(&self, offset: usize) {
        self.outgoing.lock().unwrap().corrupt_at = Some(offset);
    }

    /// Bytes written by the peer and not yet read
    pub fn pending(&self) -> usize {
        self.incoming.lock().unwrap().data.len()
    }
}

impl Transport for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut channel = self.incoming.lock().unwrap();
        if channel.data.is_empty() {
            return if channel.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(self.chunk).min(channel.data.len());
        for (slot, byte) in buf.iter_mut().zip(channel.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut channel = self.outgoing.lock().unwrap();
        if channel.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = buf.len().min(self.chunk);
        let mut data = buf[..n].to_vec();
        if let Some(offset) = channel.corrupt_at.take() {
            if offset < data.len() {
                data[offset] ^= 0xff;
            }
        }
        channel.data.extend(data);
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.outgoing.lock().unwrap().closed = true;
        self.incoming.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Step both handshakes until they finish; panics if they stall
pub fn drive_handshakes<A: Transport, B: Transport>(
    client: &mut Connection<A>,
    server: &mut Connection<B>,
) -> (jimmies::Result<()>, jimmies::Result<()>) {
    let mut client_result = None;
    let mut server_result = None;
    for _ in 0..100_000 {
        if client_result.is_none() {
            match client.handshake() {
                Err(Error::WouldBlock) => {}
                other => client_result = Some(other.map(|_| ())),
            }
        }
        if server_result.is_none() {
            match server.handshake() {
                Err(Error::WouldBlock) => {}
                other => server_result = Some(other.map(|_| ())),
            }
        }
        if let (Some(_), Some(_)) = (&client_result, &server_result) {
            break;
        }
    }
    match (client_result, server_result) {
        (Some(c), Some(s)) => (c, s),
        _ => panic!("handshake stalled"),
    }
}
