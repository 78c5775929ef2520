//! Transport abstraction
//!
//! A [`Transport`] is the reliable, ordered byte stream a connection runs
//! over. Connections only ever call these operations, so plain TCP, Unix
//! domain sockets, raw `socket2` sockets and in-memory test pipes all work
//! the same way.
//!
//! A socket in blocking mode reports an expired `SO_RCVTIMEO` or
//! `SO_SNDTIMEO` as `WouldBlock`. The socket impls turn that into
//! `TimedOut` so it fails the connection instead of asking for a retry.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use socket2::{SockRef, Socket, Type};

use crate::error::{Error, Result};

/// Readiness a caller waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
}

/// Stream capability required by a connection
///
/// A read of zero bytes means the peer closed the stream. Non-blocking
/// transports report "not ready" as `io::ErrorKind::WouldBlock`.
pub trait Transport {
    /// Read data from the stream
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write data to the stream
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Close the stream; later reads and writes fail
    fn close(&mut self) -> io::Result<()>;

    /// Wait until the stream is ready for `events`
    ///
    /// Returns false when `timeout` elapsed first. Transports that cannot
    /// wait report ready immediately.
    fn poll(&self, _events: PollEvents, _timeout: Option<Duration>) -> io::Result<bool> {
        Ok(true)
    }
}

/// Wait for readiness of a raw descriptor
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1); // -1 = infinite

    loop {
        // SAFETY: pfd is a valid pollfd for the duration of the call
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result >= 0 {
            return Ok(result > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Shutdown errors on an already disconnected socket are not failures
fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

/// Report `WouldBlock` from a blocking socket as a timeout
fn socket_timeout<S: AsFd>(socket: &S, result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            if SockRef::from(socket).nonblocking()? {
                Err(e)
            } else {
                Err(io::Error::new(io::ErrorKind::TimedOut, "socket timeout expired"))
            }
        }
        other => other,
    }
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = Read::read(self, buf);
        socket_timeout(self, result)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = Write::write(self, buf);
        socket_timeout(self, result)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }

    fn close(&mut self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }

    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        poll_fd(self.as_raw_fd(), events, timeout)
    }
}

impl Transport for UnixStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = Read::read(self, buf);
        socket_timeout(self, result)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = Write::write(self, buf);
        socket_timeout(self, result)
    }

    fn close(&mut self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }

    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        poll_fd(self.as_raw_fd(), events, timeout)
    }
}

impl Transport for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = Read::read(self, buf);
        socket_timeout(self, result)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = Write::write(self, buf);
        socket_timeout(self, result)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }

    fn close(&mut self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }

    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        poll_fd(self.as_raw_fd(), events, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        (**self).poll(events, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        (**self).poll(events, timeout)
    }
}

/// Take ownership of a descriptor that must be a connected stream socket
///
/// Anything else (a regular file, a pipe, a datagram or listening socket)
/// is rejected with [`Error::Type`]; the descriptor is closed in that case.
pub fn stream_socket(fd: OwnedFd) -> Result<Socket> {
    let socket = Socket::from(fd);
    match socket.r#type() {
        Ok(ty) if ty == Type::STREAM => {}
        Ok(ty) => {
            return Err(Error::Type(format!(
                "expected a stream socket, got socket type {:?}",
                ty
            )))
        }
        Err(e) if e.raw_os_error() == Some(libc::ENOTSOCK) => {
            return Err(Error::Type(
                "expected a socket, got a non-socket file descriptor".to_string(),
            ))
        }
        Err(e) => return Err(Error::Connection(e)),
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if socket.is_listener()? {
        return Err(Error::Type(
            "expected a connected socket, got a listening socket".to_string(),
        ));
    }

    Ok(socket)
}
