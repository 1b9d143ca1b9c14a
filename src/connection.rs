//! Uniform blocking I/O over TCP and TLS sockets.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

/// Default read chunk size.
pub(crate) const READ_CHUNK: usize = 8 * 1024;

/// Object trait for the byte streams a [`Connection`] can sit on.
///
/// Implemented for plain TCP and rustls-wrapped TCP; tests substitute
/// scripted in-memory streams.
pub trait Io: Read + Write + Send {
    /// Apply (or clear) a read/write timeout on the underlying socket.
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Best-effort shutdown of the underlying socket.
    fn shutdown(&mut self);
}

impl Io for TcpStream {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

/// A live bidirectional byte stream with a small pushback buffer.
///
/// The connection has no notion of request framing; the parser uses
/// [`Connection::unread`] to return bytes it consumed past a message
/// boundary.
pub struct Connection {
    io: Option<Box<dyn Io>>,
    pushback: BytesMut,
    deadline: Option<Instant>,
}

impl Connection {
    pub fn new(io: Box<dyn Io>) -> Connection {
        Connection {
            io: Some(io),
            pushback: BytesMut::new(),
            deadline: None,
        }
    }

    /// Set the instant after which reads and writes fail with a timeout.
    ///
    /// `None` clears the socket timeouts again; body reads run without a
    /// deadline.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
        if deadline.is_none() {
            if let Some(io) = self.io.as_mut() {
                let _ = io.set_io_timeout(None);
            }
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn arm(&mut self) -> io::Result<()> {
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if deadline <= now {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline expired"));
            }
            if let Some(io) = self.io.as_mut() {
                io.set_io_timeout(Some(deadline - now))?;
            }
        }
        Ok(())
    }

    fn io_mut(&mut self) -> io::Result<&mut Box<dyn Io>> {
        self.io
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }

    /// Read up to one chunk. An empty buffer signals EOF.
    pub fn read(&mut self) -> io::Result<Bytes> {
        if !self.pushback.is_empty() {
            let n = self.pushback.len().min(READ_CHUNK);
            return Ok(self.pushback.split_to(n).freeze());
        }
        self.arm()?;
        let io = self.io_mut()?;
        let mut buf = [0u8; READ_CHUNK];
        let n = io.read(&mut buf)?;
        Ok(Bytes::copy_from_slice(&buf[..n]))
    }

    /// Read exactly `n` bytes, failing with `UnexpectedEof` if the peer
    /// closes first.
    pub fn read_exactly(&mut self, n: usize) -> io::Result<Bytes> {
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let chunk = self.read()?;
            if chunk.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before full read",
                ));
            }
            let want = n - out.len();
            if chunk.len() > want {
                out.extend_from_slice(&chunk[..want]);
                self.unread(&chunk[want..]);
            } else {
                out.extend_from_slice(&chunk);
            }
        }
        Ok(out.freeze())
    }

    /// Push bytes back so the next [`Connection::read`] returns them first.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.pushback.is_empty() {
            self.pushback.extend_from_slice(bytes);
        } else {
            let mut buf = BytesMut::with_capacity(bytes.len() + self.pushback.len());
            buf.extend_from_slice(bytes);
            buf.extend_from_slice(&self.pushback);
            self.pushback = buf;
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.arm()?;
        let io = self.io_mut()?;
        io.write_all(bytes)?;
        io.flush()
    }

    /// Shut the socket down and drop it. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut io) = self.io.take() {
            io.shutdown();
        }
        self.pushback.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.io.is_none()
    }

    /// Detach the underlying stream without shutting it down, discarding
    /// any pushed-back bytes.
    pub(crate) fn into_io(mut self) -> Option<Box<dyn Io>> {
        self.io.take()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.io.is_none())
            .field("pushback", &self.pushback.len())
            .finish()
    }
}
