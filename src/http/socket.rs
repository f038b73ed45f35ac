//! Blocking socket helpers used by the connection threads.
//!
//! The accepted socket is reached only through the [`Transport`] trait, so
//! a wrapped stream (TLS, or anything else that reads and writes bytes) can
//! be handed to a connection without the engine knowing.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::error::{Error, Result};

/// Longest single line accepted, including its CRLF.
pub const MAX_HEADER_LINE: usize = 8190;

/// Longest header block accepted.
pub const MAX_HEADER_SIZE: usize = 16380;

const READ_SIZE: usize = 8192;

/// Upper bound on data discarded while lingering on a closing socket.
const MAX_LINGER_BYTES: usize = 64 * 1024;

/// A connected byte stream with socket-like controls.
pub trait Transport: Read + Write + Send + 'static {
    /// A second handle on the same stream, for the writer thread.
    fn try_clone_box(&self) -> io::Result<Box<dyn Transport>>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for TcpStream {
    fn try_clone_box(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// Socket timeouts of zero mean "block forever", so round up.
fn socket_timeout(timeout: Duration) -> Option<Duration> {
    Some(timeout.max(Duration::from_millis(1)))
}

/// True for errors that just mean the peer has gone away.
fn is_hang_up(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
    )
}

/// Buffered, delimiter-aware reads from the read half of a connection.
///
/// Every read takes the timeout for the current phase of the request.
/// A peer hang-up is reported as `Ok(None)`, never as an error.
pub struct SocketReader {
    stream: Box<dyn Transport>,
    buf: BytesMut,
}

impl SocketReader {
    pub fn new(stream: Box<dyn Transport>) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_SIZE),
        }
    }

    /// Reads more data into the buffer. Returns false on hang-up.
    fn fill(&mut self, timeout: Duration) -> Result<bool> {
        self.stream.set_read_timeout(socket_timeout(timeout))?;
        let mut temp = [0u8; READ_SIZE];
        loop {
            match self.stream.read(&mut temp) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.buf.extend_from_slice(&temp[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_hang_up(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads one line, including its terminating LF.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos + 1 > MAX_HEADER_LINE {
                    return Err(Error::Protocol("line too long".to_string()));
                }
                return Ok(Some(self.buf.split_to(pos + 1).freeze()));
            }
            if self.buf.len() > MAX_HEADER_LINE {
                return Err(Error::Protocol("line too long".to_string()));
            }
            if !self.fill(timeout)? {
                return Ok(None);
            }
        }
    }

    /// Reads a header block up to and including the blank line ending it.
    pub fn read_headers(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut block = BytesMut::new();
        loop {
            let Some(line) = self.read_line(timeout)? else {
                return Ok(None);
            };
            block.extend_from_slice(&line);
            if block.len() > MAX_HEADER_SIZE {
                return Err(Error::Protocol("header block too large".to_string()));
            }
            if &line[..] == b"\r\n" || &line[..] == b"\n" {
                return Ok(Some(block.freeze()));
            }
        }
    }

    /// Reads between 1 and `max` bytes, buffered data first.
    pub fn read_data(&mut self, max: usize, timeout: Duration) -> Result<Option<Bytes>> {
        if self.buf.is_empty() && !self.fill(timeout)? {
            return Ok(None);
        }
        let n = self.buf.len().min(max.max(1));
        Ok(Some(self.buf.split_to(n).freeze()))
    }

    /// Half-closes the connection and discards whatever the peer still
    /// sends, until it closes its side or `timeout` passes.
    ///
    /// Closing a socket with unread input makes the kernel reset the
    /// connection, which can destroy a response the peer has not read yet.
    pub fn linger_close(mut self, timeout: Duration) {
        let _ = self.stream.shutdown(Shutdown::Write);
        let deadline = Instant::now() + timeout;
        let mut discarded = self.buf.len();
        while discarded < MAX_LINGER_BYTES {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.buf.clear();
            match self.fill(deadline - now) {
                Ok(true) => discarded += self.buf.len(),
                _ => break,
            }
        }
        debug!(discarded, "socket closed");
    }
}

/// Writes all of `data` within `timeout` per write call.
pub fn write_all(stream: &mut dyn Transport, data: &[u8], timeout: Duration) -> Result<()> {
    stream.set_write_timeout(socket_timeout(timeout))?;
    stream.write_all(data)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, SocketReader) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, SocketReader::new(Box::new(server)))
    }

    #[test]
    fn reads_lines_headers_and_data() {
        let (mut client, mut reader) = pair();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\nX: b\r\n\r\nbody")
            .unwrap();
        let timeout = Duration::from_secs(2);

        assert_eq!(
            reader.read_line(timeout).unwrap().unwrap(),
            "GET / HTTP/1.1\r\n"
        );
        assert_eq!(
            reader.read_headers(timeout).unwrap().unwrap(),
            "Host: a\r\nX: b\r\n\r\n"
        );
        assert_eq!(reader.read_data(2, timeout).unwrap().unwrap(), "bo");
        assert_eq!(reader.read_data(10, timeout).unwrap().unwrap(), "dy");
    }

    #[test]
    fn hang_up_is_not_an_error() {
        let (client, mut reader) = pair();
        drop(client);
        assert_eq!(reader.read_line(Duration::from_secs(2)).unwrap(), None);
    }

    #[test]
    fn silence_times_out() {
        let (_client, mut reader) = pair();
        assert!(matches!(
            reader.read_line(Duration::from_millis(50)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn overlong_line_is_a_protocol_error() {
        let (mut client, mut reader) = pair();
        let line = vec![b'a'; MAX_HEADER_LINE + 10];
        client.write_all(&line).unwrap();
        assert!(matches!(
            reader.read_line(Duration::from_secs(2)),
            Err(Error::Protocol(_))
        ));
    }
}
