//! Errors raised by the connection engine.
//!
//! Every blocking wait in the engine is bounded, so most failures surface
//! as [`Error::Timeout`]. Protocol and unimplemented-feature errors are
//! turned into a terminal response by the connection reader; socket
//! failures simply end the connection.

use std::fmt::{Display, Formatter};
use std::io;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A bounded wait expired: socket I/O, pipe waits or the response queue.
    Timeout,

    /// Write past EOF, or any write on a closed pipe.
    BrokenPipe,

    /// A delimiter scan filled the pipe's soft capacity without a match.
    NoBufferSpace,

    /// The operation would have to wait on a non-blocking pipe end.
    WouldBlock,

    /// The client sent a malformed request.
    Protocol(String),

    /// The request uses a feature this server does not implement.
    Unimplemented(String),

    /// The application stopped consuming request data.
    UnresponsiveApplication,

    /// The application failed while producing a response.
    Application(String),

    /// Any other socket error.
    Io(io::Error),
}

impl Error {
    /// The status code of the terminal response this error produces, if
    /// one can be sent at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Protocol(_) => Some(400),
            Self::Unimplemented(_) => Some(501),
            Self::UnresponsiveApplication
            | Self::Application(_)
            | Self::NoBufferSpace
            | Self::WouldBlock => Some(500),
            Self::Timeout | Self::BrokenPipe | Self::Io(_) => None,
        }
    }

    /// True for failures of the socket itself (as opposed to the request).
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Timeout | Self::BrokenPipe | Self::Io(_))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "operation timed out"),
            Self::BrokenPipe => write!(f, "can't write past EOF on pipe"),
            Self::NoBufferSpace => write!(f, "no buffer space for delimiter scan"),
            Self::WouldBlock => write!(f, "pipe operation would block"),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Unimplemented(msg) => write!(f, "not implemented: {}", msg),
            Self::UnresponsiveApplication => {
                write!(f, "timed out waiting for application to consume input data")
            }
            Self::Application(msg) => write!(f, "application error: {}", msg),
            Self::Io(inner) => inner.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            _ => Self::Io(err),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => inner,
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            Error::BrokenPipe => io::Error::new(io::ErrorKind::BrokenPipe, err),
            Error::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, err),
            other => io::Error::other(other),
        }
    }
}
