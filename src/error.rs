// src/error.rs

use std::fmt;
use std::io;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The closed set of failures surfaced by connections, channels and
/// contexts.
///
/// The first error observed by an object is latched; every callback
/// still pending on that object fires exactly once with a clone of the
/// latched error, and later submissions fail immediately with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The connection was closed, locally or by the peer.
    ConnectionClosed,
    /// The channel was closed.
    ChannelClosed,
    /// The owning context was closed.
    ContextClosed,
    /// A syscall failed; carries the syscall name and the errno.
    SystemError { syscall: &'static str, errno: i32 },
    /// A cross-process copy returned fewer bytes than requested.
    ShortRead { expected: usize, actual: usize },
    /// The peer shut down its end while we were reading.
    Eof,
    /// The peer violated the wire protocol.
    ProtocolViolation(String),
}

impl Error {
    /// Build a `SystemError` from the calling thread's `errno`.
    pub fn system(syscall: &'static str) -> Self {
        Error::SystemError {
            syscall,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    pub fn short_read(expected: usize, actual: usize) -> Self {
        Error::ShortRead { expected, actual }
    }

    /// True for the `*Closed` family, i.e. errors that describe an
    /// orderly teardown rather than a fault.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::ChannelClosed | Error::ContextClosed
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::ChannelClosed => write!(f, "channel closed"),
            Error::ContextClosed => write!(f, "context closed"),
            Error::SystemError { syscall, errno } => {
                let detail = io::Error::from_raw_os_error(*errno);
                write!(f, "{syscall} failed: {detail} (errno {errno})")
            }
            Error::ShortRead { expected, actual } => {
                write!(f, "short read: expected {expected} bytes, got {actual}")
            }
            Error::Eof => write!(f, "unexpected end of stream"),
            Error::ProtocolViolation(reason) => write!(f, "protocol violation: {reason}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Error::Eof;
        }
        Error::SystemError {
            syscall: "io",
            errno: e.raw_os_error().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_family() {
        assert!(Error::ConnectionClosed.is_closed());
        assert!(Error::ChannelClosed.is_closed());
        assert!(Error::ContextClosed.is_closed());
        assert!(!Error::Eof.is_closed());
        assert!(!Error::short_read(8, 3).is_closed());
    }

    #[test]
    fn display_carries_reason() {
        let e = Error::SystemError {
            syscall: "eventfd",
            errno: libc::EMFILE,
        };
        let s = e.to_string();
        assert!(s.contains("eventfd"));
        assert!(s.contains(&libc::EMFILE.to_string()));

        let s = Error::short_read(100, 42).to_string();
        assert!(s.contains("100"));
        assert!(s.contains("42"));
    }

    #[test]
    fn io_error_conversion() {
        let io_err = io::Error::from_raw_os_error(libc::EPIPE);
        let e: Error = io_err.into();
        assert_eq!(
            e,
            Error::SystemError {
                syscall: "io",
                errno: libc::EPIPE
            }
        );

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(Error::from(eof), Error::Eof);
    }
}
