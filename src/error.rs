//! Error types for shunt.

use std::io;

/// Fabric operation errors.
#[derive(Debug)]
pub enum Error {
    /// IO error from a real socket on the host side.
    Io(io::Error),
    /// Message channel to the host is down. All further calls fail fast.
    LinkDown,
    /// Operation is invalid in the socket's current state.
    InvalidState,
    /// Decoded envelope header does not match any known layout.
    InvalidEnvelope,
    /// Remote side reported an errno for the operation.
    Remote(i32),
    /// Host-side send backlog cannot absorb the payload.
    BacklogOverflow,
    /// Operation would block and the socket is non-blocking.
    WouldBlock,
    /// Socket was shut down or reached end of stream.
    Disconnected,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::LinkDown => write!(f, "Message channel link is down"),
            Error::InvalidState => write!(f, "Operation invalid in current socket state"),
            Error::InvalidEnvelope => write!(f, "Invalid envelope header"),
            Error::Remote(errno) => write!(f, "Remote operation failed with errno {}", errno),
            Error::BacklogOverflow => write!(f, "Host send backlog overflow"),
            Error::WouldBlock => write!(f, "Operation would block"),
            Error::Disconnected => write!(f, "Socket disconnected"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// Errno carried on the wire in reply `rc` fields.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Remote(errno) => *errno,
            Error::BacklogOverflow => libc::ENOBUFS,
            Error::WouldBlock => libc::EAGAIN,
            Error::Disconnected => libc::ECONNRESET,
            _ => libc::EIO,
        }
    }

    /// Build an error from an errno received in a reply `rc` field.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EAGAIN => Error::WouldBlock,
            libc::ENOBUFS => Error::BacklogOverflow,
            _ => Error::Remote(errno),
        }
    }
}

/// Error from channel `put`. Transient fullness is kept separate from
/// peer loss so callers can retry one and fail fast on the other.
#[derive(Debug, PartialEq, Eq)]
pub enum PutError {
    /// No free slot. Retry after backoff.
    Full,
    /// Payload exceeds the slot capacity. Retrying cannot help.
    TooBig,
    /// Peer side of the channel is gone.
    Closed,
}

impl std::fmt::Display for PutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PutError::Full => write!(f, "Channel queue is full"),
            PutError::TooBig => write!(f, "Payload exceeds channel slot capacity"),
            PutError::Closed => write!(f, "Channel peer is gone"),
        }
    }
}

impl std::error::Error for PutError {}

/// Result type for shunt operations.
pub type Result<T> = std::result::Result<T, Error>;
