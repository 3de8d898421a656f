//! Error taxonomy shared by every socket operation.
//!
//! Native failures are classified once, inside the platform shim, and never
//! reach callers as raw errno values.

use std::{io, net::IpAddr};

use thiserror::Error;

use crate::{ledger::LedgerKind, options::SocketOption};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SocketError {
    /// The socket (or its descriptor) is gone.
    #[error("socket closed")]
    Closed,
    /// A timed operation did not complete; the socket stays usable.
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    /// Asynchronous ICMP unreachable reported on an associated datagram socket.
    #[error("ICMP port unreachable")]
    Unreachable,
    #[error("no route to host")]
    NoRouteToHost,
    #[error("address already in use")]
    AddressInUse,
    #[error("cannot assign requested address")]
    AddressNotAvailable,
    #[error("unsupported socket option {0}")]
    UnsupportedOption(String),
    #[error("invalid value for {option}: {reason}")]
    InvalidOptionValue {
        option: SocketOption,
        reason: String,
    },
    #[error("{0} not supported for this implementation")]
    NotSupportedByImplementation(&'static str),
    #[error("too many open {kind} sockets (limit {limit})")]
    TooManySockets { kind: LedgerKind, limit: usize },
    #[error("invalid socket state: {0}")]
    InvalidState(&'static str),
    #[error("{0} is not a multicast address")]
    NotMulticast(IpAddr),
    #[error("no such network interface: {0}")]
    UnknownInterface(String),
    #[error("operation would block")]
    WouldBlock,
    #[error("interrupted system call")]
    Interrupted,
    #[error("{op} failed")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SocketError>;

impl SocketError {
    /// Shorthand for a rejected option value.
    pub(crate) fn invalid_value(option: SocketOption, reason: impl Into<String>) -> Self {
        Self::InvalidOptionValue {
            option,
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// The closest [`io::ErrorKind`] for this error.
    pub fn kind(&self) -> io::ErrorKind {
        use io::ErrorKind;

        match self {
            Self::Closed => ErrorKind::NotConnected,
            Self::Timeout(_) => ErrorKind::TimedOut,
            Self::ConnectionReset => ErrorKind::ConnectionReset,
            Self::ConnectionRefused | Self::Unreachable => ErrorKind::ConnectionRefused,
            Self::AddressInUse => ErrorKind::AddrInUse,
            Self::AddressNotAvailable => ErrorKind::AddrNotAvailable,
            Self::UnsupportedOption(_)
            | Self::InvalidOptionValue { .. }
            | Self::NotMulticast(_)
            | Self::UnknownInterface(_) => ErrorKind::InvalidInput,
            Self::NotSupportedByImplementation(_) => ErrorKind::Unsupported,
            Self::WouldBlock => ErrorKind::WouldBlock,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Os { source, .. } => source.kind(),
            Self::NoRouteToHost | Self::TooManySockets { .. } | Self::InvalidState(_) => {
                ErrorKind::Other
            }
        }
    }
}

impl From<SocketError> for io::Error {
    fn from(err: SocketError) -> Self {
        match err {
            SocketError::Os { source, .. } => source,
            err => io::Error::new(err.kind(), err),
        }
    }
}
