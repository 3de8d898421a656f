//! Native socket shim.
//!
//! The platform module is the only code in the crate that calls OS socket
//! functions. Every failure leaves it already classified as a
//! [`SocketError`](crate::error::SocketError).

#[cfg_attr(target_family = "unix", path = "sys/unix.rs")]
mod impls;

pub(crate) use impls::*;

#[cfg(not(target_family = "unix"))]
compile_error!("dualsock only ships a unix socket shim");

/// Socket type passed to [`socket`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SockType {
    Stream,
    Datagram,
}

/// Readiness interest for [`poll`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// Outcome of a connect call on a (possibly non-blocking) descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Connect {
    Done,
    InProgress,
}
