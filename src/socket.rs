//! Stream and datagram socket cores.

mod datagram;
mod stream;

use std::{
    net::SocketAddr,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

pub use datagram::{DatagramPacket, DatagramSocket};
pub use stream::{ReadResult, SocketInputStream, SocketOutputStream, StreamSocket};

use crate::{
    context::Strategy,
    error::Result,
    options::{OptionValue, SocketOption},
};

/// Lifecycle of a socket. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketState {
    Unbound,
    Bound,
    Listening,
    /// Connected stream, or associated datagram socket.
    Connected,
    Closed,
}

/// A socket produced by [`SocketContext::create`](crate::context::SocketContext::create).
#[derive(Clone, Debug)]
pub enum Socket {
    Stream(StreamSocket),
    Datagram(DatagramSocket),
}

impl Socket {
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        match self {
            Self::Stream(s) => s.bind(addr),
            Self::Datagram(s) => s.bind(addr),
        }
    }

    pub fn set_option(&self, option: SocketOption, value: OptionValue) -> Result<()> {
        match self {
            Self::Stream(s) => s.set_option(option, value),
            Self::Datagram(s) => s.set_option(option, value),
        }
    }

    pub fn get_option(&self, option: SocketOption) -> Result<OptionValue> {
        match self {
            Self::Stream(s) => s.get_option(option),
            Self::Datagram(s) => s.get_option(option),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            Self::Stream(s) => s.local_addr(),
            Self::Datagram(s) => s.local_addr(),
        }
    }

    pub fn state(&self) -> SocketState {
        match self {
            Self::Stream(s) => s.state(),
            Self::Datagram(s) => s.state(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Self::Stream(s) => s.strategy(),
            Self::Datagram(s) => s.strategy(),
        }
    }

    pub fn close(&self) {
        match self {
            Self::Stream(s) => s.close(),
            Self::Datagram(s) => s.close(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Absolute deadline for a wait; `None` waits forever.
#[derive(Clone, Copy, Debug)]
struct Deadline(Option<Instant>);

impl Deadline {
    fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.map(|timeout| Instant::now() + timeout))
    }

    fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// `Duration::ZERO` means no timeout.
fn non_zero(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}
