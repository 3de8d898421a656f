//! Native strategies behind one socket.
//!
//! [`Backend`] is chosen once at socket creation and never changes. Both
//! variants expose their descriptors as shared [`FdHandle`]s; sockets clone
//! the handles they need and release the backend lock before blocking.

mod dual_stack;
mod two_descriptor;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

pub(crate) use dual_stack::DualStack;
pub(crate) use two_descriptor::TwoDescriptor;

use crate::{
    addr::Family,
    context::{SocketContext, SocketKind, Strategy},
    error::{Result, SocketError},
    fd::FdHandle,
    ledger::LedgerTicket,
    options::OptionTranslator,
    sys::{self, Interest, RawFd, SockType},
};

pub(crate) trait SocketBackend {
    fn strategy(&self) -> Strategy;

    /// Every open descriptor.
    fn handles(&self) -> Vec<Arc<FdHandle>>;

    /// Descriptor and native address used to reach `addr`.
    fn route(&self, addr: SocketAddr) -> Result<(Arc<FdHandle>, SocketAddr)>;

    fn bind(&mut self, addr: SocketAddr, options: &OptionTranslator) -> Result<()>;

    /// Put every descriptor into listening mode (non-blocking, accept polls).
    fn listen(&self, backlog: i32) -> Result<()>;

    /// Keep only the descriptor of `family` once a peer is fixed.
    fn pin(&mut self, family: Family);

    /// Descriptors to wait on for input, `prefer` first when given.
    fn read_set(&self, prefer: Option<Family>) -> ReadSet;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// Caller-facing form of an address reported by a descriptor.
    fn normalize(&self, addr: SocketAddr) -> SocketAddr;

    /// Descriptor carrying multicast membership for `group`.
    fn membership(&self, group: IpAddr) -> Result<Arc<FdHandle>>;

    /// Close the descriptor of `family` and put a fresh, unbound one carrying
    /// the same options in its place.
    fn renew(&mut self, family: Family, options: &OptionTranslator) -> Result<Arc<FdHandle>>;

    fn close(&mut self);
}

/// Tagged strategy stored in each socket.
#[derive(Debug)]
pub(crate) enum Backend {
    DualStack(DualStack),
    TwoDescriptor(TwoDescriptor),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $e:expr) => {
        match $self {
            Backend::DualStack($b) => $e,
            Backend::TwoDescriptor($b) => $e,
        }
    };
}

impl Backend {
    /// Create the native descriptors for a new socket of `kind`.
    pub(crate) fn open(ctx: &SocketContext, kind: SocketKind) -> Result<Self> {
        let ticket = Arc::new(ctx.ledger().before_create(kind.ledger_kind())?);

        let ty = match kind {
            SocketKind::Stream => SockType::Stream,
            SocketKind::Datagram | SocketKind::Multicast => SockType::Datagram,
        };

        let prefer_ipv6 = ctx.config().prefer_ipv6_addresses;

        let backend = match ctx.strategy(kind) {
            Strategy::DualStack => Self::DualStack(DualStack::open(ty, ticket, prefer_ipv6)?),
            Strategy::TwoDescriptor => Self::TwoDescriptor(TwoDescriptor::open(
                ty,
                ticket,
                ctx.capabilities().ipv6,
                prefer_ipv6,
            )?),
        };

        log::debug!("{} socket created, {}", kind, backend.strategy());

        Ok(backend)
    }

    /// Wrap a descriptor returned by `accept` on a listener of this strategy.
    pub(crate) fn accepted(
        &self,
        raw: RawFd,
        family: Family,
        ticket: Arc<LedgerTicket>,
        prefer_ipv6: bool,
    ) -> Self {
        let handle = Arc::new(FdHandle::new(raw, family, Some(ticket)));

        match self {
            Self::DualStack(_) => Self::DualStack(DualStack::from_handle(handle, prefer_ipv6)),
            Self::TwoDescriptor(_) => {
                Self::TwoDescriptor(TwoDescriptor::from_handle(handle, prefer_ipv6))
            }
        }
    }
}

impl SocketBackend for Backend {
    fn strategy(&self) -> Strategy {
        dispatch!(self, b => b.strategy())
    }

    fn handles(&self) -> Vec<Arc<FdHandle>> {
        dispatch!(self, b => b.handles())
    }

    fn route(&self, addr: SocketAddr) -> Result<(Arc<FdHandle>, SocketAddr)> {
        dispatch!(self, b => b.route(addr))
    }

    fn bind(&mut self, addr: SocketAddr, options: &OptionTranslator) -> Result<()> {
        dispatch!(self, b => b.bind(addr, options))
    }

    fn listen(&self, backlog: i32) -> Result<()> {
        dispatch!(self, b => b.listen(backlog))
    }

    fn pin(&mut self, family: Family) {
        dispatch!(self, b => b.pin(family))
    }

    fn read_set(&self, prefer: Option<Family>) -> ReadSet {
        dispatch!(self, b => b.read_set(prefer))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        dispatch!(self, b => b.local_addr())
    }

    fn normalize(&self, addr: SocketAddr) -> SocketAddr {
        dispatch!(self, b => b.normalize(addr))
    }

    fn membership(&self, group: IpAddr) -> Result<Arc<FdHandle>> {
        dispatch!(self, b => b.membership(group))
    }

    fn renew(&mut self, family: Family, options: &OptionTranslator) -> Result<Arc<FdHandle>> {
        dispatch!(self, b => b.renew(family, options))
    }

    fn close(&mut self) {
        dispatch!(self, b => b.close())
    }
}

/// Descriptors waited on together for readability.
#[derive(Debug)]
pub(crate) struct ReadSet {
    handles: Vec<Arc<FdHandle>>,
}

impl ReadSet {
    pub(crate) fn new(handles: Vec<Arc<FdHandle>>) -> Self {
        Self { handles }
    }

    /// Block until at least one descriptor is readable.
    ///
    /// `None` waits forever. Returns the ready descriptors in set order, or
    /// [`SocketError::Timeout`] tagged with `op`.
    pub(crate) fn wait(&self, timeout: Option<Duration>, op: &'static str) -> Result<Vec<Arc<FdHandle>>> {
        if self.handles.is_empty() {
            return Err(SocketError::Closed);
        }

        let guards = self
            .handles
            .iter()
            .map(|handle| handle.acquire())
            .collect::<Result<Vec<_>>>()?;

        let fds: Vec<_> = guards
            .iter()
            .map(|guard| (guard.raw(), Interest::Read))
            .collect();

        let ready = sys::poll(&fds, timeout)?;

        drop(guards);

        let ready: Vec<_> = self
            .handles
            .iter()
            .zip(ready)
            .filter(|(_, ready)| *ready)
            .map(|(handle, _)| handle.clone())
            .collect();

        if ready.is_empty() {
            return Err(SocketError::Timeout(op));
        }

        Ok(ready)
    }
}

/// Create one descriptor of `family`, IPv6 ones restricted to IPv6 traffic
/// unless `v6only` is false.
fn open_handle(
    family: Family,
    ty: SockType,
    v6only: bool,
    ticket: Arc<LedgerTicket>,
) -> Result<Arc<FdHandle>> {
    let raw = sys::socket(family, ty)?;

    if family == Family::V6 {
        if let Err(err) = sys::set_v6only(raw, v6only) {
            _ = sys::close(raw);
            return Err(err);
        }
    }

    Ok(Arc::new(FdHandle::new(raw, family, Some(ticket))))
}
