use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use crate::{
    addr::{from_mapped, to_mapped, Family},
    context::Strategy,
    error::{Result, SocketError},
    fd::FdHandle,
    ledger::LedgerTicket,
    options::OptionTranslator,
    sys::{self, SockType},
};

use super::{open_handle, ReadSet, SocketBackend};

/// One IPv6 descriptor with `IPV6_V6ONLY` cleared.
#[derive(Debug)]
pub(crate) struct DualStack {
    ty: SockType,
    handle: Arc<FdHandle>,
    /// Ledger slot for replacement descriptors; accepted sockets have none.
    ticket: Option<Arc<LedgerTicket>>,
    prefer_ipv6: bool,
}

impl DualStack {
    pub(crate) fn open(ty: SockType, ticket: Arc<LedgerTicket>, prefer_ipv6: bool) -> Result<Self> {
        let handle = open_handle(Family::V6, ty, false, ticket.clone())?;

        Ok(Self {
            ty,
            handle,
            ticket: Some(ticket),
            prefer_ipv6,
        })
    }

    pub(crate) fn from_handle(handle: Arc<FdHandle>, prefer_ipv6: bool) -> Self {
        Self {
            ty: SockType::Stream,
            handle,
            ticket: None,
            prefer_ipv6,
        }
    }
}

impl SocketBackend for DualStack {
    fn strategy(&self) -> Strategy {
        Strategy::DualStack
    }

    fn handles(&self) -> Vec<Arc<FdHandle>> {
        vec![self.handle.clone()]
    }

    fn route(&self, addr: SocketAddr) -> Result<(Arc<FdHandle>, SocketAddr)> {
        Ok((self.handle.clone(), to_mapped(addr)))
    }

    fn bind(&mut self, addr: SocketAddr, _options: &OptionTranslator) -> Result<()> {
        let fd = self.handle.acquire()?;

        sys::bind(fd.raw(), to_mapped(addr))
    }

    fn listen(&self, backlog: i32) -> Result<()> {
        let fd = self.handle.acquire()?;

        sys::listen(fd.raw(), backlog)?;

        sys::set_nonblocking(fd.raw(), true)
    }

    fn pin(&mut self, _family: Family) {}

    fn read_set(&self, _prefer: Option<Family>) -> ReadSet {
        ReadSet::new(self.handles())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        let fd = self.handle.acquire()?;

        let addr = from_mapped(sys::local_addr(fd.raw())?);

        if addr.ip().is_unspecified() && !self.prefer_ipv6 {
            Ok(SocketAddr::new(Family::V4.unspecified(), addr.port()))
        } else {
            Ok(addr)
        }
    }

    fn normalize(&self, addr: SocketAddr) -> SocketAddr {
        from_mapped(addr)
    }

    fn membership(&self, _group: IpAddr) -> Result<Arc<FdHandle>> {
        Err(SocketError::NotSupportedByImplementation("multicast"))
    }

    fn renew(&mut self, _family: Family, options: &OptionTranslator) -> Result<Arc<FdHandle>> {
        let ticket = self
            .ticket
            .clone()
            .ok_or(SocketError::InvalidState("descriptor cannot be replaced"))?;

        let fresh = open_handle(Family::V6, self.ty, false, ticket)?;

        options.replay(&fresh)?;

        std::mem::replace(&mut self.handle, fresh.clone()).close();

        log::debug!("dual-stack descriptor replaced");

        Ok(fresh)
    }

    fn close(&mut self) {
        self.handle.close();

        self.ticket = None;
    }
}
