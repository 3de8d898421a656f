use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    addr::{from_mapped, Family},
    context::Strategy,
    error::{Result, SocketError},
    fd::FdHandle,
    ledger::LedgerTicket,
    options::OptionTranslator,
    sys::{self, SockType},
};

use super::{open_handle, ReadSet, SocketBackend};

/// Attempts at finding an ephemeral port free on both families.
const WILDCARD_BIND_ATTEMPTS: usize = 5;

/// Separate IPv4 and IPv6 descriptors sharing one ledger slot.
#[derive(Debug)]
pub(crate) struct TwoDescriptor {
    ty: SockType,
    v4: Option<Arc<FdHandle>>,
    v6: Option<Arc<FdHandle>>,
    /// Kept until close so a rebinding IPv4 descriptor joins the same slot.
    ticket: Option<Arc<LedgerTicket>>,
    prefer_ipv6: bool,
    turn: AtomicUsize,
}

impl TwoDescriptor {
    pub(crate) fn open(
        ty: SockType,
        ticket: Arc<LedgerTicket>,
        ipv6: bool,
        prefer_ipv6: bool,
    ) -> Result<Self> {
        let v4 = open_handle(Family::V4, ty, true, ticket.clone())?;

        let v6 = if ipv6 {
            match open_handle(Family::V6, ty, true, ticket.clone()) {
                Ok(handle) => Some(handle),
                Err(SocketError::NotSupportedByImplementation(_)) => {
                    log::debug!("IPv6 descriptor unavailable, IPv4 only");
                    None
                }
                Err(err) => {
                    v4.close();
                    return Err(err);
                }
            }
        } else {
            None
        };

        Ok(Self {
            ty,
            v4: Some(v4),
            v6,
            ticket: Some(ticket),
            prefer_ipv6,
            turn: AtomicUsize::new(0),
        })
    }

    pub(crate) fn from_handle(handle: Arc<FdHandle>, prefer_ipv6: bool) -> Self {
        let (v4, v6) = match handle.family() {
            Family::V4 => (Some(handle), None),
            Family::V6 => (None, Some(handle)),
        };

        Self {
            ty: SockType::Stream,
            v4,
            v6,
            ticket: None,
            prefer_ipv6,
            turn: AtomicUsize::new(0),
        }
    }

    fn handle(&self, family: Family) -> Option<&Arc<FdHandle>> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }

    fn require(&self, family: Family) -> Result<&Arc<FdHandle>> {
        self.handle(family).ok_or(match family {
            Family::V4 => SocketError::NotSupportedByImplementation("IPv4 on this socket"),
            Family::V6 => SocketError::NotSupportedByImplementation("IPv6 on this socket"),
        })
    }

    fn drop_family(&mut self, family: Family) {
        let slot = match family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        };

        if let Some(handle) = slot.take() {
            log::debug!("drop unused {} descriptor", family);
            handle.close();
        }
    }

    /// Bind both descriptors to the wildcard address on one port.
    ///
    /// A failure after the IPv4 side is bound leaves a fresh, unbound IPv4
    /// descriptor behind so the bind can be retried.
    fn bind_wildcard(
        &mut self,
        mut v4: Arc<FdHandle>,
        v6: Arc<FdHandle>,
        port: u16,
        options: &OptionTranslator,
    ) -> Result<()> {
        for attempt in 1..=WILDCARD_BIND_ATTEMPTS {
            bind_family(&v4, port)?;

            let chosen = match port {
                0 => {
                    let fd = v4.acquire()?;
                    sys::local_addr(fd.raw())?.port()
                }
                port => port,
            };

            let err = match bind_family(&v6, chosen) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            // A bound descriptor cannot be rebound; replace it.
            v4 = self.renew(Family::V4, options)?;

            match err {
                SocketError::AddressInUse if port == 0 && attempt < WILDCARD_BIND_ATTEMPTS => {
                    log::debug!("port {} busy on IPv6, retry({})", chosen, attempt);
                }
                err => return Err(err),
            }
        }

        Err(SocketError::AddressInUse)
    }
}

fn bind_family(handle: &FdHandle, port: u16) -> Result<()> {
    let fd = handle.acquire()?;

    sys::bind(fd.raw(), SocketAddr::new(fd.family().unspecified(), port))
}

impl SocketBackend for TwoDescriptor {
    fn strategy(&self) -> Strategy {
        Strategy::TwoDescriptor
    }

    fn handles(&self) -> Vec<Arc<FdHandle>> {
        self.v4.iter().chain(self.v6.iter()).cloned().collect()
    }

    fn route(&self, addr: SocketAddr) -> Result<(Arc<FdHandle>, SocketAddr)> {
        let addr = from_mapped(addr);

        Ok((self.require(Family::of(&addr))?.clone(), addr))
    }

    fn bind(&mut self, addr: SocketAddr, options: &OptionTranslator) -> Result<()> {
        let addr = from_mapped(addr);

        if addr.ip().is_unspecified() {
            if let (Some(v4), Some(v6)) = (self.v4.clone(), self.v6.clone()) {
                return self.bind_wildcard(v4, v6, addr.port(), options);
            }
        }

        let family = Family::of(&addr);

        {
            let handle = self.require(family)?;
            let fd = handle.acquire()?;

            sys::bind(fd.raw(), addr)?;
        }

        self.drop_family(match family {
            Family::V4 => Family::V6,
            Family::V6 => Family::V4,
        });

        Ok(())
    }

    fn listen(&self, backlog: i32) -> Result<()> {
        for handle in self.handles() {
            let fd = handle.acquire()?;

            sys::listen(fd.raw(), backlog)?;

            sys::set_nonblocking(fd.raw(), true)?;
        }

        Ok(())
    }

    fn pin(&mut self, family: Family) {
        self.drop_family(match family {
            Family::V4 => Family::V6,
            Family::V6 => Family::V4,
        });
    }

    fn read_set(&self, prefer: Option<Family>) -> ReadSet {
        let mut handles = self.handles();

        match prefer {
            Some(family) => handles.sort_by_key(|handle| handle.family() != family),
            None if handles.len() > 1 => {
                // Alternate which family is served first.
                let turn = self.turn.fetch_add(1, Ordering::Relaxed);
                let len = handles.len();
                handles.rotate_left(turn % len);
            }
            None => {}
        }

        ReadSet::new(handles)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        let handle = self
            .v4
            .as_ref()
            .or(self.v6.as_ref())
            .ok_or(SocketError::Closed)?;

        let fd = handle.acquire()?;

        let addr = sys::local_addr(fd.raw())?;

        if self.v4.is_some() && self.v6.is_some() && self.prefer_ipv6 && addr.ip().is_unspecified() {
            Ok(SocketAddr::new(Family::V6.unspecified(), addr.port()))
        } else {
            Ok(addr)
        }
    }

    fn normalize(&self, addr: SocketAddr) -> SocketAddr {
        addr
    }

    fn membership(&self, group: IpAddr) -> Result<Arc<FdHandle>> {
        match Family::of_ip(&group) {
            Family::V4 => self.v4.clone().ok_or(SocketError::NotSupportedByImplementation(
                "IPv4 multicast on an IPv6-bound socket",
            )),
            Family::V6 => self.v6.clone().ok_or(SocketError::NotSupportedByImplementation(
                "IPv6 multicast on this socket",
            )),
        }
    }

    fn renew(&mut self, family: Family, options: &OptionTranslator) -> Result<Arc<FdHandle>> {
        let ticket = self
            .ticket
            .clone()
            .ok_or(SocketError::InvalidState("descriptor cannot be replaced"))?;

        let fresh = open_handle(family, self.ty, true, ticket)?;

        options.replay(&fresh)?;

        let slot = match family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        };

        if let Some(old) = slot.replace(fresh.clone()) {
            old.close();
        }

        log::debug!("{} descriptor replaced", family);

        Ok(fresh)
    }

    fn close(&mut self) {
        for handle in self.handles() {
            handle.close();
        }

        self.ticket = None;
    }
}
