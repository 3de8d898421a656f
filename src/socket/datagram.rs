use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
};

use crate::{
    addr::Family,
    backend::{Backend, SocketBackend},
    context::{SocketContext, SocketKind, Strategy},
    error::{Result, SocketError},
    fd::FdHandle,
    iface::NetworkInterface,
    options::{OptionTranslator, OptionValue, SocketOption},
    sys::{self, Connect},
};

use super::{lock, Deadline, SocketState};

/// A datagram payload plus its remote address.
///
/// For sends `addr` is the destination; after a receive it holds the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatagramPacket {
    buf: Vec<u8>,
    len: usize,
    addr: Option<SocketAddr>,
}

impl DatagramPacket {
    /// Outgoing packet addressed to `addr`.
    pub fn new<D: Into<Vec<u8>>>(data: D, addr: SocketAddr) -> Self {
        let buf = data.into();

        Self {
            len: buf.len(),
            buf,
            addr: Some(addr),
        }
    }

    /// Outgoing packet for a connected socket.
    pub fn unaddressed<D: Into<Vec<u8>>>(data: D) -> Self {
        let buf = data.into();

        Self {
            len: buf.len(),
            buf,
            addr: None,
        }
    }

    /// Empty receive buffer; longer datagrams are truncated to `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            len: 0,
            addr: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn set_addr(&mut self, addr: SocketAddr) {
        self.addr = Some(addr);
    }
}

#[derive(Debug)]
struct DatagramState {
    state: SocketState,
    peer: Option<SocketAddr>,
    /// Family of the last peeked datagram, served first by the next receive.
    peeked: Option<Family>,
    /// Joined groups keyed by group and interface index (0 = OS choice).
    groups: HashMap<(IpAddr, u32), Membership>,
}

#[derive(Debug)]
struct Membership {
    iface: Option<NetworkInterface>,
    /// Joined without an explicit interface.
    implicit: bool,
}

#[derive(Debug)]
struct DatagramInner {
    ctx: SocketContext,
    kind: SocketKind,
    backend: Mutex<Backend>,
    options: Mutex<OptionTranslator>,
    state: Mutex<DatagramState>,
}

/// A UDP socket, optionally multicast capable.
#[derive(Clone, Debug)]
pub struct DatagramSocket {
    inner: Arc<DatagramInner>,
}

impl DatagramSocket {
    pub(crate) fn new(ctx: SocketContext, kind: SocketKind) -> Result<Self> {
        let backend = Backend::open(&ctx, kind)?;

        let options = OptionTranslator::new(kind, ctx.config().exclusive_bind);

        Ok(Self {
            inner: Arc::new(DatagramInner {
                ctx,
                kind,
                backend: Mutex::new(backend),
                options: Mutex::new(options),
                state: Mutex::new(DatagramState {
                    state: SocketState::Unbound,
                    peer: None,
                    peeked: None,
                    groups: HashMap::new(),
                }),
            }),
        })
    }

    pub fn state(&self) -> SocketState {
        lock(&self.inner.state).state
    }

    pub fn strategy(&self) -> Strategy {
        lock(&self.inner.backend).strategy()
    }

    pub fn is_multicast(&self) -> bool {
        self.inner.kind == SocketKind::Multicast
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let mut state = lock(&self.inner.state);

        match state.state {
            SocketState::Unbound => {}
            SocketState::Closed => return Err(SocketError::Closed),
            _ => return Err(SocketError::InvalidState("already bound")),
        }

        self.bind_locked(&mut state, addr)
    }

    fn bind_locked(&self, state: &mut DatagramState, addr: SocketAddr) -> Result<()> {
        let mut backend = lock(&self.inner.backend);
        let mut options = lock(&self.inner.options);

        backend.bind(addr, &options)?;

        options.mark_bound();

        state.state = SocketState::Bound;

        log::debug!("{} socket bound {}", self.inner.kind, addr);

        Ok(())
    }

    /// Bind to the wildcard address on an ephemeral port if still unbound.
    fn ensure_bound(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);

        match state.state {
            SocketState::Unbound => {
                self.bind_locked(&mut state, SocketAddr::new(Family::V4.unspecified(), 0))
            }
            SocketState::Closed => Err(SocketError::Closed),
            _ => Ok(()),
        }
    }

    /// Send one datagram.
    ///
    /// An associated socket sends to its peer; an explicit destination must
    /// then match it.
    pub fn send(&self, packet: &DatagramPacket) -> Result<usize> {
        self.ensure_bound()?;

        let peer = lock(&self.inner.state).peer;

        let dest = match (packet.addr, peer) {
            (Some(dest), Some(peer)) if dest != peer => {
                return Err(SocketError::InvalidState(
                    "destination differs from the associated peer",
                ))
            }
            (_, Some(peer)) => peer,
            (Some(dest), None) => dest,
            (None, None) => return Err(SocketError::InvalidState("no destination address")),
        };

        let (handle, native) = lock(&self.inner.backend).route(dest)?;

        let fd = handle.acquire()?;

        let sent = if peer.is_some() {
            sys::send(fd.raw(), packet.data())
        } else {
            sys::send_to(fd.raw(), packet.data(), native)
        };

        sent.map_err(unreachable_on_refused)
    }

    /// Receive one datagram into `packet`. Honours [`SocketOption::Timeout`].
    pub fn receive(&self, packet: &mut DatagramPacket) -> Result<()> {
        self.receive_inner(packet, false).map(|_| ())
    }

    /// Copy the next datagram into `packet` without consuming it; returns the
    /// sender's port.
    pub fn peek(&self, packet: &mut DatagramPacket) -> Result<u16> {
        self.receive_inner(packet, true).map(|addr| addr.port())
    }

    fn receive_inner(&self, packet: &mut DatagramPacket, peek: bool) -> Result<SocketAddr> {
        self.ensure_bound()?;

        let (peer, prefer) = {
            let mut state = lock(&self.inner.state);
            (state.peer, state.peeked.take())
        };

        let read_set = lock(&self.inner.backend).read_set(prefer);

        let deadline = Deadline::after(lock(&self.inner.options).timeout());

        loop {
            for handle in read_set.wait(deadline.remaining(), "receive")? {
                if handle.is_closed() {
                    return Err(SocketError::Closed);
                }

                let received = {
                    let fd = handle.acquire()?;
                    sys::recv_from(fd.raw(), &mut packet.buf, peek)
                };

                let (len, from) = match received {
                    Ok(received) => received,
                    Err(SocketError::WouldBlock) => continue,
                    Err(err) => return Err(unreachable_on_refused(err)),
                };

                let from = lock(&self.inner.backend).normalize(from);

                if let Some(peer) = peer {
                    if from != peer {
                        log::trace!("drop datagram from {}, associated with {}", from, peer);

                        if peek {
                            discard(&handle)?;
                        }

                        continue;
                    }
                }

                packet.len = len.min(packet.buf.len());
                packet.addr = Some(from);

                if peek {
                    lock(&self.inner.state).peeked = Some(handle.family());
                }

                return Ok(from);
            }
        }
    }

    /// Associate with `addr`: later sends default to it and receives from
    /// other peers are dropped.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.ensure_bound()?;

        let (handle, native) = lock(&self.inner.backend).route(addr)?;

        {
            let fd = handle.acquire()?;

            // UDP connect never blocks.
            if let Connect::InProgress = sys::connect(fd.raw(), native)? {
                log::warn!("datagram connect {} reported in progress", addr);
            }
        }

        let mut state = lock(&self.inner.state);

        if state.state == SocketState::Closed {
            return Err(SocketError::Closed);
        }

        lock(&self.inner.backend).pin(handle.family());

        state.state = SocketState::Connected;
        state.peer = Some(lock(&self.inner.backend).normalize(native));
        state.peeked = None;

        log::debug!("{} socket associated with {}", self.inner.kind, addr);

        Ok(())
    }

    /// Drop the association. A no-op when not associated.
    ///
    /// The local port survives. On the two-descriptor strategy the family
    /// closed by [`connect`](Self::connect) stays closed.
    pub fn disconnect(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);

        match state.state {
            SocketState::Connected => {}
            SocketState::Closed => return Err(SocketError::Closed),
            _ => return Ok(()),
        }

        for handle in lock(&self.inner.backend).handles() {
            let fd = handle.acquire()?;

            let port = sys::local_addr(fd.raw())?.port();

            sys::disconnect(fd.raw())?;

            // Linux unbinds a kernel-chosen port on disconnect.
            let mut local = sys::local_addr(fd.raw())?;

            if local.port() != port {
                log::debug!("socket({}) lost port {} on disconnect, rebind", fd.raw(), port);

                local.set_port(port);

                sys::bind(fd.raw(), local)?;
            }
        }

        state.state = SocketState::Bound;
        state.peer = None;

        log::debug!("{} socket disassociated", self.inner.kind);

        Ok(())
    }

    pub fn join_group(&self, group: IpAddr, iface: Option<&NetworkInterface>) -> Result<()> {
        self.membership(group, iface, true)
    }

    pub fn leave_group(&self, group: IpAddr, iface: Option<&NetworkInterface>) -> Result<()> {
        self.membership(group, iface, false)
    }

    fn membership(&self, group: IpAddr, iface: Option<&NetworkInterface>, join: bool) -> Result<()> {
        // Dual-stack descriptors refuse memberships whatever the socket kind.
        lock(&self.inner.backend).membership(group)?;

        self.require_multicast("multicast group membership")?;

        if !group.is_multicast() {
            return Err(SocketError::NotMulticast(group));
        }

        self.ensure_bound()?;

        let implicit = iface.is_none();

        let resolved = match iface {
            Some(iface) => Some(iface.clone()),
            None => match lock(&self.inner.options).multicast_interface()? {
                Some(iface) => Some(iface),
                None => self.inner.ctx.default_multicast_interface().cloned(),
            },
        };

        let mut state = lock(&self.inner.state);

        if state.state == SocketState::Closed {
            return Err(SocketError::Closed);
        }

        // Leaving without an interface undoes the join made without one,
        // whatever the outbound interface has become since.
        let iface = match (join, implicit) {
            (false, true) => state
                .groups
                .iter()
                .find(|((joined, _), membership)| *joined == group && membership.implicit)
                .map(|(_, membership)| membership.iface.clone())
                .unwrap_or(resolved),
            _ => resolved,
        };

        let key = (group, iface.as_ref().map(|i| i.index()).unwrap_or(0));

        if !join && !state.groups.contains_key(&key) {
            return Err(SocketError::InvalidState("group not joined"));
        }

        let handle = lock(&self.inner.backend).membership(group)?;

        apply_membership(&handle, group, iface.as_ref(), join)?;

        if join {
            state.groups.insert(key, Membership { iface, implicit });
        } else {
            state.groups.remove(&key);
        }

        Ok(())
    }

    /// Multicast time-to-live, validated to `0..=255` before anything else.
    pub fn set_ttl(&self, ttl: i32) -> Result<()> {
        if !(0..=255).contains(&ttl) {
            return Err(SocketError::invalid_value(
                SocketOption::MulticastTtl,
                "out of range 0..=255",
            ));
        }

        self.require_multicast("multicast TTL")?;

        self.set_option(SocketOption::MulticastTtl, OptionValue::Int(ttl))
    }

    pub fn ttl(&self) -> Result<u8> {
        self.require_multicast("multicast TTL")?;

        match self.get_option(SocketOption::MulticastTtl)? {
            OptionValue::Int(ttl) => Ok(ttl.clamp(0, 255) as u8),
            _ => Err(SocketError::InvalidState("multicast TTL is not an integer")),
        }
    }

    pub fn set_option(&self, option: SocketOption, value: OptionValue) -> Result<()> {
        let handles = self.open_handles()?;

        lock(&self.inner.options).set(&handles, option, value)
    }

    pub fn get_option(&self, option: SocketOption) -> Result<OptionValue> {
        let handles = self.open_handles()?;

        lock(&self.inner.options).get(&handles, option)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        if self.state() == SocketState::Closed {
            return Err(SocketError::Closed);
        }

        lock(&self.inner.backend).local_addr()
    }

    /// Associated peer, if any.
    pub fn peer_addr(&self) -> Result<Option<SocketAddr>> {
        let state = lock(&self.inner.state);

        match state.state {
            SocketState::Closed => Err(SocketError::Closed),
            _ => Ok(state.peer),
        }
    }

    /// Close the socket, dropping any multicast memberships with it.
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);

        if state.state == SocketState::Closed {
            return;
        }

        state.state = SocketState::Closed;
        state.groups.clear();

        lock(&self.inner.backend).close();

        log::debug!("{} socket closed", self.inner.kind);
    }

    fn require_multicast(&self, op: &'static str) -> Result<()> {
        if self.is_multicast() {
            Ok(())
        } else {
            Err(SocketError::NotSupportedByImplementation(op))
        }
    }

    fn open_handles(&self) -> Result<Vec<Arc<FdHandle>>> {
        if self.state() == SocketState::Closed {
            return Err(SocketError::Closed);
        }

        Ok(lock(&self.inner.backend).handles())
    }
}

/// Consume a peeked datagram that the association filter rejected.
fn discard(handle: &FdHandle) -> Result<()> {
    let fd = handle.acquire()?;

    match sys::recv_from(fd.raw(), &mut [0; 1], false) {
        Ok(_) | Err(SocketError::WouldBlock) => Ok(()),
        Err(err) => Err(unreachable_on_refused(err)),
    }
}

fn apply_membership(
    handle: &FdHandle,
    group: IpAddr,
    iface: Option<&NetworkInterface>,
    join: bool,
) -> Result<()> {
    let fd = handle.acquire()?;

    match group {
        IpAddr::V4(group) => {
            let local = match iface {
                Some(iface) => iface.first_v4().ok_or_else(|| {
                    SocketError::UnknownInterface(format!("{} has no IPv4 address", iface.name()))
                })?,
                None => Ipv4Addr::UNSPECIFIED,
            };

            sys::membership_v4(fd.raw(), group, local, join)
        }
        IpAddr::V6(group) => {
            sys::membership_v6(fd.raw(), group, iface.map(|i| i.index()).unwrap_or(0), join)
        }
    }
}

/// ICMP port unreachable surfaces as `ECONNREFUSED` on associated sockets.
fn unreachable_on_refused(err: SocketError) -> SocketError {
    match err {
        SocketError::ConnectionRefused => SocketError::Unreachable,
        err => err,
    }
}
