//! Address helpers: families, v4-mapped translation and IPv6 scope ids.

use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6},
};

use crate::{
    error::{Result, SocketError},
    iface::NetworkInterface,
};

/// IP version tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        Self::of_ip(&addr.ip())
    }

    pub fn of_ip(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// Wildcard address of this family.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            Self::V4 => Ipv4Addr::UNSPECIFIED.into(),
            Self::V6 => Ipv6Addr::UNSPECIFIED.into(),
        }
    }
}

impl Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// Rewrite an IPv4 address as `::ffff:a.b.c.d` for a dual-stack descriptor.
pub(crate) fn to_mapped(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) => {
            let ip = if v4.ip().is_unspecified() {
                Ipv6Addr::UNSPECIFIED
            } else {
                v4.ip().to_ipv6_mapped()
            };

            SocketAddrV6::new(ip, v4.port(), 0, 0).into()
        }
        v6 => v6,
    }
}

/// Undo [`to_mapped`] for addresses reported by a dual-stack descriptor.
pub(crate) fn from_mapped(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(v4.into(), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}

/// `fe80::/10`
pub fn is_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

/// `fec0::/10`, deprecated but still seen in the wild.
pub fn is_site_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfec0
}

/// Build a scoped IPv6 socket address, resolving the scope id from the named
/// interface.
///
/// The interface must carry an address of the same locality (link-local or
/// site-local) as `ip`; its index becomes the scope id. Addresses that are
/// neither link-local nor site-local take the interface index directly.
pub fn scoped_v6(ip: Ipv6Addr, port: u16, interface: &str) -> Result<SocketAddrV6> {
    let iface = NetworkInterface::by_name(interface)?
        .ok_or_else(|| SocketError::UnknownInterface(interface.to_owned()))?;

    let scope_id = scope_on(&ip, &iface).ok_or_else(|| {
        SocketError::UnknownInterface(format!("{} has no scope for {}", interface, ip))
    })?;

    log::trace!("resolved scope id({}) for {}%{}", scope_id, ip, interface);

    Ok(SocketAddrV6::new(ip, port, 0, scope_id))
}

fn scope_on(ip: &Ipv6Addr, iface: &NetworkInterface) -> Option<u32> {
    let matches: fn(&Ipv6Addr) -> bool = if is_link_local(ip) {
        is_link_local
    } else if is_site_local(ip) {
        is_site_local
    } else {
        return Some(iface.index());
    };

    iface
        .addrs()
        .iter()
        .filter_map(|addr| match addr {
            IpAddr::V6(v6) => Some(v6),
            IpAddr::V4(_) => None,
        })
        .find(|v6| matches(v6))
        .map(|_| iface.index())
}
