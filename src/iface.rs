//! Network interface enumeration.

use std::net::{IpAddr, Ipv4Addr};

use crate::{error::Result, sys};

pub(crate) const FLAG_UP: u32 = 0x1;
pub(crate) const FLAG_LOOPBACK: u32 = 0x2;
pub(crate) const FLAG_MULTICAST: u32 = 0x4;

/// A local network interface with its addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInterface {
    name: String,
    index: u32,
    addrs: Vec<IpAddr>,
    flags: u32,
}

impl NetworkInterface {
    pub(crate) fn new(name: String, index: u32, addrs: Vec<IpAddr>, flags: u32) -> Self {
        Self {
            name,
            index,
            addrs,
            flags,
        }
    }

    /// All interfaces known to the OS, in enumeration order.
    pub fn all() -> Result<Vec<Self>> {
        sys::interfaces()
    }

    pub fn by_name(name: &str) -> Result<Option<Self>> {
        Ok(Self::all()?.into_iter().find(|iface| iface.name == name))
    }

    pub fn by_index(index: u32) -> Result<Option<Self>> {
        Ok(Self::all()?.into_iter().find(|iface| iface.index == index))
    }

    /// Interface carrying `ip`.
    pub fn by_address(ip: &IpAddr) -> Result<Option<Self>> {
        Ok(Self::all()?
            .into_iter()
            .find(|iface| iface.addrs.contains(ip)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn addrs(&self) -> &[IpAddr] {
        &self.addrs
    }

    /// First IPv4 address, used for IPv4 multicast interface selection.
    pub fn first_v4(&self) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    pub fn is_up(&self) -> bool {
        self.flags & FLAG_UP != 0
    }

    pub fn is_loopback(&self) -> bool {
        self.flags & FLAG_LOOPBACK != 0
    }

    pub fn supports_multicast(&self) -> bool {
        self.flags & FLAG_MULTICAST != 0
    }
}
