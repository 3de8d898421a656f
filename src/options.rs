//! Socket option translation.
//!
//! Options form a closed set. Values are type checked and range checked
//! before any native call; a few options live only in the translator's store.

use std::{
    collections::HashMap,
    fmt::Display,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use crate::{
    addr::Family,
    context::SocketKind,
    error::{Result, SocketError},
    fd::FdHandle,
    iface::NetworkInterface,
    sys,
};

/// Upper bound the OS accepts for `SO_LINGER` seconds.
const MAX_LINGER: i32 = 65535;

/// Legal socket option identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketOption {
    SendBuffer,
    ReceiveBuffer,
    /// Seconds to linger on close; `-1` or `false` disables.
    Linger,
    KeepAlive,
    NoDelay,
    Broadcast,
    ReuseAddress,
    OobInline,
    TrafficClass,
    /// Milliseconds a blocking read/receive waits; `0` waits forever.
    Timeout,
    MulticastInterfaceAddress,
    MulticastInterface,
    MulticastTtl,
    MulticastLoop,
}

const ALL_OPTIONS: [SocketOption; 14] = [
    SocketOption::SendBuffer,
    SocketOption::ReceiveBuffer,
    SocketOption::Linger,
    SocketOption::KeepAlive,
    SocketOption::NoDelay,
    SocketOption::Broadcast,
    SocketOption::ReuseAddress,
    SocketOption::OobInline,
    SocketOption::TrafficClass,
    SocketOption::Timeout,
    SocketOption::MulticastInterfaceAddress,
    SocketOption::MulticastInterface,
    SocketOption::MulticastTtl,
    SocketOption::MulticastLoop,
];

impl SocketOption {
    /// Native option name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendBuffer => "SO_SNDBUF",
            Self::ReceiveBuffer => "SO_RCVBUF",
            Self::Linger => "SO_LINGER",
            Self::KeepAlive => "SO_KEEPALIVE",
            Self::NoDelay => "TCP_NODELAY",
            Self::Broadcast => "SO_BROADCAST",
            Self::ReuseAddress => "SO_REUSEADDR",
            Self::OobInline => "SO_OOBINLINE",
            Self::TrafficClass => "IP_TOS",
            Self::Timeout => "SO_TIMEOUT",
            Self::MulticastInterfaceAddress => "IP_MULTICAST_IF",
            Self::MulticastInterface => "IP_MULTICAST_IF2",
            Self::MulticastTtl => "IP_MULTICAST_TTL",
            Self::MulticastLoop => "IP_MULTICAST_LOOP",
        }
    }

    fn is_multicast(&self) -> bool {
        matches!(
            self,
            Self::MulticastInterfaceAddress
                | Self::MulticastInterface
                | Self::MulticastTtl
                | Self::MulticastLoop
        )
    }

    fn is_stream_only(&self) -> bool {
        matches!(
            self,
            Self::Linger | Self::KeepAlive | Self::NoDelay | Self::OobInline
        )
    }

    fn legal_for(&self, kind: SocketKind) -> bool {
        match kind {
            SocketKind::Stream => !self.is_multicast() && *self != Self::Broadcast,
            SocketKind::Datagram => !self.is_multicast() && !self.is_stream_only(),
            SocketKind::Multicast => !self.is_stream_only(),
        }
    }
}

impl Display for SocketOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SocketOption {
    type Err = SocketError;

    fn from_str(s: &str) -> Result<Self> {
        ALL_OPTIONS
            .iter()
            .find(|opt| opt.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| SocketError::UnsupportedOption(s.to_owned()))
    }
}

/// Typed option value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptionValue {
    Int(i32),
    Bool(bool),
    Addr(IpAddr),
    Interface(NetworkInterface),
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<IpAddr> for OptionValue {
    fn from(value: IpAddr) -> Self {
        Self::Addr(value)
    }
}

impl From<NetworkInterface> for OptionValue {
    fn from(value: NetworkInterface) -> Self {
        Self::Interface(value)
    }
}

impl Display for OptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Addr(v) => write!(f, "{}", v),
            Self::Interface(v) => write!(f, "{}", v.name()),
        }
    }
}

/// Validated value ready for the shim.
#[derive(Debug)]
enum Native {
    Int(i32),
    Linger(Option<u16>),
    Ttl(u8),
    Loop(bool),
    InterfaceAddr(IpAddr),
    Interface(NetworkInterface),
}

fn validate(option: SocketOption, value: &OptionValue) -> Result<Native> {
    use SocketOption::*;

    let wrong_type = |expected: &str| {
        SocketError::invalid_value(option, format!("expected {}, got {:?}", expected, value))
    };

    match option {
        SendBuffer | ReceiveBuffer => match value {
            OptionValue::Int(n) if *n > 0 => Ok(Native::Int(*n)),
            OptionValue::Int(n) => Err(SocketError::invalid_value(
                option,
                format!("buffer size must be positive, got {}", n),
            )),
            _ => Err(wrong_type("integer")),
        },
        TrafficClass => match value {
            OptionValue::Int(n) if (0..=255).contains(n) => Ok(Native::Int(*n)),
            OptionValue::Int(_) => Err(SocketError::invalid_value(option, "out of range 0..=255")),
            _ => Err(wrong_type("integer")),
        },
        MulticastTtl => match value {
            OptionValue::Int(n) if (0..=255).contains(n) => Ok(Native::Ttl(*n as u8)),
            OptionValue::Int(_) => Err(SocketError::invalid_value(option, "out of range 0..=255")),
            _ => Err(wrong_type("integer")),
        },
        KeepAlive | NoDelay | Broadcast | ReuseAddress | OobInline => match value {
            OptionValue::Bool(on) => Ok(Native::Int(*on as i32)),
            _ => Err(wrong_type("boolean")),
        },
        MulticastLoop => match value {
            OptionValue::Bool(on) => Ok(Native::Loop(*on)),
            _ => Err(wrong_type("boolean")),
        },
        Linger => match value {
            OptionValue::Bool(false) => Ok(Native::Linger(None)),
            OptionValue::Int(n) if *n < 0 => Ok(Native::Linger(None)),
            OptionValue::Int(n) => Ok(Native::Linger(Some((*n).min(MAX_LINGER) as u16))),
            _ => Err(wrong_type("linger seconds or false")),
        },
        Timeout => match value {
            OptionValue::Int(n) if *n >= 0 => Ok(Native::Int(*n)),
            OptionValue::Int(_) => Err(SocketError::invalid_value(option, "negative timeout")),
            _ => Err(wrong_type("integer milliseconds")),
        },
        MulticastInterfaceAddress => match value {
            OptionValue::Addr(ip) => Ok(Native::InterfaceAddr(*ip)),
            _ => Err(wrong_type("address")),
        },
        MulticastInterface => match value {
            OptionValue::Interface(iface) => Ok(Native::Interface(iface.clone())),
            _ => Err(wrong_type("network interface")),
        },
    }
}

/// Per-socket option state plus translation onto native calls.
#[derive(Debug)]
pub(crate) struct OptionTranslator {
    kind: SocketKind,
    exclusive_bind: bool,
    bound: bool,
    stored: HashMap<SocketOption, OptionValue>,
}

impl OptionTranslator {
    pub(crate) fn new(kind: SocketKind, exclusive_bind: bool) -> Self {
        Self {
            kind,
            exclusive_bind,
            bound: false,
            stored: HashMap::new(),
        }
    }

    pub(crate) fn mark_bound(&mut self) {
        self.bound = true;
    }

    fn check_legal(&self, option: SocketOption) -> Result<()> {
        if option.legal_for(self.kind) {
            Ok(())
        } else {
            Err(SocketError::UnsupportedOption(format!(
                "{} on {} socket",
                option, self.kind
            )))
        }
    }

    /// `SO_REUSEADDR` under exclusive bind stops reaching the OS once bound.
    fn emulated(&self, option: SocketOption) -> bool {
        match option {
            SocketOption::Timeout => true,
            SocketOption::ReuseAddress => self.exclusive_bind && self.bound,
            _ => false,
        }
    }

    /// Read timeout configured through `SO_TIMEOUT`, `None` for infinite.
    pub(crate) fn timeout(&self) -> Option<Duration> {
        match self.stored.get(&SocketOption::Timeout) {
            Some(OptionValue::Int(ms)) if *ms > 0 => Some(Duration::from_millis(*ms as u64)),
            _ => None,
        }
    }

    /// Outbound multicast interface configured on this socket.
    pub(crate) fn multicast_interface(&self) -> Result<Option<NetworkInterface>> {
        match self.stored.get(&SocketOption::MulticastInterface) {
            Some(OptionValue::Interface(iface)) => Ok(Some(iface.clone())),
            _ => match self.stored.get(&SocketOption::MulticastInterfaceAddress) {
                Some(OptionValue::Addr(ip)) => NetworkInterface::by_address(ip)?
                    .map(Some)
                    .ok_or_else(|| SocketError::UnknownInterface(ip.to_string())),
                _ => Ok(None),
            },
        }
    }

    pub(crate) fn set(
        &mut self,
        handles: &[Arc<FdHandle>],
        option: SocketOption,
        value: OptionValue,
    ) -> Result<()> {
        self.check_legal(option)?;

        let native = validate(option, &value)?;

        if self.emulated(option) {
            log::debug!("{} = {} stored, not forwarded", option, value);
        } else {
            for handle in handles {
                apply(handle, option, &native)?;
            }
        }

        // The two interface forms replace each other.
        match option {
            SocketOption::MulticastInterface => {
                self.stored.remove(&SocketOption::MulticastInterfaceAddress);
            }
            SocketOption::MulticastInterfaceAddress => {
                self.stored.remove(&SocketOption::MulticastInterface);
            }
            _ => {}
        }

        self.stored.insert(option, value);

        Ok(())
    }

    pub(crate) fn get(&self, handles: &[Arc<FdHandle>], option: SocketOption) -> Result<OptionValue> {
        self.check_legal(option)?;

        if self.emulated(option) {
            return Ok(match self.stored.get(&option) {
                Some(value) => value.clone(),
                None if option == SocketOption::Timeout => OptionValue::Int(0),
                None => OptionValue::Bool(false),
            });
        }

        if let SocketOption::MulticastInterface | SocketOption::MulticastInterfaceAddress = option {
            if let Some(value) = self.stored.get(&option) {
                return Ok(value.clone());
            }
        }

        let handle = handles.first().ok_or(SocketError::Closed)?;

        query(handle, option)
    }

    /// Re-apply every forwarded option to a freshly created descriptor.
    pub(crate) fn replay(&self, handle: &Arc<FdHandle>) -> Result<()> {
        for (option, value) in &self.stored {
            if self.emulated(*option) {
                continue;
            }

            apply(handle, *option, &validate(*option, value)?)?;
        }

        Ok(())
    }
}

fn apply(handle: &FdHandle, option: SocketOption, native: &Native) -> Result<()> {
    let fd = handle.acquire()?;

    let family = fd.family();

    match native {
        Native::Int(value) => {
            sys::set_int_option(fd.raw(), family, option, *value)?;

            if option == SocketOption::TrafficClass && family == Family::V6 {
                if let Err(err) = sys::set_tos_mapped(fd.raw(), *value) {
                    log::warn!("socket({}) IP_TOS on IPv6 descriptor: {}", fd.raw(), err);
                }
            }
        }
        Native::Linger(seconds) => sys::set_linger(fd.raw(), *seconds)?,
        Native::Ttl(ttl) => sys::set_multicast_ttl(fd.raw(), family, *ttl)?,
        Native::Loop(on) => sys::set_multicast_loop(fd.raw(), family, *on)?,
        Native::InterfaceAddr(ip) => match family {
            Family::V4 => match v4_of(ip)? {
                Some(v4) => sys::set_multicast_if_v4(fd.raw(), v4)?,
                None => log::debug!("{} has no IPv4 address, IPv4 side unchanged", ip),
            },
            Family::V6 => {
                let iface = NetworkInterface::by_address(ip)?
                    .ok_or_else(|| SocketError::UnknownInterface(ip.to_string()))?;

                sys::set_multicast_if_v6(fd.raw(), iface.index())?;
            }
        },
        Native::Interface(iface) => match family {
            Family::V4 => match iface.first_v4() {
                Some(v4) => sys::set_multicast_if_v4(fd.raw(), v4)?,
                None => log::debug!("{} has no IPv4 address, IPv4 side unchanged", iface.name()),
            },
            Family::V6 => sys::set_multicast_if_v6(fd.raw(), iface.index())?,
        },
    }

    log::trace!("socket({}) {} applied", fd.raw(), option);

    Ok(())
}

/// IPv4 address usable as `IP_MULTICAST_IF` for `ip`.
fn v4_of(ip: &IpAddr) -> Result<Option<Ipv4Addr>> {
    match ip {
        IpAddr::V4(v4) => Ok(Some(*v4)),
        IpAddr::V6(_) => Ok(NetworkInterface::by_address(ip)?.and_then(|i| i.first_v4())),
    }
}

fn query(handle: &FdHandle, option: SocketOption) -> Result<OptionValue> {
    let fd = handle.acquire()?;

    let family = fd.family();

    let value = match option {
        SocketOption::SendBuffer | SocketOption::ReceiveBuffer | SocketOption::TrafficClass => {
            OptionValue::Int(sys::get_int_option(fd.raw(), family, option)?)
        }
        SocketOption::KeepAlive
        | SocketOption::NoDelay
        | SocketOption::Broadcast
        | SocketOption::ReuseAddress
        | SocketOption::OobInline => {
            OptionValue::Bool(sys::get_int_option(fd.raw(), family, option)? != 0)
        }
        SocketOption::Linger => match sys::get_linger(fd.raw())? {
            Some(seconds) => OptionValue::Int(seconds as i32),
            None => OptionValue::Int(-1),
        },
        SocketOption::MulticastTtl => {
            OptionValue::Int(sys::get_multicast_ttl(fd.raw(), family)? as i32)
        }
        SocketOption::MulticastLoop => OptionValue::Bool(sys::get_multicast_loop(fd.raw(), family)?),
        SocketOption::MulticastInterfaceAddress => match family {
            Family::V4 => OptionValue::Addr(sys::get_multicast_if_v4(fd.raw())?.into()),
            Family::V6 => {
                let index = sys::get_multicast_if_v6(fd.raw())?;

                let ip = NetworkInterface::by_index(index)?
                    .and_then(|iface| iface.addrs().first().copied())
                    .unwrap_or_else(|| family.unspecified());

                OptionValue::Addr(ip)
            }
        },
        SocketOption::MulticastInterface => {
            let iface = match family {
                Family::V4 => NetworkInterface::by_address(&sys::get_multicast_if_v4(fd.raw())?.into())?,
                Family::V6 => NetworkInterface::by_index(sys::get_multicast_if_v6(fd.raw())?)?,
            };

            OptionValue::Interface(
                iface.ok_or(SocketError::InvalidState("no outbound multicast interface set"))?,
            )
        }
        SocketOption::Timeout => unreachable!("SO_TIMEOUT is never queried natively"),
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use crate::sys::SockType;

    use super::*;

    fn handle(ty: SockType) -> Arc<FdHandle> {
        let raw = sys::socket(Family::V4, ty).unwrap();

        Arc::new(FdHandle::new(raw, Family::V4, None))
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("SO_SNDBUF".parse::<SocketOption>().unwrap(), SocketOption::SendBuffer);
        assert_eq!("tcp_nodelay".parse::<SocketOption>().unwrap(), SocketOption::NoDelay);
        assert_eq!(
            "IP_MULTICAST_IF2".parse::<SocketOption>().unwrap(),
            SocketOption::MulticastInterface
        );

        assert!(matches!(
            "SO_BINDTODEVICE".parse::<SocketOption>(),
            Err(SocketError::UnsupportedOption(name)) if name == "SO_BINDTODEVICE"
        ));

        for opt in ALL_OPTIONS {
            assert_eq!(opt.name().parse::<SocketOption>().unwrap(), opt);
        }
    }

    #[test]
    fn test_multicast_options_rejected_on_plain_sockets() {
        let handles = vec![handle(SockType::Datagram)];

        let mut options = OptionTranslator::new(SocketKind::Datagram, false);

        assert!(matches!(
            options.set(&handles, SocketOption::MulticastTtl, 4.into()),
            Err(SocketError::UnsupportedOption(_))
        ));

        assert!(matches!(
            options.get(&handles, SocketOption::MulticastLoop),
            Err(SocketError::UnsupportedOption(_))
        ));

        assert!(matches!(
            options.set(&handles, SocketOption::NoDelay, true.into()),
            Err(SocketError::UnsupportedOption(_))
        ));
    }

    #[test]
    fn test_value_types_checked() {
        let handles = vec![handle(SockType::Stream)];

        let mut options = OptionTranslator::new(SocketKind::Stream, false);

        assert!(matches!(
            options.set(&handles, SocketOption::SendBuffer, true.into()),
            Err(SocketError::InvalidOptionValue {
                option: SocketOption::SendBuffer,
                ..
            })
        ));

        assert!(matches!(
            options.set(&handles, SocketOption::KeepAlive, 1.into()),
            Err(SocketError::InvalidOptionValue { .. })
        ));

        assert!(matches!(
            options.set(&handles, SocketOption::TrafficClass, 256.into()),
            Err(SocketError::InvalidOptionValue { .. })
        ));

        assert!(matches!(
            options.set(&handles, SocketOption::Linger, true.into()),
            Err(SocketError::InvalidOptionValue { .. })
        ));
    }

    #[test]
    fn test_native_round_trip() {
        _ = pretty_env_logger::try_init();

        let handles = vec![handle(SockType::Stream)];

        let mut options = OptionTranslator::new(SocketKind::Stream, false);

        options.set(&handles, SocketOption::NoDelay, true.into()).unwrap();
        assert_eq!(
            options.get(&handles, SocketOption::NoDelay).unwrap(),
            OptionValue::Bool(true)
        );

        options.set(&handles, SocketOption::Linger, 5.into()).unwrap();
        assert_eq!(
            options.get(&handles, SocketOption::Linger).unwrap(),
            OptionValue::Int(5)
        );

        options.set(&handles, SocketOption::Linger, false.into()).unwrap();
        assert_eq!(
            options.get(&handles, SocketOption::Linger).unwrap(),
            OptionValue::Int(-1)
        );

        options.set(&handles, SocketOption::Timeout, 250.into()).unwrap();
        assert_eq!(options.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(
            options.get(&handles, SocketOption::Timeout).unwrap(),
            OptionValue::Int(250)
        );
    }

    #[test]
    fn test_reuse_address_emulated_after_exclusive_bind() {
        let handles = vec![handle(SockType::Datagram)];

        let mut options = OptionTranslator::new(SocketKind::Datagram, true);

        // Before bind the OS sees the value.
        options.set(&handles, SocketOption::ReuseAddress, false.into()).unwrap();

        options.mark_bound();

        options.set(&handles, SocketOption::ReuseAddress, true.into()).unwrap();

        assert_eq!(
            options.get(&handles, SocketOption::ReuseAddress).unwrap(),
            OptionValue::Bool(true)
        );

        let fd = handles[0].acquire().unwrap();

        assert_eq!(
            sys::get_int_option(fd.raw(), Family::V4, SocketOption::ReuseAddress).unwrap(),
            0
        );
    }

    #[test]
    fn test_multicast_ttl_range() {
        let handles = vec![handle(SockType::Datagram)];

        let mut options = OptionTranslator::new(SocketKind::Multicast, false);

        for ttl in [-1, 256] {
            assert!(matches!(
                options.set(&handles, SocketOption::MulticastTtl, ttl.into()),
                Err(SocketError::InvalidOptionValue {
                    option: SocketOption::MulticastTtl,
                    ..
                })
            ));
        }

        options.set(&handles, SocketOption::MulticastTtl, 7.into()).unwrap();

        assert_eq!(
            options.get(&handles, SocketOption::MulticastTtl).unwrap(),
            OptionValue::Int(7)
        );
    }
}
