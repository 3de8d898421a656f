use std::{
    ffi::CStr,
    io,
    mem::{size_of, zeroed},
    net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr},
    ptr::null_mut,
    time::{Duration, Instant},
};

use errno::errno;
use libc::{c_int, c_void, socklen_t};
use os_socketaddr::OsSocketAddr;

use crate::{
    addr::Family,
    error::{Result, SocketError},
    iface::{NetworkInterface, FLAG_LOOPBACK, FLAG_MULTICAST, FLAG_UP},
    options::SocketOption,
};

use super::{Connect, Interest, SockType};

pub(crate) type RawFd = c_int;

pub(crate) const INVALID_FD: RawFd = -1;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
use libc::{IPV6_ADD_MEMBERSHIP as IPV6_JOIN, IPV6_DROP_MEMBERSHIP as IPV6_LEAVE};
#[cfg(not(any(target_os = "linux", target_os = "android")))]
use libc::{IPV6_JOIN_GROUP as IPV6_JOIN, IPV6_LEAVE_GROUP as IPV6_LEAVE};

/// Map an errno value onto the error taxonomy.
pub(crate) fn classify(op: &'static str, code: i32) -> SocketError {
    use libc::*;

    match code {
        EBADF => SocketError::Closed,
        ECONNRESET | EPIPE => SocketError::ConnectionReset,
        ECONNREFUSED => SocketError::ConnectionRefused,
        EHOSTUNREACH | ENETUNREACH => SocketError::NoRouteToHost,
        ETIMEDOUT => SocketError::Timeout(op),
        EADDRINUSE => SocketError::AddressInUse,
        EADDRNOTAVAIL => SocketError::AddressNotAvailable,
        EINTR => SocketError::Interrupted,
        ENOPROTOOPT | EOPNOTSUPP | EAFNOSUPPORT | EPROTONOSUPPORT => {
            SocketError::NotSupportedByImplementation(op)
        }
        _ if code == EAGAIN || code == EWOULDBLOCK => SocketError::WouldBlock,
        _ => SocketError::Os {
            op,
            source: io::Error::from_raw_os_error(code),
        },
    }
}

fn last_error(op: &'static str) -> SocketError {
    classify(op, errno().0)
}

fn cvt(op: &'static str, ret: c_int) -> Result<c_int> {
    if ret < 0 {
        Err(last_error(op))
    } else {
        Ok(ret)
    }
}

fn cvt_len(op: &'static str, ret: libc::ssize_t) -> Result<usize> {
    if ret < 0 {
        Err(last_error(op))
    } else {
        Ok(ret as usize)
    }
}

/// Retry `f` while it fails with EINTR.
fn restart<T, F: FnMut() -> Result<T>>(mut f: F) -> Result<T> {
    loop {
        match f() {
            Err(SocketError::Interrupted) => continue,
            result => return result,
        }
    }
}

fn sockaddr_of(storage: &libc::sockaddr_storage, len: socklen_t) -> Result<SocketAddr> {
    let addr = unsafe {
        OsSocketAddr::copy_from_raw(storage as *const _ as *const libc::sockaddr, len)
    };

    addr.into_addr().ok_or_else(|| SocketError::Os {
        op: "sockaddr",
        source: io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"),
    })
}

/// Create a descriptor of `family`/`ty` in blocking mode with close-on-exec set.
pub(crate) fn socket(family: Family, ty: SockType) -> Result<RawFd> {
    let domain = match family {
        Family::V4 => libc::AF_INET,
        Family::V6 => libc::AF_INET6,
    };

    let ty = match ty {
        SockType::Stream => libc::SOCK_STREAM,
        SockType::Datagram => libc::SOCK_DGRAM,
    };

    let fd = cvt("socket", unsafe { libc::socket(domain, ty, 0) })?;

    if let Err(err) = init_descriptor(fd) {
        unsafe { libc::close(fd) };
        return Err(err);
    }

    log::trace!("socket({}) created, family {}", fd, family);

    Ok(fd)
}

fn init_descriptor(fd: RawFd) -> Result<()> {
    cvt("fcntl", unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1 as c_int, "setsockopt")?;

    Ok(())
}

pub(crate) fn close(fd: RawFd) -> Result<()> {
    log::trace!("close socket({})", fd);

    cvt("close", unsafe { libc::close(fd) }).map(|_| ())
}

pub(crate) fn set_nonblocking(fd: RawFd, on: bool) -> Result<()> {
    unsafe {
        let flags = cvt("fcntl", libc::fcntl(fd, libc::F_GETFL))?;

        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };

        cvt("fcntl", libc::fcntl(fd, libc::F_SETFL, flags)).map(|_| ())
    }
}

pub(crate) fn set_v6only(fd: RawFd, on: bool) -> Result<()> {
    setsockopt(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_V6ONLY,
        on as c_int,
        "setsockopt(IPV6_V6ONLY)",
    )
}

pub(crate) fn bind(fd: RawFd, addr: SocketAddr) -> Result<()> {
    let os_addr: OsSocketAddr = addr.into();

    cvt("bind", unsafe { libc::bind(fd, os_addr.as_ptr(), os_addr.len()) })?;

    log::trace!("socket({}) bind {}", fd, addr);

    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> Result<()> {
    cvt("listen", unsafe { libc::listen(fd, backlog) }).map(|_| ())
}

pub(crate) fn connect(fd: RawFd, addr: SocketAddr) -> Result<Connect> {
    let os_addr: OsSocketAddr = addr.into();

    if unsafe { libc::connect(fd, os_addr.as_ptr(), os_addr.len()) } == 0 {
        log::trace!("socket({}) connected {}", fd, addr);
        return Ok(Connect::Done);
    }

    let e = errno().0;

    // An interrupted connect keeps establishing in the background.
    if e == libc::EINPROGRESS || e == libc::EALREADY || e == libc::EINTR {
        log::trace!("socket({}) connect {} in progress", fd, addr);
        Ok(Connect::InProgress)
    } else if e == libc::EISCONN {
        Ok(Connect::Done)
    } else {
        Err(classify("connect", e))
    }
}

/// Dissolve a datagram association.
pub(crate) fn disconnect(fd: RawFd) -> Result<()> {
    let mut addr: libc::sockaddr = unsafe { zeroed() };

    addr.sa_family = libc::AF_UNSPEC as libc::sa_family_t;

    let ret = unsafe { libc::connect(fd, &addr, size_of::<libc::sockaddr>() as socklen_t) };

    // BSDs report EAFNOSUPPORT after dissolving the association anyway.
    if ret < 0 && errno().0 != libc::EAFNOSUPPORT {
        return Err(last_error("disconnect"));
    }

    Ok(())
}

/// Pending error of an asynchronous connect (`SO_ERROR`).
pub(crate) fn take_error(fd: RawFd) -> Result<Option<SocketError>> {
    let code: c_int = getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, "getsockopt(SO_ERROR)")?;

    if code == 0 {
        Ok(None)
    } else {
        Ok(Some(classify("connect", code)))
    }
}

pub(crate) fn accept(fd: RawFd) -> Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };

    let mut len = size_of::<libc::sockaddr_storage>() as socklen_t;

    let conn = restart(|| {
        cvt("accept", unsafe {
            libc::accept(
                fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len as *mut socklen_t,
            )
        })
    })?;

    let remote = init_descriptor(conn)
        .and_then(|_| set_nonblocking(conn, false))
        .and_then(|_| sockaddr_of(&storage, len));

    match remote {
        Ok(remote) => {
            log::trace!("socket({}) accept connection({}) from {}", fd, conn, remote);
            Ok((conn, remote))
        }
        Err(err) => {
            unsafe { libc::close(conn) };
            Err(err)
        }
    }
}

fn recv_flags(fd: RawFd, buf: &mut [u8], flags: c_int) -> Result<usize> {
    let len = restart(|| {
        cvt_len("recv", unsafe {
            libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
        })
    })?;

    log::trace!("socket({}) recv {}", fd, len);

    Ok(len)
}

/// Blocking read honouring the descriptor's blocking mode.
pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    recv_flags(fd, buf, 0)
}

/// Read that fails with [`SocketError::WouldBlock`] instead of blocking.
pub(crate) fn recv_nowait(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    recv_flags(fd, buf, libc::MSG_DONTWAIT)
}

/// Non-blocking `recvfrom`, optionally leaving the datagram queued.
pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8], peek: bool) -> Result<(usize, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };

    let mut addr_len = size_of::<libc::sockaddr_storage>() as socklen_t;

    let flags = if peek {
        libc::MSG_DONTWAIT | libc::MSG_PEEK
    } else {
        libc::MSG_DONTWAIT
    };

    let len = restart(|| {
        cvt_len("recvfrom", unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                flags,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len as *mut socklen_t,
            )
        })
    })?;

    let from = sockaddr_of(&storage, addr_len)?;

    log::trace!("socket({}) recvfrom({}) {} peek({})", fd, from, len, peek);

    Ok((len, from))
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let len = restart(|| {
        cvt_len("send", unsafe {
            libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), SEND_FLAGS)
        })
    })?;

    log::trace!("socket({}) send {}", fd, len);

    Ok(len)
}

/// Send one byte of TCP urgent data.
pub(crate) fn send_oob(fd: RawFd, byte: u8) -> Result<()> {
    restart(|| {
        cvt_len("send(MSG_OOB)", unsafe {
            libc::send(
                fd,
                &byte as *const u8 as *const c_void,
                1,
                SEND_FLAGS | libc::MSG_OOB,
            )
        })
    })
    .map(|_| ())
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], to: SocketAddr) -> Result<usize> {
    let addr: OsSocketAddr = to.into();

    let len = restart(|| {
        cvt_len("sendto", unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                SEND_FLAGS,
                addr.as_ptr(),
                addr.len(),
            )
        })
    })?;

    log::trace!("socket({}) sendto({}) {}", fd, to, len);

    Ok(len)
}

pub(crate) fn shutdown(fd: RawFd, how: Shutdown) -> Result<()> {
    let how = match how {
        Shutdown::Read => libc::SHUT_RD,
        Shutdown::Write => libc::SHUT_WR,
        Shutdown::Both => libc::SHUT_RDWR,
    };

    cvt("shutdown", unsafe { libc::shutdown(fd, how) }).map(|_| ())
}

pub(crate) fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };

    let mut len = size_of::<libc::sockaddr_storage>() as socklen_t;

    cvt("getsockname", unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len as *mut socklen_t,
        )
    })?;

    sockaddr_of(&storage, len)
}

/// Bytes readable without blocking.
pub(crate) fn available(fd: RawFd) -> Result<usize> {
    let mut n: c_int = 0;

    cvt("ioctl(FIONREAD)", unsafe {
        libc::ioctl(fd, libc::FIONREAD, &mut n as *mut c_int)
    })?;

    Ok(n.max(0) as usize)
}

fn setsockopt<T: Copy>(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: T,
    op: &'static str,
) -> Result<()> {
    cvt(op, unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const T as *const c_void,
            size_of::<T>() as socklen_t,
        )
    })
    .map(|_| ())
}

fn getsockopt<T: Copy>(fd: RawFd, level: c_int, name: c_int, op: &'static str) -> Result<T> {
    unsafe {
        let mut value: T = zeroed();

        let mut len = size_of::<T>() as socklen_t;

        cvt(
            op,
            libc::getsockopt(
                fd,
                level,
                name,
                &mut value as *mut T as *mut c_void,
                &mut len as *mut socklen_t,
            ),
        )?;

        Ok(value)
    }
}

/// Native `(level, name)` of integer-valued options.
fn int_option(option: SocketOption, family: Family) -> Option<(c_int, c_int)> {
    use libc::*;

    match option {
        SocketOption::SendBuffer => Some((SOL_SOCKET, SO_SNDBUF)),
        SocketOption::ReceiveBuffer => Some((SOL_SOCKET, SO_RCVBUF)),
        SocketOption::KeepAlive => Some((SOL_SOCKET, SO_KEEPALIVE)),
        SocketOption::NoDelay => Some((IPPROTO_TCP, TCP_NODELAY)),
        SocketOption::Broadcast => Some((SOL_SOCKET, SO_BROADCAST)),
        SocketOption::ReuseAddress => Some((SOL_SOCKET, SO_REUSEADDR)),
        SocketOption::OobInline => Some((SOL_SOCKET, SO_OOBINLINE)),
        SocketOption::TrafficClass => match family {
            Family::V4 => Some((IPPROTO_IP, IP_TOS)),
            Family::V6 => Some((IPPROTO_IPV6, IPV6_TCLASS)),
        },
        _ => None,
    }
}

pub(crate) fn set_int_option(
    fd: RawFd,
    family: Family,
    option: SocketOption,
    value: i32,
) -> Result<()> {
    let (level, name) =
        int_option(option, family).ok_or(SocketError::NotSupportedByImplementation("setsockopt"))?;

    setsockopt(fd, level, name, value as c_int, "setsockopt")?;

    log::trace!("socket({}) setsockopt {}={}", fd, option, value);

    Ok(())
}

pub(crate) fn get_int_option(fd: RawFd, family: Family, option: SocketOption) -> Result<i32> {
    let (level, name) =
        int_option(option, family).ok_or(SocketError::NotSupportedByImplementation("getsockopt"))?;

    getsockopt::<c_int>(fd, level, name, "getsockopt")
}

/// `IP_TOS` on an IPv6 descriptor, covering v4-mapped traffic on dual-stack sockets.
pub(crate) fn set_tos_mapped(fd: RawFd, value: i32) -> Result<()> {
    setsockopt(fd, libc::IPPROTO_IP, libc::IP_TOS, value as c_int, "setsockopt(IP_TOS)")
}

/// `None` disables linger.
pub(crate) fn set_linger(fd: RawFd, seconds: Option<u16>) -> Result<()> {
    let linger = libc::linger {
        l_onoff: seconds.is_some() as c_int,
        l_linger: seconds.unwrap_or(0) as c_int,
    };

    setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, linger, "setsockopt(SO_LINGER)")
}

pub(crate) fn get_linger(fd: RawFd) -> Result<Option<u16>> {
    let linger: libc::linger =
        getsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, "getsockopt(SO_LINGER)")?;

    if linger.l_onoff == 0 {
        Ok(None)
    } else {
        Ok(Some(linger.l_linger.clamp(0, u16::MAX as c_int) as u16))
    }
}

fn in_addr(ip: Ipv4Addr) -> libc::in_addr {
    libc::in_addr {
        s_addr: u32::from_ne_bytes(ip.octets()),
    }
}

pub(crate) fn set_multicast_if_v4(fd: RawFd, ip: Ipv4Addr) -> Result<()> {
    setsockopt(
        fd,
        libc::IPPROTO_IP,
        libc::IP_MULTICAST_IF,
        in_addr(ip),
        "setsockopt(IP_MULTICAST_IF)",
    )
}

pub(crate) fn get_multicast_if_v4(fd: RawFd) -> Result<Ipv4Addr> {
    let addr: libc::in_addr = getsockopt(
        fd,
        libc::IPPROTO_IP,
        libc::IP_MULTICAST_IF,
        "getsockopt(IP_MULTICAST_IF)",
    )?;

    Ok(Ipv4Addr::from(addr.s_addr.to_ne_bytes()))
}

pub(crate) fn set_multicast_if_v6(fd: RawFd, index: u32) -> Result<()> {
    setsockopt(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_MULTICAST_IF,
        index as libc::c_uint,
        "setsockopt(IPV6_MULTICAST_IF)",
    )
}

pub(crate) fn get_multicast_if_v6(fd: RawFd) -> Result<u32> {
    getsockopt::<libc::c_uint>(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_MULTICAST_IF,
        "getsockopt(IPV6_MULTICAST_IF)",
    )
}

pub(crate) fn set_multicast_ttl(fd: RawFd, family: Family, ttl: u8) -> Result<()> {
    match family {
        Family::V4 => setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_TTL,
            ttl,
            "setsockopt(IP_MULTICAST_TTL)",
        ),
        Family::V6 => setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_HOPS,
            ttl as c_int,
            "setsockopt(IPV6_MULTICAST_HOPS)",
        ),
    }
}

pub(crate) fn get_multicast_ttl(fd: RawFd, family: Family) -> Result<u8> {
    match family {
        Family::V4 => getsockopt::<u8>(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_TTL,
            "getsockopt(IP_MULTICAST_TTL)",
        ),
        Family::V6 => getsockopt::<c_int>(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_HOPS,
            "getsockopt(IPV6_MULTICAST_HOPS)",
        )
        .map(|hops| hops.clamp(0, 255) as u8),
    }
}

pub(crate) fn set_multicast_loop(fd: RawFd, family: Family, on: bool) -> Result<()> {
    match family {
        Family::V4 => setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_LOOP,
            on as u8,
            "setsockopt(IP_MULTICAST_LOOP)",
        ),
        Family::V6 => setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_LOOP,
            on as libc::c_uint,
            "setsockopt(IPV6_MULTICAST_LOOP)",
        ),
    }
}

pub(crate) fn get_multicast_loop(fd: RawFd, family: Family) -> Result<bool> {
    match family {
        Family::V4 => getsockopt::<u8>(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_LOOP,
            "getsockopt(IP_MULTICAST_LOOP)",
        )
        .map(|on| on != 0),
        Family::V6 => getsockopt::<libc::c_uint>(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_LOOP,
            "getsockopt(IPV6_MULTICAST_LOOP)",
        )
        .map(|on| on != 0),
    }
}

/// Join (`join == true`) or leave an IPv4 group on the interface owning `iface`.
pub(crate) fn membership_v4(fd: RawFd, group: Ipv4Addr, iface: Ipv4Addr, join: bool) -> Result<()> {
    let mreq = libc::ip_mreq {
        imr_multiaddr: in_addr(group),
        imr_interface: in_addr(iface),
    };

    let (name, op) = if join {
        (libc::IP_ADD_MEMBERSHIP, "setsockopt(IP_ADD_MEMBERSHIP)")
    } else {
        (libc::IP_DROP_MEMBERSHIP, "setsockopt(IP_DROP_MEMBERSHIP)")
    };

    setsockopt(fd, libc::IPPROTO_IP, name, mreq, op)?;

    log::debug!("socket({}) {} group {} via {}", fd, if join { "join" } else { "leave" }, group, iface);

    Ok(())
}

/// Join or leave an IPv6 group on interface `index` (0 lets the OS choose).
pub(crate) fn membership_v6(
    fd: RawFd,
    group: std::net::Ipv6Addr,
    index: u32,
    join: bool,
) -> Result<()> {
    let mreq = libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr {
            s6_addr: group.octets(),
        },
        ipv6mr_interface: index as _,
    };

    let (name, op) = if join {
        (IPV6_JOIN, "setsockopt(IPV6_JOIN_GROUP)")
    } else {
        (IPV6_LEAVE, "setsockopt(IPV6_LEAVE_GROUP)")
    };

    setsockopt(fd, libc::IPPROTO_IPV6, name, mreq, op)?;

    log::debug!("socket({}) {} group {} via if({})", fd, if join { "join" } else { "leave" }, group, index);

    Ok(())
}

/// Wait until one of `fds` is ready or `timeout` expires (`None` waits forever).
///
/// Returns one flag per descriptor; all `false` means the wait timed out.
/// Error and hang-up conditions count as ready so the following call
/// reports them.
pub(crate) fn poll(fds: &[(RawFd, Interest)], timeout: Option<Duration>) -> Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|(fd, interest)| libc::pollfd {
            fd: *fd,
            events: match interest {
                Interest::Read => libc::POLLIN,
                Interest::Write => libc::POLLOUT,
            },
            revents: 0,
        })
        .collect();

    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let millis = match deadline {
            None => -1,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());

                let millis = (remaining.as_nanos() + 999_999) / 1_000_000;

                millis.min(c_int::MAX as u128) as c_int
            }
        };

        let fired = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                millis,
            )
        };

        if fired < 0 {
            let e = errno().0;

            if e == libc::EINTR {
                continue;
            }

            return Err(classify("poll", e));
        }

        log::trace!("poll {:?} fired({})", fds, fired);

        return Ok(pollfds.iter().map(|p| p.revents != 0).collect());
    }
}

fn probe(v6only: bool) -> bool {
    let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_STREAM, 0) };

    if fd < 0 {
        return false;
    }

    let ok = setsockopt(
        fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_V6ONLY,
        v6only as c_int,
        "setsockopt(IPV6_V6ONLY)",
    )
    .is_ok();

    unsafe { libc::close(fd) };

    ok
}

/// IPv6 sockets can be created.
pub(crate) fn probe_ipv6() -> bool {
    probe(true)
}

/// A single IPv6 descriptor can also carry IPv4 traffic.
pub(crate) fn probe_dual_stack() -> bool {
    probe(false)
}

pub(crate) fn interfaces() -> Result<Vec<NetworkInterface>> {
    let mut ifap: *mut libc::ifaddrs = null_mut();

    cvt("getifaddrs", unsafe { libc::getifaddrs(&mut ifap) })?;

    let mut found: Vec<(String, u32, Vec<IpAddr>, u32)> = vec![];

    let mut cursor = ifap;

    while !cursor.is_null() {
        let ifa = unsafe { &*cursor };

        cursor = ifa.ifa_next;

        if ifa.ifa_name.is_null() {
            continue;
        }

        let name = unsafe { CStr::from_ptr(ifa.ifa_name) };

        let ip = if ifa.ifa_addr.is_null() {
            None
        } else {
            let len = match unsafe { (*ifa.ifa_addr).sa_family } as c_int {
                libc::AF_INET => Some(size_of::<libc::sockaddr_in>()),
                libc::AF_INET6 => Some(size_of::<libc::sockaddr_in6>()),
                _ => None,
            };

            len.and_then(|len| {
                unsafe { OsSocketAddr::copy_from_raw(ifa.ifa_addr, len as socklen_t) }
                    .into_addr()
                    .map(|addr| addr.ip())
            })
        };

        let mut flags = 0;

        if ifa.ifa_flags & libc::IFF_UP as libc::c_uint != 0 {
            flags |= FLAG_UP;
        }

        if ifa.ifa_flags & libc::IFF_LOOPBACK as libc::c_uint != 0 {
            flags |= FLAG_LOOPBACK;
        }

        if ifa.ifa_flags & libc::IFF_MULTICAST as libc::c_uint != 0 {
            flags |= FLAG_MULTICAST;
        }

        let name = name.to_string_lossy().into_owned();

        let entry = match found.iter_mut().position(|(n, ..)| *n == name) {
            Some(pos) => &mut found[pos],
            None => {
                let index = unsafe { libc::if_nametoindex(ifa.ifa_name) };

                found.push((name, index, vec![], 0));

                let last = found.len() - 1;

                &mut found[last]
            }
        };

        entry.3 |= flags;

        if let Some(ip) = ip {
            entry.2.push(ip);
        }
    }

    unsafe { libc::freeifaddrs(ifap) };

    Ok(found
        .into_iter()
        .map(|(name, index, addrs, flags)| NetworkInterface::new(name, index, addrs, flags))
        .collect())
}
