use std::{
    io,
    net::{Shutdown, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    backend::{Backend, ReadSet, SocketBackend},
    context::{SocketContext, SocketKind, Strategy},
    error::{Result, SocketError},
    fd::FdHandle,
    ledger::LedgerKind,
    options::{OptionTranslator, OptionValue, SocketOption},
    sys::{self, Connect, Interest},
};

use super::{lock, non_zero, Deadline, SocketState};

const DEFAULT_BACKLOG: i32 = 50;

/// Outcome of a successful [`StreamSocket::read`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadResult {
    Data(usize),
    /// The peer finished sending; every later read reports this again.
    Eof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reset {
    None,
    /// The OS reported a reset; buffered bytes may still be readable.
    Pending,
    Reported,
}

#[derive(Debug)]
struct StreamState {
    state: SocketState,
    peer: Option<SocketAddr>,
    eof: bool,
    reset: Reset,
    input_shutdown: bool,
    output_shutdown: bool,
}

#[derive(Debug)]
struct StreamInner {
    ctx: SocketContext,
    backend: Mutex<Backend>,
    options: Mutex<OptionTranslator>,
    state: Mutex<StreamState>,
}

/// A TCP socket, client or server side.
///
/// Clones share the same native socket, so one thread may read while another
/// writes or closes.
#[derive(Clone, Debug)]
pub struct StreamSocket {
    inner: Arc<StreamInner>,
}

impl StreamSocket {
    pub(crate) fn new(ctx: SocketContext) -> Result<Self> {
        let backend = Backend::open(&ctx, SocketKind::Stream)?;

        Ok(Self::from_parts(ctx, backend, SocketState::Unbound, None))
    }

    fn from_parts(
        ctx: SocketContext,
        backend: Backend,
        state: SocketState,
        peer: Option<SocketAddr>,
    ) -> Self {
        let mut options = OptionTranslator::new(SocketKind::Stream, ctx.config().exclusive_bind);

        if state != SocketState::Unbound {
            options.mark_bound();
        }

        Self {
            inner: Arc::new(StreamInner {
                ctx,
                backend: Mutex::new(backend),
                options: Mutex::new(options),
                state: Mutex::new(StreamState {
                    state,
                    peer,
                    eof: false,
                    reset: Reset::None,
                    input_shutdown: false,
                    output_shutdown: false,
                }),
            }),
        }
    }

    pub fn state(&self) -> SocketState {
        lock(&self.inner.state).state
    }

    pub fn strategy(&self) -> Strategy {
        lock(&self.inner.backend).strategy()
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let mut state = lock(&self.inner.state);

        match state.state {
            SocketState::Unbound => {}
            SocketState::Closed => return Err(SocketError::Closed),
            _ => return Err(SocketError::InvalidState("already bound")),
        }

        let mut backend = lock(&self.inner.backend);
        let mut options = lock(&self.inner.options);

        backend.bind(addr, &options)?;

        options.mark_bound();

        state.state = SocketState::Bound;

        log::debug!("stream socket bound {}", addr);

        Ok(())
    }

    /// Start accepting connections; a `backlog` below 1 uses the default.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        if self.state() == SocketState::Unbound {
            self.bind(SocketAddr::new(self.inner.ctx.any_local_address(), 0))?;
        }

        let mut state = lock(&self.inner.state);

        match state.state {
            SocketState::Bound => {}
            SocketState::Closed => return Err(SocketError::Closed),
            _ => return Err(SocketError::InvalidState("listen requires a bound socket")),
        }

        let backlog = if backlog < 1 { DEFAULT_BACKLOG } else { backlog };

        lock(&self.inner.backend).listen(backlog)?;

        state.state = SocketState::Listening;

        log::debug!("stream socket listening, backlog({})", backlog);

        Ok(())
    }

    /// Wait for an incoming connection. `Duration::ZERO` waits forever.
    ///
    /// A timeout leaves the listener untouched.
    pub fn accept(&self, timeout: Duration) -> Result<StreamSocket> {
        self.expect_state(SocketState::Listening, "accept requires a listening socket")?;

        let ticket = Arc::new(self.inner.ctx.ledger().before_create(LedgerKind::Stream)?);

        let read_set = lock(&self.inner.backend).read_set(None);

        let deadline = Deadline::after(non_zero(timeout));

        loop {
            for handle in read_set.wait(deadline.remaining(), "accept")? {
                let accepted = {
                    let fd = handle.acquire()?;
                    sys::accept(fd.raw())
                };

                match accepted {
                    Ok((raw, remote)) => {
                        let backend = lock(&self.inner.backend).accepted(
                            raw,
                            handle.family(),
                            ticket,
                            self.inner.ctx.config().prefer_ipv6_addresses,
                        );

                        let remote = backend.normalize(remote);

                        log::debug!("stream socket accepted {}", remote);

                        return Ok(Self::from_parts(
                            self.inner.ctx.clone(),
                            backend,
                            SocketState::Connected,
                            Some(remote),
                        ));
                    }
                    // Another thread took it, or the client gave up.
                    Err(SocketError::WouldBlock) | Err(SocketError::ConnectionReset) => continue,
                    Err(err) => return Err(err),
                }
            }
        }
    }

    /// Connect to `addr`, binding implicitly when unbound.
    ///
    /// `Duration::ZERO` blocks until the OS gives up. On timeout the socket
    /// stays unconnected and usable: the half-open descriptor is replaced by a
    /// fresh one, rebound to the same local address when it was bound.
    pub fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<()> {
        let before = match self.state() {
            state @ (SocketState::Unbound | SocketState::Bound) => state,
            SocketState::Closed => return Err(SocketError::Closed),
            SocketState::Connected => return Err(SocketError::InvalidState("already connected")),
            SocketState::Listening => {
                return Err(SocketError::InvalidState("cannot connect a listening socket"))
            }
        };

        let (handle, native) = lock(&self.inner.backend).route(addr)?;

        match non_zero(timeout) {
            None => connect_blocking(&handle, native)?,
            Some(timeout) => {
                let bound_to = match before {
                    SocketState::Bound => {
                        let fd = handle.acquire()?;
                        Some(sys::local_addr(fd.raw())?)
                    }
                    _ => None,
                };

                if let Err(err) = connect_timed(&handle, native, timeout) {
                    if err.is_timeout() {
                        self.abandon_connect(&handle, bound_to);
                    }

                    return Err(err);
                }
            }
        }

        let mut state = lock(&self.inner.state);

        if state.state == SocketState::Closed || handle.is_closed() {
            return Err(SocketError::Closed);
        }

        lock(&self.inner.backend).pin(handle.family());

        lock(&self.inner.options).mark_bound();

        state.state = SocketState::Connected;
        state.peer = Some(addr);

        log::debug!("stream socket connected {}", addr);

        Ok(())
    }

    /// Swap the descriptor a timed-out connect left mid-handshake for a fresh
    /// one, bound to `bound_to` when given.
    fn abandon_connect(&self, handle: &FdHandle, bound_to: Option<SocketAddr>) {
        let mut state = lock(&self.inner.state);

        if state.state == SocketState::Closed {
            return;
        }

        let mut backend = lock(&self.inner.backend);
        let options = lock(&self.inner.options);

        let fresh = match backend.renew(handle.family(), &options) {
            Ok(fresh) => fresh,
            Err(err) => {
                log::warn!("replace descriptor after connect timeout: {}", err);
                return;
            }
        };

        if let Some(addr) = bound_to {
            let rebound = fresh.acquire().and_then(|fd| sys::bind(fd.raw(), addr));

            if let Err(err) = rebound {
                log::warn!("rebind {} after connect timeout: {}", addr, err);

                state.state = SocketState::Unbound;
            }
        }
    }

    /// Read into `buf`. Honours [`SocketOption::Timeout`].
    pub fn read(&self, buf: &mut [u8]) -> Result<ReadResult> {
        let reset = {
            let state = lock(&self.inner.state);

            match state.state {
                SocketState::Connected => {}
                SocketState::Closed => return Err(SocketError::Closed),
                _ => return Err(SocketError::InvalidState("not connected")),
            }

            if state.eof || state.input_shutdown {
                return Ok(ReadResult::Eof);
            }

            if state.reset == Reset::Reported {
                return Err(SocketError::ConnectionReset);
            }

            state.reset
        };

        if buf.is_empty() {
            return Ok(ReadResult::Data(0));
        }

        let handle = self.connected_handle()?;

        if reset == Reset::Pending {
            return self.drain_after_reset(&handle, buf);
        }

        let timeout = lock(&self.inner.options).timeout();

        let result = read_timed(&handle, buf, timeout);

        match result {
            Ok(0) if handle.is_closed() => Err(SocketError::Closed),
            Ok(0) => {
                lock(&self.inner.state).eof = true;

                log::debug!("stream socket end of stream");

                Ok(ReadResult::Eof)
            }
            Ok(n) => Ok(ReadResult::Data(n)),
            Err(SocketError::ConnectionReset) => {
                lock(&self.inner.state).reset = Reset::Pending;

                log::debug!("stream socket reset pending, draining");

                self.drain_after_reset(&handle, buf)
            }
            Err(err) => Err(err),
        }
    }

    /// One non-blocking read of bytes buffered before a reset.
    fn drain_after_reset(&self, handle: &FdHandle, buf: &mut [u8]) -> Result<ReadResult> {
        let drained = {
            let fd = handle.acquire()?;
            sys::recv_nowait(fd.raw(), buf)
        };

        match drained {
            Ok(n) if n > 0 => Ok(ReadResult::Data(n)),
            _ => {
                lock(&self.inner.state).reset = Reset::Reported;

                Err(SocketError::ConnectionReset)
            }
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        {
            let state = lock(&self.inner.state);

            match state.state {
                SocketState::Connected => {}
                SocketState::Closed => return Err(SocketError::Closed),
                _ => return Err(SocketError::InvalidState("not connected")),
            }

            if state.output_shutdown {
                return Err(SocketError::InvalidState("output shut down"));
            }
        }

        let handle = self.connected_handle()?;

        let fd = handle.acquire()?;

        sys::send(fd.raw(), buf)
    }

    /// Write all of `buf`.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }

        Ok(())
    }

    /// Close one direction of the connection.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.expect_state(SocketState::Connected, "not connected")?;

        let handle = self.connected_handle()?;

        {
            let fd = handle.acquire()?;
            sys::shutdown(fd.raw(), how)?;
        }

        let mut state = lock(&self.inner.state);

        if matches!(how, Shutdown::Read | Shutdown::Both) {
            state.input_shutdown = true;
        }

        if matches!(how, Shutdown::Write | Shutdown::Both) {
            state.output_shutdown = true;
        }

        log::debug!("stream socket shutdown {:?}", how);

        Ok(())
    }

    /// Close the socket. Safe to call repeatedly and from any thread.
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);

        if state.state == SocketState::Closed {
            return;
        }

        state.state = SocketState::Closed;

        lock(&self.inner.backend).close();

        log::debug!("stream socket closed");
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

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let state = lock(&self.inner.state);

        match state.state {
            SocketState::Closed => Err(SocketError::Closed),
            _ => state.peer.ok_or(SocketError::InvalidState("not connected")),
        }
    }

    /// Bytes readable without blocking.
    pub fn available(&self) -> Result<usize> {
        self.expect_state(SocketState::Connected, "not connected")?;

        if lock(&self.inner.state).input_shutdown {
            return Ok(0);
        }

        let handle = self.connected_handle()?;

        let fd = handle.acquire()?;

        sys::available(fd.raw())
    }

    /// Send one byte of urgent (out-of-band) data.
    pub fn send_urgent_data(&self, byte: u8) -> Result<()> {
        self.expect_state(SocketState::Connected, "not connected")?;

        let handle = self.connected_handle()?;

        let fd = handle.acquire()?;

        sys::send_oob(fd.raw(), byte)
    }

    pub fn input_stream(&self) -> SocketInputStream {
        SocketInputStream {
            socket: self.clone(),
        }
    }

    pub fn output_stream(&self) -> SocketOutputStream {
        SocketOutputStream {
            socket: self.clone(),
        }
    }

    fn expect_state(&self, expected: SocketState, what: &'static str) -> Result<()> {
        match self.state() {
            state if state == expected => Ok(()),
            SocketState::Closed => Err(SocketError::Closed),
            _ => Err(SocketError::InvalidState(what)),
        }
    }

    fn open_handles(&self) -> Result<Vec<Arc<FdHandle>>> {
        if self.state() == SocketState::Closed {
            return Err(SocketError::Closed);
        }

        Ok(lock(&self.inner.backend).handles())
    }

    fn connected_handle(&self) -> Result<Arc<FdHandle>> {
        lock(&self.inner.backend)
            .handles()
            .into_iter()
            .next()
            .ok_or(SocketError::Closed)
    }
}

fn connect_blocking(handle: &FdHandle, addr: SocketAddr) -> Result<()> {
    let fd = handle.acquire()?;

    match sys::connect(fd.raw(), addr)? {
        Connect::Done => Ok(()),
        // Interrupted; the handshake continues in the background.
        Connect::InProgress => {
            sys::poll(&[(fd.raw(), Interest::Write)], None)?;

            match sys::take_error(fd.raw())? {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }
}

fn connect_timed(handle: &FdHandle, addr: SocketAddr, timeout: Duration) -> Result<()> {
    let fd = handle.acquire()?;

    sys::set_nonblocking(fd.raw(), true)?;

    let result = match sys::connect(fd.raw(), addr) {
        Ok(Connect::Done) => Ok(()),
        Ok(Connect::InProgress) => {
            let ready = sys::poll(&[(fd.raw(), Interest::Write)], Some(timeout));

            match ready {
                Ok(ready) if ready.iter().any(|r| *r) => match sys::take_error(fd.raw()) {
                    Ok(Some(err)) => Err(err),
                    Ok(None) => Ok(()),
                    Err(err) => Err(err),
                },
                Ok(_) => {
                    log::debug!("connect {} timed out after {:?}", addr, timeout);
                    Err(SocketError::Timeout("connect"))
                }
                Err(err) => Err(err),
            }
        }
        Err(err) => Err(err),
    };

    let restored = sys::set_nonblocking(fd.raw(), false);

    result.and(restored)
}

/// Blocking read, or a readiness wait bounded by `timeout` followed by a
/// non-blocking read.
fn read_timed(handle: &Arc<FdHandle>, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
    let Some(timeout) = timeout else {
        let fd = handle.acquire()?;
        return sys::recv(fd.raw(), buf);
    };

    let read_set = ReadSet::new(vec![handle.clone()]);

    let deadline = Deadline::after(Some(timeout));

    loop {
        read_set.wait(deadline.remaining(), "read")?;

        let fd = handle.acquire()?;

        match sys::recv_nowait(fd.raw(), buf) {
            Err(SocketError::WouldBlock) => continue,
            result => return result,
        }
    }
}

/// [`io::Read`] view of a [`StreamSocket`].
#[derive(Debug)]
pub struct SocketInputStream {
    socket: StreamSocket,
}

impl io::Read for SocketInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket.read(buf)? {
            ReadResult::Data(n) => Ok(n),
            ReadResult::Eof => Ok(0),
        }
    }
}

/// [`io::Write`] view of a [`StreamSocket`].
#[derive(Debug)]
pub struct SocketOutputStream {
    socket: StreamSocket,
}

impl io::Write for SocketOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.socket.write(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, net::TcpListener};

    use crate::{addr::Family, config::SocketConfig};

    use super::*;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(Family::V4.unspecified(), port)
    }

    #[test]
    fn test_state_machine() {
        _ = pretty_env_logger::try_init();

        let ctx = SocketContext::new(SocketConfig::default());

        let socket = ctx.stream().unwrap();

        assert_eq!(socket.state(), SocketState::Unbound);

        assert!(matches!(
            socket.read(&mut [0; 4]),
            Err(SocketError::InvalidState(_))
        ));

        socket.bind(loopback(0)).unwrap();

        assert!(matches!(
            socket.bind(loopback(0)),
            Err(SocketError::InvalidState(_))
        ));

        socket.listen(0).unwrap();

        assert_eq!(socket.state(), SocketState::Listening);

        assert!(matches!(
            socket.connect("127.0.0.1:1".parse().unwrap(), Duration::ZERO),
            Err(SocketError::InvalidState(_))
        ));

        socket.close();
        socket.close();

        assert_eq!(socket.state(), SocketState::Closed);
        assert!(matches!(socket.local_addr(), Err(SocketError::Closed)));
        assert!(matches!(
            socket.accept(Duration::from_millis(10)),
            Err(SocketError::Closed)
        ));
    }

    #[test]
    fn test_connect_to_std_listener() {
        _ = pretty_env_logger::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let addr = listener.local_addr().unwrap();

        let socket = SocketContext::default().stream().unwrap();

        socket.connect(addr, Duration::from_secs(5)).unwrap();

        assert_eq!(socket.peer_addr().unwrap(), addr);
        assert_eq!(socket.local_addr().unwrap().ip(), addr.ip());

        let (mut conn, _) = listener.accept().unwrap();

        conn.write_all(b"hello").unwrap();

        drop(conn);

        let mut input = socket.input_stream();

        let mut received = String::new();

        io::Read::read_to_string(&mut input, &mut received).unwrap();

        assert_eq!(received, "hello");

        assert_eq!(socket.read(&mut [0; 8]).unwrap(), ReadResult::Eof);
    }

    #[test]
    fn test_reset_drains_buffered_bytes_once() {
        _ = pretty_env_logger::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let socket = SocketContext::default().stream().unwrap();

        socket
            .connect(listener.local_addr().unwrap(), Duration::ZERO)
            .unwrap();

        let (mut conn, _) = listener.accept().unwrap();

        conn.write_all(b"tail").unwrap();

        for _ in 0..500 {
            if socket.available().unwrap() >= 4 {
                break;
            }

            std::thread::sleep(Duration::from_millis(10));
        }

        // As if the previous read had seen ECONNRESET.
        lock(&socket.inner.state).reset = Reset::Pending;

        let mut buf = [0u8; 16];

        assert_eq!(socket.read(&mut buf).unwrap(), ReadResult::Data(4));
        assert_eq!(&buf[..4], b"tail");

        assert!(matches!(
            socket.read(&mut buf),
            Err(SocketError::ConnectionReset)
        ));

        assert_eq!(lock(&socket.inner.state).reset, Reset::Reported);

        assert!(matches!(
            socket.read(&mut buf),
            Err(SocketError::ConnectionReset)
        ));
    }

    #[test]
    fn test_read_timeout_keeps_socket_usable() {
        _ = pretty_env_logger::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let socket = SocketContext::default().stream().unwrap();

        socket
            .connect(listener.local_addr().unwrap(), Duration::ZERO)
            .unwrap();

        let (mut conn, _) = listener.accept().unwrap();

        socket
            .set_option(SocketOption::Timeout, OptionValue::Int(50))
            .unwrap();

        let err = socket.read(&mut [0; 8]).unwrap_err();

        assert!(err.is_timeout());

        conn.write_all(b"x").unwrap();

        assert_eq!(socket.read(&mut [0; 8]).unwrap(), ReadResult::Data(1));
        assert_eq!(socket.available().unwrap(), 0);
    }
}
