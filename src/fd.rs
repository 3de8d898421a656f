//! Descriptor handle with deferred close.
//!
//! Every native call runs under an [`FdGuard`]. Closing a handle while guards
//! are outstanding only marks it closed; the last guard to drop performs the
//! native close.

use std::{
    net::Shutdown,
    sync::{
        atomic::{AtomicI32, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use crate::{
    addr::Family,
    error::{Result, SocketError},
    ledger::LedgerTicket,
    sys::{self, RawFd, INVALID_FD},
};

const CLOSED: usize = 0x1;
const ONE_USE: usize = 0x2;

/// Native close hooks.
pub(crate) trait Closer: Send + Sync + 'static {
    /// Called while other threads may still be blocked on `fd`.
    fn preclose(&self, _fd: RawFd) {}

    /// Release `fd`. Called exactly once per handle.
    fn close(&self, fd: RawFd);
}

#[derive(Debug, Default)]
pub(crate) struct NativeCloser;

impl Closer for NativeCloser {
    fn preclose(&self, fd: RawFd) {
        // Wakes threads parked in recv/accept/poll on this descriptor.
        if let Err(err) = sys::shutdown(fd, Shutdown::Both) {
            log::trace!("socket({}) preclose shutdown: {}", fd, err);
        }
    }

    fn close(&self, fd: RawFd) {
        if let Err(err) = sys::close(fd) {
            log::warn!("socket({}) close failed: {}", fd, err);
        }
    }
}

/// One native descriptor shared by a socket for its whole life.
pub(crate) struct FdHandle<C: Closer = NativeCloser> {
    raw: AtomicI32,
    family: Family,
    /// bit 0: closed; remaining bits: in-flight uses, counted in `ONE_USE` steps.
    state: AtomicUsize,
    closer: C,
    ticket: Mutex<Option<Arc<LedgerTicket>>>,
}

impl FdHandle<NativeCloser> {
    pub(crate) fn new(raw: RawFd, family: Family, ticket: Option<Arc<LedgerTicket>>) -> Self {
        Self::with_closer(raw, family, ticket, NativeCloser)
    }
}

impl<C: Closer> FdHandle<C> {
    pub(crate) fn with_closer(
        raw: RawFd,
        family: Family,
        ticket: Option<Arc<LedgerTicket>>,
        closer: C,
    ) -> Self {
        Self {
            raw: AtomicI32::new(raw),
            family,
            state: AtomicUsize::new(0),
            closer,
            ticket: Mutex::new(ticket),
        }
    }

    pub(crate) fn family(&self) -> Family {
        self.family
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSED != 0
    }

    /// Pin the descriptor for one native call.
    pub(crate) fn acquire(&self) -> Result<FdGuard<'_, C>> {
        let mut state = self.state.load(Ordering::Acquire);

        loop {
            if state & CLOSED != 0 {
                return Err(SocketError::Closed);
            }

            match self.state.compare_exchange_weak(
                state,
                state + ONE_USE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(FdGuard { handle: self }),
                Err(current) => state = current,
            }
        }
    }

    fn release(&self) {
        let prev = self.state.fetch_sub(ONE_USE, Ordering::AcqRel);

        debug_assert!(prev >= ONE_USE, "release without acquire");

        if prev == CLOSED | ONE_USE {
            log::debug!(
                "socket({}) deferred close by last user",
                self.raw.load(Ordering::Acquire)
            );

            self.close_now();
        }
    }

    /// Mark the handle closed. Idempotent.
    ///
    /// The native close happens here when nobody holds a guard, otherwise in
    /// the release of the last outstanding guard.
    pub(crate) fn close(&self) {
        // Hold a use so the descriptor stays valid for `preclose`.
        let guard = match self.acquire() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let prev = self.state.fetch_or(CLOSED, Ordering::AcqRel);

        if prev & CLOSED != 0 {
            return;
        }

        if prev > ONE_USE {
            log::debug!("socket({}) close pending, in use", guard.raw());

            self.closer.preclose(guard.raw());
        }

        drop(guard);
    }

    fn close_now(&self) {
        let raw = self.raw.swap(INVALID_FD, Ordering::AcqRel);

        if raw != INVALID_FD {
            log::debug!("socket({}) closed", raw);

            self.closer.close(raw);
        }

        self.ticket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl<C: Closer> Drop for FdHandle<C> {
    fn drop(&mut self) {
        self.close_now();
    }
}

impl<C: Closer> std::fmt::Debug for FdHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdHandle")
            .field("raw", &self.raw.load(Ordering::Relaxed))
            .field("family", &self.family)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An acquired descriptor, released on drop.
pub(crate) struct FdGuard<'a, C: Closer = NativeCloser> {
    handle: &'a FdHandle<C>,
}

impl<'a, C: Closer> FdGuard<'a, C> {
    pub(crate) fn raw(&self) -> RawFd {
        self.handle.raw.load(Ordering::Acquire)
    }

    pub(crate) fn family(&self) -> Family {
        self.handle.family
    }
}

impl<'a, C: Closer> Drop for FdGuard<'a, C> {
    fn drop(&mut self) {
        self.handle.release();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicBool,
        thread::{sleep, spawn},
        time::Duration,
    };

    use crate::ledger::{LedgerKind, ResourceLedger};

    use super::*;

    #[derive(Default, Clone)]
    struct CountingCloser {
        closes: Arc<AtomicUsize>,
        precloses: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        closed_while_active: Arc<AtomicBool>,
    }

    impl Closer for CountingCloser {
        fn preclose(&self, _fd: RawFd) {
            self.precloses.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self, _fd: RawFd) {
            if self.active.load(Ordering::SeqCst) != 0 {
                self.closed_while_active.store(true, Ordering::SeqCst);
            }

            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_close_idle() {
        let closer = CountingCloser::default();

        let handle = FdHandle::with_closer(42, Family::V4, None, closer.clone());

        handle.close();
        handle.close();

        assert_eq!(closer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(closer.precloses.load(Ordering::SeqCst), 0);
        assert!(matches!(handle.acquire(), Err(SocketError::Closed)));

        drop(handle);

        assert_eq!(closer.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_close() {
        let closer = CountingCloser::default();

        let handle = FdHandle::with_closer(7, Family::V6, None, closer.clone());

        let guard = handle.acquire().unwrap();

        handle.close();

        assert_eq!(closer.closes.load(Ordering::SeqCst), 0);
        assert_eq!(closer.precloses.load(Ordering::SeqCst), 1);
        assert_eq!(guard.raw(), 7);

        drop(guard);

        assert_eq!(closer.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_close_exactly_once() {
        _ = pretty_env_logger::try_init();

        for _ in 0..20 {
            let closer = CountingCloser::default();

            let handle = Arc::new(FdHandle::with_closer(
                3,
                Family::V4,
                None,
                closer.clone(),
            ));

            let users: Vec<_> = (0..8)
                .map(|i| {
                    let handle = handle.clone();
                    let active = closer.active.clone();

                    spawn(move || {
                        for _ in 0..50 {
                            let guard = match handle.acquire() {
                                Ok(guard) => guard,
                                Err(_) => return,
                            };

                            active.fetch_add(1, Ordering::SeqCst);

                            if i % 2 == 0 {
                                sleep(Duration::from_micros(50));
                            }

                            active.fetch_sub(1, Ordering::SeqCst);

                            drop(guard);
                        }
                    })
                })
                .collect();

            let closers: Vec<_> = (0..3)
                .map(|_| {
                    let handle = handle.clone();

                    spawn(move || {
                        sleep(Duration::from_micros(200));
                        handle.close();
                    })
                })
                .collect();

            for t in users.into_iter().chain(closers) {
                t.join().unwrap();
            }

            assert_eq!(closer.closes.load(Ordering::SeqCst), 1);
            assert!(!closer.closed_while_active.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn test_ticket_released_on_close() {
        let ledger = Arc::new(ResourceLedger::new(None, Some(1)));

        let ticket = Arc::new(ledger.before_create(LedgerKind::Datagram).unwrap());

        let handle = FdHandle::with_closer(
            9,
            Family::V4,
            Some(ticket),
            CountingCloser::default(),
        );

        let guard = handle.acquire().unwrap();

        handle.close();

        assert_eq!(ledger.live(LedgerKind::Datagram), 1);

        drop(guard);

        assert_eq!(ledger.live(LedgerKind::Datagram), 0);
    }
}
