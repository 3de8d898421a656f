//! Process-wide accounting of live sockets.

use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::error::{Result, SocketError};

/// Ledger bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LedgerKind {
    Stream,
    Datagram,
}

impl Display for LedgerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Datagram => write!(f, "datagram"),
        }
    }
}

#[derive(Debug, Default)]
struct Counter {
    live: AtomicUsize,
    limit: Option<usize>,
}

impl Counter {
    fn increment(&self) -> std::result::Result<usize, usize> {
        let mut live = self.live.load(Ordering::Acquire);

        loop {
            if let Some(limit) = self.limit {
                if live >= limit {
                    return Err(limit);
                }
            }

            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(live + 1),
                Err(current) => live = current,
            }
        }
    }
}

/// Counts live stream and datagram sockets against optional ceilings.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    stream: Counter,
    datagram: Counter,
}

impl ResourceLedger {
    pub fn new(max_stream: Option<usize>, max_datagram: Option<usize>) -> Self {
        Self {
            stream: Counter {
                live: AtomicUsize::new(0),
                limit: max_stream,
            },
            datagram: Counter {
                live: AtomicUsize::new(0),
                limit: max_datagram,
            },
        }
    }

    fn counter(&self, kind: LedgerKind) -> &Counter {
        match kind {
            LedgerKind::Stream => &self.stream,
            LedgerKind::Datagram => &self.datagram,
        }
    }

    /// Reserve a slot ahead of a native create call.
    ///
    /// The slot is released when the returned ticket drops, so a failed create
    /// rolls the counter back simply by dropping the ticket.
    pub fn before_create(self: &Arc<Self>, kind: LedgerKind) -> Result<LedgerTicket> {
        match self.counter(kind).increment() {
            Ok(live) => {
                log::trace!("ledger {} sockets live({})", kind, live);

                Ok(LedgerTicket {
                    ledger: self.clone(),
                    kind,
                })
            }
            Err(limit) => {
                log::debug!("ledger {} sockets exhausted, limit({})", kind, limit);

                Err(SocketError::TooManySockets { kind, limit })
            }
        }
    }

    /// Number of live sockets of `kind`.
    pub fn live(&self, kind: LedgerKind) -> usize {
        self.counter(kind).live.load(Ordering::Acquire)
    }

    pub fn limit(&self, kind: LedgerKind) -> Option<usize> {
        self.counter(kind).limit
    }

    fn after_close(&self, kind: LedgerKind) {
        let prev = self.counter(kind).live.fetch_sub(1, Ordering::AcqRel);

        debug_assert!(prev > 0, "ledger underflow");

        log::trace!("ledger {} sockets live({})", kind, prev - 1);
    }
}

/// One reserved ledger slot.
#[derive(Debug)]
pub struct LedgerTicket {
    ledger: Arc<ResourceLedger>,
    kind: LedgerKind,
}

impl LedgerTicket {
    pub fn kind(&self) -> LedgerKind {
        self.kind
    }
}

impl Drop for LedgerTicket {
    fn drop(&mut self) {
        self.ledger.after_close(self.kind);
    }
}

#[cfg(test)]
mod tests {
    use std::thread::spawn;

    use super::*;

    #[test]
    fn test_ceiling() {
        let ledger = Arc::new(ResourceLedger::new(None, Some(2)));

        let first = ledger.before_create(LedgerKind::Datagram).unwrap();
        let _second = ledger.before_create(LedgerKind::Datagram).unwrap();

        assert!(matches!(
            ledger.before_create(LedgerKind::Datagram),
            Err(SocketError::TooManySockets { limit: 2, .. })
        ));

        // Stream bucket is independent.
        let _stream = ledger.before_create(LedgerKind::Stream).unwrap();

        drop(first);

        assert_eq!(ledger.live(LedgerKind::Datagram), 1);

        let _third = ledger.before_create(LedgerKind::Datagram).unwrap();

        assert!(ledger.before_create(LedgerKind::Datagram).is_err());
    }

    #[test]
    fn test_concurrent_tickets_never_exceed_limit() {
        let ledger = Arc::new(ResourceLedger::new(Some(8), None));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                spawn(move || ledger.before_create(LedgerKind::Stream).ok())
            })
            .collect();

        let tickets: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(tickets.len(), 8);
        assert_eq!(ledger.live(LedgerKind::Stream), 8);

        drop(tickets);

        assert_eq!(ledger.live(LedgerKind::Stream), 0);
    }
}
