//! Socket context: configuration, resource ledger and platform capabilities.
//!
//! A context is the factory every socket is created through. It is cheap to
//! clone and immutable once built.

use std::{fmt::Display, net::IpAddr, sync::Arc};

use once_cell::sync::{Lazy, OnceCell};

use crate::{
    addr::Family,
    config::SocketConfig,
    error::Result,
    iface::NetworkInterface,
    ledger::{LedgerKind, ResourceLedger},
    socket::{DatagramSocket, Socket, StreamSocket},
    sys,
};

/// Native layout backing a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// One IPv6 descriptor carrying IPv4 traffic as v4-mapped addresses.
    DualStack,
    /// Separate IPv4 and IPv6 descriptors fanned in on accept/receive.
    TwoDescriptor,
}

impl Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DualStack => write!(f, "dual-stack"),
            Self::TwoDescriptor => write!(f, "two-descriptor"),
        }
    }
}

/// What a socket is created for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Stream,
    Datagram,
    Multicast,
}

impl SocketKind {
    pub fn ledger_kind(&self) -> LedgerKind {
        match self {
            Self::Stream => LedgerKind::Stream,
            Self::Datagram | Self::Multicast => LedgerKind::Datagram,
        }
    }
}

impl Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Datagram => write!(f, "datagram"),
            Self::Multicast => write!(f, "multicast"),
        }
    }
}

/// Platform capabilities, probed once per process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub ipv6: bool,
    pub dual_stack: bool,
}

static CAPABILITIES: OnceCell<Capabilities> = OnceCell::new();

impl Capabilities {
    pub fn get() -> Capabilities {
        *CAPABILITIES.get_or_init(|| {
            let ipv6 = sys::probe_ipv6();

            let caps = Capabilities {
                ipv6,
                dual_stack: ipv6 && sys::probe_dual_stack(),
            };

            log::debug!("platform capabilities {:?}", caps);

            caps
        })
    }
}

static GLOBAL: Lazy<SocketContext> = Lazy::new(SocketContext::from_env);

struct ContextInner {
    config: SocketConfig,
    ledger: Arc<ResourceLedger>,
    capabilities: Capabilities,
    multicast_if: OnceCell<Option<NetworkInterface>>,
}

/// Shared configuration and accounting for a family of sockets.
#[derive(Clone)]
pub struct SocketContext {
    inner: Arc<ContextInner>,
}

impl SocketContext {
    pub fn new(config: SocketConfig) -> Self {
        Self::with_capabilities(config, Capabilities::get())
    }

    pub(crate) fn with_capabilities(config: SocketConfig, capabilities: Capabilities) -> Self {
        let ledger = Arc::new(ResourceLedger::new(
            config.max_stream_sockets,
            config.max_datagram_sockets,
        ));

        Self {
            inner: Arc::new(ContextInner {
                config,
                ledger,
                capabilities,
                multicast_if: OnceCell::new(),
            }),
        }
    }

    /// Context configured from `DUALSOCK_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(SocketConfig::from_env())
    }

    /// Process-wide context, built from the environment on first use.
    pub fn global() -> &'static SocketContext {
        &GLOBAL
    }

    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.inner.ledger
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    /// Strategy a new socket of `kind` gets.
    pub fn strategy(&self, kind: SocketKind) -> Strategy {
        if kind == SocketKind::Multicast
            || self.inner.config.force_two_descriptor
            || !self.inner.capabilities.dual_stack
        {
            Strategy::TwoDescriptor
        } else {
            Strategy::DualStack
        }
    }

    /// Wildcard address reported for an unbound or wildcard-bound socket.
    pub fn any_local_address(&self) -> IpAddr {
        if self.inner.config.prefer_ipv6_addresses && self.inner.capabilities.ipv6 {
            Family::V6.unspecified()
        } else {
            Family::V4.unspecified()
        }
    }

    /// Configured default multicast interface, resolved on first use.
    pub fn default_multicast_interface(&self) -> Option<&NetworkInterface> {
        self.inner
            .multicast_if
            .get_or_init(|| {
                let name = self.inner.config.multicast_interface.as_deref()?;

                match NetworkInterface::by_name(name) {
                    Ok(Some(iface)) => {
                        log::debug!("default multicast interface {}({})", name, iface.index());
                        Some(iface)
                    }
                    Ok(None) => {
                        log::warn!("multicast interface {} not found, OS default used", name);
                        None
                    }
                    Err(err) => {
                        log::warn!("multicast interface {} lookup failed: {}", name, err);
                        None
                    }
                }
            })
            .as_ref()
    }

    pub fn stream(&self) -> Result<StreamSocket> {
        StreamSocket::new(self.clone())
    }

    pub fn datagram(&self) -> Result<DatagramSocket> {
        DatagramSocket::new(self.clone(), SocketKind::Datagram)
    }

    pub fn multicast(&self) -> Result<DatagramSocket> {
        DatagramSocket::new(self.clone(), SocketKind::Multicast)
    }

    /// Create an unbound socket of `kind`.
    pub fn create(&self, kind: SocketKind) -> Result<Socket> {
        match kind {
            SocketKind::Stream => self.stream().map(Socket::Stream),
            SocketKind::Datagram => self.datagram().map(Socket::Datagram),
            SocketKind::Multicast => self.multicast().map(Socket::Datagram),
        }
    }
}

impl Default for SocketContext {
    fn default() -> Self {
        Self::new(SocketConfig::default())
    }
}

impl std::fmt::Debug for SocketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketContext")
            .field("config", &self.inner.config)
            .field("capabilities", &self.inner.capabilities)
            .finish()
    }
}
