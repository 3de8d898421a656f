//! Socket layer configuration.
//!
//! A [`SocketConfig`] is built once (usually from the environment) and handed
//! to a [`SocketContext`](crate::context::SocketContext); it never changes
//! afterwards.

use std::env;

/// Force the two-descriptor strategy even when dual-stack is available.
pub const ENV_FORCE_TWO_DESCRIPTOR: &str = "DUALSOCK_FORCE_TWO_DESCRIPTOR";
/// Report `::` instead of `0.0.0.0` as the any-local address.
pub const ENV_PREFER_IPV6_ADDRESSES: &str = "DUALSOCK_PREFER_IPV6_ADDRESSES";
/// Name of the default outbound multicast interface.
pub const ENV_MULTICAST_INTERFACE: &str = "DUALSOCK_MULTICAST_INTERFACE";
/// Ceiling for concurrently open datagram sockets.
pub const ENV_MAX_DATAGRAM_SOCKETS: &str = "DUALSOCK_MAX_DATAGRAM_SOCKETS";
/// Ceiling for concurrently open stream sockets.
pub const ENV_MAX_STREAM_SOCKETS: &str = "DUALSOCK_MAX_STREAM_SOCKETS";
/// Emulate `SO_REUSEADDR` once sockets are bound.
pub const ENV_EXCLUSIVE_BIND: &str = "DUALSOCK_EXCLUSIVE_BIND";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketConfig {
    pub force_two_descriptor: bool,
    pub prefer_ipv6_addresses: bool,
    pub multicast_interface: Option<String>,
    pub max_datagram_sockets: Option<usize>,
    pub max_stream_sockets: Option<usize>,
    pub exclusive_bind: bool,
}

impl SocketConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| match lookup(key) {
            Some(value) => parse_bool(key, &value).unwrap_or(false),
            None => false,
        };

        let limit = |key: &str| {
            lookup(key).and_then(|value| match value.trim().parse::<usize>() {
                Ok(limit) => Some(limit),
                Err(_) => {
                    log::warn!("ignore {}={:?}, expect an unsigned integer", key, value);
                    None
                }
            })
        };

        let config = Self {
            force_two_descriptor: flag(ENV_FORCE_TWO_DESCRIPTOR),
            prefer_ipv6_addresses: flag(ENV_PREFER_IPV6_ADDRESSES),
            multicast_interface: lookup(ENV_MULTICAST_INTERFACE)
                .map(|name| name.trim().to_owned())
                .filter(|name| !name.is_empty()),
            max_datagram_sockets: limit(ENV_MAX_DATAGRAM_SOCKETS),
            max_stream_sockets: limit(ENV_MAX_STREAM_SOCKETS),
            exclusive_bind: flag(ENV_EXCLUSIVE_BIND),
        };

        log::debug!("socket config {:?}", config);

        config
    }

    pub fn with_force_two_descriptor(mut self, on: bool) -> Self {
        self.force_two_descriptor = on;
        self
    }

    pub fn with_prefer_ipv6_addresses(mut self, on: bool) -> Self {
        self.prefer_ipv6_addresses = on;
        self
    }

    pub fn with_multicast_interface<S: Into<String>>(mut self, name: Option<S>) -> Self {
        self.multicast_interface = name.map(Into::into);
        self
    }

    pub fn with_max_datagram_sockets(mut self, limit: Option<usize>) -> Self {
        self.max_datagram_sockets = limit;
        self
    }

    pub fn with_max_stream_sockets(mut self, limit: Option<usize>) -> Self {
        self.max_stream_sockets = limit;
        self
    }

    pub fn with_exclusive_bind(mut self, on: bool) -> Self {
        self.exclusive_bind = on;
        self
    }
}

fn parse_bool(key: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            log::warn!("ignore {}={:?}, expect a boolean", key, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        _ = pretty_env_logger::try_init();

        assert_eq!(SocketConfig::from_lookup(lookup(&[])), SocketConfig::default());
    }

    #[test]
    fn test_from_lookup() {
        _ = pretty_env_logger::try_init();

        let config = SocketConfig::from_lookup(lookup(&[
            (ENV_FORCE_TWO_DESCRIPTOR, "true"),
            (ENV_PREFER_IPV6_ADDRESSES, "On"),
            (ENV_MULTICAST_INTERFACE, " lo "),
            (ENV_MAX_DATAGRAM_SOCKETS, "16"),
            (ENV_EXCLUSIVE_BIND, "1"),
        ]));

        assert!(config.force_two_descriptor);
        assert!(config.prefer_ipv6_addresses);
        assert_eq!(config.multicast_interface.as_deref(), Some("lo"));
        assert_eq!(config.max_datagram_sockets, Some(16));
        assert_eq!(config.max_stream_sockets, None);
        assert!(config.exclusive_bind);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        _ = pretty_env_logger::try_init();

        let config = SocketConfig::from_lookup(lookup(&[
            (ENV_FORCE_TWO_DESCRIPTOR, "maybe"),
            (ENV_MAX_STREAM_SOCKETS, "-3"),
            (ENV_MULTICAST_INTERFACE, "   "),
        ]));

        assert!(!config.force_two_descriptor);
        assert_eq!(config.max_stream_sockets, None);
        assert_eq!(config.multicast_interface, None);
    }
}
