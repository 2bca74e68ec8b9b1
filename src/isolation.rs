//! Stream isolation
//!
//! Two streams may share a circuit only when their isolation keys are
//! equal. The key is a tuple of request attributes; which attributes
//! participate is decided by configuration, so e.g. turning on
//! `isolate_by_socksauth` gives each SOCKS username its own circuits.

use crate::config::IsolationFlags;

/// Attributes of one incoming request, before isolation is applied
#[derive(Debug, Clone)]
pub struct RequestAttrs {
    /// Destination host or address, lowercased
    pub dest_addr: String,

    /// Destination port
    pub dest_port: u16,

    /// SOCKS username/password, when the client authenticated
    pub socks_auth: Option<String>,

    /// Source port of the local client socket
    pub client_port: u16,

    /// Client protocol ("socks5", "socks5-auth")
    pub client_proto: &'static str,
}

/// The tuple that decides circuit sharing
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IsolationKey {
    dest_addr: Option<String>,
    dest_port: Option<u16>,
    socks_auth: Option<String>,
    client_port: Option<u16>,
    client_proto: Option<&'static str>,
}

impl IsolationKey {
    /// Derive the key for a request under the configured dimensions
    pub fn from_request(flags: &IsolationFlags, attrs: &RequestAttrs) -> Self {
        Self {
            dest_addr: flags
                .by_dest_addr
                .then(|| attrs.dest_addr.trim_end_matches('.').to_lowercase()),
            dest_port: flags.by_dest_port.then_some(attrs.dest_port),
            socks_auth: if flags.by_socks_auth {
                // No auth and empty auth are distinct from any username.
                Some(attrs.socks_auth.clone().unwrap_or_default())
            } else {
                None
            },
            client_port: flags.by_client_port.then_some(attrs.client_port),
            client_proto: flags.by_client_proto.then_some(attrs.client_proto),
        }
    }
}

impl std::fmt::Display for IsolationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.dest_addr.as_deref().unwrap_or("*"),
            self.dest_port.map_or("*".into(), |p| p.to_string()),
            self.socks_auth.as_deref().unwrap_or("*"),
            self.client_port.map_or("*".into(), |p| p.to_string()),
            self.client_proto.unwrap_or("*"),
        )
    }
}
