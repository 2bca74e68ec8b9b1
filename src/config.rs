//! Client configuration
//!
//! The configuration record consumed by the core. A CLI or config-file
//! loader produces one of these; the core only validates and reads it.

use crate::error::{Result, TorError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which request attributes participate in the stream isolation key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolationFlags {
    /// Isolate by destination address
    pub by_dest_addr: bool,
    /// Isolate by destination port
    pub by_dest_port: bool,
    /// Isolate by SOCKS username/password
    pub by_socks_auth: bool,
    /// Isolate by the local client's source port
    pub by_client_port: bool,
    /// Isolate by client protocol (SOCKS version)
    pub by_client_proto: bool,
}

impl Default for IsolationFlags {
    fn default() -> Self {
        Self {
            by_dest_addr: true,
            by_dest_port: true,
            by_socks_auth: true,
            by_client_port: false,
            by_client_proto: false,
        }
    }
}

/// Client configuration record
#[derive(Debug, Clone)]
pub struct TorConfig {
    /// TCP endpoint of the SOCKS front door
    pub socks_listen: SocketAddr,

    /// Directory for guards, cached consensus and descriptor caches
    pub data_dir: PathBuf,

    /// Maximum live circuits at once
    pub max_circuits: usize,

    /// Minimum ready circuits to keep prebuilt per common purpose
    pub min_pool_size: usize,

    /// Maximum age of a used circuit before the reaper closes it
    pub max_dirtiness: Duration,

    /// Close circuits idle longer than this
    pub idle_timeout: Duration,

    /// Stream isolation dimensions
    pub isolation: IsolationFlags,

    /// Retirement horizon for confirmed guards
    pub guard_lifetime_days: u32,

    /// How close to `valid-until` a consensus may still be used
    pub consensus_refresh_slack: Duration,

    /// Whether RESOLVE offers AAAA results
    pub enable_ipv6: bool,

    /// Override the built-in directory authority list ("name fp host:port")
    pub authorities: Option<Vec<String>>,

    /// Per-listener cap on concurrent SOCKS connections
    pub max_socks_connections: usize,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            socks_listen: "127.0.0.1:9050".parse().expect("static addr"),
            data_dir: PathBuf::from(".tor-native"),
            max_circuits: 32,
            min_pool_size: 2,
            max_dirtiness: Duration::from_secs(10 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            isolation: IsolationFlags::default(),
            guard_lifetime_days: 60,
            consensus_refresh_slack: Duration::from_secs(5 * 60),
            enable_ipv6: false,
            authorities: None,
            max_socks_connections: 1000,
        }
    }
}

impl TorConfig {
    /// Validate the configuration; all violations are fatal at startup
    pub fn validate(&self) -> Result<()> {
        if !self.socks_listen.ip().is_loopback() {
            return Err(TorError::Config(format!(
                "socks_listen must be a loopback address, got {}",
                self.socks_listen
            )));
        }
        if self.max_circuits == 0 {
            return Err(TorError::Config("max_circuits must be at least 1".into()));
        }
        if self.min_pool_size > self.max_circuits {
            return Err(TorError::Config(format!(
                "min_pool_size ({}) exceeds max_circuits ({})",
                self.min_pool_size, self.max_circuits
            )));
        }
        if self.max_dirtiness.is_zero() {
            return Err(TorError::Config("max_dirtiness must be nonzero".into()));
        }
        if self.guard_lifetime_days == 0 {
            return Err(TorError::Config("guard_lifetime_days must be nonzero".into()));
        }
        if self.max_socks_connections == 0 {
            return Err(TorError::Config(
                "max_socks_connections must be at least 1".into(),
            ));
        }
        if let Some(auths) = &self.authorities {
            if auths.is_empty() {
                return Err(TorError::Config(
                    "authorities override must not be empty".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_loopback_listener() {
        let cfg = TorConfig {
            socks_listen: "0.0.0.0:9050".parse().unwrap(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_pool_larger_than_cap() {
        let cfg = TorConfig {
            max_circuits: 2,
            min_pool_size: 5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_authority_override() {
        let cfg = TorConfig {
            authorities: Some(vec![]),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
