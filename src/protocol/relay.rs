//! Relay records
//!
//! Relay metadata as published in the consensus: identity, address,
//! flags, bandwidth weight, exit policy summary and family. A relay is
//! usable only when the consensus marks it both Running and Valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};

/// A Tor relay from the consensus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay nickname
    pub nickname: String,

    /// Hex-encoded SHA-1 identity fingerprint (40 chars, uppercase)
    pub fingerprint: String,

    /// Ed25519 identity key, when the consensus carries one (base64)
    #[serde(default)]
    pub ed_identity: Option<String>,

    /// IPv4/IPv6 address
    pub address: IpAddr,

    /// OR port
    pub or_port: u16,

    /// Directory port, if the relay serves directory requests directly
    pub dir_port: Option<u16>,

    /// Relay flags
    pub flags: RelayFlags,

    /// Consensus bandwidth weight
    pub bandwidth_weight: u64,

    /// Exit policy summary from the consensus "p" line
    #[serde(default)]
    pub exit_policy: ExitPolicySummary,

    /// Declared family, as a set of fingerprints
    #[serde(default)]
    pub family: BTreeSet<String>,

    /// Optional country code (from a GeoIP source, if configured)
    #[serde(default)]
    pub country_code: Option<String>,

    /// ntor onion key (base64), filled from the relay's descriptor
    #[serde(default)]
    pub ntor_onion_key: Option<String>,
}

impl Relay {
    /// Socket address of the OR port
    pub fn or_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    /// Socket address of the directory port, if any
    pub fn dir_addr(&self) -> Option<SocketAddr> {
        self.dir_port.map(|p| SocketAddr::new(self.address, p))
    }

    /// Whether this relay may be used at all
    pub fn usable(&self) -> bool {
        self.flags.running && self.flags.valid
    }

    /// Whether this relay qualifies as a guard
    pub fn guard_eligible(&self) -> bool {
        self.usable() && self.flags.guard && self.flags.fast && self.flags.stable
    }

    /// Whether this relay qualifies as a middle
    pub fn middle_eligible(&self) -> bool {
        self.usable() && self.flags.fast
    }

    /// Whether this relay qualifies as an exit for the given port
    pub fn exit_eligible(&self, port: u16) -> bool {
        self.usable() && self.flags.exit && !self.flags.bad_exit && self.exit_policy.allows(port)
    }

    /// The /16 IPv4 prefix, used for path diversity checks
    pub fn ipv4_16_prefix(&self) -> Option<[u8; 2]> {
        match self.address {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                Some([o[0], o[1]])
            }
            IpAddr::V6(_) => None,
        }
    }

    /// Whether two relays may share a path
    ///
    /// Relays in the same declared family or the same /16 IPv4 subnet
    /// never appear on one circuit together.
    pub fn path_independent_of(&self, other: &Relay) -> bool {
        if self.fingerprint == other.fingerprint {
            return false;
        }
        if self.family.contains(&other.fingerprint) || other.family.contains(&self.fingerprint) {
            return false;
        }
        match (self.ipv4_16_prefix(), other.ipv4_16_prefix()) {
            (Some(a), Some(b)) if a == b => false,
            _ => true,
        }
    }
}

/// Relay flags from the consensus "s" line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFlags {
    /// Directory authority
    pub authority: bool,

    /// Should not be used as an exit
    pub bad_exit: bool,

    /// Allows exit traffic
    pub exit: bool,

    /// Fast relay
    pub fast: bool,

    /// Suitable as entry guard
    pub guard: bool,

    /// Onion-service directory
    pub hs_dir: bool,

    /// Currently running
    pub running: bool,

    /// Stable relay
    pub stable: bool,

    /// Serves directory documents
    pub v2_dir: bool,

    /// Has a valid descriptor
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from the consensus flag list
    pub fn from_string(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();

        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => relay_flags.authority = true,
                "BadExit" => relay_flags.bad_exit = true,
                "Exit" => relay_flags.exit = true,
                "Fast" => relay_flags.fast = true,
                "Guard" => relay_flags.guard = true,
                "HSDir" => relay_flags.hs_dir = true,
                "Running" => relay_flags.running = true,
                "Stable" => relay_flags.stable = true,
                "V2Dir" => relay_flags.v2_dir = true,
                "Valid" => relay_flags.valid = true,
                _ => {} // Ignore unknown flags
            }
        }

        relay_flags
    }
}

/// Exit policy summary ("p" line): an accept or reject port list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPolicySummary {
    /// True for "accept", false for "reject"
    pub accept: bool,

    /// Port ranges, inclusive
    pub ports: Vec<(u16, u16)>,
}

impl Default for ExitPolicySummary {
    fn default() -> Self {
        // No "p" line means nothing is known to be allowed.
        Self {
            accept: true,
            ports: Vec::new(),
        }
    }
}

impl ExitPolicySummary {
    /// Parse "accept 80,443,8000-8999" / "reject 25,119"
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split_whitespace();
        let accept = match parts.next()? {
            "accept" => true,
            "reject" => false,
            _ => return None,
        };
        let list = parts.next()?;
        let mut ports = Vec::new();
        for entry in list.split(',') {
            if let Some((lo, hi)) = entry.split_once('-') {
                let lo: u16 = lo.parse().ok()?;
                let hi: u16 = hi.parse().ok()?;
                if lo > hi {
                    return None;
                }
                ports.push((lo, hi));
            } else {
                let p: u16 = entry.parse().ok()?;
                ports.push((p, p));
            }
        }
        Some(Self { accept, ports })
    }

    /// Whether connecting to `port` is permitted
    pub fn allows(&self, port: u16) -> bool {
        let listed = self.ports.iter().any(|(lo, hi)| (*lo..=*hi).contains(&port));
        if self.accept {
            listed
        } else {
            !listed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_relay(nickname: &str, fp: &str, addr: &str, flags: &str) -> Relay {
        Relay {
            nickname: nickname.to_string(),
            fingerprint: fp.to_string(),
            ed_identity: None,
            address: addr.parse().unwrap(),
            or_port: 9001,
            dir_port: None,
            flags: RelayFlags::from_string(flags),
            bandwidth_weight: 1000,
            exit_policy: ExitPolicySummary::default(),
            family: BTreeSet::new(),
            country_code: None,
            ntor_onion_key: None,
        }
    }

    #[test]
    fn test_flags_parsing() {
        let flags = RelayFlags::from_string("Fast Guard HSDir Running Stable V2Dir Valid");
        assert!(flags.fast);
        assert!(flags.guard);
        assert!(flags.hs_dir);
        assert!(flags.running);
        assert!(flags.stable);
        assert!(flags.v2_dir);
        assert!(flags.valid);
        assert!(!flags.exit);
        assert!(!flags.bad_exit);
    }

    #[test]
    fn test_usable_requires_running_and_valid() {
        let mut relay = test_relay("a", "A".repeat(40).as_str(), "1.2.3.4", "Running Valid");
        assert!(relay.usable());

        relay.flags.valid = false;
        assert!(!relay.usable());

        relay.flags.valid = true;
        relay.flags.running = false;
        assert!(!relay.usable());
    }

    #[test]
    fn test_exit_policy_accept() {
        let policy = ExitPolicySummary::parse("accept 80,443,8000-8999").unwrap();
        assert!(policy.allows(80));
        assert!(policy.allows(443));
        assert!(policy.allows(8500));
        assert!(!policy.allows(25));
        assert!(!policy.allows(9000));
    }

    #[test]
    fn test_exit_policy_reject() {
        let policy = ExitPolicySummary::parse("reject 25,119,135-139").unwrap();
        assert!(!policy.allows(25));
        assert!(!policy.allows(137));
        assert!(policy.allows(443));
    }

    #[test]
    fn test_bad_exit_never_exits() {
        let mut relay = test_relay("e", &"B".repeat(40), "1.2.3.4", "Exit Running Valid");
        relay.exit_policy = ExitPolicySummary::parse("accept 443").unwrap();
        assert!(relay.exit_eligible(443));

        relay.flags.bad_exit = true;
        assert!(!relay.exit_eligible(443));
    }

    #[test]
    fn test_same_subnet_not_path_independent() {
        let a = test_relay("a", &"A".repeat(40), "10.1.2.3", "Running Valid");
        let b = test_relay("b", &"B".repeat(40), "10.1.9.9", "Running Valid");
        let c = test_relay("c", &"C".repeat(40), "10.2.0.1", "Running Valid");

        assert!(!a.path_independent_of(&b)); // same /16
        assert!(a.path_independent_of(&c));
        assert!(!a.path_independent_of(&a)); // itself
    }

    #[test]
    fn test_family_not_path_independent() {
        let mut a = test_relay("a", &"A".repeat(40), "10.1.2.3", "Running Valid");
        let b = test_relay("b", &"B".repeat(40), "20.1.9.9", "Running Valid");
        a.family.insert("B".repeat(40));

        assert!(!a.path_independent_of(&b));
        assert!(!b.path_independent_of(&a)); // symmetric
    }

    #[test]
    fn test_relay_serde_roundtrip() {
        let mut relay = test_relay("r", &"D".repeat(40), "1.2.3.4", "Exit Fast Running Valid");
        relay.exit_policy = ExitPolicySummary::parse("accept 80,443").unwrap();
        relay.family.insert("E".repeat(40));
        relay.ntor_onion_key = Some("bm90IGEga2V5".into());

        let json = serde_json::to_string(&relay).unwrap();
        let parsed: Relay = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, relay);
    }
}
