//! Consensus document parsing
//!
//! Parses the network-status consensus fetched from directory
//! authorities: validity interval, per-relay entries (identity, address,
//! flags, bandwidth, exit policy summary) and the bandwidth-weights
//! line used by the path selector.

use crate::error::{Result, TorError};
use crate::protocol::relay::{ExitPolicySummary, Relay, RelayFlags};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Bandwidth weights from the consensus, in units of 1/10000
///
/// Naming follows dir-spec: W<position><flags>, e.g. `Wgg` weights a
/// Guard-flagged relay used in the guard position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthWeights {
    pub wgg: u64,
    pub wgd: u64,
    pub wgm: u64,
    pub wmg: u64,
    pub wmm: u64,
    pub wme: u64,
    pub wmd: u64,
    pub weg: u64,
    pub wem: u64,
    pub wee: u64,
    pub wed: u64,
}

impl BandwidthWeights {
    /// Neutral weights used when the consensus omits the line
    pub fn flat() -> Self {
        Self {
            wgg: 10_000,
            wgd: 10_000,
            wgm: 10_000,
            wmg: 10_000,
            wmm: 10_000,
            wme: 10_000,
            wmd: 10_000,
            weg: 10_000,
            wem: 10_000,
            wee: 10_000,
            wed: 10_000,
        }
    }

    /// Parse a "bandwidth-weights" line
    pub fn parse(line: &str) -> Self {
        let mut weights = Self::flat();
        for pair in line.split_whitespace() {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            match key {
                "Wgg" => weights.wgg = value,
                "Wgd" => weights.wgd = value,
                "Wgm" => weights.wgm = value,
                "Wmg" => weights.wmg = value,
                "Wmm" => weights.wmm = value,
                "Wme" => weights.wme = value,
                "Wmd" => weights.wmd = value,
                "Weg" => weights.weg = value,
                "Wem" => weights.wem = value,
                "Wee" => weights.wee = value,
                "Wed" => weights.wed = value,
                _ => {}
            }
        }
        weights
    }
}

/// Parsed consensus document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    /// valid-after (unix seconds)
    pub valid_after: u64,

    /// fresh-until (unix seconds)
    pub fresh_until: u64,

    /// valid-until (unix seconds)
    pub valid_until: u64,

    /// Relays keyed by hex fingerprint
    pub relays: BTreeMap<String, Relay>,

    /// Bandwidth weights for path selection
    pub weights: BandwidthWeights,

    /// Count of signatures from recognized authorities
    pub authority_signatures: usize,
}

impl Consensus {
    /// Whether this consensus is still fresh at `now`
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        unix_secs(now) < self.fresh_until
    }

    /// Whether this consensus may still be used at `now`
    ///
    /// `slack` narrows the window: a document within `slack` of
    /// valid-until is treated as expired so a refresh lands first.
    pub fn is_valid(&self, now: SystemTime, slack: Duration) -> bool {
        let deadline = self.valid_until.saturating_sub(slack.as_secs());
        unix_secs(now) < deadline
    }

    /// Usable relays (Running and Valid)
    pub fn usable_relays(&self) -> impl Iterator<Item = &Relay> {
        self.relays.values().filter(|r| r.usable())
    }

    /// Look up one relay by fingerprint
    pub fn relay(&self, fingerprint: &str) -> Option<&Relay> {
        self.relays.get(fingerprint)
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Consensus parser
pub struct ConsensusParser;

impl ConsensusParser {
    /// Parse a consensus document from raw bytes
    pub fn parse(data: &[u8]) -> Result<Consensus> {
        let text = std::str::from_utf8(data)
            .map_err(|e| TorError::Directory(format!("invalid UTF-8 in consensus: {}", e)))?;
        Self::parse_text(text)
    }

    /// Parse a consensus document from text
    pub fn parse_text(text: &str) -> Result<Consensus> {
        let mut valid_after = 0;
        let mut fresh_until = 0;
        let mut valid_until = 0;
        let mut weights = BandwidthWeights::flat();
        let mut relays = BTreeMap::new();

        let mut current: Option<RelayBuilder> = None;

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("valid-after ") {
                valid_after = parse_utc_timestamp(rest)?;
            } else if let Some(rest) = line.strip_prefix("fresh-until ") {
                fresh_until = parse_utc_timestamp(rest)?;
            } else if let Some(rest) = line.strip_prefix("valid-until ") {
                valid_until = parse_utc_timestamp(rest)?;
            } else if let Some(rest) = line.strip_prefix("bandwidth-weights ") {
                weights = BandwidthWeights::parse(rest);
            } else if line.starts_with("r ") {
                if let Some(builder) = current.take() {
                    let relay = builder.build();
                    relays.insert(relay.fingerprint.clone(), relay);
                }
                current = Some(Self::parse_r_line(line)?);
            } else if let Some(rest) = line.strip_prefix("s ") {
                if let Some(builder) = current.as_mut() {
                    builder.flags = RelayFlags::from_string(rest);
                }
            } else if let Some(rest) = line.strip_prefix("w ") {
                if let Some(builder) = current.as_mut() {
                    builder.bandwidth_weight = Self::parse_bandwidth(rest);
                }
            } else if let Some(rest) = line.strip_prefix("p ") {
                if let Some(builder) = current.as_mut() {
                    builder.exit_policy = ExitPolicySummary::parse(rest);
                }
            } else if let Some(rest) = line.strip_prefix("id ed25519 ") {
                if let Some(builder) = current.as_mut() {
                    builder.ed_identity = Some(rest.trim().to_string());
                }
            } else if line.starts_with("directory-signature") {
                // Relay section is over; signatures are handled by the
                // verifier, which sees the whole document.
                if let Some(builder) = current.take() {
                    let relay = builder.build();
                    relays.insert(relay.fingerprint.clone(), relay);
                }
            }
        }

        if let Some(builder) = current.take() {
            let relay = builder.build();
            relays.insert(relay.fingerprint.clone(), relay);
        }

        if valid_after == 0 || valid_until == 0 {
            return Err(TorError::Directory(
                "consensus missing validity interval".into(),
            ));
        }
        if fresh_until == 0 {
            fresh_until = valid_after + (valid_until - valid_after) / 2;
        }

        Ok(Consensus {
            valid_after,
            fresh_until,
            valid_until,
            relays,
            weights,
            authority_signatures: 0,
        })
    }

    /// Parse an "r" line:
    /// `r nickname identity digest date time address orport dirport`
    fn parse_r_line(line: &str) -> Result<RelayBuilder> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            return Err(TorError::Directory(format!(
                "malformed r line ({} fields)",
                parts.len()
            )));
        }

        let nickname = parts[1].to_string();
        let identity = STANDARD_NO_PAD
            .decode(parts[2])
            .or_else(|_| STANDARD.decode(parts[2]))
            .map_err(|_| TorError::Directory("bad identity encoding in r line".into()))?;
        if identity.len() != 20 {
            return Err(TorError::Directory("identity must be 20 bytes".into()));
        }
        let fingerprint = hex::encode_upper(&identity);

        let address: IpAddr = parts[6]
            .parse()
            .map_err(|_| TorError::Directory("bad address in r line".into()))?;
        let or_port: u16 = parts[7]
            .parse()
            .map_err(|_| TorError::Directory("bad OR port in r line".into()))?;
        let dir_port: Option<u16> = match parts[8] {
            "0" => None,
            p => p.parse().ok(),
        };

        Ok(RelayBuilder {
            nickname,
            fingerprint,
            ed_identity: None,
            address,
            or_port,
            dir_port,
            flags: RelayFlags::default(),
            bandwidth_weight: 0,
            exit_policy: None,
        })
    }

    /// Parse bandwidth from a "w" line body: `Bandwidth=12345 ...`
    fn parse_bandwidth(rest: &str) -> u64 {
        rest.split_whitespace()
            .find_map(|part| part.strip_prefix("Bandwidth="))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// Builder for one consensus relay entry
struct RelayBuilder {
    nickname: String,
    fingerprint: String,
    ed_identity: Option<String>,
    address: IpAddr,
    or_port: u16,
    dir_port: Option<u16>,
    flags: RelayFlags,
    bandwidth_weight: u64,
    exit_policy: Option<ExitPolicySummary>,
}

impl RelayBuilder {
    fn build(self) -> Relay {
        Relay {
            nickname: self.nickname,
            fingerprint: self.fingerprint,
            ed_identity: self.ed_identity,
            address: self.address,
            or_port: self.or_port,
            dir_port: self.dir_port,
            flags: self.flags,
            bandwidth_weight: self.bandwidth_weight,
            exit_policy: self.exit_policy.unwrap_or_default(),
            family: Default::default(),
            country_code: None,
            ntor_onion_key: None,
        }
    }
}

/// Parse "YYYY-MM-DD HH:MM:SS" (UTC) into unix seconds
///
/// Rejects dates before the epoch; the directory protocol never
/// produces them.
pub fn parse_utc_timestamp(s: &str) -> Result<u64> {
    let bad = || TorError::Directory(format!("bad timestamp: {}", s));

    let mut parts = s.split_whitespace();
    let date = parts.next().ok_or_else(bad)?;
    let time = parts.next().ok_or_else(bad)?;

    let mut date_it = date.split('-');
    let year: i64 = date_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let month: u32 = date_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let day: u32 = date_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;

    let mut time_it = time.split(':');
    let hour: u64 = time_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let minute: u64 = time_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let second: u64 = time_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 60 {
        return Err(bad());
    }

    // Days since the epoch, via the civil-from-days inverse
    // (Howard Hinnant's algorithm).
    let y = year - i64::from(month <= 2);
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = (u64::from(month) + 9) % 12;
    let doy = (153 * mp + 2) / 5 + u64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe as i64 - 719_468;

    if days < 0 {
        return Err(bad());
    }

    Ok(days as u64 * 86_400 + hour * 3600 + minute * 60 + second)
}
