//! Blinded keys, time periods and HSDir selection
//!
//! Each time period, a service's identity key is blinded with a
//! period-dependent factor; descriptors are stored at ids derived from
//! the blinded key, one per replica, and fetched from the HSDir-flagged
//! relays closest to each id in XOR distance.

use crate::crypto::sha3_256;
use crate::error::{Result, TorError};
use crate::protocol::{Consensus, Relay};
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;

/// Length of a time period in seconds (rend-spec: 1440 minutes)
pub const TIME_PERIOD_LENGTH_SECS: u64 = 1440 * 60;

/// Offset of period boundaries from the epoch (12 hours)
pub const TIME_PERIOD_OFFSET_SECS: u64 = 12 * 60 * 60;

/// Descriptor replicas stored per period
pub const N_REPLICAS: u8 = 2;

/// HSDirs tried per replica when fetching
pub const N_SPREAD_FETCH: usize = 3;

/// Key-blinding domain separation string
const BLIND_STRING: &[u8] = b"Derive-temporary-signing-key\0";

/// A time period of the onion-service system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePeriod {
    /// Periods elapsed since the (offset) epoch
    pub number: u64,
}

impl TimePeriod {
    /// The period containing `unix_seconds`
    pub fn containing(unix_seconds: u64) -> Self {
        Self {
            number: unix_seconds.saturating_sub(TIME_PERIOD_OFFSET_SECS) / TIME_PERIOD_LENGTH_SECS,
        }
    }

    /// First second of this period
    pub fn start_secs(&self) -> u64 {
        self.number * TIME_PERIOD_LENGTH_SECS + TIME_PERIOD_OFFSET_SECS
    }

    /// First second after this period
    pub fn end_secs(&self) -> u64 {
        self.start_secs() + TIME_PERIOD_LENGTH_SECS
    }

    /// The byte encoding mixed into blinding and descriptor ids:
    /// period number and period length, both u64 big-endian
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.number.to_be_bytes());
        out[8..].copy_from_slice(&(TIME_PERIOD_LENGTH_SECS / 60).to_be_bytes());
        out
    }
}

/// Blind a service identity key for a time period
///
/// The blinding factor is `H(BLIND_STRING || pubkey || TP_bytes)`,
/// clamped as an X25519 scalar; the blinded key is the scalar multiple
/// of the identity point.
pub fn blind_pubkey(pubkey: &[u8; 32], period: TimePeriod) -> Result<[u8; 32]> {
    let mut input = Vec::with_capacity(BLIND_STRING.len() + 32 + 16);
    input.extend_from_slice(BLIND_STRING);
    input.extend_from_slice(pubkey);
    input.extend_from_slice(&period.to_bytes());

    let mut factor = sha3_256(&input);
    factor[0] &= 248;
    factor[31] &= 63;
    factor[31] |= 64;

    let point = CompressedEdwardsY(*pubkey)
        .decompress()
        .ok_or_else(|| TorError::Crypto("onion pubkey is not a valid point".into()))?;
    let blinded = point * Scalar::from_bytes_mod_order(factor);
    Ok(blinded.compress().to_bytes())
}

/// Descriptor id for one replica:
/// SHA3-256(blinded_pubkey || "store-at-idx" || replica || TP_bytes)
pub fn descriptor_id(blinded_pubkey: &[u8; 32], replica: u8, period: TimePeriod) -> [u8; 32] {
    let mut input = Vec::with_capacity(32 + 12 + 1 + 16);
    input.extend_from_slice(blinded_pubkey);
    input.extend_from_slice(b"store-at-idx");
    input.push(replica);
    input.extend_from_slice(&period.to_bytes());
    sha3_256(&input)
}

/// A relay's position on the HSDir ring
fn relay_ring_index(relay: &Relay) -> Result<[u8; 32]> {
    let identity = crate::protocol::decode_fingerprint(&relay.fingerprint)?;
    let mut input = Vec::with_capacity(8 + 20);
    input.extend_from_slice(b"node-idx");
    input.extend_from_slice(&identity);
    Ok(sha3_256(&input))
}

/// XOR distance between two ring positions, compared lexicographically
fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// The HSDirs responsible for one descriptor id
///
/// All usable HSDir-flagged relays, sorted by XOR distance from the
/// id, truncated to [`N_SPREAD_FETCH`].
pub fn responsible_hsdirs(consensus: &Consensus, desc_id: &[u8; 32]) -> Vec<Relay> {
    let mut ring: Vec<(Relay, [u8; 32])> = consensus
        .usable_relays()
        .filter(|r| r.flags.hs_dir)
        .filter_map(|r| {
            let idx = relay_ring_index(r).ok()?;
            Some((r.clone(), xor_distance(&idx, desc_id)))
        })
        .collect();

    ring.sort_by(|a, b| a.1.cmp(&b.1));
    ring.into_iter()
        .take(N_SPREAD_FETCH)
        .map(|(relay, _)| relay)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RelayFlags;
    use std::collections::BTreeMap;

    #[test]
    fn test_time_period_boundaries() {
        // Exactly at the offset: first second of period 0.
        let tp = TimePeriod::containing(TIME_PERIOD_OFFSET_SECS);
        assert_eq!(tp.number, 0);

        // One second before the next boundary is still the same period.
        let tp2 = TimePeriod::containing(TIME_PERIOD_OFFSET_SECS + TIME_PERIOD_LENGTH_SECS - 1);
        assert_eq!(tp2.number, 0);

        let tp3 = TimePeriod::containing(TIME_PERIOD_OFFSET_SECS + TIME_PERIOD_LENGTH_SECS);
        assert_eq!(tp3.number, 1);

        assert_eq!(tp3.start_secs(), TIME_PERIOD_OFFSET_SECS + TIME_PERIOD_LENGTH_SECS);
        assert_eq!(tp3.end_secs() - tp3.start_secs(), TIME_PERIOD_LENGTH_SECS);
    }

    #[test]
    fn test_blinding_is_deterministic_and_period_dependent() {
        // A valid Ed25519 point: the basepoint compressed.
        let pubkey = curve25519_dalek::constants::ED25519_BASEPOINT_POINT
            .compress()
            .to_bytes();

        let p1 = TimePeriod { number: 100 };
        let p2 = TimePeriod { number: 101 };

        let a = blind_pubkey(&pubkey, p1).unwrap();
        let b = blind_pubkey(&pubkey, p1).unwrap();
        let c = blind_pubkey(&pubkey, p2).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, pubkey);
    }

    #[test]
    fn test_invalid_point_rejected() {
        // All-ones is not a valid compressed Edwards point.
        let bad = [0xFF; 32];
        assert!(blind_pubkey(&bad, TimePeriod { number: 1 }).is_err());
    }

    #[test]
    fn test_descriptor_ids_differ_per_replica() {
        let blinded = [7u8; 32];
        let tp = TimePeriod { number: 5 };
        let id1 = descriptor_id(&blinded, 1, tp);
        let id2 = descriptor_id(&blinded, 2, tp);
        assert_ne!(id1, id2);
        assert_eq!(id1, descriptor_id(&blinded, 1, tp));
    }

    #[test]
    fn test_responsible_hsdirs_sorted_and_bounded() {
        let mut relays = BTreeMap::new();
        for i in 0u8..10 {
            let relay = Relay {
                nickname: format!("hsdir{}", i),
                fingerprint: hex::encode_upper([i + 1; 20]),
                ed_identity: None,
                address: format!("10.0.{}.1", i).parse().unwrap(),
                or_port: 9001,
                dir_port: None,
                flags: RelayFlags::from_string("Fast HSDir Running Stable Valid"),
                bandwidth_weight: 100,
                exit_policy: Default::default(),
                family: Default::default(),
                country_code: None,
                ntor_onion_key: None,
            };
            relays.insert(relay.fingerprint.clone(), relay);
        }
        let consensus = Consensus {
            valid_after: 0,
            fresh_until: u64::MAX,
            valid_until: u64::MAX,
            relays,
            weights: Default::default(),
            authority_signatures: 9,
        };

        let desc_id = [0xAB; 32];
        let dirs = responsible_hsdirs(&consensus, &desc_id);
        assert_eq!(dirs.len(), N_SPREAD_FETCH);

        // Returned relays really are the closest ones.
        let dist = |r: &Relay| xor_distance(&relay_ring_index(r).unwrap(), &desc_id);
        let mut all: Vec<[u8; 32]> = consensus
            .usable_relays()
            .map(|r| dist(r))
            .collect();
        all.sort();
        assert_eq!(dist(&dirs[0]), all[0]);
        assert_eq!(dist(&dirs[1]), all[1]);
        assert_eq!(dist(&dirs[2]), all[2]);
    }
}
