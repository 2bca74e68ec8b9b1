//! Cross-module state behavior: guard persistence, consensus expiry,
//! isolation and onion addresses

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tor_native::config::IsolationFlags;
use tor_native::guards::GuardManager;
use tor_native::isolation::{IsolationKey, RequestAttrs};
use tor_native::onion::OnionAddressV3;
use tor_native::protocol::ConsensusParser;
use tor_native::storage::Storage;

const LITERAL_ONION: &str = "vww6ybal4bd7szmgncyruucpgfkqahzddi37ktceo3ah7ngmcopnpyyd.onion";

#[test]
fn guard_set_survives_restart_with_confirmations() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(Storage::open(dir.path()).unwrap());

    let alpha = "A".repeat(40);
    let beta = "B".repeat(40);

    {
        let guards = GuardManager::load(Arc::clone(&storage), 60).unwrap();
        guards.add_unconfirmed(&alpha, "10.0.0.1:9001").unwrap();
        guards.add_unconfirmed(&beta, "10.0.0.2:9001").unwrap();
        guards.record_success(&alpha).unwrap();
    }

    // A fresh manager sees the same set, confirmation flags included,
    // and keeps preferring the confirmed guard.
    let guards = GuardManager::load(storage, 60).unwrap();
    assert_eq!(guards.len(), 2);
    let (picked, addr) = guards.pick(|_| true).unwrap();
    assert_eq!(picked, alpha);
    assert_eq!(addr, "10.0.0.1:9001");
}

#[test]
fn consensus_one_second_past_valid_until_is_unusable() {
    let doc = "\
network-status-version 3
valid-after 2026-01-01 00:00:00
fresh-until 2026-01-01 01:00:00
valid-until 2026-01-01 03:00:00
";
    let consensus = ConsensusParser::parse_text(doc).unwrap();

    let valid_until = consensus.valid_until;
    let just_before = UNIX_EPOCH + Duration::from_secs(valid_until - 1);
    let just_after = UNIX_EPOCH + Duration::from_secs(valid_until + 1);

    assert!(consensus.is_valid(just_before, Duration::ZERO));
    assert!(!consensus.is_valid(just_after, Duration::ZERO));
}

#[test]
fn socks_usernames_isolate_when_configured() {
    let isolating = IsolationFlags {
        by_socks_auth: true,
        ..Default::default()
    };
    let shared = IsolationFlags {
        by_socks_auth: false,
        ..Default::default()
    };

    let request = |auth: &str| RequestAttrs {
        dest_addr: "example.com".into(),
        dest_port: 443,
        socks_auth: Some(auth.to_string()),
        client_port: 40000,
        client_proto: "socks5-auth",
    };

    // With the flag on, alice and bob must never share a circuit key.
    let alice = IsolationKey::from_request(&isolating, &request("alice:x"));
    let bob = IsolationKey::from_request(&isolating, &request("bob:x"));
    assert_ne!(alice, bob);

    // With it off, they may share.
    let alice = IsolationKey::from_request(&shared, &request("alice:x"));
    let bob = IsolationKey::from_request(&shared, &request("bob:x"));
    assert_eq!(alice, bob);
}

#[test]
fn literal_onion_address_parses_and_checksums() {
    let addr = OnionAddressV3::parse(LITERAL_ONION).unwrap();

    // The pubkey is the 32-byte prefix of the base32 decode, and the
    // stored checksum matches a recomputation from (pubkey, 0x03).
    let decoded = data_encoding::BASE32_NOPAD
        .decode(
            LITERAL_ONION
                .strip_suffix(".onion")
                .unwrap()
                .to_uppercase()
                .as_bytes(),
        )
        .unwrap();
    assert_eq!(addr.pubkey().as_slice(), &decoded[..32]);
    assert_eq!(
        OnionAddressV3::checksum(addr.pubkey()),
        [decoded[32], decoded[33]]
    );
}

#[test]
fn onion_descriptor_period_is_stable_within_a_day() {
    use tor_native::onion::TimePeriod;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let period = TimePeriod::containing(now);

    assert!(period.start_secs() <= now);
    assert!(now < period.end_secs());

    // Blinded keys are stable within the period and change across it.
    let addr = OnionAddressV3::parse(LITERAL_ONION).unwrap();
    let a = tor_native::onion::blind_pubkey(addr.pubkey(), period).unwrap();
    let b = tor_native::onion::blind_pubkey(addr.pubkey(), period).unwrap();
    let next = tor_native::onion::blind_pubkey(
        addr.pubkey(),
        TimePeriod {
            number: period.number + 1,
        },
    )
    .unwrap();
    assert_eq!(a, b);
    assert_ne!(a, next);
}
