//! Onion-service client flow
//!
//! Turns a parsed v3 address into a connected stream: fetch the
//! service descriptor from its responsible HSDirs, establish a
//! rendezvous point, introduce ourselves through one of the service's
//! intro points, and join the service at the rendezvous, extending the
//! rendezvous circuit by one virtual hop with the derived keys.

use crate::crypto::{hkdf_expand, hmac_sha256, rand_bytes, sha256, Aes128Ctr};
use crate::error::{Result, TorError};
use crate::onion::address::OnionAddressV3;
use crate::onion::descriptor::{
    encode_link_specifiers, DescriptorCache, IntroPoint, LinkSpec, OnionDescriptor,
};
use crate::onion::hsdir::{blind_pubkey, descriptor_id, responsible_hsdirs, TimePeriod, N_REPLICAS};
use crate::pool::CircuitManager;
use crate::protocol::{
    parse_http_response, Circuit, CircuitPurpose, DirectoryClient, HopKeys, Relay, RelayCell,
    RelayCommand, StreamManager, Target, TorStream,
};
use crate::storage::Storage;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use x25519_dalek::{PublicKey, StaticSecret};

/// Deadline for the whole descriptor fetch (all replicas)
const DESC_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline from ESTABLISH_RENDEZVOUS to RENDEZVOUS2, per intro point
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(30);

/// hs-ntor domain separation
const HS_PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
const HS_T_ENC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
const HS_T_KEY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";
const HS_T_MAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";

/// Client for v3 onion services
pub struct OnionClient {
    manager: Arc<CircuitManager>,
    directory: Arc<DirectoryClient>,
    storage: Arc<Storage>,
    cache: DescriptorCache,
}

impl OnionClient {
    /// Create a client
    pub fn new(
        manager: Arc<CircuitManager>,
        directory: Arc<DirectoryClient>,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            manager,
            directory,
            storage,
            cache: DescriptorCache::new(),
        }
    }

    /// Connect to `address:port`
    pub async fn connect(&self, address: &OnionAddressV3, port: u16) -> Result<TorStream> {
        let descriptor = self.descriptor_for(address).await?;

        let mut last_err = TorError::OnionUnreachable(format!("{}: no intro points", address));
        for (idx, intro) in descriptor.intro_points.iter().enumerate() {
            log::debug!(
                "{}: trying intro point {}/{}",
                address,
                idx + 1,
                descriptor.intro_points.len()
            );
            let attempt = self.rendezvous_with(intro);
            match tokio::time::timeout(RENDEZVOUS_TIMEOUT, attempt).await {
                Ok(Ok(circuit)) => {
                    let target = Target::OnionV3(address.clone(), port);
                    return StreamManager::new(circuit).begin(&target).await;
                }
                Ok(Err(e)) => {
                    log::debug!("{}: intro point {} failed: {}", address, idx + 1, e);
                    last_err = e;
                }
                Err(_) => {
                    last_err = TorError::Timeout("introduction");
                }
            }
        }

        Err(TorError::OnionUnreachable(format!(
            "{}: all intro points failed ({})",
            address, last_err
        )))
    }

    /// The service descriptor, from cache or the HSDir ring
    pub async fn descriptor_for(&self, address: &OnionAddressV3) -> Result<Arc<OnionDescriptor>> {
        let key = address.to_string();
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let fetch = self.fetch_descriptor(address);
        match tokio::time::timeout(DESC_FETCH_TIMEOUT, fetch).await {
            Ok(res) => res,
            Err(_) => Err(TorError::Timeout("descriptor fetch")),
        }
    }

    /// Fetch, verify and cache the descriptor from responsible HSDirs
    async fn fetch_descriptor(&self, address: &OnionAddressV3) -> Result<Arc<OnionDescriptor>> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let period = TimePeriod::containing(now);
        let blinded = blind_pubkey(address.pubkey(), period)?;
        let consensus = self.directory.current()?;
        let cache_key = hs_cache_key(address, period);

        // On-disk copy first; it still has to verify.
        if let Ok(Some(text)) = self.storage.load_hs_descriptor(&cache_key) {
            if let Ok(desc) = OnionDescriptor::parse_and_verify(&text, &blinded) {
                log::debug!("{}: descriptor loaded from disk cache", address);
                return Ok(self.cache.insert(&address.to_string(), desc, period));
            }
        }

        let mut last_err = TorError::Descriptor("no HSDir reachable".into());
        for replica in 1..=N_REPLICAS {
            let desc_id = descriptor_id(&blinded, replica, period);
            let hsdirs = responsible_hsdirs(&consensus, &desc_id);
            if hsdirs.is_empty() {
                last_err = TorError::PathInsufficient { position: "hsdir" };
                continue;
            }

            for hsdir in &hsdirs {
                match self.fetch_from_hsdir(hsdir, &blinded).await {
                    Ok(text) => match OnionDescriptor::parse_and_verify(&text, &blinded) {
                        Ok(desc) => {
                            if let Err(e) = self.storage.save_hs_descriptor(&cache_key, &text) {
                                log::debug!("hs descriptor not cached to disk: {}", e);
                            }
                            log::info!(
                                "{}: descriptor fetched (replica {}, {} intro points)",
                                address,
                                replica,
                                desc.intro_points.len()
                            );
                            return Ok(self.cache.insert(&address.to_string(), desc, period));
                        }
                        Err(e) => {
                            log::debug!("{}: bad descriptor from {}: {}", address, hsdir.nickname, e);
                            last_err = e;
                        }
                    },
                    Err(e) => {
                        log::debug!("{}: fetch from {} failed: {}", address, hsdir.nickname, e);
                        last_err = e;
                    }
                }
            }
        }

        Err(match last_err {
            e @ TorError::PathInsufficient { .. } => e,
            e => TorError::Descriptor(format!("descriptor not found: {}", e)),
        })
    }

    /// One descriptor request over a directory circuit ending at `hsdir`
    async fn fetch_from_hsdir(&self, hsdir: &Relay, blinded: &[u8; 32]) -> Result<String> {
        let circuit = self
            .manager
            .build_circuit(CircuitPurpose::Directory, None, Some(hsdir))
            .await?;

        let mut stream = StreamManager::new(Arc::clone(&circuit)).begin_dir().await?;
        let request = format!(
            "GET /tor/hs/3/{} HTTP/1.0\r\nHost: onion\r\n\r\n",
            STANDARD.encode(blinded)
        );
        stream.write_all(request.as_bytes()).await?;
        let response = stream.read_to_end().await?;
        stream.close().await;
        circuit.close(9).await;

        let body = parse_http_response(&response)?;
        String::from_utf8(body).map_err(|_| TorError::Descriptor("descriptor not UTF-8".into()))
    }

    /// Establish a rendezvous and introduce through `intro`
    ///
    /// On success the returned circuit has been extended with the
    /// service hop and is ready for BEGIN.
    async fn rendezvous_with(&self, intro: &IntroPoint) -> Result<Arc<Circuit>> {
        // 1. Rendezvous circuit; its last hop is our rendezvous point.
        let rend_circuit = self
            .manager
            .build_circuit(CircuitPurpose::Rendezvous, None, None)
            .await?;
        let mut rend_rx = rend_circuit.register_control_stream();

        let rend_point = {
            let fp = rend_circuit
                .path
                .last()
                .cloned()
                .ok_or_else(|| TorError::Internal("rendezvous circuit has no hops".into()))?;
            self.directory
                .relay(&fp)
                .ok_or_else(|| TorError::Internal("rendezvous point left consensus".into()))?
        };

        let mut cookie = [0u8; 20];
        rand_bytes(&mut cookie)?;
        rend_circuit
            .send_relay_cell(RelayCell::new(
                RelayCommand::EstablishRendezvous,
                0,
                cookie.to_vec(),
            ))
            .await?;
        expect_control(&mut rend_rx, RelayCommand::RendezvousEstablished).await?;
        log::debug!("rendezvous established at {}", rend_point.nickname);

        // 2. Intro circuit to the service's intro point.
        let intro_relay = self.intro_relay(intro)?;
        let intro_circuit = self
            .manager
            .build_circuit(CircuitPurpose::Intro, None, Some(&intro_relay))
            .await?;
        let mut intro_rx = intro_circuit.register_control_stream();

        let handshake = IntroHandshake::new(intro);
        let introduce1 = handshake.introduce1_payload(&cookie, &rend_point)?;
        intro_circuit
            .send_relay_cell(RelayCell::new(RelayCommand::Introduce1, 0, introduce1))
            .await?;

        let ack = expect_control(&mut intro_rx, RelayCommand::IntroduceAck).await?;
        intro_circuit.close(9).await;
        let status = match ack.data.as_slice() {
            [] => 0,
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            [single] => u16::from(*single),
        };
        if status != 0 {
            return Err(TorError::OnionUnreachable(format!(
                "intro point refused introduction (status {})",
                status
            )));
        }

        // 3. The service meets us at the rendezvous point.
        let rendezvous2 = expect_control(&mut rend_rx, RelayCommand::Rendezvous2).await?;
        let keys = handshake.complete(&rendezvous2.data)?;
        rend_circuit
            .append_hop(keys, hex::encode_upper(intro.auth_key))
            .await?;
        rend_circuit.remove_stream(0);

        log::info!("rendezvous joined via {}", rend_point.nickname);
        Ok(rend_circuit)
    }

    /// Resolve an intro point to a connectable relay
    ///
    /// Preferred: the consensus entry for its legacy identity. When the
    /// relay is not listed, a minimal relay record is synthesized from
    /// the link specifiers and the descriptor's onion key.
    fn intro_relay(&self, intro: &IntroPoint) -> Result<Relay> {
        if let Some(id) = intro.legacy_id() {
            let fp = hex::encode_upper(id);
            if let Some(mut relay) = self.directory.relay(&fp) {
                if relay.ntor_onion_key.is_none() {
                    relay.ntor_onion_key = Some(STANDARD.encode(intro.onion_key));
                }
                return Ok(relay);
            }
        }

        let (addr, port) = intro
            .addr()
            .ok_or_else(|| TorError::Descriptor("intro point has no address".into()))?;
        let id = intro
            .legacy_id()
            .ok_or_else(|| TorError::Descriptor("intro point has no identity".into()))?;

        Ok(Relay {
            nickname: "intro-point".into(),
            fingerprint: hex::encode_upper(id),
            ed_identity: None,
            address: addr,
            or_port: port,
            dir_port: None,
            flags: Default::default(),
            bandwidth_weight: 0,
            exit_policy: Default::default(),
            family: Default::default(),
            country_code: None,
            ntor_onion_key: Some(STANDARD.encode(intro.onion_key)),
        })
    }
}

/// Await one circuit-level reply on a control stream
async fn expect_control(
    rx: &mut mpsc::Receiver<RelayCell>,
    expected: RelayCommand,
) -> Result<RelayCell> {
    loop {
        let Some(cell) = rx.recv().await else {
            return Err(TorError::CircuitClosed("circuit closed while waiting".into()));
        };
        if cell.command == expected {
            return Ok(cell);
        }
        match cell.command {
            RelayCommand::Truncated | RelayCommand::End => {
                return Err(TorError::OnionUnreachable(format!(
                    "circuit interrupted by {:?}",
                    cell.command
                )));
            }
            other => {
                log::debug!("ignoring {:?} while waiting for {:?}", other, expected);
            }
        }
    }
}

/// Client state for one introduction (x25519 + AES-CTR + HMAC)
struct IntroHandshake {
    eph_secret: StaticSecret,
    eph_public: PublicKey,
    service_enc_key: PublicKey,
    auth_key: [u8; 32],
}

impl IntroHandshake {
    fn new(intro: &IntroPoint) -> Self {
        let eph_secret = StaticSecret::random_from_rng(OsRng);
        let eph_public = PublicKey::from(&eph_secret);
        Self {
            eph_secret,
            eph_public,
            service_enc_key: PublicKey::from(intro.enc_key),
            auth_key: intro.auth_key,
        }
    }

    /// Encryption and MAC keys for the INTRODUCE1 payload
    fn intro_keys(&self) -> Result<([u8; 16], [u8; 16], [u8; 32])> {
        let shared = self.eph_secret.diffie_hellman(&self.service_enc_key);

        let mut prk_input = Vec::with_capacity(32 * 3 + HS_T_ENC.len());
        prk_input.extend_from_slice(HS_T_ENC);
        prk_input.extend_from_slice(shared.as_bytes());
        prk_input.extend_from_slice(&self.auth_key);
        prk_input.extend_from_slice(self.eph_public.as_bytes());
        let prk = sha256(&prk_input);

        let mut okm = [0u8; 64];
        hkdf_expand(&prk, HS_PROTOID, &mut okm)?;

        let mut enc_key = [0u8; 16];
        let mut iv = [0u8; 16];
        let mut mac_key = [0u8; 32];
        enc_key.copy_from_slice(&okm[0..16]);
        iv.copy_from_slice(&okm[16..32]);
        mac_key.copy_from_slice(&okm[32..64]);
        Ok((enc_key, iv, mac_key))
    }

    /// Build the INTRODUCE1 body
    ///
    /// Header: LEGACY_KEY_ID (20 zeros) | AUTH_KEY_TYPE | AUTH_KEY_LEN |
    /// AUTH_KEY | N_EXT=0. Encrypted part: CLIENT_PK | E(plaintext) |
    /// MAC, where the plaintext carries the rendezvous cookie, the
    /// rendezvous point's onion key and its link specifiers.
    fn introduce1_payload(&self, cookie: &[u8; 20], rend_point: &Relay) -> Result<Vec<u8>> {
        let rend_onion_key = crate::protocol::decode_ntor_key(rend_point)?;
        let rend_specs = vec![
            match rend_point.address {
                std::net::IpAddr::V4(_) => {
                    LinkSpec::Ipv4(rend_point.address, rend_point.or_port)
                }
                std::net::IpAddr::V6(_) => {
                    LinkSpec::Ipv6(rend_point.address, rend_point.or_port)
                }
            },
            LinkSpec::LegacyId(crate::protocol::decode_fingerprint(&rend_point.fingerprint)?),
        ];

        let mut plaintext = Vec::with_capacity(64 + 32);
        plaintext.extend_from_slice(cookie);
        plaintext.push(0); // N_EXT
        plaintext.push(0x01); // ONION_KEY_TYPE: ntor
        plaintext.extend_from_slice(&32u16.to_be_bytes());
        plaintext.extend_from_slice(&rend_onion_key);
        plaintext.extend_from_slice(&encode_link_specifiers(&rend_specs));

        let (enc_key, iv, mac_key) = self.intro_keys()?;
        let mut ciphertext = plaintext;
        Aes128Ctr::new((&enc_key).into(), (&iv).into()).apply_keystream(&mut ciphertext);

        let mut out = Vec::with_capacity(64 + ciphertext.len() + 64);
        out.extend_from_slice(&[0u8; 20]); // LEGACY_KEY_ID: none
        out.push(0x02); // AUTH_KEY_TYPE: ed25519
        out.extend_from_slice(&32u16.to_be_bytes());
        out.extend_from_slice(&self.auth_key);
        out.push(0); // N_EXT
        out.extend_from_slice(self.eph_public.as_bytes());
        out.extend_from_slice(&ciphertext);

        let mac = hmac_sha256(&mac_key, &out);
        out.extend_from_slice(&mac);
        Ok(out)
    }

    /// Complete the handshake with the service's RENDEZVOUS2 reply
    /// (`Y || AUTH`) and derive the virtual hop's keys
    fn complete(&self, reply: &[u8]) -> Result<HopKeys> {
        if reply.len() < 64 {
            return Err(TorError::Cell("RENDEZVOUS2 reply too short".into()));
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[0..32]);
        let service_public = PublicKey::from(y_bytes);
        let auth = &reply[32..64];

        let shared_b = self.eph_secret.diffie_hellman(&self.service_enc_key);
        let shared_y = self.eph_secret.diffie_hellman(&service_public);

        let mut secret_input = Vec::with_capacity(32 * 5 + HS_PROTOID.len());
        secret_input.extend_from_slice(shared_y.as_bytes());
        secret_input.extend_from_slice(shared_b.as_bytes());
        secret_input.extend_from_slice(&self.auth_key);
        secret_input.extend_from_slice(self.eph_public.as_bytes());
        secret_input.extend_from_slice(service_public.as_bytes());
        secret_input.extend_from_slice(HS_PROTOID);

        let expected_auth = hmac_sha256(HS_T_MAC, &secret_input);
        if !crate::crypto::ct_eq(&expected_auth, auth) {
            return Err(TorError::AuthVerificationFailed(
                "RENDEZVOUS2 AUTH mismatch".into(),
            ));
        }

        let key_seed = hmac_sha256(HS_T_KEY, &secret_input);
        HopKeys::derive(&key_seed)
    }
}

/// Disk-cache key for a descriptor: address body + period number
fn hs_cache_key(address: &OnionAddressV3, period: TimePeriod) -> String {
    let text = address.to_string();
    let body = text.strip_suffix(".onion").unwrap_or(&text);
    format!("{}_{}", body, period.number)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_intro() -> IntroPoint {
        IntroPoint {
            link_specifiers: vec![
                LinkSpec::Ipv4("203.0.113.5".parse().unwrap(), 9001),
                LinkSpec::LegacyId([0x55; 20]),
            ],
            onion_key: [0x01; 32],
            auth_key: [0x02; 32],
            enc_key: *PublicKey::from(&StaticSecret::from([0x03; 32])).as_bytes(),
        }
    }

    fn rend_relay() -> Relay {
        Relay {
            nickname: "rendpoint".into(),
            fingerprint: "CD".repeat(20),
            ed_identity: None,
            address: "198.51.100.1".parse().unwrap(),
            or_port: 443,
            dir_port: None,
            flags: Default::default(),
            bandwidth_weight: 100,
            exit_policy: Default::default(),
            family: Default::default(),
            country_code: None,
            ntor_onion_key: Some(STANDARD.encode([0x0A; 32])),
        }
    }

    #[test]
    fn test_introduce1_layout() {
        let intro = test_intro();
        let handshake = IntroHandshake::new(&intro);
        let cookie = [0x44u8; 20];
        let payload = handshake.introduce1_payload(&cookie, &rend_relay()).unwrap();

        // LEGACY_KEY_ID is zeroed.
        assert_eq!(&payload[0..20], &[0u8; 20]);
        // AUTH_KEY_TYPE ed25519, 32-byte key.
        assert_eq!(payload[20], 0x02);
        assert_eq!(&payload[21..23], &32u16.to_be_bytes());
        assert_eq!(&payload[23..55], &intro.auth_key);
        assert_eq!(payload[55], 0);
        // Client public key follows the header.
        assert_eq!(&payload[56..88], handshake.eph_public.as_bytes());
        // MAC trails the payload.
        assert!(payload.len() > 88 + 32);
    }

    #[test]
    fn test_introduce1_mac_binds_payload() {
        let intro = test_intro();
        let handshake = IntroHandshake::new(&intro);
        let payload = handshake
            .introduce1_payload(&[0x44; 20], &rend_relay())
            .unwrap();

        let (_, _, mac_key) = handshake.intro_keys().unwrap();
        let body_len = payload.len() - 32;
        let expected = hmac_sha256(&mac_key, &payload[..body_len]);
        assert_eq!(&payload[body_len..], &expected);
    }

    #[test]
    fn test_rendezvous_completion_against_mirrored_service() {
        let intro = test_intro();
        let service_enc_secret = StaticSecret::from([0x03; 32]);
        let handshake = IntroHandshake::new(&intro);
        let client_pk = *handshake.eph_public.as_bytes();

        // The service derives the same secret_input from its side.
        let service_eph = StaticSecret::from([0x07; 32]);
        let service_eph_pub = PublicKey::from(&service_eph);

        let shared_b = service_enc_secret.diffie_hellman(&PublicKey::from(client_pk));
        let shared_y = service_eph.diffie_hellman(&PublicKey::from(client_pk));

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(shared_y.as_bytes());
        secret_input.extend_from_slice(shared_b.as_bytes());
        secret_input.extend_from_slice(&intro.auth_key);
        secret_input.extend_from_slice(&client_pk);
        secret_input.extend_from_slice(service_eph_pub.as_bytes());
        secret_input.extend_from_slice(HS_PROTOID);

        let auth = hmac_sha256(HS_T_MAC, &secret_input);
        let service_seed = hmac_sha256(HS_T_KEY, &secret_input);

        let mut reply = Vec::new();
        reply.extend_from_slice(service_eph_pub.as_bytes());
        reply.extend_from_slice(&auth);

        let client_keys = handshake.complete(&reply).unwrap();
        let service_keys = HopKeys::derive(&service_seed).unwrap();
        assert_eq!(client_keys.forward_key, service_keys.forward_key);
        assert_eq!(client_keys.backward_key, service_keys.backward_key);
    }

    #[test]
    fn test_rendezvous_bad_auth_rejected() {
        let intro = test_intro();
        let handshake = IntroHandshake::new(&intro);
        let mut reply = vec![0u8; 64];
        reply[0] = 9; // arbitrary Y
        assert!(matches!(
            handshake.complete(&reply),
            Err(TorError::AuthVerificationFailed(_))
        ));
    }

    #[test]
    fn test_hs_cache_key_changes_with_period() {
        let addr = OnionAddressV3::parse(
            "vww6ybal4bd7szmgncyruucpgfkqahzddi37ktceo3ah7ngmcopnpyyd.onion",
        )
        .unwrap();
        let a = hs_cache_key(&addr, TimePeriod { number: 10 });
        let b = hs_cache_key(&addr, TimePeriod { number: 11 });
        assert_ne!(a, b);
        assert!(a.ends_with("_10"));
    }
}
