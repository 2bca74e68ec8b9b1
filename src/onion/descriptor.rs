//! Onion-service descriptors
//!
//! Parsing, signature verification and caching of v3 descriptors. A
//! descriptor is signed with the service's blinded key for the current
//! time period; its encrypted body carries the introduction points.

use crate::crypto::{ed25519_verify, hkdf_expand, sha256, Aes128Ctr};
use crate::error::{Result, TorError};
use crate::onion::hsdir::TimePeriod;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix mixed into the descriptor signature
const SIG_PREFIX: &[u8] = b"Tor onion service descriptor sig v3";

/// Info string for deriving the body encryption keys
const ENC_INFO: &[u8] = b"tor-hs-desc-encryption";

/// Shards in the descriptor cache
const CACHE_SHARDS: usize = 8;

/// One link specifier of an introduction point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// IPv4 address and OR port
    Ipv4(IpAddr, u16),
    /// IPv6 address and OR port
    Ipv6(IpAddr, u16),
    /// Legacy RSA identity (SHA-1 fingerprint bytes)
    LegacyId([u8; 20]),
    /// Ed25519 identity
    Ed25519([u8; 32]),
    /// Anything we do not interpret, kept for re-encoding
    Unknown(u8, Vec<u8>),
}

impl LinkSpec {
    /// Encode one specifier as TYPE | LEN | VALUE
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            LinkSpec::Ipv4(IpAddr::V4(addr), port) => {
                out.push(0x00);
                out.push(6);
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpec::Ipv6(IpAddr::V6(addr), port) => {
                out.push(0x01);
                out.push(18);
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpec::LegacyId(id) => {
                out.push(0x02);
                out.push(20);
                out.extend_from_slice(id);
            }
            LinkSpec::Ed25519(id) => {
                out.push(0x03);
                out.push(32);
                out.extend_from_slice(id);
            }
            LinkSpec::Unknown(lstype, value) => {
                out.push(*lstype);
                out.push(value.len() as u8);
                out.extend_from_slice(value);
            }
            // Mis-tagged variants (V6 in Ipv4 etc.) cannot be built by
            // the parser.
            _ => {}
        }
    }
}

/// Parse an NSPEC-prefixed link specifier block
pub fn parse_link_specifiers(data: &[u8]) -> Result<Vec<LinkSpec>> {
    if data.is_empty() {
        return Err(TorError::Cell("empty link specifier block".into()));
    }
    let nspec = data[0] as usize;
    let mut specs = Vec::with_capacity(nspec);
    let mut offset = 1;

    for _ in 0..nspec {
        if offset + 2 > data.len() {
            return Err(TorError::Cell("link specifier truncated".into()));
        }
        let lstype = data[offset];
        let len = data[offset + 1] as usize;
        offset += 2;
        if offset + len > data.len() {
            return Err(TorError::Cell("link specifier body truncated".into()));
        }
        let value = &data[offset..offset + len];
        offset += len;

        let spec = match (lstype, len) {
            (0x00, 6) => LinkSpec::Ipv4(
                IpAddr::from([value[0], value[1], value[2], value[3]]),
                u16::from_be_bytes([value[4], value[5]]),
            ),
            (0x01, 18) => {
                let octets: [u8; 16] = value[..16].try_into().expect("length checked");
                LinkSpec::Ipv6(
                    IpAddr::from(octets),
                    u16::from_be_bytes([value[16], value[17]]),
                )
            }
            (0x02, 20) => LinkSpec::LegacyId(value.try_into().expect("length checked")),
            (0x03, 32) => LinkSpec::Ed25519(value.try_into().expect("length checked")),
            _ => LinkSpec::Unknown(lstype, value.to_vec()),
        };
        specs.push(spec);
    }
    Ok(specs)
}

/// Encode link specifiers with their NSPEC prefix
pub fn encode_link_specifiers(specs: &[LinkSpec]) -> Vec<u8> {
    let mut out = vec![specs.len() as u8];
    for spec in specs {
        spec.encode(&mut out);
    }
    out
}

/// One introduction point from a descriptor
#[derive(Debug, Clone)]
pub struct IntroPoint {
    /// How to reach the intro relay
    pub link_specifiers: Vec<LinkSpec>,

    /// The intro relay's ntor onion key
    pub onion_key: [u8; 32],

    /// The service's authentication key at this intro point
    pub auth_key: [u8; 32],

    /// The service's x25519 encryption key for INTRODUCE1 payloads
    pub enc_key: [u8; 32],
}

impl IntroPoint {
    /// IPv4/IPv6 address of the intro relay, if present
    pub fn addr(&self) -> Option<(IpAddr, u16)> {
        self.link_specifiers.iter().find_map(|s| match s {
            LinkSpec::Ipv4(addr, port) | LinkSpec::Ipv6(addr, port) => Some((*addr, *port)),
            _ => None,
        })
    }

    /// Legacy identity fingerprint of the intro relay, if present
    pub fn legacy_id(&self) -> Option<[u8; 20]> {
        self.link_specifiers.iter().find_map(|s| match s {
            LinkSpec::LegacyId(id) => Some(*id),
            _ => None,
        })
    }
}

/// A parsed and verified v3 descriptor
#[derive(Debug, Clone)]
pub struct OnionDescriptor {
    /// The blinded key this descriptor verified against
    pub blinded_pubkey: [u8; 32],

    /// Monotone per-service revision
    pub revision_counter: u64,

    /// Lifetime in minutes, from publication
    pub lifetime_mins: u64,

    /// Introduction points, in service preference order
    pub intro_points: Vec<IntroPoint>,
}

impl OnionDescriptor {
    /// Parse a descriptor document, verifying its signature against
    /// `blinded_pubkey` and decrypting the body
    pub fn parse_and_verify(text: &str, blinded_pubkey: &[u8; 32]) -> Result<Self> {
        let mut lifetime_mins = 180u64;
        let mut revision_counter: Option<u64> = None;
        let mut body_b64 = String::new();
        let mut signature: Option<Vec<u8>> = None;
        let mut signed_len = 0usize;
        let mut in_message = false;

        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("signature ") {
                signature = Some(
                    STANDARD
                        .decode(rest.trim())
                        .map_err(|_| TorError::Descriptor("bad signature encoding".into()))?,
                );
                break;
            }
            // Everything before the signature line is covered by it.
            signed_len += line.len() + 1;

            if trimmed == "-----BEGIN MESSAGE-----" {
                in_message = true;
            } else if trimmed == "-----END MESSAGE-----" {
                in_message = false;
            } else if in_message {
                body_b64.push_str(trimmed);
            } else if let Some(rest) = trimmed.strip_prefix("descriptor-lifetime ") {
                lifetime_mins = rest
                    .parse()
                    .map_err(|_| TorError::Descriptor("bad descriptor-lifetime".into()))?;
            } else if let Some(rest) = trimmed.strip_prefix("revision-counter ") {
                let value: u64 = rest
                    .parse()
                    .map_err(|_| TorError::Descriptor("bad revision-counter".into()))?;
                if value >= 1 << 63 {
                    return Err(TorError::Descriptor("revision-counter out of range".into()));
                }
                revision_counter = Some(value);
            }
        }

        let signature =
            signature.ok_or_else(|| TorError::Descriptor("descriptor unsigned".into()))?;
        let revision_counter =
            revision_counter.ok_or_else(|| TorError::Descriptor("missing revision".into()))?;

        // Signature covers a fixed prefix plus the document up to the
        // signature line.
        let mut signed = Vec::with_capacity(SIG_PREFIX.len() + signed_len);
        signed.extend_from_slice(SIG_PREFIX);
        signed.extend_from_slice(&text.as_bytes()[..signed_len.min(text.len())]);
        ed25519_verify(blinded_pubkey, &signed, &signature)
            .map_err(|_| TorError::Descriptor("signature does not match blinded key".into()))?;

        let encrypted = STANDARD
            .decode(&body_b64)
            .map_err(|_| TorError::Descriptor("bad body encoding".into()))?;
        let inner = decrypt_body(&encrypted, blinded_pubkey, revision_counter)?;
        let inner = String::from_utf8(inner)
            .map_err(|_| TorError::Descriptor("decrypted body not UTF-8".into()))?;

        let intro_points = parse_intro_points(&inner)?;
        if intro_points.is_empty() {
            return Err(TorError::Descriptor("descriptor has no intro points".into()));
        }

        Ok(Self {
            blinded_pubkey: *blinded_pubkey,
            revision_counter,
            lifetime_mins,
            intro_points,
        })
    }
}

/// Derive the body stream cipher from the blinded key and revision
fn body_cipher(blinded_pubkey: &[u8; 32], revision: u64) -> Result<Aes128Ctr> {
    let mut prk_input = Vec::with_capacity(40);
    prk_input.extend_from_slice(blinded_pubkey);
    prk_input.extend_from_slice(&revision.to_be_bytes());
    let prk = sha256(&prk_input);

    let mut okm = [0u8; 32];
    hkdf_expand(&prk, ENC_INFO, &mut okm)?;
    let (key, iv) = okm.split_at(16);
    Ok(Aes128Ctr::new(key.into(), iv.into()))
}

/// Decrypt the superencrypted descriptor body
fn decrypt_body(encrypted: &[u8], blinded_pubkey: &[u8; 32], revision: u64) -> Result<Vec<u8>> {
    let mut data = encrypted.to_vec();
    body_cipher(blinded_pubkey, revision)?.apply_keystream(&mut data);
    Ok(data)
}

/// Encrypt a descriptor body (test fixtures)
#[cfg(test)]
pub fn encrypt_body(plain: &[u8], blinded_pubkey: &[u8; 32], revision: u64) -> Result<Vec<u8>> {
    decrypt_body(plain, blinded_pubkey, revision)
}

/// Parse the decrypted inner document into intro points
fn parse_intro_points(inner: &str) -> Result<Vec<IntroPoint>> {
    struct Builder {
        link_specifiers: Vec<LinkSpec>,
        onion_key: Option<[u8; 32]>,
        auth_key: Option<[u8; 32]>,
        enc_key: Option<[u8; 32]>,
    }

    let finish = |b: Builder| -> Result<IntroPoint> {
        Ok(IntroPoint {
            link_specifiers: b.link_specifiers,
            onion_key: b
                .onion_key
                .ok_or_else(|| TorError::Descriptor("intro point missing onion-key".into()))?,
            auth_key: b
                .auth_key
                .ok_or_else(|| TorError::Descriptor("intro point missing auth-key".into()))?,
            enc_key: b
                .enc_key
                .ok_or_else(|| TorError::Descriptor("intro point missing enc-key".into()))?,
        })
    };

    let decode32 = |s: &str| -> Result<[u8; 32]> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|_| TorError::Descriptor("bad key encoding in intro point".into()))?;
        bytes
            .try_into()
            .map_err(|_| TorError::Descriptor("intro point key must be 32 bytes".into()))
    };

    let mut points = Vec::new();
    let mut current: Option<Builder> = None;

    for line in inner.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("introduction-point ") {
            if let Some(builder) = current.take() {
                points.push(finish(builder)?);
            }
            let block = STANDARD
                .decode(rest.trim())
                .map_err(|_| TorError::Descriptor("bad link specifier encoding".into()))?;
            current = Some(Builder {
                link_specifiers: parse_link_specifiers(&block)?,
                onion_key: None,
                auth_key: None,
                enc_key: None,
            });
        } else if let Some(rest) = trimmed.strip_prefix("onion-key ntor ") {
            if let Some(b) = current.as_mut() {
                b.onion_key = Some(decode32(rest)?);
            }
        } else if let Some(rest) = trimmed.strip_prefix("auth-key ed25519 ") {
            if let Some(b) = current.as_mut() {
                b.auth_key = Some(decode32(rest)?);
            }
        } else if let Some(rest) = trimmed.strip_prefix("enc-key ntor ") {
            if let Some(b) = current.as_mut() {
                b.enc_key = Some(decode32(rest)?);
            }
        }
    }
    if let Some(builder) = current.take() {
        points.push(finish(builder)?);
    }
    Ok(points)
}

/// One cached descriptor
struct CacheEntry {
    descriptor: std::sync::Arc<OnionDescriptor>,
    expires_at: u64,
}

/// Sharded cache of verified descriptors, keyed by onion address text
pub struct DescriptorCache {
    shards: Vec<Mutex<HashMap<String, CacheEntry>>>,
}

impl Default for DescriptorCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            shards: (0..CACHE_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, CacheEntry>> {
        let mut h = 0usize;
        for b in key.bytes() {
            h = h.wrapping_mul(31).wrapping_add(b as usize);
        }
        &self.shards[h % CACHE_SHARDS]
    }

    /// Look up an unexpired descriptor; expired entries evict lazily
    pub fn get(&self, key: &str) -> Option<std::sync::Arc<OnionDescriptor>> {
        let mut shard = self.shard(key).lock().expect("descriptor cache lock");
        match shard.get(key) {
            Some(entry) if entry.expires_at > now_secs() => Some(entry.descriptor.clone()),
            Some(_) => {
                shard.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a verified descriptor
    ///
    /// The entry lives until its lifetime runs out or the time period
    /// it belongs to ends, whichever comes first.
    pub fn insert(
        &self,
        key: &str,
        descriptor: OnionDescriptor,
        period: TimePeriod,
    ) -> std::sync::Arc<OnionDescriptor> {
        let lifetime_end = now_secs() + descriptor.lifetime_mins * 60;
        let expires_at = lifetime_end.min(period.end_secs());
        let descriptor = std::sync::Arc::new(descriptor);
        self.shard(key)
            .lock()
            .expect("descriptor cache lock")
            .insert(
                key.to_string(),
                CacheEntry {
                    descriptor: descriptor.clone(),
                    expires_at,
                },
            );
        descriptor
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    /// Build a signed descriptor for tests; returns (text, blinded key)
    pub(crate) fn make_descriptor(revision: u64) -> (String, [u8; 32]) {
        let signing = SigningKey::from_bytes(&[0x42; 32]);
        let blinded = signing.verifying_key().to_bytes();

        let specs = vec![
            LinkSpec::Ipv4("198.51.100.7".parse().unwrap(), 9001),
            LinkSpec::LegacyId([0x77; 20]),
        ];
        let inner = format!(
            "create2-formats 2\nintroduction-point {}\nonion-key ntor {}\nauth-key ed25519 {}\nenc-key ntor {}\n",
            STANDARD.encode(encode_link_specifiers(&specs)),
            STANDARD.encode([0x01; 32]),
            STANDARD.encode([0x02; 32]),
            STANDARD.encode([0x03; 32]),
        );
        let encrypted = encrypt_body(inner.as_bytes(), &blinded, revision).unwrap();

        let mut doc = String::new();
        doc.push_str("hs-descriptor 3\n");
        doc.push_str("descriptor-lifetime 180\n");
        doc.push_str(&format!("revision-counter {}\n", revision));
        doc.push_str("superencrypted\n-----BEGIN MESSAGE-----\n");
        doc.push_str(&STANDARD.encode(&encrypted));
        doc.push_str("\n-----END MESSAGE-----\n");

        let mut signed = SIG_PREFIX.to_vec();
        signed.extend_from_slice(doc.as_bytes());
        let sig = signing.sign(&signed);
        doc.push_str(&format!("signature {}\n", STANDARD.encode(sig.to_bytes())));

        (doc, blinded)
    }

    #[test]
    fn test_parse_and_verify_roundtrip() {
        let (doc, blinded) = make_descriptor(7);
        let desc = OnionDescriptor::parse_and_verify(&doc, &blinded).unwrap();

        assert_eq!(desc.revision_counter, 7);
        assert_eq!(desc.intro_points.len(), 1);

        let ip = &desc.intro_points[0];
        assert_eq!(ip.onion_key, [0x01; 32]);
        assert_eq!(ip.auth_key, [0x02; 32]);
        assert_eq!(ip.enc_key, [0x03; 32]);
        assert_eq!(
            ip.addr(),
            Some(("198.51.100.7".parse().unwrap(), 9001))
        );
        assert_eq!(ip.legacy_id(), Some([0x77; 20]));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (doc, _) = make_descriptor(7);
        let wrong = SigningKey::from_bytes(&[0x43; 32]).verifying_key().to_bytes();
        assert!(OnionDescriptor::parse_and_verify(&doc, &wrong).is_err());
    }

    #[test]
    fn test_tampered_descriptor_rejected() {
        let (doc, blinded) = make_descriptor(7);
        let tampered = doc.replace("descriptor-lifetime 180", "descriptor-lifetime 999");
        assert!(OnionDescriptor::parse_and_verify(&tampered, &blinded).is_err());
    }

    #[test]
    fn test_huge_revision_rejected() {
        // Build a document claiming a revision >= 2^63; it must be
        // rejected before any signature checking.
        let (doc, blinded) = make_descriptor(7);
        let tampered = doc.replace("revision-counter 7", "revision-counter 9223372036854775808");
        assert!(OnionDescriptor::parse_and_verify(&tampered, &blinded).is_err());
    }

    #[test]
    fn test_link_specifier_roundtrip() {
        let specs = vec![
            LinkSpec::Ipv4("1.2.3.4".parse().unwrap(), 443),
            LinkSpec::Ed25519([0x99; 32]),
            LinkSpec::Unknown(0x7F, vec![1, 2, 3]),
        ];
        let encoded = encode_link_specifiers(&specs);
        let parsed = parse_link_specifiers(&encoded).unwrap();
        assert_eq!(parsed, specs);
    }

    #[test]
    fn test_cache_expiry() {
        let cache = DescriptorCache::new();
        let (doc, blinded) = make_descriptor(3);
        let desc = OnionDescriptor::parse_and_verify(&doc, &blinded).unwrap();

        // An entry for a period that ended long ago is expired on read.
        cache.insert("addr", desc.clone(), TimePeriod { number: 0 });
        assert!(cache.get("addr").is_none());

        let current = TimePeriod::containing(now_secs());
        cache.insert("addr", desc, current);
        assert!(cache.get("addr").is_some());
        assert!(cache.get("other").is_none());
    }
}
