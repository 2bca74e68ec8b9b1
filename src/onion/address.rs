//! v3 onion addresses
//!
//! A v3 address is base32("pubkey || checksum || version") + ".onion",
//! 56 characters of base32 for 35 bytes: a 32-byte Ed25519 public key,
//! a 2-byte truncated SHA3-256 checksum, and the version byte 0x03.

use crate::crypto::sha3_256;
use crate::error::{Result, TorError};
use data_encoding::BASE32_NOPAD;

/// Length of the base32 part of a v3 address
pub const V3_ADDR_LEN: usize = 56;

/// Domain-separation prefix for the checksum
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// Version byte of a v3 address
const V3_VERSION: u8 = 0x03;

/// A parsed v3 onion address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnionAddressV3 {
    /// The service's Ed25519 identity public key
    pubkey: [u8; 32],

    /// Canonical textual form, without ".onion"
    text: String,
}

impl OnionAddressV3 {
    /// Parse "<56 chars>.onion" (the suffix is optional)
    pub fn parse(address: &str) -> Result<Self> {
        let lowered = address.trim_end_matches('.').to_lowercase();
        let body = lowered
            .strip_suffix(".onion")
            .unwrap_or(&lowered)
            .to_string();

        if body.len() != V3_ADDR_LEN {
            return Err(TorError::BadOnionAddress(format!(
                "expected {} base32 chars, got {}",
                V3_ADDR_LEN,
                body.len()
            )));
        }

        let decoded = BASE32_NOPAD
            .decode(body.to_uppercase().as_bytes())
            .map_err(|_| TorError::BadOnionAddress("invalid base32".into()))?;
        if decoded.len() != 35 {
            return Err(TorError::BadOnionAddress(format!(
                "decoded to {} bytes, expected 35",
                decoded.len()
            )));
        }

        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&decoded[0..32]);
        let checksum = [decoded[32], decoded[33]];
        let version = decoded[34];

        if version != V3_VERSION {
            return Err(TorError::BadOnionAddress(format!(
                "unsupported version {}",
                version
            )));
        }
        if checksum != Self::checksum(&pubkey) {
            return Err(TorError::BadOnionAddress("checksum mismatch".into()));
        }

        Ok(Self { pubkey, text: body })
    }

    /// The 2-byte checksum for a pubkey:
    /// SHA3-256(".onion checksum" || pubkey || 0x03)[..2]
    pub fn checksum(pubkey: &[u8; 32]) -> [u8; 2] {
        let mut input = Vec::with_capacity(CHECKSUM_PREFIX.len() + 33);
        input.extend_from_slice(CHECKSUM_PREFIX);
        input.extend_from_slice(pubkey);
        input.push(V3_VERSION);
        let digest = sha3_256(&input);
        [digest[0], digest[1]]
    }

    /// The service's identity public key
    pub fn pubkey(&self) -> &[u8; 32] {
        &self.pubkey
    }

    /// Whether a hostname looks like a v3 onion address
    pub fn is_onion_hostname(host: &str) -> bool {
        host.trim_end_matches('.')
            .to_lowercase()
            .ends_with(".onion")
    }
}

impl std::fmt::Display for OnionAddressV3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.onion", self.text)
    }
}
