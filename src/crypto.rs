//! Crypto primitives
//!
//! Thin typed wrappers over the primitives the Tor protocol needs:
//! AES-128-CTR, SHA-1/SHA-256/SHA3-256, HMAC-SHA256, HKDF-SHA256, the
//! legacy KDF-TOR expansion, Ed25519 verification, X25519, constant-time
//! comparison and zeroizing key buffers.
//!
//! SHA-1 appears only because the protocol mandates it for relay-cell
//! running digests and KDF-TOR; every use goes through this module.

use crate::error::{Result, TorError};
use aes::Aes128;
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type used for all relay-cell layers
pub type Aes128Ctr = Ctr128BE<Aes128>;

/// HMAC-SHA256 (ntor transcript MACs)
pub type HmacSha256 = Hmac<Sha256>;

/// SHA-256 digest of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// SHA-1 digest of `data` (legacy; relay digests and KDF-TOR only)
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

/// SHA3-256 digest of `data` (onion addresses, descriptor ids)
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha3_256::digest(data));
    out
}

/// HMAC-SHA256 of `data` under `key`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// HKDF-SHA256 expand: treat `prk` as the pseudorandom key, expand with `info`
pub fn hkdf_expand(prk: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
    let hkdf = Hkdf::<Sha256>::from_prk(prk)
        .map_err(|_| TorError::Crypto("invalid PRK length".into()))?;
    hkdf.expand(info, out)
        .map_err(|_| TorError::Crypto("HKDF output too long".into()))?;
    Ok(())
}

/// Legacy KDF-TOR expansion over SHA-1
///
/// K = H(K0 | [00]) | H(K0 | [01]) | H(K0 | [02]) | ...
/// truncated to `len` bytes. Still required for a few legacy derivations.
pub fn kdf_tor(k0: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 20);
    let mut counter = 0u8;
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(k0);
        hasher.update([counter]);
        out.extend_from_slice(&hasher.finalize());
        counter = counter.wrapping_add(1);
    }
    out.truncate(len);
    out
}

/// Constant-time equality for digests, MACs and authenticators
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Verify an Ed25519 signature
pub fn ed25519_verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|_| TorError::Crypto("invalid Ed25519 public key".into()))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| TorError::Crypto("Ed25519 signature must be 64 bytes".into()))?;
    let sig = Signature::from_bytes(&sig_bytes);
    key.verify(message, &sig)
        .map_err(|_| TorError::Crypto("Ed25519 signature verification failed".into()))
}

/// A fixed-size secret that zeroizes on drop and cannot be cloned
///
/// Hop key material and ntor ephemeral secrets live in these.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBuf<const N: usize>(pub(crate) [u8; N]);

impl<const N: usize> SecretBuf<N> {
    /// Wrap a secret, taking ownership
    pub fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// Borrow the secret bytes
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> std::fmt::Debug for SecretBuf<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBuf<{}>([redacted])", N)
    }
}

/// Fill `buf` with OS randomness; RNG failure is unrecoverable
pub fn rand_bytes(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf).map_err(|e| TorError::Crypto(format!("RNG failure: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("abc")
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha1_known_vector() {
        let digest = sha1(b"abc");
        assert_eq!(hex::encode(digest), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_kdf_tor_deterministic_and_prefix_stable() {
        let short = kdf_tor(b"seed", 20);
        let long = kdf_tor(b"seed", 60);
        assert_eq!(short.len(), 20);
        assert_eq!(long.len(), 60);
        assert_eq!(&long[..20], &short[..]);

        // First block is H(K0 | [00])
        let mut hasher = Sha1::new();
        hasher.update(b"seed");
        hasher.update([0u8]);
        assert_eq!(&long[..20], hasher.finalize().as_slice());
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"same", b"same"));
        assert!(!ct_eq(b"same", b"diff"));
        assert!(!ct_eq(b"short", b"longer"));
    }

    #[test]
    fn test_hkdf_expand_rejects_long_output() {
        let prk = sha256(b"prk material");
        let mut out = vec![0u8; 32 * 256];
        assert!(hkdf_expand(&prk, b"info", &mut out).is_err());
    }

    #[test]
    fn test_secret_buf_redacted_debug() {
        let secret = SecretBuf::new([7u8; 16]);
        assert!(!format!("{:?}", secret).contains('7'));
    }
}
