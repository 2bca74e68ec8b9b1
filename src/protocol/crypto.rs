//! Per-hop relay crypto
//!
//! Each hop of a circuit owns four pieces of evolving state: a forward and
//! a backward AES-128-CTR cipher, and a forward and a backward running
//! SHA-1 digest. Outbound relay cells are digested at the target hop and
//! then encrypted once per hop from the inside out; inbound cells are
//! decrypted hop by hop and tested for recognition after each layer.
//!
//! Key material is zeroized on drop and the key-carrying types cannot be
//! cloned.

use crate::crypto::{ct_eq, hkdf_expand, Aes128Ctr};
use crate::error::Result;
use crate::protocol::cell::Cell;
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha1::{Digest, Sha1};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF info string for the ntor key expansion
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Key material for one hop, as produced by the ntor KDF
///
/// Layout per the ntor spec: Df (20) | Db (20) | Kf (16) | Kb (16).
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Forward digest seed
    pub forward_digest_seed: [u8; 20],

    /// Backward digest seed
    pub backward_digest_seed: [u8; 20],

    /// Forward encryption key (client -> relay)
    pub forward_key: [u8; 16],

    /// Backward encryption key (relay -> client)
    pub backward_key: [u8; 16],
}

impl HopKeys {
    /// Expand a 32-byte KEY_SEED into the 72 bytes of hop key material
    pub fn derive(key_seed: &[u8; 32]) -> Result<Self> {
        let mut okm = [0u8; 72];
        hkdf_expand(key_seed, M_EXPAND, &mut okm)?;

        let mut keys = HopKeys {
            forward_digest_seed: [0u8; 20],
            backward_digest_seed: [0u8; 20],
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
        };
        keys.forward_digest_seed.copy_from_slice(&okm[0..20]);
        keys.backward_digest_seed.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        okm.zeroize();
        Ok(keys)
    }
}

/// Evolving crypto state for one hop of a circuit
///
/// Owned exclusively by its circuit; there is deliberately no way to
/// clone one. The raw keys stay inside [`HopKeys`] so they are zeroized
/// when the hop is dropped.
pub struct HopState {
    /// Hex fingerprint of the relay at this hop (public metadata)
    pub fingerprint: String,

    /// Key material, retained for zeroization on drop
    keys: HopKeys,

    /// Forward AES-CTR cipher (maintained across cells)
    forward_cipher: Aes128Ctr,

    /// Backward AES-CTR cipher (maintained across cells)
    backward_cipher: Aes128Ctr,

    /// Running digest over cells we originate for this hop
    forward_digest: Sha1,

    /// Running digest over cells this hop originates toward us
    backward_digest: Sha1,
}

impl HopState {
    /// Build hop state from freshly derived keys
    ///
    /// CTR IVs start at zero and the running digests are seeded with the
    /// Df/Db values from the KDF.
    pub fn new(keys: HopKeys, fingerprint: String) -> Self {
        let zero_iv = [0u8; 16];
        let forward_cipher = Aes128Ctr::new((&keys.forward_key).into(), (&zero_iv).into());
        let backward_cipher = Aes128Ctr::new((&keys.backward_key).into(), (&zero_iv).into());

        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest_seed);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest_seed);

        Self {
            fingerprint,
            keys,
            forward_cipher,
            backward_cipher,
            forward_digest,
            backward_digest,
        }
    }

    /// Digest an outbound relay payload destined for this hop
    ///
    /// `payload` is the full 509-byte relay payload with its digest field
    /// already zeroed. The running digest is updated over the whole
    /// payload, padding included, and the low 4 bytes are written into
    /// the digest field.
    pub fn seal_forward(&mut self, payload: &mut [u8]) {
        debug_assert_eq!(payload.len(), Cell::PAYLOAD_LEN);
        debug_assert_eq!(&payload[5..9], &[0u8; 4]);

        self.forward_digest.update(&*payload);
        let digest = self.forward_digest.clone().finalize();
        payload[5..9].copy_from_slice(&digest[..4]);
    }

    /// Apply one forward encryption layer
    pub fn encrypt_forward(&mut self, payload: &mut [u8]) {
        self.forward_cipher.apply_keystream(payload);
    }

    /// Remove one backward encryption layer
    pub fn decrypt_backward(&mut self, payload: &mut [u8]) {
        self.backward_cipher.apply_keystream(payload);
    }

    /// Test whether a fully or partially peeled payload originates here
    ///
    /// A cell is recognized by this hop iff its recognized field is zero
    /// and the low 4 bytes of the running backward digest (computed over
    /// the payload with the digest field zeroed) match the digest field,
    /// compared in constant time. The running digest is only advanced
    /// when the cell is accepted.
    pub fn recognize_backward(&mut self, payload: &[u8]) -> bool {
        debug_assert_eq!(payload.len(), Cell::PAYLOAD_LEN);

        if payload[1] != 0 || payload[2] != 0 {
            return false;
        }

        let claimed = &payload[5..9];
        let mut zeroed = payload.to_vec();
        zeroed[5..9].fill(0);

        let mut candidate = self.backward_digest.clone();
        candidate.update(&zeroed);
        let computed = candidate.clone().finalize();

        if ct_eq(&computed[..4], claimed) {
            self.backward_digest = candidate;
            true
        } else {
            false
        }
    }

    /// Snapshot of the backward running digest
    ///
    /// Used when emitting an authenticated SENDME for the last cell
    /// delivered from this hop.
    pub fn backward_digest_snapshot(&self) -> [u8; 20] {
        let digest = self.backward_digest.clone().finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    }

    /// Snapshot of the forward running digest
    ///
    /// Recorded at SENDME boundaries so the exit's authenticated SENDME
    /// can be checked against the exact cell it acknowledges.
    pub fn forward_digest_snapshot(&self) -> [u8; 20] {
        let digest = self.forward_digest.clone().finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    }
}

impl std::fmt::Debug for HopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopState")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Digest and onion-encrypt an outbound relay payload
///
/// The payload is sealed at `target_hop` (digest written under that hop's
/// running forward digest), then encrypted with each hop's forward cipher
/// from `target_hop` inward to the guard.
pub fn encrypt_outbound(hops: &mut [HopState], target_hop: usize, payload: &mut [u8]) {
    hops[target_hop].seal_forward(payload);
    for hop in hops[..=target_hop].iter_mut().rev() {
        hop.encrypt_forward(payload);
    }
}

/// Peel an inbound relay payload and find the originating hop
///
/// Layers are removed guard-first. After each layer the recognition
/// predicate runs; the first hop that accepts the cell is its origin.
/// Returns `None` when no hop recognizes the fully peeled cell, in which
/// case the caller must drop it silently.
pub fn decrypt_inbound(hops: &mut [HopState], payload: &mut [u8]) -> Option<usize> {
    for idx in 0..hops.len() {
        hops[idx].decrypt_backward(payload);
        if hops[idx].recognize_backward(payload) {
            return Some(idx);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::{RelayCell, RelayCommand};

    fn test_hop(tag: u8) -> HopState {
        let keys = HopKeys::derive(&[tag; 32]).unwrap();
        HopState::new(keys, format!("{:040x}", tag))
    }

    /// Mirror of the relay side for round-trip tests: relays process the
    /// forward direction with the forward keys and originate cells under
    /// the backward keys.
    struct FakeRelay {
        forward_cipher: Aes128Ctr,
        backward_cipher: Aes128Ctr,
        backward_digest: Sha1,
    }

    impl FakeRelay {
        fn new(tag: u8) -> Self {
            let keys = HopKeys::derive(&[tag; 32]).unwrap();
            let zero_iv = [0u8; 16];
            let mut backward_digest = Sha1::new();
            backward_digest.update(keys.backward_digest_seed);
            Self {
                forward_cipher: Aes128Ctr::new((&keys.forward_key).into(), (&zero_iv).into()),
                backward_cipher: Aes128Ctr::new((&keys.backward_key).into(), (&zero_iv).into()),
                backward_digest,
            }
        }

        fn peel_forward(&mut self, payload: &mut [u8]) {
            self.forward_cipher.apply_keystream(payload);
        }

        fn originate(&mut self, payload: &mut [u8]) {
            self.backward_digest.update(&*payload);
            let digest = self.backward_digest.clone().finalize();
            payload[5..9].copy_from_slice(&digest[..4]);
            self.backward_cipher.apply_keystream(payload);
        }

        fn relay_backward(&mut self, payload: &mut [u8]) {
            self.backward_cipher.apply_keystream(payload);
        }
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let a = HopKeys::derive(&[42u8; 32]).unwrap();
        let b = HopKeys::derive(&[42u8; 32]).unwrap();
        assert_eq!(a.forward_key, b.forward_key);
        assert_eq!(a.backward_digest_seed, b.backward_digest_seed);
        assert_ne!(a.forward_key, a.backward_key);
    }

    #[test]
    fn test_outbound_layers_peel_to_plaintext() {
        let mut hops = vec![test_hop(1), test_hop(2), test_hop(3)];
        let mut relays = vec![FakeRelay::new(1), FakeRelay::new(2), FakeRelay::new(3)];

        let cell = RelayCell::new(RelayCommand::Data, 7, b"payload under three layers".to_vec());
        let mut payload = cell.encode().unwrap();
        let expected_data = cell.data.clone();

        encrypt_outbound(&mut hops, 2, &mut payload);

        // Each relay removes one layer; the exit sees the plaintext frame.
        for relay in relays.iter_mut() {
            relay.peel_forward(&mut payload);
        }
        let seen = RelayCell::decode(&payload).unwrap();
        assert_eq!(seen.command, RelayCommand::Data);
        assert_eq!(seen.stream_id, 7);
        assert_eq!(seen.data, expected_data);
    }

    #[test]
    fn test_inbound_recognized_only_at_origin() {
        let mut hops = vec![test_hop(1), test_hop(2), test_hop(3)];
        let mut relays = vec![FakeRelay::new(1), FakeRelay::new(2), FakeRelay::new(3)];

        // Exit originates a DATA cell; middle and guard each add a layer.
        let cell = RelayCell::new(RelayCommand::Data, 7, b"hello back".to_vec());
        let mut payload = cell.encode().unwrap();
        relays[2].originate(&mut payload);
        relays[1].relay_backward(&mut payload);
        relays[0].relay_backward(&mut payload);

        let origin = decrypt_inbound(&mut hops, &mut payload);
        assert_eq!(origin, Some(2));

        let parsed = RelayCell::decode(&payload).unwrap();
        assert_eq!(parsed.data, b"hello back");
    }

    #[test]
    fn test_tampered_cell_recognized_nowhere() {
        let mut hops = vec![test_hop(1), test_hop(2), test_hop(3)];
        let mut relays = vec![FakeRelay::new(1), FakeRelay::new(2), FakeRelay::new(3)];

        let cell = RelayCell::new(RelayCommand::Data, 9, vec![0x55; 100]);
        let mut payload = cell.encode().unwrap();
        relays[2].originate(&mut payload);
        relays[1].relay_backward(&mut payload);
        relays[0].relay_backward(&mut payload);

        // Flip one bit anywhere in the encrypted payload.
        payload[200] ^= 0x01;

        assert_eq!(decrypt_inbound(&mut hops, &mut payload), None);
    }

    #[test]
    fn test_digest_state_not_advanced_by_rejected_cell() {
        let mut hops = vec![test_hop(1)];
        let mut relay = FakeRelay::new(1);

        // A garbage cell must not disturb the running digest.
        let mut garbage = vec![0xFFu8; Cell::PAYLOAD_LEN];
        assert_eq!(decrypt_inbound(&mut hops, &mut garbage), None);

        // Rebuild hop cipher state to compensate for the keystream the
        // garbage consumed, then verify the digest chain still lines up.
        let mut hops = vec![test_hop(1)];
        let cell = RelayCell::new(RelayCommand::Data, 3, b"first".to_vec());
        let mut payload = cell.encode().unwrap();
        relay.originate(&mut payload);
        assert_eq!(decrypt_inbound(&mut hops, &mut payload), Some(0));

        let cell2 = RelayCell::new(RelayCommand::Data, 3, b"second".to_vec());
        let mut payload2 = cell2.encode().unwrap();
        relay.originate(&mut payload2);
        assert_eq!(decrypt_inbound(&mut hops, &mut payload2), Some(0));
    }
}
