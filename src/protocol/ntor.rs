//! ntor handshake
//!
//! The ntor (ntor1) key exchange used by CREATE2 and EXTEND2. Client
//! side only: we generate an ephemeral X25519 keypair, send
//! `NODEID (20) || KEYID (32) || X (32)`, and complete against the
//! relay's `Y (32) || AUTH (32)` reply.
//!
//! AUTH verification is constant-time; a mismatch aborts the circuit
//! build.

use crate::crypto::{hmac_sha256, HmacSha256};
use crate::error::{Result, TorError};
use crate::protocol::crypto::HopKeys;
use hmac::Mac;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// Length of the client handshake payload
pub const CLIENT_HANDSHAKE_LEN: usize = 20 + 32 + 32;

/// Length of the server reply
pub const SERVER_REPLY_LEN: usize = 32 + 32;

/// In-flight client side of one ntor handshake
///
/// The ephemeral secret zeroizes on drop (StaticSecret handles this).
pub struct NtorClient {
    /// Client's ephemeral secret key
    secret: StaticSecret,

    /// Client's ephemeral public key
    public: PublicKey,

    /// Relay identity fingerprint (SHA-1 of the RSA identity key)
    node_id: [u8; 20],

    /// Relay's ntor onion key (B)
    onion_key: PublicKey,
}

impl NtorClient {
    /// Start a handshake toward the relay with the given identity and
    /// ntor onion key
    pub fn new(node_id: [u8; 20], onion_key: [u8; 32]) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            node_id,
            onion_key: PublicKey::from(onion_key),
        }
    }

    /// The 84-byte payload carried by CREATE2 / EXTEND2
    ///
    /// Format: NODEID (20) || KEYID = B (32) || X (32).
    pub fn payload(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(CLIENT_HANDSHAKE_LEN);
        data.extend_from_slice(&self.node_id);
        data.extend_from_slice(self.onion_key.as_bytes());
        data.extend_from_slice(self.public.as_bytes());
        data
    }

    /// Complete the handshake against the relay's `Y || AUTH` reply and
    /// derive the hop keys
    pub fn complete(self, reply: &[u8]) -> Result<HopKeys> {
        if reply.len() < SERVER_REPLY_LEN {
            return Err(TorError::Cell("ntor reply too short".into()));
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[0..32]);
        let server_public = PublicKey::from(y_bytes);
        let server_auth = &reply[32..64];

        // secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
        let shared_yx = self.secret.diffie_hellman(&server_public);
        let shared_bx = self.secret.diffie_hellman(&self.onion_key);

        let mut secret_input = Vec::with_capacity(32 * 4 + 20 + 32 + PROTOID.len());
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.node_id);
        secret_input.extend_from_slice(self.onion_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_sha256(T_KEY, &secret_input);
        let verify = hmac_sha256(T_VERIFY, &secret_input);

        // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::with_capacity(32 + 20 + 32 * 3 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.node_id);
        auth_input.extend_from_slice(self.onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let mut mac = HmacSha256::new_from_slice(T_MAC).expect("HMAC accepts any key length");
        mac.update(&auth_input);
        let computed_auth = mac.finalize().into_bytes();

        let auth_ok: bool = computed_auth.as_slice().ct_eq(server_auth).into();
        if !auth_ok {
            return Err(TorError::AuthVerificationFailed(
                "ntor server AUTH mismatch".into(),
            ));
        }

        HopKeys::derive(&key_seed)
    }
}

impl std::fmt::Debug for NtorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtorClient")
            .field("node_id", &hex::encode(self.node_id))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Server side of the handshake, mirrored here for round-trip tests
    struct NtorServer {
        identity: [u8; 20],
        onion_secret: StaticSecret,
        onion_public: PublicKey,
    }

    impl NtorServer {
        fn new(identity: [u8; 20]) -> Self {
            let onion_secret = StaticSecret::random_from_rng(OsRng);
            let onion_public = PublicKey::from(&onion_secret);
            Self {
                identity,
                onion_secret,
                onion_public,
            }
        }

        /// Process a client payload; return (reply, key_seed)
        fn respond(&self, client_payload: &[u8]) -> (Vec<u8>, [u8; 32]) {
            assert_eq!(client_payload.len(), CLIENT_HANDSHAKE_LEN);
            assert_eq!(&client_payload[0..20], &self.identity);
            assert_eq!(&client_payload[20..52], self.onion_public.as_bytes());

            let mut x_bytes = [0u8; 32];
            x_bytes.copy_from_slice(&client_payload[52..84]);
            let client_public = PublicKey::from(x_bytes);

            let eph_secret = StaticSecret::random_from_rng(OsRng);
            let eph_public = PublicKey::from(&eph_secret);

            // secret_input = EXP(X,y) | EXP(X,b) | ID | B | X | Y | PROTOID
            let shared_xy = eph_secret.diffie_hellman(&client_public);
            let shared_xb = self.onion_secret.diffie_hellman(&client_public);

            let mut secret_input = Vec::new();
            secret_input.extend_from_slice(shared_xy.as_bytes());
            secret_input.extend_from_slice(shared_xb.as_bytes());
            secret_input.extend_from_slice(&self.identity);
            secret_input.extend_from_slice(self.onion_public.as_bytes());
            secret_input.extend_from_slice(client_public.as_bytes());
            secret_input.extend_from_slice(eph_public.as_bytes());
            secret_input.extend_from_slice(PROTOID);

            let key_seed = hmac_sha256(T_KEY, &secret_input);
            let verify = hmac_sha256(T_VERIFY, &secret_input);

            let mut auth_input = Vec::new();
            auth_input.extend_from_slice(&verify);
            auth_input.extend_from_slice(&self.identity);
            auth_input.extend_from_slice(self.onion_public.as_bytes());
            auth_input.extend_from_slice(eph_public.as_bytes());
            auth_input.extend_from_slice(client_public.as_bytes());
            auth_input.extend_from_slice(PROTOID);
            auth_input.extend_from_slice(b"Server");

            let auth = hmac_sha256(T_MAC, &auth_input);

            let mut reply = Vec::with_capacity(SERVER_REPLY_LEN);
            reply.extend_from_slice(eph_public.as_bytes());
            reply.extend_from_slice(&auth);
            (reply, key_seed)
        }
    }

    #[test]
    fn test_payload_layout() {
        let client = NtorClient::new([0xAB; 20], [0xCD; 32]);
        let payload = client.payload();
        assert_eq!(payload.len(), 84);
        assert_eq!(&payload[0..20], &[0xAB; 20]);
        assert_eq!(&payload[20..52], &[0xCD; 32]);
    }

    #[test]
    fn test_client_server_derive_identical_keys() {
        let server = NtorServer::new([0x11; 20]);
        let client = NtorClient::new([0x11; 20], *server.onion_public.as_bytes());

        let payload = client.payload();
        let (reply, server_seed) = server.respond(&payload);

        let client_keys = client.complete(&reply).unwrap();
        let server_keys = HopKeys::derive(&server_seed).unwrap();

        // Both sides expand the seed to the same 72 bytes.
        assert_eq!(client_keys.forward_digest_seed, server_keys.forward_digest_seed);
        assert_eq!(client_keys.backward_digest_seed, server_keys.backward_digest_seed);
        assert_eq!(client_keys.forward_key, server_keys.forward_key);
        assert_eq!(client_keys.backward_key, server_keys.backward_key);
    }

    #[test]
    fn test_bad_auth_aborts() {
        let server = NtorServer::new([0x22; 20]);
        let client = NtorClient::new([0x22; 20], *server.onion_public.as_bytes());

        let payload = client.payload();
        let (mut reply, _) = server.respond(&payload);
        reply[40] ^= 0xFF;

        assert!(matches!(
            client.complete(&reply),
            Err(TorError::AuthVerificationFailed(_))
        ));
    }

    #[test]
    fn test_short_reply_rejected() {
        let client = NtorClient::new([0x33; 20], [0x44; 32]);
        assert!(client.complete(&[0u8; 63]).is_err());
    }
}
