//! Tor protocol implementation
//!
//! The wire-level half of the client:
//! - Cell codec (fixed and variable length, relay subframe)
//! - Link connections (TLS, VERSIONS/CERTS/NETINFO)
//! - ntor handshake and per-hop relay crypto
//! - Circuit engine and SENDME flow control
//! - Streams, directory consensus fetching and parsing

mod cell;
mod certs;
mod circuit;
mod consensus;
mod consensus_verify;
mod crypto;
mod directory;
mod flow_control;
mod link;
mod ntor;
mod relay;
mod stream;

pub use cell::{
    parse_versions_payload, versions_payload, Cell, CellCommand, LinkVersion, RelayCell,
    RelayCommand,
};
pub use certs::{CertsCell, CertType, Ed25519Certificate, VerifiedIdentity};
pub use circuit::{
    decode_fingerprint, decode_ntor_key, Circuit, CircuitPurpose, CircuitState, BUILD_TIMEOUT,
    EXTEND_TIMEOUT, MAX_HOPS, MAX_RELAY_EARLY,
};
pub use consensus::{parse_utc_timestamp, BandwidthWeights, Consensus, ConsensusParser};
pub use consensus_verify::{
    default_authorities, ConsensusVerifier, DirectoryAuthority, DirectorySignature,
    MIN_AUTHORITY_SIGNATURES,
};
pub use crypto::{decrypt_inbound, encrypt_outbound, HopKeys, HopState};
pub use directory::{parse_http_response, DirectoryClient};
pub use flow_control::{
    sendme_payload_v1, RecvWindow, SendWindow, SendmeAuth, CIRCUIT_WINDOW_INCREMENT,
    CIRCUIT_WINDOW_INITIAL, STREAM_WINDOW_INCREMENT, STREAM_WINDOW_INITIAL,
};
pub use link::{CellSink, Channel, ChannelPool, HANDSHAKE_TIMEOUT, MAX_CONNECT_ATTEMPTS};
pub use ntor::{NtorClient, CLIENT_HANDSHAKE_LEN, SERVER_REPLY_LEN};
pub use relay::{ExitPolicySummary, Relay, RelayFlags};
pub use stream::{
    ResolvedAddr, StreamManager, Target, TorStream, TorStreamReadHalf, TorStreamWriteHalf,
    BEGIN_TIMEOUT,
};
