//! Error types for the Tor client
//!
//! One error enum per failure kind, grouped the way the subsystems report
//! them: configuration, directory, path selection, link, circuit, stream,
//! onion service, crypto and cell parsing, plus cooperative cancellation
//! and deadlines. Errors carry fingerprints, addresses and reason codes
//! only; never key material or descriptor ciphertext.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Main error type for the Tor client
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Configuration =====
    #[error("Config error: {0}")]
    Config(String),

    // ===== Directory / consensus =====
    #[error("No usable consensus")]
    NoConsensus,

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Consensus verification failed: {0}")]
    ConsensusInvalid(String),

    // ===== Path selection =====
    #[error("Not enough eligible relays for position {position}")]
    PathInsufficient { position: &'static str },

    // ===== Link layer =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Relay identity mismatch: expected {expected}")]
    IdentityMismatch { expected: String },

    #[error("Link protocol violation: {0}")]
    LinkProtocol(String),

    // ===== Circuit =====
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    #[error("Circuit manager at capacity ({0} live circuits)")]
    AtCapacity(usize),

    // ===== Stream =====
    #[error("Stream ended: reason={reason} ({reason_name})")]
    StreamEnded { reason: u8, reason_name: String },

    #[error("Stream error: {0}")]
    Stream(String),

    // ===== Onion service =====
    #[error("Invalid onion address: {0}")]
    BadOnionAddress(String),

    #[error("Onion service unreachable: {0}")]
    OnionUnreachable(String),

    #[error("Onion descriptor error: {0}")]
    Descriptor(String),

    // ===== Crypto / cells (fatal to the containing unit) =====
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Auth verification failed: {0}")]
    AuthVerificationFailed(String),

    #[error("Unknown cell command: {0}")]
    UnknownCommand(u8),

    #[error("Cell parse error: {0}")]
    Cell(String),

    #[error("Integer overflow in cell field")]
    Overflow,

    // ===== Storage =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Cancellation / deadlines =====
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    // ===== Internal =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// Whether this error is fatal to the whole client
    ///
    /// Fatal errors indicate security problems or unrecoverable states;
    /// retrying with different relays will not help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorError::Config(_)
                | TorError::ConsensusInvalid(_)
                | TorError::AuthVerificationFailed(_)
        )
    }

    /// Whether this error can be retried with different relays
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ConnectionFailed(_)
                | TorError::Timeout(_)
                | TorError::CircuitBuildFailed(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::CircuitClosed(_)
                | TorError::Directory(_)
                | TorError::StreamEnded { .. }
        )
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = destroy_reason_name(reason).to_string();
        TorError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }

    /// Create a StreamEnded error with the reason name
    pub fn stream_ended(reason: u8) -> Self {
        let reason_name = end_reason_name(reason).to_string();
        TorError::StreamEnded {
            reason,
            reason_name,
        }
    }

    /// SOCKS5 reply code for surfacing this error to a local application
    pub fn socks_reply_code(&self) -> u8 {
        match self {
            TorError::StreamEnded { reason, .. } => match reason {
                2 => 0x04,  // RESOLVEFAILED -> host unreachable
                3 => 0x05,  // CONNECTREFUSED -> connection refused
                4 => 0x02,  // EXITPOLICY -> connection not allowed
                7 => 0x03,  // TIMEOUT -> network unreachable
                _ => 0x01,  // general failure
            },
            TorError::NoConsensus | TorError::PathInsufficient { .. } => 0x03,
            TorError::OnionUnreachable(_) | TorError::Descriptor(_) => 0x04,
            TorError::BadOnionAddress(_) => 0x04,
            TorError::Timeout(_) => 0x03,
            _ => 0x01,
        }
    }
}

/// DESTROY / TRUNCATED reason names (tor-spec section 5.4)
pub fn destroy_reason_name(reason: u8) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "PROTOCOL",
        2 => "INTERNAL",
        3 => "REQUESTED",
        4 => "HIBERNATING",
        5 => "RESOURCELIMIT",
        6 => "CONNECTFAILED",
        7 => "OR_IDENTITY",
        8 => "CHANNEL_CLOSED",
        9 => "FINISHED",
        10 => "TIMEOUT",
        11 => "DESTROYED",
        12 => "NOSUCHSERVICE",
        _ => "UNKNOWN",
    }
}

/// RELAY_END reason names (tor-spec section 6.3)
pub fn end_reason_name(reason: u8) -> &'static str {
    match reason {
        1 => "MISC",
        2 => "RESOLVEFAILED",
        3 => "CONNECTREFUSED",
        4 => "EXITPOLICY",
        5 => "DESTROY",
        6 => "DONE",
        7 => "TIMEOUT",
        8 => "NOROUTE",
        9 => "HIBERNATING",
        10 => "INTERNAL",
        11 => "RESOURCELIMIT",
        12 => "CONNRESET",
        13 => "TORPROTOCOL",
        14 => "NOTDIRECTORY",
        _ => "UNKNOWN",
    }
}
