//! tor-native: a pure-native Tor client
//!
//! The core client engine: it turns application connection requests
//! arriving on a local SOCKS5 port into authenticated, anonymized
//! traffic through the Tor network.
//!
//! - Cell codec, link handshake and per-hop relay crypto ([`protocol`])
//! - Directory consensus fetching and path selection ([`path`])
//! - Circuit construction, streams and SENDME flow control
//! - Guard persistence ([`guards`]) and stream isolation ([`isolation`])
//! - v3 onion-service client ([`onion`])
//! - SOCKS5 front door ([`socks`]) and the orchestrator ([`client`])
//!
//! ```no_run
//! use tor_native::{TorClient, TorConfig};
//!
//! # async fn run() -> tor_native::Result<()> {
//! let client = TorClient::start(
//!     TorConfig::default(),
//!     tor_native::hooks::noop_metrics(),
//!     tor_native::hooks::noop_control(),
//! )
//! .await?;
//! // ... applications connect through the SOCKS listener ...
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod guards;
pub mod hooks;
pub mod isolation;
pub mod onion;
pub mod path;
pub mod pool;
pub mod protocol;
pub mod socks;
pub mod storage;

pub use client::{HealthReport, TorClient};
pub use config::{IsolationFlags, TorConfig};
pub use error::{Result, TorError};
pub use isolation::IsolationKey;
pub use onion::OnionAddressV3;
pub use protocol::{Circuit, CircuitPurpose, Target, TorStream};
