//! v3 onion-service client
//!
//! Address parsing, blinded-key and descriptor-id derivation, HSDir
//! selection, descriptor fetch/verify/cache, and the introduction and
//! rendezvous protocol.

pub mod address;
pub mod descriptor;
pub mod hsdir;
pub mod rendezvous;

pub use address::OnionAddressV3;
pub use descriptor::{DescriptorCache, IntroPoint, LinkSpec, OnionDescriptor};
pub use hsdir::{blind_pubkey, descriptor_id, responsible_hsdirs, TimePeriod};
pub use rendezvous::OnionClient;
