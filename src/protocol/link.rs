//! Link connections to relays
//!
//! One TLS session per relay address, shared by every circuit through
//! that relay. Connecting runs the link handshake: VERSIONS exchange,
//! CERTS verification against the fingerprint the caller dialed,
//! AUTH_CHALLENGE (we never authenticate back as a client) and NETINFO
//! in both directions. After the handshake a reader task demultiplexes
//! inbound cells to their circuits.
//!
//! Relay TLS certificates are self-signed and never chain to public
//! roots; the TLS layer only provides confidentiality, while identity
//! comes from the CERTS cell. We still require TLS >= 1.2 with
//! ECDHE-only suites.

use crate::error::{Result, TorError};
use crate::protocol::cell::{
    parse_versions_payload, versions_payload, Cell, CellCommand, LinkVersion,
};
use crate::protocol::certs::CertsCell;
use crate::protocol::relay::Relay;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// Link handshake deadline
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-cell read deadline during the handshake
pub const CELL_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect attempts before giving up on a relay
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Acceptable clock skew in a peer's NETINFO
const NETINFO_MAX_SKEW: Duration = Duration::from_secs(30 * 60);

/// Capacity of each circuit's inbound cell queue
const CIRCUIT_QUEUE_DEPTH: usize = 64;

/// Anything that can carry cells toward a relay
///
/// Circuits speak to the network through this seam; tests substitute a
/// fake implementation.
#[async_trait]
pub trait CellSink: Send + Sync {
    /// Send one cell
    async fn send(&self, cell: Cell) -> Result<()>;

    /// Negotiated link version
    fn link_version(&self) -> LinkVersion;

    /// Stop routing cells for this circuit id
    fn unregister_circuit(&self, circuit_id: u32);
}

/// An established link to one relay
pub struct Channel {
    /// Relay address
    pub addr: SocketAddr,

    /// Hex fingerprint of the relay this channel authenticated as
    pub fingerprint: String,

    /// Negotiated link version
    version: LinkVersion,

    /// Write half of the TLS stream
    writer: tokio::sync::Mutex<WriteHalf<TlsStream<TcpStream>>>,

    /// Inbound demux: circuit id -> cell queue
    circuits: Mutex<HashMap<u32, mpsc::Sender<Cell>>>,

    /// Set once the reader task exits
    closed: AtomicBool,

    /// Cancels the reader task
    cancel: CancellationToken,
}

impl Channel {
    /// Connect to a relay and run the link handshake
    ///
    /// Retries the TCP/TLS connect with exponential backoff and jitter,
    /// up to [`MAX_CONNECT_ATTEMPTS`] attempts. `is_bootstrap` softens
    /// NETINFO clock-skew handling to a warning.
    pub async fn connect(
        relay: &Relay,
        cancel: CancellationToken,
        is_bootstrap: bool,
    ) -> Result<Arc<Self>> {
        let addr = relay.or_addr();
        let mut last_err = TorError::ConnectionFailed(format!("no attempt made to {}", addr));

        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            if attempt > 0 {
                let delay = backoff_with_jitter(attempt);
                log::debug!("retrying {} in {:?} (attempt {})", addr, delay, attempt + 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(TorError::Cancelled),
                }
            }

            let handshake = Self::connect_once(relay, &cancel, is_bootstrap);
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
                Ok(Ok(channel)) => return Ok(channel),
                Ok(Err(e)) => {
                    if matches!(e, TorError::Cancelled | TorError::IdentityMismatch { .. }) {
                        return Err(e);
                    }
                    log::debug!("link to {} failed: {}", addr, e);
                    last_err = e;
                }
                Err(_) => last_err = TorError::Timeout("link handshake"),
            }
        }

        Err(last_err)
    }

    async fn connect_once(
        relay: &Relay,
        cancel: &CancellationToken,
        is_bootstrap: bool,
    ) -> Result<Arc<Self>> {
        let addr = relay.or_addr();

        let tcp = tokio::select! {
            res = TcpStream::connect(addr) => res
                .map_err(|e| TorError::ConnectionFailed(format!("{}: {}", addr, e)))?,
            _ = cancel.cancelled() => return Err(TorError::Cancelled),
        };
        tcp.set_nodelay(true).ok();

        let connector = TlsConnector::from(tls_client_config());
        let server_name = rustls_pki_types::ServerName::from(addr.ip());
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TorError::ConnectionFailed(format!("TLS to {}: {}", addr, e)))?;

        let (mut read_half, mut write_half) = tokio::io::split(tls);

        // 1. VERSIONS exchange; both sides frame it with 2-byte circuit
        //    ids regardless of what gets negotiated.
        let ours = Cell::new(
            0,
            CellCommand::Versions,
            versions_payload(&LinkVersion::SUPPORTED),
        );
        write_half
            .write_all(&ours.encode(LinkVersion::V3)?)
            .await
            .map_err(io_err)?;
        write_half.flush().await.map_err(io_err)?;

        let peer_versions_cell = read_cell(&mut read_half, LinkVersion::V3).await?;
        if peer_versions_cell.command != CellCommand::Versions {
            return Err(TorError::LinkProtocol(format!(
                "expected VERSIONS, got {:?}",
                peer_versions_cell.command
            )));
        }
        let peer_versions = parse_versions_payload(&peer_versions_cell.payload)?;
        let version = LinkVersion::negotiate(&peer_versions).ok_or_else(|| {
            TorError::LinkProtocol(format!("no common link version in {:?}", peer_versions))
        })?;
        log::debug!("negotiated link version {:?} with {}", version, addr);

        // 2. CERTS, AUTH_CHALLENGE, NETINFO arrive in order; anything
        //    else before NETINFO is a protocol violation.
        let mut verified = false;
        loop {
            let cell = read_cell(&mut read_half, version).await?;
            match cell.command {
                CellCommand::Certs => {
                    let certs = CertsCell::parse(&cell.payload)?;
                    let expected = decode_ed_identity(relay)?;
                    certs.verify_identity(expected.as_ref(), SystemTime::now())?;
                    verified = true;
                }
                CellCommand::AuthChallenge => {
                    // Clients do not authenticate; acknowledged by our
                    // NETINFO below.
                }
                CellCommand::Netinfo => {
                    if !verified {
                        return Err(TorError::LinkProtocol(
                            "NETINFO before CERTS".into(),
                        ));
                    }
                    validate_netinfo(&cell.payload, is_bootstrap)?;
                    break;
                }
                CellCommand::Padding | CellCommand::Vpadding => {}
                other => {
                    return Err(TorError::LinkProtocol(format!(
                        "unexpected {:?} during link handshake",
                        other
                    )))
                }
            }
        }

        // 3. Our NETINFO completes the handshake.
        let netinfo = netinfo_payload(addr.ip());
        write_half
            .write_all(&Cell::new(0, CellCommand::Netinfo, netinfo).encode(version)?)
            .await
            .map_err(io_err)?;
        write_half.flush().await.map_err(io_err)?;

        let channel = Arc::new(Self {
            addr,
            fingerprint: relay.fingerprint.clone(),
            version,
            writer: tokio::sync::Mutex::new(write_half),
            circuits: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            cancel: cancel.child_token(),
        });

        channel.spawn_reader(read_half);
        log::info!("link established to {} ({})", addr, &relay.fingerprint[..8]);
        Ok(channel)
    }

    /// Register a circuit id and get its inbound cell queue
    pub fn register_circuit(&self, circuit_id: u32) -> mpsc::Receiver<Cell> {
        let (tx, rx) = mpsc::channel(CIRCUIT_QUEUE_DEPTH);
        self.circuits
            .lock()
            .expect("circuit demux lock")
            .insert(circuit_id, tx);
        rx
    }

    /// Allocate an unused client-side circuit id
    ///
    /// On link v4+ the initiator sets the MSB; zero is never produced.
    pub fn pick_circuit_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        let circuits = self.circuits.lock().expect("circuit demux lock");
        loop {
            let id = match self.version {
                LinkVersion::V3 => u32::from(rng.gen_range(1u16..=u16::MAX)),
                _ => rng.gen_range(1u32..=0x7FFF_FFFF) | 0x8000_0000,
            };
            if !circuits.contains_key(&id) {
                return id;
            }
        }
    }

    /// Whether the reader task has exited
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn spawn_reader(self: &Arc<Self>, mut read_half: ReadHalf<TlsStream<TcpStream>>) {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let cell = tokio::select! {
                    res = read_cell_untimed(&mut read_half, channel.version) => res,
                    _ = channel.cancel.cancelled() => break,
                };
                let cell = match cell {
                    Ok(cell) => cell,
                    Err(e) => {
                        log::debug!("link {} reader stopped: {}", channel.addr, e);
                        break;
                    }
                };

                match cell.command {
                    CellCommand::Padding | CellCommand::Vpadding => continue,
                    _ => {}
                }

                let sender = {
                    let circuits = channel.circuits.lock().expect("circuit demux lock");
                    circuits.get(&cell.circuit_id).cloned()
                };
                match sender {
                    Some(tx) => {
                        if tx.send(cell).await.is_err() {
                            // Circuit gone; drop its route.
                            channel.unregister_circuit_inner();
                        }
                    }
                    None => {
                        log::trace!(
                            "dropping cell for unknown circuit {} on {}",
                            cell.circuit_id,
                            channel.addr
                        );
                    }
                }
            }

            channel.closed.store(true, Ordering::Release);
            // Dropping the senders tells every circuit the link died.
            channel.circuits.lock().expect("circuit demux lock").clear();
        });
    }

    fn unregister_circuit_inner(&self) {
        let mut circuits = self.circuits.lock().expect("circuit demux lock");
        circuits.retain(|_, tx| !tx.is_closed());
    }
}

#[async_trait]
impl CellSink for Channel {
    async fn send(&self, cell: Cell) -> Result<()> {
        if self.is_closed() {
            return Err(TorError::CircuitClosed("link closed".into()));
        }
        let bytes = cell.encode(self.version)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(io_err)?;
        writer.flush().await.map_err(io_err)?;
        Ok(())
    }

    fn link_version(&self) -> LinkVersion {
        self.version
    }

    fn unregister_circuit(&self, circuit_id: u32) {
        self.circuits
            .lock()
            .expect("circuit demux lock")
            .remove(&circuit_id);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Pool of link channels, one per relay address
pub struct ChannelPool {
    channels: Mutex<HashMap<SocketAddr, Arc<Channel>>>,
    cancel: CancellationToken,
}

impl ChannelPool {
    /// Create an empty pool under the given cancellation scope
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Reuse the live channel to a relay or establish a new one
    pub async fn get_or_connect(&self, relay: &Relay, is_bootstrap: bool) -> Result<Arc<Channel>> {
        if let Some(existing) = self
            .channels
            .lock()
            .expect("channel pool lock")
            .get(&relay.or_addr())
        {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
        }

        let channel = Channel::connect(relay, self.cancel.child_token(), is_bootstrap).await?;
        self.channels
            .lock()
            .expect("channel pool lock")
            .insert(relay.or_addr(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Drop channels whose reader task has exited
    pub fn prune(&self) {
        self.channels
            .lock()
            .expect("channel pool lock")
            .retain(|_, c| !c.is_closed());
    }

    /// Number of live channels
    pub fn len(&self) -> usize {
        self.channels.lock().expect("channel pool lock").len()
    }

    /// Whether the pool holds no channels
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read one cell with the handshake deadline applied
async fn read_cell(
    read_half: &mut ReadHalf<TlsStream<TcpStream>>,
    version: LinkVersion,
) -> Result<Cell> {
    match tokio::time::timeout(CELL_READ_TIMEOUT, read_cell_untimed(read_half, version)).await {
        Ok(res) => res,
        Err(_) => Err(TorError::Timeout("cell read")),
    }
}

/// Read one length-framed cell
async fn read_cell_untimed(
    read_half: &mut ReadHalf<TlsStream<TcpStream>>,
    version: LinkVersion,
) -> Result<Cell> {
    let circ_len = version.circ_id_len();

    let mut header = [0u8; 5];
    read_half
        .read_exact(&mut header[..circ_len + 1])
        .await
        .map_err(io_err)?;
    let command_byte = header[circ_len];

    let is_versions = command_byte == CellCommand::Versions as u8;
    let is_variable = command_byte >= 128 || is_versions;

    let mut buf = header[..circ_len + 1].to_vec();
    if is_variable {
        let mut len_bytes = [0u8; 2];
        read_half.read_exact(&mut len_bytes).await.map_err(io_err)?;
        let body_len = u16::from_be_bytes(len_bytes) as usize;
        buf.extend_from_slice(&len_bytes);
        let start = buf.len();
        buf.resize(start + body_len, 0);
        read_half.read_exact(&mut buf[start..]).await.map_err(io_err)?;
    } else {
        let start = buf.len();
        buf.resize(start + Cell::PAYLOAD_LEN, 0);
        read_half.read_exact(&mut buf[start..]).await.map_err(io_err)?;
    }

    // VERSIONS keeps 2-byte framing even after a 4-byte version is
    // negotiated; reparse accordingly.
    let parse_version = if is_versions { LinkVersion::V3 } else { version };
    let (cell, _) = Cell::decode(&buf, parse_version)?;
    Ok(cell)
}

/// Build our NETINFO payload: TIME | OTHERADDR | NMYADDR=0
fn netinfo_payload(peer: IpAddr) -> Vec<u8> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;

    let mut out = Vec::with_capacity(4 + 2 + 16 + 1);
    out.extend_from_slice(&now.to_be_bytes());
    match peer {
        IpAddr::V4(v4) => {
            out.push(0x04);
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(0x06);
            out.push(16);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.push(0); // we do not advertise our own addresses
    out
}

/// Validate a peer's NETINFO timestamp against the local clock
fn validate_netinfo(payload: &[u8], is_bootstrap: bool) -> Result<()> {
    if payload.len() < 4 {
        return Err(TorError::Cell("NETINFO too short".into()));
    }
    let peer_time = i64::from(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]));
    if peer_time <= 0 {
        return Err(TorError::LinkProtocol("NETINFO timestamp not positive".into()));
    }

    let local = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let skew = (local - peer_time).unsigned_abs();

    if skew > NETINFO_MAX_SKEW.as_secs() {
        if is_bootstrap {
            log::warn!("peer clock skewed by {}s (accepted during bootstrap)", skew);
        } else {
            return Err(TorError::LinkProtocol(format!(
                "peer clock skewed by {}s",
                skew
            )));
        }
    }
    Ok(())
}

/// Exponential backoff with jitter for connect retries
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 500u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter)
}

/// TLS configuration for relay links
///
/// Relay certificates are structurally self-signed, so certificate
/// verification is a no-op here; identity is proven by the CERTS cell.
fn tls_client_config() -> Arc<rustls::ClientConfig> {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::ring as provider;

    #[derive(Debug)]
    struct AcceptAnyRelayCert(rustls::crypto::CryptoProvider);

    impl ServerCertVerifier for AcceptAnyRelayCert {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls_pki_types::CertificateDer<'_>,
            _intermediates: &[rustls_pki_types::CertificateDer<'_>],
            _server_name: &rustls_pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls_pki_types::UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &rustls_pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &rustls_pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    let provider = provider::default_provider();
    let config = rustls::ClientConfig::builder_with_provider(provider.clone().into())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .expect("static TLS versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyRelayCert(provider)))
        .with_no_client_auth();
    Arc::new(config)
}

fn decode_ed_identity(relay: &Relay) -> Result<Option<[u8; 32]>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
    use base64::Engine as _;

    let Some(encoded) = &relay.ed_identity else {
        return Ok(None);
    };
    let bytes = STANDARD_NO_PAD
        .decode(encoded)
        .or_else(|_| STANDARD.decode(encoded))
        .map_err(|_| TorError::Directory("bad ed25519 identity encoding".into()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TorError::Directory("ed25519 identity must be 32 bytes".into()))?;
    Ok(Some(arr))
}

fn io_err(e: std::io::Error) -> TorError {
    TorError::ConnectionFailed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netinfo_payload_layout() {
        let payload = netinfo_payload("1.2.3.4".parse().unwrap());
        // TIME(4) + ATYPE(1) + ALEN(1) + ADDR(4) + NMYADDR(1)
        assert_eq!(payload.len(), 11);
        assert_eq!(payload[4], 0x04);
        assert_eq!(payload[5], 4);
        assert_eq!(&payload[6..10], &[1, 2, 3, 4]);
        assert_eq!(payload[10], 0);
    }

    #[test]
    fn test_netinfo_validation() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;

        let mut payload = now.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0x04, 4, 1, 2, 3, 4, 0]);
        assert!(validate_netinfo(&payload, false).is_ok());

        // Zero timestamp is rejected outright.
        let mut zero = vec![0u8; 4];
        zero.extend_from_slice(&[0x04, 4, 1, 2, 3, 4, 0]);
        assert!(validate_netinfo(&zero, false).is_err());

        // Large skew fails strict mode, passes bootstrap with a warning.
        let skewed = (now - 3 * 3600).to_be_bytes().to_vec();
        assert!(validate_netinfo(&skewed, false).is_err());
        assert!(validate_netinfo(&skewed, true).is_ok());
    }

    #[test]
    fn test_backoff_grows() {
        let first = backoff_with_jitter(1);
        let third = backoff_with_jitter(3);
        assert!(first >= Duration::from_millis(1000));
        assert!(third >= Duration::from_millis(4000));
        assert!(third <= Duration::from_millis(6000));
    }
}
