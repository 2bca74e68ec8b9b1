//! Circuit engine
//!
//! Builds, extends and tears down circuits, owns per-hop crypto state,
//! and runs the per-circuit reactor that decrypts inbound cells, checks
//! recognition and dispatches relay commands to streams and flow
//! control.
//!
//! Outbound sealing and sending happen under one async lock so the
//! running digests always match the order cells hit the wire.

use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use crate::protocol::crypto::{decrypt_inbound, encrypt_outbound, HopKeys, HopState};
use crate::protocol::flow_control::{
    sendme_payload_v1, RecvWindow, SendWindow, SendmeAuth, CIRCUIT_WINDOW_INCREMENT,
};
use crate::protocol::link::CellSink;
use crate::protocol::ntor::NtorClient;
use crate::protocol::relay::Relay;
use crate::protocol::LinkVersion;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// RELAY_EARLY budget per circuit; once spent, no further extension
pub const MAX_RELAY_EARLY: u8 = 8;

/// Hops a circuit may carry (onion-service circuits reach 4)
pub const MAX_HOPS: usize = 8;

/// Deadline for each CREATE/EXTEND round trip
pub const EXTEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a full circuit build
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(30);

/// Circuit lifecycle states
///
/// Transitions are monotone except `Building -> Failed`:
/// `Building -> Open -> Closed`, with `Failed` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Building,
    Open,
    Closed,
    Failed,
}

/// What a circuit is for; drives path constraints and pool assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitPurpose {
    General,
    Directory,
    Intro,
    Rendezvous,
    HsClient,
}

/// Per-stream routing state kept by the reactor
struct StreamEntry {
    /// Queue toward the stream's reader
    tx: mpsc::Sender<RelayCell>,

    /// Stream-level package window, released on stream SENDMEs
    send_window: Arc<SendWindow>,

    /// Stream-level deliver window; drives stream SENDME emission
    recv_window: RecvWindow,
}

/// State guarded by the circuit's I/O lock
struct CircuitIo {
    /// Crypto state, guard first
    hops: Vec<HopState>,

    /// RELAY_EARLY cells still allowed
    relay_early_remaining: u8,

    /// DATA cells packaged toward the exit, for SENDME digest recording
    packaged_data: u64,
}

/// A circuit through the Tor network
pub struct Circuit {
    /// Circuit id on its link (client-allocated, MSB set on v4+)
    pub id: u32,

    /// What this circuit is for
    pub purpose: CircuitPurpose,

    /// Fingerprints of the relays on the path, guard first
    pub path: Vec<String>,

    /// Link carrying this circuit
    link: Arc<dyn CellSink>,

    /// Sealing + sending order lock
    io: tokio::sync::Mutex<CircuitIo>,

    /// Lifecycle state
    state: Mutex<CircuitState>,

    /// Streams multiplexed on this circuit
    streams: Mutex<HashMap<u16, StreamEntry>>,

    /// Next stream id to hand out
    next_stream_id: Mutex<u16>,

    /// Circuit-level package window
    send_window: Arc<SendWindow>,

    /// Circuit-level deliver window (reactor only)
    recv_window: Mutex<RecvWindow>,

    /// Authenticated-SENDME bookkeeping
    sendme_auth: SendmeAuth,

    /// When the circuit finished building
    pub created_at: Instant,

    /// Last time a stream used this circuit (unix-less monotonic)
    last_used: Mutex<Instant>,

    /// Cells dropped because no hop recognized them
    unrecognized_drops: AtomicU64,

    /// Cancels the reactor
    cancel: CancellationToken,
}

impl Circuit {
    /// Build a circuit along `path` over an established link
    ///
    /// Sends CREATE2 to the first relay and RELAY_EARLY/EXTEND2 for each
    /// later hop, deriving hop keys via ntor as each round completes.
    pub async fn build(
        link: Arc<dyn CellSink>,
        circuit_id: u32,
        mut inbound: mpsc::Receiver<Cell>,
        path: &[Relay],
        purpose: CircuitPurpose,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        if path.is_empty() || path.len() > MAX_HOPS {
            return Err(TorError::CircuitBuildFailed(format!(
                "path length {} unsupported",
                path.len()
            )));
        }

        let deadline = Instant::now() + BUILD_TIMEOUT;
        let authenticated_sendmes = link.link_version() >= LinkVersion::V4;

        let circuit = Arc::new(Self {
            id: circuit_id,
            purpose,
            path: path.iter().map(|r| r.fingerprint.clone()).collect(),
            link,
            io: tokio::sync::Mutex::new(CircuitIo {
                hops: Vec::with_capacity(path.len()),
                relay_early_remaining: MAX_RELAY_EARLY,
                packaged_data: 0,
            }),
            state: Mutex::new(CircuitState::Building),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: Mutex::new(1),
            send_window: Arc::new(SendWindow::circuit()),
            recv_window: Mutex::new(RecvWindow::circuit()),
            sendme_auth: SendmeAuth::new(authenticated_sendmes),
            created_at: Instant::now(),
            last_used: Mutex::new(Instant::now()),
            unrecognized_drops: AtomicU64::new(0),
            cancel,
        });

        // First hop: CREATE2 / CREATED2.
        let first = &path[0];
        let handshake = NtorClient::new(
            decode_fingerprint(&first.fingerprint)?,
            decode_ntor_key(first)?,
        );
        let mut create2 = Vec::with_capacity(4 + 84);
        create2.extend_from_slice(&2u16.to_be_bytes()); // HTYPE: ntor
        create2.extend_from_slice(&(84u16).to_be_bytes());
        create2.extend_from_slice(&handshake.payload());

        circuit
            .link
            .send(Cell::new(circuit_id, CellCommand::Create2, create2))
            .await?;

        let reply = recv_cell_deadline(&mut inbound, &circuit.cancel, deadline).await?;
        let hop_keys = match reply.command {
            CellCommand::Created2 => {
                let hdata = parse_handshake_reply(&reply.payload)?;
                handshake.complete(hdata)?
            }
            CellCommand::Destroy => {
                circuit.mark(CircuitState::Failed);
                circuit.link.unregister_circuit(circuit_id);
                let reason = reply.payload.first().copied().unwrap_or(0);
                return Err(TorError::circuit_destroyed(reason));
            }
            other => {
                circuit.mark(CircuitState::Failed);
                circuit.link.unregister_circuit(circuit_id);
                return Err(TorError::CircuitBuildFailed(format!(
                    "expected CREATED2, got {:?}",
                    other
                )));
            }
        };
        circuit
            .io
            .lock()
            .await
            .hops
            .push(HopState::new(hop_keys, first.fingerprint.clone()));
        log::debug!("circuit {}: first hop {} ready", circuit_id, first.nickname);

        // Remaining hops: RELAY_EARLY / EXTEND2.
        for relay in &path[1..] {
            if let Err(e) = circuit.extend_inner(relay, &mut inbound, deadline).await {
                circuit.mark(CircuitState::Failed);
                circuit.link.unregister_circuit(circuit_id);
                return Err(e);
            }
            log::debug!("circuit {}: extended to {}", circuit_id, relay.nickname);
        }

        circuit.mark(CircuitState::Open);
        circuit.spawn_reactor(inbound);
        log::info!(
            "circuit {} open: {} hops, purpose {:?}",
            circuit_id,
            path.len(),
            purpose
        );
        Ok(circuit)
    }

    /// Extend the circuit one hop (EXTEND2 / EXTENDED2)
    async fn extend_inner(
        &self,
        relay: &Relay,
        inbound: &mut mpsc::Receiver<Cell>,
        deadline: Instant,
    ) -> Result<()> {
        let handshake = NtorClient::new(
            decode_fingerprint(&relay.fingerprint)?,
            decode_ntor_key(relay)?,
        );

        let extend2 = extend2_payload(relay, &handshake.payload())?;
        let relay_cell = RelayCell::new(RelayCommand::Extend2, 0, extend2);
        self.send_sealed(relay_cell, true, false).await?;

        // Wait for EXTENDED2, peeling layers as usual.
        let reply = loop {
            let cell = recv_cell_deadline(inbound, &self.cancel, deadline).await?;
            match cell.command {
                CellCommand::Relay | CellCommand::RelayEarly => {
                    let mut payload = cell.payload;
                    payload.resize(Cell::PAYLOAD_LEN, 0);
                    let mut io = self.io.lock().await;
                    match decrypt_inbound(&mut io.hops, &mut payload) {
                        Some(_) => break RelayCell::decode(&payload)?,
                        None => {
                            // Not recognized: dropped silently.
                            self.unrecognized_drops.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    }
                }
                CellCommand::Destroy => {
                    let reason = cell.payload.first().copied().unwrap_or(0);
                    return Err(TorError::circuit_destroyed(reason));
                }
                other => {
                    return Err(TorError::CircuitBuildFailed(format!(
                        "expected EXTENDED2, got {:?}",
                        other
                    )))
                }
            }
        };

        match reply.command {
            RelayCommand::Extended2 => {
                let hdata = parse_handshake_reply(&reply.data)?;
                let keys = handshake.complete(hdata)?;
                self.io
                    .lock()
                    .await
                    .hops
                    .push(HopState::new(keys, relay.fingerprint.clone()));
                Ok(())
            }
            RelayCommand::Truncated => {
                let reason = reply.data.first().copied().unwrap_or(0);
                Err(TorError::circuit_destroyed(reason))
            }
            other => Err(TorError::CircuitBuildFailed(format!(
                "expected EXTENDED2 relay command, got {:?}",
                other
            ))),
        }
    }

    /// Append an already-derived hop (rendezvous join)
    pub async fn append_hop(&self, keys: HopKeys, fingerprint: String) -> Result<()> {
        let mut io = self.io.lock().await;
        if io.hops.len() >= MAX_HOPS {
            return Err(TorError::CircuitBuildFailed("hop limit reached".into()));
        }
        io.hops.push(HopState::new(keys, fingerprint));
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        *self.state.lock().expect("state lock")
    }

    /// Whether streams may be opened
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Number of hops
    pub async fn hop_count(&self) -> usize {
        self.io.lock().await.hops.len()
    }

    /// Circuit-level package window handle
    pub fn send_window(&self) -> Arc<SendWindow> {
        Arc::clone(&self.send_window)
    }

    /// Seconds since a stream last used this circuit
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().expect("last_used lock").elapsed()
    }

    /// Cells dropped because no hop recognized them
    pub fn unrecognized_drops(&self) -> u64 {
        self.unrecognized_drops.load(Ordering::Relaxed)
    }

    /// Register a new stream; returns its id, inbound queue and window
    pub fn add_stream(&self) -> Result<(u16, mpsc::Receiver<RelayCell>, Arc<SendWindow>)> {
        if !self.is_open() {
            return Err(TorError::CircuitClosed(format!(
                "circuit {} is {:?}",
                self.id,
                self.state()
            )));
        }

        let mut streams = self.streams.lock().expect("streams lock");
        let mut next = self.next_stream_id.lock().expect("stream id lock");

        // Stream ids are unique within a circuit and never zero.
        let mut candidate = *next;
        loop {
            if candidate == 0 {
                candidate = 1;
            }
            if !streams.contains_key(&candidate) {
                break;
            }
            candidate = candidate.wrapping_add(1);
        }
        *next = candidate.wrapping_add(1);

        let (tx, rx) = mpsc::channel(64);
        let send_window = Arc::new(SendWindow::stream());
        streams.insert(
            candidate,
            StreamEntry {
                tx,
                send_window: Arc::clone(&send_window),
                recv_window: RecvWindow::stream(),
            },
        );
        *self.last_used.lock().expect("last_used lock") = Instant::now();
        Ok((candidate, rx, send_window))
    }

    /// Drop a stream's routing entry
    pub fn remove_stream(&self, stream_id: u16) {
        self.streams.lock().expect("streams lock").remove(&stream_id);
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("streams lock").len()
    }

    /// Send a non-DATA relay cell to the last hop
    pub async fn send_relay_cell(&self, cell: RelayCell) -> Result<()> {
        self.send_sealed(cell, false, false).await
    }

    /// Package one DATA cell, honoring the circuit window
    ///
    /// The caller has already taken a stream-window credit.
    pub async fn package_data(&self, cell: RelayCell) -> Result<()> {
        debug_assert_eq!(cell.command, RelayCommand::Data);
        tokio::select! {
            _ = self.send_window.take() => {}
            _ = self.cancel.cancelled() => return Err(TorError::Cancelled),
        }
        *self.last_used.lock().expect("last_used lock") = Instant::now();
        self.send_sealed(cell, false, true).await
    }

    /// Seal (digest + onion-encrypt) and transmit one relay cell
    async fn send_sealed(&self, cell: RelayCell, early: bool, is_data: bool) -> Result<()> {
        match self.state() {
            CircuitState::Closed | CircuitState::Failed => {
                return Err(TorError::CircuitClosed(format!("circuit {}", self.id)))
            }
            _ => {}
        }

        let mut payload = cell.encode()?;

        let mut io = self.io.lock().await;
        if io.hops.is_empty() {
            return Err(TorError::CircuitClosed("circuit has no hops".into()));
        }
        if early {
            if io.relay_early_remaining == 0 {
                return Err(TorError::CircuitBuildFailed(
                    "RELAY_EARLY budget exhausted".into(),
                ));
            }
            io.relay_early_remaining -= 1;
        }

        let target = io.hops.len() - 1;
        encrypt_outbound(&mut io.hops, target, &mut payload);

        if is_data {
            io.packaged_data += 1;
            if io.packaged_data % u64::from(CIRCUIT_WINDOW_INCREMENT as u32) == 0 {
                self.sendme_auth.record(io.hops[target].forward_digest_snapshot());
            }
        }

        let command = if early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        // The io lock is held across the send so cells reach the wire in
        // digest order.
        self.link.send(Cell::new(self.id, command, payload)).await?;
        drop(io);
        Ok(())
    }

    /// Voluntarily close the circuit
    pub async fn close(&self, reason: u8) {
        if matches!(self.state(), CircuitState::Closed | CircuitState::Failed) {
            return;
        }
        let _ = self
            .link
            .send(Cell::new(self.id, CellCommand::Destroy, vec![reason]))
            .await;
        self.shutdown(CircuitState::Closed);
    }

    /// Common teardown: state change, stream release, key zeroization
    fn shutdown(&self, terminal: CircuitState) {
        self.mark(terminal);
        self.cancel.cancel();
        self.streams.lock().expect("streams lock").clear();
        self.link.unregister_circuit(self.id);
        // Hop state (and with it all key material) is dropped by the
        // reactor or the final Arc owner; HopKeys zeroizes on drop.
    }

    fn mark(&self, state: CircuitState) {
        let mut current = self.state.lock().expect("state lock");
        *current = state;
    }

    /// Run the inbound reactor for an open circuit
    fn spawn_reactor(self: &Arc<Self>, mut inbound: mpsc::Receiver<Cell>) {
        let circuit = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let cell = tokio::select! {
                    cell = inbound.recv() => cell,
                    _ = circuit.cancel.cancelled() => break,
                };
                let Some(cell) = cell else {
                    // Link died underneath us.
                    log::debug!("circuit {}: link closed", circuit.id);
                    circuit.shutdown(CircuitState::Failed);
                    break;
                };

                match cell.command {
                    CellCommand::Relay | CellCommand::RelayEarly => {
                        if let Err(e) = circuit.handle_relay(cell).await {
                            log::warn!("circuit {}: {}", circuit.id, e);
                            circuit.shutdown(CircuitState::Failed);
                            break;
                        }
                    }
                    CellCommand::Destroy => {
                        let reason = cell.payload.first().copied().unwrap_or(0);
                        log::info!(
                            "circuit {} destroyed by relay: {}",
                            circuit.id,
                            crate::error::destroy_reason_name(reason)
                        );
                        circuit.shutdown(CircuitState::Failed);
                        break;
                    }
                    CellCommand::Padding | CellCommand::Vpadding => {}
                    other => {
                        log::debug!("circuit {}: ignoring {:?}", circuit.id, other);
                    }
                }
            }

            // Drop all hop state now; HopKeys zeroize on drop.
            circuit.io.lock().await.hops.clear();
        });
    }

    /// Decrypt, recognize and dispatch one inbound relay cell
    async fn handle_relay(&self, cell: Cell) -> Result<()> {
        let mut payload = cell.payload;
        payload.resize(Cell::PAYLOAD_LEN, 0);

        let mut io = self.io.lock().await;
        let Some(hop_idx) = decrypt_inbound(&mut io.hops, &mut payload) else {
            // Unrecognized everywhere: drop silently, touch nothing.
            self.unrecognized_drops.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        let origin_digest = io.hops[hop_idx].backward_digest_snapshot();
        drop(io);

        let relay_cell = match RelayCell::decode(&payload) {
            Ok(c) => c,
            Err(e) => {
                log::debug!("circuit {}: bad relay cell from hop {}: {}", self.id, hop_idx, e);
                return Ok(());
            }
        };

        match relay_cell.command {
            RelayCommand::Data => {
                // Circuit-level deliver accounting first.
                let circuit_sendme = self
                    .recv_window
                    .lock()
                    .expect("recv window lock")
                    .on_deliver()?;
                if circuit_sendme {
                    let sendme =
                        RelayCell::new(RelayCommand::Sendme, 0, sendme_payload_v1(&origin_digest));
                    self.send_sealed(sendme, false, false).await?;
                }

                // Stream-level delivery and SENDME.
                let (tx, stream_sendme) = {
                    let mut streams = self.streams.lock().expect("streams lock");
                    match streams.get_mut(&relay_cell.stream_id) {
                        Some(entry) => (Some(entry.tx.clone()), entry.recv_window.on_deliver()?),
                        None => (None, false),
                    }
                };
                let stream_id = relay_cell.stream_id;
                match tx {
                    Some(tx) => {
                        if tx.send(relay_cell).await.is_err() {
                            self.remove_stream(stream_id);
                        }
                    }
                    None => {
                        log::trace!("circuit {}: DATA for unknown stream {}", self.id, stream_id);
                        return Ok(());
                    }
                }
                if stream_sendme {
                    let sendme = RelayCell::new(RelayCommand::Sendme, stream_id, vec![]);
                    self.send_sealed(sendme, false, false).await?;
                }
            }

            RelayCommand::Sendme => {
                if relay_cell.stream_id == 0 {
                    self.sendme_auth.validate(&relay_cell.data)?;
                    self.send_window.release();
                } else {
                    let window = {
                        let streams = self.streams.lock().expect("streams lock");
                        streams
                            .get(&relay_cell.stream_id)
                            .map(|e| Arc::clone(&e.send_window))
                    };
                    if let Some(window) = window {
                        window.release();
                    }
                }
            }

            RelayCommand::Connected
            | RelayCommand::End
            | RelayCommand::Resolved => {
                let stream_id = relay_cell.stream_id;
                let tx = {
                    let streams = self.streams.lock().expect("streams lock");
                    streams.get(&stream_id).map(|e| e.tx.clone())
                };
                let is_end = relay_cell.command == RelayCommand::End;
                if let Some(tx) = tx {
                    let _ = tx.send(relay_cell).await;
                }
                if is_end {
                    self.remove_stream(stream_id);
                }
            }

            RelayCommand::Truncated => {
                let reason = relay_cell.data.first().copied().unwrap_or(0);
                log::info!(
                    "circuit {} truncated: {}",
                    self.id,
                    crate::error::destroy_reason_name(reason)
                );
                self.shutdown(CircuitState::Failed);
            }

            // Rendezvous-protocol replies flow to the waiting opener via
            // the pseudo-stream registered for them.
            RelayCommand::RendezvousEstablished
            | RelayCommand::Rendezvous2
            | RelayCommand::IntroduceAck => {
                let tx = {
                    let streams = self.streams.lock().expect("streams lock");
                    streams.get(&0).map(|e| e.tx.clone())
                };
                if let Some(tx) = tx {
                    let _ = tx.send(relay_cell).await;
                }
            }

            RelayCommand::Extended2 => {
                // Only meaningful while building; afterwards it is noise.
                log::debug!("circuit {}: stray EXTENDED2", self.id);
            }

            other => {
                log::debug!("circuit {}: unhandled relay command {:?}", self.id, other);
            }
        }
        Ok(())
    }

    /// Register the circuit-level pseudo-stream used by rendezvous
    /// replies (stream id 0)
    pub fn register_control_stream(&self) -> mpsc::Receiver<RelayCell> {
        let (tx, rx) = mpsc::channel(8);
        self.streams.lock().expect("streams lock").insert(
            0,
            StreamEntry {
                tx,
                send_window: Arc::new(SendWindow::stream()),
                recv_window: RecvWindow::stream(),
            },
        );
        rx
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("purpose", &self.purpose)
            .field("state", &self.state())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Wait for one cell, honoring cancellation and the build deadline
async fn recv_cell_deadline(
    inbound: &mut mpsc::Receiver<Cell>,
    cancel: &CancellationToken,
    build_deadline: Instant,
) -> Result<Cell> {
    let round_deadline = Instant::now() + EXTEND_TIMEOUT;
    let deadline = round_deadline.min(build_deadline);

    tokio::select! {
        cell = inbound.recv() => {
            cell.ok_or_else(|| TorError::CircuitClosed("link closed during build".into()))
        }
        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
            Err(TorError::Timeout("circuit build round"))
        }
        _ = cancel.cancelled() => Err(TorError::Cancelled),
    }
}

/// Parse `HLEN (2) || HDATA` from CREATED2 / EXTENDED2
fn parse_handshake_reply(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < 2 {
        return Err(TorError::Cell("handshake reply too short".into()));
    }
    let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if hlen < 64 || payload.len() < 2 + hlen {
        return Err(TorError::Cell(format!("handshake reply length {}", hlen)));
    }
    Ok(&payload[2..2 + hlen])
}

/// Build an EXTEND2 body: link specifiers plus the ntor handshake
fn extend2_payload(relay: &Relay, handshake: &[u8]) -> Result<Vec<u8>> {
    let mut specs: Vec<(u8, Vec<u8>)> = Vec::new();

    match relay.address {
        std::net::IpAddr::V4(v4) => {
            let mut s = v4.octets().to_vec();
            s.extend_from_slice(&relay.or_port.to_be_bytes());
            specs.push((0x00, s));
        }
        std::net::IpAddr::V6(v6) => {
            let mut s = v6.octets().to_vec();
            s.extend_from_slice(&relay.or_port.to_be_bytes());
            specs.push((0x01, s));
        }
    }
    specs.push((0x02, decode_fingerprint(&relay.fingerprint)?.to_vec()));

    let mut out = Vec::with_capacity(64 + handshake.len());
    out.push(specs.len() as u8);
    for (lstype, body) in &specs {
        out.push(*lstype);
        out.push(body.len() as u8);
        out.extend_from_slice(body);
    }
    out.extend_from_slice(&2u16.to_be_bytes()); // HTYPE: ntor
    out.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    out.extend_from_slice(handshake);
    Ok(out)
}

/// Decode a hex fingerprint into its 20 identity bytes
pub fn decode_fingerprint(fingerprint: &str) -> Result<[u8; 20]> {
    let bytes = hex::decode(fingerprint)
        .map_err(|_| TorError::CircuitBuildFailed("bad fingerprint hex".into()))?;
    bytes
        .try_into()
        .map_err(|_| TorError::CircuitBuildFailed("fingerprint must be 20 bytes".into()))
}

/// Decode a relay's base64 ntor onion key
pub fn decode_ntor_key(relay: &Relay) -> Result<[u8; 32]> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
    use base64::Engine as _;

    let encoded = relay.ntor_onion_key.as_ref().ok_or_else(|| {
        TorError::CircuitBuildFailed(format!("{} has no ntor onion key", relay.nickname))
    })?;
    let bytes = STANDARD_NO_PAD
        .decode(encoded)
        .or_else(|_| STANDARD.decode(encoded))
        .map_err(|_| TorError::CircuitBuildFailed("bad ntor key encoding".into()))?;
    bytes
        .try_into()
        .map_err(|_| TorError::CircuitBuildFailed("ntor key must be 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend2_payload_layout() {
        use crate::protocol::relay::{Relay, RelayFlags};
        let relay = Relay {
            nickname: "mid".into(),
            fingerprint: "AA".repeat(20),
            ed_identity: None,
            address: "10.0.0.1".parse().unwrap(),
            or_port: 9001,
            dir_port: None,
            flags: RelayFlags::default(),
            bandwidth_weight: 1,
            exit_policy: Default::default(),
            family: Default::default(),
            country_code: None,
            ntor_onion_key: None,
        };

        let handshake = vec![0xEE; 84];
        let payload = extend2_payload(&relay, &handshake).unwrap();

        // NSPEC=2, IPv4 spec (2 + 6), legacy id spec (2 + 20),
        // HTYPE (2), HLEN (2), HDATA (84).
        assert_eq!(payload[0], 2);
        assert_eq!(payload[1], 0x00);
        assert_eq!(payload[2], 6);
        assert_eq!(&payload[3..7], &[10, 0, 0, 1]);
        assert_eq!(&payload[7..9], &9001u16.to_be_bytes());
        assert_eq!(payload[9], 0x02);
        assert_eq!(payload[10], 20);
        assert_eq!(&payload[11..31], &[0xAA; 20][..]);
        assert_eq!(&payload[31..33], &2u16.to_be_bytes());
        assert_eq!(&payload[33..35], &84u16.to_be_bytes());
        assert_eq!(payload.len(), 35 + 84);
    }

    #[test]
    fn test_parse_handshake_reply() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&64u16.to_be_bytes());
        payload.extend_from_slice(&[0x11; 64]);
        payload.extend_from_slice(&[0u8; 10]); // padding

        let hdata = parse_handshake_reply(&payload).unwrap();
        assert_eq!(hdata, &[0x11; 64][..]);

        assert!(parse_handshake_reply(&[0, 10]).is_err());
        assert!(parse_handshake_reply(&[]).is_err());
    }

    #[test]
    fn test_decode_fingerprint() {
        assert_eq!(decode_fingerprint(&"AB".repeat(20)).unwrap(), [0xAB; 20]);
        assert!(decode_fingerprint("xyz").is_err());
        assert!(decode_fingerprint("ABCD").is_err());
    }
}
