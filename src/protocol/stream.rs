//! Streams over circuits
//!
//! Opens and multiplexes application streams on a circuit: RELAY_BEGIN
//! / RELAY_CONNECTED, DATA with per-stream flow control, RELAY_END, and
//! DNS resolution via RELAY_RESOLVE. Hostnames are only ever written
//! into relay cells; nothing here touches a local resolver.

use crate::error::{Result, TorError};
use crate::onion::address::OnionAddressV3;
use crate::protocol::cell::{RelayCell, RelayCommand};
use crate::protocol::circuit::Circuit;
use crate::protocol::flow_control::SendWindow;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// RELAY_BEGIN -> RELAY_CONNECTED deadline
pub const BEGIN_TIMEOUT: Duration = Duration::from_secs(15);

/// RELAY_END reason used for an orderly local close
pub const END_REASON_DONE: u8 = 6;

/// Where a stream should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Direct address
    Tcp(IpAddr, u16),
    /// Hostname resolved by the exit
    Hostname(String, u16),
    /// v3 onion service
    OnionV3(OnionAddressV3, u16),
}

impl Target {
    /// Destination port
    pub fn port(&self) -> u16 {
        match self {
            Target::Tcp(_, port) | Target::Hostname(_, port) | Target::OnionV3(_, port) => *port,
        }
    }

    /// The ADDRPORT body of a RELAY_BEGIN cell (NUL-terminated)
    pub fn begin_payload(&self) -> Vec<u8> {
        let addrport = match self {
            Target::Tcp(IpAddr::V4(v4), port) => format!("{}:{}", v4, port),
            Target::Tcp(IpAddr::V6(v6), port) => format!("[{}]:{}", v6, port),
            Target::Hostname(host, port) => format!("{}:{}", host, port),
            // Onion targets never name the service to the exit; BEGIN
            // runs on the rendezvous circuit with only the port.
            Target::OnionV3(_, port) => format!(":{}", port),
        };
        let mut out = addrport.into_bytes();
        out.push(0);
        out
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Tcp(addr, port) => write!(f, "{}:{}", addr, port),
            Target::Hostname(host, port) => write!(f, "{}:{}", host, port),
            Target::OnionV3(addr, port) => write!(f, "{}:{}", addr, port),
        }
    }
}

/// A DNS answer from RELAY_RESOLVED
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAddr {
    /// An address answer, with the exit's TTL hint
    Ip { addr: IpAddr, ttl: u32 },
    /// A hostname answer (PTR lookups), with the exit's TTL hint
    Hostname { name: String, ttl: u32 },
}

impl ResolvedAddr {
    /// The address, when this answer carries one
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            ResolvedAddr::Ip { addr, .. } => Some(*addr),
            ResolvedAddr::Hostname { .. } => None,
        }
    }
}

/// Opens streams on one circuit
pub struct StreamManager {
    circuit: Arc<Circuit>,
}

impl StreamManager {
    /// Create a manager for the given circuit
    pub fn new(circuit: Arc<Circuit>) -> Self {
        Self { circuit }
    }

    /// Open a stream to `target`
    pub async fn begin(&self, target: &Target) -> Result<TorStream> {
        let (stream_id, mut rx, send_window) = self.circuit.add_stream()?;
        log::debug!(
            "circuit {}: opening stream {} to {}",
            self.circuit.id,
            stream_id,
            target
        );

        let begin = RelayCell::new(RelayCommand::Begin, stream_id, target.begin_payload());
        if let Err(e) = self.circuit.send_relay_cell(begin).await {
            self.circuit.remove_stream(stream_id);
            return Err(e);
        }

        match Self::await_reply(&mut rx, RelayCommand::Connected).await {
            Ok(_) => {
                log::debug!("circuit {}: stream {} connected", self.circuit.id, stream_id);
                Ok(TorStream::new(
                    stream_id,
                    Arc::downgrade(&self.circuit),
                    rx,
                    send_window,
                ))
            }
            Err(e) => {
                self.circuit.remove_stream(stream_id);
                Err(e)
            }
        }
    }

    /// Open a directory stream (RELAY_BEGIN_DIR)
    pub async fn begin_dir(&self) -> Result<TorStream> {
        let (stream_id, mut rx, send_window) = self.circuit.add_stream()?;

        let begin = RelayCell::new(RelayCommand::BeginDir, stream_id, vec![]);
        if let Err(e) = self.circuit.send_relay_cell(begin).await {
            self.circuit.remove_stream(stream_id);
            return Err(e);
        }

        match Self::await_reply(&mut rx, RelayCommand::Connected).await {
            Ok(_) => Ok(TorStream::new(
                stream_id,
                Arc::downgrade(&self.circuit),
                rx,
                send_window,
            )),
            Err(e) => {
                self.circuit.remove_stream(stream_id);
                Err(e)
            }
        }
    }

    /// Resolve a hostname through the exit
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<ResolvedAddr>> {
        let (stream_id, mut rx, _send_window) = self.circuit.add_stream()?;

        let mut payload = hostname.as_bytes().to_vec();
        payload.push(0);
        let resolve = RelayCell::new(RelayCommand::Resolve, stream_id, payload);
        if let Err(e) = self.circuit.send_relay_cell(resolve).await {
            self.circuit.remove_stream(stream_id);
            return Err(e);
        }

        let reply = Self::await_reply(&mut rx, RelayCommand::Resolved).await;
        self.circuit.remove_stream(stream_id);
        parse_resolved(&reply?.data)
    }

    /// Wait for the expected reply, mapping RELAY_END to a stream error
    async fn await_reply(
        rx: &mut mpsc::Receiver<RelayCell>,
        expected: RelayCommand,
    ) -> Result<RelayCell> {
        let deadline = tokio::time::sleep(BEGIN_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            let cell = tokio::select! {
                cell = rx.recv() => cell,
                _ = &mut deadline => return Err(TorError::Timeout("stream open")),
            };
            let Some(cell) = cell else {
                return Err(TorError::CircuitClosed("circuit went away".into()));
            };
            if cell.command == expected {
                return Ok(cell);
            }
            match cell.command {
                RelayCommand::End => {
                    let reason = cell.data.first().copied().unwrap_or(1);
                    return Err(TorError::stream_ended(reason));
                }
                other => {
                    return Err(TorError::Stream(format!(
                        "expected {:?}, got {:?}",
                        expected, other
                    )))
                }
            }
        }
    }
}

/// One open stream
pub struct TorStream {
    /// Stream id, unique within its circuit, never zero
    stream_id: u16,

    /// Back-reference to the circuit; weak so a dying circuit can
    /// release everything without waiting on its streams
    circuit: Weak<Circuit>,

    /// Inbound relay cells routed here by the reactor
    recv: mpsc::Receiver<RelayCell>,

    /// Stream-level package window
    send_window: Arc<SendWindow>,

    /// Bytes from a DATA cell not yet handed to the reader
    leftover: Vec<u8>,

    /// RELAY_END seen
    end_received: bool,

    /// Locally closed
    closed: bool,
}

impl TorStream {
    fn new(
        stream_id: u16,
        circuit: Weak<Circuit>,
        recv: mpsc::Receiver<RelayCell>,
        send_window: Arc<SendWindow>,
    ) -> Self {
        Self {
            stream_id,
            circuit,
            recv,
            send_window,
            leftover: Vec::new(),
            end_received: false,
            closed: false,
        }
    }

    /// Stream id within the circuit
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Circuit id, if the circuit is still alive
    pub fn circuit_id(&self) -> Option<u32> {
        self.circuit.upgrade().map(|c| c.id)
    }

    /// Write all of `data`, splitting into DATA cells and honoring both
    /// the stream and the circuit windows
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TorError::Stream("stream is closed".into()));
        }
        let circuit = self
            .circuit
            .upgrade()
            .ok_or_else(|| TorError::CircuitClosed("circuit dropped".into()))?;

        for chunk in data.chunks(RelayCell::MAX_DATA_LEN) {
            self.send_window.take().await;
            let cell = RelayCell::new(RelayCommand::Data, self.stream_id, chunk.to_vec());
            circuit.package_data(cell).await?;
        }
        Ok(())
    }

    /// Read some bytes; `Ok(0)` means end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            return Ok(n);
        }
        if self.end_received || self.closed {
            return Ok(0);
        }

        loop {
            let Some(cell) = self.recv.recv().await else {
                // Circuit torn down underneath us.
                self.end_received = true;
                return Ok(0);
            };
            match cell.command {
                RelayCommand::Data => {
                    let n = cell.data.len().min(buf.len());
                    buf[..n].copy_from_slice(&cell.data[..n]);
                    if n < cell.data.len() {
                        self.leftover.extend_from_slice(&cell.data[n..]);
                    }
                    return Ok(n);
                }
                RelayCommand::End => {
                    self.end_received = true;
                    return Ok(0);
                }
                other => {
                    log::debug!("stream {}: ignoring {:?}", self.stream_id, other);
                }
            }
        }
    }

    /// Read until end of stream
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; RelayCell::MAX_DATA_LEN];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Close the stream with RELAY_END (reason DONE); wait-free
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(circuit) = self.circuit.upgrade() {
            let end = RelayCell::new(RelayCommand::End, self.stream_id, vec![END_REASON_DONE]);
            let _ = circuit.send_relay_cell(end).await;
            circuit.remove_stream(self.stream_id);
        }
    }

    /// Split into independently owned read and write halves
    ///
    /// The bridge in the SOCKS front door pumps both directions
    /// concurrently; each half can be driven by its own task.
    pub fn into_split(mut self) -> (TorStreamReadHalf, TorStreamWriteHalf) {
        let (_, dummy_rx) = mpsc::channel(1);
        let recv = std::mem::replace(&mut self.recv, dummy_rx);
        let leftover = std::mem::take(&mut self.leftover);
        let circuit = std::mem::replace(&mut self.circuit, Weak::new());
        let send_window = Arc::clone(&self.send_window);
        let stream_id = self.stream_id;
        let end_received = self.end_received;

        // The halves own cleanup from here on.
        self.closed = true;

        (
            TorStreamReadHalf {
                stream_id,
                circuit: circuit.clone(),
                recv,
                leftover,
                end_received,
            },
            TorStreamWriteHalf {
                stream_id,
                circuit,
                send_window,
                closed: false,
            },
        )
    }
}

/// Read half of a split stream
pub struct TorStreamReadHalf {
    stream_id: u16,
    circuit: Weak<Circuit>,
    recv: mpsc::Receiver<RelayCell>,
    leftover: Vec<u8>,
    end_received: bool,
}

impl TorStreamReadHalf {
    /// Read some bytes; `Ok(0)` means end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            return Ok(n);
        }
        if self.end_received {
            return Ok(0);
        }

        loop {
            let Some(cell) = self.recv.recv().await else {
                self.end_received = true;
                return Ok(0);
            };
            match cell.command {
                RelayCommand::Data => {
                    let n = cell.data.len().min(buf.len());
                    buf[..n].copy_from_slice(&cell.data[..n]);
                    if n < cell.data.len() {
                        self.leftover.extend_from_slice(&cell.data[n..]);
                    }
                    return Ok(n);
                }
                RelayCommand::End => {
                    self.end_received = true;
                    return Ok(0);
                }
                other => {
                    log::debug!("stream {}: ignoring {:?}", self.stream_id, other);
                }
            }
        }
    }
}

impl Drop for TorStreamReadHalf {
    fn drop(&mut self) {
        if let Some(circuit) = self.circuit.upgrade() {
            circuit.remove_stream(self.stream_id);
        }
    }
}

/// Write half of a split stream
pub struct TorStreamWriteHalf {
    stream_id: u16,
    circuit: Weak<Circuit>,
    send_window: Arc<SendWindow>,
    closed: bool,
}

impl TorStreamWriteHalf {
    /// Write all of `data`, honoring both windows
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TorError::Stream("stream is closed".into()));
        }
        let circuit = self
            .circuit
            .upgrade()
            .ok_or_else(|| TorError::CircuitClosed("circuit dropped".into()))?;

        for chunk in data.chunks(RelayCell::MAX_DATA_LEN) {
            self.send_window.take().await;
            let cell = RelayCell::new(RelayCommand::Data, self.stream_id, chunk.to_vec());
            circuit.package_data(cell).await?;
        }
        Ok(())
    }

    /// Send RELAY_END (reason DONE); wait-free
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(circuit) = self.circuit.upgrade() {
            let end = RelayCell::new(RelayCommand::End, self.stream_id, vec![END_REASON_DONE]);
            let _ = circuit.send_relay_cell(end).await;
        }
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        if !self.closed && !self.end_received {
            log::debug!("stream {} dropped without close", self.stream_id);
        }
        if let Some(circuit) = self.circuit.upgrade() {
            circuit.remove_stream(self.stream_id);
        }
    }
}

/// Parse RELAY_RESOLVED answers
///
/// Each answer: TYPE (1) | LEN (1) | VALUE | TTL (4). Types 0x04/0x06
/// are addresses; 0xF0/0xF1 are errors.
fn parse_resolved(data: &[u8]) -> Result<Vec<ResolvedAddr>> {
    let mut out = Vec::new();
    let mut offset = 0usize;

    while offset + 2 <= data.len() {
        let answer_type = data[offset];
        let len = data[offset + 1] as usize;
        offset += 2;
        if offset + len + 4 > data.len() {
            return Err(TorError::Cell("RESOLVED answer truncated".into()));
        }
        let value = &data[offset..offset + len];
        let ttl = u32::from_be_bytes([
            data[offset + len],
            data[offset + len + 1],
            data[offset + len + 2],
            data[offset + len + 3],
        ]);
        offset += len + 4;

        match answer_type {
            0x00 => {
                let name = String::from_utf8(value.to_vec())
                    .map_err(|_| TorError::Cell("RESOLVED hostname not UTF-8".into()))?;
                out.push(ResolvedAddr::Hostname { name, ttl });
            }
            0x04 if len == 4 => {
                let octets: [u8; 4] = value.try_into().expect("length checked");
                out.push(ResolvedAddr::Ip {
                    addr: IpAddr::from(octets),
                    ttl,
                });
            }
            0x06 if len == 16 => {
                let octets: [u8; 16] = value.try_into().expect("length checked");
                out.push(ResolvedAddr::Ip {
                    addr: IpAddr::from(octets),
                    ttl,
                });
            }
            0xF0 | 0xF1 => {
                return Err(TorError::stream_ended(2)); // RESOLVEFAILED
            }
            _ => {
                log::debug!("ignoring RESOLVED answer type {:#x}", answer_type);
            }
        }
    }

    if out.is_empty() {
        return Err(TorError::stream_ended(2));
    }
    Ok(out)
}
