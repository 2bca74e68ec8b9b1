//! Tor cell codec
//!
//! Encodes and decodes the link-layer cell formats: fixed-length cells
//! (512 bytes on link v3, 514 bytes on v4/v5 with 4-byte circuit ids),
//! variable-length cells (explicit 16-bit length) and the relay subframe
//! carried inside RELAY / RELAY_EARLY payloads.
//!
//! Decoding is strict: unknown commands, short buffers and out-of-range
//! lengths are errors, and the decoder never allocates beyond the cell.

use crate::error::{Result, TorError};

/// Negotiated link protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkVersion {
    /// 2-byte circuit ids, 512-byte cells
    V3,
    /// 4-byte circuit ids, 514-byte cells
    V4,
    /// v4 framing plus padding negotiation
    V5,
}

impl LinkVersion {
    /// Versions this client offers, in ascending order
    pub const SUPPORTED: [u16; 3] = [3, 4, 5];

    /// Pick the highest common version from a peer's VERSIONS payload
    pub fn negotiate(peer_versions: &[u16]) -> Option<Self> {
        let best = peer_versions
            .iter()
            .filter(|v| Self::SUPPORTED.contains(v))
            .max()?;
        Self::from_u16(*best)
    }

    /// Parse a numeric link version
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            3 => Some(LinkVersion::V3),
            4 => Some(LinkVersion::V4),
            5 => Some(LinkVersion::V5),
            _ => None,
        }
    }

    /// Width of the circuit-id field in bytes
    pub fn circ_id_len(&self) -> usize {
        match self {
            LinkVersion::V3 => 2,
            LinkVersion::V4 | LinkVersion::V5 => 4,
        }
    }

    /// Total fixed cell length for this version
    pub fn cell_len(&self) -> usize {
        self.circ_id_len() + 1 + Cell::PAYLOAD_LEN
    }
}

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - link padding
    Padding = 0,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// VERSIONS - negotiate link versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell usable during extension
    RelayEarly = 9,
    /// CREATE2 - create a circuit
    Create2 = 10,
    /// CREATED2 - circuit created
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether this command uses the variable-length cell format
    pub fn is_variable_length(&self) -> bool {
        *self as u8 >= 128 || matches!(self, CellCommand::Versions)
    }
}

/// A link-layer cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (0 for connection-level cells)
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload; fixed cells are padded to PAYLOAD_LEN on encode
    pub payload: Vec<u8>,
}

impl Cell {
    /// Payload length of a fixed cell
    pub const PAYLOAD_LEN: usize = 509;

    /// Upper bound accepted for a variable cell's declared length
    pub const MAX_VAR_PAYLOAD: usize = 0xFFFF;

    /// Create a new cell
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a RELAY cell
    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, relay_payload)
    }

    /// Create a RELAY_EARLY cell
    pub fn relay_early(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::RelayEarly, relay_payload)
    }

    /// Serialize the cell for the given link version
    pub fn encode(&self, version: LinkVersion) -> Result<Vec<u8>> {
        // VERSIONS cells always use the 2-byte circuit id of link v3,
        // since they are sent before any version is negotiated.
        let circ_len = if self.command == CellCommand::Versions {
            2
        } else {
            version.circ_id_len()
        };

        if circ_len == 2 && self.circuit_id > u16::MAX as u32 {
            return Err(TorError::Overflow);
        }

        let mut buf = Vec::with_capacity(version.cell_len());
        if circ_len == 2 {
            buf.extend_from_slice(&(self.circuit_id as u16).to_be_bytes());
        } else {
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
        }
        buf.push(self.command as u8);

        if self.command.is_variable_length() {
            let len: u16 = self
                .payload
                .len()
                .try_into()
                .map_err(|_| TorError::Overflow)?;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&self.payload);
        } else {
            if self.payload.len() > Self::PAYLOAD_LEN {
                return Err(TorError::Cell(format!(
                    "fixed cell payload too long: {} bytes",
                    self.payload.len()
                )));
            }
            buf.extend_from_slice(&self.payload);
            buf.resize(buf.len() + (Self::PAYLOAD_LEN - self.payload.len()), 0);
        }

        Ok(buf)
    }

    /// Parse a complete cell from `data` for the given link version
    ///
    /// Returns the cell and the number of bytes consumed.
    pub fn decode(data: &[u8], version: LinkVersion) -> Result<(Self, usize)> {
        let circ_len = version.circ_id_len();
        if data.len() < circ_len + 1 {
            return Err(TorError::Cell("cell header truncated".into()));
        }

        let circuit_id = if circ_len == 2 {
            u16::from_be_bytes([data[0], data[1]]) as u32
        } else {
            u32::from_be_bytes([data[0], data[1], data[2], data[3]])
        };

        let cmd_byte = data[circ_len];
        let command = CellCommand::from_u8(cmd_byte).ok_or(TorError::UnknownCommand(cmd_byte))?;

        if command.is_variable_length() {
            let len_start = circ_len + 1;
            if data.len() < len_start + 2 {
                return Err(TorError::Cell("variable cell length truncated".into()));
            }
            let declared = u16::from_be_bytes([data[len_start], data[len_start + 1]]) as usize;
            let body_start = len_start + 2;
            let end = body_start
                .checked_add(declared)
                .ok_or(TorError::Overflow)?;
            if data.len() < end {
                return Err(TorError::Cell("variable cell body truncated".into()));
            }
            Ok((
                Self {
                    circuit_id,
                    command,
                    payload: data[body_start..end].to_vec(),
                },
                end,
            ))
        } else {
            let end = circ_len + 1 + Self::PAYLOAD_LEN;
            if data.len() < end {
                return Err(TorError::Cell("fixed cell truncated".into()));
            }
            Ok((
                Self {
                    circuit_id,
                    command,
                    payload: data[circ_len + 1..end].to_vec(),
                },
                end,
            ))
        }
    }
}

/// Relay command types (the subframe inside RELAY / RELAY_EARLY)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - stream data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - long-range padding
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - open directory stream
    BeginDir = 13,
    /// EXTEND2 - extend circuit
    Extend2 = 14,
    /// EXTENDED2 - circuit extended
    Extended2 = 15,
    /// ESTABLISH_RENDEZVOUS - set up a rendezvous point
    EstablishRendezvous = 33,
    /// INTRODUCE1 - client introduction
    Introduce1 = 34,
    /// RENDEZVOUS2 - service side of the rendezvous join
    Rendezvous2 = 37,
    /// RENDEZVOUS_ESTABLISHED - rendezvous point ack
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK - intro point ack
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            37 => Some(RelayCommand::Rendezvous2),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }

    /// Whether this command is circuit-level (stream id must be 0)
    pub fn is_circuit_level(&self) -> bool {
        matches!(
            self,
            RelayCommand::Truncate
                | RelayCommand::Truncated
                | RelayCommand::Drop
                | RelayCommand::Extend2
                | RelayCommand::Extended2
                | RelayCommand::EstablishRendezvous
                | RelayCommand::Introduce1
                | RelayCommand::Rendezvous2
                | RelayCommand::RendezvousEstablished
                | RelayCommand::IntroduceAck
        )
    }
}

/// Relay cell (payload within a RELAY or RELAY_EARLY cell)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (0 on cells we originate)
    pub recognized: u16,

    /// Stream ID (0 for circuit-level commands)
    pub stream_id: u16,

    /// Running-digest field (4 bytes)
    pub digest: [u8; 4],

    /// Data carried by this cell
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Relay header length: cmd(1) + recognized(2) + stream(2) + digest(4) + len(2)
    pub const HEADER_LEN: usize = 11;

    /// Maximum data bytes in one relay cell
    pub const MAX_DATA_LEN: usize = Cell::PAYLOAD_LEN - Self::HEADER_LEN;

    /// Create a new relay cell
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= Self::MAX_DATA_LEN);
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Serialize to exactly [`Cell::PAYLOAD_LEN`] bytes, zero-padded
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_DATA_LEN {
            return Err(TorError::Cell(format!(
                "relay data too long: {} bytes",
                self.data.len()
            )));
        }
        let len: u16 = self.data.len().try_into().map_err(|_| TorError::Overflow)?;

        let mut buf = Vec::with_capacity(Cell::PAYLOAD_LEN);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(Cell::PAYLOAD_LEN, 0);
        Ok(buf)
    }

    /// Parse a relay cell from a decrypted RELAY payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_LEN {
            return Err(TorError::Cell("relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(data[0]).ok_or(TorError::UnknownCommand(data[0]))?;
        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]) as usize;

        if length > Self::MAX_DATA_LEN {
            return Err(TorError::Cell(format!("relay length {} out of range", length)));
        }
        let end = Self::HEADER_LEN
            .checked_add(length)
            .ok_or(TorError::Overflow)?;
        if end > data.len() {
            return Err(TorError::Cell("relay cell data truncated".into()));
        }

        if stream_id == 0 && !command.is_circuit_level() && command != RelayCommand::Sendme {
            return Err(TorError::Cell(format!(
                "stream id 0 invalid for {:?}",
                command
            )));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: data[Self::HEADER_LEN..end].to_vec(),
        })
    }
}

/// Parse a VERSIONS payload into a list of link versions
pub fn parse_versions_payload(payload: &[u8]) -> Result<Vec<u16>> {
    if payload.len() % 2 != 0 {
        return Err(TorError::Cell("odd VERSIONS payload length".into()));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// Build a VERSIONS payload from a list of link versions
pub fn versions_payload(versions: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(versions.len() * 2);
    for v in versions {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}
