//! SOCKS5 front door
//!
//! The local listener applications connect through. Speaks RFC 1928
//! with username/password auth (RFC 1929) plus the Tor RESOLVE (0xF0)
//! and RESOLVE_PTR (0xF1) extensions. Hostnames are passed through to
//! the network untouched; a DOMAIN target never reaches a local
//! resolver, and a `.onion` hostname is routed to the onion client.

use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::hooks::ControlHandle;
use crate::isolation::{IsolationKey, RequestAttrs};
use crate::onion::{OnionAddressV3, OnionClient};
use crate::pool::CircuitManager;
use crate::protocol::{ResolvedAddr, Target, TorStream};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// SOCKS5 command codes
const CMD_CONNECT: u8 = 0x01;
const CMD_RESOLVE: u8 = 0xF0;
const CMD_RESOLVE_PTR: u8 = 0xF1;

/// SOCKS5 reply codes
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// The SOCKS5 listener
pub struct SocksServer {
    config: TorConfig,
    manager: Arc<CircuitManager>,
    onion: Arc<OnionClient>,
    control: ControlHandle,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

/// A parsed SOCKS request
#[derive(Debug)]
struct SocksRequest {
    command: u8,
    target: Target,
    auth: Option<String>,
}

impl SocksServer {
    /// Create the server
    pub fn new(
        config: TorConfig,
        manager: Arc<CircuitManager>,
        onion: Arc<OnionClient>,
        control: ControlHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            manager,
            onion,
            control,
            active: Arc::new(AtomicUsize::new(0)),
            cancel,
        }
    }

    /// Bind and serve until cancelled
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.socks_listen)
            .await
            .map_err(|e| {
                TorError::Config(format!("bind {}: {}", self.config.socks_listen, e))
            })?;
        log::info!("SOCKS5 listening on {}", self.config.socks_listen);

        loop {
            let (socket, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        continue;
                    }
                },
                _ = self.cancel.cancelled() => return Ok(()),
            };

            // Admission gate: hard cap on concurrent connections.
            let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
            if active > self.config.max_socks_connections {
                self.active.fetch_sub(1, Ordering::AcqRel);
                log::warn!("connection cap reached, refusing {}", peer);
                drop(socket);
                continue;
            }

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(socket, peer).await {
                    log::debug!("socks connection from {}: {}", peer, e);
                }
                server.active.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }

    /// Number of connections currently admitted
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    async fn handle_connection(&self, mut socket: TcpStream, peer: SocketAddr) -> Result<()> {
        let request = match read_request(&mut socket).await {
            Ok(req) => req,
            Err(RequestError::ReplySent(e)) => return Err(e),
            Err(RequestError::NeedsReply(e)) => {
                let _ = write_reply(&mut socket, REP_GENERAL_FAILURE).await;
                return Err(e);
            }
        };

        let isolation = {
            let dest_addr = match &request.target {
                Target::Tcp(addr, _) => addr.to_string(),
                Target::Hostname(host, _) => host.clone(),
                Target::OnionV3(addr, _) => addr.to_string(),
            };
            let attrs = RequestAttrs {
                dest_addr,
                dest_port: request.target.port(),
                socks_auth: request.auth.clone(),
                client_port: peer.port(),
                client_proto: if request.auth.is_some() {
                    "socks5-auth"
                } else {
                    "socks5"
                },
            };
            IsolationKey::from_request(&self.config.isolation, &attrs)
        };

        match request.command {
            CMD_CONNECT => self.handle_connect(socket, request, isolation).await,
            CMD_RESOLVE => self.handle_resolve(socket, request, isolation, false).await,
            CMD_RESOLVE_PTR => self.handle_resolve(socket, request, isolation, true).await,
            _ => {
                write_reply(&mut socket, REP_COMMAND_NOT_SUPPORTED).await?;
                Ok(())
            }
        }
    }

    async fn handle_connect(
        &self,
        mut socket: TcpStream,
        request: SocksRequest,
        isolation: IsolationKey,
    ) -> Result<()> {
        let stream: TorStream = match &request.target {
            Target::OnionV3(address, port) => {
                match self.onion.connect(address, *port).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        write_reply(&mut socket, e.socks_reply_code()).await?;
                        return Err(e);
                    }
                }
            }
            target => match self.manager.assign(target, isolation).await {
                Ok(stream) => stream,
                Err(e) => {
                    write_reply(&mut socket, e.socks_reply_code()).await?;
                    return Err(e);
                }
            },
        };

        write_reply(&mut socket, REP_SUCCESS).await?;
        let (bytes_read, bytes_written) = bridge(socket, stream).await;
        self.control.bw_event(bytes_read, bytes_written);
        Ok(())
    }

    async fn handle_resolve(
        &self,
        mut socket: TcpStream,
        request: SocksRequest,
        isolation: IsolationKey,
        ptr: bool,
    ) -> Result<()> {
        let name = match (&request.target, ptr) {
            (Target::Hostname(host, _), false) => host.clone(),
            (Target::Tcp(addr, _), true) => ptr_name(addr),
            (Target::Hostname(host, _), true) => host.clone(),
            _ => {
                write_reply(&mut socket, REP_ATYP_NOT_SUPPORTED).await?;
                return Ok(());
            }
        };

        match self.manager.resolve(&name, isolation).await {
            Ok(answers) => {
                let answer = answers.iter().find(|a| match a {
                    ResolvedAddr::Ip { addr, .. } => {
                        !ptr && (self.config.enable_ipv6 || addr.is_ipv4())
                    }
                    ResolvedAddr::Hostname { .. } => ptr,
                });
                match answer {
                    Some(answer) => write_resolve_reply(&mut socket, answer).await,
                    None => {
                        write_reply(&mut socket, 0x04).await?;
                        Ok(())
                    }
                }
            }
            Err(e) => {
                write_reply(&mut socket, e.socks_reply_code()).await?;
                Err(e)
            }
        }
    }
}

/// A failed request parse, tagged by protocol state
///
/// Once a terminal reply has gone out (the 0xFF method rejection, or an
/// RFC 1929 failure status), the only valid next step is closing the
/// socket; a CONNECT-style failure reply would be garbage to the client.
enum RequestError {
    /// The protocol-correct failure reply was already written; close
    ReplySent(TorError),
    /// Nothing written yet; the caller owes the client a failure reply
    NeedsReply(TorError),
}

impl From<TorError> for RequestError {
    fn from(e: TorError) -> Self {
        RequestError::NeedsReply(e)
    }
}

/// Negotiate methods and read the request
async fn read_request(
    socket: &mut TcpStream,
) -> std::result::Result<SocksRequest, RequestError> {
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    socket.read_exact(&mut head).await.map_err(io_err)?;
    if head[0] != 0x05 {
        return Err(TorError::Stream(format!("not SOCKS5 (version {})", head[0])).into());
    }
    let mut methods = vec![0u8; head[1] as usize];
    socket.read_exact(&mut methods).await.map_err(io_err)?;

    // Prefer username/password when offered, since it can carry
    // isolation information; otherwise no-auth.
    let auth = if methods.contains(&0x02) {
        socket.write_all(&[0x05, 0x02]).await.map_err(io_err)?;
        Some(read_userpass(socket).await?)
    } else if methods.contains(&0x00) {
        socket.write_all(&[0x05, 0x00]).await.map_err(io_err)?;
        None
    } else {
        // The 0xFF reply is terminal (RFC 1928 section 3).
        socket.write_all(&[0x05, 0xFF]).await.map_err(io_err)?;
        return Err(RequestError::ReplySent(TorError::Stream(
            "no acceptable auth method".into(),
        )));
    };

    // Request: VER CMD RSV ATYP ...
    let mut req = [0u8; 4];
    socket.read_exact(&mut req).await.map_err(io_err)?;
    if req[0] != 0x05 {
        return Err(TorError::Stream("bad request version".into()).into());
    }
    let command = req[1];

    let target = match req[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            socket.read_exact(&mut addr).await.map_err(io_err)?;
            let port = read_port(socket).await?;
            Target::Tcp(IpAddr::from(addr), port)
        }
        0x04 => {
            let mut addr = [0u8; 16];
            socket.read_exact(&mut addr).await.map_err(io_err)?;
            let port = read_port(socket).await?;
            Target::Tcp(IpAddr::from(addr), port)
        }
        0x03 => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await.map_err(io_err)?;
            let mut name = vec![0u8; len[0] as usize];
            socket.read_exact(&mut name).await.map_err(io_err)?;
            let host = String::from_utf8(name)
                .map_err(|_| TorError::Stream("hostname not UTF-8".into()))?;
            let port = read_port(socket).await?;

            if OnionAddressV3::is_onion_hostname(&host) {
                let address = OnionAddressV3::parse(&host)?;
                Target::OnionV3(address, port)
            } else {
                Target::Hostname(host, port)
            }
        }
        other => {
            return Err(TorError::Stream(format!("unsupported ATYP {}", other)).into());
        }
    };

    Ok(SocksRequest {
        command,
        target,
        auth,
    })
}

/// RFC 1929 username/password subnegotiation
async fn read_userpass(socket: &mut TcpStream) -> std::result::Result<String, RequestError> {
    let mut ver = [0u8; 2];
    socket.read_exact(&mut ver).await.map_err(io_err)?;
    if ver[0] != 0x01 {
        // Answer in the subnegotiation's own vocabulary: a 2-byte
        // failure status, after which the client must close.
        let _ = socket.write_all(&[0x01, 0x01]).await;
        return Err(RequestError::ReplySent(TorError::Stream(
            "bad auth subnegotiation version".into(),
        )));
    }
    let mut user = vec![0u8; ver[1] as usize];
    socket.read_exact(&mut user).await.map_err(io_err)?;

    let mut plen = [0u8; 1];
    socket.read_exact(&mut plen).await.map_err(io_err)?;
    let mut pass = vec![0u8; plen[0] as usize];
    socket.read_exact(&mut pass).await.map_err(io_err)?;

    // Any credentials are accepted; they only feed isolation.
    socket.write_all(&[0x01, 0x00]).await.map_err(io_err)?;

    let user = String::from_utf8_lossy(&user);
    let pass = String::from_utf8_lossy(&pass);
    Ok(format!("{}:{}", user, pass))
}

async fn read_port(socket: &mut TcpStream) -> Result<u16> {
    let mut port = [0u8; 2];
    socket.read_exact(&mut port).await.map_err(io_err)?;
    Ok(u16::from_be_bytes(port))
}

/// Standard reply with an all-zero bind address
async fn write_reply(socket: &mut TcpStream, code: u8) -> Result<()> {
    socket
        .write_all(&[0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .map_err(io_err)
}

/// RESOLVE/RESOLVE_PTR reply carrying a single answer
async fn write_resolve_reply(socket: &mut TcpStream, answer: &ResolvedAddr) -> Result<()> {
    let mut reply = vec![0x05, REP_SUCCESS, 0x00];
    match answer {
        ResolvedAddr::Ip {
            addr: IpAddr::V4(v4),
            ..
        } => {
            reply.push(0x01);
            reply.extend_from_slice(&v4.octets());
        }
        ResolvedAddr::Ip {
            addr: IpAddr::V6(v6),
            ..
        } => {
            reply.push(0x04);
            reply.extend_from_slice(&v6.octets());
        }
        ResolvedAddr::Hostname { name, .. } => {
            reply.push(0x03);
            reply.push(name.len().min(255) as u8);
            reply.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);
        }
    }
    reply.extend_from_slice(&[0, 0]);
    socket.write_all(&reply).await.map_err(io_err)
}

/// The PTR query name for an address
fn ptr_name(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(64);
            for byte in v6.octets().iter().rev() {
                nibbles.push(format!("{:x}", byte & 0x0F));
                nibbles.push(format!("{:x}", byte >> 4));
            }
            format!("{}.ip6.arpa", nibbles.join("."))
        }
    }
}

/// Pump bytes both ways until either side finishes
///
/// An application disconnect closes the Tor stream with RELAY_END
/// (DONE); a RELAY_END from the network half-closes toward the app.
/// Returns (bytes from the network, bytes toward the network).
async fn bridge(socket: TcpStream, stream: TorStream) -> (u64, u64) {
    let (mut app_read, mut app_write) = socket.into_split();
    let (mut tor_read, mut tor_write) = stream.into_split();

    let up = tokio::spawn(async move {
        let mut sent = 0u64;
        let mut buf = [0u8; 4096];
        loop {
            match app_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tor_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    sent += n as u64;
                }
            }
        }
        tor_write.close().await;
        sent
    });

    let down = tokio::spawn(async move {
        let mut received = 0u64;
        let mut buf = [0u8; 4096];
        loop {
            match tor_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if app_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    received += n as u64;
                }
            }
        }
        let _ = app_write.shutdown().await;
        received
    });

    let sent = up.await.unwrap_or(0);
    let received = down.await.unwrap_or(0);
    (received, sent)
}

fn io_err(e: std::io::Error) -> TorError {
    TorError::Stream(format!("socks io: {}", e))
}
