//! Directory client
//!
//! Fetches and refreshes the network consensus from the directory
//! authorities, verifies its signatures, and pulls server descriptors
//! on demand for relays whose ntor keys we do not have yet.
//!
//! The current consensus is published as an immutable snapshot; path
//! selection and the HSDir ring read whatever snapshot is current and
//! never see a half-updated document.

use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::protocol::consensus::{Consensus, ConsensusParser};
use crate::protocol::consensus_verify::{default_authorities, ConsensusVerifier, DirectoryAuthority};
use crate::protocol::relay::Relay;
use crate::storage::Storage;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Deadline for one directory HTTP request
const DIR_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Full fetch rounds over all authorities before giving up
const MAX_FETCH_ROUNDS: u32 = 3;

/// Largest directory response we will buffer
const MAX_RESPONSE_LEN: usize = 16 * 1024 * 1024;

/// Per-relay data that only appears in server descriptors
#[derive(Debug, Clone, Default)]
struct DescriptorInfo {
    ntor_onion_key: Option<String>,
    ed_identity: Option<String>,
    family: BTreeSet<String>,
}

/// Fetches and caches directory documents
pub struct DirectoryClient {
    authorities: Vec<DirectoryAuthority>,
    verifier: ConsensusVerifier,
    storage: Arc<Storage>,
    refresh_slack: Duration,
    snapshot: RwLock<Option<Arc<Consensus>>>,
    descriptors: Mutex<HashMap<String, DescriptorInfo>>,
    cancel: CancellationToken,
}

impl DirectoryClient {
    /// Create a client over the configured (or built-in) authorities
    pub fn new(config: &TorConfig, storage: Arc<Storage>, cancel: CancellationToken) -> Result<Self> {
        let authorities = match &config.authorities {
            Some(overrides) => overrides
                .iter()
                .map(|line| parse_authority_override(line))
                .collect::<Result<Vec<_>>>()?,
            None => default_authorities(),
        };
        let verifier = ConsensusVerifier::new(&authorities);
        Ok(Self {
            authorities,
            verifier,
            storage,
            refresh_slack: config.consensus_refresh_slack,
            snapshot: RwLock::new(None),
            descriptors: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Load the cached consensus or fetch a fresh one
    pub async fn bootstrap(&self) -> Result<Arc<Consensus>> {
        if let Some((_, text)) = self.storage.load_consensus()? {
            if let Ok(consensus) = self.accept_document(&text, false) {
                if consensus.is_valid(SystemTime::now(), self.refresh_slack) {
                    log::info!(
                        "using cached consensus with {} relays",
                        consensus.relays.len()
                    );
                    return Ok(consensus);
                }
                log::info!("cached consensus expired; fetching a fresh one");
            }
        }
        self.fetch_consensus().await
    }

    /// Fetch, verify and publish a new consensus
    ///
    /// Authorities are tried in randomized order; individual failures
    /// move on to the next authority, with backoff between full rounds.
    pub async fn fetch_consensus(&self) -> Result<Arc<Consensus>> {
        let mut order: Vec<usize> = (0..self.authorities.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        for round in 0..MAX_FETCH_ROUNDS {
            if round > 0 {
                let backoff = Duration::from_secs(2u64.pow(round))
                    + Duration::from_millis(rand::random::<u64>() % 1000);
                log::debug!("consensus fetch round {} after {:?}", round + 1, backoff);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.cancel.cancelled() => return Err(TorError::Cancelled),
                }
            }

            for &idx in &order {
                let authority = &self.authorities[idx];
                log::debug!("fetching consensus from {}", authority.name);

                let fetched = self
                    .http_get(&authority.dir_addr, "/tor/status-vote/current/consensus")
                    .await;
                let text = match fetched {
                    Ok(body) => match String::from_utf8(body) {
                        Ok(text) => text,
                        Err(_) => {
                            log::debug!("{}: consensus not UTF-8", authority.name);
                            continue;
                        }
                    },
                    Err(TorError::Cancelled) => return Err(TorError::Cancelled),
                    Err(e) => {
                        log::debug!("{}: {}", authority.name, e);
                        continue;
                    }
                };

                match self.accept_document(&text, true) {
                    Ok(consensus) => {
                        log::info!(
                            "fetched consensus from {}: {} relays, {} signatures",
                            authority.name,
                            consensus.relays.len(),
                            consensus.authority_signatures
                        );
                        return Ok(consensus);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        log::warn!("consensus from {} rejected: {}", authority.name, e);
                    }
                }
            }
        }

        Err(TorError::NoConsensus)
    }

    /// Verify, parse and (optionally) persist one consensus document
    fn accept_document(&self, text: &str, persist: bool) -> Result<Arc<Consensus>> {
        let signatures = self.verifier.verify(text)?;
        let mut consensus = ConsensusParser::parse_text(text)?;
        consensus.authority_signatures = signatures;

        if !consensus.is_valid(SystemTime::now(), Duration::ZERO) {
            return Err(TorError::Directory("consensus already expired".into()));
        }

        let consensus = Arc::new(consensus);
        *self.snapshot.write().expect("snapshot lock") = Some(Arc::clone(&consensus));

        if persist {
            if let Err(e) = self.storage.save_consensus(text) {
                log::warn!("could not cache consensus: {}", e);
            }
        }
        Ok(consensus)
    }

    /// The current consensus snapshot
    ///
    /// Fails with `NoConsensus` when none is held or the held one has
    /// passed its usability window; new circuits must not be built
    /// until a refresh succeeds.
    pub fn current(&self) -> Result<Arc<Consensus>> {
        let snapshot = self.snapshot.read().expect("snapshot lock");
        match snapshot.as_ref() {
            Some(c) if c.is_valid(SystemTime::now(), self.refresh_slack) => Ok(Arc::clone(c)),
            _ => Err(TorError::NoConsensus),
        }
    }

    /// Refresh when the held consensus is past fresh-until
    pub async fn refresh_if_stale(&self) -> Result<()> {
        let needs_fetch = {
            let snapshot = self.snapshot.read().expect("snapshot lock");
            match snapshot.as_ref() {
                Some(c) => !c.is_fresh(SystemTime::now()),
                None => true,
            }
        };
        if needs_fetch {
            self.fetch_consensus().await?;
        }
        Ok(())
    }

    /// A relay with descriptor data (ntor key, family) merged in
    pub fn relay(&self, fingerprint: &str) -> Option<Relay> {
        let consensus = self.current().ok()?;
        let mut relay = consensus.relay(fingerprint)?.clone();
        let descriptors = self.descriptors.lock().expect("descriptor lock");
        if let Some(info) = descriptors.get(fingerprint) {
            relay.ntor_onion_key = info.ntor_onion_key.clone();
            if relay.ed_identity.is_none() {
                relay.ed_identity = info.ed_identity.clone();
            }
            relay.family = info.family.clone();
        }
        Some(relay)
    }

    /// Make sure every relay in `path` has its ntor key, fetching
    /// descriptors for the ones that do not
    pub async fn ensure_ntor_keys(&self, path: &mut [Relay]) -> Result<()> {
        let missing: Vec<String> = {
            let descriptors = self.descriptors.lock().expect("descriptor lock");
            path.iter()
                .filter(|r| {
                    r.ntor_onion_key.is_none()
                        && descriptors
                            .get(&r.fingerprint)
                            .and_then(|i| i.ntor_onion_key.as_ref())
                            .is_none()
                })
                .map(|r| r.fingerprint.clone())
                .collect()
        };

        // Consult the on-disk cache before touching the network.
        let mut still_missing = Vec::new();
        for fp in missing {
            match self.storage.load_descriptor(&fp)? {
                Some(body) => self.ingest_descriptors(&body, false),
                None => still_missing.push(fp),
            }
        }

        if !still_missing.is_empty() {
            self.fetch_descriptors(&still_missing).await?;
        }

        let descriptors = self.descriptors.lock().expect("descriptor lock");
        for relay in path.iter_mut() {
            if let Some(info) = descriptors.get(&relay.fingerprint) {
                if relay.ntor_onion_key.is_none() {
                    relay.ntor_onion_key = info.ntor_onion_key.clone();
                }
                if relay.family.is_empty() {
                    relay.family = info.family.clone();
                }
            }
            if relay.ntor_onion_key.is_none() {
                return Err(TorError::Directory(format!(
                    "no descriptor for {}",
                    relay.nickname
                )));
            }
        }
        Ok(())
    }

    /// Fetch server descriptors for the given fingerprints
    pub async fn fetch_descriptors(&self, fingerprints: &[String]) -> Result<()> {
        if fingerprints.is_empty() {
            return Ok(());
        }
        let path = format!("/tor/server/fp/{}", fingerprints.join("+"));

        let mut order: Vec<usize> = (0..self.authorities.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut last_err = TorError::Directory("no authority reachable".into());
        for &idx in &order {
            let authority = &self.authorities[idx];
            match self.http_get(&authority.dir_addr, &path).await {
                Ok(body) => {
                    let text = String::from_utf8(body)
                        .map_err(|_| TorError::Directory("descriptors not UTF-8".into()))?;
                    self.ingest_descriptors(&text, true);
                    return Ok(());
                }
                Err(TorError::Cancelled) => return Err(TorError::Cancelled),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Parse server descriptors and record their ntor keys and families
    fn ingest_descriptors(&self, text: &str, persist: bool) {
        for (fingerprint, info, raw) in parse_server_descriptors(text) {
            if persist {
                if let Err(e) = self.storage.save_descriptor(&fingerprint, &raw) {
                    log::debug!("descriptor cache write failed: {}", e);
                }
            }
            self.descriptors
                .lock()
                .expect("descriptor lock")
                .insert(fingerprint, info);
        }
    }

    /// One directory HTTP GET over a plain TCP connection
    async fn http_get(&self, addr: &str, path: &str) -> Result<Vec<u8>> {
        let request = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| TorError::ConnectionFailed(format!("{}: {}", addr, e)))?;

            let host = addr.split(':').next().unwrap_or(addr);
            let req = format!(
                "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: tor-native/0.1\r\n\r\n",
                path, host
            );
            stream
                .write_all(req.as_bytes())
                .await
                .map_err(|e| TorError::ConnectionFailed(e.to_string()))?;

            let mut response = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = stream
                    .read(&mut buf)
                    .await
                    .map_err(|e| TorError::ConnectionFailed(e.to_string()))?;
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&buf[..n]);
                if response.len() > MAX_RESPONSE_LEN {
                    return Err(TorError::Directory("directory response too large".into()));
                }
            }
            parse_http_response(&response)
        };

        tokio::select! {
            res = tokio::time::timeout(DIR_REQUEST_TIMEOUT, request) => {
                res.map_err(|_| TorError::Timeout("directory request"))?
            }
            _ = self.cancel.cancelled() => Err(TorError::Cancelled),
        }
    }
}

/// Split an HTTP/1.0 response into its body, requiring status 200
pub fn parse_http_response(response: &[u8]) -> Result<Vec<u8>> {
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| TorError::Directory("malformed HTTP response".into()))?;

    let head = std::str::from_utf8(&response[..header_end])
        .map_err(|_| TorError::Directory("malformed HTTP header".into()))?;
    let status_line = head.lines().next().unwrap_or("");
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status != "200" {
        return Err(TorError::Directory(format!(
            "directory returned {}",
            status_line
        )));
    }

    Ok(response[header_end + 4..].to_vec())
}

/// Parse concatenated server descriptors
///
/// Yields (fingerprint, extracted info, raw descriptor text) per
/// "router" block.
fn parse_server_descriptors(text: &str) -> Vec<(String, DescriptorInfo, String)> {
    let mut out = Vec::new();
    let mut fingerprint: Option<String> = None;
    let mut info = DescriptorInfo::default();
    let mut raw = String::new();
    let mut in_descriptor = false;

    let mut flush = |fingerprint: &mut Option<String>, info: &mut DescriptorInfo, raw: &mut String| {
        if let Some(fp) = fingerprint.take() {
            out.push((fp, std::mem::take(info), std::mem::take(raw)));
        } else {
            info.ntor_onion_key = None;
            info.family.clear();
            raw.clear();
        }
    };

    for line in text.lines() {
        let trimmed = line.trim_start_matches("opt ").trim();

        if trimmed.starts_with("router ") {
            if in_descriptor {
                flush(&mut fingerprint, &mut info, &mut raw);
                info = DescriptorInfo::default();
            }
            in_descriptor = true;
        }
        if !in_descriptor {
            continue;
        }
        raw.push_str(line);
        raw.push('\n');

        if let Some(rest) = trimmed.strip_prefix("fingerprint ") {
            fingerprint = Some(rest.replace(' ', "").to_uppercase());
        } else if let Some(rest) = trimmed.strip_prefix("ntor-onion-key ") {
            info.ntor_onion_key = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("master-key-ed25519 ") {
            info.ed_identity = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("family ") {
            for member in rest.split_whitespace() {
                if let Some(fp) = member.strip_prefix('$') {
                    info.family.insert(fp.to_uppercase());
                }
            }
        }
    }
    if in_descriptor {
        flush(&mut fingerprint, &mut info, &mut raw);
    }

    out
}

/// Parse an authority override line: `name v3ident host:port`
fn parse_authority_override(line: &str) -> Result<DirectoryAuthority> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(TorError::Config(format!(
            "authority override must be 'name fingerprint host:port', got {:?}",
            line
        )));
    }
    Ok(DirectoryAuthority {
        name: parts[0].to_string(),
        v3ident: parts[1].to_uppercase(),
        or_addr: parts[2].to_string(),
        dir_addr: parts[2].to_string(),
        ed25519_key: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_response() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nhello";
        assert_eq!(parse_http_response(raw).unwrap(), b"hello");

        let not_found = b"HTTP/1.0 404 Not found\r\n\r\n";
        assert!(parse_http_response(not_found).is_err());

        assert!(parse_http_response(b"garbage").is_err());
    }

    #[test]
    fn test_parse_server_descriptors() {
        let text = "\
router relayA 1.2.3.4 9001 0 9030
fingerprint AAAA BBBB CCCC DDDD EEEE FFFF 0000 1111 2222 3333
ntor-onion-key bm90IGEga2V5IGJ1dCAzMiBieXRlcyE
family $9999888877776666555544443333222211110000
router relayB 5.6.7.8 443 0 0
fingerprint 1111 2222 3333 4444 5555 6666 7777 8888 9999 0000
ntor-onion-key YW5vdGhlciBrZXkgYm9keSBoZXJlISE
";
        let parsed = parse_server_descriptors(text);
        assert_eq!(parsed.len(), 2);

        let (fp_a, info_a, raw_a) = &parsed[0];
        assert_eq!(fp_a, "AAAABBBBCCCCDDDDEEEEFFFF0000111122223333");
        assert_eq!(
            info_a.ntor_onion_key.as_deref(),
            Some("bm90IGEga2V5IGJ1dCAzMiBieXRlcyE")
        );
        assert!(info_a
            .family
            .contains("9999888877776666555544443333222211110000"));
        assert!(raw_a.contains("router relayA"));

        let (fp_b, info_b, _) = &parsed[1];
        assert_eq!(fp_b, "1111222233334444555566667777888899990000");
        assert!(info_b.family.is_empty());
    }

    #[test]
    fn test_parse_authority_override() {
        let auth =
            parse_authority_override("testauth 000102030405060708090A0B0C0D0E0F10111213 127.0.0.1:7000")
                .unwrap();
        assert_eq!(auth.name, "testauth");
        assert_eq!(auth.dir_addr, "127.0.0.1:7000");

        assert!(parse_authority_override("too few").is_err());
    }
}
