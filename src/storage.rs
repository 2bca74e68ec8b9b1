//! On-disk state
//!
//! Everything the client persists lives under `data_dir`:
//!
//! - `guards.json` — the guard set
//! - `cached-consensus` — last validated consensus, with a fetch
//!   timestamp header line
//! - `cached-descriptors/` — one file per relay fingerprint, evicted
//!   LRU when over budget
//! - `hs_descriptors/` — cached onion-service descriptors
//!
//! All writes go through an atomic temp-file-plus-rename with mode
//! 0600, so a crash never leaves a torn file behind.

use crate::error::{Result, TorError};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size budget for the relay descriptor cache
const DESCRIPTOR_CACHE_BUDGET: u64 = 8 * 1024 * 1024;

/// Handle to the client's data directory
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Open (creating if needed) the data directory
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .map_err(|e| TorError::Storage(format!("create {}: {}", data_dir.display(), e)))?;
        fs::create_dir_all(data_dir.join("cached-descriptors"))
            .map_err(|e| TorError::Storage(format!("create descriptor cache: {}", e)))?;
        fs::create_dir_all(data_dir.join("hs_descriptors"))
            .map_err(|e| TorError::Storage(format!("create hs descriptor cache: {}", e)))?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Path of the guard set file
    pub fn guards_path(&self) -> PathBuf {
        self.data_dir.join("guards.json")
    }

    /// Load the raw guard set file, if present
    pub fn load_guards(&self) -> Result<Option<String>> {
        read_optional(&self.guards_path())
    }

    /// Atomically replace the guard set file
    pub fn save_guards(&self, json: &str) -> Result<()> {
        atomic_write(&self.guards_path(), json.as_bytes())
    }

    /// Persist a validated consensus with its fetch timestamp
    pub fn save_consensus(&self, text: &str) -> Result<()> {
        let fetched_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let body = format!("fetched-at {}\n{}", fetched_at, text);
        atomic_write(&self.data_dir.join("cached-consensus"), body.as_bytes())
    }

    /// Load the cached consensus: (fetched_at, document text)
    pub fn load_consensus(&self) -> Result<Option<(u64, String)>> {
        let Some(body) = read_optional(&self.data_dir.join("cached-consensus"))? else {
            return Ok(None);
        };
        let Some((header, rest)) = body.split_once('\n') else {
            return Ok(None);
        };
        let fetched_at = header
            .strip_prefix("fetched-at ")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok(Some((fetched_at, rest.to_string())))
    }

    /// Store one relay descriptor, keyed by fingerprint
    pub fn save_descriptor(&self, fingerprint: &str, body: &str) -> Result<()> {
        let path = self.descriptor_path(fingerprint)?;
        atomic_write(&path, body.as_bytes())?;
        self.evict_descriptors_over_budget();
        Ok(())
    }

    /// Load one cached relay descriptor
    pub fn load_descriptor(&self, fingerprint: &str) -> Result<Option<String>> {
        read_optional(&self.descriptor_path(fingerprint)?)
    }

    /// Store a serialized onion-service descriptor
    pub fn save_hs_descriptor(&self, key: &str, body: &str) -> Result<()> {
        let path = self.data_dir.join("hs_descriptors").join(sanitize(key)?);
        atomic_write(&path, body.as_bytes())
    }

    /// Load a cached onion-service descriptor
    pub fn load_hs_descriptor(&self, key: &str) -> Result<Option<String>> {
        let path = self.data_dir.join("hs_descriptors").join(sanitize(key)?);
        read_optional(&path)
    }

    fn descriptor_path(&self, fingerprint: &str) -> Result<PathBuf> {
        Ok(self
            .data_dir
            .join("cached-descriptors")
            .join(sanitize(fingerprint)?))
    }

    /// Evict least-recently-modified descriptors once over budget
    fn evict_descriptors_over_budget(&self) {
        let dir = self.data_dir.join("cached-descriptors");
        let Ok(entries) = fs::read_dir(&dir) else {
            return;
        };

        let mut files: Vec<(PathBuf, u64, SystemTime)> = entries
            .flatten()
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                Some((
                    e.path(),
                    meta.len(),
                    meta.modified().unwrap_or(UNIX_EPOCH),
                ))
            })
            .collect();

        let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
        if total <= DESCRIPTOR_CACHE_BUDGET {
            return;
        }

        files.sort_by_key(|(_, _, modified)| *modified);
        for (path, len, _) in files {
            if total <= DESCRIPTOR_CACHE_BUDGET {
                break;
            }
            if fs::remove_file(&path).is_ok() {
                total = total.saturating_sub(len);
            }
        }
    }
}

/// Reject keys that could escape the cache directory
fn sanitize(key: &str) -> Result<&str> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TorError::Storage(format!("unsafe cache key: {:?}", key)));
    }
    Ok(key)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(body) => Ok(Some(body)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TorError::Storage(format!("read {}: {}", path.display(), e))),
    }
}

/// Write via temp file + rename, mode 0600
fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| TorError::Storage("path has no parent".into()))?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state")
    ));

    fs::write(&tmp, contents)
        .map_err(|e| TorError::Storage(format!("write {}: {}", tmp.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
            .map_err(|e| TorError::Storage(format!("chmod {}: {}", tmp.display(), e)))?;
    }

    fs::rename(&tmp, path)
        .map_err(|e| TorError::Storage(format!("rename to {}: {}", path.display(), e)))?;
    Ok(())
}
