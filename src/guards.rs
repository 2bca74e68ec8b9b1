//! Guard persistence
//!
//! Long-lived entry guards, persisted across runs. A new guard enters
//! the set unconfirmed when the path selector samples it; the first
//! successful circuit through it confirms it. At most three guards are
//! confirmed at a time, an unconfirmed guard that never confirms within
//! sixty days is retired, and confirmed guards retire after the
//! configured lifetime.
//!
//! The set is saved with an atomic replace (0600) under the same lock
//! that mutates it.

use crate::error::{Result, TorError};
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Most guards that may be confirmed at once
pub const MAX_CONFIRMED_GUARDS: usize = 3;

/// An unconfirmed guard is retired after this long
pub const UNCONFIRMED_RETIRE_SECS: u64 = 60 * 24 * 60 * 60;

/// Consecutive failures before a guard is skipped
pub const MAX_FAILURES_BEFORE_SKIP: u32 = 5;

/// One persisted guard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardEntry {
    /// Hex identity fingerprint
    pub fingerprint: String,

    /// OR address ("host:port") as last seen in the consensus
    pub address: String,

    /// When this guard first entered the set (unix seconds)
    pub first_used: u64,

    /// When a circuit last succeeded through it (unix seconds)
    pub last_confirmed: u64,

    /// Whether any circuit ever succeeded through it
    pub confirmed: bool,
}

/// The persisted guard set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardSet {
    /// Guards in preference order
    pub guards: Vec<GuardEntry>,

    /// Consecutive failure counts; not persisted
    #[serde(skip)]
    failures: HashMap<String, u32>,
}

impl GuardSet {
    /// Serialize for storage
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TorError::Storage(format!("serialize guard set: {}", e)))
    }

    /// Deserialize from storage
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TorError::Storage(format!("parse guard set: {}", e)))
    }

    /// Confirmed guard count
    pub fn confirmed_count(&self) -> usize {
        self.guards.iter().filter(|g| g.confirmed).count()
    }

    /// Pick the preferred usable guard
    ///
    /// Confirmed guards come first, in confirmation order; then
    /// unconfirmed candidates. `still_listed` filters against the
    /// current consensus (a guard that went non-running is unusable).
    pub fn pick<F>(&self, still_listed: F) -> Option<&GuardEntry>
    where
        F: Fn(&str) -> bool,
    {
        let usable = |g: &&GuardEntry| {
            still_listed(&g.fingerprint)
                && self
                    .failures
                    .get(&g.fingerprint)
                    .map_or(true, |&n| n < MAX_FAILURES_BEFORE_SKIP)
        };

        self.guards
            .iter()
            .filter(|g| g.confirmed)
            .filter(usable)
            .max_by_key(|g| g.last_confirmed)
            .or_else(|| self.guards.iter().filter(|g| !g.confirmed).find(usable))
    }

    /// Add a freshly sampled, unconfirmed guard
    pub fn add_unconfirmed(&mut self, fingerprint: &str, address: &str, now: u64) {
        if self.guards.iter().any(|g| g.fingerprint == fingerprint) {
            return;
        }
        log::info!("new unconfirmed guard {}", &fingerprint[..8.min(fingerprint.len())]);
        self.guards.push(GuardEntry {
            fingerprint: fingerprint.to_string(),
            address: address.to_string(),
            first_used: now,
            last_confirmed: 0,
            confirmed: false,
        });
    }

    /// Record a successful circuit through a guard
    ///
    /// Confirms the guard when the confirmed set has room; a success
    /// always clears its failure count and refreshes last_confirmed.
    pub fn record_success(&mut self, fingerprint: &str, now: u64) {
        self.failures.remove(fingerprint);
        let confirmed_count = self.confirmed_count();
        if let Some(guard) = self
            .guards
            .iter_mut()
            .find(|g| g.fingerprint == fingerprint)
        {
            if !guard.confirmed && confirmed_count < MAX_CONFIRMED_GUARDS {
                log::info!("guard {} confirmed", &fingerprint[..8.min(fingerprint.len())]);
                guard.confirmed = true;
            }
            if guard.confirmed {
                guard.last_confirmed = now;
            }
        }
    }

    /// Record a failed circuit attempt through a guard
    pub fn record_failure(&mut self, fingerprint: &str) {
        let count = self.failures.entry(fingerprint.to_string()).or_insert(0);
        *count += 1;
        log::debug!(
            "guard {} failed ({} consecutive)",
            &fingerprint[..8.min(fingerprint.len())],
            count
        );
    }

    /// Retire guards past their horizon
    ///
    /// Unconfirmed guards retire [`UNCONFIRMED_RETIRE_SECS`] after
    /// first use; confirmed guards retire `lifetime_secs` after their
    /// last confirmation.
    pub fn retire_expired(&mut self, now: u64, lifetime_secs: u64) {
        let before = self.guards.len();
        self.guards.retain(|g| {
            if g.confirmed {
                now.saturating_sub(g.last_confirmed) < lifetime_secs
            } else {
                now.saturating_sub(g.first_used) < UNCONFIRMED_RETIRE_SECS
            }
        });
        let retired = before - self.guards.len();
        if retired > 0 {
            log::info!("retired {} expired guards", retired);
        }
    }
}

/// Guard set plus its persistence, mutated under one lock
pub struct GuardManager {
    inner: Mutex<GuardSet>,
    storage: Arc<Storage>,
    lifetime_secs: u64,
}

impl GuardManager {
    /// Load the guard set from disk (or start empty)
    pub fn load(storage: Arc<Storage>, guard_lifetime_days: u32) -> Result<Self> {
        let set = match storage.load_guards()? {
            Some(json) => GuardSet::from_json(&json).unwrap_or_else(|e| {
                log::warn!("guard state unreadable, starting fresh: {}", e);
                GuardSet::default()
            }),
            None => GuardSet::default(),
        };
        log::info!(
            "loaded {} guards ({} confirmed)",
            set.guards.len(),
            set.confirmed_count()
        );
        Ok(Self {
            inner: Mutex::new(set),
            storage,
            lifetime_secs: u64::from(guard_lifetime_days) * 24 * 60 * 60,
        })
    }

    /// Preferred usable guard fingerprint, after expiry processing
    pub fn pick<F>(&self, still_listed: F) -> Option<(String, String)>
    where
        F: Fn(&str) -> bool,
    {
        let mut set = self.inner.lock().expect("guard lock");
        set.retire_expired(now_secs(), self.lifetime_secs);
        set.pick(still_listed)
            .map(|g| (g.fingerprint.clone(), g.address.clone()))
    }

    /// Add a sampled candidate and persist
    pub fn add_unconfirmed(&self, fingerprint: &str, address: &str) -> Result<()> {
        let mut set = self.inner.lock().expect("guard lock");
        set.add_unconfirmed(fingerprint, address, now_secs());
        self.persist(&set)
    }

    /// Record a circuit success and persist
    pub fn record_success(&self, fingerprint: &str) -> Result<()> {
        let mut set = self.inner.lock().expect("guard lock");
        set.record_success(fingerprint, now_secs());
        self.persist(&set)
    }

    /// Record a circuit failure (not persisted; failure counts are
    /// session-local)
    pub fn record_failure(&self, fingerprint: &str) {
        self.inner
            .lock()
            .expect("guard lock")
            .record_failure(fingerprint);
    }

    /// Number of guards currently in the set
    pub fn len(&self) -> usize {
        self.inner.lock().expect("guard lock").guards.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, set: &GuardSet) -> Result<()> {
        self.storage.save_guards(&set.to_json()?)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: u64 = 24 * 60 * 60;

    #[test]
    fn test_confirm_on_success() {
        let mut set = GuardSet::default();
        set.add_unconfirmed(&"A".repeat(40), "1.2.3.4:9001", 1000);
        assert_eq!(set.confirmed_count(), 0);

        set.record_success(&"A".repeat(40), 2000);
        assert_eq!(set.confirmed_count(), 1);
        assert_eq!(set.guards[0].last_confirmed, 2000);
    }

    #[test]
    fn test_at_most_three_confirmed() {
        let mut set = GuardSet::default();
        for i in 0..5 {
            let fp = format!("{:040}", i);
            set.add_unconfirmed(&fp, "1.2.3.4:9001", 1000);
            set.record_success(&fp, 2000 + i);
        }
        assert_eq!(set.confirmed_count(), MAX_CONFIRMED_GUARDS);
    }

    #[test]
    fn test_confirmed_guard_preferred_and_stable() {
        let mut set = GuardSet::default();
        set.add_unconfirmed(&"A".repeat(40), "1.1.1.1:9001", 1000);
        set.add_unconfirmed(&"B".repeat(40), "2.2.2.2:9001", 1000);
        set.record_success(&"B".repeat(40), 2000);

        // The confirmed guard wins over the earlier-added unconfirmed one.
        let picked = set.pick(|_| true).unwrap();
        assert_eq!(picked.fingerprint, "B".repeat(40));

        // And it keeps winning as long as the consensus lists it.
        for _ in 0..10 {
            assert_eq!(set.pick(|_| true).unwrap().fingerprint, "B".repeat(40));
        }

        // Once it drops from the consensus, selection moves on.
        let picked = set.pick(|fp| fp != "B".repeat(40)).unwrap();
        assert_eq!(picked.fingerprint, "A".repeat(40));
    }

    #[test]
    fn test_unconfirmed_retired_after_60_days() {
        let mut set = GuardSet::default();
        set.add_unconfirmed(&"A".repeat(40), "1.1.1.1:9001", 0);

        set.retire_expired(59 * DAY, 90 * DAY);
        assert_eq!(set.guards.len(), 1);

        set.retire_expired(61 * DAY, 90 * DAY);
        assert!(set.guards.is_empty());
    }

    #[test]
    fn test_confirmed_retired_after_lifetime() {
        let mut set = GuardSet::default();
        set.add_unconfirmed(&"A".repeat(40), "1.1.1.1:9001", 0);
        set.record_success(&"A".repeat(40), 0);

        set.retire_expired(89 * DAY, 90 * DAY);
        assert_eq!(set.guards.len(), 1);

        set.retire_expired(91 * DAY, 90 * DAY);
        assert!(set.guards.is_empty());
    }

    #[test]
    fn test_failures_skip_guard_until_success() {
        let mut set = GuardSet::default();
        set.add_unconfirmed(&"A".repeat(40), "1.1.1.1:9001", 0);

        for _ in 0..MAX_FAILURES_BEFORE_SKIP {
            set.record_failure(&"A".repeat(40));
        }
        assert!(set.pick(|_| true).is_none());

        set.record_success(&"A".repeat(40), 100);
        assert!(set.pick(|_| true).is_some());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut set = GuardSet::default();
        set.add_unconfirmed(&"A".repeat(40), "1.1.1.1:9001", 500);
        set.record_success(&"A".repeat(40), 600);
        set.add_unconfirmed(&"B".repeat(40), "2.2.2.2:9001", 700);

        let restored = GuardSet::from_json(&set.to_json().unwrap()).unwrap();
        assert_eq!(restored.guards.len(), 2);
        assert_eq!(restored.guards[0].fingerprint, set.guards[0].fingerprint);
        assert_eq!(restored.guards[0].confirmed, true);
        assert_eq!(restored.guards[1].confirmed, false);
        assert_eq!(restored.guards[0].last_confirmed, 600);
    }

    #[test]
    fn test_manager_persists_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());

        {
            let manager = GuardManager::load(Arc::clone(&storage), 60).unwrap();
            manager.add_unconfirmed(&"C".repeat(40), "3.3.3.3:443").unwrap();
            manager.record_success(&"C".repeat(40)).unwrap();
        }

        let manager = GuardManager::load(storage, 60).unwrap();
        assert_eq!(manager.len(), 1);
        let (fp, addr) = manager.pick(|_| true).unwrap();
        assert_eq!(fp, "C".repeat(40));
        assert_eq!(addr, "3.3.3.3:443");
    }
}
