//! Circuit manager
//!
//! Owns every live circuit. Streams are assigned to circuits by
//! isolation key: a clean prebuilt circuit can take any key, but once
//! used it is dirty and only ever serves that key again. The reaper
//! closes circuits that age out or sit idle, and prebuilding keeps a
//! few clean circuits warm so the first request does not pay the build
//! latency.

use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::guards::GuardManager;
use crate::hooks::{ControlHandle, MetricsHandle};
use crate::isolation::IsolationKey;
use crate::path::{describe_path, select_path};
use crate::protocol::{
    Channel, ChannelPool, Circuit, CircuitPurpose, DirectoryClient, Relay, StreamManager, Target,
    TorStream,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// DESTROY reason for circuits we close ourselves
const DESTROY_REASON_FINISHED: u8 = 9;

/// A circuit plus its assignment state
struct ManagedCircuit {
    circuit: Arc<Circuit>,

    /// The isolation key this circuit is pinned to; `None` while clean
    isolation: Option<IsolationKey>,
}

/// Counters for health reporting
#[derive(Debug, Default)]
pub struct PoolStats {
    pub built: AtomicU64,
    pub reused: AtomicU64,
    pub reaped: AtomicU64,
    pub build_failures: AtomicU64,
}

/// Snapshot of the manager for `health()`
#[derive(Debug, Clone)]
pub struct PoolHealth {
    pub live_circuits: usize,
    pub clean_circuits: usize,
    pub circuits_built: u64,
    pub circuits_reused: u64,
    pub circuits_reaped: u64,
    pub build_failures: u64,
}

/// Owns and assigns circuits
pub struct CircuitManager {
    config: TorConfig,
    directory: Arc<DirectoryClient>,
    guards: Arc<GuardManager>,
    channels: ChannelPool,
    circuits: Mutex<Vec<ManagedCircuit>>,
    stats: PoolStats,
    metrics: MetricsHandle,
    control: ControlHandle,
    cancel: CancellationToken,
}

impl CircuitManager {
    /// Create a manager
    pub fn new(
        config: TorConfig,
        directory: Arc<DirectoryClient>,
        guards: Arc<GuardManager>,
        metrics: MetricsHandle,
        control: ControlHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channels: ChannelPool::new(cancel.child_token()),
            config,
            directory,
            guards,
            circuits: Mutex::new(Vec::new()),
            stats: PoolStats::default(),
            metrics,
            control,
            cancel,
        }
    }

    /// Find or build a circuit for `isolation` and open a stream on it
    pub async fn assign(&self, target: &Target, isolation: IsolationKey) -> Result<TorStream> {
        // Reuse pass: an open circuit pinned to this key, or a clean one
        // we can pin now. Exit policy must allow the port either way.
        if let Some(circuit) = self.find_assignable(target, &isolation) {
            self.stats.reused.fetch_add(1, Ordering::Relaxed);
            self.metrics.incr("circuits_reused", &[]);
            match StreamManager::new(Arc::clone(&circuit)).begin(target).await {
                Ok(stream) => {
                    self.control
                        .stream_event(circuit.id, stream.stream_id(), "opened");
                    return Ok(stream);
                }
                Err(e) if e.is_retryable() => {
                    log::debug!("reused circuit {} failed to open stream: {}", circuit.id, e);
                }
                Err(e) => return Err(e),
            }
        }

        // Build pass.
        let circuit = self
            .build_circuit(CircuitPurpose::General, Some(target.port()), None)
            .await?;
        self.pin(&circuit, isolation);

        let stream = StreamManager::new(Arc::clone(&circuit)).begin(target).await?;
        self.control
            .stream_event(circuit.id, stream.stream_id(), "opened");
        Ok(stream)
    }

    /// Resolve a hostname on a circuit matching `isolation`
    pub async fn resolve(
        &self,
        hostname: &str,
        isolation: IsolationKey,
    ) -> Result<Vec<crate::protocol::ResolvedAddr>> {
        let circuit = match self.find_isolated(&isolation) {
            Some(c) => c,
            None => {
                let c = self
                    .build_circuit(CircuitPurpose::General, None, None)
                    .await?;
                self.pin(&c, isolation);
                c
            }
        };
        StreamManager::new(circuit).resolve(hostname).await
    }

    /// Build a circuit of the given purpose
    ///
    /// `pinned_last` fixes the final hop; onion-service flows use it
    /// for HSDir, intro and rendezvous circuits.
    pub async fn build_circuit(
        &self,
        purpose: CircuitPurpose,
        target_port: Option<u16>,
        pinned_last: Option<&Relay>,
    ) -> Result<Arc<Circuit>> {
        self.admit_one()?;

        let consensus = self.directory.current()?;
        let mut rng = StdRng::from_entropy();
        let mut path = select_path(
            &consensus,
            &self.guards,
            purpose,
            target_port,
            pinned_last,
            &mut rng,
        )?;
        self.directory.ensure_ntor_keys(&mut path).await?;

        let guard_fp = path[0].fingerprint.clone();
        let is_bootstrap = self.live_count() == 0;
        let channel: Arc<Channel> = self
            .channels
            .get_or_connect(&path[0], is_bootstrap)
            .await
            .map_err(|e| {
                self.guards.record_failure(&guard_fp);
                e
            })?;

        let circuit_id = channel.pick_circuit_id();
        let inbound: mpsc::Receiver<_> = channel.register_circuit(circuit_id);

        let built = Circuit::build(
            channel,
            circuit_id,
            inbound,
            &path,
            purpose,
            self.cancel.child_token(),
        )
        .await;

        match built {
            Ok(circuit) => {
                if let Err(e) = self.guards.record_success(&guard_fp) {
                    log::warn!("guard state not persisted: {}", e);
                }
                self.stats.built.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr("circuits_built", &[]);
                self.control.circuit_event(circuit.id, "open");
                log::info!("built circuit {}: {}", circuit.id, describe_path(&circuit));

                self.circuits.lock().expect("circuit table lock").push(ManagedCircuit {
                    circuit: Arc::clone(&circuit),
                    isolation: None,
                });
                Ok(circuit)
            }
            Err(e) => {
                self.guards.record_failure(&guard_fp);
                self.stats.build_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr("circuit_build_failures", &[]);
                Err(e)
            }
        }
    }

    /// Keep at least `min_pool_size` clean general circuits ready
    pub async fn prebuild(&self) {
        loop {
            let clean = self.clean_count();
            if clean >= self.config.min_pool_size {
                return;
            }
            if self.live_count() >= self.config.max_circuits {
                return;
            }
            log::debug!(
                "prebuilding circuit ({}/{} clean)",
                clean,
                self.config.min_pool_size
            );
            match self
                .build_circuit(CircuitPurpose::General, None, None)
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    log::debug!("prebuild failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Close circuits past their dirtiness or idle horizon
    pub async fn reap(&self) {
        let doomed: Vec<Arc<Circuit>> = {
            let mut table = self.circuits.lock().expect("circuit table lock");
            let max_dirtiness = self.config.max_dirtiness;
            let idle_timeout = self.config.idle_timeout;

            let mut doomed = Vec::new();
            table.retain(|entry| {
                let circuit = &entry.circuit;
                if !circuit.is_open() {
                    return false;
                }
                let expired = (entry.isolation.is_some()
                    && circuit.created_at.elapsed() > max_dirtiness)
                    || circuit.idle_for() > idle_timeout;
                if expired {
                    doomed.push(Arc::clone(circuit));
                    false
                } else {
                    true
                }
            });
            doomed
        };

        for circuit in doomed {
            log::info!("reaping circuit {} (aged out)", circuit.id);
            self.control.circuit_event(circuit.id, "reaped");
            circuit.close(DESTROY_REASON_FINISHED).await;
            self.stats.reaped.fetch_add(1, Ordering::Relaxed);
        }

        self.channels.prune();
        self.metrics.gauge("live_circuits", self.live_count() as f64);
    }

    /// Close everything (orchestrator shutdown)
    pub async fn close_all(&self) {
        let all: Vec<Arc<Circuit>> = {
            let mut table = self.circuits.lock().expect("circuit table lock");
            table.drain(..).map(|e| e.circuit).collect()
        };
        for circuit in all {
            circuit.close(DESTROY_REASON_FINISHED).await;
            self.control.circuit_event(circuit.id, "closed");
        }
    }

    /// Health snapshot
    pub fn health(&self) -> PoolHealth {
        PoolHealth {
            live_circuits: self.live_count(),
            clean_circuits: self.clean_count(),
            circuits_built: self.stats.built.load(Ordering::Relaxed),
            circuits_reused: self.stats.reused.load(Ordering::Relaxed),
            circuits_reaped: self.stats.reaped.load(Ordering::Relaxed),
            build_failures: self.stats.build_failures.load(Ordering::Relaxed),
        }
    }

    /// Pin a circuit to an isolation key (it is dirty from now on)
    fn pin(&self, circuit: &Arc<Circuit>, isolation: IsolationKey) {
        let mut table = self.circuits.lock().expect("circuit table lock");
        if let Some(entry) = table
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.circuit, circuit))
        {
            entry.isolation = Some(isolation);
        }
    }

    /// An open, young circuit compatible with (target, isolation)
    fn find_assignable(&self, target: &Target, isolation: &IsolationKey) -> Option<Arc<Circuit>> {
        let consensus = self.directory.current().ok();
        let mut table = self.circuits.lock().expect("circuit table lock");
        table.retain(|e| {
            !matches!(
                e.circuit.state(),
                crate::protocol::CircuitState::Closed | crate::protocol::CircuitState::Failed
            )
        });

        let port = target.port();
        let exit_allows = |circuit: &Circuit| -> bool {
            let Some(consensus) = consensus.as_ref() else {
                return false;
            };
            let Some(exit_fp) = circuit.path.last() else {
                return false;
            };
            consensus
                .relay(exit_fp)
                .map(|r| r.exit_eligible(port))
                .unwrap_or(false)
        };

        for entry in table.iter_mut() {
            let circuit = &entry.circuit;
            if !circuit.is_open()
                || circuit.purpose != CircuitPurpose::General
                || circuit.created_at.elapsed() > self.config.max_dirtiness
            {
                continue;
            }
            match &entry.isolation {
                Some(existing) if existing == isolation => {
                    if exit_allows(circuit) {
                        return Some(Arc::clone(circuit));
                    }
                }
                None => {
                    if exit_allows(circuit) {
                        entry.isolation = Some(isolation.clone());
                        return Some(Arc::clone(circuit));
                    }
                }
                Some(_) => {}
            }
        }
        None
    }

    /// An open circuit already pinned to exactly this key
    fn find_isolated(&self, isolation: &IsolationKey) -> Option<Arc<Circuit>> {
        let table = self.circuits.lock().expect("circuit table lock");
        table
            .iter()
            .find(|e| {
                e.circuit.is_open()
                    && e.isolation.as_ref() == Some(isolation)
                    && e.circuit.created_at.elapsed() <= self.config.max_dirtiness
            })
            .map(|e| Arc::clone(&e.circuit))
    }

    fn live_count(&self) -> usize {
        self.circuits
            .lock()
            .expect("circuit table lock")
            .iter()
            .filter(|e| e.circuit.is_open())
            .count()
    }

    fn clean_count(&self) -> usize {
        self.circuits
            .lock()
            .expect("circuit table lock")
            .iter()
            .filter(|e| e.circuit.is_open() && e.isolation.is_none())
            .count()
    }

    fn admit_one(&self) -> Result<()> {
        let live = self.live_count();
        if live >= self.config.max_circuits {
            return Err(TorError::AtCapacity(live));
        }
        Ok(())
    }
}
