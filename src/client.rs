//! Client orchestrator
//!
//! Wires the components together and owns their lifecycle: storage,
//! directory client, guard set, circuit manager, onion client and the
//! SOCKS front door, plus the background tasks (consensus refresh,
//! circuit reaping, pool prebuilding). Everything hangs off one root
//! cancellation token; `stop()` cancels it, drains with a bounded
//! deadline, then aborts whatever is left.

use crate::config::TorConfig;
use crate::error::Result;
use crate::guards::GuardManager;
use crate::hooks::{ControlHandle, MetricsHandle};
use crate::onion::OnionClient;
use crate::pool::{CircuitManager, PoolHealth};
use crate::protocol::DirectoryClient;
use crate::socks::SocksServer;
use crate::storage::Storage;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often the reaper and prebuilder run
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// How often consensus freshness is checked
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for draining tasks on shutdown
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Aggregated component health
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Whether a usable consensus is held
    pub bootstrapped: bool,

    /// Relays in the current consensus (0 when none)
    pub consensus_relays: usize,

    /// Whether the consensus is still fresh
    pub consensus_fresh: bool,

    /// Guards currently persisted
    pub guards: usize,

    /// Circuit pool state
    pub pool: PoolHealth,

    /// Admitted SOCKS connections
    pub socks_connections: usize,
}

/// The running client
pub struct TorClient {
    directory: Arc<DirectoryClient>,
    guards: Arc<GuardManager>,
    manager: Arc<CircuitManager>,
    socks: Arc<SocksServer>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TorClient {
    /// Validate the configuration, bootstrap the directory, and start
    /// every component
    pub async fn start(
        config: TorConfig,
        metrics: MetricsHandle,
        control: ControlHandle,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let cancel = CancellationToken::new();

        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let guards = Arc::new(GuardManager::load(
            Arc::clone(&storage),
            config.guard_lifetime_days,
        )?);
        let directory = Arc::new(DirectoryClient::new(
            &config,
            Arc::clone(&storage),
            cancel.child_token(),
        )?);

        let consensus = directory.bootstrap().await?;
        log::info!(
            "bootstrapped with {} relays ({} usable)",
            consensus.relays.len(),
            consensus.usable_relays().count()
        );
        metrics.gauge("consensus_relays", consensus.relays.len() as f64);

        let manager = Arc::new(CircuitManager::new(
            config.clone(),
            Arc::clone(&directory),
            Arc::clone(&guards),
            Arc::clone(&metrics),
            Arc::clone(&control),
            cancel.child_token(),
        ));
        let onion = Arc::new(OnionClient::new(
            Arc::clone(&manager),
            Arc::clone(&directory),
            Arc::clone(&storage),
        ));
        let socks = Arc::new(SocksServer::new(
            config.clone(),
            Arc::clone(&manager),
            onion,
            Arc::clone(&control),
            cancel.child_token(),
        ));

        let client = Arc::new(Self {
            directory,
            guards,
            manager,
            socks,
            cancel,
            tasks: Mutex::new(Vec::new()),
        });

        client.spawn_background_tasks();
        Ok(client)
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("task list lock");

        // SOCKS listener.
        let socks = Arc::clone(&self.socks);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = socks.run().await {
                log::error!("SOCKS listener exited: {}", e);
            }
        }));

        // Consensus refresher.
        let directory = Arc::clone(&self.directory);
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }
                if let Err(e) = directory.refresh_if_stale().await {
                    log::warn!("consensus refresh failed: {}", e);
                }
            }
        }));

        // Reaper and prebuilder.
        let manager = Arc::clone(&self.manager);
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }
                manager.reap().await;
                manager.prebuild().await;
            }
        }));
    }

    /// Cancel everything, drain briefly, abort stragglers, close
    /// circuits with DESTROY
    pub async fn stop(&self) {
        log::info!("shutting down");
        self.cancel.cancel();

        let mut tasks: Vec<JoinHandle<()>> =
            self.tasks.lock().expect("task list lock").drain(..).collect();
        let drain = futures::future::join_all(tasks.iter_mut());
        if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
            log::warn!("drain deadline passed, aborting remaining tasks");
            for task in &tasks {
                task.abort();
            }
        }

        self.manager.close_all().await;
        log::info!("shutdown complete");
    }

    /// Aggregate health across components
    pub fn health(&self) -> HealthReport {
        let (bootstrapped, consensus_relays, consensus_fresh) = match self.directory.current() {
            Ok(c) => (true, c.relays.len(), c.is_fresh(SystemTime::now())),
            Err(_) => (false, 0, false),
        };

        HealthReport {
            bootstrapped,
            consensus_relays,
            consensus_fresh,
            guards: self.guards.len(),
            pool: self.manager.health(),
            socks_connections: self.socks.active_connections(),
        }
    }

    /// The circuit manager, for embedding without the SOCKS listener
    pub fn circuit_manager(&self) -> Arc<CircuitManager> {
        Arc::clone(&self.manager)
    }

    /// The directory client
    pub fn directory(&self) -> Arc<DirectoryClient> {
        Arc::clone(&self.directory)
    }
}

impl Drop for TorClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }
    }
}
