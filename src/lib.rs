//! torfleet - manage a fleet of local Tor instances pinned to exit countries
//!
//! Each endpoint is one `tor` process with its own SOCKS port and data
//! directory. A run restarts every endpoint several times, checks the exit's
//! country, measures throughput and keeps the fastest circuit seen.
//!
//! # Architecture
//!
//! ```text
//!                +-------------------+
//!                |  Fleet (facade)   |
//!                +---------+---------+
//!                          |
//!        +-----------------+------------------+
//!        |                 |                  |
//! +------v------+  +-------v--------+  +------v------+
//! |  config/    |  |    fleet/      |  |  endpoint/  |
//! | (torrc,     |  | (orchestrator, |  | (registry)  |
//! |  store)     |  |  attempts)     |  +-------------+
//! +-------------+  +---+--------+---+
//!                      |        |
//!              +-------v--+  +--v--------+
//!              | process/ |  |  probe/   |
//!              |  (tor)   |  |  (http)   |
//!              +----------+  +-----------+
//! ```

pub mod common;
pub mod config;
pub mod endpoint;
pub mod fleet;
pub mod probe;
pub mod process;

pub use common::error::{Error, Result};
pub use config::Config;

use config::{
    schedule_interval_for, BridgeSet, BridgeType, EndpointStore, MAX_ATTEMPTS, MIN_ATTEMPTS,
};
use endpoint::{EndpointStatus, FleetRegistry};
use fleet::{AttemptRunner, FleetOrchestrator, FleetRanking};
use probe::{HttpClient, ReqwestClient};
use process::{ProcessController, TorController};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The managed fleet: registry, engine and persistence wired together
pub struct Fleet {
    /// Settings; `endpoints` lives in the registry while the fleet is open
    config: Config,
    registry: FleetRegistry,
    controller: Arc<dyn ProcessController>,
    orchestrator: FleetOrchestrator,
    store: Arc<dyn EndpointStore>,
}

impl Fleet {
    /// Load the configuration from `store` and wire real tor and HTTP
    pub async fn open(store: Arc<dyn EndpointStore>) -> Result<Self> {
        let config = store.load().await?;
        Self::from_config(config, store)
    }

    pub fn from_config(config: Config, store: Arc<dyn EndpointStore>) -> Result<Self> {
        let controller = Arc::new(TorController::new(
            config.tor_executable.clone(),
            config.timing.settle(),
            config.timing.poll(),
        ));
        Self::with_parts(config, store, Arc::new(ReqwestClient::new()), controller)
    }

    /// Build from explicit collaborators
    pub fn with_parts(
        mut config: Config,
        store: Arc<dyn EndpointStore>,
        http: Arc<dyn HttpClient>,
        controller: Arc<dyn ProcessController>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = FleetRegistry::from_endpoints(std::mem::take(&mut config.endpoints))?;

        let runner = AttemptRunner::from_config(&config, http, controller.clone());
        let orchestrator = FleetOrchestrator::new(runner, config.max_concurrent_endpoints)
            .with_cancellation(CancellationToken::new());

        info!(
            "torfleet v{}: {} instance(s), {} attempt(s) each",
            VERSION,
            registry.len(),
            config.attempts_per_endpoint
        );

        Ok(Fleet {
            config,
            registry,
            controller,
            orchestrator,
            store,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    /// Cancelling finishes in-flight attempts and starts no new ones
    pub fn cancellation_token(&self) -> CancellationToken {
        self.orchestrator.cancellation_token()
    }

    /// Full run over every endpoint, then persist the results
    pub async fn start_all(&mut self) -> Result<FleetRanking> {
        if self.registry.is_empty() {
            return Err(Error::validation("no instances configured"));
        }
        let ranking = self
            .orchestrator
            .run_all(
                self.registry.endpoints_mut(),
                self.config.bridges.as_ref(),
                self.config.attempts_per_endpoint,
            )
            .await;
        self.save().await?;
        Ok(ranking)
    }

    /// Re-probe running endpoints in place, then persist
    pub async fn test_running(&mut self) -> Result<FleetRanking> {
        let ranking = self
            .orchestrator
            .retest_running(self.registry.endpoints_mut())
            .await;
        self.save().await?;
        Ok(ranking)
    }

    pub async fn add_endpoint(&mut self, name: &str, country: &str, port: u16) -> Result<()> {
        self.registry
            .add(name, country, port, &self.config.base_dir)
            .await?;
        self.save().await
    }

    pub async fn remove_endpoint(&mut self, name: &str, delete_data: bool) -> Result<()> {
        self.registry
            .remove(name, self.controller.as_ref(), delete_data)
            .await?;
        self.save().await
    }

    /// Replace the fleet-wide bridges; blank input clears them
    pub async fn set_bridges(&mut self, input: &str) -> Result<Option<BridgeType>> {
        let bridges = BridgeSet::parse(input, self.config.mixed_bridge_policy)?;
        let bridge_type = bridges.as_ref().map(|set| set.bridge_type);
        match &bridges {
            Some(set) => info!("Loaded {} {} bridge(s)", set.len(), set.bridge_type),
            None => info!("Bridges cleared"),
        }
        self.config.bridges = bridges;
        self.save().await?;
        Ok(bridge_type)
    }

    pub async fn clear_bridges(&mut self) -> Result<()> {
        self.set_bridges("").await.map(|_| ())
    }

    pub async fn set_attempts(&mut self, attempts: u32) -> Result<()> {
        if !(MIN_ATTEMPTS..=MAX_ATTEMPTS).contains(&attempts) {
            return Err(Error::validation(format!(
                "attempts must be {}-{}, got {}",
                MIN_ATTEMPTS, MAX_ATTEMPTS, attempts
            )));
        }
        self.config.attempts_per_endpoint = attempts;
        self.save().await
    }

    pub async fn set_schedule(&mut self, hours: f64) -> Result<()> {
        schedule_interval_for(hours)?;
        self.config.schedule_hours = Some(hours);
        self.save().await
    }

    pub async fn status(&self) -> Vec<EndpointStatus> {
        self.registry.status(self.controller.as_ref()).await
    }

    /// Persist settings together with the current endpoint list
    pub async fn save(&self) -> Result<()> {
        let mut snapshot = self.config.clone();
        snapshot.endpoints = self.registry.endpoints().to_vec();
        self.store.save(&snapshot).await
    }
}
