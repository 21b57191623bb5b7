//! One probe attempt against one endpoint

use crate::config::{BridgeSet, Config, ConfigBuilder, TimingConfig};
use crate::endpoint::{AttemptOutcome, AttemptResult, Endpoint};
use crate::probe::{HttpClient, Identity, IdentityResolver, ThroughputProbe};
use crate::process::{wait_for_circuit, ProcessController, Readiness};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Steps of an attempt, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Stopping,
    Configuring,
    CacheCleared,
    Starting,
    AwaitingCircuit,
    ResolvingIdentity,
    CountryMismatch,
    MeasuringThroughput,
    Done,
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptPhase::Stopping => "stopping",
            AttemptPhase::Configuring => "configuring",
            AttemptPhase::CacheCleared => "cache-cleared",
            AttemptPhase::Starting => "starting",
            AttemptPhase::AwaitingCircuit => "awaiting-circuit",
            AttemptPhase::ResolvingIdentity => "resolving-identity",
            AttemptPhase::CountryMismatch => "country-mismatch",
            AttemptPhase::MeasuringThroughput => "measuring-throughput",
            AttemptPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Phases an attempt went through
#[derive(Debug, Default, Clone)]
pub struct PhaseTrace(Vec<AttemptPhase>);

impl PhaseTrace {
    fn enter(&mut self, phase: AttemptPhase) {
        debug!(%phase, "attempt phase");
        self.0.push(phase);
    }

    pub fn phases(&self) -> &[AttemptPhase] {
        &self.0
    }

    pub fn last(&self) -> Option<AttemptPhase> {
        self.0.last().copied()
    }

    pub fn contains(&self, phase: AttemptPhase) -> bool {
        self.0.contains(&phase)
    }
}

/// Files in a data directory that pin circuits or guards between runs
fn is_cache_artifact(name: &str) -> bool {
    name.starts_with("cached-") || name == "state"
}

/// Delete cached consensus/descriptor files and the state file
pub async fn clear_cache(data_dir: &Path) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(data_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_str().is_some_and(is_cache_artifact) {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Runs the stop → configure → clear → start → wait → probe sequence
pub struct AttemptRunner {
    controller: Arc<dyn ProcessController>,
    builder: ConfigBuilder,
    resolver: IdentityResolver,
    throughput: ThroughputProbe,
    timing: TimingConfig,
}

impl AttemptRunner {
    pub fn new(
        controller: Arc<dyn ProcessController>,
        builder: ConfigBuilder,
        resolver: IdentityResolver,
        throughput: ThroughputProbe,
        timing: TimingConfig,
    ) -> Self {
        AttemptRunner {
            controller,
            builder,
            resolver,
            throughput,
            timing,
        }
    }

    /// Wire a runner from the probe, transport and timing sections of `config`
    pub fn from_config(
        config: &Config,
        http: Arc<dyn HttpClient>,
        controller: Arc<dyn ProcessController>,
    ) -> Self {
        let probe = &config.probe;
        let resolver = IdentityResolver::new(
            http.clone(),
            probe.ip_services.clone(),
            probe.geo_services.clone(),
            probe.ip_timeout(),
            probe.geo_timeout(),
        );
        let throughput = ThroughputProbe::new(
            http,
            probe.download_targets.clone(),
            probe.download_timeout(),
            probe.status_url.clone(),
            probe.status_checks,
            probe.status_timeout(),
        );
        AttemptRunner::new(
            controller,
            ConfigBuilder::new(config.transports.clone()),
            resolver,
            throughput,
            config.timing.clone(),
        )
    }

    pub fn controller(&self) -> &Arc<dyn ProcessController> {
        &self.controller
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Run one attempt with a fresh circuit
    pub async fn run(&self, endpoint: &Endpoint, bridges: Option<&BridgeSet>, attempt: u32) -> AttemptResult {
        self.run_traced(endpoint, bridges, attempt).await.0
    }

    /// [`run`](Self::run), also returning the phases it went through
    #[instrument(skip_all, fields(endpoint = %endpoint.name, attempt = attempt))]
    pub async fn run_traced(
        &self,
        endpoint: &Endpoint,
        bridges: Option<&BridgeSet>,
        attempt: u32,
    ) -> (AttemptResult, PhaseTrace) {
        let mut trace = PhaseTrace::default();

        trace.enter(AttemptPhase::Stopping);
        if let Err(e) = self.controller.stop(endpoint).await {
            warn!("Failed to stop previous tor for {}: {}", endpoint.name, e);
        }

        trace.enter(AttemptPhase::Configuring);
        if let Err(e) = self.builder.write(endpoint, bridges).await {
            warn!("{}", e);
            return (
                AttemptResult::failed(attempt, AttemptOutcome::ConfigWriteFailed),
                trace,
            );
        }

        match clear_cache(&endpoint.data_dir).await {
            Ok(n) => debug!("Removed {} cache artifact(s)", n),
            Err(e) => warn!("Failed to clear cache in {}: {}", endpoint.data_dir.display(), e),
        }
        trace.enter(AttemptPhase::CacheCleared);

        trace.enter(AttemptPhase::Starting);
        if let Err(e) = self.controller.start(endpoint).await {
            warn!("Failed to start tor for {}: {}", endpoint.name, e);
            return (AttemptResult::failed(attempt, AttemptOutcome::Unresolved), trace);
        }

        trace.enter(AttemptPhase::AwaitingCircuit);
        let budget = self.timing.ready_budget(bridges);
        info!("Waiting up to {} seconds for a circuit...", budget.as_secs());
        let readiness = wait_for_circuit(
            self.controller.as_ref(),
            endpoint,
            budget,
            self.timing.poll(),
            self.timing.max_poll(),
        )
        .await;
        if readiness == Readiness::Exited {
            warn!("tor for {} exited before its circuit was ready", endpoint.name);
            return (AttemptResult::failed(attempt, AttemptOutcome::Unresolved), trace);
        }

        trace.enter(AttemptPhase::ResolvingIdentity);
        let Some(identity) = self.resolver.resolve(endpoint.port).await else {
            warn!("No exit IP resolved for {}", endpoint.name);
            return (AttemptResult::failed(attempt, AttemptOutcome::Unresolved), trace);
        };

        if identity.country != Some(endpoint.country) {
            warn!(
                "Wrong country ({} vs {})",
                identity.country_label(),
                endpoint.country
            );
            trace.enter(AttemptPhase::CountryMismatch);
            trace.enter(AttemptPhase::Done);
            return (
                identity_result(attempt, &identity, 0.0, AttemptOutcome::CountryMismatch),
                trace,
            );
        }

        trace.enter(AttemptPhase::MeasuringThroughput);
        info!("Testing speed for {}...", identity.ip);
        let mbps = self.throughput.measure(endpoint.port).await;
        info!(
            "Success: IP={}, Speed={} Mbps, Ping={}ms",
            identity.ip, mbps, identity.latency_ms
        );

        trace.enter(AttemptPhase::Done);
        (
            identity_result(attempt, &identity, mbps, AttemptOutcome::Succeeded),
            trace,
        )
    }

    /// Probe an instance that is already running, without touching it.
    ///
    /// Throughput is measured whenever an exit was resolved; a wrong country is
    /// reported in the outcome.
    #[instrument(skip_all, fields(endpoint = %endpoint.name))]
    pub async fn probe_live(&self, endpoint: &Endpoint, attempt: u32) -> AttemptResult {
        let Some(identity) = self.resolver.resolve(endpoint.port).await else {
            warn!("No exit IP resolved for {}", endpoint.name);
            return AttemptResult::failed(attempt, AttemptOutcome::Unresolved);
        };

        let outcome = if identity.country == Some(endpoint.country) {
            AttemptOutcome::Succeeded
        } else {
            warn!(
                "{} exits in {} instead of {}",
                endpoint.name,
                identity.country_label(),
                endpoint.country
            );
            AttemptOutcome::CountryMismatch
        };

        let mbps = self.throughput.measure(endpoint.port).await;
        info!("IP: {} | Speed: {} Mbps", identity.ip, mbps);
        identity_result(attempt, &identity, mbps, outcome)
    }
}

fn identity_result(attempt: u32, identity: &Identity, mbps: f64, outcome: AttemptOutcome) -> AttemptResult {
    AttemptResult {
        attempt,
        ip: Some(identity.ip),
        country: identity.country,
        city: Some(identity.city.clone()),
        latency_ms: Some(identity.latency_ms),
        throughput_mbps: mbps,
        outcome,
    }
}
