//! Fleet-wide runs over a bounded worker pool

use super::attempt::AttemptRunner;
use super::ranking::{FleetRanking, RankedEntry};
use crate::config::BridgeSet;
use crate::endpoint::{select_best, AttemptResult, Endpoint};
use chrono::Local;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Drives attempts across the fleet.
///
/// Each worker owns one endpoint's whole attempt sequence, so the
/// stop/start/probe cycle on a port never overlaps with another attempt on
/// that port. Distinct endpoints run concurrently up to `workers`.
pub struct FleetOrchestrator {
    runner: AttemptRunner,
    workers: usize,
    attempt_pause: Duration,
    cancel: CancellationToken,
}

impl FleetOrchestrator {
    pub fn new(runner: AttemptRunner, workers: usize) -> Self {
        let attempt_pause = runner.timing().attempt_pause();
        FleetOrchestrator {
            runner,
            workers: workers.max(1),
            attempt_pause,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling lets in-flight attempts finish and starts no new ones
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `attempts` attempts on every endpoint, update each in place and
    /// rank the ones that succeeded at least once.
    pub async fn run_all(
        &self,
        endpoints: &mut [Endpoint],
        bridges: Option<&BridgeSet>,
        attempts: u32,
    ) -> FleetRanking {
        let started_at = Local::now();
        let attempts = attempts.max(1);
        info!(
            "Testing {} endpoint(s), {} attempt(s) each, {} worker(s)",
            endpoints.len(),
            attempts,
            self.workers
        );

        let outcomes: Vec<(usize, String, Option<RankedEntry>)> =
            stream::iter(endpoints.iter_mut().enumerate())
                .map(|(index, endpoint)| async move {
                    let best = self.find_best(endpoint, bridges, attempts).await;
                    let entry = best.map(|best| RankedEntry::new(endpoint, best));
                    (index, endpoint.name.clone(), entry)
                })
                .buffer_unordered(self.workers)
                .collect()
                .await;

        aggregate(started_at, outcomes)
    }

    /// Sequential attempts on one endpoint; applies the best result
    #[instrument(skip_all, fields(endpoint = %endpoint.name))]
    pub async fn find_best(
        &self,
        endpoint: &mut Endpoint,
        bridges: Option<&BridgeSet>,
        attempts: u32,
    ) -> Option<AttemptResult> {
        info!("Finding best circuit for {} ({})", endpoint.name, endpoint.country);

        let mut history = Vec::with_capacity(attempts as usize);
        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                info!("Cancelled before attempt {}/{}", attempt, attempts);
                break;
            }
            info!("--- Attempt {}/{} for {} ---", attempt, attempts, endpoint.name);
            history.push(self.runner.run(endpoint, bridges, attempt).await);

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.attempt_pause) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        let best = select_best(&history).cloned();
        match &best {
            Some(best) => {
                endpoint.apply_result(best);
                endpoint.bridge_type = bridges.map(|set| set.bridge_type);
                info!(
                    "Best for {}: {} Mbps (attempt {})",
                    endpoint.name, best.throughput_mbps, best.attempt
                );
            }
            None => warn!("No successful connection for {}", endpoint.name),
        }
        endpoint.replace_history(history);
        best
    }

    /// Re-probe endpoints that are already running without restarting them
    pub async fn retest_running(&self, endpoints: &mut [Endpoint]) -> FleetRanking {
        let started_at = Local::now();
        let controller = self.runner.controller();
        info!("Re-testing running endpoints");

        let outcomes: Vec<(usize, String, Option<RankedEntry>)> =
            stream::iter(endpoints.iter_mut().enumerate())
                .map(|(index, endpoint)| async move {
                    if !controller.is_running(endpoint).await {
                        info!("{} is not running", endpoint.name);
                        return (index, endpoint.name.clone(), None);
                    }
                    let result = self.runner.probe_live(endpoint, 1).await;
                    if result.ip.is_none() {
                        return (index, endpoint.name.clone(), None);
                    }
                    endpoint.apply_result(&result);
                    (index, endpoint.name.clone(), Some(RankedEntry::new(endpoint, result)))
                })
                .buffer_unordered(self.workers)
                .collect()
                .await;

        aggregate(started_at, outcomes)
    }
}

fn aggregate(
    started_at: chrono::DateTime<Local>,
    mut outcomes: Vec<(usize, String, Option<RankedEntry>)>,
) -> FleetRanking {
    // Workers finish in any order; restore registry order first
    outcomes.sort_by_key(|(index, _, _)| *index);

    let mut entries = Vec::new();
    let mut excluded = Vec::new();
    for (_, name, entry) in outcomes {
        match entry {
            Some(entry) => entries.push(entry),
            None => excluded.push(name),
        }
    }
    FleetRanking::new(started_at, entries, excluded)
}
