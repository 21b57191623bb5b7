//! Periodic re-tests

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Held for the whole of a fleet run; at most one run at a time
#[derive(Debug, Clone, Default)]
pub struct RunLock(Arc<Mutex<()>>);

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if a run is already in progress
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.0.clone().try_lock_owned().ok()
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.0.clone().lock_owned().await
    }

    pub fn is_held(&self) -> bool {
        self.0.try_lock().is_err()
    }
}

/// Fires a job every `interval` until cancelled.
///
/// A tick that finds the run lock held is skipped, not queued.
pub struct Scheduler {
    interval: Duration,
    lock: RunLock,
    cancel: CancellationToken,
}

impl Scheduler {
    /// `interval` is raised to at least one second
    pub fn new(interval: Duration, lock: RunLock, cancel: CancellationToken) -> Self {
        Scheduler {
            interval: interval.max(MIN_INTERVAL),
            lock,
            cancel,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until cancelled; returns how many times `job` ran.
    /// A job in progress is allowed to finish before returning.
    pub async fn run<F, Fut>(&self, mut job: F) -> u64
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Scheduled re-tests every {:.2} hours",
            self.interval.as_secs_f64() / 3600.0
        );

        let mut runs = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Scheduler stopped after {} run(s)", runs);
                    return runs;
                }
                _ = ticker.tick() => {
                    let Some(_guard) = self.lock.try_acquire() else {
                        warn!("Previous run still in progress, skipping scheduled re-test");
                        continue;
                    };
                    info!("Running scheduled re-test");
                    job().await;
                    runs += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spawn_cancel_after(token: &CancellationToken, after: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised() {
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(Duration::ZERO, RunLock::new(), cancel.clone());
        assert_eq!(scheduler.interval(), MIN_INTERVAL);

        spawn_cancel_after(&cancel, Duration::from_millis(3500));
        assert_eq!(scheduler.run(|| async {}).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_interval() {
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(Duration::from_secs(3600), RunLock::new(), cancel.clone());
        spawn_cancel_after(&cancel, Duration::from_secs(3 * 3600 + 1800));

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let runs = scheduler
            .run(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        assert_eq!(runs, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_tick_while_run_in_progress() {
        let cancel = CancellationToken::new();
        let lock = RunLock::new();
        let scheduler = Scheduler::new(Duration::from_secs(60), lock.clone(), cancel.clone());

        // A manual run holds the lock for the first 150 seconds
        let guard = lock.acquire().await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(150)).await;
            drop(guard);
        });
        spawn_cancel_after(&cancel, Duration::from_secs(200));

        let runs = scheduler.run(|| async {}).await;
        // Ticks at 60 and 120 are skipped, 180 runs
        assert_eq!(runs, 1);
        assert!(!lock.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_does_not_overlap() {
        let cancel = CancellationToken::new();
        let lock = RunLock::new();
        let scheduler = Scheduler::new(Duration::from_secs(10), lock.clone(), cancel.clone());
        spawn_cancel_after(&cancel, Duration::from_secs(100));

        let active = Arc::new(AtomicU32::new(0));
        let a = active.clone();
        let runs = scheduler
            .run(move || {
                let a = a.clone();
                async move {
                    assert_eq!(a.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_secs(25)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .await;

        assert!((2..=4).contains(&runs));
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
