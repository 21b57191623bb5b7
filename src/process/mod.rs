//! Tor process control
//!
//! Instances are identified by their torrc path in the process table, never by
//! port. A launched instance gives no readiness signal, so callers wait out a
//! circuit budget with [`wait_for_circuit`], which polls liveness and returns
//! early if the process dies.

mod table;
mod tor;

pub use table::{cmdline_matches, find_pids};
pub use tor::TorController;

use crate::endpoint::Endpoint;
use crate::Result;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Launch the instance from its written torrc. Returns once spawned.
    async fn start(&self, endpoint: &Endpoint) -> Result<()>;

    /// Terminate the instance and wait for it to release its port.
    /// A no-op when nothing is running.
    async fn stop(&self, endpoint: &Endpoint) -> Result<()>;

    async fn is_running(&self, endpoint: &Endpoint) -> bool;
}

/// Outcome of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Budget spent with the process alive the whole time
    Elapsed,
    /// The process disappeared before the budget ran out
    Exited,
}

/// Poll `check` with doubling intervals (from `poll` up to `max_poll`) until it
/// returns true or `budget` runs out. Never waits longer than `budget`.
/// Returns whether `check` succeeded.
pub async fn poll_until<F, Fut>(budget: Duration, poll: Duration, max_poll: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + budget;
    let mut interval = poll;
    loop {
        if check().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
        interval = (interval * 2).min(max_poll);
    }
}

/// Wait out the circuit-establishment budget for a freshly started instance
pub async fn wait_for_circuit(
    controller: &dyn ProcessController,
    endpoint: &Endpoint,
    budget: Duration,
    poll: Duration,
    max_poll: Duration,
) -> Readiness {
    let exited = poll_until(budget, poll, max_poll, move || async move {
        !controller.is_running(endpoint).await
    })
    .await;

    if exited {
        Readiness::Exited
    } else {
        Readiness::Elapsed
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory controller for engine tests

    use super::*;
    use crate::Error;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    pub struct FakeController {
        running: Mutex<HashSet<String>>,
        events: Mutex<Vec<String>>,
        fail_stop: Mutex<bool>,
        fail_start: Mutex<bool>,
        /// Instances that die right after launch
        crashing: Mutex<HashSet<String>>,
    }

    impl FakeController {
        pub fn set_running(&self, name: &str) {
            self.running.lock().insert(name.to_string());
        }

        pub fn fail_stop(&self, fail: bool) {
            *self.fail_stop.lock() = fail;
        }

        pub fn fail_start(&self, fail: bool) {
            *self.fail_start.lock() = fail;
        }

        pub fn crash_on_start(&self, name: &str) {
            self.crashing.lock().insert(name.to_string());
        }

        /// Ordered "start:<name>" / "stop:<name>" log
        pub fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        pub fn stop_calls(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| e.strip_prefix("stop:").map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl ProcessController for FakeController {
        async fn start(&self, endpoint: &Endpoint) -> Result<()> {
            self.events.lock().push(format!("start:{}", endpoint.name));
            if *self.fail_start.lock() {
                return Err(Error::process("spawn failed"));
            }
            if !self.crashing.lock().contains(&endpoint.name) {
                self.running.lock().insert(endpoint.name.clone());
            }
            Ok(())
        }

        async fn stop(&self, endpoint: &Endpoint) -> Result<()> {
            self.events.lock().push(format!("stop:{}", endpoint.name));
            if *self.fail_stop.lock() {
                return Err(Error::process("kill failed"));
            }
            self.running.lock().remove(&endpoint.name);
            Ok(())
        }

        async fn is_running(&self, endpoint: &Endpoint) -> bool {
            self.running.lock().contains(&endpoint.name)
        }
    }
}
