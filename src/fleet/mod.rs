//! Probe engine: per-attempt state machine, fleet orchestration, ranking and
//! periodic re-tests

mod attempt;
mod orchestrator;
mod ranking;
mod scheduler;

pub use attempt::{clear_cache, AttemptPhase, AttemptRunner, PhaseTrace};
pub use orchestrator::FleetOrchestrator;
pub use ranking::{rank_order, FleetRanking, RankedEntry, SpeedTier};
pub use scheduler::{RunLock, Scheduler};

#[cfg(test)]
pub(crate) mod testing {
    //! Runner wiring and scripting helpers shared by engine tests

    use super::AttemptRunner;
    use crate::config::Config;
    use crate::probe::testing::{Reply, ScriptedHttp};
    use crate::probe::Route;
    use crate::process::ProcessController;
    use std::sync::Arc;
    use std::time::Duration;

    pub const IP_URL: &str = "http://api.ipify.org";
    pub const DOWNLOAD_URL: &str = "http://httpbin.org/bytes/50000";

    /// Runner over the default probe services
    pub fn runner(http: Arc<ScriptedHttp>, controller: Arc<dyn ProcessController>) -> AttemptRunner {
        AttemptRunner::from_config(&Config::default(), http, controller)
    }

    /// Queue one exit identity for the instance on `port`
    pub fn script_identity(http: &ScriptedHttp, port: u16, ip: &str, country: &str, latency_ms: u64) {
        http.on_route(IP_URL, Route::Socks(port), Reply::text(ip, latency_ms));
        http.on(
            &format!("http://ip-api.com/json/{}", ip),
            Reply::text(
                &format!(r#"{{"countryCode":"{}","city":"Somewhere"}}"#, country),
                40,
            ),
        );
    }

    /// Queue one download sample for the instance on `port`
    pub fn script_speed(http: &ScriptedHttp, port: u16, bytes: usize, elapsed_ms: u64) {
        http.on_route(
            DOWNLOAD_URL,
            Route::Socks(port),
            Reply::bytes(bytes, Duration::from_millis(elapsed_ms)),
        );
    }
}
