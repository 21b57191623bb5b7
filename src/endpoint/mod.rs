//! Endpoint data model
//!
//! An [`Endpoint`] is one configured Tor instance: a SOCKS port, a target exit
//! country and a private data directory. The engine owns its result fields and
//! overwrites them from the best attempt of every run.

mod registry;

pub use registry::{EndpointStatus, FleetRegistry};

use crate::common::CountryCode;
use crate::config::BridgeType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};

/// File name of the generated torrc inside each data directory
pub const TORRC_FILE_NAME: &str = "torrc.conf";

/// Check that `name` can serve as the instance's own directory under the
/// base directory: one normal path component, no separators.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("instance name must not be empty"));
    }
    if name.contains(['/', '\\']) {
        return Err(Error::validation(format!(
            "instance name '{}' must not contain path separators",
            name
        )));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::validation(format!(
            "instance name '{}' is not a plain directory name",
            name
        ))),
    }
}

/// One configured Tor instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Endpoint {
    pub name: String,
    pub country: CountryCode,
    pub port: u16,
    pub data_dir: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_type: Option<BridgeType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_history: Vec<AttemptResult>,
}

impl Endpoint {
    /// Create an endpoint whose data directory is `<base_dir>/<name>`
    pub fn new(name: impl Into<String>, country: CountryCode, port: u16, base_dir: &Path) -> Self {
        let name = name.into();
        let data_dir = base_dir.join(&name);
        Endpoint {
            name,
            country,
            port,
            data_dir,
            ip: None,
            city: None,
            latency_ms: None,
            throughput_mbps: None,
            bridge_type: None,
            attempt_history: Vec::new(),
        }
    }

    /// Path of the generated torrc; also the process-table key for this instance
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(TORRC_FILE_NAME)
    }

    pub fn proxy_url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.port)
    }

    /// Overwrite the observed fields from a successful attempt
    pub fn apply_result(&mut self, result: &AttemptResult) {
        self.ip = result.ip;
        self.city = result.city.clone();
        self.latency_ms = result.latency_ms;
        self.throughput_mbps = Some(result.throughput_mbps);
    }

    /// Replace the attempt history with the results of a new run
    pub fn replace_history(&mut self, history: Vec<AttemptResult>) {
        self.attempt_history = history;
    }

    pub fn has_observation(&self) -> bool {
        self.ip.is_some()
    }
}

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    /// Exit in the target country, throughput measured
    Succeeded,
    /// An exit was resolved but it is not in the target country (or its country is unknown)
    CountryMismatch,
    /// No IP-discovery service answered through the instance
    Unresolved,
    /// The torrc could not be written; the instance was not started
    ConfigWriteFailed,
}

/// Immutable record of one probe attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AttemptResult {
    /// 1-based attempt number within the run
    pub attempt: u32,
    pub ip: Option<Ipv4Addr>,
    pub country: Option<CountryCode>,
    pub city: Option<String>,
    pub latency_ms: Option<u64>,
    pub throughput_mbps: f64,
    pub outcome: AttemptOutcome,
}

impl AttemptResult {
    /// A failed attempt that never produced an identity
    pub fn failed(attempt: u32, outcome: AttemptOutcome) -> Self {
        AttemptResult {
            attempt,
            ip: None,
            country: None,
            city: None,
            latency_ms: None,
            throughput_mbps: 0.0,
            outcome,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }

    /// Latency used for ordering; unknown latency sorts last
    pub fn latency_key(&self) -> u64 {
        self.latency_ms.unwrap_or(u64::MAX)
    }
}

/// Pick the successful attempt with the highest throughput.
///
/// Ties keep the earliest attempt. Returns `None` when nothing succeeded.
pub fn select_best(results: &[AttemptResult]) -> Option<&AttemptResult> {
    results
        .iter()
        .filter(|r| r.succeeded())
        .fold(None, |best: Option<&AttemptResult>, r| match best {
            Some(b) if b.throughput_mbps >= r.throughput_mbps => Some(b),
            _ => Some(r),
        })
}
