//! Configuration module
//!
//! The YAML file holds fleet settings, the bridge set, probe service lists and
//! the persisted endpoints (with their last observed results).

mod bridge;
mod store;
mod torrc;

pub use bridge::{BridgeSet, BridgeType, MixedBridgePolicy, TransportPaths};
pub use store::{default_config_path, EndpointStore, YamlStore};
pub use torrc::{
    ConfigBuilder, CIRCUIT_BUILD_TIMEOUT, CIRCUIT_PERIOD_RANGE, MAX_CIRCUIT_DIRTINESS,
    NUM_ENTRY_GUARDS,
};

use crate::endpoint::{Endpoint, FleetRegistry};
use crate::probe::{DownloadTarget, GeoService, IpService};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Bounds for attempts per endpoint
pub const MIN_ATTEMPTS: u32 = 1;
pub const MAX_ATTEMPTS: u32 = 10;

/// Shortest and longest accepted re-test interval
pub const MIN_SCHEDULE_HOURS: f64 = 1.0 / 60.0;
pub const MAX_SCHEDULE_HOURS: f64 = 24.0 * 366.0;

/// Convert a re-test interval in hours, rejecting values outside
/// `MIN_SCHEDULE_HOURS..=MAX_SCHEDULE_HOURS`
pub fn schedule_interval_for(hours: f64) -> Result<Duration> {
    if !(MIN_SCHEDULE_HOURS..=MAX_SCHEDULE_HOURS).contains(&hours) {
        return Err(Error::validation(format!(
            "schedule hours must be between {:.4} (one minute) and {}, got {}",
            MIN_SCHEDULE_HOURS, MAX_SCHEDULE_HOURS, hours
        )));
    }
    let interval = Duration::try_from_secs_f64(hours * 3600.0)
        .map_err(|e| Error::validation(format!("schedule hours {}: {}", hours, e)))?;
    if interval.is_zero() {
        return Err(Error::validation("schedule interval must not be zero"));
    }
    Ok(interval)
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Tor executable
    pub tor_executable: PathBuf,

    /// Parent of every instance data directory
    pub base_dir: PathBuf,

    /// Probe attempts per endpoint in a full run
    pub attempts_per_endpoint: u32,

    /// Endpoints probed at the same time
    pub max_concurrent_endpoints: usize,

    /// Interval for scheduled re-tests; `None` disables scheduling
    pub schedule_hours: Option<f64>,

    /// Log level
    pub log_level: String,

    pub mixed_bridge_policy: MixedBridgePolicy,

    /// Fleet-wide bridges
    pub bridges: Option<BridgeSet>,

    pub transports: TransportPaths,

    pub probe: ProbeConfig,

    pub timing: TimingConfig,

    pub endpoints: Vec<Endpoint>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tor_executable: PathBuf::from("tor"),
            base_dir: PathBuf::from("/root/tor"),
            attempts_per_endpoint: 3,
            max_concurrent_endpoints: 1,
            schedule_hours: None,
            log_level: "info".to_string(),
            mixed_bridge_policy: MixedBridgePolicy::default(),
            bridges: None,
            transports: TransportPaths::default(),
            probe: ProbeConfig::default(),
            timing: TimingConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(MIN_ATTEMPTS..=MAX_ATTEMPTS).contains(&self.attempts_per_endpoint) {
            return Err(Error::config(format!(
                "attempts-per-endpoint must be {}-{}, got {}",
                MIN_ATTEMPTS, MAX_ATTEMPTS, self.attempts_per_endpoint
            )));
        }
        if self.max_concurrent_endpoints == 0 {
            return Err(Error::config("max-concurrent-endpoints must be at least 1"));
        }
        if let Some(hours) = self.schedule_hours {
            schedule_interval_for(hours)
                .map_err(|e| Error::config(format!("schedule-hours: {}", e)))?;
        }

        self.probe.validate()?;

        // Names, ports and data directories must be unique
        FleetRegistry::from_endpoints(self.endpoints.clone())
            .map_err(|e| Error::config(e.to_string()))?;

        Ok(())
    }

    /// Save configuration to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// `None` when unscheduled or when the stored value is out of range
    pub fn schedule_interval(&self) -> Option<Duration> {
        self.schedule_hours
            .and_then(|h| schedule_interval_for(h).ok())
    }
}

/// Service lists and timeouts for the identity and throughput cascades
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProbeConfig {
    pub ip_services: Vec<IpService>,
    pub geo_services: Vec<GeoService>,
    pub download_targets: Vec<DownloadTarget>,
    pub status_url: String,
    pub status_checks: u32,
    pub ip_timeout_secs: u64,
    pub geo_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub status_timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            ip_services: [
                "http://api.ipify.org",
                "http://checkip.amazonaws.com",
                "http://icanhazip.com",
                "http://ipecho.net/plain",
                "http://myexternalip.com/raw",
            ]
            .iter()
            .map(|u| IpService(u.to_string()))
            .collect(),
            geo_services: vec![
                GeoService::new("http://ip-api.com/json/{ip}", "countryCode", "city"),
                GeoService::new("https://ipapi.co/{ip}/json/", "country_code", "city"),
                GeoService::new("http://ipwho.is/{ip}", "country_code", "city"),
                GeoService::new(
                    "http://www.geoplugin.net/json.gp?ip={ip}",
                    "geoplugin_countryCode",
                    "geoplugin_city",
                ),
            ],
            download_targets: vec![
                DownloadTarget::new("http://httpbin.org/bytes/50000", 50_000),
                DownloadTarget::new("http://httpbin.org/bytes/25000", 25_000),
                DownloadTarget::new("http://speedtest.ftp.otenet.gr/files/test100k.db", 100_000),
            ],
            status_url: "http://httpbin.org/status/200".to_string(),
            status_checks: 3,
            ip_timeout_secs: 15,
            geo_timeout_secs: 10,
            download_timeout_secs: 12,
            status_timeout_secs: 8,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ip_services.is_empty() {
            return Err(Error::config("probe.ip-services must not be empty"));
        }
        for service in &self.ip_services {
            check_url(&service.0)?;
        }
        for service in &self.geo_services {
            if !service.url.contains("{ip}") {
                return Err(Error::config(format!(
                    "geolocation url {} has no {{ip}} placeholder",
                    service.url
                )));
            }
            check_url(&service.url.replace("{ip}", "192.0.2.1"))?;
        }
        for target in &self.download_targets {
            check_url(&target.url)?;
        }
        check_url(&self.status_url)?;

        let timeouts = [
            self.ip_timeout_secs,
            self.geo_timeout_secs,
            self.download_timeout_secs,
            self.status_timeout_secs,
        ];
        if timeouts.contains(&0) {
            return Err(Error::config("probe timeouts must be positive"));
        }
        Ok(())
    }

    pub fn ip_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_timeout_secs)
    }

    pub fn geo_timeout(&self) -> Duration {
        Duration::from_secs(self.geo_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }
}

fn check_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| Error::config(format!("{}: {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::config(format!("{}: unsupported scheme {}", raw, other))),
    }
}

/// Waits and pauses around process control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TimingConfig {
    /// Upper bound on waiting for a stopped instance to release its port
    pub settle_secs: u64,
    /// Circuit establishment budget without obfs4 bridges
    pub ready_secs: u64,
    /// Circuit establishment budget with obfs4 bridges
    pub ready_obfs4_secs: u64,
    /// Pause between attempts on the same endpoint
    pub attempt_pause_secs: u64,
    /// First liveness poll interval; doubles up to `max-poll-ms`
    pub poll_ms: u64,
    pub max_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            settle_secs: 2,
            ready_secs: 20,
            ready_obfs4_secs: 30,
            attempt_pause_secs: 2,
            poll_ms: 250,
            max_poll_ms: 5_000,
        }
    }
}

impl TimingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    /// Readiness budget for the active bridge transport
    pub fn ready_budget(&self, bridges: Option<&BridgeSet>) -> Duration {
        match bridges {
            Some(set) if set.bridge_type == BridgeType::Obfs4 => {
                Duration::from_secs(self.ready_obfs4_secs)
            }
            _ => Duration::from_secs(self.ready_secs),
        }
    }

    pub fn attempt_pause(&self) -> Duration {
        Duration::from_secs(self.attempt_pause_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_millis(self.max_poll_ms.max(self.poll_ms).max(1))
    }
}
