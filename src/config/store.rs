//! Persistence of the fleet configuration

use super::Config;
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// Where the fleet's configuration and endpoint results live
#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Load the configuration; a missing store yields defaults
    async fn load(&self) -> Result<Config>;

    async fn save(&self, config: &Config) -> Result<()>;
}

/// `~/.torfleet/config.yaml`, or `./torfleet.yaml` when HOME is unset
pub fn default_config_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".torfleet").join("config.yaml"),
        None => PathBuf::from("torfleet.yaml"),
    }
}

/// YAML file store
#[derive(Debug, Clone)]
pub struct YamlStore {
    path: PathBuf,
}

impl YamlStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        YamlStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EndpointStore for YamlStore {
    async fn load(&self) -> Result<Config> {
        if !fs::try_exists(&self.path).await? {
            info!("No configuration at {}, using defaults", self.path.display());
            return Ok(Config::default());
        }
        let config = Config::load_async(&self.path).await?;
        info!(
            "Loaded {} saved instance(s) from {}",
            config.endpoints.len(),
            self.path.display()
        );
        Ok(config)
    }

    async fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("yaml.tmp");
        config.save(&tmp).await?;
        fs::rename(&tmp, &self.path).await?;
        info!("Configuration saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CountryCode;
    use crate::endpoint::Endpoint;

    #[tokio::test]
    async fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlStore::new(dir.path().join("absent.yaml"));
        let config = store.load().await.unwrap();
        assert!(config.endpoints.is_empty());
        assert_eq!(config.attempts_per_endpoint, 3);
    }

    #[tokio::test]
    async fn test_save_then_load_keeps_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlStore::new(dir.path().join("sub").join("config.yaml"));

        let mut ep = Endpoint::new("tor1", CountryCode::parse("GB").unwrap(), 9052, dir.path());
        ep.ip = Some("203.0.113.9".parse().unwrap());
        ep.throughput_mbps = Some(2.75);
        let config = Config {
            attempts_per_endpoint: 4,
            endpoints: vec![ep],
            ..Default::default()
        };

        store.save(&config).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.attempts_per_endpoint, 4);
        assert_eq!(loaded.endpoints[0].name, "tor1");
        assert_eq!(loaded.endpoints[0].throughput_mbps, Some(2.75));
        assert!(!dir.path().join("sub").join("config.yaml.tmp").exists());
    }
}
