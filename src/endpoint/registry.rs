//! Fleet registry: the ordered set of configured endpoints

use super::{validate_name, Endpoint};
use crate::common::CountryCode;
use crate::process::ProcessController;
use crate::{Error, Result};
use std::path::Path;
use tracing::{info, warn};

/// Liveness snapshot for listing
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub name: String,
    pub country: CountryCode,
    pub port: u16,
    pub running: bool,
}

/// Ordered registry keyed by endpoint name.
///
/// Names, ports and data directories are unique; insertion order is the
/// processing order.
#[derive(Debug, Clone, Default)]
pub struct FleetRegistry {
    endpoints: Vec<Endpoint>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted endpoints, rejecting bad names and duplicate
    /// names, ports or data directories
    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Result<Self> {
        let mut registry = FleetRegistry::new();
        for endpoint in endpoints {
            registry.check_unique(&endpoint)?;
            registry.endpoints.push(endpoint);
        }
        Ok(registry)
    }

    fn check_unique(&self, endpoint: &Endpoint) -> Result<()> {
        validate_name(&endpoint.name)?;
        if endpoint.data_dir.file_name().is_none() {
            return Err(Error::validation(format!(
                "instance '{}' has no usable data directory: {}",
                endpoint.name,
                endpoint.data_dir.display()
            )));
        }
        if self.get(&endpoint.name).is_some() {
            return Err(Error::validation(format!(
                "instance '{}' already exists",
                endpoint.name
            )));
        }
        if let Some(other) = self.endpoints.iter().find(|e| e.port == endpoint.port) {
            return Err(Error::validation(format!(
                "port {} already in use by '{}'",
                endpoint.port, other.name
            )));
        }
        // Path equality compares components, so `a/./b` equals `a/b`
        if let Some(other) = self
            .endpoints
            .iter()
            .find(|e| e.data_dir == endpoint.data_dir)
        {
            return Err(Error::validation(format!(
                "data directory {} already used by '{}'",
                endpoint.data_dir.display(),
                other.name
            )));
        }
        Ok(())
    }

    /// Register a new endpoint and create its data directory
    pub async fn add(
        &mut self,
        name: &str,
        country: &str,
        port: u16,
        base_dir: &Path,
    ) -> Result<&Endpoint> {
        let country = CountryCode::parse(country)?;
        validate_name(name)?;
        let endpoint = Endpoint::new(name, country, port, base_dir);
        self.check_unique(&endpoint)?;

        tokio::fs::create_dir_all(&endpoint.data_dir).await?;
        info!(
            "Added instance: {} ({}) on port {}, data directory {}",
            endpoint.name,
            endpoint.country,
            endpoint.port,
            endpoint.data_dir.display()
        );

        self.endpoints.push(endpoint);
        Ok(&self.endpoints[self.endpoints.len() - 1])
    }

    /// Remove an endpoint. Its process is always stopped first; if stopping
    /// fails the endpoint stays registered.
    pub async fn remove(
        &mut self,
        name: &str,
        controller: &dyn ProcessController,
        delete_data: bool,
    ) -> Result<Endpoint> {
        let index = self
            .endpoints
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| Error::not_found(format!("instance '{}'", name)))?;

        controller.stop(&self.endpoints[index]).await?;

        if delete_data {
            let dir = &self.endpoints[index].data_dir;
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => info!("Deleted data directory {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete {}: {}", dir.display(), e),
            }
        }

        let removed = self.endpoints.remove(index);
        info!("Removed instance: {}", removed.name);
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|e| e.name == name)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoints_mut(&mut self) -> &mut [Endpoint] {
        &mut self.endpoints
    }

    pub fn into_endpoints(self) -> Vec<Endpoint> {
        self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Liveness of every endpoint, in registry order
    pub async fn status(&self, controller: &dyn ProcessController) -> Vec<EndpointStatus> {
        let mut out = Vec::with_capacity(self.endpoints.len());
        for e in &self.endpoints {
            out.push(EndpointStatus {
                name: e.name.clone(),
                country: e.country,
                port: e.port,
                running: controller.is_running(e).await,
            });
        }
        out
    }
}
