//! Egress identity: exit IP, then its country and city

use super::{HttpClient, Route};
use crate::common::{sanitize_city, CountryCode, UNKNOWN_CITY};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Plain-text "what is my address" service, queried through the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpService(pub String);

impl IpService {
    /// Ask for the exit address; returns it with the call's latency in ms
    pub async fn discover(
        &self,
        http: &dyn HttpClient,
        port: u16,
        timeout: Duration,
    ) -> Result<(Ipv4Addr, u64)> {
        let resp = http.get(&self.0, Route::Socks(port), timeout).await?;
        let latency_ms = resp.elapsed.as_millis() as u64;
        let ip = resp
            .text()
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::parse(format!("{} returned no IPv4 address", self.0)))?;
        Ok((ip, latency_ms))
    }
}

/// JSON geolocation service, queried directly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeoService {
    /// URL template; `{ip}` is replaced with the address
    pub url: String,
    pub country_key: String,
    pub city_key: String,
}

impl GeoService {
    pub fn new(url: &str, country_key: &str, city_key: &str) -> Self {
        GeoService {
            url: url.to_string(),
            country_key: country_key.to_string(),
            city_key: city_key.to_string(),
        }
    }

    /// Look up an address. A non-2xx reply or a country that is not two
    /// letters counts as a failure of this service.
    pub async fn locate(
        &self,
        http: &dyn HttpClient,
        ip: Ipv4Addr,
        timeout: Duration,
    ) -> Result<(CountryCode, String)> {
        let url = self.url.replace("{ip}", &ip.to_string());
        let resp = http.get(&url, Route::Direct, timeout).await?;
        if !resp.is_success() {
            return Err(Error::http(format!("{} returned {}", url, resp.status)));
        }

        let body: Value = serde_json::from_slice(&resp.body)?;
        let country = body
            .get(&self.country_key)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::parse(format!("{} has no {}", url, self.country_key)))?;
        let country = CountryCode::parse(country).map_err(|e| Error::parse(e.to_string()))?;
        let city = body
            .get(&self.city_key)
            .and_then(Value::as_str)
            .map(sanitize_city)
            .unwrap_or_else(|| UNKNOWN_CITY.to_string());

        Ok((country, city))
    }
}

/// Resolved egress identity of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub ip: Ipv4Addr,
    /// `None` when every geolocation service failed
    pub country: Option<CountryCode>,
    pub city: String,
    pub latency_ms: u64,
}

impl Identity {
    pub fn country_label(&self) -> &str {
        self.country.as_ref().map_or("Unknown", CountryCode::as_str)
    }
}

/// Runs the IP-discovery cascade, then the geolocation cascade
pub struct IdentityResolver {
    http: Arc<dyn HttpClient>,
    ip_services: Vec<IpService>,
    geo_services: Vec<GeoService>,
    ip_timeout: Duration,
    geo_timeout: Duration,
}

impl IdentityResolver {
    pub fn new(
        http: Arc<dyn HttpClient>,
        ip_services: Vec<IpService>,
        geo_services: Vec<GeoService>,
        ip_timeout: Duration,
        geo_timeout: Duration,
    ) -> Self {
        IdentityResolver {
            http,
            ip_services,
            geo_services,
            ip_timeout,
            geo_timeout,
        }
    }

    /// Resolve the identity behind a SOCKS port.
    ///
    /// `None` means no IP service answered; geolocation is then skipped.
    pub async fn resolve(&self, port: u16) -> Option<Identity> {
        let (ip, latency_ms) = self.discover_ip(port).await?;

        let (country, city) = match self.locate(ip).await {
            Some((country, city)) => (Some(country), city),
            None => (None, UNKNOWN_CITY.to_string()),
        };

        Some(Identity {
            ip,
            country,
            city,
            latency_ms,
        })
    }

    /// First IP service to return a dotted quad wins
    pub async fn discover_ip(&self, port: u16) -> Option<(Ipv4Addr, u64)> {
        for service in &self.ip_services {
            match service.discover(self.http.as_ref(), port, self.ip_timeout).await {
                Ok(found) => return Some(found),
                Err(e) => debug!("IP service {} failed: {}", service.0, e),
            }
        }
        None
    }

    /// First geolocation service with a valid country wins
    pub async fn locate(&self, ip: Ipv4Addr) -> Option<(CountryCode, String)> {
        for service in &self.geo_services {
            match service.locate(self.http.as_ref(), ip, self.geo_timeout).await {
                Ok(found) => return Some(found),
                Err(e) => debug!("Geolocation service {} failed: {}", service.url, e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::{Reply, ScriptedHttp};

    const IPIFY: &str = "http://api.ipify.org";
    const AMAZON: &str = "http://checkip.amazonaws.com";
    const IP_API: &str = "http://ip-api.com/json/{ip}";
    const IPWHO: &str = "http://ipwho.is/{ip}";

    fn resolver(http: Arc<ScriptedHttp>) -> IdentityResolver {
        IdentityResolver::new(
            http,
            vec![IpService(IPIFY.into()), IpService(AMAZON.into())],
            vec![
                GeoService::new(IP_API, "countryCode", "city"),
                GeoService::new(IPWHO, "country_code", "city"),
            ],
            Duration::from_secs(15),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_first_valid_ip_wins() {
        let http = Arc::new(ScriptedHttp::new());
        http.on(IPIFY, Reply::text("<html>blocked</html>", 80))
            .on(AMAZON, Reply::text("185.220.101.4\n", 640))
            .on(
                "http://ip-api.com/json/185.220.101.4",
                Reply::text(r#"{"countryCode":"de","city":"Frankfurt"}"#, 30),
            );

        let id = resolver(http.clone()).resolve(9050).await.unwrap();
        assert_eq!(id.ip, Ipv4Addr::new(185, 220, 101, 4));
        assert_eq!(id.latency_ms, 640);
        assert_eq!(id.country.unwrap().as_str(), "DE");
        assert_eq!(id.city, "Frankfurt");

        let calls = http.calls();
        assert_eq!(calls[0].1, Route::Socks(9050));
        assert_eq!(calls[2].1, Route::Direct);
    }

    #[tokio::test]
    async fn test_no_ip_skips_geolocation() {
        let http = Arc::new(ScriptedHttp::new());
        http.on(IPIFY, Reply::Timeout).on(AMAZON, Reply::Fail);

        assert!(resolver(http.clone()).resolve(9050).await.is_none());
        assert!(!http.called_prefix("http://ip-api.com"));
        assert!(!http.called_prefix("http://ipwho.is"));
        assert_eq!(http.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_geolocation_cascade_rejects_bad_country() {
        let http = Arc::new(ScriptedHttp::new());
        http.on(IPIFY, Reply::text("198.51.100.7", 200))
            .on(
                "http://ip-api.com/json/198.51.100.7",
                Reply::text(r#"{"countryCode":"Germany"}"#, 10),
            )
            .on(
                "http://ipwho.is/198.51.100.7",
                Reply::text(r#"{"country_code":"FR"}"#, 10),
            );

        let id = resolver(http).resolve(9050).await.unwrap();
        assert_eq!(id.country.unwrap().as_str(), "FR");
        assert_eq!(id.city, UNKNOWN_CITY);
    }

    #[tokio::test]
    async fn test_geolocation_exhausted_is_unknown_not_failure() {
        let http = Arc::new(ScriptedHttp::new());
        http.on(IPIFY, Reply::text("198.51.100.7", 200))
            .on("http://ip-api.com/json/198.51.100.7", Reply::status(429, 5));

        let id = resolver(http).resolve(9050).await.unwrap();
        assert_eq!(id.ip, Ipv4Addr::new(198, 51, 100, 7));
        assert!(id.country.is_none());
        assert_eq!(id.country_label(), "Unknown");
        assert_eq!(id.city, UNKNOWN_CITY);
    }
}
