//! Egress probes
//!
//! Every probe talks HTTP through the [`HttpClient`] trait so the cascades can
//! be driven by a scripted client in tests. [`ReqwestClient`] is the real one:
//! it routes through an instance's SOCKS listener or goes direct.

mod identity;
mod throughput;

pub use identity::{GeoService, Identity, IdentityResolver, IpService};
pub use throughput::{
    download_mbps, estimate_from_latency, DownloadTarget, ThroughputProbe, ESTIMATE_FLOOR_MBPS,
    MIN_TRANSFER_BYTES,
};

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// How a request leaves the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Straight out, not through Tor
    Direct,
    /// Through the SOCKS5 listener on 127.0.0.1:<port>
    Socks(u16),
}

/// A fully-read HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
    /// Wall-clock time from sending the request to the end of the body
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET `url`, reading the whole body, bounded by `timeout`
    async fn get(&self, url: &str, route: Route, timeout: Duration) -> Result<HttpResponse>;
}

/// reqwest-backed client
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient;

impl ReqwestClient {
    pub fn new() -> Self {
        ReqwestClient
    }

    // A fresh client per call: the SOCKS listener behind a route is restarted
    // between attempts, so pooled connections would point at a dead circuit.
    fn build(route: Route, timeout: Duration) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .user_agent(concat!("torfleet/", env!("CARGO_PKG_VERSION")));

        if let Route::Socks(port) = route {
            let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{}", port))
                .map_err(|e| Error::http(e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        builder.build().map_err(|e| Error::http(e.to_string()))
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, route: Route, timeout: Duration) -> Result<HttpResponse> {
        let client = Self::build(route, timeout)?;

        let start = Instant::now();
        let fetch = async {
            let resp = client.get(url).send().await?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await?;
            Ok::<_, Error>((status, body))
        };
        // reqwest's own timeout covers the body too; this is the outer bound
        let (status, body) = tokio::time::timeout(timeout, fetch).await??;

        Ok(HttpResponse {
            status,
            body,
            elapsed: start.elapsed(),
        })
    }
}

/// Round to `places` decimal places
pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
