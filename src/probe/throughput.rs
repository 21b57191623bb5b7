//! Bandwidth measurement through an instance

use super::{round_to, HttpClient, Route};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A download must move more than this many bytes to count
pub const MIN_TRANSFER_BYTES: usize = 1000;

/// Lowest estimate the latency fallback will report
pub const ESTIMATE_FLOOR_MBPS: f64 = 0.1;

/// Download used for a bandwidth sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DownloadTarget {
    pub url: String,
    /// Size the target is expected to serve; informational only
    pub expected_bytes: u64,
}

impl DownloadTarget {
    pub fn new(url: &str, expected_bytes: u64) -> Self {
        DownloadTarget {
            url: url.to_string(),
            expected_bytes,
        }
    }
}

/// Mbps from the bytes actually received, rounded to two decimals
pub fn download_mbps(bytes: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    round_to((bytes as f64 * 8.0) / (secs * 1_000_000.0), 2)
}

/// Rough Mbps guess from an average round trip: 10 Mbps per 100 ms inverse,
/// floored at [`ESTIMATE_FLOOR_MBPS`], one decimal.
pub fn estimate_from_latency(avg_ms: f64) -> f64 {
    if !avg_ms.is_finite() || avg_ms <= 0.0 {
        return ESTIMATE_FLOOR_MBPS;
    }
    round_to((1000.0 / avg_ms).max(ESTIMATE_FLOOR_MBPS), 1)
}

/// Download cascade with a latency-based fallback
pub struct ThroughputProbe {
    http: Arc<dyn HttpClient>,
    targets: Vec<DownloadTarget>,
    download_timeout: Duration,
    status_url: String,
    status_checks: u32,
    status_timeout: Duration,
}

impl ThroughputProbe {
    pub fn new(
        http: Arc<dyn HttpClient>,
        targets: Vec<DownloadTarget>,
        download_timeout: Duration,
        status_url: String,
        status_checks: u32,
        status_timeout: Duration,
    ) -> Self {
        ThroughputProbe {
            http,
            targets,
            download_timeout,
            status_url,
            status_checks,
            status_timeout,
        }
    }

    /// Measure throughput through a SOCKS port. `0.0` means no signal at all.
    pub async fn measure(&self, port: u16) -> f64 {
        if let Some(mbps) = self.measure_download(port).await {
            return mbps;
        }
        if let Some(mbps) = self.estimate_from_status(port).await {
            return mbps;
        }
        info!("Speed test failed on port {}", port);
        0.0
    }

    /// First target that transfers enough bytes wins; no averaging
    pub async fn measure_download(&self, port: u16) -> Option<f64> {
        for target in &self.targets {
            debug!(
                "Testing speed with {}KB download from {}",
                target.expected_bytes / 1000,
                target.url
            );
            let resp = match self
                .http
                .get(&target.url, Route::Socks(port), self.download_timeout)
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    debug!("Download {} failed: {}", target.url, e);
                    continue;
                }
            };

            let size = resp.body.len();
            if !resp.is_success() || size <= MIN_TRANSFER_BYTES || resp.elapsed.is_zero() {
                debug!(
                    "Download {} unusable: status {}, {} bytes",
                    target.url, resp.status, size
                );
                continue;
            }

            let mbps = download_mbps(size, resp.elapsed);
            info!(
                "Downloaded {} bytes in {:.2}s = {:.2} Mbps",
                size,
                resp.elapsed.as_secs_f64(),
                mbps
            );
            return Some(mbps);
        }
        None
    }

    /// Average the successful status-check round trips into an estimate
    pub async fn estimate_from_status(&self, port: u16) -> Option<f64> {
        let mut samples = Vec::with_capacity(self.status_checks as usize);
        for _ in 0..self.status_checks {
            match self
                .http
                .get(&self.status_url, Route::Socks(port), self.status_timeout)
                .await
            {
                Ok(resp) if resp.is_success() => samples.push(resp.elapsed.as_secs_f64() * 1000.0),
                Ok(resp) => debug!("Status check returned {}", resp.status),
                Err(e) => debug!("Status check failed: {}", e),
            }
        }

        if samples.is_empty() {
            return None;
        }
        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        let estimate = estimate_from_latency(avg);
        info!("Fallback: avg ping {:.0}ms ≈ {:.1} Mbps estimate", avg, estimate);
        Some(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::{Reply, ScriptedHttp};

    const BYTES_50K: &str = "http://httpbin.org/bytes/50000";
    const BYTES_25K: &str = "http://httpbin.org/bytes/25000";
    const OTENET: &str = "http://speedtest.ftp.otenet.gr/files/test100k.db";
    const STATUS: &str = "http://httpbin.org/status/200";

    fn probe(http: Arc<ScriptedHttp>) -> ThroughputProbe {
        ThroughputProbe::new(
            http,
            vec![
                DownloadTarget::new(BYTES_50K, 50_000),
                DownloadTarget::new(BYTES_25K, 25_000),
                DownloadTarget::new(OTENET, 100_000),
            ],
            Duration::from_secs(12),
            STATUS.to_string(),
            3,
            Duration::from_secs(8),
        )
    }

    #[test]
    fn test_download_mbps() {
        assert_eq!(download_mbps(100_000, Duration::from_millis(500)), 1.6);
        assert_eq!(download_mbps(50_000, Duration::from_secs(3)), 0.13);
        assert_eq!(download_mbps(50_000, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_estimate_from_latency_floor() {
        assert_eq!(estimate_from_latency(110.0), 9.1);
        assert_eq!(estimate_from_latency(100.0), 10.0);
        assert_eq!(estimate_from_latency(50_000.0), ESTIMATE_FLOOR_MBPS);
        assert_eq!(estimate_from_latency(0.0), ESTIMATE_FLOOR_MBPS);
    }

    #[tokio::test]
    async fn test_third_download_wins_without_fallback() {
        let http = Arc::new(ScriptedHttp::new());
        http.on(BYTES_50K, Reply::Timeout)
            .on(BYTES_25K, Reply::Timeout)
            .on(OTENET, Reply::bytes(100_000, Duration::from_millis(500)));

        let mbps = probe(http.clone()).measure(9050).await;
        assert_eq!(mbps, 1.60);
        assert!(!http.called(STATUS));
    }

    #[tokio::test]
    async fn test_actual_bytes_used_and_tiny_body_rejected() {
        let http = Arc::new(ScriptedHttp::new());
        http.on(BYTES_50K, Reply::bytes(900, Duration::from_millis(100)))
            .on(BYTES_25K, Reply::bytes(25_000, Duration::from_secs(1)));

        // 25 000 * 8 / 1e6
        assert_eq!(probe(http).measure(9050).await, 0.2);
    }

    #[tokio::test]
    async fn test_fallback_averages_status_checks() {
        let http = Arc::new(ScriptedHttp::new());
        http.on(STATUS, Reply::status(200, 100))
            .on(STATUS, Reply::status(200, 120))
            .on(STATUS, Reply::status(200, 110));

        let mbps = probe(http).measure(9050).await;
        assert_eq!(mbps, estimate_from_latency(110.0));
        assert!(mbps > 0.0);
        assert!(mbps >= ESTIMATE_FLOOR_MBPS);
    }

    #[tokio::test]
    async fn test_fallback_skips_failed_checks() {
        let http = Arc::new(ScriptedHttp::new());
        http.on(STATUS, Reply::Timeout)
            .on(STATUS, Reply::status(200, 200))
            .on(STATUS, Reply::status(503, 10));

        assert_eq!(probe(http).measure(9050).await, 5.0);
    }

    #[tokio::test]
    async fn test_everything_failing_is_zero() {
        let http = Arc::new(ScriptedHttp::new());
        assert_eq!(probe(http.clone()).measure(9050).await, 0.0);
        // 3 downloads + 3 status checks
        assert_eq!(http.calls().len(), 6);
    }
}
