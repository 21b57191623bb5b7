//! Cross-fleet ranking of best attempts

use crate::common::CountryCode;
use crate::endpoint::{AttemptResult, Endpoint};
use chrono::{DateTime, Local};
use std::cmp::Ordering;
use std::fmt;

/// Coarse speed label shown next to ranked endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpeedTier {
    Slow,
    Good,
    Fast,
    HighSpeed,
}

impl SpeedTier {
    pub fn from_mbps(mbps: f64) -> Self {
        if mbps >= 5.0 {
            SpeedTier::HighSpeed
        } else if mbps >= 2.0 {
            SpeedTier::Fast
        } else if mbps >= 0.5 {
            SpeedTier::Good
        } else {
            SpeedTier::Slow
        }
    }

    pub fn label(&self) -> Option<&'static str> {
        match self {
            SpeedTier::HighSpeed => Some("HIGH-SPEED"),
            SpeedTier::Fast => Some("FAST"),
            SpeedTier::Good => Some("GOOD"),
            SpeedTier::Slow => None,
        }
    }
}

/// One endpoint with its best attempt of the run
#[derive(Debug, Clone)]
pub struct RankedEntry {
    pub name: String,
    pub country: CountryCode,
    pub port: u16,
    pub best: AttemptResult,
}

impl RankedEntry {
    pub fn new(endpoint: &Endpoint, best: AttemptResult) -> Self {
        RankedEntry {
            name: endpoint.name.clone(),
            country: endpoint.country,
            port: endpoint.port,
            best,
        }
    }

    pub fn throughput(&self) -> f64 {
        self.best.throughput_mbps
    }

    pub fn tier(&self) -> SpeedTier {
        SpeedTier::from_mbps(self.throughput())
    }
}

/// Descending throughput, then ascending latency
pub fn rank_order(a: &RankedEntry, b: &RankedEntry) -> Ordering {
    b.best
        .throughput_mbps
        .total_cmp(&a.best.throughput_mbps)
        .then_with(|| a.best.latency_key().cmp(&b.best.latency_key()))
}

/// Ranked results of one run; rebuilt every time, never persisted
#[derive(Debug, Clone)]
pub struct FleetRanking {
    pub started_at: DateTime<Local>,
    pub entries: Vec<RankedEntry>,
    /// Endpoints with no usable result, in registry order
    pub excluded: Vec<String>,
}

impl FleetRanking {
    pub fn new(started_at: DateTime<Local>, mut entries: Vec<RankedEntry>, excluded: Vec<String>) -> Self {
        entries.sort_by(rank_order);
        FleetRanking {
            started_at,
            entries,
            excluded,
        }
    }

    pub fn best(&self) -> Option<&RankedEntry> {
        self.entries.first()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Display for FleetRanking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(70);
        writeln!(f, "{}", rule)?;
        writeln!(
            f,
            "FASTEST IPs (sorted by speed) - {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(f, "{}", rule)?;

        for (i, entry) in self.entries.iter().enumerate() {
            let tier = entry
                .tier()
                .label()
                .map(|l| format!(" ({})", l))
                .unwrap_or_default();
            let best = &entry.best;
            writeln!(f, "{}. {} ({}){}:", i + 1, entry.name, entry.country, tier)?;
            writeln!(
                f,
                "   IP: {} | City: {}",
                best.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".into()),
                best.city.as_deref().unwrap_or("Unknown")
            )?;
            writeln!(
                f,
                "   Speed: {} Mbps | Ping: {}ms",
                best.throughput_mbps,
                best.latency_ms.map(|l| l.to_string()).unwrap_or_else(|| "-".into())
            )?;
            writeln!(f, "   Proxy: socks5://127.0.0.1:{}", entry.port)?;
            writeln!(f)?;
        }

        match self.best() {
            Some(best) => writeln!(f, "[+] BEST: {} - {} Mbps", best.name, best.throughput())?,
            None => writeln!(f, "[!] No endpoint produced a usable result")?,
        }
        for name in &self.excluded {
            writeln!(f, "[✗] No successful connection for {}", name)?;
        }
        Ok(())
    }
}
