//! torrc generation for one endpoint

use super::bridge::{BridgeSet, TransportPaths};
use crate::endpoint::Endpoint;
use crate::{Error, Result};
use rand::Rng;
use std::fmt::Write as _;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// `NewCircuitPeriod` is redrawn from this range on every build
pub const CIRCUIT_PERIOD_RANGE: RangeInclusive<u32> = 15..=45;

pub const MAX_CIRCUIT_DIRTINESS: u32 = 300;

/// Doubled when bridges are in use
pub const CIRCUIT_BUILD_TIMEOUT: u32 = 60;

pub const NUM_ENTRY_GUARDS: u32 = 3;

/// Renders and writes torrc files
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    transports: TransportPaths,
}

impl ConfigBuilder {
    pub fn new(transports: TransportPaths) -> Self {
        ConfigBuilder { transports }
    }

    /// Render the torrc text with a caller-supplied RNG
    pub fn render<R: Rng + ?Sized>(
        &self,
        endpoint: &Endpoint,
        bridges: Option<&BridgeSet>,
        rng: &mut R,
    ) -> String {
        let circuit_period = rng.gen_range(CIRCUIT_PERIOD_RANGE);
        let bridges = bridges.filter(|b| !b.is_empty());

        let mut out = String::with_capacity(512);
        // Writing to a String cannot fail
        let _ = writeln!(out, "SocksPort {}", endpoint.port);
        let _ = writeln!(out, "DataDirectory {}", endpoint.data_dir.display());

        if let Some(set) = bridges {
            out.push_str("UseBridges 1\n");
            if let Some(plugin) = self.transports.plugin_directive(set.bridge_type) {
                let _ = writeln!(out, "ClientTransportPlugin {}", plugin);
            }
            for line in &set.lines {
                let _ = writeln!(out, "{}", line);
            }
        }

        let build_timeout = if bridges.is_some() {
            CIRCUIT_BUILD_TIMEOUT * 2
        } else {
            CIRCUIT_BUILD_TIMEOUT
        };

        let _ = writeln!(out, "ExitNodes {{{}}}", endpoint.country);
        out.push_str("StrictNodes 1\n");
        let _ = writeln!(out, "NewCircuitPeriod {}", circuit_period);
        let _ = writeln!(out, "MaxCircuitDirtiness {}", MAX_CIRCUIT_DIRTINESS);
        let _ = writeln!(out, "CircuitBuildTimeout {}", build_timeout);
        out.push_str("LearnCircuitBuildTimeout 0\n");
        let _ = writeln!(out, "NumEntryGuards {}", NUM_ENTRY_GUARDS);
        out.push_str("UseEntryGuards 1\n");
        out
    }

    /// Render with the thread RNG
    pub fn build(&self, endpoint: &Endpoint, bridges: Option<&BridgeSet>) -> String {
        self.render(endpoint, bridges, &mut rand::thread_rng())
    }

    /// Build and write the torrc, creating the data directory first.
    ///
    /// Any I/O failure is reported as [`Error::ConfigWrite`].
    pub async fn write(&self, endpoint: &Endpoint, bridges: Option<&BridgeSet>) -> Result<PathBuf> {
        let text = self.build(endpoint, bridges);
        let path = endpoint.config_path();

        fs::create_dir_all(&endpoint.data_dir)
            .await
            .map_err(|e| Error::config_write(&endpoint.data_dir, e))?;
        fs::write(&path, text)
            .await
            .map_err(|e| Error::config_write(&path, e))?;

        debug!("Wrote torrc for {} to {}", endpoint.name, path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CountryCode;
    use crate::config::bridge::{BridgeType, MixedBridgePolicy};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::path::Path;

    fn endpoint(dir: &Path) -> Endpoint {
        Endpoint::new("tor1", CountryCode::parse("US").unwrap(), 9050, dir)
    }

    fn bridges(text: &str) -> BridgeSet {
        BridgeSet::parse(text, MixedBridgePolicy::FirstSeen)
            .unwrap()
            .unwrap()
    }

    fn count(text: &str, prefix: &str) -> usize {
        text.lines().filter(|l| l.starts_with(prefix)).count()
    }

    #[test]
    fn test_render_without_bridges() {
        let ep = endpoint(Path::new("/root/tor"));
        let text = ConfigBuilder::default().render(&ep, None, &mut StdRng::seed_from_u64(7));

        assert!(text.starts_with("SocksPort 9050\nDataDirectory /root/tor/tor1\n"));
        assert_eq!(count(&text, "ExitNodes "), 1);
        assert!(text.contains("ExitNodes {US}\nStrictNodes 1\n"));
        assert!(text.contains("CircuitBuildTimeout 60\n"));
        assert!(text.contains("NumEntryGuards 3\n"));
        assert!(text.contains("MaxCircuitDirtiness 300\n"));
        assert!(text.contains("LearnCircuitBuildTimeout 0\n"));
        assert_eq!(count(&text, "UseBridges"), 0);
        assert_eq!(count(&text, "ClientTransportPlugin"), 0);
    }

    #[test]
    fn test_render_with_known_bridges() {
        let ep = endpoint(Path::new("/root/tor"));
        let set = bridges("obfs4 192.95.36.142:443 CDF2E852BF539B82BD549E1A2AC8D80FE2162864\nobfs4 192.0.2.1:443 AAAA");
        let text = ConfigBuilder::default().render(&ep, Some(&set), &mut StdRng::seed_from_u64(7));

        assert!(text.contains("UseBridges 1\n"));
        assert_eq!(count(&text, "ClientTransportPlugin "), 1);
        assert!(text.contains("ClientTransportPlugin obfs4 exec /usr/bin/obfs4proxy\n"));
        assert_eq!(count(&text, "Bridge obfs4 "), 2);
        assert!(text.contains("CircuitBuildTimeout 120\n"));
        assert_eq!(count(&text, "ExitNodes "), 1);
    }

    #[test]
    fn test_plugin_directive_only_for_known_transports() {
        let ep = endpoint(Path::new("/root/tor"));
        let cases = [
            (
                "obfs4 192.0.2.1:443 AAAA cert=x iat-mode=0",
                BridgeType::Obfs4,
                Some("obfs4 exec /usr/bin/obfs4proxy"),
            ),
            (
                "snowflake 192.0.2.3:80 2B280B23E1107BB62ABFC40DDCC8824814F80A72 url=https://snowflake-broker.torproject.net/",
                BridgeType::Snowflake,
                Some("snowflake exec /usr/bin/snowflake-client"),
            ),
            (
                "meek_lite 192.0.2.18:80 BE776A53492E1E044A26F17306E1BC46A55A1625 url=https://meek.azureedge.net/",
                BridgeType::MeekAzure,
                Some("meek_lite exec /usr/bin/meek-client"),
            ),
            (
                "webtunnel [2001:db8::1]:443 AAAA url=https://example.org/secret-path",
                BridgeType::Webtunnel,
                Some("webtunnel exec /usr/bin/webtunnel-client"),
            ),
            ("192.0.2.9:9001 0123456789ABCDEF", BridgeType::Unknown, None),
        ];

        for (line, bridge_type, directive) in cases {
            let set = bridges(line);
            assert_eq!(set.bridge_type, bridge_type, "{}", line);
            let text =
                ConfigBuilder::default().render(&ep, Some(&set), &mut StdRng::seed_from_u64(3));

            assert!(text.contains("UseBridges 1\n"), "{}", line);
            assert_eq!(
                count(&text, "ClientTransportPlugin "),
                directive.is_some() as usize,
                "{}",
                line
            );
            if let Some(directive) = directive {
                assert!(
                    text.contains(&format!("ClientTransportPlugin {}\n", directive)),
                    "{}",
                    text
                );
            }
        }
    }

    #[test]
    fn test_render_unknown_bridges_has_no_plugin() {
        let ep = endpoint(Path::new("/root/tor"));
        let set = bridges("192.0.2.9:9001 0123456789ABCDEF");
        assert_eq!(set.bridge_type, BridgeType::Unknown);
        let text = ConfigBuilder::default().render(&ep, Some(&set), &mut StdRng::seed_from_u64(1));

        assert!(text.contains("UseBridges 1\n"));
        assert_eq!(count(&text, "ClientTransportPlugin"), 0);
        assert!(text.contains("Bridge 192.0.2.9:9001"));
    }

    #[test]
    fn test_circuit_period_in_range() {
        let ep = endpoint(Path::new("/root/tor"));
        let builder = ConfigBuilder::default();
        for _ in 0..200 {
            let text = builder.build(&ep, None);
            let period: u32 = text
                .lines()
                .find_map(|l| l.strip_prefix("NewCircuitPeriod "))
                .unwrap()
                .parse()
                .unwrap();
            assert!(CIRCUIT_PERIOD_RANGE.contains(&period));
        }
    }

    #[tokio::test]
    async fn test_write_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(&dir.path().join("nested"));

        let path = ConfigBuilder::default().write(&ep, None).await.unwrap();
        assert_eq!(path, ep.config_path());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("SocksPort 9050"));
    }

    #[tokio::test]
    async fn test_write_failure_is_config_write_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the base directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let ep = endpoint(&blocker);

        let err = ConfigBuilder::default().write(&ep, None).await.unwrap_err();
        assert!(matches!(err, Error::ConfigWrite { .. }));
    }
}
