//! Bridge lines and pluggable-transport detection

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

/// Pluggable transport inferred from a bridge line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeType {
    Obfs4,
    Snowflake,
    MeekAzure,
    Webtunnel,
    Unknown,
}

impl BridgeType {
    /// Detect the transport from a bridge line by keyword
    pub fn detect(line: &str) -> Self {
        let lower = line.to_ascii_lowercase();
        if lower.contains("obfs4") {
            BridgeType::Obfs4
        } else if lower.contains("snowflake") {
            BridgeType::Snowflake
        } else if lower.contains("meek-azure") || lower.contains("meek_lite") {
            BridgeType::MeekAzure
        } else if lower.contains("webtunnel") {
            BridgeType::Webtunnel
        } else {
            BridgeType::Unknown
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, BridgeType::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeType::Obfs4 => "obfs4",
            BridgeType::Snowflake => "snowflake",
            BridgeType::MeekAzure => "meek-azure",
            BridgeType::Webtunnel => "webtunnel",
            BridgeType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BridgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when one batch of bridge lines mixes transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MixedBridgePolicy {
    /// Keep every line; the first line's transport drives the plugin directive
    #[default]
    FirstSeen,
    /// Refuse the batch
    Reject,
}

/// Executables launched by `ClientTransportPlugin`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TransportPaths {
    pub obfs4: PathBuf,
    pub snowflake: PathBuf,
    pub meek: PathBuf,
    pub webtunnel: PathBuf,
}

impl Default for TransportPaths {
    fn default() -> Self {
        TransportPaths {
            obfs4: PathBuf::from("/usr/bin/obfs4proxy"),
            snowflake: PathBuf::from("/usr/bin/snowflake-client"),
            meek: PathBuf::from("/usr/bin/meek-client"),
            webtunnel: PathBuf::from("/usr/bin/webtunnel-client"),
        }
    }
}

impl TransportPaths {
    /// `ClientTransportPlugin` value for a transport, `None` for unknown bridges
    pub fn plugin_directive(&self, bridge_type: BridgeType) -> Option<String> {
        let (transport, exec) = match bridge_type {
            BridgeType::Obfs4 => ("obfs4", &self.obfs4),
            BridgeType::Snowflake => ("snowflake", &self.snowflake),
            BridgeType::MeekAzure => ("meek_lite", &self.meek),
            BridgeType::Webtunnel => ("webtunnel", &self.webtunnel),
            BridgeType::Unknown => return None,
        };
        Some(format!("{} exec {}", transport, exec.display()))
    }
}

/// Fleet-wide bridge configuration applied to every instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BridgeSet {
    pub lines: Vec<String>,
    pub bridge_type: BridgeType,
}

impl BridgeSet {
    /// Parse pasted bridge lines, one per line.
    ///
    /// Blank input yields `Ok(None)`, which clears bridges. Lines missing the
    /// `Bridge` keyword get it prepended.
    pub fn parse(input: &str, policy: MixedBridgePolicy) -> Result<Option<BridgeSet>> {
        let mut lines = Vec::new();
        let mut types: Vec<BridgeType> = Vec::new();

        for raw in input.lines() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let line = if raw.starts_with("Bridge") {
                raw.to_string()
            } else {
                format!("Bridge {}", raw)
            };
            let t = BridgeType::detect(&line);
            if !types.contains(&t) {
                types.push(t);
            }
            lines.push(line);
        }

        let Some(&first) = types.first() else {
            return Ok(None);
        };

        if types.len() > 1 {
            let names: Vec<&str> = types.iter().map(BridgeType::as_str).collect();
            match policy {
                MixedBridgePolicy::Reject => {
                    return Err(Error::validation(format!(
                        "mixed bridge types: {}",
                        names.join(", ")
                    )));
                }
                MixedBridgePolicy::FirstSeen => {
                    warn!(
                        "Mixed bridge types detected: {}; using {} transport",
                        names.join(", "),
                        first
                    );
                }
            }
        }

        Ok(Some(BridgeSet {
            lines,
            bridge_type: first,
        }))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OBFS4: &str =
        "obfs4 192.95.36.142:443 CDF2E852BF539B82BD549E1A2AC8D80FE2162864 cert=abc iat-mode=0";
    const SNOWFLAKE: &str = "Bridge snowflake 192.0.2.3:80 2B280B23E1107BB62ABFC40DDCC8824814F80A72";

    #[test]
    fn test_detect() {
        assert_eq!(BridgeType::detect(OBFS4), BridgeType::Obfs4);
        assert_eq!(BridgeType::detect(SNOWFLAKE), BridgeType::Snowflake);
        assert_eq!(BridgeType::detect("meek_lite 192.0.2.2:2 url=x"), BridgeType::MeekAzure);
        assert_eq!(BridgeType::detect("webtunnel [2001:db8::1]:443 url=y"), BridgeType::Webtunnel);
        assert_eq!(BridgeType::detect("192.0.2.9:9001"), BridgeType::Unknown);
    }

    #[test]
    fn test_parse_prefixes_bridge_keyword() {
        let set = BridgeSet::parse(&format!("{}\n\n  \n", OBFS4), MixedBridgePolicy::FirstSeen)
            .unwrap()
            .unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.lines[0].starts_with("Bridge obfs4 "));
        assert_eq!(set.bridge_type, BridgeType::Obfs4);
    }

    #[test]
    fn test_parse_blank_clears() {
        assert!(BridgeSet::parse("  \n\n", MixedBridgePolicy::FirstSeen)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_mixed_first_seen_keeps_all_lines() {
        let input = format!("{}\n{}\n", SNOWFLAKE, OBFS4);
        let set = BridgeSet::parse(&input, MixedBridgePolicy::FirstSeen)
            .unwrap()
            .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.bridge_type, BridgeType::Snowflake);
    }

    #[test]
    fn test_mixed_reject() {
        let input = format!("{}\n{}\n", SNOWFLAKE, OBFS4);
        assert!(matches!(
            BridgeSet::parse(&input, MixedBridgePolicy::Reject),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_plugin_directive_table() {
        let paths = TransportPaths::default();
        assert_eq!(
            paths.plugin_directive(BridgeType::Obfs4).unwrap(),
            "obfs4 exec /usr/bin/obfs4proxy"
        );
        assert_eq!(
            paths.plugin_directive(BridgeType::MeekAzure).unwrap(),
            "meek_lite exec /usr/bin/meek-client"
        );
        assert!(paths.plugin_directive(BridgeType::Unknown).is_none());
    }

    #[test]
    fn test_bridge_type_serde_names() {
        assert_eq!(
            serde_json::to_string(&BridgeType::MeekAzure).unwrap(),
            "\"meek-azure\""
        );
        assert_eq!(serde_json::to_string(&BridgeType::Obfs4).unwrap(), "\"obfs4\"");
    }
}
