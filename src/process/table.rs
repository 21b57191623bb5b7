//! Process-table lookup keyed by torrc path

use std::path::Path;
use tracing::debug;

/// True when an argv contains `-f <config_path>` exactly.
///
/// Exact matching keeps `tor1/torrc.conf` from matching `tor10/torrc.conf`.
pub fn cmdline_matches<S: AsRef<str>>(args: &[S], config_path: &Path) -> bool {
    let Some(wanted) = config_path.to_str() else {
        return false;
    };
    args.windows(2)
        .any(|w| w[0].as_ref() == "-f" && w[1].as_ref() == wanted)
}

/// PIDs of every process launched with this torrc
#[cfg(target_os = "linux")]
pub async fn find_pids(config_path: &Path) -> Vec<u32> {
    let mut pids = Vec::new();
    let mut entries = match tokio::fs::read_dir("/proc").await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot read /proc: {}", e);
            return pids;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes may exit between listing and reading
        let Ok(raw) = tokio::fs::read(entry.path().join("cmdline")).await else {
            continue;
        };
        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|a| !a.is_empty())
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        if cmdline_matches(&args, config_path) {
            pids.push(pid);
        }
    }
    pids
}

/// PIDs of every process launched with this torrc
#[cfg(not(target_os = "linux"))]
pub async fn find_pids(config_path: &Path) -> Vec<u32> {
    let pattern = format!("-f {}", config_path.display());
    let output = match tokio::process::Command::new("pgrep")
        .arg("-f")
        .arg(&pattern)
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            debug!("pgrep failed: {}", e);
            return Vec::new();
        }
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_matches_exact_path() {
        let path = Path::new("/root/tor/tor1/torrc.conf");
        assert!(cmdline_matches(&["tor", "-f", "/root/tor/tor1/torrc.conf"], path));
        assert!(!cmdline_matches(&["tor", "-f", "/root/tor/tor10/torrc.conf"], path));
        assert!(!cmdline_matches(&["tor", "/root/tor/tor1/torrc.conf"], path));
        assert!(!cmdline_matches::<&str>(&[], path));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_find_pids_unknown_path_is_empty() {
        let pids = find_pids(Path::new("/nonexistent/torfleet/torrc.conf")).await;
        assert!(pids.is_empty());
    }
}
