//! Tor daemon controller
//!
//! Launches `tor -f <torrc>` detached from the manager and finds it again
//! through the process table, so instances survive a manager restart and can
//! still be stopped afterwards.

use super::table::find_pids;
use super::{poll_until, ProcessController};
use crate::endpoint::Endpoint;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Controller for real tor processes
#[derive(Debug, Clone)]
pub struct TorController {
    executable: PathBuf,
    settle: Duration,
    poll: Duration,
}

impl TorController {
    pub fn new(executable: PathBuf, settle: Duration, poll: Duration) -> Self {
        TorController {
            executable,
            settle,
            poll,
        }
    }

    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }

    #[cfg(unix)]
    fn signal(pid: u32, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
            // ESRCH: already gone
            debug!("kill({}, {:?}) failed: {}", pid, signal, e);
        }
    }

    async fn port_free(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).await.is_ok()
    }
}

#[async_trait]
impl ProcessController for TorController {
    async fn start(&self, endpoint: &Endpoint) -> Result<()> {
        let config_path = endpoint.config_path();
        if !tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            return Err(Error::process(format!(
                "torrc not found: {}",
                config_path.display()
            )));
        }

        let mut child = Command::new(&self.executable)
            .arg("-f")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| {
                Error::process(format!("failed to spawn {:?}: {}", self.executable, e))
            })?;

        info!(
            "Started tor for {} (pid {}) on port {}",
            endpoint.name,
            child.id().unwrap_or(0),
            endpoint.port
        );

        // Reap the child whenever it exits so it never lingers as a zombie
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }

    async fn stop(&self, endpoint: &Endpoint) -> Result<()> {
        let config_path = endpoint.config_path();
        let pids = find_pids(&config_path).await;

        #[cfg(unix)]
        for pid in &pids {
            Self::signal(*pid, nix::sys::signal::Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        if !pids.is_empty() {
            return Err(Error::process("stopping tor is only supported on unix"));
        }

        if !pids.is_empty() {
            info!("Stopping tor for {} (pids {:?})", endpoint.name, pids);
        }

        // Settle: gone from the table and the port is bindable again
        let port = endpoint.port;
        let released = poll_until(self.settle, self.poll, self.settle, || {
            let config_path = config_path.clone();
            async move { find_pids(&config_path).await.is_empty() && Self::port_free(port).await }
        })
        .await;

        if !released {
            let remaining = find_pids(&config_path).await;
            if remaining.is_empty() {
                warn!(
                    "Port {} still busy after stopping {}",
                    endpoint.port, endpoint.name
                );
            } else {
                warn!(
                    "tor for {} did not exit within {:?}, killing",
                    endpoint.name, self.settle
                );
                #[cfg(unix)]
                for pid in remaining {
                    Self::signal(pid, nix::sys::signal::Signal::SIGKILL);
                }
            }
        }
        Ok(())
    }

    async fn is_running(&self, endpoint: &Endpoint) -> bool {
        !find_pids(&endpoint.config_path()).await.is_empty()
    }
}
