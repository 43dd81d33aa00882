//! Locating the running instance from a short-lived CLI process.
//!
//! Order matters: the lock is checked first so a registration left behind
//! by a crashed process is never trusted on its own.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::supervisor::{self, SupervisorError};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no devagent instance is running (start one with `devagent serve`)")]
    NoInstance,

    #[error(
        "devagent instance is registered but not reachable: {reason}\n\
         if no instance is running, remove the leftover record with `devagent cleanup`"
    )]
    StaleRegistration { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance {
    pub addr: SocketAddr,
}

impl Instance {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Find the live instance registered under `state_dir`.
pub async fn discover(
    state_dir: &Path,
    config: &DiscoveryConfig,
) -> Result<Instance, DiscoveryError> {
    match supervisor::acquire_lock(state_dir) {
        Ok(lock) => {
            // nobody holds it; give it back without touching the registration
            drop(lock);
            return Err(DiscoveryError::NoInstance);
        }
        Err(SupervisorError::AlreadyRunning(_)) => {}
        Err(e) => return Err(DiscoveryError::Other(e.into())),
    }

    let addr = supervisor::read_registration(state_dir).map_err(|e| {
        DiscoveryError::StaleRegistration {
            reason: e.to_string(),
        }
    })?;

    probe(addr, config.probe_timeout).await?;
    debug!(%addr, "discovered instance");
    Ok(Instance { addr })
}

async fn probe(addr: SocketAddr, timeout: Duration) -> Result<(), DiscoveryError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DiscoveryError::Other(e.into()))?;
    let url = format!("http://{addr}/api/health");
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => Ok(()),
        Ok(resp) => Err(DiscoveryError::StaleRegistration {
            reason: format!("health probe at {addr} returned {}", resp.status()),
        }),
        Err(e) => Err(DiscoveryError::StaleRegistration {
            reason: format!("health probe at {addr} failed: {e}"),
        }),
    }
}
