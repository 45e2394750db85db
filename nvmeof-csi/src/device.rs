//! Block device discovery by glob pattern.
//!
//! NVMe namespaces show up under `/dev/disk/by-id/` some time after the
//! kernel finishes the fabric handshake, and go away asynchronously after a
//! disconnect. The locator polls for either condition within a budget.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Directory holding persistent device links.
pub const DEFAULT_DEVICE_DIR: &str = "/dev/disk/by-id";

/// Default polling granularity.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("invalid device pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("timed out after {waited:?} waiting for device matching '{pattern}'")]
    NotFound { pattern: String, waited: Duration },

    #[error("timed out after {waited:?} waiting for device matching '{pattern}' to go away")]
    StillPresent { pattern: String, waited: Duration },

    #[error("device scan did not complete: {0}")]
    Scan(#[from] tokio::task::JoinError),
}

/// Polls a device directory for paths matching a glob.
#[derive(Debug, Clone)]
pub struct DeviceLocator {
    device_dir: PathBuf,
    poll_interval: Duration,
}

impl Default for DeviceLocator {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_DIR, DEFAULT_POLL_INTERVAL)
    }
}

impl DeviceLocator {
    pub fn new(device_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            device_dir: device_dir.into(),
            // A zero interval would spin.
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Glob for the by-id links of the namespace carrying `uuid`.
    ///
    /// The kernel publishes two links per namespace (`nvme-uuid.<uuid>` and
    /// a vendor alias); any of them is fine.
    pub fn uuid_pattern(&self, uuid: &str) -> String {
        format!("{}/nvme-uuid.*{}*", self.device_dir.display(), uuid)
    }

    /// Current matches for `pattern`, sorted.
    ///
    /// Globbing reads directories synchronously, so it runs on the blocking pool.
    pub async fn find(&self, pattern: &str) -> Result<Vec<PathBuf>, DeviceError> {
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || glob_matches(&pattern)).await?
    }

    /// Wait until at least one path matches, returning the first.
    pub async fn wait_for_presence(
        &self,
        pattern: &str,
        budget: Duration,
    ) -> Result<PathBuf, DeviceError> {
        let deadline = Instant::now() + budget;
        loop {
            if let Some(path) = self.find(pattern).await?.into_iter().next() {
                info!(device = %path.display(), pattern = %pattern, "Device is present");
                return Ok(path);
            }
            if !self.pause_until(deadline).await {
                warn!(pattern = %pattern, budget = ?budget, "Device did not appear");
                return Err(DeviceError::NotFound {
                    pattern: pattern.to_string(),
                    waited: budget,
                });
            }
        }
    }

    /// Wait until nothing matches.
    pub async fn wait_for_absence(&self, pattern: &str, budget: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + budget;
        loop {
            let matches = self.find(pattern).await?;
            if matches.is_empty() {
                info!(pattern = %pattern, "Device is gone");
                return Ok(());
            }
            debug!(pattern = %pattern, matches = ?matches, "Device still present");
            if !self.pause_until(deadline).await {
                warn!(pattern = %pattern, budget = ?budget, "Device did not go away");
                return Err(DeviceError::StillPresent {
                    pattern: pattern.to_string(),
                    waited: budget,
                });
            }
        }
    }

    /// Sleep one poll interval, clipped to the deadline. Returns false once
    /// the deadline has already passed.
    async fn pause_until(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(self.poll_interval.min(deadline - now)).await;
        true
    }
}

fn glob_matches(pattern: &str) -> Result<Vec<PathBuf>, DeviceError> {
    let paths = glob::glob(pattern).map_err(|source| DeviceError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;

    let mut matches = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => matches.push(path),
            Err(e) => debug!(error = %e, "Skipping unreadable device entry"),
        }
    }
    Ok(matches)
}
