//! Node plugin configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use thiserror::Error;

use crate::device::{DEFAULT_DEVICE_DIR, DEFAULT_POLL_INTERVAL, DeviceLocator};
use crate::initiator::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_CTRL_LOSS_TMO, DEFAULT_DEVICE_TIMEOUT, InitiatorSettings,
};
use crate::mount::{DEFAULT_MOUNT_TABLE, DEFAULT_MOUNT_TIMEOUT};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EndpointError {
    #[error("unsupported endpoint '{0}': expected unix://<path>")]
    Unsupported(String),

    #[error("endpoint '{0}' has an empty socket path")]
    EmptyPath(String),
}

/// Tunables for the node lifecycle engine.
#[derive(Args, Debug, Clone)]
pub struct NodeConfig {
    /// Fabric client binary
    #[arg(long, env = "NVME_CLI", default_value = "nvme")]
    pub nvme_cli: String,

    /// Deadline for nvme connect-all / disconnect, in seconds
    #[arg(long, default_value_t = DEFAULT_COMMAND_TIMEOUT.as_secs())]
    pub command_timeout_secs: u64,

    /// Deadline for mount / umount, in seconds
    #[arg(long, default_value_t = DEFAULT_MOUNT_TIMEOUT.as_secs())]
    pub mount_timeout_secs: u64,

    /// How long to wait for a device to appear or go away, in seconds
    #[arg(long, default_value_t = DEFAULT_DEVICE_TIMEOUT.as_secs())]
    pub device_timeout_secs: u64,

    /// Device polling interval, in milliseconds
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    pub device_poll_interval_ms: u64,

    /// Controller loss timeout passed to connect-all, in seconds
    #[arg(long, default_value_t = DEFAULT_CTRL_LOSS_TMO)]
    pub ctrl_loss_tmo_secs: u32,

    /// Directory holding the by-id device links
    #[arg(long, default_value = DEFAULT_DEVICE_DIR)]
    pub device_dir: PathBuf,

    /// Mount table used to detect mount points
    #[arg(long, default_value = DEFAULT_MOUNT_TABLE)]
    pub mount_table: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nvme_cli: "nvme".to_string(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            mount_timeout_secs: DEFAULT_MOUNT_TIMEOUT.as_secs(),
            device_timeout_secs: DEFAULT_DEVICE_TIMEOUT.as_secs(),
            device_poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            ctrl_loss_tmo_secs: DEFAULT_CTRL_LOSS_TMO,
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
            mount_table: PathBuf::from(DEFAULT_MOUNT_TABLE),
        }
    }
}

impl NodeConfig {
    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn device_locator(&self) -> DeviceLocator {
        DeviceLocator::new(
            self.device_dir.clone(),
            Duration::from_millis(self.device_poll_interval_ms),
        )
    }

    pub fn initiator_settings(&self) -> InitiatorSettings {
        InitiatorSettings {
            nvme_cli: self.nvme_cli.clone(),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            device_timeout: Duration::from_secs(self.device_timeout_secs),
            ctrl_loss_tmo: self.ctrl_loss_tmo_secs,
        }
    }
}

/// Socket path of a `unix://` CSI endpoint.
///
/// Both `unix:///run/csi.sock` and `unix://run/csi.sock` name `/run/csi.sock`.
pub fn parse_endpoint(endpoint: &str) -> Result<PathBuf, EndpointError> {
    let rest = endpoint
        .strip_prefix("unix://")
        .ok_or_else(|| EndpointError::Unsupported(endpoint.to_string()))?;
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return Err(EndpointError::EmptyPath(endpoint.to_string()));
    }
    Ok(PathBuf::from("/").join(rest))
}
