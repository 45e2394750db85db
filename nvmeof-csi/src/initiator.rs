//! NVMe-oF initiator: attach and detach a single volume's namespace.
//!
//! The exit status of the fabric client is not a reliable signal of the real
//! fabric state (a duplicate connect fails, driver quirks produce errors for
//! no-ops). The device links under the locator's directory are the
//! authoritative signal, so both directions always finish by waiting on the
//! [`DeviceLocator`].
//!
//! Callers serialize calls for the same volume; every method is idempotent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::device::{DeviceError, DeviceLocator};
use crate::exec::{CommandRunner, ExecError, Outcome, argv};
use crate::metrics;
use crate::types::ConnectionParams;

/// Default outer deadline for `nvme connect-all` / `nvme disconnect`.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(40);
/// Default budget for the device to appear or disappear.
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(20);
/// Default controller loss timeout handed to the kernel, in seconds.
pub const DEFAULT_CTRL_LOSS_TMO: u32 = 1800;

#[derive(Error, Debug)]
pub enum InitiatorError {
    #[error("failed to run fabric client: {0}")]
    Exec(#[from] ExecError),

    #[error("connect to {nqn} failed: {source}")]
    Connect {
        nqn: String,
        #[source]
        source: DeviceError,
    },

    #[error("disconnect from {nqn} failed: {source}")]
    Disconnect {
        nqn: String,
        #[source]
        source: DeviceError,
    },
}

/// Attaches and detaches the fabric session of one volume.
#[tonic::async_trait]
pub trait Initiator: Send + Sync {
    /// Connect to the target and return the local block device path.
    async fn connect(&self) -> Result<PathBuf, InitiatorError>;

    /// Disconnect from the target and confirm the device is gone.
    async fn disconnect(&self) -> Result<(), InitiatorError>;
}

/// Builds an [`Initiator`] for a volume's connection parameters.
pub trait InitiatorFactory: Send + Sync {
    fn create(&self, params: &ConnectionParams) -> Box<dyn Initiator>;
}

/// Knobs for the nvme-cli backed initiator.
#[derive(Debug, Clone)]
pub struct InitiatorSettings {
    pub nvme_cli: String,
    pub command_timeout: Duration,
    pub device_timeout: Duration,
    pub ctrl_loss_tmo: u32,
}

impl Default for InitiatorSettings {
    fn default() -> Self {
        Self {
            nvme_cli: "nvme".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
            ctrl_loss_tmo: DEFAULT_CTRL_LOSS_TMO,
        }
    }
}

/// Initiator that shells out to nvme-cli.
pub struct NvmeofInitiator {
    params: ConnectionParams,
    runner: Arc<dyn CommandRunner>,
    locator: DeviceLocator,
    settings: InitiatorSettings,
}

impl NvmeofInitiator {
    pub fn new(
        params: ConnectionParams,
        runner: Arc<dyn CommandRunner>,
        locator: DeviceLocator,
        settings: InitiatorSettings,
    ) -> Self {
        Self {
            params,
            runner,
            locator,
            settings,
        }
    }

    fn connect_command(&self) -> Vec<String> {
        let ctrl_loss_tmo = self.settings.ctrl_loss_tmo.to_string();
        // The gateway authorizes hosts by the volume's qualified name, which
        // is why it goes in as -q.
        argv([
            self.settings.nvme_cli.as_str(),
            "connect-all",
            "-t",
            self.params.transport.as_str(),
            "-a",
            self.params.traddr.as_str(),
            "-q",
            self.params.nqn.as_str(),
            "-l",
            ctrl_loss_tmo.as_str(),
        ])
    }

    fn disconnect_command(&self) -> Vec<String> {
        argv([
            self.settings.nvme_cli.as_str(),
            "disconnect",
            "-n",
            self.params.nqn.as_str(),
        ])
    }

    fn device_pattern(&self) -> String {
        self.locator.uuid_pattern(&self.params.uuid)
    }
}

#[tonic::async_trait]
impl Initiator for NvmeofInitiator {
    async fn connect(&self) -> Result<PathBuf, InitiatorError> {
        info!(params = %self.params, "Connecting to NVMeoF target");

        let cmd = self.connect_command();
        let result = self.runner.run(&cmd, self.settings.command_timeout).await?;
        metrics::record_fabric_command("connect-all", result.outcome.as_str());

        match result.outcome {
            Outcome::Success => {
                info!(nqn = %self.params.nqn, "nvme connect-all succeeded");
            }
            _ if result.output.contains("already connected") => {
                warn!(nqn = %self.params.nqn, "nvme connect: already connected, continuing");
            }
            outcome => {
                // Keep going, the device may still show up
                error!(
                    command = ?cmd,
                    outcome = outcome.as_str(),
                    output = %result.output,
                    "nvme connect-all failed"
                );
            }
        }

        self.locator
            .wait_for_presence(&self.device_pattern(), self.settings.device_timeout)
            .await
            .map_err(|source| InitiatorError::Connect {
                nqn: self.params.nqn.clone(),
                source,
            })
    }

    async fn disconnect(&self) -> Result<(), InitiatorError> {
        info!(nqn = %self.params.nqn, "Disconnecting from NVMeoF target");

        let cmd = self.disconnect_command();
        let result = self.runner.run(&cmd, self.settings.command_timeout).await?;
        metrics::record_fabric_command("disconnect", result.outcome.as_str());

        match result.outcome {
            Outcome::Success => {
                info!(nqn = %self.params.nqn, "nvme disconnect succeeded");
            }
            Outcome::Failed(_)
                if result.output.contains("not found")
                    || result.output.contains("No subsystem")
                    || result.output.contains("disconnected 0") =>
            {
                warn!(nqn = %self.params.nqn, "NVMeoF target was not connected");
            }
            outcome => {
                // Could be a duplicate request; the device check decides
                error!(
                    command = ?cmd,
                    outcome = outcome.as_str(),
                    output = %result.output,
                    "nvme disconnect failed"
                );
            }
        }

        self.locator
            .wait_for_absence(&self.device_pattern(), self.settings.device_timeout)
            .await
            .map_err(|source| InitiatorError::Disconnect {
                nqn: self.params.nqn.clone(),
                source,
            })
    }
}

/// Factory producing [`NvmeofInitiator`]s that share a runner and locator.
pub struct NvmeofInitiatorFactory {
    runner: Arc<dyn CommandRunner>,
    locator: DeviceLocator,
    settings: InitiatorSettings,
}

impl NvmeofInitiatorFactory {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        locator: DeviceLocator,
        settings: InitiatorSettings,
    ) -> Self {
        Self {
            runner,
            locator,
            settings,
        }
    }
}

impl InitiatorFactory for NvmeofInitiatorFactory {
    fn create(&self, params: &ConnectionParams) -> Box<dyn Initiator> {
        Box::new(NvmeofInitiator::new(
            params.clone(),
            self.runner.clone(),
            self.locator.clone(),
            self.settings.clone(),
        ))
    }
}
