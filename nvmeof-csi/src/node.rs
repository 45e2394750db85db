//! CSI Node Service Implementation
//!
//! Drives the node-side volume lifecycle: attach the NVMe-oF namespace and
//! bind its device onto the staging path, then bind the staging path into
//! workload target paths, and undo both in reverse order.
//!
//! Nothing is persisted. Whether a volume is staged or published is read
//! back from the mount table every time, so any call can be retried after
//! a failure or a plugin restart. Calls for the same volume id are
//! serialized through [`VolumeLocks`].

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::csi;
use crate::error::{NodeError, Result};
use crate::exec::{CommandRunner, ProcessRunner};
use crate::initiator::{InitiatorFactory, NvmeofInitiatorFactory};
use crate::locks::VolumeLocks;
use crate::metrics::OperationTimer;
use crate::mount::{HostMounter, MountManager};
use crate::types::ConnectionParams;

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume staging (connect to the NVMe-oF target, bind mount the device to the staging path)
/// - Volume unstaging (unmount and remove the staging path)
/// - Volume publishing (bind mount from staging to target path)
/// - Volume unpublishing (unmount and remove the target path)
/// - Node capability reporting
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    mounts: MountManager,
    initiators: Arc<dyn InitiatorFactory>,
    locks: VolumeLocks,
}

impl NodeService {
    /// Create a NodeService operating on the host.
    pub fn new(node_id: String, config: &NodeConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
        let mounter = HostMounter::new(
            runner.clone(),
            config.mount_table.clone(),
            config.mount_timeout(),
        );
        let initiators = NvmeofInitiatorFactory::new(
            runner,
            config.device_locator(),
            config.initiator_settings(),
        );

        Self::with_components(
            node_id,
            MountManager::new(Arc::new(mounter)),
            Arc::new(initiators),
        )
    }

    /// Create a NodeService from explicit collaborators.
    pub fn with_components(
        node_id: String,
        mounts: MountManager,
        initiators: Arc<dyn InitiatorFactory>,
    ) -> Self {
        Self {
            node_id,
            mounts,
            initiators,
            locks: VolumeLocks::new(),
        }
    }

    /// Path the volume's device is bound to: `<staging_target_path>/<volume_id>`.
    pub fn staging_path(staging_target_path: &str, volume_id: &str) -> PathBuf {
        Path::new(staging_target_path).join(volume_id)
    }

    fn validate_volume_id(volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(NodeError::invalid_argument("Volume ID is required"));
        }
        // The id becomes a path component
        if volume_id.contains('/') || volume_id == "." || volume_id == ".." {
            return Err(NodeError::invalid_argument(format!(
                "Volume ID '{}' is not a valid path component",
                volume_id
            )));
        }
        Ok(())
    }

    /// Validate that a request path is absolute and free of `..` components.
    fn validate_path(path: &str, what: &str) -> Result<()> {
        if path.is_empty() {
            return Err(NodeError::invalid_argument(format!("{} is required", what)));
        }

        let path = Path::new(path);
        if !path.is_absolute() {
            return Err(NodeError::invalid_argument(format!("{} must be absolute", what)));
        }

        if path.components().any(|c| c == Component::ParentDir) {
            return Err(NodeError::invalid_argument(format!(
                "{} cannot contain '..' (path traversal)",
                what
            )));
        }

        Ok(())
    }

    /// Only raw block volumes are supported.
    fn require_block(capability: Option<&csi::VolumeCapability>) -> Result<()> {
        match capability.and_then(|c| c.access_type.as_ref()) {
            Some(csi::volume_capability::AccessType::Block(_)) => Ok(()),
            Some(csi::volume_capability::AccessType::Mount(_)) => Err(
                NodeError::invalid_argument("only block volumes supported"),
            ),
            None => Err(NodeError::invalid_argument("Volume capability is required")),
        }
    }

    /// Attach the volume and bind its device onto the staging path.
    pub async fn stage_volume(&self, req: &csi::NodeStageVolumeRequest) -> Result<()> {
        Self::validate_volume_id(&req.volume_id)?;
        Self::validate_path(&req.staging_target_path, "Staging target path")?;
        Self::require_block(req.volume_capability.as_ref())?;
        let params = ConnectionParams::from_publish_context(&req.publish_context)?;

        let volume_id = req.volume_id.as_str();
        let _lock = self.locks.acquire(volume_id).await;
        let staging_path = Self::staging_path(&req.staging_target_path, volume_id);

        if self.mounts.is_mount_point(&staging_path).await? {
            warn!(volume_id = %volume_id, staging_path = %staging_path.display(), "Volume already staged");
            return Ok(());
        }

        let device = self.initiators.create(&params).connect().await?;

        // From here on a failure leaves the fabric session up. A retried
        // stage reconnects idempotently and rediscovers the device.
        if self.mounts.ensure_mount_target(&staging_path).await? {
            warn!(volume_id = %volume_id, staging_path = %staging_path.display(), "Volume already staged");
            return Ok(());
        }
        self.mounts.bind_mount(&device, &staging_path).await?;

        info!(
            volume_id = %volume_id,
            staging_path = %staging_path.display(),
            device = %device.display(),
            "Volume staged successfully"
        );
        Ok(())
    }

    /// Unbind the staging path.
    pub async fn unstage_volume(&self, req: &csi::NodeUnstageVolumeRequest) -> Result<()> {
        Self::validate_volume_id(&req.volume_id)?;
        Self::validate_path(&req.staging_target_path, "Staging target path")?;

        let volume_id = req.volume_id.as_str();
        let _lock = self.locks.acquire(volume_id).await;
        let staging_path = Self::staging_path(&req.staging_target_path, volume_id);

        if !self.mounts.is_mount_point(&staging_path).await? {
            warn!(volume_id = %volume_id, staging_path = %staging_path.display(), "Volume already unstaged");
            return Ok(());
        }

        self.mounts.teardown(&staging_path).await?;

        // TODO: disconnect the fabric session once its lifetime is agreed
        // with the gateway operators. Needs the nqn and uuid recorded at
        // stage time, since unstage requests do not carry them.

        info!(volume_id = %volume_id, staging_path = %staging_path.display(), "Volume unstaged successfully");
        Ok(())
    }

    /// Bind the staged device into the workload's target path.
    pub async fn publish_volume(&self, req: &csi::NodePublishVolumeRequest) -> Result<()> {
        Self::validate_volume_id(&req.volume_id)?;
        Self::validate_path(&req.staging_target_path, "Staging target path")?;
        Self::validate_path(&req.target_path, "Target path")?;
        Self::require_block(req.volume_capability.as_ref())?;

        let volume_id = req.volume_id.as_str();
        let _lock = self.locks.acquire(volume_id).await;
        let staging_path = Self::staging_path(&req.staging_target_path, volume_id);
        let target_path = Path::new(&req.target_path);

        if self.mounts.ensure_mount_target(target_path).await? {
            warn!(volume_id = %volume_id, target_path = %target_path.display(), "Volume already published");
            return Ok(());
        }
        self.mounts.bind_mount(&staging_path, target_path).await?;

        info!(
            volume_id = %volume_id,
            staging_path = %staging_path.display(),
            target_path = %target_path.display(),
            "Volume published successfully"
        );
        Ok(())
    }

    /// Unbind and remove the workload's target path.
    pub async fn unpublish_volume(&self, req: &csi::NodeUnpublishVolumeRequest) -> Result<()> {
        Self::validate_volume_id(&req.volume_id)?;
        Self::validate_path(&req.target_path, "Target path")?;

        let _lock = self.locks.acquire(&req.volume_id).await;
        self.mounts.teardown(Path::new(&req.target_path)).await?;

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "Volume unpublished successfully");
        Ok(())
    }
}

/// Turn an operation result into a gRPC reply, recording metrics and logging failures.
fn reply<T>(
    timer: OperationTimer,
    operation: &str,
    volume_id: &str,
    result: Result<()>,
    response: T,
) -> std::result::Result<Response<T>, Status> {
    match result {
        Ok(()) => {
            timer.success();
            Ok(Response::new(response))
        }
        Err(e) => {
            error!(volume_id = %volume_id, operation = %operation, error = %e, "Operation failed");
            timer.failure(e.code_name());
            Err(e.into())
        }
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume to a staging path.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeStageVolume request"
        );

        let timer = OperationTimer::new("node_stage_volume");
        let result = self.stage_volume(&req).await;
        reply(timer, "NodeStageVolume", &req.volume_id, result, csi::NodeStageVolumeResponse {})
    }

    /// Unstage a volume from the staging path.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeUnstageVolume request"
        );

        let timer = OperationTimer::new("node_unstage_volume");
        let result = self.unstage_volume(&req).await;
        reply(timer, "NodeUnstageVolume", &req.volume_id, result, csi::NodeUnstageVolumeResponse {})
    }

    /// Publish a volume to a target path (bind mount from staging).
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            target_path = %req.target_path,
            readonly = %req.readonly,
            "NodePublishVolume request"
        );

        let timer = OperationTimer::new("node_publish_volume");
        let result = self.publish_volume(&req).await;
        reply(timer, "NodePublishVolume", &req.volume_id, result, csi::NodePublishVolumeResponse {})
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        let timer = OperationTimer::new("node_unpublish_volume");
        let result = self.unpublish_volume(&req).await;
        reply(timer, "NodeUnpublishVolume", &req.volume_id, result, csi::NodeUnpublishVolumeResponse {})
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> std::result::Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc {
                    r#type: csi::node_service_capability::rpc::Type::StageUnstageVolume as i32,
                },
            )),
        }];

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeExpandVolume is not supported"))
    }

    /// Get volume statistics (not implemented).
    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> std::result::Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }
}
