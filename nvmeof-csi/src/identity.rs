//! CSI Identity service for the NVMe-oF node plugin.
//!
//! Kubelet and the node-driver-registrar call this to learn which driver
//! owns the socket. Volume provisioning lives in a separate controller
//! deployment next to the gateway, so the plugin advertises that a
//! controller service exists even though this binary does not serve it.

use std::collections::HashMap;

use tonic::{Request, Response, Status};

use crate::csi;
use crate::csi::plugin_capability::service::Type as ServiceType;

pub const DRIVER_NAME: &str = "csi.nvmeof.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Services reported by GetPluginCapabilities.
const ADVERTISED_SERVICES: &[ServiceType] = &[ServiceType::ControllerService];

/// Reports the driver name the plugin was registered under.
pub struct IdentityService {
    name: String,
}

impl IdentityService {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new(DRIVER_NAME)
    }
}

fn service_capability(service: ServiceType) -> csi::PluginCapability {
    csi::PluginCapability {
        r#type: Some(csi::plugin_capability::Type::Service(
            csi::plugin_capability::Service {
                r#type: service as i32,
            },
        )),
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: ADVERTISED_SERVICES
                .iter()
                .copied()
                .map(service_capability)
                .collect(),
        }))
    }

    /// The node plugin holds no connections of its own, so once the socket
    /// is served it can take requests.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}
