//! NVMe-oF CSI Node Plugin Library
//!
//! Kubernetes CSI node plugin that attaches NVMe-oF volumes exported by a
//! storage gateway and exposes them to workloads as raw block devices.
//!
//! This library provides:
//! - CSI Identity and Node service implementations
//! - NVMe-oF initiator built on nvme-cli
//! - Idempotent bind mount management and per-volume serialization

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod config;
pub mod device;
pub mod error;
pub mod exec;
pub mod identity;
pub mod initiator;
pub mod locks;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod types;

pub use error::NodeError;
pub use identity::IdentityService;
pub use node::NodeService;
