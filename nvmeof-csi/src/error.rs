use thiserror::Error;
use tonic::Status;

use crate::initiator::InitiatorError;
use crate::mount::MountError;
use crate::types::ParamsError;

/// Failure of a node lifecycle operation.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Params(#[from] ParamsError),

    #[error(transparent)]
    Initiator(#[from] InitiatorError),

    #[error(transparent)]
    Mount(#[from] MountError),
}

impl NodeError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        NodeError::InvalidArgument(msg.into())
    }

    /// gRPC code name, used as the metrics status label.
    pub fn code_name(&self) -> &'static str {
        match self {
            NodeError::InvalidArgument(_) | NodeError::Params(_) => "InvalidArgument",
            _ => "Internal",
        }
    }
}

impl From<NodeError> for Status {
    fn from(error: NodeError) -> Self {
        match error {
            NodeError::InvalidArgument(_) | NodeError::Params(_) => {
                Status::invalid_argument(error.to_string())
            }
            _ => Status::internal(error.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use std::time::Duration;
    use tonic::Code;

    #[test]
    fn test_invalid_input_maps_to_invalid_argument() {
        let status: Status = NodeError::invalid_argument("Volume ID is required").into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "Volume ID is required");

        let status: Status = NodeError::from(ParamsError::MissingField("nqn")).into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("nqn"));
    }

    #[test]
    fn test_host_failures_map_to_internal() {
        let err = NodeError::from(InitiatorError::Connect {
            nqn: "nqn.2025-01.io.test:vol1".to_string(),
            source: DeviceError::NotFound {
                pattern: "/dev/disk/by-id/nvme-uuid.*x*".to_string(),
                waited: Duration::from_secs(20),
            },
        });
        assert_eq!(err.code_name(), "Internal");
        let status: Status = err.into();
        assert_eq!(status.code(), Code::Internal);
    }
}
