//! Type-safe wrappers for CSI request parameters.
//!
//! The controller side hands the node a publish context describing how to
//! reach the NVMe-oF subsystem backing a volume. It is parsed once at the
//! API boundary into [`ConnectionParams`] so the rest of the node code never
//! touches the raw map.

use std::collections::HashMap;
use std::fmt::{self, Display};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamsError {
    #[error("publish context is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("publish context field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// NVMe-oF connection parameters for a single volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Transport type, lowercased (tcp, rdma, ...)
    pub transport: String,
    /// Target address
    pub traddr: String,
    /// Target service id (port)
    pub trsvcid: String,
    /// Subsystem qualified name
    pub nqn: String,
    /// Namespace UUID, used to find the local device. Not the CSI volume id.
    pub uuid: String,
}

impl ConnectionParams {
    pub const TRANSPORT: &'static str = "transport";
    pub const TRADDR: &'static str = "traddr";
    pub const TRSVCID: &'static str = "trsvcid";
    pub const NQN: &'static str = "nqn";
    pub const UUID: &'static str = "uuid";

    /// Parse and validate a CSI publish context. Every field is required.
    pub fn from_publish_context(context: &HashMap<String, String>) -> Result<Self, ParamsError> {
        let params = Self {
            transport: required(context, Self::TRANSPORT)?.to_lowercase(),
            traddr: required(context, Self::TRADDR)?.to_string(),
            trsvcid: required(context, Self::TRSVCID)?.to_string(),
            nqn: required(context, Self::NQN)?.to_string(),
            uuid: required(context, Self::UUID)?.to_string(),
        };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), ParamsError> {
        // Qualified names only use alphanumerics, dots, colons, dashes and underscores
        let nqn_ok = self
            .nqn
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_'));
        if !nqn_ok {
            return Err(ParamsError::InvalidField {
                field: Self::NQN,
                reason: "contains invalid characters".to_string(),
            });
        }

        // The uuid is spliced into a glob pattern
        if let Some(c) = self
            .uuid
            .chars()
            .find(|c| matches!(c, '*' | '?' | '[' | ']' | '/') || c.is_whitespace())
        {
            return Err(ParamsError::InvalidField {
                field: Self::UUID,
                reason: format!("contains '{}'", c),
            });
        }

        if !self.transport.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ParamsError::InvalidField {
                field: Self::TRANSPORT,
                reason: format!("unknown transport '{}'", self.transport),
            });
        }

        Ok(())
    }
}

impl Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{} {} (uuid {})",
            self.transport, self.traddr, self.trsvcid, self.nqn, self.uuid
        )
    }
}

fn required<'a>(
    context: &'a HashMap<String, String>,
    field: &'static str,
) -> Result<&'a str, ParamsError> {
    context
        .get(field)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or(ParamsError::MissingField(field))
}
