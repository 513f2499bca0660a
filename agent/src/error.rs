//! Domain error taxonomy.
//!
//! Every failure that crosses a component boundary carries exactly one of
//! these variants. The RPC facade maps variants to wire status codes; the
//! engine only ever swallows errors in its documented non-fatal steps.

use std::fmt;

#[derive(Debug)]
pub enum AgentError {
    /// Request failed validation (bad name, out-of-range sizes, unknown template).
    Validation(String),
    /// The referenced VM or record does not exist.
    NotFound(String),
    /// A VM with this name already exists.
    Conflict(String),
    /// Admission failed: the request does not fit the available resources.
    ResourceExhausted(String),
    /// The hypervisor rejected or failed an operation.
    Hypervisor(String),
    /// The circuit breaker is open; the hypervisor was not contacted.
    HypervisorUnavailable(String),
    /// DHCP lease lookup failed or timed out.
    Network(String),
    /// Image download, disk, or persistence layer failure.
    Storage(String),
    /// An image failed its integrity check after download.
    Corrupted(String),
    /// Anything else.
    Internal(String),
}

impl AgentError {
    /// Short tag used in logs and wire messages.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Validation(_) => "validation",
            AgentError::NotFound(_) => "not_found",
            AgentError::Conflict(_) => "conflict",
            AgentError::ResourceExhausted(_) => "resource_exhausted",
            AgentError::Hypervisor(_) => "hypervisor",
            AgentError::HypervisorUnavailable(_) => "hypervisor_unavailable",
            AgentError::Network(_) => "network",
            AgentError::Storage(_) => "storage",
            AgentError::Corrupted(_) => "corrupted",
            AgentError::Internal(_) => "internal",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AgentError::Validation(m)
            | AgentError::NotFound(m)
            | AgentError::Conflict(m)
            | AgentError::ResourceExhausted(m)
            | AgentError::Hypervisor(m)
            | AgentError::HypervisorUnavailable(m)
            | AgentError::Network(m)
            | AgentError::Storage(m)
            | AgentError::Corrupted(m)
            | AgentError::Internal(m) => m,
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message())
    }
}

impl std::error::Error for AgentError {}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}
