//! Error types for CKP port reservations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortError {
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid port count: {0}")]
    InvalidCount(String),

    #[error("Ports exhausted: {0}")]
    PortsExhausted(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool failed: {0}")]
    ToolFailed(String),

    #[error("Malformed tool output: {0}")]
    MalformedOutput(String),

    #[error("{} on-close callback(s) failed for port {port}: {}", .failures.len(), .failures.join("; "))]
    CallbackFailed { port: u16, failures: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PortError {
    /// Caller-fault errors: bad arguments, reported synchronously
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, PortError::InvalidPort(_) | PortError::InvalidCount(_))
    }

    /// Environmental errors from the port-listing tool.
    ///
    /// These make release verification inconclusive and never fail a release.
    pub fn is_inconclusive(&self) -> bool {
        matches!(
            self,
            PortError::ToolNotFound(_)
                | PortError::ToolFailed(_)
                | PortError::MalformedOutput(_)
                | PortError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PortError>;
