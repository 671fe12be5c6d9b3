use std::fmt;

/// Errors returned by sandbox orchestration operations.
#[derive(Debug)]
pub enum SandboxError {
    /// The backend rejected a create or start request. Partial state has been rolled back.
    Provision(String),
    /// The backend could not be reached or did not answer in time.
    Unavailable(String),
    /// The sandbox is not tracked by this manager.
    NotFound(String),
    /// The guest agent answered with an error object or a mismatched response.
    Protocol(String),
    /// Any other backend call failure (engine API, supervisor process).
    Backend(String),
    /// Host network plumbing (bridge, tap device) failed.
    Network(String),
    /// Invalid input or configuration.
    Validation(String),
    /// Persisted record store failure.
    Storage(String),
}

impl SandboxError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SandboxError::NotFound(_))
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Provision(msg) => write!(f, "provisioning failed: {msg}"),
            SandboxError::Unavailable(msg) => write!(f, "backend unavailable: {msg}"),
            SandboxError::NotFound(msg) => write!(f, "not found: {msg}"),
            SandboxError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            SandboxError::Backend(msg) => write!(f, "backend error: {msg}"),
            SandboxError::Network(msg) => write!(f, "network error: {msg}"),
            SandboxError::Validation(msg) => write!(f, "validation error: {msg}"),
            SandboxError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
