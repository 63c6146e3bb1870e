//! Error types for the node orchestrator

use thiserror::Error;

use crate::models::InstanceState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Network address pool exhausted ({0} slots in use)")]
    AddressPoolExhausted(usize),

    #[error("Host port {0} is already published")]
    PortInUse(u16),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },

    #[error("Invalid state: instance is {current}, expected {expected}")]
    InvalidState { current: String, expected: String },

    #[error("Guest {id} did not power off within {timeout_ms}ms")]
    Unresponsive { id: String, timeout_ms: u64 },

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Firecracker API error: {0}")]
    Firecracker(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Lease for {0} is not allocated")]
    LeaseNotAllocated(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification surfaced to RPC callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    ResourceExhausted,
    AlreadyExists,
    FailedPrecondition,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidArgument => write!(f, "InvalidArgument"),
            ErrorKind::NotFound => write!(f, "NotFound"),
            ErrorKind::ResourceExhausted => write!(f, "ResourceExhausted"),
            ErrorKind::AlreadyExists => write!(f, "AlreadyExists"),
            ErrorKind::FailedPrecondition => write!(f, "FailedPrecondition"),
            ErrorKind::Internal => write!(f, "Internal"),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::Config(_) => ErrorKind::InvalidArgument,
            Error::InstanceNotFound(_) => ErrorKind::NotFound,
            Error::AddressPoolExhausted(_) => ErrorKind::ResourceExhausted,
            Error::PortInUse(_) => ErrorKind::AlreadyExists,
            Error::InvalidTransition { .. } | Error::InvalidState { .. } => {
                ErrorKind::FailedPrecondition
            }
            Error::Unresponsive { .. }
            | Error::Launch(_)
            | Error::Firecracker(_)
            | Error::Network(_)
            | Error::LeaseNotAllocated(_)
            | Error::Timeout(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Wrap any error that happened while bringing a VM up
    pub fn launch(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Launch(format!("{}: {}", context, err))
    }
}
