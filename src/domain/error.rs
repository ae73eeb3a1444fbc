//! Error types for the domain coordination layer.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used depending on what failed:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used where failure must abort the surrounding exchange:
//! - Registration conflicts and version rejections
//! - Model mutations (duplicate or missing resources)
//! - Forwarding an operation to a host that went away
//!
//! ## Expected Outcomes (Not Crashes)
//!
//! A host rolling back a registration snapshot, or reporting a failed
//! result for a forwarded operation, is a normal protocol outcome. These
//! surface as [`DomainError::RegistrationRolledBack`] or a failed
//! [`OperationResult`](super::model::OperationResult) and are logged at
//! `info`, never treated as crashes.
//!
//! There are no retries anywhere in this layer; reconnection and backoff
//! belong to the host-controller side.

use thiserror::Error;

use crate::error::MgmtErrorCode;
use crate::types::ManagementVersion;

use super::model::ResourceAddress;

/// Result type for domain coordination operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Errors that can occur in the domain coordination layer.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A host controller with this name is registered, or a registration
    /// for the name is already in flight.
    #[error("host `{0}` is already registered")]
    HostAlreadyExists(String),

    /// The host is not (or no longer) registered.
    #[error("host `{0}` is not registered")]
    HostNotRegistered(String),

    /// The joining host applied the snapshot and reported rollback.
    #[error("registration of `{0}` was rolled back by the host{detail}",
        detail = .1.as_deref().map(|m| format!(": {}", m)).unwrap_or_default())]
    RegistrationRolledBack(String, Option<String>),

    /// The handshake failed before completion (connection loss included).
    #[error("registration of `{0}` failed: {1}")]
    RegistrationFailed(String, String),

    /// The host's management version is below the supported floor.
    #[error("management version {0} is older than supported minimum {min}",
        min = ManagementVersion::MIN_SUPPORTED)]
    UnsupportedVersion(ManagementVersion),

    /// No resource exists at the address.
    #[error("no resource at {0}")]
    NoSuchResource(ResourceAddress),

    /// A resource already exists at the address.
    #[error("resource already exists at {0}")]
    DuplicateResource(ResourceAddress),

    /// The operation name is not understood by the local model.
    #[error("no such operation `{0}`")]
    NoSuchOperation(String),

    /// A required operation parameter is absent.
    #[error("missing parameter `{0}`")]
    MissingParameter(&'static str),

    /// Payload (de)serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A forwarded operation failed on the remote host.
    #[error("remote operation on `{0}` failed: {1}")]
    RemoteFailure(String, String),

    /// Transport-level failure.
    #[error(transparent)]
    Connection(#[from] crate::error::Error),
}

impl DomainError {
    /// Wire error code reported for this failure.
    pub fn to_code(&self) -> MgmtErrorCode {
        match self {
            DomainError::HostAlreadyExists(_) => MgmtErrorCode::HostAlreadyExists,
            DomainError::RegistrationRolledBack(_, _) | DomainError::RegistrationFailed(_, _) => {
                MgmtErrorCode::RegistrationFailed
            }
            DomainError::UnsupportedVersion(_) => MgmtErrorCode::UnsupportedVersion,
            DomainError::HostNotRegistered(_)
            | DomainError::NoSuchResource(_)
            | DomainError::DuplicateResource(_)
            | DomainError::NoSuchOperation(_)
            | DomainError::MissingParameter(_)
            | DomainError::RemoteFailure(_, _) => MgmtErrorCode::OperationFailed,
            DomainError::Serialization(_) | DomainError::Connection(_) => MgmtErrorCode::Unknown,
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::Serialization(e.to_string())
    }
}
