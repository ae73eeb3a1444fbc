//! Crate & protocol level errors.
//!
//! This module provides the top-level error types for the domainlink
//! management channel.
//!
//! # Error Hierarchy
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Protocol Layer (`crate::error`)
//!
//! - [`Error`]: Connection and frame parsing errors
//! - [`MgmtErrorCode`]: Wire error codes reported to host controllers
//!
//! ## Coordination Layer (`crate::domain::error`)
//!
//! - [`DomainError`]: Registration, model and forwarding errors
//! - Has `to_code()` for mapping to [`MgmtErrorCode`]
//!
//! ## Conversion
//!
//! [`DomainError`] can be converted to [`Error`] via `From` impl, allowing
//! coordination errors to propagate through the protocol layer.
//!
//! [`DomainError`]: crate::domain::error::DomainError

use bytes::Bytes;
use num_derive::FromPrimitive;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Protocol and connection level errors.
///
/// These are low-level errors that occur during:
/// - Network I/O operations
/// - Management frame parsing
/// - Connection management
///
/// For registration and model errors, see
/// [`crate::domain::error::DomainError`].
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),

    /// Could not parse the frame data.
    #[error("parsing error: invalid frame data ({} bytes)", .0.len())]
    Parse(Bytes),

    /// The peer violated the management protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The connection closed before the exchange finished.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Io(a), Error::Io(b)) => a == b,
            (Error::Parse(a), Error::Parse(b)) => a == b,
            (Error::Protocol(a), Error::Protocol(b)) => a == b,
            (Error::ConnectionClosed(a), Error::ConnectionClosed(b)) => a == b,
            (Error::Config(a), Error::Config(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

/// Wire error codes reported in management responses.
///
/// A response frame carries one of these as its status field; anything other
/// than [`MgmtErrorCode::None`] means the body is an error message rather
/// than a payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
#[repr(i16)]
pub enum MgmtErrorCode {
    /// An unexpected server error.
    Unknown = -1,
    #[default]
    None = 0,
    /// A host controller with the same name is already registered, or a
    /// registration for that name is already in flight.
    HostAlreadyExists = 1,
    /// The registration handshake failed after the snapshot was sent.
    RegistrationFailed = 2,
    /// The peer sent a malformed or unexpected message; the connection is
    /// closed after this code is reported.
    ProtocolViolation = 3,
    /// The host's management protocol version is below the supported floor.
    UnsupportedVersion = 4,
    /// A forwarded or local operation failed.
    OperationFailed = 5,
}

impl MgmtErrorCode {
    /// Whether this status marks a successful response.
    pub fn is_ok(&self) -> bool {
        matches!(self, MgmtErrorCode::None)
    }

    /// Static label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            MgmtErrorCode::Unknown => "unknown",
            MgmtErrorCode::None => "none",
            MgmtErrorCode::HostAlreadyExists => "host_already_exists",
            MgmtErrorCode::RegistrationFailed => "registration_failed",
            MgmtErrorCode::ProtocolViolation => "protocol_violation",
            MgmtErrorCode::UnsupportedVersion => "unsupported_version",
            MgmtErrorCode::OperationFailed => "operation_failed",
        }
    }
}
