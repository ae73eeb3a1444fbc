//! Type-safe wrappers for management protocol primitives.
//!
//! These newtypes prevent mixing up integer fields that share an underlying
//! representation but carry different semantic meanings on the wire.

use std::fmt;

use bytes::BufMut;

use crate::encode::ToByte;
use crate::error::Result;

/// Correlation id pairing a request frame with its response frame.
///
/// Each side of the channel numbers its own outbound requests; the ids of
/// the two directions live in separate spaces and never collide because
/// request and response frames are distinguished by the frame kind marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CorrelationId(pub i32);

impl CorrelationId {
    /// Create a new correlation id from a raw value.
    #[inline]
    pub const fn new(value: i32) -> Self {
        CorrelationId(value)
    }

    /// Get the raw i32 value.
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }
}

impl From<i32> for CorrelationId {
    fn from(value: i32) -> Self {
        CorrelationId(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for CorrelationId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// Identifier of a peer's process incarnation, reported in ping replies.
///
/// A host controller picks this value once at process startup. Seeing a
/// different value on an otherwise-alive connection therefore means the
/// remote process restarted underneath the existing socket assumption, which
/// is a fatal desync rather than an ordinary reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub i64);

impl ConnectionId {
    /// Create a new connection id from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        ConnectionId(value)
    }

    /// Get the raw i64 value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Generate a fresh process-local connection id.
    pub fn generate() -> Self {
        let raw = uuid::Uuid::new_v4().as_u64_pair().0 as i64;
        ConnectionId(raw)
    }
}

impl From<i64> for ConnectionId {
    fn from(value: i64) -> Self {
        ConnectionId(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl ToByte for ConnectionId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// Management protocol version triple advertised by a host controller.
///
/// The triple determines which transformer chain translates operations and
/// resources across the proxy boundary for that host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManagementVersion {
    pub major: i8,
    pub minor: i8,
    pub micro: i8,
}

impl ManagementVersion {
    /// The version this domain controller speaks natively.
    pub const CURRENT: Self = ManagementVersion::new(3, 0, 0);

    /// Oldest version a joining host may advertise.
    pub const MIN_SUPPORTED: Self = ManagementVersion::new(2, 0, 0);

    /// Create a version triple.
    pub const fn new(major: i8, minor: i8, micro: i8) -> Self {
        ManagementVersion {
            major,
            minor,
            micro,
        }
    }

    /// Whether a host advertising this version may join.
    pub fn is_supported(&self) -> bool {
        *self >= Self::MIN_SUPPORTED
    }

    /// Whether a host at this version needs a non-identity transformer chain.
    pub fn needs_transformation(&self) -> bool {
        self.major != Self::CURRENT.major
    }
}

impl fmt::Display for ManagementVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl ToByte for ManagementVersion {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.major.encode(buffer)?;
        self.minor.encode(buffer)?;
        self.micro.encode(buffer)
    }
}
