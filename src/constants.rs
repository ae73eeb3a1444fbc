//! Centralized protocol and configuration constants.
//!
//! This module consolidates the magic numbers used throughout the domainlink
//! management channel. Having them in one place makes it easier to:
//!
//! - Understand the protocol constraints
//! - Update values consistently
//! - Document the rationale for each constant

// =============================================================================
// Frame Constants (management wire protocol)
// =============================================================================

/// Frame kind marker for a request frame.
pub const FRAME_KIND_REQUEST: i8 = 0;

/// Frame kind marker for a response frame.
pub const FRAME_KIND_RESPONSE: i8 = 1;

/// Maximum size of a single management frame (16 MB).
///
/// A registration snapshot of a large domain fits comfortably under this;
/// anything bigger is treated as a protocol violation rather than allowed
/// to exhaust memory.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound for array lengths in protocol bodies.
///
/// An ignored-resource declaration or name list longer than this is not a
/// plausible host configuration and is rejected during parsing.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 65_536;

// =============================================================================
// Connection Constants
// =============================================================================

/// Number of concurrent request workers per host connection.
///
/// The registration handshake deliberately parks one worker while the host
/// applies the snapshot, so a connection needs at least two workers for the
/// COMPLETE message to be processed while REGISTER is still in flight.
pub const CONNECTION_WORKERS: usize = 4;

/// Maximum connections allowed from a single IP address.
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 16;

/// Maximum total connections across all host controllers (0 = unlimited).
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 512;

/// Capacity of the per-connection outbound frame queue.
pub const WRITER_QUEUE_DEPTH: usize = 64;

// =============================================================================
// Liveness Constants
// =============================================================================

/// How often a registered host is probed when no traffic has been seen.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// How long a probe waits for the ping reply before the connection is
/// declared unreachable.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 5_000;

// =============================================================================
// Configuration Model Constants
// =============================================================================

/// Resource type of a server group at the domain root.
pub const SERVER_GROUP: &str = "server-group";

/// Resource type of a profile at the domain root.
pub const PROFILE: &str = "profile";

/// Resource type of a socket binding group at the domain root.
pub const SOCKET_BINDING_GROUP: &str = "socket-binding-group";

/// Resource type of an extension at the domain root.
pub const EXTENSION: &str = "extension";

/// Root resource types a host controller only mirrors on demand.
///
/// A change touching one of these is omitted for hosts that neither declare
/// it ignored nor already hold it; the missing-resource mechanism delivers
/// it when a change first makes it relevant.
pub const UNUSED_CONFIG_TYPES: &[&str] = &[PROFILE, SOCKET_BINDING_GROUP, EXTENSION];
