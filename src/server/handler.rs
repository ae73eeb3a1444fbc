//! Handler trait for processing management requests.
//!
//! Implement the `Handler` trait to provide the domain-controller logic
//! behind a [`DomainServer`](super::DomainServer). The connection layer
//! decodes frames, enforces the protocol, and answers pings; everything
//! with domain semantics is routed through this trait.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MgmtErrorCode;
use crate::protocol::{CompletionData, HostInfo, UnregisterData};
use crate::types::CorrelationId;

use super::connection::ConnectionHandle;

/// Context for a request, containing connection information.
#[derive(Clone)]
pub struct RequestContext {
    /// The host controller's address.
    pub client_addr: SocketAddr,
    /// Correlation id of the request being handled; a handler that responds
    /// mid-flight (registration sends the snapshot itself) uses this.
    pub correlation_id: CorrelationId,
    /// Unique request ID for correlation across logs and traces.
    pub request_id: uuid::Uuid,
    /// Handle to the connection the request arrived on.
    pub connection: Arc<ConnectionHandle>,
}

impl RequestContext {
    /// Get the request ID for logging.
    pub fn request_id(&self) -> &uuid::Uuid {
        &self.request_id
    }
}

/// What the dispatcher should send back for a handled request.
#[derive(Debug)]
pub enum Reply {
    /// Respond with a successful body.
    Ok(Vec<u8>),
    /// Respond with an error status and message.
    Err {
        code: MgmtErrorCode,
        message: String,
    },
    /// The handler already wrote the response through the connection.
    Sent,
}

impl Reply {
    /// Successful response with no payload.
    pub fn ok_empty() -> Self {
        Reply::Ok(Vec::new())
    }

    /// Error response.
    pub fn error(code: MgmtErrorCode, message: impl Into<String>) -> Self {
        Reply::Err {
            code,
            message: message.into(),
        }
    }

    /// Whether this reply reports a protocol violation, which is fatal to
    /// the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Reply::Err {
                code: MgmtErrorCode::ProtocolViolation,
                ..
            }
        )
    }
}

/// Trait for handling management protocol requests.
///
/// Default implementations reject every request, so a handler only needs to
/// implement the operations it supports.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle a host controller's registration request.
    ///
    /// A successful implementation sends the configuration snapshot itself
    /// (returning [`Reply::Sent`]) because the handshake continues on the
    /// same connection after the response goes out.
    async fn handle_register(&self, _ctx: &RequestContext, info: HostInfo) -> Reply {
        Reply::error(
            MgmtErrorCode::Unknown,
            format!("registration of `{}` is not supported", info.name),
        )
    }

    /// Handle the host-side outcome of a registration in flight.
    async fn handle_complete(&self, _ctx: &RequestContext, _data: CompletionData) -> Reply {
        Reply::error(
            MgmtErrorCode::ProtocolViolation,
            "no registration in flight",
        )
    }

    /// Handle a graceful unregistration.
    async fn handle_unregister(&self, _ctx: &RequestContext, _data: UnregisterData) -> Reply {
        Reply::ok_empty()
    }

    /// Called once when a connection stops, after its read loop has exited.
    /// Per-host state tied to the connection is torn down here.
    async fn connection_closed(&self, _connection: &ConnectionHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl Handler for NullHandler {}

    #[test]
    fn handler_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NullHandler>();
    }

    #[test]
    fn reply_fatal_only_for_protocol_violation() {
        assert!(Reply::error(MgmtErrorCode::ProtocolViolation, "bad").is_fatal());
        assert!(!Reply::error(MgmtErrorCode::HostAlreadyExists, "dup").is_fatal());
        assert!(!Reply::ok_empty().is_fatal());
        assert!(!Reply::Sent.is_fatal());
    }
}
