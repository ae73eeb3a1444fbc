//! # domainlink
//! Domain-controller coordination layer for a multi-host application-server
//! fleet.
//!
//! A *domain controller* (master) holds the authoritative configuration for
//! a whole fleet. *Host controllers* (slaves) connect to it, register, and
//! mirror the parts of the configuration they need. This crate implements
//! the master side of that coordination:
//!
//! - the registration handshake, which publishes a consistent configuration
//!   snapshot to each joining host under a prepare/commit exchange,
//! - per-host tracking of which configuration resources a host already
//!   holds, so later changes only carry the deltas a host newly needs,
//! - proxy controllers that make each registered host a remotely executable
//!   operation target, with version transformers at the boundary,
//! - a heartbeat monitor that keeps every registered connection under
//!   liveness surveillance and tears down hosts whose processes restarted
//!   or vanished.
//!
//! # Getting started
//!
//! ```rust,no_run
//! use domainlink::domain::{DomainConfig, DomainController, DomainModel};
//! use domainlink::server::DomainServer;
//!
//! #[tokio::main]
//! async fn main() -> domainlink::error::Result<()> {
//!     domainlink::telemetry::init_logging(domainlink::telemetry::LogFormat::Pretty)
//!         .expect("logging");
//!
//!     let controller = DomainController::new(DomainConfig::default(), DomainModel::default());
//!     let server = DomainServer::new("0.0.0.0:9990", controller).await?;
//!     server.run().await
//! }
//! ```
//!
//! Host controllers speak the management wire protocol described in
//! [`protocol`]: size-prefixed frames, both peers sending requests, every
//! request answered by a correlated response.

#![forbid(unsafe_code)]

mod encode;
pub mod error;
mod parser;
pub mod protocol;
pub mod server;
pub mod types;

pub mod constants;
pub mod domain;
pub mod telemetry;

pub mod prelude {
    //! Main exports for building a domain controller.
    pub use crate::domain::{
        DomainConfig, DomainController, DomainError, DomainModel, DomainResult, Operation,
        OperationResult, ResourceAddress, RootAddress,
    };
    pub use crate::error::{Error, MgmtErrorCode, Result};
    pub use crate::protocol::HostInfo;
    pub use crate::server::{DomainServer, Handler, Reply, RequestContext};
    pub use crate::types::{ConnectionId, CorrelationId, ManagementVersion};

    pub use bytes;
}
