//! Management server for host-controller connections.
//!
//! This module provides the TCP endpoint a domain controller exposes to its
//! fleet. Host controllers connect here to register, receive configuration
//! snapshots, and answer liveness probes.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use domainlink::domain::{DomainConfig, DomainController, DomainModel};
//! use domainlink::server::DomainServer;
//!
//! #[tokio::main]
//! async fn main() -> domainlink::error::Result<()> {
//!     let controller = DomainController::new(DomainConfig::default(), DomainModel::default());
//!     let server = DomainServer::new("127.0.0.1:9990", controller).await?;
//!     server.run().await
//! }
//! ```

mod connection;
mod handler;

pub use connection::{ConnectionHandle, HostConnection};
pub use handler::{Handler, Reply, RequestContext};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio::sync::{RwLock, broadcast};

use crate::constants::{DEFAULT_MAX_CONNECTIONS_PER_IP, DEFAULT_MAX_TOTAL_CONNECTIONS};
use crate::error::{Error, Result};
use crate::types::ConnectionId;

/// The domain controller's management endpoint, with graceful shutdown
/// support.
pub struct DomainServer<H: Handler> {
    listener: TcpListener,
    handler: Arc<H>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
    /// Active connection counter
    active_connections: Arc<AtomicUsize>,
    /// Per-IP connection counter, bounding reconnect storms from one machine
    connections_per_ip: Arc<RwLock<HashMap<IpAddr, usize>>>,
    /// Maximum connections allowed per IP
    max_connections_per_ip: usize,
    /// Maximum total connections across all host controllers
    max_total_connections: usize,
    /// This process's incarnation id, reported in ping replies
    local_connection_id: ConnectionId,
}

impl<H: Handler + 'static> DomainServer<H> {
    /// Create a new management server bound to the given address.
    pub async fn new(addr: &str, handler: H) -> Result<Self> {
        Self::with_config(
            addr,
            handler,
            DEFAULT_MAX_CONNECTIONS_PER_IP,
            DEFAULT_MAX_TOTAL_CONNECTIONS,
        )
        .await
    }

    /// Create a new management server with custom connection limits.
    ///
    /// # Arguments
    /// * `addr` - Address to bind to (e.g., "0.0.0.0:9990")
    /// * `handler` - Request handler implementation
    /// * `max_connections_per_ip` - Maximum connections from a single IP
    /// * `max_total_connections` - Maximum total connections (0 = unlimited)
    pub async fn with_config(
        addr: &str,
        handler: H,
        max_connections_per_ip: usize,
        max_total_connections: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Io(e.kind()))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let local_connection_id = ConnectionId::generate();

        tracing::info!(
            addr = %addr,
            max_per_ip = max_connections_per_ip,
            max_total = max_total_connections,
            connection_id = %local_connection_id,
            "Domain controller listening"
        );

        Ok(Self {
            listener,
            handler: Arc::new(handler),
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
            connections_per_ip: Arc::new(RwLock::new(HashMap::new())),
            max_connections_per_ip,
            max_total_connections,
            local_connection_id,
        })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|e| Error::Io(e.kind()))
    }

    /// Get the number of active connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// This process's incarnation id.
    pub fn local_connection_id(&self) -> ConnectionId {
        self.local_connection_id
    }

    /// Initiate graceful shutdown.
    ///
    /// This signals the server to stop accepting new connections.
    /// Existing connections will be allowed to complete.
    /// Use `shutdown_and_wait` for waiting until all connections are drained.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        tracing::info!("Shutdown signal sent");
    }

    /// Initiate graceful shutdown and wait for all connections to drain.
    ///
    /// Returns `true` if all connections drained within the timeout.
    pub async fn shutdown_and_wait(&self, timeout: std::time::Duration) -> bool {
        self.shutdown();

        let start = std::time::Instant::now();
        let check_interval = std::time::Duration::from_millis(100);

        while start.elapsed() < timeout {
            let active = self.active_connections.load(Ordering::SeqCst);
            if active == 0 {
                tracing::info!("All connections drained");
                return true;
            }
            tracing::debug!(
                active_connections = active,
                "Waiting for connections to drain"
            );
            tokio::time::sleep(check_interval).await;
        }

        let remaining = self.active_connections.load(Ordering::SeqCst);
        tracing::warn!(
            remaining_connections = remaining,
            "Shutdown timeout, connections still active"
        );
        false
    }

    /// Run the server, accepting host-controller connections.
    ///
    /// This method will return when a shutdown signal is received.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down, no longer accepting connections");
                    return Ok(());
                }
                accept_result = self.listener.accept() => {
                    let (stream, addr) = accept_result.map_err(|e| Error::Io(e.kind()))?;
                    let ip = addr.ip();

                    // Check global connection limit (0 = unlimited)
                    if self.max_total_connections > 0 {
                        let current_total = self.active_connections.load(Ordering::SeqCst);
                        if current_total >= self.max_total_connections {
                            tracing::warn!(
                                client_ip = %ip,
                                current_connections = current_total,
                                max_connections = self.max_total_connections,
                                "Rejecting connection - global limit exceeded"
                            );
                            drop(stream);
                            continue;
                        }
                    }

                    // Check per-IP connection limit
                    let current_count = {
                        let counts = self.connections_per_ip.read().await;
                        *counts.get(&ip).unwrap_or(&0)
                    };

                    if current_count >= self.max_connections_per_ip {
                        tracing::warn!(
                            client_ip = %ip,
                            current_connections = current_count,
                            max_connections = self.max_connections_per_ip,
                            "Rejecting connection - per-IP limit exceeded"
                        );
                        drop(stream);
                        continue;
                    }

                    // Increment per-IP count
                    {
                        let mut counts = self.connections_per_ip.write().await;
                        *counts.entry(ip).or_insert(0) += 1;
                    }

                    tracing::debug!(client_addr = %addr, "Accepted host-controller connection");

                    let handler = self.handler.clone();
                    let active_connections = self.active_connections.clone();
                    let connections_per_ip = self.connections_per_ip.clone();
                    let local_connection_id = self.local_connection_id;

                    active_connections.fetch_add(1, Ordering::SeqCst);

                    tokio::spawn(async move {
                        let conn = HostConnection::new(stream, addr, local_connection_id);
                        if let Err(e) = conn.run(handler).await {
                            tracing::error!(client_addr = %addr, error = ?e, "Error handling connection");
                        }
                        active_connections.fetch_sub(1, Ordering::SeqCst);

                        // Decrement per-IP count
                        {
                            let mut counts = connections_per_ip.write().await;
                            if let Some(count) = counts.get_mut(&ip) {
                                *count = count.saturating_sub(1);
                                if *count == 0 {
                                    counts.remove(&ip);
                                }
                            }
                        }
                    });
                }
            }
        }
    }

    /// Run the server for a single connection (useful for testing).
    pub async fn accept_one(&self) -> Result<()> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::Io(e.kind()))?;

        tracing::debug!(client_addr = %addr, "Accepted host-controller connection");

        let handler = self.handler.clone();
        let conn = HostConnection::new(stream, addr, self.local_connection_id);
        conn.run(handler).await
    }
}
