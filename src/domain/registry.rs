//! Registry of registered host controllers.
//!
//! One record per host name bundles everything the master tracks for that
//! host: the proxy it forwards operations through, the root addresses the
//! host is known to hold, and the liveness state. Bundling the three into a
//! single lock-guarded record removes the possibility of parallel per-host
//! maps drifting apart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::protocol::HostInfo;
use crate::types::ConnectionId;

use super::error::{DomainError, DomainResult};
use super::model::RootAddress;
use super::proxy::ProxyController;

/// Liveness state of one host connection.
///
/// Shared between the registry record and the heartbeat task. Both fields
/// are atomics: the probe loop updates them without taking the domain lock,
/// and stale reads are harmless.
#[derive(Debug, Clone)]
pub struct PingState {
    /// Connection id the host reported last; unset until the first reply.
    remote_connection_id: Arc<AtomicI64>,
    /// Stops the probe loop when the host is unregistered.
    cancelled: Arc<AtomicBool>,
}

/// Sentinel for "no ping reply seen yet".
const UNSET_CONNECTION_ID: i64 = i64::MIN;

impl PingState {
    pub fn new() -> Self {
        PingState {
            remote_connection_id: Arc::new(AtomicI64::new(UNSET_CONNECTION_ID)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connection id of the remote process, once a ping reply reported it.
    pub fn remote_connection_id(&self) -> Option<ConnectionId> {
        match self.remote_connection_id.load(Ordering::Relaxed) {
            UNSET_CONNECTION_ID => None,
            raw => Some(ConnectionId::new(raw)),
        }
    }

    pub fn record_connection_id(&self, id: ConnectionId) {
        self.remote_connection_id.store(id.value(), Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Stop the probe loop. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl Default for PingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the master tracks for one registered host.
pub struct HostRecord {
    info: HostInfo,
    proxy: ProxyController,
    /// Root addresses confirmed delivered to this host. Grows only under
    /// committed operations; never speculatively.
    known_addresses: HashSet<RootAddress>,
    ping: PingState,
}

impl HostRecord {
    pub fn new(info: HostInfo, proxy: ProxyController, ping: PingState) -> Self {
        HostRecord {
            info,
            proxy,
            known_addresses: HashSet::new(),
            ping,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &HostInfo {
        &self.info
    }

    pub fn proxy(&self) -> &ProxyController {
        &self.proxy
    }

    pub fn ping(&self) -> &PingState {
        &self.ping
    }

    pub fn known_addresses(&self) -> &HashSet<RootAddress> {
        &self.known_addresses
    }

    pub fn knows(&self, address: &RootAddress) -> bool {
        self.known_addresses.contains(address)
    }

    /// Merge confirmed-delivered addresses. Only called from committed
    /// operations' callbacks.
    pub fn merge_known_addresses(&mut self, addresses: impl IntoIterator<Item = RootAddress>) {
        self.known_addresses.extend(addresses);
    }
}

/// All registered hosts, owned by the domain lock.
#[derive(Default)]
pub struct HostRegistry {
    hosts: HashMap<String, HostRecord>,
}

impl HostRegistry {
    pub fn new() -> Self {
        HostRegistry::default()
    }

    /// Install a record; a second registration for the same name fails
    /// deterministically instead of overwriting.
    pub fn insert(&mut self, record: HostRecord) -> DomainResult<()> {
        let name = record.name().to_string();
        if self.hosts.contains_key(&name) {
            return Err(DomainError::HostAlreadyExists(name));
        }
        self.hosts.insert(name, record);
        Ok(())
    }

    /// Remove a host, returning its record for teardown.
    pub fn remove(&mut self, name: &str) -> Option<HostRecord> {
        self.hosts.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hosts.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&HostRecord> {
        self.hosts.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut HostRecord> {
        self.hosts.get_mut(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.hosts.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::HostConnection;
    use crate::types::ManagementVersion;

    fn test_record(name: &str) -> HostRecord {
        let (_client, server) = tokio::io::duplex(1024);
        let conn = HostConnection::new(server, "127.0.0.1:1".parse().unwrap(), ConnectionId::new(1));
        let proxy = ProxyController::new(name, conn.handle(), ManagementVersion::CURRENT);
        HostRecord::new(HostInfo::new(name, "1.0"), proxy, PingState::new())
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let mut registry = HostRegistry::new();
        registry.insert(test_record("hc01")).unwrap();
        let err = registry.insert(test_record("hc01")).unwrap_err();
        assert!(matches!(err, DomainError::HostAlreadyExists(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_clears_all_host_state() {
        let mut registry = HostRegistry::new();
        registry.insert(test_record("hc01")).unwrap();
        registry
            .get_mut("hc01")
            .unwrap()
            .merge_known_addresses([RootAddress::new("profile", "prod")]);

        let record = registry.remove("hc01").unwrap();
        assert!(record.knows(&RootAddress::new("profile", "prod")));
        assert!(!registry.contains("hc01"));
        assert!(registry.remove("hc01").is_none());
    }

    #[tokio::test]
    async fn known_addresses_grow_monotonically() {
        let mut registry = HostRegistry::new();
        registry.insert(test_record("hc01")).unwrap();

        let record = registry.get_mut("hc01").unwrap();
        assert!(record.known_addresses().is_empty());

        record.merge_known_addresses([RootAddress::new("profile", "prod")]);
        record.merge_known_addresses([
            RootAddress::new("profile", "prod"),
            RootAddress::new("socket-binding-group", "standard"),
        ]);
        assert_eq!(record.known_addresses().len(), 2);
    }

    #[test]
    fn ping_state_records_connection_id_once_seen() {
        let ping = PingState::new();
        assert_eq!(ping.remote_connection_id(), None);

        ping.record_connection_id(ConnectionId::new(0x55));
        assert_eq!(ping.remote_connection_id(), Some(ConnectionId::new(0x55)));
    }

    #[test]
    fn ping_state_cancel_is_sticky() {
        let ping = PingState::new();
        assert!(!ping.is_cancelled());
        ping.cancel();
        ping.cancel();
        assert!(ping.is_cancelled());
    }
}
