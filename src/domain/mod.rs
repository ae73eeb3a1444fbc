//! Domain coordination core.
//!
//! The [`DomainController`] is the master side of the fleet: it accepts
//! host-controller registrations, publishes configuration snapshots, tracks
//! which configuration each host already holds so only deltas are resent,
//! and keeps every registered connection under heartbeat surveillance.
//!
//! # Locking
//!
//! One exclusive `tokio::sync::Mutex` guards the `Domain` — the
//! configuration model and the host registry together. Every read and write
//! happens under that guard, released deterministically by scope on success
//! and failure alike. The single exception the design allows: a
//! registration parks *outside* the lock while the joining host applies the
//! snapshot, so a dead connection can never wedge the domain.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod ignore;
pub mod metrics;
pub mod model;
pub mod registration;
pub mod registry;
pub mod proxy;

pub use config::DomainConfig;
pub use error::{DomainError, DomainResult};
pub use model::{
    DomainModel, Operation, OperationContext, OperationResult, OutboundOperation,
    PreparedTransaction, RequiredResource, ResourceAddress, ResourceNode, RootAddress,
    TransactionControl, TxOutcome, ops,
};
pub use proxy::{IdentityTransformers, LegacyTransformers, ProxyController, Transformers};
pub use registration::RegistrationState;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::constants::{PROFILE, SERVER_GROUP, SOCKET_BINDING_GROUP};
use crate::error::MgmtErrorCode;
use crate::protocol::{CompletionData, CompletionOutcome, HostInfo, UnregisterData, WireResponse};
use crate::server::{ConnectionHandle, Handler, Reply, RequestContext};
use crate::types::CorrelationId;

use heartbeat::HeartbeatMonitor;
use ignore::IgnoreRegistry;
use registration::{CompletionSignal, PendingRegistrations};
use registry::{HostRecord, HostRegistry, PingState};

/// Everything guarded by the domain lock.
struct Domain {
    model: DomainModel,
    hosts: HostRegistry,
}

/// The domain controller of a host-controller fleet.
///
/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct DomainController {
    inner: Arc<Inner>,
}

struct Inner {
    /// The domain lock.
    domain: Mutex<Domain>,
    /// In-flight registration attempts, outside the lock by design: a
    /// duplicate must be rejectable without touching shared state.
    registrations: PendingRegistrations,
    ignore: IgnoreRegistry,
    config: DomainConfig,
}

impl DomainController {
    /// Create a controller over an initial configuration model.
    pub fn new(config: DomainConfig, model: DomainModel) -> Self {
        DomainController {
            inner: Arc::new(Inner {
                domain: Mutex::new(Domain {
                    model,
                    hosts: HostRegistry::new(),
                }),
                registrations: PendingRegistrations::new(),
                ignore: IgnoreRegistry::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &DomainConfig {
        &self.inner.config
    }

    /// Whether a host controller is currently registered under this name.
    pub async fn is_host_registered(&self, name: &str) -> bool {
        self.inner.domain.lock().await.hosts.contains(name)
    }

    /// Names of all registered hosts.
    pub async fn registered_hosts(&self) -> Vec<String> {
        self.inner.domain.lock().await.hosts.names()
    }

    /// Root addresses confirmed delivered to a host, or `None` when the
    /// host is not registered.
    pub async fn known_root_addresses(&self, host: &str) -> Option<BTreeSet<RootAddress>> {
        self.inner
            .domain
            .lock()
            .await
            .hosts
            .get(host)
            .map(|record| record.known_addresses().iter().cloned().collect())
    }

    /// Read a value out of the configuration model.
    pub async fn read_model_value(
        &self,
        address: &ResourceAddress,
    ) -> DomainResult<serde_json::Value> {
        self.inner.domain.lock().await.model.read_value(address)
    }

    /// Explicitly unregister a host and close its connection.
    pub async fn unregister_host(&self, host: &str) -> bool {
        let mut guard = self.inner.domain.lock().await;
        match guard.hosts.remove(host) {
            Some(record) => {
                record.ping().cancel();
                record.proxy().connection().close();
                metrics::REGISTERED_HOSTS.set(guard.hosts.len() as i64);
                tracing::info!(host, "Host controller unregistered");
                true
            }
            None => false,
        }
    }

    /// Execute a read-only operation under the prepare/commit contract.
    ///
    /// The prepare phase runs under the domain lock; the lock is released
    /// before `control.operation_prepared` runs, because a control may span
    /// a network roundtrip (registration does). Mutating operations go
    /// through [`execute_domain_operation`](Self::execute_domain_operation),
    /// which keeps the lock for its whole span instead.
    pub async fn execute_with_control(
        &self,
        op: &Operation,
        control: &dyn TransactionControl,
    ) -> DomainResult<(TxOutcome, OperationResult)> {
        let result = {
            let guard = self.inner.domain.lock().await;
            // Apply against a clone so a failed read leaves nothing behind.
            let mut staged = guard.model.clone();
            match staged.apply(op) {
                Ok(value) => OperationResult::success(value),
                Err(e) => OperationResult::failed(e.to_string()),
            }
        };

        let (tx, decision) = model::prepared_pair();
        control.operation_prepared(tx, &result).await;
        let outcome = decision.await.unwrap_or(TxOutcome::Rollback);
        Ok((outcome, result))
    }

    /// Execute a configuration-changing operation: apply it to the model,
    /// work out which hosts newly need which resources, forward it (with
    /// piggybacked resources) to every host that must see it, and commit or
    /// roll back the whole thing atomically.
    pub async fn execute_domain_operation(&self, op: Operation) -> DomainResult<OperationResult> {
        let mut guard = self.inner.domain.lock().await;
        let mut ctx = OperationContext::new();

        tracing::debug!(
            operation_id = %ctx.id,
            op = %op.name,
            address = %op.address,
            "Executing domain operation"
        );

        // Prepare against staged state; the live model is untouched until
        // the commit point below.
        let mut staged = guard.model.clone();
        let value = match staged.apply(&op) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(operation_id = %ctx.id, error = %e, "Operation failed locally");
                return Ok(OperationResult::failed(e.to_string()));
            }
        };

        self.record_missing_resources(&guard.hosts, &mut ctx, &op);

        let failure = if is_mutating(&op) {
            self.forward_to_hosts(&guard.hosts, &staged, &mut ctx, &op).await
        } else {
            None
        };

        match failure {
            None => {
                guard.model = staged;
                ctx.run_commit_actions(&mut guard.hosts);
                Ok(OperationResult::success(value))
            }
            Some(e) => {
                // Rollback: staged model and context (with its missing-set)
                // are dropped; no host's known-set moves.
                tracing::info!(op = %op.name, error = %e, "Domain operation rolled back");
                Ok(OperationResult::failed(e.to_string()))
            }
        }
    }

    /// Point a server group at a different profile.
    pub async fn change_server_group_profile(
        &self,
        group: &str,
        profile: &str,
    ) -> DomainResult<OperationResult> {
        let op = Operation::new(ops::WRITE_ATTRIBUTE, ResourceAddress::of(SERVER_GROUP, group))
            .with_param("name", PROFILE)
            .with_param("value", profile);
        self.execute_domain_operation(op).await
    }

    /// Point a server group at a different socket binding group.
    pub async fn change_server_group_socket_binding_group(
        &self,
        group: &str,
        binding_group: &str,
    ) -> DomainResult<OperationResult> {
        let op = Operation::new(ops::WRITE_ATTRIBUTE, ResourceAddress::of(SERVER_GROUP, group))
            .with_param("name", SOCKET_BINDING_GROUP)
            .with_param("value", binding_group);
        self.execute_domain_operation(op).await
    }

    /// Server-group retargeting obliges hosts to learn the new target.
    fn record_missing_resources(
        &self,
        hosts: &HostRegistry,
        ctx: &mut OperationContext,
        op: &Operation,
    ) {
        if op.name != ops::WRITE_ATTRIBUTE {
            return;
        }
        let Some(root) = op.address.as_root() else {
            return;
        };
        if root.kind != SERVER_GROUP {
            return;
        }
        let (Some(attribute), Some(value)) = (op.str_param("name"), op.str_param("value")) else {
            return;
        };
        match attribute {
            PROFILE => {
                self.inner
                    .ignore
                    .change_server_group_profile(hosts, ctx, &root.name, value);
            }
            SOCKET_BINDING_GROUP => {
                self.inner.ignore.change_server_group_socket_binding_group(
                    hosts,
                    ctx,
                    &root.name,
                    value,
                );
            }
            _ => {}
        }
    }

    /// Forward an operation to every registered host that must see it.
    /// Returns the first failure; no retries, no partial tolerance.
    async fn forward_to_hosts(
        &self,
        hosts: &HostRegistry,
        staged: &DomainModel,
        ctx: &mut OperationContext,
        op: &Operation,
    ) -> Option<DomainError> {
        for host in hosts.names() {
            let (outbound, proxy) = {
                let Some(record) = hosts.get(&host) else {
                    continue;
                };
                if self.inner.ignore.ignore_resource(
                    record.info(),
                    record.known_addresses(),
                    &op.address,
                ) {
                    tracing::debug!(host = %host, address = %op.address, "Operation omitted for host");
                    continue;
                }

                let mut outbound =
                    OutboundOperation::new(record.proxy().transformers().transform_operation(op));
                if let Err(e) = self.inner.ignore.piggy_back_missing_information(
                    staged,
                    record,
                    ctx,
                    &mut outbound,
                ) {
                    return Some(e);
                }
                (outbound, record.proxy().clone())
            };

            match proxy.execute(&outbound).await {
                Ok(result) if result.is_success() => {}
                Ok(result) => {
                    return Some(DomainError::RemoteFailure(
                        host,
                        result
                            .failure_description
                            .unwrap_or_else(|| "remote operation failed".to_string()),
                    ));
                }
                Err(e) => return Some(e),
            }
        }
        None
    }

    /// Install the per-host state for a committed registration.
    ///
    /// Re-checks the registration race under the lock: between the snapshot
    /// going out and the COMPLETE coming back, another attempt could have
    /// won the name.
    async fn install_host(
        &self,
        info: &HostInfo,
        connection: &Arc<ConnectionHandle>,
    ) -> DomainResult<()> {
        let ping = PingState::new();
        {
            let mut guard = self.inner.domain.lock().await;
            if guard.hosts.contains(&info.name) {
                return Err(DomainError::HostAlreadyExists(info.name.clone()));
            }
            let proxy =
                ProxyController::new(&info.name, connection.clone(), info.management_version);
            let record = HostRecord::new(info.clone(), proxy, ping.clone());
            guard.hosts.insert(record)?;
            connection.bind_identity(&info.name);
            metrics::REGISTERED_HOSTS.set(guard.hosts.len() as i64);
        }

        HeartbeatMonitor::new(&info.name, connection.clone(), ping, &self.inner.config).spawn();
        tracing::info!(
            host = %info.name,
            version = %info.management_version,
            "Host controller registered"
        );
        Ok(())
    }

    /// Tear down a host's state if it is still bound to this connection.
    ///
    /// The connection-identity check keeps a stale close (old socket dying
    /// late) from tearing down a newer registration of the same name.
    async fn teardown_host(&self, host: &str, connection: uuid::Uuid, reason: &str) -> bool {
        let mut guard = self.inner.domain.lock().await;
        let owned = guard
            .hosts
            .get(host)
            .map(|record| record.proxy().connection().id() == connection)
            .unwrap_or(false);
        if !owned {
            return false;
        }
        if let Some(record) = guard.hosts.remove(host) {
            record.ping().cancel();
            record.proxy().connection().close();
            metrics::REGISTERED_HOSTS.set(guard.hosts.len() as i64);
            tracing::info!(host, reason, "Host controller unregistered");
            return true;
        }
        false
    }
}

fn is_mutating(op: &Operation) -> bool {
    matches!(
        op.name.as_str(),
        ops::ADD | ops::REMOVE | ops::WRITE_ATTRIBUTE
    )
}

/// Transaction control driving the registration handshake.
///
/// `operation_prepared` runs with the local read-domain-model transaction
/// prepared but not committed: it sends the snapshot, parks on the one-shot
/// completion signal, and decides commit or rollback from what the host
/// (or the connection's death) reports.
struct RegistrationControl {
    controller: DomainController,
    connection: Arc<ConnectionHandle>,
    correlation_id: CorrelationId,
    info: HostInfo,
    attempt: Arc<registration::PendingRegistration>,
    completion: std::sync::Mutex<Option<tokio::sync::oneshot::Receiver<CompletionSignal>>>,
    seen: std::sync::Mutex<Option<CompletionSignal>>,
}

impl RegistrationControl {
    fn last_signal(&self) -> Option<CompletionSignal> {
        self.seen.lock().expect("signal lock poisoned").clone()
    }

    async fn fail(&self, tx: PreparedTransaction, code: MgmtErrorCode, message: &str) {
        let _ = self
            .connection
            .send_response(WireResponse::error(self.correlation_id, code, message))
            .await;
        self.attempt.transition(RegistrationState::Failed);
        tx.rollback();
    }
}

#[async_trait]
impl TransactionControl for RegistrationControl {
    async fn operation_prepared(&self, tx: PreparedTransaction, result: &OperationResult) {
        let host = self.info.name.clone();

        if !result.is_success() {
            let message = result
                .failure_description
                .clone()
                .unwrap_or_else(|| "failed to read domain model".to_string());
            self.fail(tx, MgmtErrorCode::RegistrationFailed, &message).await;
            return;
        }

        // Serialize and send the snapshot while the local transaction stays
        // prepared; the roundtrip to the host happens before we commit.
        let snapshot = match serde_json::to_vec(&result.result) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(tx, MgmtErrorCode::RegistrationFailed, &e.to_string())
                    .await;
                return;
            }
        };
        if self
            .connection
            .send_response(WireResponse::ok(self.correlation_id, snapshot))
            .await
            .is_err()
        {
            self.attempt.transition(RegistrationState::Failed);
            tx.rollback();
            return;
        }
        self.attempt.transition(RegistrationState::ModelSent);
        tracing::debug!(host = %host, "Snapshot sent, awaiting host-side outcome");

        let receiver = self
            .completion
            .lock()
            .expect("completion lock poisoned")
            .take();
        let signal = match receiver {
            Some(rx) => rx.await.unwrap_or(CompletionSignal::ConnectionFailed),
            None => CompletionSignal::ConnectionFailed,
        };
        *self.seen.lock().expect("signal lock poisoned") = Some(signal.clone());

        match signal {
            CompletionSignal::Commit => {
                match self.controller.install_host(&self.info, &self.connection).await {
                    Ok(()) => {
                        self.attempt.transition(RegistrationState::Committed);
                        tx.commit();
                    }
                    Err(e) => {
                        tracing::warn!(host = %host, error = %e, "Registration lost the race at commit");
                        self.attempt.transition(RegistrationState::Failed);
                        tx.rollback();
                    }
                }
            }
            CompletionSignal::Rollback { message } => {
                tracing::info!(
                    host = %host,
                    message = message.as_deref().unwrap_or(""),
                    "Host rolled back the snapshot"
                );
                self.attempt.transition(RegistrationState::Failed);
                tx.rollback();
            }
            CompletionSignal::ConnectionFailed => {
                tracing::info!(host = %host, "Connection failed during registration");
                self.attempt.transition(RegistrationState::Failed);
                tx.rollback();
            }
        }
    }
}

#[async_trait]
impl Handler for DomainController {
    async fn handle_register(&self, ctx: &RequestContext, info: HostInfo) -> Reply {
        let host = info.name.clone();
        tracing::info!(
            host = %host,
            version = %info.management_version,
            client = %ctx.client_addr,
            "Host controller registration initiated"
        );

        if info.management_version < self.inner.config.min_management_version {
            metrics::REGISTRATION_ATTEMPTS
                .with_label_values(&["unsupported_version"])
                .inc();
            let err = DomainError::UnsupportedVersion(info.management_version);
            return Reply::error(err.to_code(), err.to_string());
        }

        // INITIATED: reject duplicates before touching shared state.
        if self.is_host_registered(&host).await {
            metrics::REGISTRATION_ATTEMPTS
                .with_label_values(&["conflict"])
                .inc();
            let err = DomainError::HostAlreadyExists(host);
            return Reply::error(err.to_code(), err.to_string());
        }

        let (pending, completion) = match self
            .inner
            .registrations
            .claim(&host, ctx.connection.id())
        {
            Ok(claimed) => claimed,
            Err(e) => {
                metrics::REGISTRATION_ATTEMPTS
                    .with_label_values(&["conflict"])
                    .inc();
                return Reply::error(e.to_code(), e.to_string());
            }
        };
        ctx.connection.bind_identity(&host);

        let control = RegistrationControl {
            controller: self.clone(),
            connection: ctx.connection.clone(),
            correlation_id: ctx.correlation_id,
            info,
            attempt: pending.share(),
            completion: std::sync::Mutex::new(Some(completion)),
            seen: std::sync::Mutex::new(None),
        };

        let read = Operation::new(ops::READ_DOMAIN_MODEL, ResourceAddress::root());
        if let Err(e) = self.execute_with_control(&read, &control).await {
            pending.transition(RegistrationState::Failed);
            metrics::REGISTRATION_ATTEMPTS
                .with_label_values(&["failed"])
                .inc();
            return Reply::error(e.to_code(), e.to_string());
        }

        match (pending.state(), control.last_signal()) {
            (RegistrationState::Committed, _) => {
                metrics::REGISTRATION_ATTEMPTS
                    .with_label_values(&["committed"])
                    .inc();
            }
            (_, Some(CompletionSignal::Rollback { .. })) => {
                metrics::REGISTRATION_ATTEMPTS
                    .with_label_values(&["rolled_back"])
                    .inc();
            }
            _ => {
                metrics::REGISTRATION_ATTEMPTS
                    .with_label_values(&["failed"])
                    .inc();
            }
        }

        // The snapshot (or an error) already went out mid-handshake.
        Reply::Sent
    }

    async fn handle_complete(&self, ctx: &RequestContext, data: CompletionData) -> Reply {
        let Some(host) = ctx.connection.identity() else {
            return Reply::error(
                MgmtErrorCode::ProtocolViolation,
                "completion without a registration in flight",
            );
        };
        let Some(pending) = self
            .inner
            .registrations
            .enter(&host, ctx.connection.id())
        else {
            return Reply::error(
                MgmtErrorCode::ProtocolViolation,
                format!("no registration in flight for `{}`", host),
            );
        };

        let signal = match data.outcome {
            CompletionOutcome::Commit => CompletionSignal::Commit,
            CompletionOutcome::Rollback => CompletionSignal::Rollback {
                message: data.message,
            },
        };

        if pending.complete(signal) {
            Reply::ok_empty()
        } else {
            Reply::error(
                MgmtErrorCode::ProtocolViolation,
                format!("registration of `{}` already completed", host),
            )
        }
    }

    async fn handle_unregister(&self, ctx: &RequestContext, data: UnregisterData) -> Reply {
        let Some(host) = ctx.connection.identity() else {
            return Reply::error(
                MgmtErrorCode::ProtocolViolation,
                "connection has no registered host",
            );
        };
        tracing::info!(
            host = %host,
            reason = data.reason.as_deref().unwrap_or(""),
            "Host controller unregistering"
        );
        // Acknowledge before teardown closes the connection underneath the
        // response.
        let _ = ctx
            .connection
            .send_response(WireResponse::ok_empty(ctx.correlation_id))
            .await;
        self.teardown_host(&host, ctx.connection.id(), "unregistered")
            .await;
        Reply::Sent
    }

    async fn connection_closed(&self, connection: &ConnectionHandle) {
        let Some(host) = connection.identity() else {
            return;
        };
        // A registration parked on this connection must be released first,
        // so its worker never outlives the socket.
        if let Some(pending) = self.inner.registrations.enter(&host, connection.id()) {
            pending.cancel();
        }
        self.teardown_host(&host, connection.id(), "connection closed")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded_controller() -> DomainController {
        let mut model = DomainModel::new();
        model
            .add_resource(ResourceAddress::of(PROFILE, "default"), serde_json::Map::new())
            .unwrap();
        model
            .add_resource(ResourceAddress::of(PROFILE, "prod"), serde_json::Map::new())
            .unwrap();
        model
            .add_resource(ResourceAddress::of(SERVER_GROUP, "sg1"), serde_json::Map::new())
            .unwrap();
        DomainController::new(DomainConfig::default(), model)
    }

    #[tokio::test]
    async fn fresh_controller_has_no_hosts() {
        let controller = seeded_controller();
        assert!(!controller.is_host_registered("hc01").await);
        assert!(controller.registered_hosts().await.is_empty());
        assert!(controller.known_root_addresses("hc01").await.is_none());
        assert!(!controller.unregister_host("hc01").await);
    }

    #[tokio::test]
    async fn local_operation_commits_into_model() {
        let controller = seeded_controller();
        let result = controller
            .change_server_group_profile("sg1", "prod")
            .await
            .unwrap();
        assert!(result.is_success());

        let value = controller
            .read_model_value(&ResourceAddress::of(SERVER_GROUP, "sg1"))
            .await
            .unwrap();
        assert_eq!(value["attributes"]["profile"], json!("prod"));
    }

    #[tokio::test]
    async fn failed_operation_leaves_model_untouched() {
        let controller = seeded_controller();
        let result = controller
            .execute_domain_operation(Operation::new(
                ops::REMOVE,
                ResourceAddress::of(PROFILE, "absent"),
            ))
            .await
            .unwrap();
        assert!(!result.is_success());

        // The staged mutation was dropped; existing resources are intact.
        assert!(
            controller
                .read_model_value(&ResourceAddress::of(PROFILE, "default"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn read_operations_do_not_forward() {
        let controller = seeded_controller();
        let result = controller
            .execute_domain_operation(
                Operation::new(ops::READ_ATTRIBUTE, ResourceAddress::of(SERVER_GROUP, "sg1"))
                    .with_param("name", "profile"),
            )
            .await
            .unwrap();
        assert!(result.is_success());
    }

    #[test]
    fn mutation_classification() {
        assert!(is_mutating(&Operation::new(
            ops::ADD,
            ResourceAddress::of(PROFILE, "x")
        )));
        assert!(is_mutating(&Operation::new(
            ops::WRITE_ATTRIBUTE,
            ResourceAddress::of(SERVER_GROUP, "x")
        )));
        assert!(!is_mutating(&Operation::new(
            ops::READ_DOMAIN_MODEL,
            ResourceAddress::root()
        )));
    }
}
