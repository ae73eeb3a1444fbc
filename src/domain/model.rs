//! In-memory configuration model and the operation execution contract.
//!
//! The model is a tree of resources addressed by `(type, name)` path
//! elements. All reads and writes happen under the single domain lock owned
//! by the controller; this module only defines the data and the
//! prepare/commit/rollback contract, not the locking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use super::error::{DomainError, DomainResult};
use super::registry::HostRegistry;

/// A `(resource type, name)` pair identifying a child of some node.
///
/// At the domain root these are the units of delta tracking: a host either
/// holds a root child or it does not.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RootAddress {
    pub kind: String,
    pub name: String,
}

impl RootAddress {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        RootAddress {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RootAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind, self.name)
    }
}

/// A position in the configuration resource tree.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceAddress(pub Vec<RootAddress>);

impl ResourceAddress {
    /// The domain root itself.
    pub fn root() -> Self {
        ResourceAddress(Vec::new())
    }

    /// A single-level address directly under the root.
    pub fn of(kind: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceAddress(vec![RootAddress::new(kind, name)])
    }

    /// Extend the address by one element.
    pub fn child(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.0.push(RootAddress::new(kind, name));
        self
    }

    /// The single element of a root-level address, if it is one.
    pub fn as_root(&self) -> Option<&RootAddress> {
        match self.0.as_slice() {
            [element] => Some(element),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First element of the address, if any.
    pub fn first(&self) -> Option<&RootAddress> {
        self.0.first()
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for element in &self.0 {
            write!(f, "/{}", element)?;
        }
        Ok(())
    }
}

/// Operation names understood by the local model.
pub mod ops {
    pub const ADD: &str = "add";
    pub const REMOVE: &str = "remove";
    pub const WRITE_ATTRIBUTE: &str = "write-attribute";
    pub const READ_ATTRIBUTE: &str = "read-attribute";
    pub const READ_RESOURCE: &str = "read-resource";
    pub const READ_DOMAIN_MODEL: &str = "read-domain-model";
}

/// A management operation against the configuration model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub address: ResourceAddress,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

impl Operation {
    pub fn new(name: impl Into<String>, address: ResourceAddress) -> Self {
        Operation {
            name: name.into(),
            address,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }
}

/// Outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationOutcome {
    Success,
    Failed,
}

/// Result of executing an operation, locally or on a remote host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub outcome: OperationOutcome,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_description: Option<String>,
}

impl OperationResult {
    pub fn success(result: Value) -> Self {
        OperationResult {
            outcome: OperationOutcome::Success,
            result,
            failure_description: None,
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        OperationResult {
            outcome: OperationOutcome::Failed,
            result: Value::Null,
            failure_description: Some(description.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == OperationOutcome::Success
    }
}

/// An operation forwarded to a host controller, together with any resources
/// that host newly needs in order to apply it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundOperation {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_resources: Vec<RequiredResource>,
}

impl OutboundOperation {
    pub fn new(operation: Operation) -> Self {
        OutboundOperation {
            operation,
            required_resources: Vec::new(),
        }
    }
}

/// A piggybacked resource a host must learn before applying an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredResource {
    pub address: RootAddress,
    pub model: Value,
}

/// One node of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
    /// Children keyed by resource type, then name.
    #[serde(default)]
    pub children: BTreeMap<String, BTreeMap<String, ResourceNode>>,
}

impl ResourceNode {
    /// Follow an address down from this node.
    pub fn navigate(&self, address: &ResourceAddress) -> Option<&ResourceNode> {
        let mut node = self;
        for element in &address.0 {
            node = node.children.get(&element.kind)?.get(&element.name)?;
        }
        Some(node)
    }

    fn navigate_mut(&mut self, address: &ResourceAddress) -> Option<&mut ResourceNode> {
        let mut node = self;
        for element in &address.0 {
            node = node
                .children
                .get_mut(&element.kind)?
                .get_mut(&element.name)?;
        }
        Some(node)
    }
}

/// The authoritative configuration model of the domain.
#[derive(Debug, Clone, Default)]
pub struct DomainModel {
    root: ResourceNode,
}

impl DomainModel {
    pub fn new() -> Self {
        DomainModel::default()
    }

    pub fn from_root(root: ResourceNode) -> Self {
        DomainModel { root }
    }

    pub fn root(&self) -> &ResourceNode {
        &self.root
    }

    /// Read the node at an address.
    pub fn read(&self, address: &ResourceAddress) -> Option<&ResourceNode> {
        self.root.navigate(address)
    }

    /// Read the node at an address as a JSON value.
    pub fn read_value(&self, address: &ResourceAddress) -> DomainResult<Value> {
        let node = self
            .read(address)
            .ok_or_else(|| DomainError::NoSuchResource(address.clone()))?;
        Ok(serde_json::to_value(node)?)
    }

    /// Serialize the full model, the registration snapshot payload.
    pub fn snapshot(&self) -> DomainResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.root)?)
    }

    /// Convenience for seeding a model outside of operation execution.
    pub fn add_resource(
        &mut self,
        address: ResourceAddress,
        attributes: serde_json::Map<String, Value>,
    ) -> DomainResult<()> {
        let mut op = Operation::new(ops::ADD, address);
        op.params = attributes;
        self.apply(&op).map(|_| ())
    }

    /// Apply an operation to the model, returning its result value.
    pub fn apply(&mut self, op: &Operation) -> DomainResult<Value> {
        match op.name.as_str() {
            ops::READ_DOMAIN_MODEL => Ok(serde_json::to_value(&self.root)?),
            ops::READ_RESOURCE => self.read_value(&op.address),
            ops::READ_ATTRIBUTE => {
                let name = op
                    .str_param("name")
                    .ok_or(DomainError::MissingParameter("name"))?;
                let node = self
                    .read(&op.address)
                    .ok_or_else(|| DomainError::NoSuchResource(op.address.clone()))?;
                Ok(node.attributes.get(name).cloned().unwrap_or(Value::Null))
            }
            ops::ADD => {
                let Some((last, parents)) = op.address.0.split_last() else {
                    return Err(DomainError::DuplicateResource(op.address.clone()));
                };
                let parent_address = ResourceAddress(parents.to_vec());
                let parent = self
                    .root
                    .navigate_mut(&parent_address)
                    .ok_or(DomainError::NoSuchResource(parent_address))?;
                let siblings = parent.children.entry(last.kind.clone()).or_default();
                if siblings.contains_key(&last.name) {
                    return Err(DomainError::DuplicateResource(op.address.clone()));
                }
                siblings.insert(
                    last.name.clone(),
                    ResourceNode {
                        attributes: op.params.clone(),
                        children: BTreeMap::new(),
                    },
                );
                Ok(Value::Null)
            }
            ops::REMOVE => {
                let Some((last, parents)) = op.address.0.split_last() else {
                    return Err(DomainError::NoSuchResource(op.address.clone()));
                };
                let parent_address = ResourceAddress(parents.to_vec());
                let parent = self
                    .root
                    .navigate_mut(&parent_address)
                    .ok_or_else(|| DomainError::NoSuchResource(op.address.clone()))?;
                let removed = parent
                    .children
                    .get_mut(&last.kind)
                    .and_then(|siblings| siblings.remove(&last.name));
                if removed.is_none() {
                    return Err(DomainError::NoSuchResource(op.address.clone()));
                }
                Ok(Value::Null)
            }
            ops::WRITE_ATTRIBUTE => {
                let name = op
                    .str_param("name")
                    .ok_or(DomainError::MissingParameter("name"))?;
                let value = op
                    .param("value")
                    .ok_or(DomainError::MissingParameter("value"))?
                    .clone();
                let node = self
                    .root
                    .navigate_mut(&op.address)
                    .ok_or_else(|| DomainError::NoSuchResource(op.address.clone()))?;
                node.attributes.insert(name.to_string(), value);
                Ok(Value::Null)
            }
            other => Err(DomainError::NoSuchOperation(other.to_string())),
        }
    }
}

/// Outcome decided for a prepared operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Commit,
    Rollback,
}

/// Handle to a prepared-but-uncommitted operation.
///
/// Handed to the [`TransactionControl`] during the prepare phase; dropping
/// it without deciding counts as rollback.
pub struct PreparedTransaction {
    tx: oneshot::Sender<TxOutcome>,
}

impl PreparedTransaction {
    pub fn commit(self) {
        let _ = self.tx.send(TxOutcome::Commit);
    }

    pub fn rollback(self) {
        let _ = self.tx.send(TxOutcome::Rollback);
    }
}

/// Create a prepared-transaction handle and the receiver the execution
/// engine awaits the decision on.
pub(crate) fn prepared_pair() -> (PreparedTransaction, oneshot::Receiver<TxOutcome>) {
    let (tx, rx) = oneshot::channel();
    (PreparedTransaction { tx }, rx)
}

/// Transaction control contract for operation execution.
///
/// The control is called exactly once, between prepare and commit; whatever
/// it does with the prepared transaction decides the operation's fate.
#[async_trait]
pub trait TransactionControl: Send + Sync {
    async fn operation_prepared(&self, tx: PreparedTransaction, result: &OperationResult);
}

/// Per-operation execution context.
///
/// Carries the missing-resource bookkeeping and the callbacks that run only
/// if the operation commits. Dropped wholesale on rollback, so nothing in
/// it can leak into per-host state.
pub struct OperationContext {
    pub id: uuid::Uuid,
    missing: Option<HashMap<String, BTreeSet<RootAddress>>>,
    on_commit: Vec<Box<dyn FnOnce(&mut HostRegistry) + Send>>,
}

impl OperationContext {
    pub fn new() -> Self {
        OperationContext {
            id: uuid::Uuid::new_v4(),
            missing: None,
            on_commit: Vec::new(),
        }
    }

    /// The set of addresses `host` newly must know, created on first use so
    /// every step of a batched operation extends the same set.
    pub fn missing_for_mut(&mut self, host: &str) -> &mut BTreeSet<RootAddress> {
        self.missing
            .get_or_insert_with(HashMap::new)
            .entry(host.to_string())
            .or_default()
    }

    pub fn missing_for(&self, host: &str) -> Option<&BTreeSet<RootAddress>> {
        self.missing.as_ref().and_then(|m| m.get(host))
    }

    /// Register a callback to run only if the operation commits.
    pub fn add_commit_action(&mut self, action: impl FnOnce(&mut HostRegistry) + Send + 'static) {
        self.on_commit.push(Box::new(action));
    }

    /// Consume the context, running the commit callbacks.
    pub fn run_commit_actions(self, registry: &mut HostRegistry) {
        for action in self.on_commit {
            action(registry);
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}
