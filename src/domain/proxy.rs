//! Proxy controllers and cross-version transformers.
//!
//! A [`ProxyController`] makes a registered host look like a locally
//! executable operation target: the master hands it an operation, the proxy
//! ships it over the host's connection and decodes the result. The
//! [`Transformers`] strategy in between rewrites operations and resources
//! when the two sides speak different management versions.

use std::sync::Arc;

use serde_json::Value;

use crate::protocol::Op;
use crate::server::ConnectionHandle;
use crate::types::ManagementVersion;

use super::error::{DomainError, DomainResult};
use super::metrics;
use super::model::{OperationResult, Operation, OutboundOperation, ResourceAddress, RootAddress};

/// Version-compatibility seam between master and host model versions.
pub trait Transformers: Send + Sync {
    /// Rewrite an operation for the proxy boundary.
    fn transform_operation(&self, operation: &Operation) -> Operation;

    /// Rewrite a resource model being delivered to the host.
    fn transform_resource(&self, address: &RootAddress, model: &Value) -> Value;
}

/// Pass-through used when both sides share the current model version.
pub struct IdentityTransformers;

impl Transformers for IdentityTransformers {
    fn transform_operation(&self, operation: &Operation) -> Operation {
        operation.clone()
    }

    fn transform_resource(&self, _address: &RootAddress, model: &Value) -> Value {
        model.clone()
    }
}

/// Transformer chain for hosts on an older major management version.
///
/// Rewrites the address for the proxy boundary (a leading `host=<name>`
/// element is the proxy's own position and is stripped before sending) and
/// downgrades attribute names the old version knows under different keys.
pub struct LegacyTransformers {
    target: ManagementVersion,
}

impl LegacyTransformers {
    pub fn new(target: ManagementVersion) -> Self {
        LegacyTransformers { target }
    }

    pub fn target(&self) -> ManagementVersion {
        self.target
    }

    fn downgrade_key(&self, key: &str) -> String {
        // 2.x hosts predate the socket-binding-group attribute rename.
        if self.target.major < 3 && key == "socket-binding-group" {
            "socket-binding-ref".to_string()
        } else {
            key.to_string()
        }
    }
}

impl Transformers for LegacyTransformers {
    fn transform_operation(&self, operation: &Operation) -> Operation {
        let elements: Vec<RootAddress> = operation
            .address
            .0
            .iter()
            .enumerate()
            .filter(|(index, element)| !(*index == 0 && element.kind == "host"))
            .map(|(_, element)| element.clone())
            .collect();

        let mut params = serde_json::Map::new();
        for (key, value) in &operation.params {
            let key = self.downgrade_key(key);
            // write-attribute targets are renamed like plain keys
            let value = match (key.as_str(), value.as_str()) {
                ("name", Some(target)) => Value::String(self.downgrade_key(target)),
                _ => value.clone(),
            };
            params.insert(key, value);
        }

        Operation {
            name: operation.name.clone(),
            address: ResourceAddress(elements),
            params,
        }
    }

    fn transform_resource(&self, _address: &RootAddress, model: &Value) -> Value {
        match model {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    if key == "attributes" {
                        if let Value::Object(attrs) = value {
                            let mut downgraded =
                                serde_json::Map::with_capacity(attrs.len());
                            for (attr, attr_value) in attrs {
                                downgraded
                                    .insert(self.downgrade_key(attr), attr_value.clone());
                            }
                            out.insert(key.clone(), Value::Object(downgraded));
                            continue;
                        }
                    }
                    out.insert(key.clone(), value.clone());
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }
}

/// Pick the transformer chain for a host's advertised version.
pub fn transformers_for(version: ManagementVersion) -> Arc<dyn Transformers> {
    if version.needs_transformation() {
        Arc::new(LegacyTransformers::new(version))
    } else {
        Arc::new(IdentityTransformers)
    }
}

/// A registered host as a remotely executable operation target.
///
/// Cheap to clone; all fields are shared.
#[derive(Clone)]
pub struct ProxyController {
    host_name: Arc<str>,
    connection: Arc<ConnectionHandle>,
    transformers: Arc<dyn Transformers>,
}

impl ProxyController {
    pub fn new(
        host_name: &str,
        connection: Arc<ConnectionHandle>,
        version: ManagementVersion,
    ) -> Self {
        ProxyController {
            host_name: Arc::from(host_name),
            connection,
            transformers: transformers_for(version),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.connection
    }

    pub fn transformers(&self) -> &Arc<dyn Transformers> {
        &self.transformers
    }

    /// Forward an already-transformed operation to the host and decode the
    /// result.
    ///
    /// No per-call timeout: a stalled call is resolved only by the
    /// connection closing, which the heartbeat monitor takes care of.
    pub async fn execute(&self, outbound: &OutboundOperation) -> DomainResult<OperationResult> {
        let body = serde_json::to_vec(outbound)?;
        let (code, reply) = self
            .connection
            .call(Op::ExecuteOperation, body)
            .await
            .map_err(DomainError::from)?;

        if !code.is_ok() {
            metrics::FORWARDED_OPERATIONS
                .with_label_values(&["rejected"])
                .inc();
            return Err(DomainError::RemoteFailure(
                self.host_name.to_string(),
                code.as_str().to_string(),
            ));
        }

        let result: OperationResult = serde_json::from_slice(&reply)?;
        let label = if result.is_success() { "success" } else { "failed" };
        metrics::FORWARDED_OPERATIONS.with_label_values(&[label]).inc();
        Ok(result)
    }
}
