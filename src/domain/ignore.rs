//! Ignore policy and missing-resource propagation.
//!
//! Hosts declare resource types they never mirror, and only learn
//! unused-configuration resources (profiles, socket binding groups,
//! extensions) on demand. This module decides what a host may skip, records
//! what a change newly obliges a host to know, and piggybacks those
//! resources onto the next operation forwarded to it.
//!
//! Correctness hinges on one rule: a host's known-address set only grows
//! when the operation that delivered the resources commits. The missing-set
//! lives on the operation context and is dropped wholesale on rollback.

use std::collections::HashSet;

use crate::constants::{SERVER_GROUP, UNUSED_CONFIG_TYPES};
use crate::protocol::HostInfo;

use super::error::DomainResult;
use super::metrics;
use super::model::{
    DomainModel, OperationContext, OutboundOperation, RequiredResource, ResourceAddress,
    RootAddress,
};
use super::registry::{HostRecord, HostRegistry};

/// Decides per-host resource visibility and accumulates missing-resource
/// deltas on operation contexts.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreRegistry;

impl IgnoreRegistry {
    pub fn new() -> Self {
        IgnoreRegistry
    }

    /// Whether a resource at `address` can be omitted when forwarding to a
    /// host with the given declarations and known set.
    ///
    /// Only root-level addresses are ever eligible: anything deeper lives
    /// inside a resource the host already holds. A root child is omitted
    /// when the declared policy covers it, or when it is unused
    /// configuration the host has not yet been given (it will be
    /// piggybacked once a change makes it relevant).
    pub fn ignore_resource(
        &self,
        info: &HostInfo,
        known: &HashSet<RootAddress>,
        address: &ResourceAddress,
    ) -> bool {
        let Some(root) = address.as_root() else {
            return false;
        };
        if info.ignores(&root.kind, &root.name) {
            return true;
        }
        UNUSED_CONFIG_TYPES.contains(&root.kind.as_str()) && !known.contains(root)
    }

    /// Record that a server group's profile changed.
    ///
    /// Every registered host that does not ignore the group and does not
    /// already hold the profile must receive it with this operation.
    pub fn change_server_group_profile(
        &self,
        registry: &HostRegistry,
        ctx: &mut OperationContext,
        group: &str,
        profile: &str,
    ) {
        self.require_for_group(registry, ctx, group, RootAddress::new("profile", profile));
    }

    /// Record that a server group's socket binding group changed.
    pub fn change_server_group_socket_binding_group(
        &self,
        registry: &HostRegistry,
        ctx: &mut OperationContext,
        group: &str,
        binding_group: &str,
    ) {
        self.require_for_group(
            registry,
            ctx,
            group,
            RootAddress::new("socket-binding-group", binding_group),
        );
    }

    fn require_for_group(
        &self,
        registry: &HostRegistry,
        ctx: &mut OperationContext,
        group: &str,
        address: RootAddress,
    ) {
        for record in registry.iter() {
            // The known-set is empty right after registration, so group
            // relevance is judged by declared policy alone.
            if record.info().ignores(SERVER_GROUP, group) {
                continue;
            }
            // A host that declared the target itself ignored never gets it.
            if record.info().ignores(&address.kind, &address.name) {
                continue;
            }
            if record.knows(&address) {
                continue;
            }
            tracing::debug!(
                host = record.name(),
                address = %address,
                group,
                "Host requires resource for server-group change"
            );
            ctx.missing_for_mut(record.name()).insert(address.clone());
        }
    }

    /// Attach a host's accumulated missing resources to an operation about
    /// to be forwarded to it, and arrange for the known-set merge if the
    /// enclosing operation commits.
    pub fn piggy_back_missing_information(
        &self,
        model: &DomainModel,
        record: &HostRecord,
        ctx: &mut OperationContext,
        outbound: &mut OutboundOperation,
    ) -> DomainResult<()> {
        let Some(missing) = ctx.missing_for(record.name()) else {
            return Ok(());
        };
        if missing.is_empty() {
            return Ok(());
        }

        let transformers = record.proxy().transformers().clone();
        for address in missing {
            let value =
                model.read_value(&ResourceAddress(vec![address.clone()]))?;
            outbound.required_resources.push(RequiredResource {
                address: address.clone(),
                model: transformers.transform_resource(address, &value),
            });
        }

        metrics::PIGGYBACKED_RESOURCES.inc_by(missing.len() as u64);
        tracing::debug!(
            host = record.name(),
            resources = missing.len(),
            "Piggybacking missing resources onto outbound operation"
        );

        let host = record.name().to_string();
        let delivered: Vec<RootAddress> = missing.iter().cloned().collect();
        ctx.add_commit_action(move |registry| {
            if let Some(record) = registry.get_mut(&host) {
                record.merge_known_addresses(delivered);
            }
        });

        Ok(())
    }
}
