//! Update cluster handler.
//!
//! An update runs in three steps, each write guarded by the version token:
//!
//! 1. record the desired spec and move the entity to `updating`
//! 2. drive the backend: remove surplus nodes, upgrade, add missing nodes
//! 3. record the resulting node list and final phase

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use cse_common::entity::node_ordinal;
use cse_common::{ClusterEntity, ClusterPhase, ClusterSpec, Error, NodeRole, Result, TemplateRef};
use cse_store::EntityStore;

use super::{entity_payload, write_with_retry, ReconcilerContext};
use crate::dispatcher::BehaviorHandler;
use crate::message::{BehaviorKind, OperationContext};
use crate::provisioning::{plan_nodes, NodeRequest, NodeSet, ProvisionRequest};
use crate::tracker::TaskResult;

/// Arguments of an update request
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateArgs {
    /// Desired spec; the spec of the entity snapshot is used when absent
    #[serde(default)]
    pub spec: Option<ClusterSpec>,
}

/// Backend steps needed to move a cluster to a new spec
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    /// Nodes to remove, highest ordinals first
    pub remove: Vec<String>,
    /// Nodes to add
    pub add: Vec<NodeRequest>,
    /// New template, if it changed
    pub upgrade: Option<TemplateRef>,
}

impl UpdatePlan {
    /// Diff the observed state of `current` against `desired`
    ///
    /// Scaling down removes the highest-numbered nodes; scaling up numbers new
    /// nodes after the highest existing one. The upgrade is planned from the
    /// template the nodes are recorded to run, so an update retried after its
    /// spec was written still upgrades. An unknown running template is
    /// upgraded unconditionally.
    pub fn between(current: &ClusterEntity, desired: &ClusterSpec) -> Self {
        let mut plan = UpdatePlan::default();

        for (role, want) in [
            (NodeRole::Worker, desired.worker_count),
            (NodeRole::Nfs, desired.nfs_count),
        ] {
            let have = current.status.nodes_with_role(role);
            let want = want as usize;
            if have.len() > want {
                plan.remove
                    .extend(have[want..].iter().rev().map(|n| n.name.clone()));
            } else if have.len() < want {
                let next = have
                    .iter()
                    .filter_map(|n| node_ordinal(&n.name))
                    .max()
                    .unwrap_or(0)
                    + 1;
                plan.add
                    .extend(plan_nodes(role, (want - have.len()) as u32, next));
            }
        }

        if current.status.template.as_ref() != Some(&desired.template) {
            plan.upgrade = Some(desired.template.clone());
        }
        plan
    }

    /// Whether the cluster already matches
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty() && self.upgrade.is_none()
    }
}

/// Resizes or upgrades an existing cluster
pub struct UpdateClusterHandler {
    reconciler: Arc<ReconcilerContext>,
}

impl UpdateClusterHandler {
    /// Create the handler
    pub fn new(reconciler: Arc<ReconcilerContext>) -> Self {
        Self { reconciler }
    }

    async fn apply(&self, store: &dyn EntityStore, entity: &ClusterEntity, plan: &UpdatePlan) -> Result<NodeSet> {
        let backend = &self.reconciler.backend;
        let id = entity.require_id()?;

        if !plan.remove.is_empty() {
            info!(entity_id = %id, nodes = ?plan.remove, "removing nodes");
            backend.remove_nodes(id, &plan.remove).await?;
        }
        if let Some(template) = &plan.upgrade {
            backend.upgrade(id, template).await?;
            let attempts = self.reconciler.config.write_attempts();
            write_with_retry(store, id, attempts, |entity| {
                entity.status.template = Some(template.clone());
                Ok(())
            })
            .await?;
            info!(entity_id = %id, template = %template, "nodes upgraded");
        }
        if plan.add.is_empty() {
            return Ok(NodeSet::default());
        }
        info!(entity_id = %id, count = plan.add.len(), "adding nodes");
        let request = ProvisionRequest::for_nodes(id, &entity.name, &entity.spec, plan.add.clone());
        backend.provision(&request).await
    }
}

fn check_updatable(entity: &ClusterEntity, desired: &ClusterSpec) -> Result<()> {
    match entity.phase() {
        ClusterPhase::Provisioning | ClusterPhase::Deleting | ClusterPhase::DeletingWithErrors => {
            let id = entity.id.as_deref().unwrap_or(&entity.name);
            return Err(Error::not_ready(id, entity.phase()));
        }
        ClusterPhase::Ready | ClusterPhase::ReadyWithError | ClusterPhase::Updating => {}
    }
    if entity.spec.control_plane_count != desired.control_plane_count {
        return Err(Error::validation_for(
            &entity.name,
            "control plane count cannot be changed",
        ));
    }
    if entity.spec.network != desired.network {
        return Err(Error::validation_for(&entity.name, "network cannot be changed"));
    }
    Ok(())
}

#[async_trait]
impl BehaviorHandler for UpdateClusterHandler {
    fn kind(&self) -> BehaviorKind {
        BehaviorKind::UpdateCluster
    }

    async fn handle(&self, ctx: &OperationContext) -> Result<TaskResult> {
        let args: UpdateArgs = ctx.arguments()?;
        let desired = match args.spec {
            Some(spec) => spec,
            None => ctx.entity_snapshot()?.spec,
        };
        let store = self.reconciler.store(ctx);
        let attempts = self.reconciler.config.write_attempts();
        let id = ctx.entity_id.as_str();

        let updating = write_with_retry(store.as_ref(), id, attempts, |entity| {
            check_updatable(entity, &desired)?;
            desired.validate(&entity.name)?;
            entity.spec = desired.clone();
            entity.status.phase = ClusterPhase::Updating;
            entity.status.task_id = Some(ctx.task_id.clone());
            Ok(())
        })
        .await?;

        let plan = UpdatePlan::between(&updating, &desired);
        info!(
            entity_id = %id,
            remove = plan.remove.len(),
            add = plan.add.len(),
            upgrade = plan.upgrade.is_some(),
            "applying update"
        );

        let added = match self.apply(store.as_ref(), &updating, &plan).await {
            Ok(added) => added,
            Err(e) => {
                let message = e.to_string();
                let marked = write_with_retry(store.as_ref(), id, attempts, |entity| {
                    entity.status.phase = ClusterPhase::ReadyWithError;
                    entity.status.errors = vec![message.clone()];
                    Ok(())
                })
                .await;
                if let Err(mark_err) = marked {
                    warn!(entity_id = %id, error = %mark_err, "failed to record update failure");
                }
                return Err(e);
            }
        };

        let failures = added.failure_messages();
        let updated = write_with_retry(store.as_ref(), id, attempts, |entity| {
            entity.status.nodes.retain(|n| !plan.remove.contains(&n.name));
            for node in &added.nodes {
                entity.status.nodes.retain(|n| n.name != node.name);
                entity.status.nodes.push(node.clone());
            }
            entity.status.errors = failures.clone();
            entity.status.template = Some(desired.template.clone());
            entity.status.phase = if failures.is_empty() {
                ClusterPhase::Ready
            } else {
                ClusterPhase::ReadyWithError
            };
            entity.status.task_id = Some(ctx.task_id.clone());
            Ok(())
        })
        .await?;

        let payload = entity_payload(&updated)?;
        if failures.is_empty() {
            info!(entity_id = %id, "cluster updated");
            Ok(TaskResult::ok(payload))
        } else {
            warn!(entity_id = %id, failed = failures.len(), "cluster updated with errors");
            let caveat = Error::partial_failure(
                format!("{} of {} new nodes failed to join", failures.len(), plan.add.len()),
                failures,
            );
            Ok(TaskResult::degraded(payload, &caveat))
        }
    }
}
