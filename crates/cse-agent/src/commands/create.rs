//! Create cluster handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info, warn};

use cse_common::{ClusterPhase, ClusterStatus, Error, ErrorKind, Result};

use super::{entity_payload, ReconcilerContext};
use crate::dispatcher::BehaviorHandler;
use crate::message::{BehaviorKind, OperationContext};
use crate::provisioning::ProvisionRequest;
use crate::tracker::TaskResult;

/// Arguments of a create request
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateArgs {
    /// Tear everything down if any node fails; the configured default applies when absent
    #[serde(default)]
    pub rollback: Option<bool>,
}

/// Stands up the nodes of a new cluster, then records it in the store
pub struct CreateClusterHandler {
    reconciler: Arc<ReconcilerContext>,
}

impl CreateClusterHandler {
    /// Create the handler
    pub fn new(reconciler: Arc<ReconcilerContext>) -> Self {
        Self { reconciler }
    }

    async fn roll_back(&self, entity_id: &str) -> Result<()> {
        warn!(entity_id = %entity_id, "rolling back provisioned nodes");
        self.reconciler
            .backend
            .deprovision(entity_id)
            .await
            .map_err(|e| {
                error!(entity_id = %entity_id, error = %e, "rollback failed");
                Error::fatal_with_context("create", format!("rollback of {} failed: {}", entity_id, e))
            })
    }
}

#[async_trait]
impl BehaviorHandler for CreateClusterHandler {
    fn kind(&self) -> BehaviorKind {
        BehaviorKind::CreateCluster
    }

    async fn handle(&self, ctx: &OperationContext) -> Result<TaskResult> {
        let args: CreateArgs = ctx.arguments()?;
        let rollback = args
            .rollback
            .unwrap_or(self.reconciler.config.default_rollback);
        let desired = ctx.entity_snapshot()?;
        desired.spec.validate(&desired.name)?;

        let store = self.reconciler.store(ctx);

        // A redelivered create finds the entity it wrote last time
        match store.get(&ctx.entity_id).await {
            Ok(existing) => {
                info!(entity_id = %ctx.entity_id, phase = %existing.phase(), "cluster already exists");
                return Ok(TaskResult::ok(entity_payload(&existing)?));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let request = ProvisionRequest::for_spec(&ctx.entity_id, &desired.name, &desired.spec);
        info!(
            entity_id = %ctx.entity_id,
            cluster = %desired.name,
            nodes = request.nodes.len(),
            rollback,
            "provisioning cluster"
        );

        let nodes = match self.reconciler.backend.provision(&request).await {
            Ok(nodes) => nodes,
            Err(e) => {
                if rollback {
                    self.roll_back(&ctx.entity_id).await?;
                }
                return Err(e);
            }
        };

        let failures = nodes.failure_messages();
        if !failures.is_empty() && rollback {
            self.roll_back(&ctx.entity_id).await?;
            return Err(Error::fatal_with_context(
                "create",
                format!(
                    "{} of {} nodes failed to join, cluster rolled back: {}",
                    failures.len(),
                    request.nodes.len(),
                    failures.join("; ")
                ),
            ));
        }

        let phase = if failures.is_empty() {
            ClusterPhase::Ready
        } else {
            ClusterPhase::ReadyWithError
        };
        let mut entity = desired;
        entity.id = Some(ctx.entity_id.clone());
        entity.version = None;
        entity.status = ClusterStatus {
            phase,
            nodes: nodes.nodes,
            errors: failures.clone(),
            task_id: Some(ctx.task_id.clone()),
            template: Some(request.template.clone()),
        };

        let created = match store.create(&entity).await {
            Ok(created) => created,
            Err(Error::AlreadyExists { .. }) => store.get(&ctx.entity_id).await?,
            Err(e) => {
                if rollback {
                    self.roll_back(&ctx.entity_id).await?;
                }
                return Err(e);
            }
        };
        let payload = entity_payload(&created)?;

        if failures.is_empty() {
            info!(entity_id = %ctx.entity_id, "cluster ready");
            Ok(TaskResult::ok(payload))
        } else {
            warn!(entity_id = %ctx.entity_id, failed = failures.len(), "cluster ready with errors");
            let caveat = Error::partial_failure(
                format!("{} of {} nodes failed to join", failures.len(), request.nodes.len()),
                failures,
            );
            Ok(TaskResult::degraded(payload, &caveat))
        }
    }
}
