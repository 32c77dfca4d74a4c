//! Delete cluster handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use cse_common::{ClusterEntity, ClusterPhase, Error, ErrorKind, Result};
use cse_store::EntityStore;

use super::{entity_payload, write_with_retry, ReconcilerContext};
use crate::dispatcher::BehaviorHandler;
use crate::message::{BehaviorKind, OperationContext};
use crate::tracker::TaskResult;

/// Tears down a cluster's resources, then removes its entity
///
/// A teardown that only partly succeeds leaves the entity in
/// `deleting-with-errors`; running the delete again resumes it.
pub struct DeleteClusterHandler {
    reconciler: Arc<ReconcilerContext>,
}

impl DeleteClusterHandler {
    /// Create the handler
    pub fn new(reconciler: Arc<ReconcilerContext>) -> Self {
        Self { reconciler }
    }

    async fn mark_deleting_with_errors(
        &self,
        store: &dyn EntityStore,
        id: &str,
        errors: Vec<String>,
    ) -> Result<ClusterEntity> {
        write_with_retry(store, id, self.reconciler.config.write_attempts(), |entity| {
            entity.status.phase = ClusterPhase::DeletingWithErrors;
            entity.status.errors = errors.clone();
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl BehaviorHandler for DeleteClusterHandler {
    fn kind(&self) -> BehaviorKind {
        BehaviorKind::DeleteCluster
    }

    async fn handle(&self, ctx: &OperationContext) -> Result<TaskResult> {
        let store = self.reconciler.store(ctx);
        let id = ctx.entity_id.as_str();

        let marked = write_with_retry(
            store.as_ref(),
            id,
            self.reconciler.config.write_attempts(),
            |entity| {
                entity.status.phase = ClusterPhase::Deleting;
                entity.status.task_id = Some(ctx.task_id.clone());
                Ok(())
            },
        )
        .await;
        let exists = match marked {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(entity_id = %id, "entity already gone, cleaning up leftover resources");
                false
            }
            Err(e) => return Err(e),
        };

        match self.reconciler.backend.deprovision(id).await {
            Ok(()) => {}
            Err(Error::PartialFailure { message, failures }) if exists => {
                warn!(entity_id = %id, failed = failures.len(), "teardown incomplete");
                let caveat = Error::partial_failure(message, failures.clone());
                let entity = self.mark_deleting_with_errors(store.as_ref(), id, failures).await?;
                return Ok(TaskResult::degraded(entity_payload(&entity)?, &caveat));
            }
            Err(e) => {
                if exists {
                    if let Err(mark_err) = self
                        .mark_deleting_with_errors(store.as_ref(), id, vec![e.to_string()])
                        .await
                    {
                        warn!(entity_id = %id, error = %mark_err, "failed to record teardown failure");
                    }
                }
                return Err(e);
            }
        }

        if !exists {
            return Ok(TaskResult::ok(json!({ "id": id, "deleted": true })));
        }
        match store.delete(id).await {
            Ok(deleted) => {
                info!(entity_id = %id, "cluster deleted");
                Ok(TaskResult::ok(entity_payload(&deleted)?))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Ok(TaskResult::ok(json!({ "id": id, "deleted": true })))
            }
            Err(e) => Err(e),
        }
    }
}
