//! Get kubeconfig handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use cse_common::{ClusterPhase, Error, Result};

use super::ReconcilerContext;
use crate::dispatcher::BehaviorHandler;
use crate::message::{BehaviorKind, OperationContext};
use crate::tracker::TaskResult;

/// Returns credentials for a ready cluster. Read-only.
pub struct GetKubeConfigHandler {
    reconciler: Arc<ReconcilerContext>,
}

impl GetKubeConfigHandler {
    /// Create the handler
    pub fn new(reconciler: Arc<ReconcilerContext>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl BehaviorHandler for GetKubeConfigHandler {
    fn kind(&self) -> BehaviorKind {
        BehaviorKind::GetKubeConfig
    }

    async fn handle(&self, ctx: &OperationContext) -> Result<TaskResult> {
        let entity = self.reconciler.store(ctx).get(&ctx.entity_id).await?;
        if entity.phase() != ClusterPhase::Ready {
            return Err(Error::not_ready(&ctx.entity_id, entity.phase()));
        }

        let credentials = self
            .reconciler
            .backend
            .fetch_credentials(&ctx.entity_id)
            .await?;
        debug!(entity_id = %ctx.entity_id, "fetched cluster credentials");
        Ok(TaskResult::ok(json!({ "kubeconfig": credentials.kubeconfig })))
    }
}
