//! Cluster reconciler handlers.
//!
//! One [`BehaviorHandler`](crate::dispatcher::BehaviorHandler) per cluster
//! behavior. Each handler reads the entity fresh from the store, drives the
//! provisioning backend, and writes the result back with the version token
//! of its last read.

pub mod create;
pub mod delete;
pub mod kubeconfig;
pub mod update;

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use cse_common::metrics::record_retry;
use cse_common::{ClusterEntity, Error, Result};
use cse_store::{EntityStore, StoreProvider};

use crate::dispatcher::HandlerRegistry;
use crate::message::OperationContext;
use crate::provisioning::ProvisioningBackend;

/// Reconciler settings
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Extra read-modify-write attempts after a version conflict
    pub update_retries: u32,
    /// Rollback policy for creates that do not specify one
    pub default_rollback: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            update_retries: 3,
            default_rollback: true,
        }
    }
}

impl ReconcilerConfig {
    /// Total write attempts per compare-and-swap loop
    pub fn write_attempts(&self) -> u32 {
        self.update_retries.saturating_add(1)
    }
}

/// Dependencies shared by every reconciler handler.
pub struct ReconcilerContext {
    /// Entity store access per caller
    pub stores: Arc<dyn StoreProvider>,
    /// Node provisioning
    pub backend: Arc<dyn ProvisioningBackend>,
    /// Settings
    pub config: ReconcilerConfig,
}

impl ReconcilerContext {
    /// Create a reconciler context
    pub fn new(
        stores: Arc<dyn StoreProvider>,
        backend: Arc<dyn ProvisioningBackend>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            stores,
            backend,
            config,
        }
    }

    /// Store acting on behalf of the caller of `ctx`
    pub fn store(&self, ctx: &OperationContext) -> Arc<dyn EntityStore> {
        self.stores.store_for(ctx.auth_token.as_deref())
    }
}

/// Registry holding the four cluster handlers
pub fn cluster_handlers(ctx: Arc<ReconcilerContext>) -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(create::CreateClusterHandler::new(ctx.clone())))?;
    registry.register(Arc::new(update::UpdateClusterHandler::new(ctx.clone())))?;
    registry.register(Arc::new(delete::DeleteClusterHandler::new(ctx.clone())))?;
    registry.register(Arc::new(kubeconfig::GetKubeConfigHandler::new(ctx)))?;
    Ok(registry)
}

/// Read, mutate and write back an entity, retrying on version conflicts.
///
/// Every attempt re-reads the entity so `mutate` always sees the latest
/// stored state. Fails with `ConcurrentModification` once `attempts` writes
/// have lost the race.
pub async fn write_with_retry<F>(
    store: &dyn EntityStore,
    id: &str,
    attempts: u32,
    mut mutate: F,
) -> Result<ClusterEntity>
where
    F: FnMut(&mut ClusterEntity) -> Result<()> + Send,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let mut entity = store.get(id).await?;
        let version = entity.require_version()?.to_string();
        mutate(&mut entity)?;

        match store.update(id, &entity, &version).await {
            Ok(written) => return Ok(written),
            Err(Error::VersionConflict { .. }) => {
                debug!(entity_id = %id, attempt, "version conflict, re-reading entity");
                record_retry("entity_write");
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::ConcurrentModification {
        entity_id: id.to_string(),
        attempts,
    })
}

/// Entity as a task result payload
pub(crate) fn entity_payload(entity: &ClusterEntity) -> Result<Value> {
    serde_json::to_value(entity).map_err(|e| Error::fatal_with_context("reconciler", e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fixtures shared by the handler tests

    use super::*;
    use crate::message::BehaviorKind;
    use crate::provisioning::SimulatedBackend;
    use async_trait::async_trait;
    use cse_common::{AclGrant, ClusterPhase, ClusterSpec, Page, TemplateRef};
    use cse_store::{InMemoryEntityStore, SharedStore};
    use mockall::mock;

    pub const ENTITY_ID: &str = "urn:vcloud:entity:cse:nativeCluster:c1";

    mock! {
        pub Store {}

        #[async_trait]
        impl EntityStore for Store {
            async fn create(&self, entity: &ClusterEntity) -> Result<ClusterEntity>;
            async fn update(&self, id: &str, entity: &ClusterEntity, expected_version: &str) -> Result<ClusterEntity>;
            async fn delete(&self, id: &str) -> Result<ClusterEntity>;
            async fn get(&self, id: &str) -> Result<ClusterEntity>;
            async fn list_acl_page(&self, id: &str, page: u32, page_size: u32) -> Result<Page<AclGrant>>;
            async fn replace_acl(&self, id: &str, grants: &[AclGrant]) -> Result<()>;
            async fn delete_nfs_node(&self, id: &str, node_name: &str) -> Result<ClusterEntity>;
            async fn upgrade_plan(&self, id: &str) -> Result<Vec<TemplateRef>>;
            async fn upgrade(&self, id: &str, entity: &ClusterEntity) -> Result<ClusterEntity>;
        }
    }

    /// Stored cluster in the given phase with the nodes the backend reports
    pub fn stored_entity(harness: &Harness, name: &str, spec: ClusterSpec, phase: ClusterPhase) -> ClusterEntity {
        let mut entity = ClusterEntity::new(name, spec);
        entity.id = Some(ENTITY_ID.to_string());
        entity.status.phase = phase;
        entity.status.nodes = harness.backend.nodes(ENTITY_ID);
        entity.status.template = harness.backend.template(ENTITY_ID);
        harness.store.seed(entity)
    }

    pub fn spec(workers: u32) -> ClusterSpec {
        ClusterSpec {
            control_plane_count: 1,
            worker_count: workers,
            nfs_count: 0,
            template: TemplateRef {
                name: "ubuntu-20.04_k8-1.21".to_string(),
                revision: 1,
            },
            network: "ovdc-net".to_string(),
            storage_profile: None,
            ssh_key: None,
        }
    }

    pub struct Harness {
        pub store: Arc<InMemoryEntityStore>,
        pub backend: Arc<SimulatedBackend>,
        pub reconciler: Arc<ReconcilerContext>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(ReconcilerConfig::default())
        }

        pub fn with_config(config: ReconcilerConfig) -> Self {
            let store = Arc::new(InMemoryEntityStore::new());
            let backend = Arc::new(SimulatedBackend::new());
            let reconciler = Arc::new(ReconcilerContext::new(
                Arc::new(SharedStore(store.clone())),
                backend.clone(),
                config,
            ));
            Self {
                store,
                backend,
                reconciler,
            }
        }

        pub fn context(
            &self,
            behavior: BehaviorKind,
            entity: &ClusterEntity,
            arguments: Value,
        ) -> OperationContext {
            let mut ctx = OperationContext::for_entity(behavior, "task-1", ENTITY_ID);
            ctx.entity = serde_json::to_value(entity).unwrap();
            ctx.arguments = arguments;
            ctx
        }
    }
}
