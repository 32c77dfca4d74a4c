//! In-process entity store
//!
//! Behaves like the platform store for everything the agent relies on:
//! platform-assigned ids, per-entity version tokens checked on update, and
//! 1-based ACL paging. Cluster actions (NFS node removal, upgrades) are
//! applied to the stored entity directly. Used by tests and by the agent's
//! dry-run mode.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use cse_common::{AclGrant, ClusterEntity, ClusterPhase, Error, NodeRole, Page, Result, TemplateRef};

use crate::EntityStore;

/// Prefix of ids assigned to new entities
pub const ENTITY_ID_PREFIX: &str = "urn:vcloud:entity:cse:nativeCluster:";

#[derive(Default)]
struct State {
    entities: HashMap<String, Stored>,
    acls: HashMap<String, Vec<AclGrant>>,
    upgrade_plans: HashMap<String, Vec<TemplateRef>>,
    acl_writes: u64,
    acl_page_reads: u64,
}

struct Stored {
    entity: ClusterEntity,
    version: u64,
}

impl Stored {
    fn snapshot(&self) -> ClusterEntity {
        let mut entity = self.entity.clone();
        entity.version = Some(self.version.to_string());
        entity
    }
}

/// Thread-safe in-memory [`EntityStore`]
#[derive(Default)]
pub struct InMemoryEntityStore {
    state: Mutex<State>,
}

impl InMemoryEntityStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an entity without version checks, returning the stored copy
    pub fn seed(&self, entity: ClusterEntity) -> ClusterEntity {
        let mut state = self.state.lock();
        let id = entity
            .id
            .clone()
            .unwrap_or_else(|| format!("{}{}", ENTITY_ID_PREFIX, uuid::Uuid::new_v4()));
        let version = state.entities.get(&id).map(|s| s.version + 1).unwrap_or(1);
        let mut entity = entity;
        entity.id = Some(id.clone());
        entity.version = None;
        let stored = Stored { entity, version };
        let snapshot = stored.snapshot();
        state.entities.insert(id, stored);
        snapshot
    }

    /// Overwrite an entity's ACL without counting it as a write
    pub fn seed_acl(&self, id: &str, grants: Vec<AclGrant>) {
        self.state.lock().acls.insert(id.to_string(), grants);
    }

    /// Set the templates an entity may be upgraded to
    pub fn seed_upgrade_plan(&self, id: &str, templates: Vec<TemplateRef>) {
        self.state
            .lock()
            .upgrade_plans
            .insert(id.to_string(), templates);
    }

    /// Bump an entity's version as if another writer had updated it
    pub fn touch(&self, id: &str) {
        if let Some(stored) = self.state.lock().entities.get_mut(id) {
            stored.version += 1;
        }
    }

    /// Whether an entity with this id exists
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().entities.contains_key(id)
    }

    /// Number of stored entities
    pub fn len(&self) -> usize {
        self.state.lock().entities.len()
    }

    /// Whether the store holds no entities
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `replace_acl` calls served
    pub fn acl_writes(&self) -> u64 {
        self.state.lock().acl_writes
    }

    /// Number of `list_acl_page` calls served
    pub fn acl_page_reads(&self) -> u64 {
        self.state.lock().acl_page_reads
    }

    /// Current ACL of an entity, in stored order
    pub fn acl(&self, id: &str) -> Vec<AclGrant> {
        self.state.lock().acls.get(id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn create(&self, entity: &ClusterEntity) -> Result<ClusterEntity> {
        let mut state = self.state.lock();
        let id = match &entity.id {
            Some(id) if state.entities.contains_key(id) => {
                return Err(Error::AlreadyExists { id: id.clone() })
            }
            Some(id) => id.clone(),
            None => format!("{}{}", ENTITY_ID_PREFIX, uuid::Uuid::new_v4()),
        };

        let mut entity = entity.clone();
        entity.id = Some(id.clone());
        entity.version = None;
        let stored = Stored { entity, version: 1 };
        let snapshot = stored.snapshot();
        state.entities.insert(id.clone(), stored);
        debug!(entity_id = %id, "created entity");
        Ok(snapshot)
    }

    async fn update(
        &self,
        id: &str,
        entity: &ClusterEntity,
        expected_version: &str,
    ) -> Result<ClusterEntity> {
        let mut state = self.state.lock();
        let stored = state
            .entities
            .get_mut(id)
            .ok_or_else(|| Error::entity_not_found(id))?;

        if let Some(other) = entity.id.as_deref() {
            if other != id {
                return Err(Error::validation_for(
                    id,
                    format!("entity id is immutable (got '{}')", other),
                ));
            }
        }
        if stored.version.to_string() != expected_version {
            return Err(Error::version_conflict(id, expected_version));
        }

        let mut entity = entity.clone();
        entity.id = Some(id.to_string());
        entity.version = None;
        stored.entity = entity;
        stored.version += 1;
        debug!(entity_id = %id, version = stored.version, "updated entity");
        Ok(stored.snapshot())
    }

    async fn delete(&self, id: &str) -> Result<ClusterEntity> {
        let mut state = self.state.lock();
        let stored = state
            .entities
            .remove(id)
            .ok_or_else(|| Error::entity_not_found(id))?;
        state.acls.remove(id);
        state.upgrade_plans.remove(id);
        debug!(entity_id = %id, "deleted entity");
        Ok(stored.snapshot())
    }

    async fn get(&self, id: &str) -> Result<ClusterEntity> {
        self.state
            .lock()
            .entities
            .get(id)
            .map(Stored::snapshot)
            .ok_or_else(|| Error::entity_not_found(id))
    }

    async fn list_acl_page(&self, id: &str, page: u32, page_size: u32) -> Result<Page<AclGrant>> {
        let mut state = self.state.lock();
        if !state.entities.contains_key(id) {
            return Err(Error::entity_not_found(id));
        }
        state.acl_page_reads += 1;
        let grants = state.acls.get(id).map(Vec::as_slice).unwrap_or_default();
        Ok(Page::from_slice(grants, page, page_size))
    }

    async fn replace_acl(&self, id: &str, grants: &[AclGrant]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.entities.contains_key(id) {
            return Err(Error::entity_not_found(id));
        }

        // One grant per subject; a later entry for the same subject wins
        let mut deduped: Vec<AclGrant> = Vec::with_capacity(grants.len());
        for grant in grants {
            let setting = grant.to_setting();
            match deduped.iter_mut().find(|g| g.member_id == setting.member_id) {
                Some(existing) => *existing = setting,
                None => deduped.push(setting),
            }
        }

        state.acl_writes += 1;
        state.acls.insert(id.to_string(), deduped);
        Ok(())
    }

    async fn delete_nfs_node(&self, id: &str, node_name: &str) -> Result<ClusterEntity> {
        let mut state = self.state.lock();
        let stored = state
            .entities
            .get_mut(id)
            .ok_or_else(|| Error::entity_not_found(id))?;

        let nodes = &mut stored.entity.status.nodes;
        let position = nodes
            .iter()
            .position(|n| n.name == node_name)
            .ok_or_else(|| Error::not_found("node", node_name))?;
        if nodes[position].role != NodeRole::Nfs {
            return Err(Error::validation_for(
                id,
                format!("node '{}' is not an NFS node", node_name),
            ));
        }
        nodes.remove(position);
        stored.entity.spec.nfs_count = stored.entity.spec.nfs_count.saturating_sub(1);
        stored.version += 1;
        debug!(entity_id = %id, node = node_name, "removed nfs node");
        Ok(stored.snapshot())
    }

    async fn upgrade_plan(&self, id: &str) -> Result<Vec<TemplateRef>> {
        let state = self.state.lock();
        if !state.entities.contains_key(id) {
            return Err(Error::entity_not_found(id));
        }
        Ok(state.upgrade_plans.get(id).cloned().unwrap_or_default())
    }

    async fn upgrade(&self, id: &str, entity: &ClusterEntity) -> Result<ClusterEntity> {
        let mut state = self.state.lock();
        let target = &entity.spec.template;
        let allowed = state
            .upgrade_plans
            .get(id)
            .is_some_and(|plan| plan.contains(target));
        let stored = state
            .entities
            .get_mut(id)
            .ok_or_else(|| Error::entity_not_found(id))?;
        if !allowed {
            return Err(Error::validation_for(
                id,
                format!("template {} is not in the upgrade plan", target),
            ));
        }

        stored.entity.spec.template = target.clone();
        stored.entity.status.phase = ClusterPhase::Updating;
        stored.version += 1;
        debug!(entity_id = %id, template = %target, "upgrade accepted");
        Ok(stored.snapshot())
    }
}
