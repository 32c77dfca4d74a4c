//! Entity store client
//!
//! Typed access to cluster entities and their ACLs held by the platform:
//!
//! - [`EntityStore`]: the CRUD, cluster action and paged ACL contract every
//!   caller codes against
//! - [`HttpEntityStore`]: REST implementation with transient-failure retry
//! - [`InMemoryEntityStore`]: in-process implementation for tests and dry runs
//! - [`pagination`]: the pull-until-empty enumeration protocol
//! - [`StoreProvider`]: a store bound to the caller of a request
//!
//! Writes are optimistic: [`EntityStore::update`] takes the version token of
//! the last read and fails with `VersionConflict` if someone else wrote since.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use cse_common::{AclGrant, ClusterEntity, Page, Result, TemplateRef};

pub mod http;
pub mod memory;
pub mod pagination;
pub mod provider;

pub use http::{HttpEntityStore, HttpStoreConfig};
pub use memory::InMemoryEntityStore;
pub use pagination::{acl_entries, collect_pages, list_acl};
pub use provider::{SharedStore, StoreProvider};

/// Trait abstracting entity store operations
///
/// Allows the reconcilers to be tested against fakes while production code
/// talks to the platform over HTTP.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Create a new entity; the store assigns the id unless one is supplied
    async fn create(&self, entity: &ClusterEntity) -> Result<ClusterEntity>;

    /// Replace an entity if its current version matches `expected_version`
    async fn update(
        &self,
        id: &str,
        entity: &ClusterEntity,
        expected_version: &str,
    ) -> Result<ClusterEntity>;

    /// Delete an entity, returning its last known state
    async fn delete(&self, id: &str) -> Result<ClusterEntity>;

    /// Read an entity together with its current version token
    async fn get(&self, id: &str) -> Result<ClusterEntity>;

    /// Read one page (1-based) of an entity's ACL
    async fn list_acl_page(&self, id: &str, page: u32, page_size: u32) -> Result<Page<AclGrant>>;

    /// Replace an entity's whole ACL with `grants`
    async fn replace_acl(&self, id: &str, grants: &[AclGrant]) -> Result<()>;

    /// Remove one NFS node from a cluster, returning the updated entity
    async fn delete_nfs_node(&self, id: &str, node_name: &str) -> Result<ClusterEntity>;

    /// Templates the cluster can move to from the one it runs
    async fn upgrade_plan(&self, id: &str) -> Result<Vec<TemplateRef>>;

    /// Move a cluster to the template named in `entity.spec`
    async fn upgrade(&self, id: &str, entity: &ClusterEntity) -> Result<ClusterEntity>;
}
