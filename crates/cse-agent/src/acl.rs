//! ACL convergence
//!
//! Every change is applied as one replace-all write of the complete grant
//! set, computed from a full pull-until-empty read of the current ACL.
//! Concurrent editors therefore never see a half-applied sequence of
//! add/remove calls; the price is that each write resends every grant.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use cse_common::acl::user_urn;
use cse_common::metrics::record_acl_sync;
use cse_common::{AccessLevel, AclGrant, Result};
use cse_store::{list_acl, EntityStore};

/// What a sync changed, keyed by subject
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AclSyncReport {
    /// Subjects granted access
    pub added: Vec<String>,
    /// Subjects whose access was revoked
    pub removed: Vec<String>,
    /// Subjects whose access level or grant type changed
    pub changed: Vec<String>,
    /// Subjects that held more than one grant and were collapsed to one
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub collapsed: Vec<String>,
    /// Whether a replace was issued
    pub written: bool,
}

impl AclSyncReport {
    /// Whether the current and desired sets already matched
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.collapsed.is_empty()
    }
}

/// Converges entity ACLs with desired grant sets
pub struct AclSynchronizer {
    store: Arc<dyn EntityStore>,
    page_size: u32,
}

impl AclSynchronizer {
    /// Create a synchronizer reading ACLs `page_size` grants at a time
    pub fn new(store: Arc<dyn EntityStore>, page_size: u32) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Current grants of an entity, one per subject
    pub async fn list(&self, entity_id: &str) -> Result<Vec<AclGrant>> {
        Ok(by_subject(self.stored(entity_id).await?))
    }

    /// Grants exactly as the store holds them
    async fn stored(&self, entity_id: &str) -> Result<Vec<AclGrant>> {
        list_acl(self.store.as_ref(), entity_id, self.page_size).await
    }

    /// Make the entity's ACL equal to `desired`
    ///
    /// When several grants name the same subject the last one wins. No write
    /// is issued if the ACL already matches.
    pub async fn sync(&self, entity_id: &str, desired: &[AclGrant]) -> Result<AclSyncReport> {
        let stored = self.stored(entity_id).await?;
        self.converge(entity_id, &stored, by_subject(desired.to_vec()))
            .await
    }

    /// Add or upgrade grants, keeping everyone else's access
    pub async fn share(&self, entity_id: &str, grants: &[AclGrant]) -> Result<AclSyncReport> {
        let stored = self.stored(entity_id).await?;
        let mut desired = stored.clone();
        desired.extend(grants.iter().cloned());
        self.converge(entity_id, &stored, by_subject(desired)).await
    }

    /// Revoke access of the given subjects (user ids or URNs)
    pub async fn unshare(&self, entity_id: &str, subjects: &[String]) -> Result<AclSyncReport> {
        let stored = self.stored(entity_id).await?;
        let revoked: Vec<String> = subjects.iter().map(|s| subject_urn(s)).collect();
        let desired = by_subject(stored.clone())
            .into_iter()
            .filter(|g| !revoked.contains(&g.member_id))
            .collect();
        self.converge(entity_id, &stored, desired).await
    }

    /// Replace `stored` with `desired` unless they already match
    ///
    /// `desired` holds one grant per subject; a stored ACL with repeated
    /// subjects never matches it.
    async fn converge(
        &self,
        entity_id: &str,
        stored: &[AclGrant],
        desired: Vec<AclGrant>,
    ) -> Result<AclSyncReport> {
        let current = by_subject(stored.to_vec());
        let mut report = diff(&current, &desired);
        report.collapsed = repeated_subjects(stored);

        if report.is_unchanged() {
            debug!(entity_id = %entity_id, grants = desired.len(), "ACL already converged");
            record_acl_sync(false);
            return Ok(report);
        }

        let settings: Vec<AclGrant> = desired.iter().map(AclGrant::to_setting).collect();
        self.store.replace_acl(entity_id, &settings).await?;
        report.written = true;
        record_acl_sync(true);
        info!(
            entity_id = %entity_id,
            added = report.added.len(),
            removed = report.removed.len(),
            changed = report.changed.len(),
            collapsed = report.collapsed.len(),
            "ACL replaced"
        );
        Ok(report)
    }
}

/// One grant per subject, in first-seen order, the last grant for a subject winning
fn by_subject(grants: Vec<AclGrant>) -> Vec<AclGrant> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<AclGrant> = Vec::with_capacity(grants.len());
    for grant in grants {
        match index.get(&grant.member_id) {
            Some(&i) => unique[i] = grant,
            None => {
                index.insert(grant.member_id.clone(), unique.len());
                unique.push(grant);
            }
        }
    }
    unique
}

/// Subjects named by more than one grant, in first-seen order
fn repeated_subjects(grants: &[AclGrant]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for grant in grants {
        *seen.entry(grant.member_id.as_str()).or_default() += 1;
    }
    let mut repeated = Vec::new();
    for grant in grants {
        if seen.remove(grant.member_id.as_str()).is_some_and(|n| n > 1) {
            repeated.push(grant.member_id.clone());
        }
    }
    repeated
}

fn diff(current: &[AclGrant], desired: &[AclGrant]) -> AclSyncReport {
    let current_by_subject: HashMap<&str, &AclGrant> =
        current.iter().map(|g| (g.member_id.as_str(), g)).collect();
    let desired_by_subject: HashMap<&str, &AclGrant> =
        desired.iter().map(|g| (g.member_id.as_str(), g)).collect();

    let mut report = AclSyncReport::default();
    for grant in desired {
        match current_by_subject.get(grant.member_id.as_str()) {
            None => report.added.push(grant.member_id.clone()),
            Some(existing) if !existing.same_grant(grant) => {
                report.changed.push(grant.member_id.clone())
            }
            Some(_) => {}
        }
    }
    report.removed = current
        .iter()
        .filter(|g| !desired_by_subject.contains_key(g.member_id.as_str()))
        .map(|g| g.member_id.clone())
        .collect();
    report
}

/// Membership grant for a subject given as a URN or a bare user id
pub fn grant_for(subject: &str, access_level: AccessLevel) -> AclGrant {
    AclGrant::membership(subject_urn(subject), access_level)
}

fn subject_urn(subject: &str) -> String {
    if subject.starts_with("urn:") {
        subject.to_string()
    } else {
        user_urn(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cse_common::{ClusterEntity, ClusterSpec};
    use cse_store::InMemoryEntityStore;

    fn users(n: usize, level: AccessLevel) -> Vec<AclGrant> {
        (0..n)
            .map(|i| AclGrant::for_user(&format!("user-{}", i), level))
            .collect()
    }

    fn setup() -> (Arc<InMemoryEntityStore>, AclSynchronizer, String) {
        let store = Arc::new(InMemoryEntityStore::new());
        let id = store
            .seed(ClusterEntity::new("c1", ClusterSpec::default()))
            .id
            .unwrap();
        let sync = AclSynchronizer::new(store.clone(), 25);
        (store, sync, id)
    }

    /// Story: syncing the same desired set twice writes once
    #[tokio::test]
    async fn story_sync_is_idempotent() {
        let (store, sync, id) = setup();
        let desired = users(3, AccessLevel::ReadOnly);

        let first = sync.sync(&id, &desired).await.unwrap();
        let second = sync.sync(&id, &desired).await.unwrap();

        assert!(first.written);
        assert_eq!(first.added.len(), 3);
        assert!(!second.written);
        assert!(second.is_unchanged());
        assert_eq!(store.acl_writes(), 1);
        assert_eq!(store.acl(&id).len(), 3);
    }

    #[tokio::test]
    async fn test_sync_reports_each_kind_of_change() {
        let (store, sync, id) = setup();
        store.seed_acl(&id, users(3, AccessLevel::ReadOnly));

        let mut desired = users(2, AccessLevel::ReadOnly);
        desired[1].access_level = AccessLevel::FullControl;
        desired.push(AclGrant::for_user("newcomer", AccessLevel::ReadWrite));

        let report = sync.sync(&id, &desired).await.unwrap();

        assert_eq!(report.added, vec!["urn:vcloud:user:newcomer"]);
        assert_eq!(report.removed, vec!["urn:vcloud:user:user-2"]);
        assert_eq!(report.changed, vec!["urn:vcloud:user:user-1"]);
        let stored = store.acl(&id);
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|g| g.id.is_none()));
    }

    #[tokio::test]
    async fn test_latest_grant_for_a_subject_wins() {
        let (store, sync, id) = setup();
        let desired = vec![
            AclGrant::for_user("alice", AccessLevel::ReadOnly),
            AclGrant::for_user("alice", AccessLevel::FullControl),
        ];

        sync.sync(&id, &desired).await.unwrap();

        let stored = store.acl(&id);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].access_level, AccessLevel::FullControl);
    }

    /// Story: the stored ACL lists a subject twice; syncing the same subject
    /// set still rewrites it so exactly one grant per subject remains
    #[tokio::test]
    async fn story_repeated_stored_subject_is_collapsed() {
        let (store, sync, id) = setup();
        store.seed_acl(
            &id,
            vec![
                AclGrant::for_user("alice", AccessLevel::ReadOnly),
                AclGrant::for_user("bob", AccessLevel::ReadOnly),
                AclGrant::for_user("alice", AccessLevel::FullControl),
            ],
        );
        let desired = vec![
            AclGrant::for_user("alice", AccessLevel::FullControl),
            AclGrant::for_user("bob", AccessLevel::ReadOnly),
        ];

        let report = sync.sync(&id, &desired).await.unwrap();

        assert!(report.written);
        assert_eq!(report.collapsed, vec!["urn:vcloud:user:alice"]);
        assert!(report.added.is_empty() && report.removed.is_empty());
        let stored = store.acl(&id);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].access_level, AccessLevel::FullControl);

        let again = sync.sync(&id, &desired).await.unwrap();
        assert!(!again.written);
        assert_eq!(store.acl_writes(), 1);
    }

    #[tokio::test]
    async fn test_sync_reads_every_page() {
        let (store, sync, id) = setup();
        store.seed_acl(&id, users(30, AccessLevel::ReadOnly));

        let report = sync.sync(&id, &users(30, AccessLevel::ReadOnly)).await.unwrap();

        assert!(!report.written);
        // 25 + 5 + the empty page that ends the listing
        assert_eq!(store.acl_page_reads(), 3);
    }

    #[tokio::test]
    async fn test_share_upserts_without_dropping_others() {
        let (store, sync, id) = setup();
        store.seed_acl(&id, users(2, AccessLevel::ReadOnly));

        let report = sync
            .share(
                &id,
                &[
                    AclGrant::for_user("user-0", AccessLevel::ReadWrite),
                    AclGrant::for_user("bob", AccessLevel::ReadOnly),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.added, vec!["urn:vcloud:user:bob"]);
        assert_eq!(report.changed, vec!["urn:vcloud:user:user-0"]);
        assert!(report.removed.is_empty());
        assert_eq!(store.acl(&id).len(), 3);
    }

    #[tokio::test]
    async fn test_unshare_accepts_ids_and_urns() {
        let (store, sync, id) = setup();
        store.seed_acl(&id, users(3, AccessLevel::ReadOnly));

        let report = sync
            .unshare(&id, &["user-0".to_string(), "urn:vcloud:user:user-2".to_string()])
            .await
            .unwrap();

        assert_eq!(report.removed.len(), 2);
        let remaining: Vec<_> = store.acl(&id).into_iter().map(|g| g.member_id).collect();
        assert_eq!(remaining, vec!["urn:vcloud:user:user-1"]);
    }

    #[test]
    fn test_grant_subjects_keep_group_urns() {
        let group = grant_for("urn:vcloud:group:ops", AccessLevel::ReadWrite);
        assert_eq!(group.member_id, "urn:vcloud:group:ops");
        assert_eq!(grant_for("alice", AccessLevel::ReadOnly).member_id, "urn:vcloud:user:alice");
    }

    #[tokio::test]
    async fn test_unshare_of_unknown_subject_writes_nothing() {
        let (store, sync, id) = setup();
        store.seed_acl(&id, users(1, AccessLevel::ReadOnly));

        let report = sync.unshare(&id, &["stranger".to_string()]).await.unwrap();

        assert!(!report.written);
        assert_eq!(store.acl_writes(), 0);
    }
}
