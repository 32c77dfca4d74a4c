//! Pull-until-empty enumeration of paged listings
//!
//! The store's page totals are advisory: items can be added while a listing is
//! in progress. Enumeration therefore starts at page 1 and keeps fetching the
//! next page until one comes back empty, ignoring `pageCount`.

use std::future::Future;

use futures::stream::{self, Stream, TryStreamExt};
use tracing::trace;

use cse_common::page::FIRST_PAGE_NUMBER;
use cse_common::{AclGrant, Error, Page, Result};

use crate::EntityStore;

/// Upper bound on pages fetched for one listing
///
/// A store that never returns an empty page would otherwise loop forever.
pub const MAX_PAGES: u32 = 10_000;

fn too_many_pages(page_size: u32) -> Error {
    Error::malformed(
        "listing",
        format!(
            "listing did not terminate after {} pages of {}",
            MAX_PAGES, page_size
        ),
    )
}

/// Fetch pages 1, 2, ... until an empty page and concatenate their values
pub async fn collect_pages<T, F, Fut>(page_size: u32, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(u32, u32) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut page = FIRST_PAGE_NUMBER;

    loop {
        if page > MAX_PAGES {
            return Err(too_many_pages(page_size));
        }
        let fetched = fetch(page, page_size).await?;
        trace!(page, count = fetched.values.len(), "fetched page");
        if fetched.is_empty() {
            return Ok(items);
        }
        items.extend(fetched.values);
        page += 1;
    }
}

/// Every grant on an entity's ACL
pub async fn list_acl(store: &dyn EntityStore, id: &str, page_size: u32) -> Result<Vec<AclGrant>> {
    collect_pages(page_size, |page, size| store.list_acl_page(id, page, size)).await
}

/// Lazily stream an entity's ACL one page at a time
///
/// The next page is only requested once the consumer has drained the
/// previous one; a failed fetch ends the stream with that error.
pub fn acl_entries<'a>(
    store: &'a dyn EntityStore,
    id: &'a str,
    page_size: u32,
) -> impl Stream<Item = Result<AclGrant>> + Send + 'a {
    stream::try_unfold(FIRST_PAGE_NUMBER, move |page| async move {
        if page > MAX_PAGES {
            return Err(too_many_pages(page_size));
        }
        let fetched = store.list_acl_page(id, page, page_size).await?;
        if fetched.is_empty() {
            return Ok(None);
        }
        let values = stream::iter(fetched.values.into_iter().map(Ok::<_, Error>));
        Ok(Some((values, page + 1)))
    })
    .try_flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryEntityStore, MockEntityStore};
    use cse_common::{AccessLevel, ClusterEntity, ClusterSpec, ErrorKind};
    use futures::StreamExt;
    use mockall::predicate::*;

    fn grants(n: usize) -> Vec<AclGrant> {
        (0..n)
            .map(|i| AclGrant::for_user(&format!("user-{}", i), AccessLevel::ReadOnly))
            .collect()
    }

    fn seeded_store(n: usize) -> (InMemoryEntityStore, String) {
        let store = InMemoryEntityStore::new();
        let id = store
            .seed(ClusterEntity::new("c1", ClusterSpec::default()))
            .id
            .unwrap();
        store.seed_acl(&id, grants(n));
        (store, id)
    }

    /// Story: 30 grants at page size 25 take three reads (25, 5, empty)
    #[tokio::test]
    async fn story_thirty_grants_take_three_reads() {
        let (store, id) = seeded_store(30);

        let all = list_acl(&store, &id, 25).await.unwrap();

        assert_eq!(all.len(), 30);
        assert_eq!(store.acl_page_reads(), 3);
        assert_eq!(all[29].member_id, "urn:vcloud:user:user-29");
    }

    #[tokio::test]
    async fn test_empty_acl_takes_one_read() {
        let (store, id) = seeded_store(0);
        assert!(list_acl(&store, &id, 25).await.unwrap().is_empty());
        assert_eq!(store.acl_page_reads(), 1);
    }

    /// Page totals are ignored: a grant added mid-listing is still returned
    #[tokio::test]
    async fn test_page_count_is_not_trusted() {
        let mut store = MockEntityStore::new();
        store
            .expect_list_acl_page()
            .with(eq("urn:1"), eq(1), eq(2))
            .returning(|_, page, size| {
                let mut p = Page::from_slice(&grants(2), page, size);
                p.page_count = 1;
                Ok(p)
            });
        store
            .expect_list_acl_page()
            .with(eq("urn:1"), eq(2), eq(2))
            .returning(|_, page, size| Ok(Page::from_slice(&grants(3), page, size)));
        store
            .expect_list_acl_page()
            .with(eq("urn:1"), eq(3), eq(2))
            .returning(|_, page, size| Ok(Page::empty(page, size)));

        let all = list_acl(&store, "urn:1", 2).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_error_aborts_listing() {
        let mut store = MockEntityStore::new();
        store
            .expect_list_acl_page()
            .with(always(), eq(1), always())
            .returning(|_, page, size| Ok(Page::from_slice(&grants(1), page, size)));
        store
            .expect_list_acl_page()
            .with(always(), eq(2), always())
            .returning(|_, _, _| Err(Error::unauthorized("expired")));

        let err = list_acl(&store, "urn:1", 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_listing_that_never_ends_is_malformed() {
        let err = collect_pages(1, |page, size| async move {
            Ok(Page::from_slice(&[page], 1, size))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_stream_fetches_lazily() {
        let (store, id) = seeded_store(30);

        let first: Vec<_> = acl_entries(&store, &id, 25).take(10).collect().await;
        assert_eq!(first.len(), 10);
        assert_eq!(store.acl_page_reads(), 1);

        let all: Vec<AclGrant> = acl_entries(&store, &id, 25).try_collect().await.unwrap();
        assert_eq!(all.len(), 30);
    }
}
