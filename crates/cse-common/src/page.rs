//! Paged listing envelope

use serde::{Deserialize, Serialize};

/// First page number; pages are 1-based
pub const FIRST_PAGE_NUMBER: u32 = 1;

/// Default page size for listings
pub const DEFAULT_PAGE_SIZE: u32 = 25;

/// One page of a listing as returned by the entity store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    /// Items on this page; empty once the listing is exhausted
    pub values: Vec<T>,
    /// Total number of pages at the time of the query
    #[serde(default)]
    pub page_count: u32,
    /// Total number of items at the time of the query
    #[serde(default)]
    pub result_total: u64,
    /// Page number this page was fetched with
    #[serde(default)]
    pub page: u32,
    /// Page size this page was fetched with
    #[serde(default)]
    pub page_size: u32,
    /// Link to the next page, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_uri: Option<String>,
    /// Link to the previous page, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_page_uri: Option<String>,
}

impl<T> Page<T> {
    /// Page with no values
    pub fn empty(page: u32, page_size: u32) -> Self {
        Self {
            values: Vec::new(),
            page_count: 0,
            result_total: 0,
            page,
            page_size,
            next_page_uri: None,
            previous_page_uri: None,
        }
    }

    /// Whether this page terminates a pull-until-empty iteration
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Slice `items` into the given 1-based page
    pub fn from_slice(items: &[T], page: u32, page_size: u32) -> Self
    where
        T: Clone,
    {
        let total = items.len();
        let size = page_size.max(1) as usize;
        let start = (page.max(FIRST_PAGE_NUMBER) as usize - 1).saturating_mul(size);
        let values = items.iter().skip(start).take(size).cloned().collect();
        Self {
            values,
            page_count: total.div_ceil(size) as u32,
            result_total: total as u64,
            page,
            page_size,
            next_page_uri: None,
            previous_page_uri: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_splits_thirty_items_into_25_and_5() {
        let items: Vec<u32> = (0..30).collect();

        let first = Page::from_slice(&items, 1, 25);
        assert_eq!(first.values.len(), 25);
        assert_eq!(first.page_count, 2);
        assert_eq!(first.result_total, 30);

        let second = Page::from_slice(&items, 2, 25);
        assert_eq!(second.values, (25..30).collect::<Vec<_>>());

        assert!(Page::from_slice(&items, 3, 25).is_empty());
    }

    #[test]
    fn test_envelope_field_names() {
        let json = serde_json::json!({
            "values": ["a"],
            "pageCount": 1,
            "resultTotal": 1,
            "nextPageUri": null,
            "previousPageUri": null
        });
        let page: Page<String> = serde_json::from_value(json).unwrap();
        assert_eq!(page.values, vec!["a".to_string()]);
        assert_eq!(page.page_count, 1);
        assert!(page.next_page_uri.is_none());
    }
}
