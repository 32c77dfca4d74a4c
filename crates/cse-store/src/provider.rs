//! Per-caller store access
//!
//! Handlers act on behalf of the caller named in a message. A
//! [`StoreProvider`] hands out an [`EntityStore`] bound to that caller's
//! token, or to the agent's own credentials when the message carries none.

use std::sync::Arc;

use crate::{EntityStore, HttpEntityStore};

/// Trait for obtaining an entity store for a caller
pub trait StoreProvider: Send + Sync {
    /// Store acting with `auth_token`, or with the default credentials if `None`
    fn store_for(&self, auth_token: Option<&str>) -> Arc<dyn EntityStore>;
}

impl StoreProvider for HttpEntityStore {
    fn store_for(&self, auth_token: Option<&str>) -> Arc<dyn EntityStore> {
        match auth_token {
            Some(token) => Arc::new(self.with_auth_token(token)),
            None => Arc::new(self.clone()),
        }
    }
}

/// Provider that returns the same store for every caller
///
/// Used with stores that have no notion of caller identity, such as
/// [`crate::InMemoryEntityStore`].
#[derive(Clone)]
pub struct SharedStore(pub Arc<dyn EntityStore>);

impl StoreProvider for SharedStore {
    fn store_for(&self, _auth_token: Option<&str>) -> Arc<dyn EntityStore> {
        self.0.clone()
    }
}
