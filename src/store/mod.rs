//! Capability interface over the shared real-time record store that
//! relays handshake messages between the two endpoints.

pub mod memory;
pub mod record;

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;

pub use memory::MemoryStore;
pub use record::{CallStatus, SessionRecord};

pub type Fields = serde_json::Map<String, Value>;

/// Result of a conditional create.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists(Fields),
}

/// One entry of a sub-collection.
#[derive(Debug, Clone, PartialEq)]
pub struct SubItem {
    pub id: String,
    pub data: Value,
}

/// Membership change of a live query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryChange {
    Added { key: String, fields: Fields },
    Modified { key: String, fields: Fields },
    Removed { key: String },
}

pub type OnRecordChange = Box<dyn Fn(Option<Fields>) + Send + Sync>;
pub type OnItemAdded = Box<dyn Fn(SubItem) + Send + Sync>;
pub type OnQueryChange = Box<dyn Fn(QueryChange) + Send + Sync>;

/// Live listener registration. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Listeners are invoked synchronously from inside store operations and
/// must not call back into the store.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn put_record(&self, collection: &str, key: &str, fields: Fields)
        -> Result<(), StoreError>;

    /// Write `fields` only if no record exists under `key`.
    async fn create_record(
        &self,
        collection: &str,
        key: &str,
        fields: Fields,
    ) -> Result<CreateOutcome, StoreError>;

    async fn get_record(&self, collection: &str, key: &str) -> Result<Option<Fields>, StoreError>;

    /// Merge `partial` into an existing record. Fails with `NotFound` if absent.
    async fn update_record(
        &self,
        collection: &str,
        key: &str,
        partial: Fields,
    ) -> Result<(), StoreError>;

    /// Deleting a missing record succeeds.
    async fn delete_record(&self, collection: &str, key: &str) -> Result<(), StoreError>;

    async fn append_to_subcollection(
        &self,
        parent_key: &str,
        sub: &str,
        item: Value,
    ) -> Result<String, StoreError>;

    async fn list_subcollection(&self, parent_key: &str, sub: &str)
        -> Result<Vec<SubItem>, StoreError>;

    async fn delete_item(&self, parent_key: &str, sub: &str, item_id: &str)
        -> Result<(), StoreError>;

    /// Delivers the current value first, then every change. Deletion is `None`.
    async fn subscribe_record(
        &self,
        collection: &str,
        key: &str,
        on_change: OnRecordChange,
    ) -> Result<Subscription, StoreError>;

    /// Delivers the existing backlog first, then live additions.
    async fn subscribe_subcollection(
        &self,
        parent_key: &str,
        sub: &str,
        on_item_added: OnItemAdded,
    ) -> Result<Subscription, StoreError>;

    /// Equality-filtered live query; current matches arrive as `Added`.
    async fn subscribe_query(
        &self,
        collection: &str,
        filters: Vec<(String, Value)>,
        on_change: OnQueryChange,
    ) -> Result<Subscription, StoreError>;
}
