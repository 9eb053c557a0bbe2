use super::{
    CreateOutcome, Fields, OnItemAdded, OnQueryChange, OnRecordChange, QueryChange,
    SignalingStore, SubItem, Subscription,
};
use crate::error::StoreError;
use crate::utils::random_id;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type RecordId = (String, String);

struct RecordListener {
    target: RecordId,
    cb: OnRecordChange,
}

struct ItemListener {
    target: RecordId,
    cb: OnItemAdded,
}

struct QueryListener {
    collection: String,
    filters: Vec<(String, Value)>,
    matched: HashSet<String>,
    cb: OnQueryChange,
}

impl QueryListener {
    fn matches(&self, fields: &Fields) -> bool {
        self.filters
            .iter()
            .all(|(name, want)| fields.get(name) == Some(want))
    }
}

struct Inner {
    online: bool,
    next_id: u64,
    records: HashMap<RecordId, Fields>,
    items: HashMap<RecordId, Vec<SubItem>>,
    record_listeners: HashMap<u64, RecordListener>,
    item_listeners: HashMap<u64, ItemListener>,
    query_listeners: HashMap<u64, QueryListener>,
    delete_calls: HashMap<RecordId, usize>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            online: true,
            next_id: 0,
            records: HashMap::new(),
            items: HashMap::new(),
            record_listeners: HashMap::new(),
            item_listeners: HashMap::new(),
            query_listeners: HashMap::new(),
            delete_calls: HashMap::new(),
        }
    }
}

impl Inner {
    fn check_online(&self) -> Result<(), StoreError> {
        if self.online {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn listener_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // Fan a record change out to record and query listeners, in write order.
    fn notify_record(&mut self, collection: &str, key: &str) {
        let id = (collection.to_string(), key.to_string());
        let current = self.records.get(&id).cloned();
        for l in self.record_listeners.values().filter(|l| l.target == id) {
            (l.cb)(current.clone());
        }
        for q in self
            .query_listeners
            .values_mut()
            .filter(|q| q.collection == collection)
        {
            let now = current.as_ref().map(|f| q.matches(f)).unwrap_or(false);
            let was = q.matched.contains(key);
            let change = match (now, was, &current) {
                (true, false, Some(f)) => {
                    q.matched.insert(key.to_string());
                    Some(QueryChange::Added {
                        key: key.to_string(),
                        fields: f.clone(),
                    })
                }
                (true, true, Some(f)) => Some(QueryChange::Modified {
                    key: key.to_string(),
                    fields: f.clone(),
                }),
                (false, true, _) => {
                    q.matched.remove(key);
                    Some(QueryChange::Removed {
                        key: key.to_string(),
                    })
                }
                _ => None,
            };
            if let Some(change) = change {
                (q.cb)(change);
            }
        }
    }
}

/// In-process signaling store.
///
/// Listeners run while the store lock is held, which gives every
/// subscriber the same total order of changes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_online(&self, online: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.online = online;
        }
    }

    pub fn record_count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .map(|i| i.records.keys().filter(|(c, _)| c == collection).count())
            .unwrap_or(0)
    }

    pub fn item_count(&self, parent_key: &str, sub: &str) -> usize {
        self.inner
            .lock()
            .map(|i| {
                i.items
                    .get(&(parent_key.to_string(), sub.to_string()))
                    .map(Vec::len)
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .map(|i| i.record_listeners.len() + i.item_listeners.len() + i.query_listeners.len())
            .unwrap_or(0)
    }

    /// Number of `delete_record` calls made against a key.
    pub fn delete_calls(&self, collection: &str, key: &str) -> usize {
        self.inner
            .lock()
            .map(|i| {
                i.delete_calls
                    .get(&(collection.to_string(), key.to_string()))
                    .copied()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Read a record bypassing connectivity simulation.
    pub fn peek(&self, collection: &str, key: &str) -> Option<Fields> {
        self.inner.lock().ok().and_then(|i| {
            i.records
                .get(&(collection.to_string(), key.to_string()))
                .cloned()
        })
    }

    fn weak(&self) -> Weak<Mutex<Inner>> {
        Arc::downgrade(&self.inner)
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn put_record(
        &self,
        collection: &str,
        key: &str,
        fields: Fields,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check_online()?;
        inner
            .records
            .insert((collection.to_string(), key.to_string()), fields);
        inner.notify_record(collection, key);
        Ok(())
    }

    async fn create_record(
        &self,
        collection: &str,
        key: &str,
        fields: Fields,
    ) -> Result<CreateOutcome, StoreError> {
        let mut inner = self.lock()?;
        inner.check_online()?;
        let id = (collection.to_string(), key.to_string());
        if let Some(existing) = inner.records.get(&id) {
            return Ok(CreateOutcome::AlreadyExists(existing.clone()));
        }
        inner.records.insert(id, fields);
        inner.notify_record(collection, key);
        Ok(CreateOutcome::Created)
    }

    async fn get_record(&self, collection: &str, key: &str) -> Result<Option<Fields>, StoreError> {
        let inner = self.lock()?;
        inner.check_online()?;
        Ok(inner
            .records
            .get(&(collection.to_string(), key.to_string()))
            .cloned())
    }

    async fn update_record(
        &self,
        collection: &str,
        key: &str,
        partial: Fields,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check_online()?;
        let id = (collection.to_string(), key.to_string());
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        for (name, value) in partial {
            record.insert(name, value);
        }
        inner.notify_record(collection, key);
        Ok(())
    }

    async fn delete_record(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check_online()?;
        let id = (collection.to_string(), key.to_string());
        *inner.delete_calls.entry(id.clone()).or_insert(0) += 1;
        if inner.records.remove(&id).is_some() {
            inner.notify_record(collection, key);
        }
        Ok(())
    }

    async fn append_to_subcollection(
        &self,
        parent_key: &str,
        sub: &str,
        item: Value,
    ) -> Result<String, StoreError> {
        let mut inner = self.lock()?;
        inner.check_online()?;
        let target = (parent_key.to_string(), sub.to_string());
        let entry = SubItem {
            id: random_id(),
            data: item,
        };
        inner
            .items
            .entry(target.clone())
            .or_default()
            .push(entry.clone());
        for l in inner.item_listeners.values().filter(|l| l.target == target) {
            (l.cb)(entry.clone());
        }
        Ok(entry.id)
    }

    async fn list_subcollection(
        &self,
        parent_key: &str,
        sub: &str,
    ) -> Result<Vec<SubItem>, StoreError> {
        let inner = self.lock()?;
        inner.check_online()?;
        Ok(inner
            .items
            .get(&(parent_key.to_string(), sub.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_item(
        &self,
        parent_key: &str,
        sub: &str,
        item_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.check_online()?;
        let target = (parent_key.to_string(), sub.to_string());
        let now_empty = match inner.items.get_mut(&target) {
            Some(items) => {
                items.retain(|i| i.id != item_id);
                items.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.items.remove(&target);
        }
        Ok(())
    }

    async fn subscribe_record(
        &self,
        collection: &str,
        key: &str,
        on_change: OnRecordChange,
    ) -> Result<Subscription, StoreError> {
        let mut inner = self.lock()?;
        inner.check_online()?;
        let target = (collection.to_string(), key.to_string());
        on_change(inner.records.get(&target).cloned());
        let id = inner.listener_id();
        inner.record_listeners.insert(
            id,
            RecordListener {
                target,
                cb: on_change,
            },
        );
        let weak = self.weak();
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut inner) = inner.lock() {
                    inner.record_listeners.remove(&id);
                }
            }
        }))
    }

    async fn subscribe_subcollection(
        &self,
        parent_key: &str,
        sub: &str,
        on_item_added: OnItemAdded,
    ) -> Result<Subscription, StoreError> {
        let mut inner = self.lock()?;
        inner.check_online()?;
        let target = (parent_key.to_string(), sub.to_string());
        if let Some(backlog) = inner.items.get(&target) {
            for item in backlog {
                on_item_added(item.clone());
            }
        }
        let id = inner.listener_id();
        inner.item_listeners.insert(
            id,
            ItemListener {
                target,
                cb: on_item_added,
            },
        );
        let weak = self.weak();
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut inner) = inner.lock() {
                    inner.item_listeners.remove(&id);
                }
            }
        }))
    }

    async fn subscribe_query(
        &self,
        collection: &str,
        filters: Vec<(String, Value)>,
        on_change: OnQueryChange,
    ) -> Result<Subscription, StoreError> {
        let mut inner = self.lock()?;
        inner.check_online()?;
        let mut listener = QueryListener {
            collection: collection.to_string(),
            filters,
            matched: HashSet::new(),
            cb: on_change,
        };
        let mut backlog: Vec<(&String, &Fields)> = inner
            .records
            .iter()
            .filter(|((c, _), f)| c == collection && listener.matches(f))
            .map(|((_, k), f)| (k, f))
            .collect();
        backlog.sort_by(|a, b| a.0.cmp(b.0));
        for (key, fields) in backlog {
            listener.matched.insert(key.clone());
            (listener.cb)(QueryChange::Added {
                key: key.clone(),
                fields: fields.clone(),
            });
        }
        let id = inner.listener_id();
        inner.query_listeners.insert(id, listener);
        let weak = self.weak();
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut inner) = inner.lock() {
                    inner.query_listeners.remove(&id);
                }
            }
        }))
    }
}
