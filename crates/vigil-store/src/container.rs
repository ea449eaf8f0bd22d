//! Keyed entry containers with unique-id assignment and size-bounded eviction.
//!
//! [`BoundedContainer`] is generic over its backing map ([`EntryMap`]) and over
//! the ordering used for "sorted" access. The default order is
//! least-recently-updated first, so index 0 of [`BoundedContainer::get_all_sorted`]
//! is the eviction candidate and the last index is the freshest (or "best",
//! for containers that order by a quality score).

use crate::clock;
use crate::lock::{LockCoordinator, LockError, LockKey, DEFAULT_MAX_WAITING};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Default capacity for containers built with [`BoundedContainer::default`].
pub const DEFAULT_MAX_SIZE: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("entry not found: {0}")]
    NotFound(String),
    #[error("entry already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Identity and freshness bookkeeping carried by every stored entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub entry_id: Option<String>,
    pub updated_at: Option<i64>,
}

/// Anything a container can hold.
pub trait Entry {
    fn meta(&self) -> &EntryMeta;
    fn meta_mut(&mut self) -> &mut EntryMeta;

    fn entry_id(&self) -> Option<&str> {
        self.meta().entry_id.as_deref()
    }

    fn updated_at(&self) -> Option<i64> {
        self.meta().updated_at
    }

    /// Release resources tied to the entry. Called when it leaves its container.
    fn destroy(&mut self) {}
}

/// Adapts an arbitrary value into an [`Entry`].
///
/// Serializes as the bare value; the id and stamp live in the snapshot envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    meta: EntryMeta,
    value: T,
}

impl<T> Record<T> {
    pub fn new(value: T) -> Self {
        Self {
            meta: EntryMeta::default(),
            value,
        }
    }

    /// Wrap with an explicit id, used when the key is meaningful (e.g. a cache keyed by owner id).
    pub fn with_id(entry_id: impl Into<String>, value: T) -> Self {
        Self {
            meta: EntryMeta {
                entry_id: Some(entry_id.into()),
                updated_at: None,
            },
            value,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Entry for Record<T> {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntryMeta {
        &mut self.meta
    }
}

impl<T: Serialize> Serialize for Record<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Record<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Record::new)
    }
}

/// Backing storage for a container: an id → entry map.
pub trait EntryMap<E>: Default {
    fn contains(&self, id: &str) -> bool;
    fn get(&self, id: &str) -> Option<&E>;
    fn get_mut(&mut self, id: &str) -> Option<&mut E>;
    fn insert(&mut self, id: String, entry: E) -> Option<E>;
    fn remove(&mut self, id: &str) -> Option<E>;
    fn len(&self) -> usize;
    fn values(&self) -> Box<dyn Iterator<Item = &E> + '_>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> EntryMap<E> for HashMap<String, E> {
    fn contains(&self, id: &str) -> bool {
        self.contains_key(id)
    }
    fn get(&self, id: &str) -> Option<&E> {
        HashMap::get(self, id)
    }
    fn get_mut(&mut self, id: &str) -> Option<&mut E> {
        HashMap::get_mut(self, id)
    }
    fn insert(&mut self, id: String, entry: E) -> Option<E> {
        HashMap::insert(self, id, entry)
    }
    fn remove(&mut self, id: &str) -> Option<E> {
        HashMap::remove(self, id)
    }
    fn len(&self) -> usize {
        HashMap::len(self)
    }
    fn values(&self) -> Box<dyn Iterator<Item = &E> + '_> {
        Box::new(HashMap::values(self))
    }
}

impl<E> EntryMap<E> for BTreeMap<String, E> {
    fn contains(&self, id: &str) -> bool {
        self.contains_key(id)
    }
    fn get(&self, id: &str) -> Option<&E> {
        BTreeMap::get(self, id)
    }
    fn get_mut(&mut self, id: &str) -> Option<&mut E> {
        BTreeMap::get_mut(self, id)
    }
    fn insert(&mut self, id: String, entry: E) -> Option<E> {
        BTreeMap::insert(self, id, entry)
    }
    fn remove(&mut self, id: &str) -> Option<E> {
        BTreeMap::remove(self, id)
    }
    fn len(&self) -> usize {
        BTreeMap::len(self)
    }
    fn values(&self) -> Box<dyn Iterator<Item = &E> + '_> {
        Box::new(BTreeMap::values(self))
    }
}

/// Ordering used for sorted access and eviction (smallest = evicted first).
pub type Order<E> = fn(&E, &E) -> Ordering;

/// Callback run on every entry leaving the container (removal or eviction).
pub type DestroyHook<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Least-recently-updated first.
pub fn by_updated_at<E: Entry>(a: &E, b: &E) -> Ordering {
    a.updated_at().cmp(&b.updated_at())
}

/// Generic keyed store with lazy id assignment and eviction past `max_size`.
pub struct BoundedContainer<E, M = HashMap<String, E>> {
    entries: M,
    max_size: Option<usize>,
    order: Order<E>,
    coordinator: Arc<LockCoordinator>,
    on_destroy: Option<DestroyHook<E>>,
}

/// The in-memory map container used throughout vigil.
pub type MapContainer<E> = BoundedContainer<E, HashMap<String, E>>;

impl<E: Entry, M: EntryMap<E>> BoundedContainer<E, M> {
    /// Create a container holding at most `max_size` entries (`None` = unbounded).
    pub fn new(max_size: Option<usize>) -> Self {
        Self::with_max_waiting(max_size, DEFAULT_MAX_WAITING)
    }

    pub fn with_max_waiting(max_size: Option<usize>, max_waiting: usize) -> Self {
        Self {
            entries: M::default(),
            max_size,
            order: by_updated_at::<E>,
            coordinator: Arc::new(LockCoordinator::new(max_waiting)),
            on_destroy: None,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Replace the ordering used for sorted access and eviction.
    pub fn with_order(mut self, order: Order<E>) -> Self {
        self.order = order;
        self
    }

    pub fn set_on_destroy(&mut self, hook: DestroyHook<E>) {
        self.on_destroy = Some(hook);
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    pub fn coordinator(&self) -> &Arc<LockCoordinator> {
        &self.coordinator
    }

    pub fn is_locked(&self) -> bool {
        self.coordinator.is_locked()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a new entry and return its id.
    ///
    /// Reuses the entry's own id when it has one; fails with `AlreadyExists`
    /// if that id is taken. Otherwise a fresh collision-free id is generated.
    /// Evicts the lowest-ordered entries afterwards if the capacity is exceeded.
    pub fn add(&mut self, mut entry: E, key: Option<LockKey>) -> Result<String, ContainerError> {
        self.coordinator.check(key)?;

        let entry_id = match entry.entry_id() {
            Some(id) if self.entries.contains(id) => {
                return Err(ContainerError::AlreadyExists(id.to_string()));
            }
            Some(id) => id.to_string(),
            None => self.generate_id(),
        };

        let meta = entry.meta_mut();
        meta.entry_id = Some(entry_id.clone());
        meta.updated_at = Some(clock::next_stamp());
        self.entries.insert(entry_id.clone(), entry);

        self.check_max_size();
        Ok(entry_id)
    }

    /// Replace the entry stored under `entry_id`. The new entry takes over the id.
    pub fn update(
        &mut self,
        entry_id: &str,
        mut entry: E,
        key: Option<LockKey>,
    ) -> Result<(), ContainerError> {
        self.coordinator.check(key)?;

        if !self.entries.contains(entry_id) {
            return Err(ContainerError::NotFound(entry_id.to_string()));
        }

        let meta = entry.meta_mut();
        meta.entry_id = Some(entry_id.to_string());
        meta.updated_at = Some(clock::next_stamp());
        self.entries.insert(entry_id.to_string(), entry);
        Ok(())
    }

    /// Add the entry, or update it in place when its id is already stored.
    pub fn add_or_update(&mut self, entry: E, key: Option<LockKey>) -> Result<String, ContainerError> {
        match entry.entry_id().map(str::to_string) {
            Some(id) if self.entries.contains(&id) => {
                self.update(&id, entry, key)?;
                Ok(id)
            }
            _ => self.add(entry, key),
        }
    }

    /// Mutate a stored entry in place; counts as an update.
    pub fn update_with<R>(
        &mut self,
        entry_id: &str,
        key: Option<LockKey>,
        f: impl FnOnce(&mut E) -> R,
    ) -> Result<R, ContainerError> {
        self.coordinator.check(key)?;

        let entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ContainerError::NotFound(entry_id.to_string()))?;
        let result = f(entry);
        entry.meta_mut().updated_at = Some(clock::next_stamp());
        Ok(result)
    }

    pub fn has(&self, entry_id: &str) -> bool {
        self.entries.contains(entry_id)
    }

    pub fn get(&self, entry_id: &str) -> Result<&E, ContainerError> {
        self.entries
            .get(entry_id)
            .ok_or_else(|| ContainerError::NotFound(entry_id.to_string()))
    }

    /// Remove an entry, running its destroy hooks, and hand it back.
    pub fn remove(&mut self, entry_id: &str, key: Option<LockKey>) -> Result<E, ContainerError> {
        self.coordinator.check(key)?;
        self.detach(entry_id)
    }

    pub fn get_all(&self) -> Vec<&E> {
        self.entries.values().collect()
    }

    /// All entries in container order; ties fall back to id order.
    pub fn get_all_sorted(&self) -> Vec<&E> {
        let mut entries = self.get_all();
        entries.sort_by(|a, b| (self.order)(a, b).then_with(|| a.entry_id().cmp(&b.entry_id())));
        entries
    }

    /// Highest-ordered entry (freshest, or best-scoring for score orders).
    pub fn last(&self) -> Option<&E> {
        self.get_all_sorted().pop()
    }

    /// Insert an entry exactly as previously persisted.
    ///
    /// Keeps the entry's id and stamp when present, replacing any entry with
    /// the same id. Not gated by the lock: used while loading, before the
    /// container is shared.
    pub fn restore(&mut self, mut entry: E) -> String {
        let entry_id = match entry.entry_id() {
            Some(id) => id.to_string(),
            None => self.generate_id(),
        };

        let meta = entry.meta_mut();
        meta.entry_id = Some(entry_id.clone());
        match meta.updated_at {
            Some(stamp) if clock::is_plausible(stamp) => clock::observe(stamp),
            Some(stamp) => {
                tracing::warn!(entry = %entry_id, stamp, "update stamp lies in the future; re-stamping");
                meta.updated_at = Some(clock::next_stamp());
            }
            None => meta.updated_at = Some(clock::next_stamp()),
        }

        self.entries.insert(entry_id.clone(), entry);
        entry_id
    }

    /// Evict until the capacity holds. No-op for unbounded containers.
    pub fn check_max_size(&mut self) {
        let Some(max_size) = self.max_size else {
            return;
        };

        while self.entries.len() > max_size {
            let Some(victim) = self
                .get_all_sorted()
                .first()
                .and_then(|e| e.entry_id())
                .map(str::to_string)
            else {
                break;
            };
            tracing::debug!(entry = %victim, max_size, "evicting entry");
            if self.detach(&victim).is_err() {
                break;
            }
        }
    }

    fn detach(&mut self, entry_id: &str) -> Result<E, ContainerError> {
        let mut entry = self
            .entries
            .remove(entry_id)
            .ok_or_else(|| ContainerError::NotFound(entry_id.to_string()))?;

        entry.destroy();
        if let Some(hook) = &self.on_destroy {
            hook(&entry);
        }
        Ok(entry)
    }

    fn generate_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if !self.entries.contains(&id) {
                return id;
            }
        }
    }
}

impl<E: Entry, M: EntryMap<E>> Default for BoundedContainer<E, M> {
    fn default() -> Self {
        Self::new(Some(DEFAULT_MAX_SIZE))
    }
}

/// Clones carry the entries, capacity, ordering and hook, but get their own
/// (unlocked) coordinator.
impl<E: Entry + Clone, M: EntryMap<E> + Clone> Clone for BoundedContainer<E, M> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            max_size: self.max_size,
            order: self.order,
            coordinator: Arc::new(LockCoordinator::new(self.coordinator.max_waiting())),
            on_destroy: self.on_destroy.clone(),
        }
    }
}

impl<E: Entry + std::fmt::Debug, M: EntryMap<E>> std::fmt::Debug for BoundedContainer<E, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedContainer")
            .field("max_size", &self.max_size)
            .field("entries", &self.get_all_sorted())
            .finish()
    }
}
