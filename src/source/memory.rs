//! In-process change source backed by a keyed store.
//!
//! Objects are applied and removed directly; every registered handler sees
//! the resulting add/update/delete. Reconcilers read current state back out
//! with [`MemorySource::get`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use tracing::debug;

use super::{ChangeSource, Deleted, EventHandler};
use crate::error::Result;
use crate::model::{ObjectKey, Resource};

pub struct MemorySource<T> {
    store: RwLock<HashMap<ObjectKey, T>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<T>>>>,
    synced: AtomicBool,
}

impl<T: Resource + Clone> MemorySource<T> {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
        }
    }

    fn store(&self) -> RwLockReadGuard<'_, HashMap<ObjectKey, T>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_mut(&self) -> RwLockWriteGuard<'_, HashMap<ObjectKey, T>> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<T>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Insert or replace an object, notifying handlers of an add or update.
    pub fn apply(&self, obj: T) -> Result<ObjectKey> {
        let key = obj.object_key()?;
        let previous = self.store_mut().insert(key.clone(), obj.clone());
        let handlers = self.handlers();
        match previous {
            Some(old) => handlers.iter().for_each(|h| h.on_update(&old, &obj)),
            None => handlers.iter().for_each(|h| h.on_add(&obj)),
        }
        Ok(key)
    }

    /// Remove an object, notifying handlers of the delete. Returns the
    /// removed object, or `None` if the key was unknown.
    pub fn remove(&self, key: &ObjectKey) -> Option<T> {
        let removed = self.store_mut().remove(key)?;
        let deleted = Deleted::Final(removed.clone());
        self.handlers().iter().for_each(|h| h.on_delete(&deleted));
        Some(removed)
    }

    /// Deliver a delete whose final state was missed.
    pub fn remove_unobserved(&self, key: &ObjectKey) -> Option<T> {
        let removed = self.store_mut().remove(key)?;
        let deleted = Deleted::StateUnknown {
            key: key.to_string(),
            last_known: removed.clone(),
        };
        self.handlers().iter().for_each(|h| h.on_delete(&deleted));
        Some(removed)
    }

    /// Current state of an object.
    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.store().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.store().keys().cloned().collect()
    }

    /// Mark the initial snapshot as delivered.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
        debug!(objects = self.store().len(), "memory source synced");
    }
}

impl<T: Resource + Clone> Default for MemorySource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource + Clone> ChangeSource for MemorySource<T> {
    type Object = T;

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Replays current contents to the new handler as adds.
    fn add_event_handler(&self, handler: Arc<dyn EventHandler<T>>) {
        // Held across the replay so no concurrent apply slips between the
        // snapshot and registration.
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for obj in self.store().values() {
            handler.on_add(obj);
        }
        handlers.push(handler);
    }
}
