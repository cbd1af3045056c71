//! Controller expectations.
//!
//! A reconciler that creates or deletes dependents records how many
//! notifications it expects to see before its cache reflects those writes.
//! Until the expectations for a key are satisfied (or expire) the reconciler
//! should avoid acting on stale cache state. Deleting the watched object
//! releases its expectations.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::model::ObjectKey;

/// Expectations older than this are considered satisfied.
pub const DEFAULT_EXPECTATIONS_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
struct Expectation {
    add: i64,
    del: i64,
    recorded_at: Instant,
}

impl Expectation {
    fn fulfilled(&self) -> bool {
        self.add <= 0 && self.del <= 0
    }
}

pub struct ControllerExpectations {
    ttl: Duration,
    entries: Mutex<HashMap<ObjectKey, Expectation>>,
}

impl ControllerExpectations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, Expectation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the expectations for `key`.
    pub fn set_expectations(&self, key: &ObjectKey, add: i64, del: i64) {
        trace!(%key, add, del, "setting expectations");
        self.lock().insert(
            key.clone(),
            Expectation {
                add,
                del,
                recorded_at: Instant::now(),
            },
        );
    }

    pub fn expect_creations(&self, key: &ObjectKey, adds: i64) {
        self.set_expectations(key, adds, 0);
    }

    pub fn expect_deletions(&self, key: &ObjectKey, dels: i64) {
        self.set_expectations(key, 0, dels);
    }

    /// Record one observed creation for `key`.
    pub fn creation_observed(&self, key: &ObjectKey) {
        self.lower(key, 1, 0);
    }

    /// Record one observed deletion for `key`.
    pub fn deletion_observed(&self, key: &ObjectKey) {
        self.lower(key, 0, 1);
    }

    fn lower(&self, key: &ObjectKey, add: i64, del: i64) {
        if let Some(exp) = self.lock().get_mut(key) {
            exp.add = exp.add.saturating_sub(add);
            exp.del = exp.del.saturating_sub(del);
            trace!(%key, add = exp.add, del = exp.del, "lowered expectations");
        }
    }

    /// Whether the reconciler may act on `key`.
    ///
    /// True when nothing is recorded, when every expected notification has
    /// been observed, or when the expectations have outlived the TTL.
    pub fn satisfied(&self, key: &ObjectKey) -> bool {
        match self.lock().get(key) {
            None => true,
            Some(exp) => exp.fulfilled() || exp.recorded_at.elapsed() > self.ttl,
        }
    }

    /// Forget everything recorded for `key`.
    pub fn delete_expectations(&self, key: &ObjectKey) {
        if self.lock().remove(key).is_some() {
            trace!(%key, "released expectations");
        }
    }
}

impl Default for ControllerExpectations {
    fn default() -> Self {
        Self::new(DEFAULT_EXPECTATIONS_TTL)
    }
}
