//! Change source contract.
//!
//! A change source is an eventually-consistent, cache-backed stream of object
//! notifications. The controller registers an [`EventHandler`] with it and
//! refuses to start workers until the source reports that its initial
//! snapshot has been delivered.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

pub use memory::MemorySource;

/// Payload of a delete notification.
#[derive(Debug, Clone)]
pub enum Deleted<T> {
    /// The object as it was when deleted.
    Final(T),
    /// The deletion was missed (e.g. across a relist) and only the key the
    /// cache held for it is known, alongside the last state it observed.
    StateUnknown { key: String, last_known: T },
}

impl<T> Deleted<T> {
    /// The last known state of the deleted object.
    pub fn object(&self) -> &T {
        match self {
            Deleted::Final(obj) => obj,
            Deleted::StateUnknown { last_known, .. } => last_known,
        }
    }
}

/// Callbacks a change source invokes for every notification.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, obj: &T);
    fn on_update(&self, old: &T, new: &T);
    fn on_delete(&self, deleted: &Deleted<T>);
}

/// An external source of object change notifications.
pub trait ChangeSource: Send + Sync + 'static {
    type Object: Send + Sync + 'static;

    /// True once the initial snapshot has been delivered to all handlers.
    fn has_synced(&self) -> bool;

    /// Register a handler for all future notifications.
    fn add_event_handler(&self, handler: Arc<dyn EventHandler<Self::Object>>);
}

/// Outcome of waiting for a source to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    TimedOut,
}

/// Poll `has_synced` every `poll_interval` until it holds or `timeout`
/// elapses. A `timeout` of `None` waits indefinitely.
pub async fn wait_for_cache_sync<S>(
    source: &S,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> SyncOutcome
where
    S: ChangeSource + ?Sized,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if source.has_synced() {
            return SyncOutcome::Synced;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return SyncOutcome::TimedOut;
        }
    }
}
