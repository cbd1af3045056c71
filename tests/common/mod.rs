//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use reconcile_rs::config::ControllerConfig;
use reconcile_rs::error::{Error, Result};
use reconcile_rs::model::{ObjectKey, Resource};

/// A watched object for tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Widget {
    pub namespace: String,
    pub name: String,
    pub generation: u64,
}

impl Widget {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            generation: 1,
        }
    }

    pub fn bumped(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self.clone()
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.object_key().expect("widget key")
    }
}

impl Resource for Widget {
    fn object_key(&self) -> Result<ObjectKey> {
        if self.name.is_empty() {
            return Err(Error::InvalidObject("widget has no name".to_string()));
        }
        ObjectKey::namespaced(&self.namespace, &self.name)
    }
}

/// Controller settings tuned for fast tests.
pub fn fast_config(workers: usize) -> ControllerConfig {
    ControllerConfig {
        workers,
        sync_poll_interval: Duration::from_millis(10),
        cache_sync_timeout: Some(Duration::from_secs(5)),
        ..ControllerConfig::default()
    }
}

/// Poll `cond` every 5ms until it holds. Panics after `limit`.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
