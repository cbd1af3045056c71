//! Event adapter: change notifications in, queue keys out.
//!
//! Every notification collapses to "this key needs re-evaluation". The
//! adapter does no filtering of its own; deduplication is the queue's job.

use std::sync::Arc;

use tracing::{trace, warn};

use super::expectations::ControllerExpectations;
use crate::error::Result;
use crate::model::{ObjectKey, Resource};
use crate::queue::WorkQueue;
use crate::source::{Deleted, EventHandler};
use crate::telemetry::metrics::ControllerMetrics;

pub struct EventAdapter {
    controller: String,
    queue: Arc<WorkQueue<ObjectKey>>,
    expectations: Option<Arc<ControllerExpectations>>,
    metrics: ControllerMetrics,
}

impl EventAdapter {
    pub fn new(
        controller: impl Into<String>,
        queue: Arc<WorkQueue<ObjectKey>>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            controller: controller.into(),
            queue,
            expectations: None,
            metrics,
        }
    }

    /// Release a key's expectations when its object is deleted.
    pub fn with_expectations(mut self, expectations: Arc<ControllerExpectations>) -> Self {
        self.expectations = Some(expectations);
        self
    }

    fn enqueue(&self, event: &'static str, key: Result<ObjectKey>) {
        match key {
            Ok(key) => {
                trace!(controller = %self.controller, %key, event, "enqueueing");
                self.queue.add(key);
            }
            Err(e) => {
                warn!(controller = %self.controller, event, error = %e, "dropping notification");
                self.metrics.record_invalid_object(&self.controller);
            }
        }
    }
}

impl<T: Resource> EventHandler<T> for EventAdapter {
    fn on_add(&self, obj: &T) {
        self.enqueue("add", obj.object_key());
    }

    fn on_update(&self, _old: &T, new: &T) {
        self.enqueue("update", new.object_key());
    }

    fn on_delete(&self, deleted: &Deleted<T>) {
        let key = match deleted {
            Deleted::Final(obj) => obj.object_key(),
            Deleted::StateUnknown { key, .. } => key.parse(),
        };
        if let (Ok(key), Some(expectations)) = (&key, &self.expectations) {
            expectations.delete_expectations(key);
        }
        self.enqueue("delete", key);
    }
}
