//! Out-of-band records emitted by the controller.
//!
//! Failures are normally absorbed by rate-limited requeues. When a
//! controller has a retry budget, a key that exhausts it is forgotten and a
//! [`DeadLetter`] is sent to whoever the caller wired up to receive them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::ObjectKey;

/// A key the controller gave up on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Controller that dropped the key.
    pub controller: String,
    /// Identifies the controller instance (one per `ControllerBuilder::build`).
    pub run_id: Uuid,
    pub key: ObjectKey,
    /// Reconcile attempts made, including the last one.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last_error: String,
    pub at: DateTime<Utc>,
}
