//! Reconcile span helpers.

use tracing::Span;
use uuid::Uuid;

use crate::model::ObjectKey;

/// Start a span for one reconcile of `key`.
///
/// The `reconcile.outcome` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_reconcile_span(controller: &str, run_id: &Uuid, worker: usize, key: &ObjectKey) -> Span {
    tracing::info_span!(
        "reconcile.key",
        "reconcile.controller" = controller,
        "reconcile.run_id" = %run_id,
        "reconcile.worker" = worker,
        "reconcile.key" = %key,
        "reconcile.outcome" = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("reconcile.outcome", outcome);
}
