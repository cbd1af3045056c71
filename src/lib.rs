//! # reconcile-rs
//!
//! Level-triggered reconciliation engine.
//!
//! A [`source::ChangeSource`] reports object adds, updates and deletes; the
//! [`engine::EventAdapter`] turns each into a key on a deduplicating,
//! rate-limited [`queue::WorkQueue`]; a pool of workers run by
//! [`engine::Controller`] hands each key to a caller-supplied
//! [`engine::Reconciler`] and requeues it with backoff on failure.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod queue;
pub mod source;
pub mod telemetry;
