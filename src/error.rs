//! Error types for reconcile-rs.
//!
//! Reconcile failures are not represented here: they are `anyhow::Error`
//! values owned by the caller's reconciler and are always recovered by the
//! worker pool through a rate-limited requeue.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("controller {controller}: change source did not sync within {waited:?}")]
    CacheSync { controller: String, waited: Duration },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("cannot derive key from object: {0}")]
    InvalidObject(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
