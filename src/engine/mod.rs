//! Controller engine: event ingestion, expectations, worker pool and lifecycle.

pub mod adapter;
pub mod control;
pub mod expectations;

pub use adapter::EventAdapter;
pub use control::{Controller, ControllerBuilder, Reconciler};
pub use expectations::ControllerExpectations;
