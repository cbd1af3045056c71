//! Metric instruments for the controller.
//!
//! Instruments are built from an injected [`Meter`]; [`ControllerMetrics::global`]
//! uses the globally-registered `MeterProvider`, which is a no-op until
//! telemetry is initialized with an OTLP endpoint.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Outcome label for a single reconcile call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Ok,
    Error,
    Panic,
}

impl RunResult {
    pub fn as_str(self) -> &'static str {
        match self {
            RunResult::Ok => "ok",
            RunResult::Error => "error",
            RunResult::Panic => "panic",
        }
    }
}

/// Instruments recorded by the event adapter and worker pool.
/// Every data point carries a `controller` label.
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Labels: `controller`, `result`.
    runs: Counter<u64>,
    requeues: Counter<u64>,
    dropped: Counter<u64>,
    invalid_objects: Counter<u64>,
    duration_ms: Histogram<f64>,
}

impl ControllerMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            runs: meter
                .u64_counter("reconcile.runs")
                .with_description("Number of reconcile calls by result")
                .build(),
            requeues: meter
                .u64_counter("reconcile.requeues")
                .with_description("Keys requeued with backoff after a failed reconcile")
                .build(),
            dropped: meter
                .u64_counter("reconcile.dropped")
                .with_description("Keys dropped after exhausting their retry budget")
                .build(),
            invalid_objects: meter
                .u64_counter("reconcile.invalid_objects")
                .with_description("Notifications whose object yielded no usable key")
                .build(),
            duration_ms: meter
                .f64_histogram("reconcile.duration_ms")
                .with_description("Reconcile call duration in milliseconds")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter("reconcile-rs"))
    }

    pub fn record_run(&self, controller: &str, result: RunResult, duration_ms: f64) {
        let labels = [
            KeyValue::new("controller", controller.to_string()),
            KeyValue::new("result", result.as_str()),
        ];
        self.runs.add(1, &labels);
        self.duration_ms.record(duration_ms, &labels);
    }

    pub fn record_requeue(&self, controller: &str) {
        self.requeues
            .add(1, &[KeyValue::new("controller", controller.to_string())]);
    }

    pub fn record_dropped(&self, controller: &str) {
        self.dropped
            .add(1, &[KeyValue::new("controller", controller.to_string())]);
    }

    pub fn record_invalid_object(&self, controller: &str) {
        self.invalid_objects
            .add(1, &[KeyValue::new("controller", controller.to_string())]);
    }
}
