//! Controller Metrics
//!
//! Prometheus counters for reconcile outcomes, backend calls and migration
//! status writes. Counters are created unregistered so tests can read them
//! in isolation; the binary registers them with the default registry.

use prometheus::{IntCounterVec, Opts, Registry};

/// Outcome label for a successful call
pub const RESULT_SUCCESS: &str = "success";
/// Outcome label for a failed call
pub const RESULT_FAILURE: &str = "failure";

/// Counters shared by the reconciler and the migration tracker
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Reconcile attempts by result (success, failure, timeout)
    pub reconciles: IntCounterVec,
    /// Backend calls by operation (publish, promote, unpublish) and result
    pub operations: IntCounterVec,
    /// Migration status annotation writes by status and result
    pub migration_updates: IntCounterVec,
}

impl ControllerMetrics {
    /// Create unregistered counters
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            reconciles: IntCounterVec::new(
                Opts::new(
                    "attach_detach_reconcile_total",
                    "AttachmentRequest reconcile attempts",
                ),
                &["result"],
            )?,
            operations: IntCounterVec::new(
                Opts::new(
                    "attach_detach_operations_total",
                    "Backend attach/detach calls",
                ),
                &["op", "result"],
            )?,
            migration_updates: IntCounterVec::new(
                Opts::new(
                    "migration_status_updates_total",
                    "Migration status annotation writes",
                ),
                &["status", "result"],
            )?,
        })
    }

    /// Register all counters with `registry`
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.reconciles.clone()))?;
        registry.register(Box::new(self.operations.clone()))?;
        registry.register(Box::new(self.migration_updates.clone()))?;
        Ok(())
    }

    pub fn record_reconcile(&self, result: &str) {
        self.reconciles.with_label_values(&[result]).inc();
    }

    pub fn record_operation(&self, op: &str, success: bool) {
        self.operations
            .with_label_values(&[op, outcome(success)])
            .inc();
    }

    pub fn record_migration_update(&self, status: &str, success: bool) {
        self.migration_updates
            .with_label_values(&[status, outcome(success)])
            .inc();
    }

    /// Current value of a backend operation counter
    pub fn operation_count(&self, op: &str, success: bool) -> u64 {
        self.operations
            .with_label_values(&[op, outcome(success)])
            .get()
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        RESULT_SUCCESS
    } else {
        RESULT_FAILURE
    }
}
