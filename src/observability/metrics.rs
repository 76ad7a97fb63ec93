//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `tf_controller_reconciliations_total` - Total number of reconcile ticks
//! - `tf_controller_reconciliation_errors_total` - Failed ticks by reason
//! - `tf_controller_reconciliation_duration_seconds` - Duration of reconcile ticks
//! - `tf_controller_decisions_total` - Transitions chosen by the state machine
//! - `tf_controller_requeues_total` - Requeues by reason
//! - `tf_controller_plans_total` - Completed plans by outcome
//! - `tf_controller_applies_total` - Completed applies
//! - `tf_controller_destroys_total` - Completed destroys on deletion
//! - `tf_controller_drift_detected_total` - Drift checks that found changes
//! - `tf_controller_runner_pods_created_total` / `..._deleted_total` - Runner pod churn
//! - `tf_controller_session_command_duration_seconds` - Session commands by command and outcome
//! - `tf_controller_webhook_denials_total` - Webhook denials by stage
//! - `tf_controller_lock_contention_total` - Attempts that found the state lock held
//! - `tf_controller_status_conflicts_total` - Status writes that lost a resource version race

use anyhow::Result;
use prometheus::{Histogram, HistogramVec, IntCounter, IntCounterVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tf_controller_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "tf_controller_reconciliation_errors_total",
            "Total number of reconciliation errors by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "tf_controller_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static DECISIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "tf_controller_decisions_total",
            "Transitions chosen by the reconcile state machine",
        ),
        &["decision"],
    )
    .expect("Failed to create DECISIONS_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "tf_controller_requeues_total",
            "Total number of requeues by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static PLANS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("tf_controller_plans_total", "Completed plans by outcome"),
        &["outcome"],
    )
    .expect("Failed to create PLANS_TOTAL metric - this should never happen")
});

static APPLIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tf_controller_applies_total", "Completed applies")
        .expect("Failed to create APPLIES_TOTAL metric - this should never happen")
});

static DESTROYS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tf_controller_destroys_total",
        "Completed destroys of deleted resources",
    )
    .expect("Failed to create DESTROYS_TOTAL metric - this should never happen")
});

static DRIFT_DETECTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tf_controller_drift_detected_total",
        "Drift checks that found changes",
    )
    .expect("Failed to create DRIFT_DETECTED_TOTAL metric - this should never happen")
});

static RUNNER_PODS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tf_controller_runner_pods_created_total",
        "Total number of runner pods created",
    )
    .expect("Failed to create RUNNER_PODS_CREATED_TOTAL metric - this should never happen")
});

static RUNNER_PODS_DELETED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tf_controller_runner_pods_deleted_total",
        "Total number of runner pods deleted",
    )
    .expect("Failed to create RUNNER_PODS_DELETED_TOTAL metric - this should never happen")
});

static SESSION_COMMAND_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "tf_controller_session_command_duration_seconds",
            "Duration of runner session commands in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        &["command", "outcome"],
    )
    .expect("Failed to create SESSION_COMMAND_DURATION metric - this should never happen")
});

static WEBHOOK_DENIALS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "tf_controller_webhook_denials_total",
            "Plans denied by a webhook, by stage",
        ),
        &["stage"],
    )
    .expect("Failed to create WEBHOOK_DENIALS_TOTAL metric - this should never happen")
});

static LOCK_CONTENTION_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tf_controller_lock_contention_total",
        "Attempts that found the state lock held by another instance",
    )
    .expect("Failed to create LOCK_CONTENTION_TOTAL metric - this should never happen")
});

static STATUS_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tf_controller_status_conflicts_total",
        "Status writes rejected because of a stale resource version",
    )
    .expect("Failed to create STATUS_CONFLICTS_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
/// Register every metric with [`REGISTRY`]
///
/// Fails if called twice.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PLANS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(APPLIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DESTROYS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DRIFT_DETECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RUNNER_PODS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RUNNER_PODS_DELETED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SESSION_COMMAND_DURATION.clone()))?;
    REGISTRY.register(Box::new(WEBHOOK_DENIALS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LOCK_CONTENTION_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_CONFLICTS_TOTAL.clone()))?;

    Ok(())
}

/// Metrics in the Prometheus text exposition format
#[must_use]
pub fn gather_text() -> String {
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors(reason: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_decisions(decision: &str) {
    DECISIONS_TOTAL.with_label_values(&[decision]).inc();
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

/// `outcome` is `changes` or `no-changes`
pub fn increment_plans(outcome: &str) {
    PLANS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn increment_applies() {
    APPLIES_TOTAL.inc();
}

pub fn increment_destroys() {
    DESTROYS_TOTAL.inc();
}

pub fn increment_drift_detected() {
    DRIFT_DETECTED_TOTAL.inc();
}

pub fn increment_runner_pods_created() {
    RUNNER_PODS_CREATED_TOTAL.inc();
}

pub fn increment_runner_pods_deleted() {
    RUNNER_PODS_DELETED_TOTAL.inc();
}

pub fn observe_session_command(command: &str, outcome: &str, duration: f64) {
    SESSION_COMMAND_DURATION
        .with_label_values(&[command, outcome])
        .observe(duration);
}

pub fn increment_webhook_denials(stage: &str) {
    WEBHOOK_DENIALS_TOTAL.with_label_values(&[stage]).inc();
}

pub fn increment_lock_contention() {
    LOCK_CONTENTION_TOTAL.inc();
}

pub fn increment_status_conflicts() {
    STATUS_CONFLICTS_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labelled_counters_accumulate() {
        let before = REQUEUES_TOTAL.with_label_values(&["blocked"]).get();
        increment_requeues_total("blocked");
        increment_requeues_total("blocked");
        assert_eq!(REQUEUES_TOTAL.with_label_values(&["blocked"]).get(), before + 2);
    }

    #[test]
    fn test_session_histogram_keeps_label_sets_apart() {
        observe_session_command("plan", "success", 2.5);
        observe_session_command("plan", "timeout", 900.0);
        let success = SESSION_COMMAND_DURATION
            .with_label_values(&["plan", "success"])
            .get_sample_count();
        let timeout = SESSION_COMMAND_DURATION
            .with_label_values(&["plan", "timeout"])
            .get_sample_count();
        assert!(success >= 1);
        assert!(timeout >= 1);
    }
}
