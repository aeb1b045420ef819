//! Metrics module for credit-grant-service.
//! Provides Prometheus metrics for grant operations, application outcomes and sweeps.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "credit_grant_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Credit grant operations counter (per-tenant metering)
pub static GRANT_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Application status transitions by outcome
pub static APPLICATION_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Credits disbursed by currency
pub static CREDITS_GRANTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Sweep runs by result
pub static SWEEPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Sweep duration histogram
pub static SWEEP_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    GRANT_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "credit_grant_operations_total",
                "Total credit grant operations by tenant and operation type"
            ),
            &["tenant_id", "operation"]
        )
        .expect("Failed to register GRANT_OPERATIONS_TOTAL")
    });

    APPLICATION_OUTCOMES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "credit_grant_application_outcomes_total",
                "Credit grant application transitions by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register APPLICATION_OUTCOMES_TOTAL")
    });

    CREDITS_GRANTED_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "credit_grant_credits_granted_total",
                "Total credits disbursed by tenant and currency"
            ),
            &["tenant_id", "currency"]
        )
        .expect("Failed to register CREDITS_GRANTED_TOTAL")
    });

    SWEEPS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("credit_grant_sweeps_total", "Total sweep runs by result"),
            &["result"]
        )
        .expect("Failed to register SWEEPS_TOTAL")
    });

    SWEEP_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "credit_grant_sweep_duration_seconds",
                "Sweep duration",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
            ),
            &["result"]
        )
        .expect("Failed to register SWEEP_DURATION")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "credit_grant_errors_total",
                "Total errors by type for alerting"
            ),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a credit grant operation.
pub fn record_grant_operation(tenant_id: &str, operation: &str) {
    if let Some(counter) = GRANT_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, operation]).inc();
    }
}

/// Record an application transition.
pub fn record_application_outcome(outcome: &str) {
    if let Some(counter) = APPLICATION_OUTCOMES_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record credits disbursed to a wallet.
pub fn record_credits_granted(tenant_id: &str, currency: &str, amount: f64) {
    if let Some(counter) = CREDITS_GRANTED_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, currency])
            .inc_by(amount.abs());
    }
}

/// Record a completed sweep.
pub fn record_sweep(result: &str, duration_secs: f64) {
    if let Some(counter) = SWEEPS_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
    if let Some(histogram) = SWEEP_DURATION.get() {
        histogram.with_label_values(&[result]).observe(duration_secs);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
