//! Prometheus metrics for billing runs, the retry worker and the store.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_engine_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Billing runs by mode and outcome
pub static BILLING_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Per-account outcomes inside billing runs
pub static ACCOUNT_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices written by live runs
pub static INVOICES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoiced amount in the smallest currency unit
pub static INVOICED_AMOUNT_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Notification delivery failures
pub static NOTIFICATION_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Failed jobs written to the ledger
pub static FAILED_JOBS_RECORDED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Retry attempt outcomes
pub static RETRY_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices moved to overdue by the sweep
pub static OVERDUE_INVOICES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// gRPC request counter
pub static GRPC_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// gRPC request duration histogram
pub static GRPC_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    BILLING_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_runs_total",
                "Total billing runs by mode and outcome"
            ),
            &["mode", "outcome"]
        )
        .expect("Failed to register BILLING_RUNS_TOTAL")
    });

    ACCOUNT_OUTCOMES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_account_outcomes_total",
                "Per-account billing outcomes by cycle"
            ),
            &["cycle", "outcome"]
        )
        .expect("Failed to register ACCOUNT_OUTCOMES_TOTAL")
    });

    INVOICES_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_invoices_created_total",
                "Invoices created by cycle and package"
            ),
            &["cycle", "package_type"]
        )
        .expect("Failed to register INVOICES_CREATED_TOTAL")
    });

    INVOICED_AMOUNT_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_invoiced_amount_total",
                "Invoiced amount in minor units by currency and cycle"
            ),
            &["currency", "cycle"]
        )
        .expect("Failed to register INVOICED_AMOUNT_TOTAL")
    });

    NOTIFICATION_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_notification_failures_total",
                "Notification delivery failures by kind"
            ),
            &["kind"]
        )
        .expect("Failed to register NOTIFICATION_FAILURES_TOTAL")
    });

    FAILED_JOBS_RECORDED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_failed_jobs_recorded_total",
                "Failed jobs written to the ledger by job type"
            ),
            &["job_type"]
        )
        .expect("Failed to register FAILED_JOBS_RECORDED_TOTAL")
    });

    RETRY_OUTCOMES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_retry_outcomes_total",
                "Retry attempt outcomes by job type"
            ),
            &["job_type", "outcome"]
        )
        .expect("Failed to register RETRY_OUTCOMES_TOTAL")
    });

    OVERDUE_INVOICES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_overdue_invoices_total",
                "Invoices marked overdue by invoice type"
            ),
            &["invoice_type"]
        )
        .expect("Failed to register OVERDUE_INVOICES_TOTAL")
    });

    GRPC_REQUESTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_engine_grpc_requests_total", "Total gRPC requests"),
            &["method", "status"]
        )
        .expect("Failed to register GRPC_REQUESTS_TOTAL")
    });

    // Billing runs can take minutes on large tenants
    GRPC_REQUEST_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "billing_engine_grpc_request_duration_seconds",
                "gRPC request duration",
                vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
            ),
            &["method"]
        )
        .expect("Failed to register GRPC_REQUEST_DURATION")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_errors_total",
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

pub fn record_billing_run(mode: &str, outcome: &str) {
    if let Some(counter) = BILLING_RUNS_TOTAL.get() {
        counter.with_label_values(&[mode, outcome]).inc();
    }
}

pub fn record_account_outcome(cycle: &str, outcome: &str) {
    if let Some(counter) = ACCOUNT_OUTCOMES_TOTAL.get() {
        counter.with_label_values(&[cycle, outcome]).inc();
    }
}

/// Record an invoice written by a live run.
pub fn record_invoice_created(cycle: &str, package_type: &str, currency: &str, amount: i64) {
    if let Some(counter) = INVOICES_CREATED_TOTAL.get() {
        counter.with_label_values(&[cycle, package_type]).inc();
    }
    if let Some(counter) = INVOICED_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[currency, cycle])
            .inc_by(amount.unsigned_abs());
    }
}

pub fn record_notification_failure(kind: &str) {
    if let Some(counter) = NOTIFICATION_FAILURES_TOTAL.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn record_failed_job(job_type: &str) {
    if let Some(counter) = FAILED_JOBS_RECORDED_TOTAL.get() {
        counter.with_label_values(&[job_type]).inc();
    }
}

pub fn record_retry_outcome(job_type: &str, outcome: &str) {
    if let Some(counter) = RETRY_OUTCOMES_TOTAL.get() {
        counter.with_label_values(&[job_type, outcome]).inc();
    }
}

pub fn record_overdue_invoice(invoice_type: &str) {
    if let Some(counter) = OVERDUE_INVOICES_TOTAL.get() {
        counter.with_label_values(&[invoice_type]).inc();
    }
}

/// Record a gRPC request.
pub fn record_grpc_request(method: &str, status: &str) {
    if let Some(counter) = GRPC_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[method, status]).inc();
    }
}

/// Record gRPC request duration.
pub fn record_grpc_request_duration(method: &str, duration_secs: f64) {
    if let Some(histogram) = GRPC_REQUEST_DURATION.get() {
        histogram.with_label_values(&[method]).observe(duration_secs);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
