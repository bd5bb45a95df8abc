//! Prometheus metrics for KMS operations.
//!
//! Two process-wide instruments, registered once and shared by every plugin:
//! an operation counter and a latency histogram, both labeled by
//! `{key_arn, status, operation, version}`.

use std::time::Instant;

use once_cell::sync::Lazy;
use prometheus::{exponential_buckets, register_counter_vec, register_histogram_vec};
use prometheus::{CounterVec, HistogramVec};

use crate::error::{ErrorKind, ProviderError};

/// `status` label for a completed operation.
pub const STATUS_SUCCESS: &str = "success";
/// `status` label for a failed operation.
pub const STATUS_FAILURE: &str = "failure";
/// `status` label for an operation rejected by service-side throttling.
pub const STATUS_FAILURE_THROTTLE: &str = "failure-throttle";

/// `operation` label for encrypt calls.
pub const OPERATION_ENCRYPT: &str = "encrypt";
/// `operation` label for decrypt calls.
pub const OPERATION_DECRYPT: &str = "decrypt";

const LABELS: &[&str] = &["key_arn", "status", "operation", "version"];

/// Total KMS operations performed by the provider.
pub static KMS_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "aws_encryption_provider_kms_operations_total",
        "Total KMS operations performed by the encryption provider",
        LABELS
    )
    .expect("Failed to register kms_operations metric")
});

/// KMS operation latency in milliseconds.
pub static KMS_OPERATION_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "aws_encryption_provider_kms_operation_latency_ms",
        "Response latency in milliseconds for KMS operations",
        LABELS,
        exponential_buckets(2.0, 2.0, 14).expect("Failed to build latency buckets")
    )
    .expect("Failed to register kms_operation_latency metric")
});

/// Milliseconds elapsed since `started`.
pub fn millis_since(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Computes the `status` label for an operation outcome.
pub fn status_label(err: Option<&ProviderError>) -> &'static str {
    match err {
        None => STATUS_SUCCESS,
        Some(err) if ErrorKind::of(err) == ErrorKind::Throttled => STATUS_FAILURE_THROTTLE,
        Some(_) => STATUS_FAILURE,
    }
}

/// Records one terminal encrypt/decrypt outcome: exactly one counter
/// increment and one latency observation.
pub fn record_operation(
    key_arn: &str,
    operation: &str,
    version: &str,
    err: Option<&ProviderError>,
    started: Instant,
) {
    let status = status_label(err);
    KMS_OPERATION_LATENCY
        .with_label_values(&[key_arn, status, operation, version])
        .observe(millis_since(started));
    KMS_OPERATIONS
        .with_label_values(&[key_arn, status, operation, version])
        .inc();
}
