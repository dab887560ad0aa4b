//! Prometheus metrics for the provisioning controller
//!
//! Registered in the default registry on first use and served by the
//! binary's `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

/// Provisioning attempts by outcome
pub static PROVISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "volume_provisioner_provisions_total",
        "Provisioning attempts by outcome",
        &["outcome"]
    )
    .expect("provisions metric")
});

/// Time spent in the provisioner's `provision` call
pub static PROVISION_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "volume_provisioner_provision_duration_seconds",
        "Duration of provision calls"
    )
    .expect("provision duration metric")
});

/// Claims bound to an existing or new volume
pub static BINDS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "volume_provisioner_binds_total",
        "Claims bound to a volume"
    )
    .expect("binds metric")
});

/// Claim syncs that ended in an error
pub static SYNC_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "volume_provisioner_sync_errors_total",
        "Claim syncs that failed"
    )
    .expect("sync errors metric")
});

/// Keys waiting in the work queue
pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "volume_provisioner_queue_depth",
        "Claims waiting in the work queue"
    )
    .expect("queue depth metric")
});

pub const OUTCOME_SUCCEEDED: &str = "succeeded";
pub const OUTCOME_FAILED: &str = "failed";
pub const OUTCOME_CLEANED_UP: &str = "cleaned_up";

pub fn record_provision(outcome: &str) {
    PROVISIONS.with_label_values(&[outcome]).inc();
}

/// Every registered metric in the text exposition format
pub fn encode() -> crate::error::Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| crate::error::Error::Internal(format!("encoding metrics: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}
