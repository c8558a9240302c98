//! Key cache metrics for observability
//!
//! Enable with the `metrics` feature flag. Requires a `metrics` recorder
//! to be installed (e.g., via `metrics-exporter-prometheus`).
//!
//! ## Metrics Provided
//!
//! - `certkeeper_key_refresh_total` - Counter for refresh attempts (labels: status)
//! - `certkeeper_token_verifications_total` - Counter for verify calls (labels: outcome)
//! - `certkeeper_cached_keys` - Gauge with the number of keys in the current table
//!
//! ## Example
//!
//! ```rust
//! use certkeeper::init_key_metrics;
//!
//! // Initialize metric descriptions once at startup
//! init_key_metrics();
//! ```

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, describe_gauge, gauge};

#[cfg(feature = "metrics")]
use std::sync::Once;

#[cfg(feature = "metrics")]
static INIT: Once = Once::new();

/// Initialize key cache metric descriptions. Call once at startup.
///
/// Idempotent; only the first call registers the descriptions.
#[cfg(feature = "metrics")]
pub fn init_key_metrics() {
    INIT.call_once(|| {
        describe_counter!(
            "certkeeper_key_refresh_total",
            "Key document refresh attempts (success and failure)"
        );
        describe_counter!(
            "certkeeper_token_verifications_total",
            "Token verification calls by outcome"
        );
        describe_gauge!(
            "certkeeper_cached_keys",
            "Number of signing keys in the current key table"
        );
    });
}

/// Record a refresh attempt
#[cfg(feature = "metrics")]
pub(crate) fn record_refresh(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("certkeeper_key_refresh_total", "status" => status).increment(1);
}

/// Record a verification call (`accepted` or the rejection kind)
#[cfg(feature = "metrics")]
pub(crate) fn record_verification(outcome: &'static str) {
    counter!("certkeeper_token_verifications_total", "outcome" => outcome).increment(1);
}

/// Publish the size of the key table
#[cfg(feature = "metrics")]
pub(crate) fn record_cached_keys(count: usize) {
    gauge!("certkeeper_cached_keys").set(count as f64);
}

// No-op versions when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
#[allow(missing_docs)]
pub fn init_key_metrics() {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_refresh(_success: bool) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_verification(_outcome: &'static str) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_cached_keys(_count: usize) {}
