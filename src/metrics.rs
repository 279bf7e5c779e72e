// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {
    Count,
    Milliseconds,
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Registers descriptions for every metric the SDK emits. Call once at startup.
pub fn describe_metrics() {
    describe_counter!("cache_hits_total", Unit::Count, "Pool cache hits, labeled by cache name.");
    describe_counter!("cache_miss_total", Unit::Count, "Pool cache misses, labeled by cache name.");
    describe_counter!(
        "cache_evictions_total",
        Unit::Count,
        "Entries evicted by the hybrid LRU/LFU policy."
    );
    describe_gauge!("cache_size_gauge", "Resident entries per cache.");
    describe_histogram!(
        "fetch_batch_size",
        Unit::Count,
        "Number of pool addresses per remote batch call."
    );
    describe_counter!(
        "fetch_batch_failures_total",
        Unit::Count,
        "Batches that ended as failures, labeled by reason."
    );
    describe_counter!(
        "transport_retries_total",
        Unit::Count,
        "Transient transport errors that triggered a retry, labeled by kind."
    );
    describe_histogram!(
        "transport_call_latency_ms",
        Unit::Milliseconds,
        "Latency of single remote calls in milliseconds."
    );
}

pub fn increment_cache_hit(cache_name: &str, count: u64) {
    counter!("cache_hits_total", count, "cache" => cache_name.to_string());
}

pub fn increment_cache_miss(cache_name: &str, count: u64) {
    counter!("cache_miss_total", count, "cache" => cache_name.to_string());
}

pub fn increment_cache_evictions(cache_name: &str, count: u64) {
    counter!("cache_evictions_total", count, "cache" => cache_name.to_string());
}

pub fn set_cache_size(cache_name: &str, size: f64) {
    gauge!("cache_size_gauge", size, "cache" => cache_name.to_string());
}

pub fn record_batch_size(size: usize) {
    histogram!("fetch_batch_size", size as f64);
}

pub fn increment_batch_failure(reason: &'static str) {
    counter!("fetch_batch_failures_total", 1, "reason" => reason);
}

pub fn increment_transport_retry(kind: &'static str) {
    counter!("transport_retries_total", 1, "kind" => kind);
}

pub fn record_transport_latency(duration: std::time::Duration) {
    histogram!("transport_call_latency_ms", duration.as_secs_f64() * 1000.0);
}
