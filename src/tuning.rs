// src/tuning.rs
//
// Closed-form batch/concurrency recommendation for a rate-limited endpoint.

use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_AVG_RESPONSE_SECS: f64 = 0.7;
pub const DEFAULT_TARGET_UTILIZATION: f64 = 0.5;

/// More concurrent batches than this tend to trip provider-side throttling.
const MAX_RECOMMENDED_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TuningError {
    #[error("rate limit must be positive, got {0}")]
    RateLimit(f64),
    #[error("average response time must be positive, got {0}s")]
    ResponseTime(f64),
    #[error("target utilization must be in (0, 1], got {0}")]
    Utilization(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitParams {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    /// Requests per minute the recommendation generates at `avg_response_time`.
    pub estimated_rpm: f64,
    pub rate_limit_rpm: f64,
    /// `estimated_rpm` as a percentage of `rate_limit_rpm`.
    pub utilization_percent: f64,
}

/// Recommend `batch_size` and `max_concurrent_batches` for an endpoint allowing
/// `rate_limit` requests per minute (or per second with `is_per_second`).
///
/// Concurrency is sized so that `target_utilization` of the limit is used when every
/// call takes `avg_response_time` seconds, capped at 5. Fewer concurrent calls get
/// larger batches.
pub fn calculate_rate_limit_params(
    rate_limit: f64,
    is_per_second: bool,
    avg_response_time: f64,
    target_utilization: f64,
) -> Result<RateLimitParams, TuningError> {
    if !(rate_limit > 0.0) {
        return Err(TuningError::RateLimit(rate_limit));
    }
    if !(avg_response_time > 0.0) {
        return Err(TuningError::ResponseTime(avg_response_time));
    }
    if !(target_utilization > 0.0 && target_utilization <= 1.0) {
        return Err(TuningError::Utilization(target_utilization));
    }

    let rate_limit_rpm = if is_per_second { rate_limit * 60.0 } else { rate_limit };
    let safe_rpm = rate_limit_rpm * target_utilization;
    let max_concurrent_batches =
        ((safe_rpm * avg_response_time / 60.0).floor() as usize).clamp(1, MAX_RECOMMENDED_CONCURRENCY);

    let batch_size = match max_concurrent_batches {
        4.. => 10,
        2..=3 => 20,
        _ => 30,
    };

    let estimated_rpm = 60.0 / avg_response_time * max_concurrent_batches as f64;

    Ok(RateLimitParams {
        batch_size,
        max_concurrent_batches,
        estimated_rpm: round1(estimated_rpm),
        rate_limit_rpm,
        utilization_percent: round1(estimated_rpm / rate_limit_rpm * 100.0),
    })
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
