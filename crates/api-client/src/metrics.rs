//! Request pipeline metrics
//!
//! - `api_requests_total` (counter): labels `method`, `status` ("error" when
//!   no response arrived)
//! - `api_read_cache_total` (counter): label `result` (hit, joined, miss)
//!
//! Token refresh outcomes are counted by `api-auth` as
//! `api_token_refresh_total`. Without an installed recorder these are no-ops.

/// Record a completed request with its final status.
pub fn record_request(method: &str, status: u16) {
    metrics::counter!(
        "api_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a request that failed before any response arrived.
pub fn record_transport_error(method: &str) {
    metrics::counter!("api_requests_total", "method" => method.to_string(), "status" => "error")
        .increment(1);
}

/// Record how a read was served.
pub fn record_read_cache(result: &'static str) {
    metrics::counter!("api_read_cache_total", "result" => result).increment(1);
}
