//! Telemetry metric name constants.
//!
//! Centralised metric names for bifrost operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `bifrost_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `method` — method key of the proxied call (e.g. "pkg.Greeter/Hello")
//! - `status` — outcome: "ok" or "error"

/// Total proxied calls.
///
/// Labels: `method`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "bifrost_requests_total";

/// Proxied call duration in seconds, dispatch to reply.
///
/// Labels: `method`.
pub const REQUEST_DURATION_SECONDS: &str = "bifrost_request_duration_seconds";

/// Total worker processes respawned after a crash.
pub const WORKER_RESTARTS_TOTAL: &str = "bifrost_worker_restarts_total";
