//! Telemetry metric name constants.
//!
//! Centralised metric names for regcache operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `regcache_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `tier`: where a lookup was answered: "memory" or "durable"
//! - `status`: outcome: "ok" or "error"

/// Lookups answered from a cache tier without touching the origin.
///
/// Labels: `tier` ("memory" | "durable").
pub const CACHE_HITS_TOTAL: &str = "regcache_cache_hits_total";

/// Lookups that found nothing in any tier and had to wait on the origin.
pub const CACHE_MISSES_TOTAL: &str = "regcache_cache_misses_total";

/// Stale durable entries returned to a caller while a refresh was scheduled.
pub const STALE_SERVED_TOTAL: &str = "regcache_stale_served_total";

/// Origin fetches actually issued (cold path and background refresh).
///
/// Labels: `status` ("ok" | "error").
pub const ORIGIN_FETCHES_TOTAL: &str = "regcache_origin_fetches_total";

/// Cold requests that joined an in-progress fetch instead of issuing one.
pub const COALESCED_TOTAL: &str = "regcache_coalesced_requests_total";

/// Background refreshes completed by the refresh queue.
///
/// Labels: `status` ("ok" | "error").
pub const REFRESHES_TOTAL: &str = "regcache_refreshes_total";

/// Retry attempts made by the refresh queue (not counting the first try).
pub const RETRIES_TOTAL: &str = "regcache_retries_total";

/// Durable records removed by capacity eviction.
pub const EVICTIONS_TOTAL: &str = "regcache_evictions_total";

/// Listener notification rounds fired.
pub const NOTIFICATIONS_TOTAL: &str = "regcache_notifications_total";
