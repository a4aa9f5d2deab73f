//! Core value types shared by every cache tier.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Opaque fetch result: status code plus raw body.
///
/// The cache layers never interpret the body; parsing belongs to the
/// registry client that consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    pub body: String,
    pub status_code: u16,
}

impl Body {
    /// Create a body with the given status code.
    pub fn new(body: impl Into<String>, status_code: u16) -> Self {
        Self {
            body: body.into(),
            status_code,
        }
    }

    /// Shorthand for an HTTP 200 body.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(body, 200)
    }
}

/// A cached fetch result.
///
/// `timestamp` is the moment the payload was known to be fresh (initial
/// fetch or last successful revalidation), never the moment it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: Body,
    pub timestamp: SystemTime,
    pub etag: Option<String>,
    pub origin_url: String,
}

impl CacheEntry {
    /// Time elapsed since `timestamp`, as of `now`.
    ///
    /// Clock skew that puts `timestamp` in the future counts as zero age.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.timestamp).unwrap_or(Duration::ZERO)
    }

    /// Classify this entry against a fresh window.
    pub fn freshness(&self, now: SystemTime, fresh_window: Duration) -> Freshness {
        Freshness::classify(Some(self), now, fresh_window)
    }
}

/// Derived freshness of a key. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `now - timestamp < fresh_window`.
    Fresh,
    /// An entry exists but is at least `fresh_window` old.
    Stale,
    /// No entry for the key.
    Missing,
}

impl Freshness {
    /// `Fresh` iff `now - entry.timestamp < fresh_window`.
    pub fn classify(entry: Option<&CacheEntry>, now: SystemTime, fresh_window: Duration) -> Self {
        match entry {
            None => Freshness::Missing,
            Some(entry) if entry.age(now) < fresh_window => Freshness::Fresh,
            Some(_) => Freshness::Stale,
        }
    }
}
