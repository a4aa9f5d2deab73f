//! Rate-limited update notifications.
//!
//! Background refreshes tend to land in bursts (one tree render can mark a
//! few dozen packages stale at once). Listeners should see one round per
//! burst, not one callback storm per key:
//!
//! - the first [`notify`](Notifier::notify) after a quiet period schedules a
//!   round `settle` later;
//! - rounds are at least `coalesce` apart;
//! - every URL notified before a round fires is delivered in that round,
//!   once per URL, to every listener.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error};

use crate::telemetry;

/// Callback invoked with the URL whose cached data changed.
pub type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle returned by [`Notifier::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Pending {
    urls: Vec<String>,
    scheduled: bool,
    last_fired: Option<Instant>,
}

struct Inner {
    coalesce: Duration,
    settle: Duration,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    pending: Mutex<Pending>,
}

/// Coalescing fan-out of "this URL has fresher data" events.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

impl Notifier {
    pub fn new(coalesce: Duration, settle: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                coalesce,
                settle,
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
                pending: Mutex::new(Pending::default()),
            }),
        }
    }

    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.listeners).push((id, listener));
        id
    }

    /// Returns whether the listener was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Record that `url` changed and make sure a round is scheduled.
    ///
    /// Requires a tokio runtime.
    pub fn notify(&self, url: &str) {
        let mut pending = lock(&self.inner.pending);
        if !pending.urls.iter().any(|u| u == url) {
            pending.urls.push(url.to_string());
        }
        if pending.scheduled {
            return;
        }
        pending.scheduled = true;

        let now = Instant::now();
        let spacing = pending
            .last_fired
            .map(|at| (at + self.inner.coalesce).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        let delay = self.inner.settle + spacing;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire();
        });
    }
}

impl Inner {
    fn fire(&self) {
        let urls = {
            let mut pending = lock(&self.pending);
            pending.scheduled = false;
            pending.last_fired = Some(Instant::now());
            std::mem::take(&mut pending.urls)
        };
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        metrics::counter!(telemetry::NOTIFICATIONS_TOTAL).increment(1);
        debug!(
            urls = urls.len(),
            listeners = listeners.len(),
            "notifying listeners of refreshed data"
        );
        for url in &urls {
            for listener in &listeners {
                if std::panic::catch_unwind(AssertUnwindSafe(|| listener(url))).is_err() {
                    error!(url = %url, "update listener panicked");
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COALESCE: Duration = Duration::from_secs(2);
    const SETTLE: Duration = Duration::from_millis(250);

    /// Listener that records `(url, time)` pairs.
    fn recording(notifier: &Notifier) -> (ListenerId, Arc<Mutex<Vec<(String, Instant)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = notifier.subscribe(Arc::new(move |url: &str| {
            sink.lock().unwrap().push((url.to_string(), Instant::now()));
        }));
        (id, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_delivered_in_one_round_after_settle() {
        let notifier = Notifier::new(COALESCE, SETTLE);
        let (_, seen) = recording(&notifier);
        let start = Instant::now();

        notifier.notify("http://a");
        notifier.notify("http://b");
        notifier.notify("http://a");
        tokio::time::sleep(Duration::from_secs(5)).await;

        let seen = seen.lock().unwrap().clone();
        let urls: Vec<_> = seen.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(urls, vec!["http://a", "http://b"]);
        assert!(seen.iter().all(|(_, at)| *at - start >= SETTLE));
        assert_eq!(seen[0].1, seen[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn rounds_are_spaced_by_coalesce_window() {
        let notifier = Notifier::new(COALESCE, SETTLE);
        let (_, seen) = recording(&notifier);

        notifier.notify("http://a");
        tokio::time::sleep(SETTLE + Duration::from_millis(10)).await;
        notifier.notify("http://b");
        tokio::time::sleep(Duration::from_secs(10)).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].1 - seen[0].1 >= COALESCE);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_listener_is_not_called() {
        let notifier = Notifier::new(COALESCE, SETTLE);
        let (id, seen) = recording(&notifier);
        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        assert_eq!(notifier.listener_count(), 0);

        notifier.notify("http://a");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_listener_does_not_starve_others() {
        let notifier = Notifier::new(COALESCE, SETTLE);
        notifier.subscribe(Arc::new(|url: &str| {
            if url.starts_with("http") {
                panic!("listener bug");
            }
        }));
        let (_, seen) = recording(&notifier);

        notifier.notify("http://a");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
