//! regcache - stale-while-revalidate result cache for package registry APIs
//!
//! Registry feeds are slow and rate-sensitive, while the same URLs get
//! requested over and over in short bursts (tree rendering, search,
//! metadata enrichment). This crate answers repeats instantly and keeps the
//! data fresh in the background:
//!
//! - an in-memory tier for same-process repeats,
//! - a durable on-disk tier ([`DiskStore`]) that survives restarts,
//! - a debounced background [`RefreshQueue`] that revalidates stale
//!   entries with ETags,
//! - [`CacheService`], which ties them to an [`Origin`] and notifies
//!   listeners when refreshed data arrives.
//!
//! # Example
//!
//! ```rust,no_run
//! use regcache::CacheService;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> regcache::Result<()> {
//!     let cache = CacheService::builder().http_origin()?.build()?;
//!     cache.initialize(None).await;
//!
//!     cache.on_update(|url| println!("fresher data for {url}"));
//!
//!     let body = cache
//!         .request("https://api.nuget.org/v3/registration5/serilog/index.json", None)
//!         .await?;
//!     println!("{} ({} bytes)", body.status_code, body.body.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod key;
pub mod notify;
pub mod origin;
pub mod queue;
pub mod retry;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::{CacheConfig, QueueConfig, Settings, StoreConfig};
pub use error::{CacheError, Result};
pub use key::CacheKey;
pub use notify::{Listener, ListenerId, Notifier};
pub use origin::{AMBIENT_CREDENTIAL, FetchRequest, FetchResponse, HttpOrigin, Origin};
pub use queue::{RefreshHandler, RefreshQueue, RefreshTask, TaskState};
pub use retry::RetryConfig;
pub use service::{CacheService, CacheServiceBuilder};
pub use store::DiskStore;
pub use types::{Body, CacheEntry, Freshness};
