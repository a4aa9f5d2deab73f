//! Builder for configuring cache service instances

use std::path::PathBuf;
use std::sync::Arc;

use super::CacheService;
use crate::config::CacheConfig;
use crate::origin::{HttpOrigin, Origin};
use crate::Result;

/// Builder for configuring cache service instances.
///
/// ```rust,no_run
/// # use regcache::{CacheConfig, CacheService};
/// # use std::time::Duration;
/// # fn main() -> regcache::Result<()> {
/// let cache = CacheService::builder()
///     .http_origin()?
///     .config(CacheConfig::new().memory_fresh_window(Duration::from_secs(60)))
///     .storage_dir("/tmp/regcache")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct CacheServiceBuilder {
    origin: Option<Arc<dyn Origin>>,
    config: CacheConfig,
    storage_dir: Option<PathBuf>,
}

impl CacheServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom origin (typically the registry client).
    pub fn origin(mut self, origin: Arc<dyn Origin>) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Use a plain reqwest origin.
    pub fn http_origin(self) -> Result<Self> {
        Ok(self.origin(Arc::new(HttpOrigin::new()?)))
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the durable store at build time instead of via
    /// [`CacheService::initialize`].
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Build the service.
    ///
    /// Returns an error if no origin was configured.
    pub fn build(self) -> Result<CacheService> {
        let origin = self.origin.ok_or_else(|| {
            crate::CacheError::Configuration("no origin configured".to_string())
        })?;
        Ok(CacheService::new(origin, self.config, self.storage_dir))
    }
}
