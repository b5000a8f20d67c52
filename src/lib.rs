pub mod api;
pub mod assets;
pub mod config;
pub mod crypto;
pub mod error;
pub mod platforms;
pub mod quota;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::ApiError;

use std::sync::Arc;

/// Shared application state passed to all API handlers.
pub struct AppState {
    pub config: Config,
    pub store: store::ConnectionStore,
    pub cipher: crypto::TokenCipher,
    pub registry: platforms::PlatformRegistry,
    pub cache: assets::AssetCache,
    pub refresh_locks: store::RefreshLocks,
    pub quota: quota::QuotaPolicy,
}

impl AppState {
    /// Wire the in-process components around an already opened store.
    pub fn new(
        config: Config,
        store: store::ConnectionStore,
        cipher: crypto::TokenCipher,
        registry: platforms::PlatformRegistry,
    ) -> Self {
        let cache = assets::AssetCache::new(
            std::time::Duration::from_secs(config.asset_cache_ttl_secs),
            config.asset_cache_max_entries,
        );
        let quota = quota::QuotaPolicy::from_config(&config);
        Self {
            config,
            store,
            cipher,
            registry,
            cache,
            refresh_locks: store::RefreshLocks::new(),
            quota,
        }
    }
}

pub type SharedState = Arc<AppState>;
