//! Vendor asset discovery behind a TTL cache.

mod cache;
mod service;
mod troubleshoot;

pub use cache::{AssetCache, CacheKey, CachedAssets};
pub use service::{invalidate, list_assets, sync_connection, AssetListing, SyncReport};
pub use troubleshoot::troubleshoot;
