use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use super::cache::CacheKey;
use crate::error::ApiError;
use crate::platforms::{unsupported, Asset, AssetType, Platform};
use crate::quota::{self, Resource};
use crate::store::{valid_access_token, Connection};
use crate::AppState;

/// Assets of one type for one connection.
#[derive(Debug, Clone, Serialize)]
pub struct AssetListing {
    pub connection_id: Uuid,
    pub platform: Platform,
    pub asset_type: AssetType,
    pub assets: Vec<Asset>,
    pub cached: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Outcome of refreshing every asset type of a connection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub connection_id: Uuid,
    pub counts: BTreeMap<AssetType, usize>,
    pub errors: BTreeMap<AssetType, String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// List the assets of `asset_type` reachable through a connection.
///
/// Served from the cache unless `force_refresh` is set. Every successful
/// vendor fetch is charged against the org's `platform_api_calls` quota.
pub async fn list_assets(
    state: &AppState,
    org_id: &str,
    connection_id: Uuid,
    asset_type: AssetType,
    force_refresh: bool,
) -> Result<AssetListing, ApiError> {
    let mut conn = state
        .store
        .get_connection(&state.cipher, org_id, connection_id)
        .await?;

    let (entry, cached) = fetch_through_cache(state, &mut conn, asset_type, force_refresh).await?;
    if !cached {
        state.store.mark_synced(conn.id).await?;
    }

    Ok(AssetListing {
        connection_id: conn.id,
        platform: conn.platform,
        asset_type,
        assets: entry.assets,
        cached,
        fetched_at: entry.fetched_at,
    })
}

/// Refetch every asset type the connection's platform supports.
///
/// One failing type does not stop the others.
pub async fn sync_connection(
    state: &AppState,
    org_id: &str,
    connection_id: Uuid,
) -> Result<SyncReport, ApiError> {
    let mut conn = state
        .store
        .get_connection(&state.cipher, org_id, connection_id)
        .await?;
    let provider = state.registry.require(conn.platform)?;

    let mut report = SyncReport {
        connection_id,
        ..Default::default()
    };

    for &asset_type in provider.asset_types() {
        match fetch_through_cache(state, &mut conn, asset_type, true).await {
            Ok((entry, _)) => {
                report.counts.insert(asset_type, entry.assets.len());
            }
            // Without a token or quota the remaining types would fail the same way.
            Err(e @ (ApiError::ReauthorizationRequired(_) | ApiError::QuotaExceeded(_))) => {
                return Err(e);
            }
            Err(e) => {
                warn!("Sync of {} {} failed for {}: {e}", conn.platform, asset_type, conn.id);
                report.errors.insert(asset_type, e.to_string());
            }
        }
    }

    if !report.counts.is_empty() {
        state.store.mark_synced(conn.id).await?;
    }

    let _ = state
        .store
        .log_event(
            org_id,
            Some(conn.id),
            "assets.synced",
            conn.platform,
            json!({ "counts": report.counts, "errors": report.errors }),
        )
        .await;
    info!(
        "Synced {} connection {}: {} types ok, {} failed",
        conn.platform,
        conn.id,
        report.counts.len(),
        report.errors.len()
    );

    Ok(report)
}

/// Drop cached assets of a connection the org owns. Returns the number of
/// entries removed.
pub async fn invalidate(
    state: &AppState,
    org_id: &str,
    connection_id: Uuid,
    asset_type: Option<AssetType>,
) -> Result<usize, ApiError> {
    // Ownership check; tokens are not needed.
    state
        .store
        .get_connection(&state.cipher, org_id, connection_id)
        .await?;
    Ok(state.cache.invalidate(connection_id, asset_type).await)
}

async fn fetch_through_cache(
    state: &AppState,
    conn: &mut Connection,
    asset_type: AssetType,
    force_refresh: bool,
) -> Result<(super::CachedAssets, bool), ApiError> {
    let provider = state.registry.require(conn.platform)?;
    if !provider.supports(asset_type) {
        return Err(unsupported(conn.platform, asset_type));
    }

    let key = CacheKey::new(conn.id, asset_type);
    if !force_refresh {
        if let Some(hit) = state.cache.get(&key).await {
            return Ok((hit, true));
        }
    }

    let token = valid_access_token(state, conn).await?;
    let org_id = conn.org_id.clone();
    // Only fetches the vendor answered are charged.
    let fetch = || async move {
        let reservation = quota::consume(state, &org_id, Resource::PlatformApiCalls, 1).await?;
        let fetched = provider.fetch_assets(asset_type, &token).await;
        if fetched.is_err() {
            if let Err(e) = quota::refund(state, &reservation).await {
                warn!("Could not refund quota for {org_id}: {e}");
            }
        }
        fetched
    };

    if force_refresh {
        let entry = state.cache.refresh(key, fetch).await?;
        Ok((entry, false))
    } else {
        state.cache.remember(key, fetch).await
    }
}
