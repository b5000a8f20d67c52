//! Token refresh: on-demand when a request finds an expired token, and a
//! background daemon that refreshes tokens shortly before they expire.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::db::{Connection, REAUTHORIZATION_REQUIRED};
use crate::error::ApiError;
use crate::platforms::TokenSet;
use crate::AppState;

/// Tokens this close to expiry are treated as expired.
pub const EXPIRY_SKEW_SECS: i64 = 60;

/// Whether a token expiring at `expires_at` should be refreshed at `now`.
/// Tokens without an expiry never need it.
pub fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>, skew_secs: i64) -> bool {
    match expires_at {
        Some(at) => at <= now + chrono::Duration::seconds(skew_secs),
        None => false,
    }
}

/// Absolute expiry for a token response. Lifetimes too large to represent
/// are treated as non-expiring.
pub fn expiry_from(tokens: &TokenSet, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(tokens.expires_in?).ok()?;
    now.checked_add_signed(chrono::Duration::try_seconds(secs)?)
}

/// Per-connection locks serializing refreshes.
#[derive(Default)]
pub struct RefreshLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RefreshLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, connection_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(connection_id).or_default().clone()
    }

    /// Forget the lock of a deleted connection.
    pub async fn forget(&self, connection_id: Uuid) {
        self.locks.lock().await.remove(&connection_id);
    }
}

/// Return a usable access token for `conn`, refreshing it first when it has
/// expired. The refreshed token is persisted and `conn` updated in place.
pub async fn valid_access_token(state: &AppState, conn: &mut Connection) -> Result<String, ApiError> {
    refresh_if_needed(state, conn, EXPIRY_SKEW_SECS, "request").await
}

/// Refresh `conn` when its token expires within `skew_secs`.
async fn refresh_if_needed(
    state: &AppState,
    conn: &mut Connection,
    skew_secs: i64,
    trigger: &str,
) -> Result<String, ApiError> {
    if !needs_refresh(conn.expires_at, Utc::now(), skew_secs) {
        return Ok(conn.access_token.clone());
    }

    let lock = state.refresh_locks.lock_for(conn.id).await;
    let _guard = lock.lock().await;

    // A concurrent request may have refreshed while we waited.
    let current = state
        .store
        .get_connection(&state.cipher, &conn.org_id, conn.id)
        .await?;
    if !needs_refresh(current.expires_at, Utc::now(), skew_secs) {
        *conn = current;
        return Ok(conn.access_token.clone());
    }
    // The grant is gone until the account is reconnected.
    if current.status == REAUTHORIZATION_REQUIRED {
        return Err(ApiError::ReauthorizationRequired(format!(
            "{} connection {} must be reconnected",
            conn.platform, conn.id
        )));
    }

    let Some(refresh_token) = current.refresh_token.clone() else {
        state.store.mark_reauthorization_required(conn.id).await?;
        return Err(ApiError::ReauthorizationRequired(format!(
            "{} token expired and no refresh token is stored",
            conn.platform
        )));
    };

    let provider = state.registry.require(conn.platform)?;
    match provider.refresh_token(&refresh_token).await {
        Ok(tokens) => {
            let expires_at = expiry_from(&tokens, Utc::now());
            state
                .store
                .update_refreshed_tokens(
                    &state.cipher,
                    conn.id,
                    &tokens.access_token,
                    tokens.refresh_token.as_deref(),
                    expires_at,
                )
                .await?;

            let _ = state
                .store
                .log_event(
                    &conn.org_id,
                    Some(conn.id),
                    "token.refreshed",
                    conn.platform,
                    json!({ "trigger": trigger }),
                )
                .await;
            info!("Refreshed {} token for connection {}", conn.platform, conn.id);

            conn.access_token = tokens.access_token;
            if tokens.refresh_token.is_some() {
                conn.refresh_token = tokens.refresh_token;
            }
            conn.expires_at = expires_at;
            conn.failure_count = 0;
            Ok(conn.access_token.clone())
        }
        Err(e) => {
            warn!("On-demand refresh failed for {} {}: {e}", conn.platform, conn.id);
            state.store.increment_failure(conn.id).await?;
            if matches!(e, ApiError::ReauthorizationRequired(_)) {
                state.store.mark_reauthorization_required(conn.id).await?;
            }
            Err(e)
        }
    }
}

/// Start the refresh daemon loop.
pub async fn refresh_daemon(state: Arc<AppState>) {
    let interval = tokio::time::Duration::from_secs(state.config.refresh_interval_secs.max(1));
    info!(
        "Token refresh daemon started (interval: {}s)",
        interval.as_secs()
    );

    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = refresh_cycle(&state).await {
            error!("Refresh cycle error: {e}");
        }
        let purged = state.cache.purge_expired().await;
        if purged > 0 {
            info!("Purged {purged} expired asset cache entries");
        }
    }
}

async fn refresh_cycle(state: &AppState) -> Result<(), ApiError> {
    let expiring = state
        .store
        .get_expiring_connections(state.config.refresh_window_minutes)
        .await?;

    if expiring.is_empty() {
        return Ok(());
    }

    info!("Found {} connections to refresh", expiring.len());
    let window_secs = state.config.refresh_window_minutes * 60;

    for candidate in expiring {
        if state.registry.get(candidate.platform).is_none() {
            warn!(
                "Platform {} not configured for connection {}",
                candidate.platform, candidate.id
            );
            continue;
        }

        let mut conn = match state
            .store
            .get_connection(&state.cipher, &candidate.org_id, candidate.id)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                error!("Could not load connection {}: {e}", candidate.id);
                continue;
            }
        };

        match refresh_if_needed(state, &mut conn, window_secs, "daemon").await {
            Ok(_) => {
                state.cache.invalidate(conn.id, None).await;
                info!(
                    "Refreshed {} token for {}/{}",
                    conn.platform, conn.org_id, conn.account_id
                );
            }
            Err(e) => {
                error!("Failed to refresh {} for {}: {e}", conn.platform, conn.id);
            }
        }
    }

    Ok(())
}
