//! API route handlers for the sync service.
//!
//! Callers are trusted first-party services: they present the shared
//! `x-internal-secret` and name the org in `x-org-id`. The OAuth callback is
//! the exception, it is authenticated by its signed `state` instead.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assets;
use crate::crypto::ConnectState;
use crate::error::ApiError;
use crate::platforms::{AssetType, Platform};
use crate::quota::{self, Resource};
use crate::store::refresh::expiry_from;
use crate::store::ConnectionUpsert;
use crate::SharedState;

// =============================================================================
// V1 Router
// =============================================================================

pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        // ── Health ───────────────────────────────────────────────────────
        .route("/status", get(status))
        .route("/platforms", get(platforms))
        // ── Connections ──────────────────────────────────────────────────
        .route("/connections", get(connection_list))
        .route("/connections/start/{platform}", get(connection_start))
        .route("/connections/callback/{platform}", get(connection_callback))
        .route("/connections/{id}", delete(connection_delete))
        // ── Assets ───────────────────────────────────────────────────────
        .route("/connections/{id}/assets/{asset_type}", get(asset_list))
        .route("/connections/{id}/sync", post(asset_sync))
        .route("/connections/{id}/cache", delete(asset_cache_clear))
        // ── Quota ────────────────────────────────────────────────────────
        .route("/quota", get(quota_report))
        .with_state(state)
}

/// Check the shared service secret and return the caller's org id.
fn require_service(state: &SharedState, headers: &HeaderMap) -> Result<String, ApiError> {
    let secret = headers
        .get("x-internal-secret")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    if secret != state.config.service_secret {
        return Err(ApiError::Unauthorized);
    }

    let org_id = headers
        .get("x-org-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if org_id.is_empty() {
        return Err(ApiError::BadRequest("x-org-id header is required".into()));
    }
    Ok(org_id.to_string())
}

// =============================================================================
// Health
// =============================================================================

async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "cmis-sync",
        "version": env!("CARGO_PKG_VERSION"),
        "platforms": state.registry.count(),
        "cached_entries": state.cache.len().await,
    }))
}

/// GET /v1/platforms: Configured platforms and the asset types each exposes.
async fn platforms(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_service(&state, &headers)?;

    let platforms: Vec<_> = state
        .registry
        .iter()
        .map(|p| {
            json!({
                "platform": p.platform(),
                "name": p.display_name(),
                "asset_types": p.asset_types(),
            })
        })
        .collect();
    Ok(Json(json!({ "data": platforms })))
}

// =============================================================================
// Connections
// =============================================================================

#[derive(Deserialize)]
struct StartQuery {
    #[serde(default)]
    scopes: String,
}

/// GET /v1/connections/start/:platform: Authorization URL for the connect flow.
///
/// The web app redirects the user there; the vendor sends them back to the
/// callback with a signed state naming the org.
async fn connection_start(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(platform): Path<String>,
    Query(q): Query<StartQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org_id = require_service(&state, &headers)?;
    let platform: Platform = platform.parse()?;
    let provider = state.registry.require(platform)?;

    let connect = ConnectState::new(&org_id, platform);
    let signed_state = state.cipher.sign_state(&connect)?;
    let pkce_verifier = state.cipher.pkce_verifier(&connect)?;
    let scopes: Vec<String> = if q.scopes.trim().is_empty() {
        provider.default_scopes()
    } else {
        q.scopes.split(',').map(|s| s.trim().to_string()).collect()
    };

    let callback_url = state.config.callback_url(platform);
    let auth_url = provider.auth_url(&scopes, &signed_state, &callback_url, &pkce_verifier);

    Ok(Json(json!({
        "data": {
            "platform": platform,
            "auth_url": auth_url,
            "scopes": scopes,
        }
    })))
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /v1/connections/callback/:platform: Finish the connect flow.
async fn connection_callback(
    State(state): State<SharedState>,
    Path(platform): Path<String>,
    Query(q): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    let platform: Platform = platform.parse()?;
    let signed_state = q.state.as_deref().ok_or(ApiError::InvalidState)?;
    let connect = state.cipher.verify_state(signed_state)?;
    if connect.platform != platform {
        return Err(ApiError::InvalidState);
    }

    if let Some(error) = q.error {
        warn!("{platform} authorization denied for org {}: {error}", connect.org_id);
        let redirect_url = format!(
            "{}/integrations?platform={}&error={}",
            state.config.dashboard_url,
            platform,
            url::form_urlencoded::byte_serialize(
                q.error_description.as_deref().unwrap_or(&error).as_bytes()
            )
            .collect::<String>()
        );
        return Ok(Redirect::temporary(&redirect_url).into_response());
    }
    let code = q
        .code
        .ok_or_else(|| ApiError::BadRequest("missing authorization code".into()))?;

    let provider = state.registry.require(platform)?;
    let callback_url = state.config.callback_url(platform);
    let pkce_verifier = state.cipher.pkce_verifier(&connect)?;
    let tokens = provider
        .exchange_code(&code, &callback_url, &pkce_verifier)
        .await?;
    let identity = provider.identify(&tokens.access_token).await?;

    let upsert = ConnectionUpsert {
        org_id: connect.org_id.clone(),
        platform,
        account_id: identity.account_id,
        account_name: identity.account_name,
        expires_at: expiry_from(&tokens, chrono::Utc::now()),
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        token_type: tokens.token_type,
        scopes: tokens.scope.unwrap_or_default(),
    };
    let conn_id = state.store.upsert_connection(&state.cipher, &upsert).await?;
    // Re-connecting replaces the token, so cached assets may be stale.
    state.cache.invalidate(conn_id, None).await;

    let _ = state
        .store
        .log_event(
            &connect.org_id,
            Some(conn_id),
            "connection.created",
            platform,
            json!({ "account_id": upsert.account_id }),
        )
        .await;
    info!("Connected {platform} account {} for org {}", upsert.account_id, connect.org_id);

    let redirect_url = format!(
        "{}/integrations?platform={}&connection_id={}",
        state.config.dashboard_url, platform, conn_id
    );
    Ok(Redirect::temporary(&redirect_url).into_response())
}

#[derive(Deserialize)]
struct ListQuery {
    platform: Option<String>,
}

/// GET /v1/connections: The org's platform connections, without tokens.
async fn connection_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org_id = require_service(&state, &headers)?;
    let platform = q
        .platform
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(str::parse::<Platform>)
        .transpose()?;

    let connections = state.store.list_connections(&org_id, platform).await?;
    Ok(Json(json!({ "data": connections })))
}

/// DELETE /v1/connections/:id: Disconnect an account.
async fn connection_delete(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org_id = require_service(&state, &headers)?;
    let conn = state.store.get_connection(&state.cipher, &org_id, id).await?;

    if let Some(provider) = state.registry.get(conn.platform) {
        if let Err(e) = provider.revoke(&conn.access_token).await {
            warn!("Revoking {} token for {id} failed: {e}", conn.platform);
        }
    }

    state.store.delete_connection(&org_id, id).await?;
    let cleared = state.cache.invalidate(id, None).await;
    state.refresh_locks.forget(id).await;

    let _ = state
        .store
        .log_event(&org_id, None, "connection.deleted", conn.platform, json!({ "connection_id": id }))
        .await;

    Ok(Json(json!({ "data": { "success": true, "cache_entries_cleared": cleared } })))
}

// =============================================================================
// Assets
// =============================================================================

#[derive(Deserialize)]
struct AssetQuery {
    #[serde(default)]
    refresh: bool,
}

/// GET /v1/connections/:id/assets/:asset_type: Cached asset listing.
async fn asset_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, asset_type)): Path<(Uuid, String)>,
    Query(q): Query<AssetQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org_id = require_service(&state, &headers)?;
    let asset_type: AssetType = asset_type.parse()?;

    let listing = assets::list_assets(&state, &org_id, id, asset_type, q.refresh).await?;
    Ok(Json(json!({ "data": listing })))
}

/// POST /v1/connections/:id/sync: Refetch every asset type.
async fn asset_sync(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org_id = require_service(&state, &headers)?;
    let report = assets::sync_connection(&state, &org_id, id).await?;
    Ok(Json(json!({ "data": report })))
}

#[derive(Deserialize)]
struct CacheQuery {
    asset_type: Option<String>,
}

/// DELETE /v1/connections/:id/cache: Drop cached assets.
async fn asset_cache_clear(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(q): Query<CacheQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org_id = require_service(&state, &headers)?;
    let asset_type = q
        .asset_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(str::parse::<AssetType>)
        .transpose()?;

    let cleared = assets::invalidate(&state, &org_id, id, asset_type).await?;
    Ok(Json(json!({ "data": { "cleared": cleared } })))
}

// =============================================================================
// Quota
// =============================================================================

/// GET /v1/quota: Usage and alert level per resource and window.
async fn quota_report(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org_id = require_service(&state, &headers)?;

    let mut resources = Vec::with_capacity(Resource::ALL.len());
    for resource in Resource::ALL {
        let [daily, monthly] = quota::status(&state, &org_id, resource).await?;
        resources.push(json!({
            "resource": resource,
            "daily": daily,
            "monthly": monthly,
        }));
    }

    Ok(Json(json!({ "data": { "org_id": org_id, "resources": resources } })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::platforms::{MetaProvider, PlatformRegistry, TwitterProvider};
    use crate::store::ConnectionStore;
    use crate::test_support::test_cipher;
    use crate::AppState;
    use base64::Engine;
    use sha2::{Digest, Sha256};
    use std::sync::Arc;

    fn state_with(registry: PlatformRegistry) -> SharedState {
        let config = Config::for_tests();
        // Never connects unless a handler touches the database.
        let store = ConnectionStore::lazy(&config.database_url).unwrap();
        Arc::new(AppState::new(config, store, test_cipher(), registry))
    }

    fn test_state() -> SharedState {
        let mut registry = PlatformRegistry::new();
        registry.register(Box::new(MetaProvider::new("app-1".into(), "shh".into())));
        state_with(registry)
    }

    fn query_param(url: &str, name: &str) -> Option<String> {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    async fn spawn(state: SharedState) -> String {
        let app = crate::api::router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn no_redirects() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_is_public() {
        let base = spawn(test_state()).await;
        let body: serde_json::Value = reqwest::get(format!("{base}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["platforms"], 1);
    }

    #[tokio::test]
    async fn test_missing_secret_is_rejected() {
        let base = spawn(test_state()).await;
        let resp = reqwest::get(format!("{base}/platforms")).await.unwrap();
        assert_eq!(resp.status(), 401);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_missing_org_is_bad_request() {
        let base = spawn(test_state()).await;
        let resp = reqwest::Client::new()
            .get(format!("{base}/platforms"))
            .header("x-internal-secret", "test-secret")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_platforms_lists_asset_types() {
        let base = spawn(test_state()).await;
        let body: serde_json::Value = reqwest::Client::new()
            .get(format!("{base}/platforms"))
            .header("x-internal-secret", "test-secret")
            .header("x-org-id", "org_1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let meta = &body["data"][0];
        assert_eq!(meta["platform"], "meta");
        let types = meta["asset_types"].as_array().unwrap();
        assert!(types.iter().any(|t| t == "ad_accounts"));
        assert!(types.iter().any(|t| t == "pixels"));
    }

    #[tokio::test]
    async fn test_start_returns_signed_auth_url() {
        let state = test_state();
        let base = spawn(state.clone()).await;
        let body: serde_json::Value = reqwest::Client::new()
            .get(format!("{base}/connections/start/facebook"))
            .header("x-internal-secret", "test-secret")
            .header("x-org-id", "org_1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let auth_url = body["data"]["auth_url"].as_str().unwrap();
        let signed = query_param(auth_url, "state").unwrap();
        let connect = state.cipher.verify_state(&signed).unwrap();
        assert_eq!(connect.org_id, "org_1");
        assert_eq!(connect.platform, Platform::Meta);
    }

    #[tokio::test]
    async fn test_start_unconfigured_platform() {
        let base = spawn(test_state()).await;
        let resp = reqwest::Client::new()
            .get(format!("{base}/connections/start/tiktok"))
            .header("x-internal-secret", "test-secret")
            .header("x-org-id", "org_1")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "platform_not_configured");
    }

    #[tokio::test]
    async fn test_callback_rejects_forged_state() {
        let base = spawn(test_state()).await;
        let resp = no_redirects()
            .get(format!("{base}/connections/callback/meta?code=abc&state=forged"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "invalid_state");
    }

    #[tokio::test]
    async fn test_start_binds_pkce_challenge_to_state() {
        let mut registry = PlatformRegistry::new();
        registry.register(Box::new(TwitterProvider::new("cid".into(), "s".into())));
        let state = state_with(registry);
        let base = spawn(state.clone()).await;

        let mut challenges = Vec::new();
        for _ in 0..2 {
            let body: serde_json::Value = reqwest::Client::new()
                .get(format!("{base}/connections/start/x"))
                .header("x-internal-secret", "test-secret")
                .header("x-org-id", "org_1")
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            let auth_url = body["data"]["auth_url"].as_str().unwrap();
            assert_eq!(query_param(auth_url, "code_challenge_method").as_deref(), Some("S256"));

            // The callback can rebuild the verifier from the returned state alone.
            let connect = state
                .cipher
                .verify_state(&query_param(auth_url, "state").unwrap())
                .unwrap();
            let verifier = state.cipher.pkce_verifier(&connect).unwrap();
            let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(Sha256::digest(verifier.as_bytes()));
            let challenge = query_param(auth_url, "code_challenge").unwrap();
            assert_eq!(challenge, expected);
            challenges.push(challenge);
        }
        assert_ne!(challenges[0], challenges[1]);
    }

    #[tokio::test]
    async fn test_callback_without_state_uses_error_envelope() {
        let base = spawn(test_state()).await;
        let resp = no_redirects()
            .get(format!("{base}/connections/callback/meta?code=abc"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "invalid_state");
    }

    #[tokio::test]
    async fn test_callback_denied_redirects_with_error() {
        let state = test_state();
        let signed = state
            .cipher
            .sign_state(&ConnectState::new("org_1", Platform::Meta))
            .unwrap();
        let base = spawn(state).await;

        let resp = no_redirects()
            .get(format!("{base}/connections/callback/meta"))
            .query(&[("state", signed.as_str()), ("error", "access_denied")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 307);
        let location = resp.headers()["location"].to_str().unwrap();
        assert!(location.starts_with("http://localhost:3000/integrations?platform=meta&error="));
    }

    #[tokio::test]
    async fn test_callback_state_for_other_platform() {
        let state = test_state();
        let signed = state
            .cipher
            .sign_state(&ConnectState::new("org_1", Platform::Google))
            .unwrap();
        let base = spawn(state).await;

        let resp = no_redirects()
            .get(format!("{base}/connections/callback/meta"))
            .query(&[("state", signed.as_str()), ("code", "abc")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_unknown_asset_type() {
        let base = spawn(test_state()).await;
        let resp = reqwest::Client::new()
            .get(format!("{base}/connections/{}/assets/holograms", Uuid::new_v4()))
            .header("x-internal-secret", "test-secret")
            .header("x-org-id", "org_1")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }
}
