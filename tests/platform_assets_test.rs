use std::net::SocketAddr;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::net::TcpListener;

use cmis_sync::platforms::{
    AssetType, GoogleProvider, MetaProvider, PlatformProvider, SnapchatProvider, TikTokProvider,
};
use cmis_sync::ApiError;

async fn start_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

// ── Meta ────────────────────────────────────────────────────────────────────

async fn meta_ad_accounts(
    State(base): State<String>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if bearer(&headers) != Some("meta-token") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "message": "Invalid OAuth access token.", "code": 190 } })),
        )
            .into_response();
    }

    match q.get("after").map(String::as_str) {
        None => Json(json!({
            "data": [
                { "id": "act_1", "name": "Brand A", "account_status": 1, "currency": "USD", "timezone_name": "America/New_York" },
                { "id": "act_2", "name": "Brand B", "account_status": 2, "currency": "EUR" }
            ],
            "paging": { "next": format!("{base}/me/adaccounts?after=c1") }
        }))
        .into_response(),
        Some(_) => Json(json!({
            "data": [ { "id": "act_3", "name": "Brand C", "account_status": 101 } ]
        }))
        .into_response(),
    }
}

async fn meta_pixels(axum::extract::Path(account): axum::extract::Path<String>) -> Json<Value> {
    // px_shared is visible from both ad accounts.
    let data = match account.as_str() {
        "act_1" => json!([{ "id": "px_1", "name": "Site" }, { "id": "px_shared", "name": "Shared" }]),
        "act_2" => json!([{ "id": "px_shared", "name": "Shared" }]),
        _ => json!([]),
    };
    Json(json!({ "data": data }))
}

async fn start_meta() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = Router::new()
        .route("/me/adaccounts", get(meta_ad_accounts))
        .route("/{account}/adspixels", get(meta_pixels))
        .with_state(base.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

#[tokio::test]
async fn test_meta_ad_accounts_follow_paging() {
    let base = start_meta().await;
    let meta = MetaProvider::new("app".into(), "secret".into()).with_api_base(&base);

    let assets = meta.fetch_assets(AssetType::AdAccounts, "meta-token").await.unwrap();
    let ids: Vec<_> = assets.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, ["act_1", "act_2", "act_3"]);

    assert_eq!(assets[0].status.as_deref(), Some("active"));
    assert_eq!(assets[0].currency.as_deref(), Some("USD"));
    assert_eq!(assets[0].timezone.as_deref(), Some("America/New_York"));
    assert_eq!(assets[1].status.as_deref(), Some("disabled"));
    assert_eq!(assets[2].status.as_deref(), Some("closed"));
}

#[tokio::test]
async fn test_meta_pixels_deduplicated_across_accounts() {
    let base = start_meta().await;
    let meta = MetaProvider::new("app".into(), "secret".into()).with_api_base(&base);

    let pixels = meta.fetch_assets(AssetType::Pixels, "meta-token").await.unwrap();
    let ids: Vec<_> = pixels.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["px_1", "px_shared"]);
    assert_eq!(pixels[1].parent_id.as_deref(), Some("act_1"));
}

#[tokio::test]
async fn test_meta_invalid_token_carries_hint() {
    let base = start_meta().await;
    let meta = MetaProvider::new("app".into(), "secret".into()).with_api_base(&base);

    let err = meta
        .fetch_assets(AssetType::AdAccounts, "stale-token")
        .await
        .unwrap_err();
    match err {
        ApiError::Platform { message, hint, .. } => {
            assert!(message.contains("HTTP 400"));
            assert!(message.contains("Invalid OAuth access token"));
            assert!(hint.unwrap().contains("Reconnect"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// ── TikTok ──────────────────────────────────────────────────────────────────

async fn tiktok_bc(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    if headers.get("access-token").and_then(|v| v.to_str().ok()) != Some("tt-token") {
        return Json(json!({ "code": 40105, "message": "Access token is incorrect or has been revoked.", "data": {} }));
    }
    let page: u64 = q.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    Json(json!({
        "code": 0,
        "message": "OK",
        "data": {
            "list": [ { "bc_info": { "bc_id": format!("bc_{page}"), "name": format!("Center {page}"), "status": "ENABLE", "currency": "USD" } } ],
            "page_info": { "page": page, "total_page": 2 }
        }
    }))
}

async fn tiktok_throttled() -> Json<Value> {
    Json(json!({ "code": 40100, "message": "Too many requests", "data": {} }))
}

async fn start_tiktok() -> String {
    let app = Router::new()
        .route("/bc/get/", get(tiktok_bc))
        .route("/oauth2/advertiser/get/", get(tiktok_throttled));
    format!("http://{}", start_server(app).await)
}

#[tokio::test]
async fn test_tiktok_business_centers_across_pages() {
    let base = start_tiktok().await;
    let tiktok = TikTokProvider::new("app".into(), "secret".into()).with_api_base(&base);

    let centers = tiktok
        .fetch_assets(AssetType::BusinessCenters, "tt-token")
        .await
        .unwrap();
    let ids: Vec<_> = centers.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["bc_1", "bc_2"]);
    assert_eq!(centers[0].status.as_deref(), Some("ENABLE"));
    assert_eq!(centers[0].currency.as_deref(), Some("USD"));
}

#[tokio::test]
async fn test_tiktok_envelope_errors() {
    let base = start_tiktok().await;
    let tiktok = TikTokProvider::new("app".into(), "secret".into()).with_api_base(&base);

    let revoked = tiktok
        .fetch_assets(AssetType::BusinessCenters, "old-token")
        .await
        .unwrap_err();
    match revoked {
        ApiError::Platform { message, hint, .. } => {
            assert!(message.starts_with("code 40105"));
            assert!(hint.is_some());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let throttled = tiktok
        .fetch_assets(AssetType::AdAccounts, "tt-token")
        .await
        .unwrap_err();
    assert!(matches!(throttled, ApiError::RateLimited(_)));
}

// ── Google ──────────────────────────────────────────────────────────────────

async fn youtube_channels(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    assert_eq!(q.get("mine").map(String::as_str), Some("true"));
    match q.get("pageToken").map(String::as_str) {
        None => Json(json!({
            "items": [ { "id": "UC1", "snippet": { "title": "Main Channel" } } ],
            "nextPageToken": "p2"
        })),
        Some(_) => Json(json!({
            "items": [ { "id": "UC2", "snippet": { "title": "Shorts" } } ]
        })),
    }
}

async fn too_many_requests() -> impl IntoResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": { "message": "Quota exceeded" } })),
    )
}

#[tokio::test]
async fn test_google_youtube_channels_page_token() {
    let app = Router::new().route("/channels", get(youtube_channels));
    let base = format!("http://{}", start_server(app).await);
    let google = GoogleProvider::new("id".into(), "secret".into(), None).with_api_base(&base);

    let channels = google
        .fetch_assets(AssetType::YoutubeChannels, "g-token")
        .await
        .unwrap();
    let names: Vec<_> = channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["Main Channel", "Shorts"]);
}

#[tokio::test]
async fn test_vendor_429_is_rate_limited() {
    let app = Router::new().route("/channels", get(too_many_requests));
    let base = format!("http://{}", start_server(app).await);
    let google = GoogleProvider::new("id".into(), "secret".into(), None).with_api_base(&base);

    let err = google
        .fetch_assets(AssetType::YoutubeChannels, "g-token")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::RateLimited(_)));
}

// ── Snapchat ────────────────────────────────────────────────────────────────

async fn snap_orgs(State(base): State<String>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    if q.contains_key("cursor") {
        return Json(json!({
            "organizations": [ { "sub_request_status": "SUCCESS", "organization": { "id": "org_b", "name": "Org B" } } ]
        }));
    }
    Json(json!({
        "organizations": [ { "sub_request_status": "SUCCESS", "organization": { "id": "org_a", "name": "Org A" } } ],
        "paging": { "next_link": format!("{base}/me/organizations?cursor=2") }
    }))
}

#[tokio::test]
async fn test_snapchat_unwraps_items_and_follows_next_link() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = Router::new()
        .route("/me/organizations", get(snap_orgs))
        .with_state(base.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let snap = SnapchatProvider::new("id".into(), "secret".into()).with_api_base(&base);
    let orgs = snap
        .fetch_assets(AssetType::Organizations, "snap-token")
        .await
        .unwrap();
    let ids: Vec<_> = orgs.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, ["org_a", "org_b"]);
    assert_eq!(orgs[1].name, "Org B");
}

#[tokio::test]
async fn test_unsupported_asset_type_is_rejected() {
    let snap = SnapchatProvider::new("id".into(), "secret".into()).with_api_base("http://127.0.0.1:9");
    assert!(!snap.supports(AssetType::YoutubeChannels));

    let err = snap
        .fetch_assets(AssetType::YoutubeChannels, "snap-token")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::UnsupportedAsset { .. }));
}
