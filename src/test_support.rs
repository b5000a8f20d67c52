//! Fixtures for tests that drive `AppState` against Postgres and a fake
//! vendor API. Database tests return early when `DATABASE_URL` is unset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::config::Config;
use crate::crypto::TokenCipher;
use crate::platforms::{GoogleProvider, Platform, PlatformRegistry, SnapchatProvider};
use crate::store::{ConnectionStore, ConnectionUpsert};
use crate::{AppState, SharedState};

static MIGRATED: OnceCell<()> = OnceCell::const_new();

pub(crate) fn test_cipher() -> TokenCipher {
    let key = base64::engine::general_purpose::STANDARD.encode([0x42u8; 32]);
    let hmac = base64::engine::general_purpose::STANDARD.encode([0x43u8; 32]);
    TokenCipher::new(&key, &hmac).unwrap()
}

/// State backed by the database at `DATABASE_URL`, or `None` to skip.
pub(crate) async fn db_state(mut config: Config, registry: PlatformRegistry) -> Option<SharedState> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping database test");
        return None;
    };
    config.database_url = url;

    let store = ConnectionStore::new(&config.database_url).await.unwrap();
    MIGRATED
        .get_or_init(|| async { store.migrate().await.unwrap() })
        .await;

    Some(Arc::new(AppState::new(config, store, test_cipher(), registry)))
}

/// A fresh org id, so concurrent tests never share rows.
pub(crate) fn unique_org() -> String {
    format!("org_{}", Uuid::new_v4().simple())
}

pub(crate) async fn seed_connection(
    state: &AppState,
    org_id: &str,
    platform: Platform,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
) -> Uuid {
    state
        .store
        .upsert_connection(
            &state.cipher,
            &ConnectionUpsert {
                org_id: org_id.into(),
                platform,
                account_id: "acct_1".into(),
                account_name: "Coffee Co".into(),
                access_token: access_token.into(),
                refresh_token: refresh_token.map(str::to_string),
                token_type: "Bearer".into(),
                scopes: String::new(),
                expires_at,
            },
        )
        .await
        .unwrap()
}

/// Vendor double serving the Google and Snapchat endpoints the services touch.
///
/// Asset listings accept the bearer tokens `live-token` and `fresh-token`;
/// refreshes hand out `fresh-token`.
#[derive(Clone, Default)]
pub(crate) struct FakeVendor {
    pub base: String,
    asset_hits: Arc<AtomicUsize>,
    refresh_grants: Arc<Mutex<Vec<String>>>,
    revoked: Arc<AtomicBool>,
    throttled: Arc<AtomicBool>,
}

impl FakeVendor {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fake = FakeVendor {
            base: format!("http://{}", listener.local_addr().unwrap()),
            ..Default::default()
        };

        let app = Router::new()
            .route("/token", post(token))
            .route("/access_token", post(token))
            .route("/channels", get(channels))
            .route("/accountSummaries", get(account_summaries))
            .route("/accounts/authinfo", get(merchant_error))
            .with_state(fake.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        fake
    }

    /// Answer refresh grants with `invalid_grant` from now on.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    /// Answer asset listings with HTTP 429 from now on.
    pub fn throttle(&self) {
        self.throttled.store(true, Ordering::SeqCst);
    }

    /// How many refresh grants presented `refresh_token`.
    pub fn refreshes_of(&self, refresh_token: &str) -> usize {
        self.refresh_grants
            .lock()
            .unwrap()
            .iter()
            .filter(|rt| rt.as_str() == refresh_token)
            .count()
    }

    pub fn asset_calls(&self) -> usize {
        self.asset_hits.load(Ordering::SeqCst)
    }

    pub fn google(&self) -> GoogleProvider {
        GoogleProvider::new("cid".into(), "secret".into(), None).with_api_base(&self.base)
    }

    pub fn snapchat(&self) -> SnapchatProvider {
        SnapchatProvider::new("cid".into(), "secret".into()).with_api_base(&self.base)
    }

    pub fn google_registry(&self) -> PlatformRegistry {
        let mut registry = PlatformRegistry::new();
        registry.register(Box::new(self.google()));
        registry
    }
}

async fn token(State(fake): State<FakeVendor>, Form(form): Form<HashMap<String, String>>) -> Response {
    if let Some(rt) = form.get("refresh_token") {
        fake.refresh_grants.lock().unwrap().push(rt.clone());
    }
    // Long enough for concurrent refreshes to overlap.
    tokio::time::sleep(Duration::from_millis(30)).await;

    if fake.revoked.load(Ordering::SeqCst) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant" })),
        )
            .into_response();
    }
    Json(json!({
        "access_token": "fresh-token",
        "token_type": "Bearer",
        "expires_in": 3600
    }))
    .into_response()
}

async fn channels(State(fake): State<FakeVendor>, headers: HeaderMap) -> Response {
    fake.asset_hits.fetch_add(1, Ordering::SeqCst);
    if fake.throttled.load(Ordering::SeqCst) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": { "message": "Quota exceeded" } })),
        )
            .into_response();
    }

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if !matches!(bearer, Some("live-token" | "fresh-token")) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": { "message": "Request had invalid authentication credentials." } })),
        )
            .into_response();
    }

    Json(json!({ "items": [ { "id": "UC1", "snippet": { "title": "Main Channel" } } ] }))
        .into_response()
}

async fn account_summaries(State(fake): State<FakeVendor>) -> Json<serde_json::Value> {
    fake.asset_hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "accountSummaries": [ {
            "account": "accounts/1",
            "propertySummaries": [ { "property": "properties/9", "displayName": "Web" } ]
        } ]
    }))
}

async fn merchant_error(State(fake): State<FakeVendor>) -> Response {
    fake.asset_hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": { "message": "Backend Error" } })),
    )
        .into_response()
}
