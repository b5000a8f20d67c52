use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use super::http::{self, str_field, urlencoding, MAX_PAGES};
use super::traits::{
    unsupported, AccountIdentity, Asset, AssetType, Platform, PlatformProvider, TokenSet,
};
use crate::error::ApiError;

const BUSINESS_API_BASE: &str = "https://business-api.tiktok.com/open_api/v1.3";

const ASSET_TYPES: &[AssetType] = &[
    AssetType::AdAccounts,
    AssetType::Pixels,
    AssetType::BusinessCenters,
    AssetType::Catalogs,
];

/// TikTok API rate-limit response code.
const CODE_RATE_LIMITED: i64 = 40100;

/// TikTok for Business (Marketing API).
///
/// Quirks:
/// - Every response is HTTP 200 with a `{code, message, data}` envelope;
///   a non-zero `code` is the real error.
/// - Access tokens do not expire and there is no refresh grant; revoked
///   tokens require the advertiser to re-authorize.
/// - The token travels in an `Access-Token` header, not `Authorization`.
/// - Ad accounts are called "advertisers".
pub struct TikTokProvider {
    app_id: String,
    secret: String,
    api_base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct TikTokTokenData {
    access_token: String,
    #[serde(default)]
    scope: Vec<Value>,
}

impl TikTokProvider {
    pub fn new(app_id: String, secret: String) -> Self {
        Self {
            app_id,
            secret,
            api_base: BUSINESS_API_BASE.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Send and unwrap the `{code, message, data}` envelope.
    async fn call(&self, req: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let envelope: Envelope = http::get_json(Platform::TikTok, req).await?;
        match envelope.code {
            0 => Ok(envelope.data),
            CODE_RATE_LIMITED => Err(ApiError::RateLimited(Platform::TikTok.to_string())),
            code => Err(ApiError::platform(
                "tiktok",
                format!("code {code}: {}", envelope.message),
            )),
        }
    }

    /// GET a paged listing, gathering `data[list_key]` until `page_info.total_page`.
    async fn collect_paged(
        &self,
        path: &str,
        query: &[(&str, &str)],
        list_key: &str,
        token: &str,
    ) -> Result<Vec<Value>, ApiError> {
        let mut items = Vec::new();

        for page in 1..=MAX_PAGES {
            let page_str = page.to_string();
            let req = self
                .http
                .get(self.url(path))
                .header("Access-Token", token)
                .query(query)
                .query(&[("page", page_str.as_str()), ("page_size", "50")]);

            let data = self.call(req).await?;
            if let Some(Value::Array(batch)) = data.get(list_key) {
                items.extend(batch.iter().cloned());
            }

            let total_pages = data
                .pointer("/page_info/total_page")
                .and_then(Value::as_u64)
                .unwrap_or(1) as usize;
            if page >= total_pages {
                return Ok(items);
            }
        }

        warn!("TikTok listing {path} truncated after {MAX_PAGES} pages");
        Ok(items)
    }

    async fn advertisers(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let req = self
            .http
            .get(self.url("/oauth2/advertiser/get/"))
            .header("Access-Token", token)
            .query(&[("app_id", self.app_id.as_str()), ("secret", self.secret.as_str())]);
        let data = self.call(req).await?;

        let rows = data
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = str_field(&row, "advertiser_id")?;
                let name = str_field(&row, "advertiser_name").unwrap_or_else(|| id.clone());
                Some(Asset::new(AssetType::AdAccounts, id, name).with_raw(row))
            })
            .collect())
    }

    async fn pixels(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let advertisers = self.advertisers(token).await?;
        let mut pixels = Vec::new();

        for advertiser in advertisers {
            let rows = self
                .collect_paged(
                    "/pixel/list/",
                    &[("advertiser_id", advertiser.id.as_str())],
                    "pixels",
                    token,
                )
                .await?;
            pixels.extend(rows.into_iter().filter_map(|row| {
                let id = str_field(&row, "pixel_id")?;
                let name = str_field(&row, "pixel_name").unwrap_or_else(|| id.clone());
                Some(
                    Asset::new(AssetType::Pixels, id, name)
                        .with_parent(advertiser.id.clone())
                        .with_status(str_field(&row, "activity_status"))
                        .with_raw(row),
                )
            }));
        }

        Ok(pixels)
    }

    async fn business_centers(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let rows = self.collect_paged("/bc/get/", &[], "list", token).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let info = row.get("bc_info")?;
                let id = str_field(info, "bc_id")?;
                let name = str_field(info, "name").unwrap_or_else(|| id.clone());
                let asset = Asset::new(AssetType::BusinessCenters, id, name)
                    .with_status(str_field(info, "status"))
                    .with_currency(str_field(info, "currency"))
                    .with_timezone(str_field(info, "timezone"));
                Some(asset.with_raw(row))
            })
            .collect())
    }

    async fn catalogs(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let centers = self.business_centers(token).await?;
        let mut catalogs = Vec::new();

        for center in centers {
            let rows = self
                .collect_paged("/catalog/get/", &[("bc_id", center.id.as_str())], "list", token)
                .await?;
            catalogs.extend(rows.into_iter().filter_map(|row| {
                let id = str_field(&row, "catalog_id")?;
                let name = str_field(&row, "catalog_name").unwrap_or_else(|| id.clone());
                Some(
                    Asset::new(AssetType::Catalogs, id, name)
                        .with_parent(center.id.clone())
                        .with_raw(row),
                )
            }));
        }

        Ok(catalogs)
    }
}

#[async_trait]
impl PlatformProvider for TikTokProvider {
    fn platform(&self) -> Platform {
        Platform::TikTok
    }

    fn display_name(&self) -> &str {
        "TikTok for Business"
    }

    fn default_scopes(&self) -> Vec<String> {
        // Scopes are granted on the app in the developer portal, not per request.
        vec![]
    }

    fn asset_types(&self) -> &'static [AssetType] {
        ASSET_TYPES
    }

    fn auth_url(
        &self,
        _scopes: &[String],
        state: &str,
        redirect_uri: &str,
        _pkce_verifier: &str,
    ) -> String {
        format!(
            "https://business-api.tiktok.com/portal/auth?\
             app_id={app_id}\
             &state={state}\
             &redirect_uri={redirect_uri}",
            app_id = urlencoding(&self.app_id),
            state = urlencoding(state),
            redirect_uri = urlencoding(redirect_uri),
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
        _pkce_verifier: &str,
    ) -> Result<TokenSet, ApiError> {
        let req = self.http.post(self.url("/oauth2/access_token/")).json(&json!({
            "app_id": self.app_id,
            "secret": self.secret,
            "auth_code": code,
        }));
        let data = self.call(req).await?;
        let token: TikTokTokenData = serde_json::from_value(data)
            .map_err(|e| ApiError::platform("tiktok", format!("unexpected token response: {e}")))?;

        let scope = token
            .scope
            .iter()
            .map(|s| match s {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(",");

        Ok(TokenSet {
            access_token: token.access_token,
            refresh_token: None,
            token_type: "Bearer".into(),
            expires_in: None,
            scope: Some(scope).filter(|s| !s.is_empty()),
        })
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenSet, ApiError> {
        Err(ApiError::ReauthorizationRequired(
            "tiktok: marketing API tokens cannot be refreshed".into(),
        ))
    }

    async fn revoke(&self, token: &str) -> Result<(), ApiError> {
        let req = self.http.post(self.url("/oauth2/revoke_token/")).json(&json!({
            "app_id": self.app_id,
            "secret": self.secret,
            "access_token": token,
        }));
        self.call(req).await?;
        Ok(())
    }

    async fn identify(&self, access_token: &str) -> Result<AccountIdentity, ApiError> {
        let req = self
            .http
            .get(self.url("/user/info/"))
            .header("Access-Token", access_token);
        let data = self.call(req).await?;

        let account_id = str_field(&data, "core_user_id")
            .or_else(|| str_field(&data, "id"))
            .ok_or_else(|| ApiError::platform("tiktok", "user info missing core_user_id"))?;
        let account_name = str_field(&data, "display_name")
            .or_else(|| str_field(&data, "email"))
            .unwrap_or_else(|| account_id.clone());
        Ok(AccountIdentity {
            account_id,
            account_name,
        })
    }

    async fn fetch_assets(
        &self,
        asset_type: AssetType,
        access_token: &str,
    ) -> Result<Vec<Asset>, ApiError> {
        match asset_type {
            AssetType::AdAccounts => self.advertisers(access_token).await,
            AssetType::Pixels => self.pixels(access_token).await,
            AssetType::BusinessCenters => self.business_centers(access_token).await,
            AssetType::Catalogs => self.catalogs(access_token).await,
            other => Err(unsupported(Platform::TikTok, other)),
        }
    }

    fn token_ttl(&self) -> Duration {
        Duration::from_secs(365 * 24 * 3600)
    }
}
