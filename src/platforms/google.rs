use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use super::http::{self, str_field, urlencoding, MAX_PAGES};
use super::traits::{
    unsupported, AccountIdentity, Asset, AssetType, Platform, PlatformProvider, TokenSet,
};
use crate::error::ApiError;

const ASSET_TYPES: &[AssetType] = &[
    AssetType::AdAccounts,
    AssetType::YoutubeChannels,
    AssetType::AnalyticsProperties,
    AssetType::MerchantCenters,
];

/// Google OAuth 2.0 plus the Ads, YouTube, Analytics Admin and Content APIs.
///
/// Token lifetime: 1 hour.
/// Refresh: supported (requires `access_type=offline` and `prompt=consent`).
/// Google Ads calls additionally need a `developer-token` header.
pub struct GoogleProvider {
    client_id: String,
    client_secret: String,
    developer_token: Option<String>,
    endpoints: Endpoints,
    http: reqwest::Client,
}

struct Endpoints {
    oauth: String,
    userinfo: String,
    ads: String,
    youtube: String,
    analytics: String,
    content: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            oauth: "https://oauth2.googleapis.com".into(),
            userinfo: "https://openidconnect.googleapis.com/v1".into(),
            ads: "https://googleads.googleapis.com/v17".into(),
            youtube: "https://www.googleapis.com/youtube/v3".into(),
            analytics: "https://analyticsadmin.googleapis.com/v1beta".into(),
            content: "https://shoppingcontent.googleapis.com/content/v2.1".into(),
        }
    }
}

// Raw token response from Google's token endpoint
#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: String,
    expires_in: Option<u64>,
    scope: Option<String>,
}

impl From<GoogleTokenResponse> for TokenSet {
    fn from(t: GoogleTokenResponse) -> Self {
        TokenSet {
            access_token: t.access_token,
            refresh_token: t.refresh_token,
            token_type: t.token_type,
            expires_in: t.expires_in,
            scope: t.scope,
        }
    }
}

impl GoogleProvider {
    pub fn new(client_id: String, client_secret: String, developer_token: Option<String>) -> Self {
        Self {
            client_id,
            client_secret,
            developer_token,
            endpoints: Endpoints::default(),
            http: reqwest::Client::new(),
        }
    }

    /// Route every Google API through one base URL (tests).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        self.endpoints = Endpoints {
            oauth: base.clone(),
            userinfo: base.clone(),
            ads: base.clone(),
            youtube: base.clone(),
            analytics: base.clone(),
            content: base,
        };
        self
    }

    /// GET a listing and follow `nextPageToken`, gathering the array under `items_key`.
    async fn collect(
        &self,
        url: &str,
        query: &[(&str, &str)],
        items_key: &str,
        token: &str,
    ) -> Result<Vec<Value>, ApiError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut req = self.http.get(url).query(query).bearer_auth(token);
            if let Some(pt) = &page_token {
                req = req.query(&[("pageToken", pt.as_str())]);
            }

            let page: Value = http::get_json(Platform::Google, req).await?;
            if let Some(Value::Array(batch)) = page.get(items_key) {
                items.extend(batch.iter().cloned());
            }

            page_token = str_field(&page, "nextPageToken").filter(|t| !t.is_empty());
            if page_token.is_none() {
                return Ok(items);
            }
        }

        warn!("Google listing {url} truncated after {MAX_PAGES} pages");
        Ok(items)
    }

    async fn ad_accounts(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let developer_token = self.developer_token.as_deref().ok_or_else(|| {
            ApiError::platform("google", "GOOGLE_DEVELOPER_TOKEN is not configured")
        })?;

        let req = self
            .http
            .get(format!("{}/customers:listAccessibleCustomers", self.endpoints.ads))
            .bearer_auth(token)
            .header("developer-token", developer_token);
        let resp: Value = http::get_json(Platform::Google, req).await?;

        let names = resp
            .get("resourceNames")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(names
            .into_iter()
            .filter_map(|v| {
                let resource = v.as_str()?.to_string();
                let id = resource.strip_prefix("customers/")?.to_string();
                Some(
                    Asset::new(AssetType::AdAccounts, id.clone(), format!("Customer {id}"))
                        .with_raw(Value::String(resource)),
                )
            })
            .collect())
    }

    async fn youtube_channels(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let rows = self
            .collect(
                &format!("{}/channels", self.endpoints.youtube),
                &[("part", "snippet,statistics"), ("mine", "true"), ("maxResults", "50")],
                "items",
                token,
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = str_field(&row, "id")?;
                let name = row
                    .pointer("/snippet/title")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| id.clone());
                Some(Asset::new(AssetType::YoutubeChannels, id, name).with_raw(row))
            })
            .collect())
    }

    async fn analytics_properties(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let summaries = self
            .collect(
                &format!("{}/accountSummaries", self.endpoints.analytics),
                &[("pageSize", "200")],
                "accountSummaries",
                token,
            )
            .await?;

        let mut properties = Vec::new();
        for account in summaries {
            let account_id = str_field(&account, "account")
                .map(|a| a.trim_start_matches("accounts/").to_string());
            let Some(Value::Array(props)) = account.get("propertySummaries") else {
                continue;
            };
            for prop in props {
                let Some(resource) = str_field(prop, "property") else { continue };
                let id = resource.trim_start_matches("properties/").to_string();
                let name = str_field(prop, "displayName").unwrap_or_else(|| id.clone());
                let mut asset =
                    Asset::new(AssetType::AnalyticsProperties, id, name).with_raw(prop.clone());
                if let Some(parent) = &account_id {
                    asset = asset.with_parent(parent.clone());
                }
                properties.push(asset);
            }
        }

        Ok(properties)
    }

    async fn merchant_centers(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let req = self
            .http
            .get(format!("{}/accounts/authinfo", self.endpoints.content))
            .bearer_auth(token);
        let resp: Value = http::get_json(Platform::Google, req).await?;

        let identifiers = resp
            .get("accountIdentifiers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(identifiers
            .into_iter()
            .filter_map(|row| {
                // Sub-accounts carry both ids; standalone accounts only a merchantId.
                let merchant = str_field(&row, "merchantId");
                let aggregator = str_field(&row, "aggregatorId");
                let id = merchant.clone().or_else(|| aggregator.clone())?;
                let mut asset =
                    Asset::new(AssetType::MerchantCenters, id.clone(), format!("Merchant {id}"));
                if let (Some(_), Some(agg)) = (&merchant, aggregator) {
                    asset = asset.with_parent(agg);
                }
                Some(asset.with_raw(row))
            })
            .collect())
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenSet, ApiError> {
        let req = self
            .http
            .post(format!("{}/token", self.endpoints.oauth))
            .form(params);
        let token: GoogleTokenResponse = http::get_json(Platform::Google, req).await?;
        Ok(token.into())
    }
}

#[async_trait]
impl PlatformProvider for GoogleProvider {
    fn platform(&self) -> Platform {
        Platform::Google
    }

    fn display_name(&self) -> &str {
        "Google"
    }

    fn default_scopes(&self) -> Vec<String> {
        vec![
            "https://www.googleapis.com/auth/adwords".into(),
            "https://www.googleapis.com/auth/youtube.readonly".into(),
            "https://www.googleapis.com/auth/analytics.readonly".into(),
            "https://www.googleapis.com/auth/content".into(),
            "openid".into(),
            "email".into(),
            "profile".into(),
        ]
    }

    fn asset_types(&self) -> &'static [AssetType] {
        ASSET_TYPES
    }

    fn auth_url(
        &self,
        scopes: &[String],
        state: &str,
        redirect_uri: &str,
        _pkce_verifier: &str,
    ) -> String {
        let scope_str = scopes.join(" ");
        format!(
            "https://accounts.google.com/o/oauth2/v2/auth?\
             client_id={client_id}\
             &redirect_uri={redirect_uri}\
             &response_type=code\
             &scope={scope}\
             &state={state}\
             &access_type=offline\
             &prompt=consent",
            client_id = urlencoding(&self.client_id),
            redirect_uri = urlencoding(redirect_uri),
            scope = urlencoding(&scope_str),
            state = urlencoding(state),
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        _pkce_verifier: &str,
    ) -> Result<TokenSet, ApiError> {
        self.token_request(&[
            ("code", code),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ApiError> {
        // Google doesn't always return a new refresh token on refresh
        self.token_request(&[
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("grant_type", "refresh_token"),
        ])
        .await
        .map_err(|e| http::refresh_error(Platform::Google, e))
    }

    async fn revoke(&self, token: &str) -> Result<(), ApiError> {
        let req = self
            .http
            .post(format!("{}/revoke", self.endpoints.oauth))
            .form(&[("token", token)]);
        let resp = http::send(Platform::Google, req).await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::platform(
                "google",
                format!("revoke failed: {}", http::vendor_message(&body)),
            ));
        }
        Ok(())
    }

    async fn identify(&self, access_token: &str) -> Result<AccountIdentity, ApiError> {
        let req = self
            .http
            .get(format!("{}/userinfo", self.endpoints.userinfo))
            .bearer_auth(access_token);
        let info: Value = http::get_json(Platform::Google, req).await?;

        let account_id = str_field(&info, "sub")
            .ok_or_else(|| ApiError::platform("google", "userinfo response missing sub"))?;
        let account_name = str_field(&info, "email")
            .or_else(|| str_field(&info, "name"))
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
            AssetType::AdAccounts => self.ad_accounts(access_token).await,
            AssetType::YoutubeChannels => self.youtube_channels(access_token).await,
            AssetType::AnalyticsProperties => self.analytics_properties(access_token).await,
            AssetType::MerchantCenters => self.merchant_centers(access_token).await,
            other => Err(unsupported(Platform::Google, other)),
        }
    }

    fn token_ttl(&self) -> Duration {
        Duration::from_secs(3600) // Google tokens expire in 1 hour
    }
}
