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
    AssetType::Organizations,
    AssetType::AdAccounts,
    AssetType::Pixels,
];

/// Snapchat Marketing API.
///
/// Quirks:
/// - Access tokens live 30 minutes; refresh tokens are long-lived.
/// - List items are wrapped: `{"organizations": [{"organization": {...}}]}`.
/// - Listings paginate with absolute `paging.next_link` URLs.
pub struct SnapchatProvider {
    client_id: String,
    client_secret: String,
    oauth_base: String,
    api_base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SnapchatTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<u64>,
    scope: Option<String>,
}

impl From<SnapchatTokenResponse> for TokenSet {
    fn from(t: SnapchatTokenResponse) -> Self {
        TokenSet {
            access_token: t.access_token,
            refresh_token: t.refresh_token,
            token_type: t.token_type.unwrap_or_else(|| "Bearer".into()),
            expires_in: t.expires_in,
            scope: t.scope,
        }
    }
}

impl SnapchatProvider {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            oauth_base: "https://accounts.snapchat.com/login/oauth2".into(),
            api_base: "https://adsapi.snapchat.com/v1".into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        self.oauth_base = base.clone();
        self.api_base = base;
        self
    }

    /// GET `path`, unwrap `list_key[*].item_key`, following `paging.next_link`.
    async fn collect(
        &self,
        path: &str,
        list_key: &str,
        item_key: &str,
        token: &str,
    ) -> Result<Vec<Value>, ApiError> {
        let mut items = Vec::new();
        let mut url = Some(format!("{}{}", self.api_base, path));
        let mut pages = 0;

        while let Some(current) = url.take() {
            let req = self.http.get(&current).bearer_auth(token);
            let page: Value = http::get_json(Platform::Snapchat, req).await?;

            if let Some(Value::Array(batch)) = page.get(list_key) {
                items.extend(batch.iter().filter_map(|w| w.get(item_key).cloned()));
            }

            pages += 1;
            if pages >= MAX_PAGES {
                warn!("Snapchat listing {path} truncated after {MAX_PAGES} pages");
                break;
            }
            url = page
                .pointer("/paging/next_link")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        Ok(items)
    }

    async fn organizations(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let rows = self
            .collect("/me/organizations", "organizations", "organization", token)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = str_field(&row, "id")?;
                let name = str_field(&row, "name").unwrap_or_else(|| id.clone());
                Some(Asset::new(AssetType::Organizations, id, name).with_raw(row))
            })
            .collect())
    }

    async fn ad_accounts(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let organizations = self.organizations(token).await?;
        let mut accounts = Vec::new();

        for org in organizations {
            let rows = self
                .collect(
                    &format!("/organizations/{}/adaccounts", org.id),
                    "adaccounts",
                    "adaccount",
                    token,
                )
                .await?;
            accounts.extend(rows.into_iter().filter_map(|row| {
                let id = str_field(&row, "id")?;
                let name = str_field(&row, "name").unwrap_or_else(|| id.clone());
                let status = str_field(&row, "status").map(|s| s.to_ascii_lowercase());
                Some(
                    Asset::new(AssetType::AdAccounts, id, name)
                        .with_parent(org.id.clone())
                        .with_status(status)
                        .with_currency(str_field(&row, "currency"))
                        .with_timezone(str_field(&row, "timezone"))
                        .with_raw(row),
                )
            }));
        }

        Ok(accounts)
    }

    async fn pixels(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let accounts = self.ad_accounts(token).await?;
        let mut pixels = Vec::new();

        for account in accounts {
            let rows = self
                .collect(
                    &format!("/adaccounts/{}/pixels", account.id),
                    "pixels",
                    "pixel",
                    token,
                )
                .await?;
            pixels.extend(rows.into_iter().filter_map(|row| {
                let id = str_field(&row, "id")?;
                let name = str_field(&row, "name").unwrap_or_else(|| id.clone());
                let status = str_field(&row, "status").map(|s| s.to_ascii_lowercase());
                Some(
                    Asset::new(AssetType::Pixels, id, name)
                        .with_parent(account.id.clone())
                        .with_status(status)
                        .with_raw(row),
                )
            }));
        }

        Ok(pixels)
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenSet, ApiError> {
        let req = self
            .http
            .post(format!("{}/access_token", self.oauth_base))
            .form(params);
        let token: SnapchatTokenResponse = http::get_json(Platform::Snapchat, req).await?;
        Ok(token.into())
    }
}

#[async_trait]
impl PlatformProvider for SnapchatProvider {
    fn platform(&self) -> Platform {
        Platform::Snapchat
    }

    fn display_name(&self) -> &str {
        "Snapchat"
    }

    fn default_scopes(&self) -> Vec<String> {
        vec!["snapchat-marketing-api".into()]
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
            "https://accounts.snapchat.com/login/oauth2/authorize?\
             client_id={client_id}\
             &redirect_uri={redirect_uri}\
             &response_type=code\
             &scope={scope}\
             &state={state}",
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
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ApiError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ])
        .await
        .map_err(|e| http::refresh_error(Platform::Snapchat, e))
    }

    async fn identify(&self, access_token: &str) -> Result<AccountIdentity, ApiError> {
        let req = self
            .http
            .get(format!("{}/me", self.api_base))
            .bearer_auth(access_token);
        let resp: Value = http::get_json(Platform::Snapchat, req).await?;
        let me = resp
            .get("me")
            .ok_or_else(|| ApiError::platform("snapchat", "/me response missing me"))?;

        let account_id = str_field(me, "id")
            .ok_or_else(|| ApiError::platform("snapchat", "/me response missing id"))?;
        let account_name = str_field(me, "display_name")
            .or_else(|| str_field(me, "email"))
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
            AssetType::Organizations => self.organizations(access_token).await,
            AssetType::AdAccounts => self.ad_accounts(access_token).await,
            AssetType::Pixels => self.pixels(access_token).await,
            other => Err(unsupported(Platform::Snapchat, other)),
        }
    }

    fn token_ttl(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }
}
