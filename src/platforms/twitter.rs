use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use super::http::{self, str_field, urlencoding, MAX_PAGES};
use super::traits::{
    unsupported, AccountIdentity, Asset, AssetType, Platform, PlatformProvider, TokenSet,
};
use crate::error::ApiError;

const ASSET_TYPES: &[AssetType] = &[AssetType::AdAccounts];

/// S256 code challenge: unpadded base64url of SHA-256(verifier).
fn pkce_challenge(verifier: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Twitter (X) OAuth 2.0 and Ads API.
///
/// Quirks:
/// - OAuth 2.0 with PKCE (required, S256 challenge).
/// - Access tokens expire in 2 hours; `offline.access` yields refresh tokens.
/// - Token endpoint requires Basic auth (client_id:client_secret).
/// - Ads API listings paginate with `next_cursor`.
pub struct TwitterProvider {
    client_id: String,
    client_secret: String,
    api_base: String,
    ads_base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TwitterTokenResponse {
    access_token: String,
    token_type: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

impl From<TwitterTokenResponse> for TokenSet {
    fn from(t: TwitterTokenResponse) -> Self {
        TokenSet {
            access_token: t.access_token,
            refresh_token: t.refresh_token,
            token_type: t.token_type,
            expires_in: t.expires_in,
            scope: t.scope,
        }
    }
}

impl TwitterProvider {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            api_base: "https://api.twitter.com/2".into(),
            ads_base: "https://ads-api.twitter.com/12".into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        self.api_base = base.clone();
        self.ads_base = base;
        self
    }

    async fn ad_accounts(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let mut rows: Vec<Value> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut complete = false;

        for _ in 0..MAX_PAGES {
            let mut req = self
                .http
                .get(format!("{}/accounts", self.ads_base))
                .bearer_auth(token)
                .query(&[("count", "200")]);
            if let Some(c) = &cursor {
                req = req.query(&[("cursor", c.as_str())]);
            }

            let page: Value = http::get_json(Platform::Twitter, req).await?;
            if let Some(Value::Array(batch)) = page.get("data") {
                rows.extend(batch.iter().cloned());
            }

            cursor = str_field(&page, "next_cursor").filter(|c| !c.is_empty());
            if cursor.is_none() {
                complete = true;
                break;
            }
        }

        if !complete {
            warn!("Twitter ad account listing truncated after {MAX_PAGES} pages");
        }

        Ok(rows
            .into_iter()
            .filter(|row| !row.get("deleted").and_then(Value::as_bool).unwrap_or(false))
            .filter_map(|row| {
                let id = str_field(&row, "id")?;
                let name = str_field(&row, "name").unwrap_or_else(|| id.clone());
                let status = str_field(&row, "approval_status").map(|s| s.to_ascii_lowercase());
                Some(
                    Asset::new(AssetType::AdAccounts, id, name)
                        .with_status(status)
                        .with_timezone(str_field(&row, "timezone"))
                        .with_raw(row),
                )
            })
            .collect())
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenSet, ApiError> {
        let req = self
            .http
            .post(format!("{}/oauth2/token", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(params);
        let token: TwitterTokenResponse = http::get_json(Platform::Twitter, req).await?;
        Ok(token.into())
    }
}

#[async_trait]
impl PlatformProvider for TwitterProvider {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn display_name(&self) -> &str {
        "X (Twitter)"
    }

    fn default_scopes(&self) -> Vec<String> {
        vec![
            "tweet.read".into(),
            "tweet.write".into(),
            "users.read".into(),
            "offline.access".into(),
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
        pkce_verifier: &str,
    ) -> String {
        let scope_str = scopes.join(" ");
        format!(
            "https://twitter.com/i/oauth2/authorize?\
             client_id={client_id}\
             &redirect_uri={redirect_uri}\
             &response_type=code\
             &scope={scope}\
             &state={state}\
             &code_challenge={challenge}\
             &code_challenge_method=S256",
            client_id = urlencoding(&self.client_id),
            redirect_uri = urlencoding(redirect_uri),
            scope = urlencoding(&scope_str),
            state = urlencoding(state),
            challenge = pkce_challenge(pkce_verifier),
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: &str,
    ) -> Result<TokenSet, ApiError> {
        self.token_request(&[
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
            ("code_verifier", pkce_verifier),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ApiError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
        .map_err(|e| http::refresh_error(Platform::Twitter, e))
    }

    async fn revoke(&self, token: &str) -> Result<(), ApiError> {
        let req = self
            .http
            .post(format!("{}/oauth2/revoke", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token)]);
        let _: Value = http::get_json(Platform::Twitter, req).await?;
        Ok(())
    }

    async fn identify(&self, access_token: &str) -> Result<AccountIdentity, ApiError> {
        let req = self
            .http
            .get(format!("{}/users/me", self.api_base))
            .bearer_auth(access_token);
        let me: Value = http::get_json(Platform::Twitter, req).await?;
        let data = me
            .get("data")
            .ok_or_else(|| ApiError::platform("twitter", "users/me response missing data"))?;

        let account_id = str_field(data, "id")
            .ok_or_else(|| ApiError::platform("twitter", "users/me response missing id"))?;
        let account_name = str_field(data, "username")
            .map(|u| format!("@{u}"))
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
            other => Err(unsupported(Platform::Twitter, other)),
        }
    }

    fn token_ttl(&self) -> Duration {
        Duration::from_secs(2 * 3600) // X tokens expire in 2 hours
    }
}
