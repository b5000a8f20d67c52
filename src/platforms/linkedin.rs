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

const ASSET_TYPES: &[AssetType] = &[AssetType::AdAccounts, AssetType::Organizations];

/// Versioned REST API release pinned by this integration.
const LINKEDIN_VERSION: &str = "202401";

const PAGE_SIZE: usize = 100;

/// LinkedIn Marketing API.
///
/// Quirks:
/// - Access tokens expire in 60 days; refresh tokens (1 year) only for
///   approved Marketing Developer Platform apps.
/// - The versioned `/rest` API needs `LinkedIn-Version` and Rest.li headers.
/// - Listings paginate with `start`/`count` offsets.
pub struct LinkedInProvider {
    client_id: String,
    client_secret: String,
    oauth_base: String,
    api_base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct LinkedInTokenResponse {
    access_token: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    refresh_token_expires_in: Option<u64>,
    scope: Option<String>,
}

impl From<LinkedInTokenResponse> for TokenSet {
    fn from(t: LinkedInTokenResponse) -> Self {
        TokenSet {
            access_token: t.access_token,
            refresh_token: t.refresh_token,
            token_type: "Bearer".into(),
            expires_in: t.expires_in,
            scope: t.scope,
        }
    }
}

impl LinkedInProvider {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            oauth_base: "https://www.linkedin.com/oauth/v2".into(),
            api_base: "https://api.linkedin.com".into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        self.oauth_base = base.clone();
        self.api_base = base;
        self
    }

    fn rest(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}/rest{}", self.api_base, path))
            .bearer_auth(token)
            .header("LinkedIn-Version", LINKEDIN_VERSION)
            .header("X-Restli-Protocol-Version", "2.0.0")
    }

    /// Offset-paginated listing of `elements`.
    async fn collect(
        &self,
        path: &str,
        query: &[(&str, &str)],
        token: &str,
    ) -> Result<Vec<Value>, ApiError> {
        let mut items = Vec::new();
        let count = PAGE_SIZE.to_string();

        for page in 0..MAX_PAGES {
            let start = (page * PAGE_SIZE).to_string();
            let req = self
                .rest(path, token)
                .query(query)
                .query(&[("start", start.as_str()), ("count", count.as_str())]);
            let resp: Value = http::get_json(Platform::LinkedIn, req).await?;

            let batch = resp
                .get("elements")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let fetched = batch.len();
            items.extend(batch);

            let total = resp.pointer("/paging/total").and_then(Value::as_u64);
            let done = match total {
                Some(total) => items.len() as u64 >= total,
                None => fetched < PAGE_SIZE,
            };
            if done {
                return Ok(items);
            }
        }

        warn!("LinkedIn listing {path} truncated after {MAX_PAGES} pages");
        Ok(items)
    }

    async fn ad_accounts(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let rows = self.collect("/adAccounts", &[("q", "search")], token).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = str_field(&row, "id")?;
                let name = str_field(&row, "name").unwrap_or_else(|| id.clone());
                let status = str_field(&row, "status").map(|s| s.to_ascii_lowercase());
                let mut asset = Asset::new(AssetType::AdAccounts, id, name)
                    .with_status(status)
                    .with_currency(str_field(&row, "currency"));
                if let Some(org) = str_field(&row, "reference") {
                    asset = asset.with_parent(urn_id(&org));
                }
                Some(asset.with_raw(row))
            })
            .collect())
    }

    async fn organizations(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let rows = self
            .collect(
                "/organizationAcls",
                &[("q", "roleAssignee"), ("state", "APPROVED")],
                token,
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let urn = str_field(&row, "organization")?;
                let id = urn_id(&urn);
                let name = row
                    .pointer("/organization~/localizedName")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| urn.clone());
                let role = str_field(&row, "role").map(|r| r.to_ascii_lowercase());
                Some(
                    Asset::new(AssetType::Organizations, id, name)
                        .with_status(role)
                        .with_raw(row),
                )
            })
            .collect())
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenSet, ApiError> {
        let req = self
            .http
            .post(format!("{}/accessToken", self.oauth_base))
            .form(params);
        let token: LinkedInTokenResponse = http::get_json(Platform::LinkedIn, req).await?;
        Ok(token.into())
    }
}

/// `urn:li:organization:123` → `123`.
fn urn_id(urn: &str) -> String {
    urn.rsplit(':').next().unwrap_or(urn).to_string()
}

#[async_trait]
impl PlatformProvider for LinkedInProvider {
    fn platform(&self) -> Platform {
        Platform::LinkedIn
    }

    fn display_name(&self) -> &str {
        "LinkedIn"
    }

    fn default_scopes(&self) -> Vec<String> {
        vec![
            "openid".into(),
            "profile".into(),
            "email".into(),
            "r_ads".into(),
            "rw_ads".into(),
            "r_ads_reporting".into(),
            "r_organization_admin".into(),
            "w_organization_social".into(),
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
            "https://www.linkedin.com/oauth/v2/authorization?\
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
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ApiError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ])
        .await
        .map_err(|e| http::refresh_error(Platform::LinkedIn, e))
    }

    async fn revoke(&self, token: &str) -> Result<(), ApiError> {
        let req = self
            .http
            .post(format!("{}/revoke", self.oauth_base))
            .form(&[
                ("token", token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ]);
        let resp = http::send(Platform::LinkedIn, req).await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::platform(
                "linkedin",
                format!("revoke failed: {}", http::vendor_message(&body)),
            ));
        }
        Ok(())
    }

    async fn identify(&self, access_token: &str) -> Result<AccountIdentity, ApiError> {
        let req = self
            .http
            .get(format!("{}/v2/userinfo", self.api_base))
            .bearer_auth(access_token);
        let info: Value = http::get_json(Platform::LinkedIn, req).await?;

        let account_id = str_field(&info, "sub")
            .ok_or_else(|| ApiError::platform("linkedin", "userinfo response missing sub"))?;
        Ok(AccountIdentity {
            account_name: str_field(&info, "name").unwrap_or_else(|| account_id.clone()),
            account_id,
        })
    }

    async fn fetch_assets(
        &self,
        asset_type: AssetType,
        access_token: &str,
    ) -> Result<Vec<Asset>, ApiError> {
        match asset_type {
            AssetType::AdAccounts => self.ad_accounts(access_token).await,
            AssetType::Organizations => self.organizations(access_token).await,
            other => Err(unsupported(Platform::LinkedIn, other)),
        }
    }

    fn token_ttl(&self) -> Duration {
        Duration::from_secs(60 * 24 * 3600) // LinkedIn tokens expire in 60 days
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urn_id() {
        assert_eq!(urn_id("urn:li:organization:2414183"), "2414183");
        assert_eq!(urn_id("plain"), "plain");
    }

    #[test]
    fn test_auth_url_space_separated_scopes() {
        let provider = LinkedInProvider::new("cid".into(), "s".into());
        let url = provider.auth_url(&["r_ads".into(), "rw_ads".into()], "st", "http://x/cb", "v");
        assert!(url.contains("scope=r_ads+rw_ads"));
    }
}
