use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

use super::http::{self, str_field, urlencoding, MAX_PAGES};
use super::traits::{
    unsupported, AccountIdentity, Asset, AssetType, Platform, PlatformProvider, TokenSet,
};
use crate::error::ApiError;

const GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";

const ASSET_TYPES: &[AssetType] = &[
    AssetType::Pages,
    AssetType::InstagramAccounts,
    AssetType::AdAccounts,
    AssetType::Pixels,
    AssetType::Catalogs,
    AssetType::BusinessManagers,
];

/// Meta (Facebook / Instagram) Graph API.
///
/// Quirks:
/// - No refresh tokens. A code yields a short-lived token which is swapped
///   for a ~60 day long-lived token; "refreshing" repeats that swap with the
///   current long-lived token, so the stored refresh token is the access token.
/// - Scopes are comma-separated.
/// - Listings paginate through absolute `paging.next` URLs.
pub struct MetaProvider {
    client_id: String,
    client_secret: String,
    api_base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MetaTokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GraphPage {
    #[serde(default)]
    data: Vec<Value>,
    paging: Option<GraphPaging>,
}

#[derive(Debug, Deserialize)]
struct GraphPaging {
    next: Option<String>,
}

impl MetaProvider {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            api_base: GRAPH_BASE.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Point Graph API calls somewhere else (tests, API version pinning).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// GET a Graph edge and follow `paging.next` up to `MAX_PAGES`.
    async fn collect(&self, path: &str, fields: &str, token: &str) -> Result<Vec<Value>, ApiError> {
        let mut items = Vec::new();
        let mut next = Some(
            self.http
                .get(format!("{}{}", self.api_base, path))
                .query(&[("fields", fields), ("limit", "100")]),
        );
        let mut pages = 0;

        while let Some(req) = next.take() {
            let page: GraphPage = http::get_json(Platform::Meta, req.bearer_auth(token)).await?;
            items.extend(page.data);
            pages += 1;
            if pages >= MAX_PAGES {
                warn!("Meta listing {path} truncated after {MAX_PAGES} pages");
                break;
            }
            next = page
                .paging
                .and_then(|p| p.next)
                .map(|url| self.http.get(url));
        }

        Ok(items)
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<MetaTokenResponse, ApiError> {
        let req = self
            .http
            .get(format!("{}/oauth/access_token", self.api_base))
            .query(params);
        http::get_json(Platform::Meta, req).await
    }

    /// Swap a token for a long-lived one.
    async fn exchange_long_lived(&self, token: &str) -> Result<TokenSet, ApiError> {
        let long = self
            .token_request(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("fb_exchange_token", token),
            ])
            .await?;

        Ok(TokenSet {
            refresh_token: Some(long.access_token.clone()),
            access_token: long.access_token,
            token_type: long.token_type.unwrap_or_else(|| "bearer".into()),
            expires_in: long.expires_in.or(Some(self.token_ttl().as_secs())),
            scope: None,
        })
    }

    async fn ad_accounts(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let rows = self
            .collect(
                "/me/adaccounts",
                "id,name,account_status,currency,timezone_name",
                token,
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = str_field(&row, "id")?;
                let name = str_field(&row, "name").unwrap_or_else(|| id.clone());
                let status = row
                    .get("account_status")
                    .and_then(Value::as_i64)
                    .map(|code| account_status(code).to_string());
                Some(
                    Asset::new(AssetType::AdAccounts, id, name)
                        .with_status(status)
                        .with_currency(str_field(&row, "currency"))
                        .with_timezone(str_field(&row, "timezone_name"))
                        .with_raw(row),
                )
            })
            .collect())
    }

    async fn businesses(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let rows = self
            .collect("/me/businesses", "id,name,verification_status", token)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = str_field(&row, "id")?;
                let name = str_field(&row, "name").unwrap_or_else(|| id.clone());
                Some(
                    Asset::new(AssetType::BusinessManagers, id, name)
                        .with_status(str_field(&row, "verification_status"))
                        .with_raw(row),
                )
            })
            .collect())
    }

    async fn pages(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let rows = self.collect("/me/accounts", "id,name,category,tasks", token).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = str_field(&row, "id")?;
                let name = str_field(&row, "name").unwrap_or_else(|| id.clone());
                Some(Asset::new(AssetType::Pages, id, name).with_raw(row))
            })
            .collect())
    }

    async fn instagram_accounts(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let rows = self
            .collect(
                "/me/accounts",
                "id,name,instagram_business_account{id,username,name,profile_picture_url}",
                token,
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let page_id = str_field(&row, "id")?;
                let ig = row.get("instagram_business_account")?.clone();
                let id = str_field(&ig, "id")?;
                let name = str_field(&ig, "username")
                    .or_else(|| str_field(&ig, "name"))
                    .unwrap_or_else(|| id.clone());
                Some(
                    Asset::new(AssetType::InstagramAccounts, id, name)
                        .with_parent(page_id)
                        .with_raw(ig),
                )
            })
            .collect())
    }

    async fn pixels(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let accounts = self.ad_accounts(token).await?;
        let mut seen = HashSet::new();
        let mut pixels = Vec::new();

        for account in accounts {
            let rows = self
                .collect(
                    &format!("/{}/adspixels", account.id),
                    "id,name,last_fired_time",
                    token,
                )
                .await?;
            for row in rows {
                let Some(id) = str_field(&row, "id") else { continue };
                // Pixels shared across ad accounts show up once per account.
                if !seen.insert(id.clone()) {
                    continue;
                }
                let name = str_field(&row, "name").unwrap_or_else(|| id.clone());
                pixels.push(
                    Asset::new(AssetType::Pixels, id, name)
                        .with_parent(account.id.clone())
                        .with_raw(row),
                );
            }
        }

        Ok(pixels)
    }

    async fn catalogs(&self, token: &str) -> Result<Vec<Asset>, ApiError> {
        let businesses = self.businesses(token).await?;
        let mut catalogs = Vec::new();

        for business in businesses {
            let rows = self
                .collect(
                    &format!("/{}/owned_product_catalogs", business.id),
                    "id,name,product_count",
                    token,
                )
                .await?;
            catalogs.extend(rows.into_iter().filter_map(|row| {
                let id = str_field(&row, "id")?;
                let name = str_field(&row, "name").unwrap_or_else(|| id.clone());
                Some(
                    Asset::new(AssetType::Catalogs, id, name)
                        .with_parent(business.id.clone())
                        .with_raw(row),
                )
            }));
        }

        Ok(catalogs)
    }
}

/// Meta's numeric `account_status` codes.
fn account_status(code: i64) -> &'static str {
    match code {
        1 => "active",
        2 => "disabled",
        3 => "unsettled",
        7 => "pending_risk_review",
        8 => "pending_settlement",
        9 => "in_grace_period",
        100 => "pending_closure",
        101 => "closed",
        _ => "unknown",
    }
}

#[async_trait]
impl PlatformProvider for MetaProvider {
    fn platform(&self) -> Platform {
        Platform::Meta
    }

    fn display_name(&self) -> &str {
        "Meta"
    }

    fn default_scopes(&self) -> Vec<String> {
        vec![
            "ads_management".into(),
            "ads_read".into(),
            "business_management".into(),
            "pages_show_list".into(),
            "pages_read_engagement".into(),
            "instagram_basic".into(),
            "catalog_management".into(),
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
        let scope_str = scopes.join(",");
        format!(
            "https://www.facebook.com/v19.0/dialog/oauth?\
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
        let short = self
            .token_request(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", redirect_uri),
                ("code", code),
            ])
            .await?;

        self.exchange_long_lived(&short.access_token).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ApiError> {
        self.exchange_long_lived(refresh_token)
            .await
            .map_err(|e| http::refresh_error(Platform::Meta, e))
    }

    async fn revoke(&self, token: &str) -> Result<(), ApiError> {
        let req = self
            .http
            .delete(format!("{}/me/permissions", self.api_base))
            .bearer_auth(token);
        let _: Value = http::get_json(Platform::Meta, req).await?;
        Ok(())
    }

    async fn identify(&self, access_token: &str) -> Result<AccountIdentity, ApiError> {
        let req = self
            .http
            .get(format!("{}/me", self.api_base))
            .query(&[("fields", "id,name")])
            .bearer_auth(access_token);
        let me: Value = http::get_json(Platform::Meta, req).await?;

        let account_id = str_field(&me, "id")
            .ok_or_else(|| ApiError::platform("meta", "profile response missing id"))?;
        Ok(AccountIdentity {
            account_name: str_field(&me, "name").unwrap_or_else(|| account_id.clone()),
            account_id,
        })
    }

    async fn fetch_assets(
        &self,
        asset_type: AssetType,
        access_token: &str,
    ) -> Result<Vec<Asset>, ApiError> {
        match asset_type {
            AssetType::Pages => self.pages(access_token).await,
            AssetType::InstagramAccounts => self.instagram_accounts(access_token).await,
            AssetType::AdAccounts => self.ad_accounts(access_token).await,
            AssetType::Pixels => self.pixels(access_token).await,
            AssetType::Catalogs => self.catalogs(access_token).await,
            AssetType::BusinessManagers => self.businesses(access_token).await,
            other => Err(unsupported(Platform::Meta, other)),
        }
    }

    fn token_ttl(&self) -> Duration {
        Duration::from_secs(60 * 24 * 3600)
    }
}
