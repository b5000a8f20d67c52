use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ApiError;

/// Advertising platforms an org can connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Meta,
    Google,
    TikTok,
    LinkedIn,
    Twitter,
    Snapchat,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Meta,
        Platform::Google,
        Platform::TikTok,
        Platform::LinkedIn,
        Platform::Twitter,
        Platform::Snapchat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Meta => "meta",
            Platform::Google => "google",
            Platform::TikTok => "tiktok",
            Platform::LinkedIn => "linkedin",
            Platform::Twitter => "twitter",
            Platform::Snapchat => "snapchat",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "meta" | "facebook" => Ok(Platform::Meta),
            "google" => Ok(Platform::Google),
            "tiktok" => Ok(Platform::TikTok),
            "linkedin" => Ok(Platform::LinkedIn),
            "twitter" | "x" => Ok(Platform::Twitter),
            "snapchat" => Ok(Platform::Snapchat),
            other => Err(ApiError::BadRequest(format!("unknown platform '{other}'"))),
        }
    }
}

/// Kinds of vendor-side resources discoverable through a platform's API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Pages,
    InstagramAccounts,
    AdAccounts,
    Pixels,
    Catalogs,
    BusinessManagers,
    YoutubeChannels,
    AnalyticsProperties,
    MerchantCenters,
    BusinessCenters,
    Organizations,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Pages => "pages",
            AssetType::InstagramAccounts => "instagram_accounts",
            AssetType::AdAccounts => "ad_accounts",
            AssetType::Pixels => "pixels",
            AssetType::Catalogs => "catalogs",
            AssetType::BusinessManagers => "business_managers",
            AssetType::YoutubeChannels => "youtube_channels",
            AssetType::AnalyticsProperties => "analytics_properties",
            AssetType::MerchantCenters => "merchant_centers",
            AssetType::BusinessCenters => "business_centers",
            AssetType::Organizations => "organizations",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let asset_type = match normalized.as_str() {
            "pages" => AssetType::Pages,
            "instagram_accounts" | "instagram" => AssetType::InstagramAccounts,
            "ad_accounts" | "advertisers" => AssetType::AdAccounts,
            "pixels" => AssetType::Pixels,
            "catalogs" => AssetType::Catalogs,
            "business_managers" | "businesses" => AssetType::BusinessManagers,
            "youtube_channels" | "youtube" => AssetType::YoutubeChannels,
            "analytics_properties" | "analytics" => AssetType::AnalyticsProperties,
            "merchant_centers" | "merchant" => AssetType::MerchantCenters,
            "business_centers" => AssetType::BusinessCenters,
            "organizations" => AssetType::Organizations,
            other => {
                return Err(ApiError::BadRequest(format!("unknown asset type '{other}'")));
            }
        };
        Ok(asset_type)
    }
}

/// Vendor-neutral view of a discovered asset. `raw` keeps the vendor payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub name: String,
    pub asset_type: AssetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub raw: serde_json::Value,
}

impl Asset {
    pub fn new(asset_type: AssetType, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            asset_type,
            parent_id: None,
            status: None,
            currency: None,
            timezone: None,
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_status(mut self, status: Option<String>) -> Self {
        self.status = status;
        self
    }

    pub fn with_currency(mut self, currency: Option<String>) -> Self {
        self.currency = currency;
        self
    }

    pub fn with_timezone(mut self, timezone: Option<String>) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }
}

/// A set of tokens returned from a platform after code exchange or refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

/// Account identity captured at connect time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub account_id: String,
    pub account_name: String,
}

/// Trait that every ad platform integration implements.
///
/// Covers the OAuth leg (authorize, exchange, refresh, revoke) and asset
/// discovery against the vendor's APIs.
#[async_trait]
pub trait PlatformProvider: Send + Sync {
    fn platform(&self) -> Platform;

    /// Human-readable display name (e.g., "Meta", "TikTok for Business").
    fn display_name(&self) -> &str;

    /// Scopes requested when the caller does not name any.
    fn default_scopes(&self) -> Vec<String>;

    /// Asset types this platform can discover.
    fn asset_types(&self) -> &'static [AssetType];

    fn supports(&self, asset_type: AssetType) -> bool {
        self.asset_types().contains(&asset_type)
    }

    /// Build the authorization URL that the user should be redirected to.
    ///
    /// `pkce_verifier` is unique to the connect flow; platforms without PKCE
    /// ignore it.
    fn auth_url(
        &self,
        scopes: &[String],
        state: &str,
        redirect_uri: &str,
        pkce_verifier: &str,
    ) -> String;

    /// Exchange an authorization code for tokens, proving the same verifier
    /// that went into `auth_url`.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: &str,
    ) -> Result<TokenSet, ApiError>;

    /// Obtain a fresh access token from a refresh token.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ApiError>;

    /// Revoke a token. Not every platform supports this.
    async fn revoke(&self, _token: &str) -> Result<(), ApiError> {
        Ok(())
    }

    /// Who the token belongs to. Used to key connections.
    async fn identify(&self, access_token: &str) -> Result<AccountIdentity, ApiError>;

    /// Discover every asset of `asset_type` visible to the token.
    async fn fetch_assets(
        &self,
        asset_type: AssetType,
        access_token: &str,
    ) -> Result<Vec<Asset>, ApiError>;

    /// How long tokens from this platform typically live.
    fn token_ttl(&self) -> Duration {
        Duration::from_secs(3600)
    }
}

pub(crate) fn unsupported(platform: Platform, asset_type: AssetType) -> ApiError {
    ApiError::UnsupportedAsset {
        platform: platform.to_string(),
        asset_type: asset_type.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_aliases() {
        assert_eq!("facebook".parse::<Platform>().unwrap(), Platform::Meta);
        assert_eq!("X".parse::<Platform>().unwrap(), Platform::Twitter);
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn test_platform_serde_matches_display() {
        for platform in Platform::ALL {
            let json = serde_json::to_string(&platform).unwrap();
            assert_eq!(json, format!("\"{platform}\""));
        }
    }

    #[test]
    fn test_asset_type_parse() {
        assert_eq!("ad-accounts".parse::<AssetType>().unwrap(), AssetType::AdAccounts);
        assert_eq!("advertisers".parse::<AssetType>().unwrap(), AssetType::AdAccounts);
        assert_eq!(
            serde_json::to_string(&AssetType::YoutubeChannels).unwrap(),
            "\"youtube_channels\""
        );
    }
}
