use anyhow::{Context, Result};
use std::str::FromStr;

use crate::platforms::Platform;

/// OAuth app credentials for one platform.
#[derive(Debug, Clone)]
pub struct AppCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Application configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,
    pub base_url: String,
    /// Web app URL for post-OAuth redirects
    pub dashboard_url: String,

    // ── Database ────────────────────────────────────────────────────────
    pub database_url: String,

    // ── Crypto ──────────────────────────────────────────────────────────
    /// 32-byte base64-encoded master key for AES-256-GCM token encryption.
    pub master_key: String,
    /// base64-encoded HMAC key for OAuth state signing.
    pub hmac_secret: String,

    // ── Service-to-service auth ─────────────────────────────────────────
    pub service_secret: String,

    // ── Asset cache / refresh ───────────────────────────────────────────
    pub asset_cache_ttl_secs: u64,
    pub asset_cache_max_entries: usize,
    pub refresh_interval_secs: u64,
    pub refresh_window_minutes: i64,

    // ── Quota defaults (0 = unlimited) ──────────────────────────────────
    pub quota_api_calls_daily: i64,
    pub quota_api_calls_monthly: i64,
    pub quota_ai_tokens_daily: i64,
    pub quota_ai_tokens_monthly: i64,
    pub quota_images_daily: i64,
    pub quota_images_monthly: i64,
    pub quota_video_minutes_daily: i64,
    pub quota_video_minutes_monthly: i64,

    // ── Platform OAuth apps ─────────────────────────────────────────────
    pub meta: Option<AppCredentials>,
    pub google: Option<AppCredentials>,
    pub google_developer_token: Option<String>,
    pub tiktok: Option<AppCredentials>,
    pub linkedin: Option<AppCredentials>,
    pub twitter: Option<AppCredentials>,
    pub snapchat: Option<AppCredentials>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("PORT", 8430)?,
            base_url: std::env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8430".into()),
            dashboard_url: std::env::var("DASHBOARD_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),

            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL is required (PostgreSQL connection string)")?,
            master_key: std::env::var("MASTER_KEY")
                .context("MASTER_KEY is required (32 bytes, base64)")?,
            hmac_secret: std::env::var("HMAC_SECRET")
                .context("HMAC_SECRET is required (base64)")?,
            service_secret: std::env::var("SERVICE_SECRET")
                .context("SERVICE_SECRET is required for service-to-service auth")?,

            asset_cache_ttl_secs: env_parse("ASSET_CACHE_TTL_SECS", 15 * 60)?,
            asset_cache_max_entries: env_parse("ASSET_CACHE_MAX_ENTRIES", 10_000)?,
            refresh_interval_secs: env_parse("REFRESH_INTERVAL_SECS", 5 * 60)?,
            refresh_window_minutes: env_parse("REFRESH_WINDOW_MINUTES", 10)?,

            quota_api_calls_daily: env_parse("QUOTA_PLATFORM_API_CALLS_DAILY", 5_000)?,
            quota_api_calls_monthly: env_parse("QUOTA_PLATFORM_API_CALLS_MONTHLY", 100_000)?,
            quota_ai_tokens_daily: env_parse("QUOTA_AI_TOKENS_DAILY", 0)?,
            quota_ai_tokens_monthly: env_parse("QUOTA_AI_TOKENS_MONTHLY", 0)?,
            quota_images_daily: env_parse("QUOTA_IMAGE_GENERATIONS_DAILY", 0)?,
            quota_images_monthly: env_parse("QUOTA_IMAGE_GENERATIONS_MONTHLY", 0)?,
            quota_video_minutes_daily: env_parse("QUOTA_VIDEO_MINUTES_DAILY", 0)?,
            quota_video_minutes_monthly: env_parse("QUOTA_VIDEO_MINUTES_MONTHLY", 0)?,

            meta: app_credentials("META"),
            google: app_credentials("GOOGLE"),
            google_developer_token: std::env::var("GOOGLE_DEVELOPER_TOKEN").ok(),
            tiktok: app_credentials("TIKTOK"),
            linkedin: app_credentials("LINKEDIN"),
            twitter: app_credentials("TWITTER"),
            snapchat: app_credentials("SNAPCHAT"),
        })
    }

    /// Get the OAuth callback URL for a specific platform.
    pub fn callback_url(&self, platform: Platform) -> String {
        format!("{}/v1/connections/callback/{}", self.base_url, platform)
    }

    /// OAuth app credentials for a platform, if configured.
    pub fn credentials(&self, platform: Platform) -> Option<&AppCredentials> {
        match platform {
            Platform::Meta => self.meta.as_ref(),
            Platform::Google => self.google.as_ref(),
            Platform::TikTok => self.tiktok.as_ref(),
            Platform::LinkedIn => self.linkedin.as_ref(),
            Platform::Twitter => self.twitter.as_ref(),
            Platform::Snapchat => self.snapchat.as_ref(),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("Invalid {key}")),
        Err(_) => Ok(default),
    }
}

fn app_credentials(prefix: &str) -> Option<AppCredentials> {
    let client_id = std::env::var(format!("{prefix}_CLIENT_ID")).ok()?;
    let client_secret = std::env::var(format!("{prefix}_CLIENT_SECRET")).ok()?;
    Some(AppCredentials {
        client_id,
        client_secret,
    })
}

#[cfg(test)]
impl Config {
    /// Config with no platform apps and small cache bounds, for tests.
    pub fn for_tests() -> Self {
        Config {
            host: "127.0.0.1".into(),
            port: 0,
            base_url: "http://localhost:8430".into(),
            dashboard_url: "http://localhost:3000".into(),
            database_url: "postgres://localhost/cmis_test".into(),
            master_key: String::new(),
            hmac_secret: String::new(),
            service_secret: "test-secret".into(),
            asset_cache_ttl_secs: 60,
            asset_cache_max_entries: 100,
            refresh_interval_secs: 300,
            refresh_window_minutes: 10,
            quota_api_calls_daily: 5_000,
            quota_api_calls_monthly: 100_000,
            quota_ai_tokens_daily: 0,
            quota_ai_tokens_monthly: 0,
            quota_images_daily: 0,
            quota_images_monthly: 0,
            quota_video_minutes_daily: 0,
            quota_video_minutes_monthly: 0,
            meta: None,
            google: None,
            google_developer_token: None,
            tiktok: None,
            linkedin: None,
            twitter: None,
            snapchat: None,
        }
    }
}
