//! Shared plumbing for vendor HTTP calls: transport errors, status checks,
//! and error-message extraction from the various vendor error envelopes.

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::traits::Platform;
use crate::error::ApiError;

/// Upper bound on pages followed for one asset listing.
pub const MAX_PAGES: usize = 20;

/// Percent-encoding for URL parameters.
pub fn urlencoding(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Send a request, mapping transport failures to a platform error.
pub async fn send(platform: Platform, req: RequestBuilder) -> Result<Response, ApiError> {
    req.send()
        .await
        .map_err(|e| ApiError::platform(platform.as_str(), format!("request failed: {e}")))
}

/// Check the status and decode the JSON body.
pub async fn read_json<T: DeserializeOwned>(
    platform: Platform,
    resp: Response,
) -> Result<T, ApiError> {
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ApiError::RateLimited(platform.to_string()));
    }

    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::platform(
            platform.as_str(),
            format!("HTTP {}: {}", status.as_u16(), vendor_message(&body)),
        ));
    }

    resp.json()
        .await
        .map_err(|e| ApiError::platform(platform.as_str(), format!("unexpected response: {e}")))
}

/// Send and decode in one step.
pub async fn get_json<T: DeserializeOwned>(
    platform: Platform,
    req: RequestBuilder,
) -> Result<T, ApiError> {
    let resp = send(platform, req).await?;
    read_json(platform, resp).await
}

/// Reclassify a failed refresh. Rejected grants mean the user must reconnect;
/// anything else is retryable.
pub fn refresh_error(platform: Platform, err: ApiError) -> ApiError {
    match err {
        ApiError::Platform { message, .. } => {
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("invalid_grant")
                || lowered.contains("revoked")
                || lowered.contains("expired")
                || lowered.contains("http 401")
            {
                ApiError::ReauthorizationRequired(format!("{platform}: {message}"))
            } else {
                ApiError::RefreshFailed(format!("{platform}: {message}"))
            }
        }
        other => other,
    }
}

/// Pull a human-readable message out of a vendor error body.
///
/// Understands `{"error": {"message"}}` (Meta, Google), OAuth's
/// `error_description`, `{"errors": [{"message"}]}` (Twitter), and flat
/// `message` / `debug_message` fields (TikTok, Snapchat).
pub fn vendor_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    if let Some(v) = parsed {
        let candidates = [
            v.pointer("/error/message"),
            v.get("error_description"),
            v.pointer("/errors/0/message"),
            v.get("debug_message"),
            v.get("message"),
            v.get("error"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(s) = candidate.as_str() {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".into()
    } else {
        trimmed.chars().take(500).collect()
    }
}

/// Read a string-or-number JSON field as a string.
pub fn str_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
