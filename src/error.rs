use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Unified error type for the cmis-sync service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // ── Caller Errors ───────────────────────────────────────────────────
    #[error("Authentication required")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid state parameter")]
    InvalidState,

    // ── Platform Errors ─────────────────────────────────────────────────
    #[error("Platform {0} is not configured")]
    PlatformNotConfigured(String),

    #[error("{platform} does not expose {asset_type} assets")]
    UnsupportedAsset { platform: String, asset_type: String },

    #[error("{platform} API error: {message}")]
    Platform {
        platform: String,
        message: String,
        hint: Option<&'static str>,
    },

    #[error("{0} rate limit reached, retry later")]
    RateLimited(String),

    #[error("Connection must be re-authorized: {0}")]
    ReauthorizationRequired(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Quota exceeded for {0}")]
    QuotaExceeded(String),

    // ── Internal ────────────────────────────────────────────────────────
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Build a platform error, attaching a troubleshooting hint when the
    /// vendor message matches a known failure.
    pub fn platform(platform: impl Into<String>, message: impl Into<String>) -> Self {
        let platform = platform.into();
        let message = message.into();
        let hint = crate::assets::troubleshoot(&message);
        ApiError::Platform {
            platform,
            message,
            hint,
        }
    }

    /// Stable machine-readable code, also used in audit metadata.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::InvalidState => "invalid_state",
            ApiError::PlatformNotConfigured(_) => "platform_not_configured",
            ApiError::UnsupportedAsset { .. } => "unsupported_asset",
            ApiError::Platform { .. } => "platform_error",
            ApiError::RateLimited(_) => "rate_limited",
            ApiError::ReauthorizationRequired(_) => "reauthorization_required",
            ApiError::RefreshFailed(_) => "refresh_failed",
            ApiError::QuotaExceeded(_) => "quota_exceeded",
            ApiError::Crypto(_) => "crypto_error",
            ApiError::Database(_) => "database_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) | ApiError::InvalidState => StatusCode::BAD_REQUEST,
            ApiError::PlatformNotConfigured(_) => StatusCode::NOT_FOUND,
            ApiError::UnsupportedAsset { .. } => StatusCode::BAD_REQUEST,
            ApiError::Platform { .. } | ApiError::RefreshFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::RateLimited(_) | ApiError::QuotaExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::ReauthorizationRequired(_) => StatusCode::UNAUTHORIZED,
            ApiError::Crypto(_) | ApiError::Database(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("Database error: {e}");
        ApiError::Database(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let ApiError::Platform {
            hint: Some(hint), ..
        } = &self
        {
            error["hint"] = json!(hint);
        }

        (self.status(), axum::Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_attaches_hint() {
        let err = ApiError::platform("meta", "Error validating access token: Session has expired");
        match err {
            ApiError::Platform { hint, .. } => assert!(hint.is_some()),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::QuotaExceeded("x".into()).status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::ReauthorizationRequired("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::platform("google", "boom").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ApiError::InvalidState.code(), "invalid_state");
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let response = ApiError::NotFound("Connection".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "not_found");
        assert_eq!(value["error"]["message"], "Connection not found");
        assert!(value["error"].get("hint").is_none());
    }
}
