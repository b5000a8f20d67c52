//! Maps vendor error messages to operator-facing hints.

struct Rule {
    needles: &'static [&'static str],
    hint: &'static str,
}

// First match wins.
const RULES: &[Rule] = &[
    Rule {
        needles: &["developer_token", "developer token", "developer-token"],
        hint: "Google Ads calls need an approved developer token. Set GOOGLE_DEVELOPER_TOKEN.",
    },
    Rule {
        needles: &[
            "session has expired",
            "error validating access token",
            "invalid oauth access token",
            "expired or revoked",
            "access token is invalid",
            "access token has expired",
            "invalid_grant",
            "invalid_token",
            "code 40104",
            "code 40105",
        ],
        hint: "The platform token is no longer valid. Reconnect the account to grant a fresh token.",
    },
    Rule {
        needles: &[
            "rate limit",
            "too many",
            "request limit",
            "(#4)",
            "(#17)",
            "(#80004)",
            "code 40100",
        ],
        hint: "The platform is throttling requests. Wait a few minutes before refreshing; cached assets remain available.",
    },
    Rule {
        needles: &[
            "permission",
            "scope",
            "not authorized",
            "insufficient",
            "(#200)",
            "(#10)",
            "http 403",
        ],
        hint: "The connected user lacks a required permission. Reconnect and approve every requested scope, or ask an ad account admin to grant access.",
    },
    Rule {
        needles: &["account is disabled", "account disabled", "suspended", "has been closed"],
        hint: "The ad account is disabled or closed on the platform. Resolve its status in the platform's business settings.",
    },
    Rule {
        needles: &["request failed", "timed out", "connection refused", "dns error"],
        hint: "The platform API could not be reached. Check outbound network access and retry.",
    },
];

/// Hint for a vendor error message, if it matches a known failure.
pub fn troubleshoot(message: &str) -> Option<&'static str> {
    let lowered = message.to_lowercase();
    RULES
        .iter()
        .find(|rule| rule.needles.iter().any(|n| lowered.contains(n)))
        .map(|rule| rule.hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_meta_token() {
        let hint = troubleshoot(
            "HTTP 400: Error validating access token: Session has expired on Tuesday",
        )
        .unwrap();
        assert!(hint.contains("Reconnect"));
    }

    #[test]
    fn test_rate_limit_before_permission() {
        let hint = troubleshoot("(#17) User request limit reached").unwrap();
        assert!(hint.contains("throttling"));
    }

    #[test]
    fn test_missing_permission() {
        let hint = troubleshoot("(#200) Requires ads_management permission").unwrap();
        assert!(hint.contains("permission"));
    }

    #[test]
    fn test_tiktok_codes() {
        assert!(troubleshoot("code 40105: Access token is incorrect or has been revoked.")
            .unwrap()
            .contains("Reconnect"));
        assert!(troubleshoot("code 40100: Too many requests").unwrap().contains("throttling"));
    }

    #[test]
    fn test_unknown_message() {
        assert_eq!(troubleshoot("Unexpected internal error"), None);
    }
}
