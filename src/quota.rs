//! Per-org metered usage over daily and monthly windows, with percentage
//! alert levels.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::config::Config;
use crate::error::ApiError;
use crate::store::UsageWindow;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    PlatformApiCalls,
    AiTokens,
    ImageGenerations,
    VideoMinutes,
}

impl Resource {
    pub const ALL: [Resource; 4] = [
        Resource::PlatformApiCalls,
        Resource::AiTokens,
        Resource::ImageGenerations,
        Resource::VideoMinutes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::PlatformApiCalls => "platform_api_calls",
            Resource::AiTokens => "ai_tokens",
            Resource::ImageGenerations => "image_generations",
            Resource::VideoMinutes => "video_minutes",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Daily,
    Monthly,
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Daily => "daily",
            Window::Monthly => "monthly",
        }
    }

    /// First day of the window containing `now` (UTC).
    pub fn start(&self, now: DateTime<Utc>) -> NaiveDate {
        let today = now.date_naive();
        match self {
            Window::Daily => today,
            Window::Monthly => today.with_day(1).unwrap_or(today),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    None,
    Warning,
    Critical,
    Exceeded,
}

impl AlertLevel {
    pub const WARNING_PERCENT: f64 = 75.0;
    pub const CRITICAL_PERCENT: f64 = 90.0;

    pub fn from_percent(percent: f64) -> Self {
        if percent >= 100.0 {
            AlertLevel::Exceeded
        } else if percent >= Self::CRITICAL_PERCENT {
            AlertLevel::Critical
        } else if percent >= Self::WARNING_PERCENT {
            AlertLevel::Warning
        } else {
            AlertLevel::None
        }
    }
}

/// Daily and monthly caps for one resource. 0 means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    pub daily: i64,
    pub monthly: i64,
}

impl QuotaLimits {
    pub fn for_window(&self, window: Window) -> i64 {
        match window {
            Window::Daily => self.daily,
            Window::Monthly => self.monthly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub resource: Resource,
    pub window: Window,
    pub used: i64,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub percent_used: f64,
    pub alert: AlertLevel,
}

impl QuotaStatus {
    pub fn evaluate(resource: Resource, window: Window, used: i64, limit: i64) -> Self {
        if limit <= 0 {
            return Self {
                resource,
                window,
                used,
                limit: None,
                remaining: None,
                percent_used: 0.0,
                alert: AlertLevel::None,
            };
        }

        let percent_used = (used as f64 / limit as f64 * 1000.0).round() / 10.0;
        Self {
            resource,
            window,
            used,
            limit: Some(limit),
            remaining: Some((limit - used).max(0)),
            percent_used,
            alert: AlertLevel::from_percent(used as f64 / limit as f64 * 100.0),
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.alert == AlertLevel::Exceeded
    }
}

/// Configured limits per resource.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    limits: BTreeMap<Resource, QuotaLimits>,
}

impl QuotaPolicy {
    pub fn new(limits: BTreeMap<Resource, QuotaLimits>) -> Self {
        Self { limits }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut limits = BTreeMap::new();
        limits.insert(
            Resource::PlatformApiCalls,
            QuotaLimits {
                daily: config.quota_api_calls_daily,
                monthly: config.quota_api_calls_monthly,
            },
        );
        limits.insert(
            Resource::AiTokens,
            QuotaLimits {
                daily: config.quota_ai_tokens_daily,
                monthly: config.quota_ai_tokens_monthly,
            },
        );
        limits.insert(
            Resource::ImageGenerations,
            QuotaLimits {
                daily: config.quota_images_daily,
                monthly: config.quota_images_monthly,
            },
        );
        limits.insert(
            Resource::VideoMinutes,
            QuotaLimits {
                daily: config.quota_video_minutes_daily,
                monthly: config.quota_video_minutes_monthly,
            },
        );
        Self { limits }
    }

    pub fn limits(&self, resource: Resource) -> QuotaLimits {
        self.limits
            .get(&resource)
            .copied()
            .unwrap_or(QuotaLimits { daily: 0, monthly: 0 })
    }

    /// Evaluate both windows of a resource given their current usage.
    pub fn evaluate(&self, resource: Resource, daily_used: i64, monthly_used: i64) -> [QuotaStatus; 2] {
        let limits = self.limits(resource);
        [
            QuotaStatus::evaluate(resource, Window::Daily, daily_used, limits.daily),
            QuotaStatus::evaluate(resource, Window::Monthly, monthly_used, limits.monthly),
        ]
    }
}

/// Current daily and monthly status of one resource for an org.
pub async fn status(
    state: &AppState,
    org_id: &str,
    resource: Resource,
) -> Result<[QuotaStatus; 2], ApiError> {
    let now = Utc::now();
    let mut used = [0i64; 2];
    for (slot, window) in [Window::Daily, Window::Monthly].into_iter().enumerate() {
        used[slot] = state
            .store
            .get_usage(org_id, resource.as_str(), window.as_str(), window.start(now))
            .await?;
    }
    Ok(state.quota.evaluate(resource, used[0], used[1]))
}

/// Units taken from an org's daily and monthly windows by `consume`.
#[derive(Debug, Clone)]
pub struct Reservation {
    org_id: String,
    resource: Resource,
    amount: i64,
    windows: [UsageWindow; 2],
    pub status: [QuotaStatus; 2],
}

fn usage_windows(state: &AppState, resource: Resource, now: DateTime<Utc>) -> [UsageWindow; 2] {
    let limits = state.quota.limits(resource);
    [Window::Daily, Window::Monthly].map(|window| UsageWindow {
        kind: window.as_str(),
        start: window.start(now),
        limit: limits.for_window(window),
    })
}

/// Record `amount` units, or reject when a window is already exhausted.
///
/// Check and increment happen in one statement per window, so concurrent
/// callers are admitted one at a time.
pub async fn consume(
    state: &AppState,
    org_id: &str,
    resource: Resource,
    amount: i64,
) -> Result<Reservation, ApiError> {
    let windows = usage_windows(state, resource, Utc::now());
    let totals = state
        .store
        .reserve_usage(org_id, resource.as_str(), &windows, amount)
        .await?;

    let (daily, monthly) = match totals.as_deref() {
        Some(&[daily, monthly]) => (daily, monthly),
        Some(_) => return Err(ApiError::Internal("quota windows out of step".into())),
        None => {
            let current = status(state, org_id, resource).await?;
            let exhausted = current.iter().find(|s| s.is_exceeded());
            return Err(ApiError::QuotaExceeded(match exhausted {
                Some(s) => format!(
                    "{} ({} limit of {})",
                    resource,
                    s.window.as_str(),
                    s.limit.unwrap_or_default()
                ),
                None => resource.to_string(),
            }));
        }
    };

    let before = state.quota.evaluate(resource, daily - amount, monthly - amount);
    let updated = state.quota.evaluate(resource, daily, monthly);
    for s in &updated {
        if s.alert > AlertLevel::None && s.alert > alert_of(&before, s.window) {
            warn!(
                "Org {org_id} {} {} usage at {:.1}% ({:?})",
                resource,
                s.window.as_str(),
                s.percent_used,
                s.alert
            );
        }
    }

    Ok(Reservation {
        org_id: org_id.to_string(),
        resource,
        amount,
        windows,
        status: updated,
    })
}

/// Give back the units of a reservation whose work never happened.
pub async fn refund(state: &AppState, reservation: &Reservation) -> Result<(), ApiError> {
    state
        .store
        .release_usage(
            &reservation.org_id,
            reservation.resource.as_str(),
            &reservation.windows,
            reservation.amount,
        )
        .await
}

fn alert_of(statuses: &[QuotaStatus; 2], window: Window) -> AlertLevel {
    statuses
        .iter()
        .find(|s| s.window == window)
        .map(|s| s.alert)
        .unwrap_or(AlertLevel::None)
}
