//! PostgreSQL-backed store for platform connections, sync audit events and
//! quota usage.
//!
//! Tables:
//! - `platform_connections`: encrypted OAuth tokens per (org_id, platform, account_id)
//! - `sync_events`: audit log for connect / refresh / sync operations
//! - `quota_usage`: per-org usage counters per resource and window

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::error::ApiError;
use crate::platforms::Platform;

/// Consecutive refresh failures after which a connection is parked.
pub const MAX_REFRESH_FAILURES: i32 = 3;

/// Status of a connection whose grant the platform revoked.
pub const REAUTHORIZATION_REQUIRED: &str = "reauthorization_required";

/// Connection store backed by PostgreSQL.
pub struct ConnectionStore {
    pool: PgPool,
}

impl ConnectionStore {
    pub async fn new(db_url: &str) -> Result<Self, ApiError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .connect(db_url)
            .await
            .map_err(|e| ApiError::Database(format!("Failed to connect to PostgreSQL: {e}")))?;

        Ok(Self { pool })
    }

    /// Build a store whose pool connects on first use.
    pub fn lazy(db_url: &str) -> Result<Self, ApiError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .connect_lazy(db_url)
            .map_err(|e| ApiError::Database(format!("Invalid DATABASE_URL: {e}")))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS platform_connections (
                id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                org_id          TEXT NOT NULL,
                platform        TEXT NOT NULL,
                account_id      TEXT NOT NULL,
                account_name    TEXT NOT NULL DEFAULT '',
                access_token    TEXT NOT NULL,
                refresh_token   TEXT,
                token_type      TEXT NOT NULL DEFAULT 'Bearer',
                scopes          TEXT NOT NULL DEFAULT '',
                expires_at      TIMESTAMPTZ,
                status          TEXT NOT NULL DEFAULT 'active',
                failure_count   INT NOT NULL DEFAULT 0,
                last_synced_at  TIMESTAMPTZ,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE(org_id, platform, account_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_events (
                id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                org_id          TEXT NOT NULL,
                connection_id   UUID,
                event_type      TEXT NOT NULL,
                platform        TEXT NOT NULL DEFAULT '',
                metadata        JSONB NOT NULL DEFAULT '{}',
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_usage (
                org_id          TEXT NOT NULL,
                resource        TEXT NOT NULL,
                window_kind     TEXT NOT NULL,
                window_start    DATE NOT NULL,
                used            BIGINT NOT NULL DEFAULT 0,
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (org_id, resource, window_kind, window_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_platform_connections_org ON platform_connections(org_id, platform)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_platform_connections_expiry ON platform_connections(expires_at) WHERE failure_count < 3",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_events_org ON sync_events(org_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Upsert a connection (stores encrypted tokens). Reconnecting the same
    /// account resets its failure state.
    pub async fn upsert_connection(
        &self,
        cipher: &TokenCipher,
        conn: &ConnectionUpsert,
    ) -> Result<Uuid, ApiError> {
        let enc_access = cipher.encrypt(&conn.access_token)?;
        let enc_refresh = cipher.encrypt_opt(conn.refresh_token.as_deref())?;

        let row = sqlx::query(
            r#"
            INSERT INTO platform_connections
                (org_id, platform, account_id, account_name, access_token, refresh_token,
                 token_type, scopes, expires_at, status, failure_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'active', 0)
            ON CONFLICT (org_id, platform, account_id)
            DO UPDATE SET
                account_name = EXCLUDED.account_name,
                access_token = EXCLUDED.access_token,
                refresh_token = COALESCE(EXCLUDED.refresh_token, platform_connections.refresh_token),
                token_type = EXCLUDED.token_type,
                scopes = EXCLUDED.scopes,
                expires_at = EXCLUDED.expires_at,
                status = 'active',
                failure_count = 0,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&conn.org_id)
        .bind(conn.platform.as_str())
        .bind(&conn.account_id)
        .bind(&conn.account_name)
        .bind(&enc_access)
        .bind(&enc_refresh)
        .bind(&conn.token_type)
        .bind(&conn.scopes)
        .bind(conn.expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get(0))
    }

    /// Get a connection with decrypted tokens. Connections of other orgs are not found.
    pub async fn get_connection(
        &self,
        cipher: &TokenCipher,
        org_id: &str,
        connection_id: Uuid,
    ) -> Result<Connection, ApiError> {
        let row = sqlx::query(
            r#"
            SELECT id, org_id, platform, account_id, account_name, access_token,
                   refresh_token, expires_at, status, failure_count
            FROM platform_connections
            WHERE id = $1 AND org_id = $2
            "#,
        )
        .bind(connection_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("connection".into()))?;

        let enc_access: String = row.get(5);
        let enc_refresh: Option<String> = row.get(6);

        let refresh_token = match enc_refresh {
            Some(ref rt) if !rt.is_empty() => Some(cipher.decrypt(rt)?),
            _ => None,
        };

        Ok(Connection {
            id: row.get(0),
            org_id: row.get(1),
            platform: platform_column(&row, 2)?,
            account_id: row.get(3),
            account_name: row.get(4),
            access_token: cipher.decrypt(&enc_access)?,
            refresh_token,
            expires_at: row.get(7),
            status: row.get(8),
            failure_count: row.get(9),
        })
    }

    /// List an org's connections (metadata only, never tokens).
    pub async fn list_connections(
        &self,
        org_id: &str,
        platform: Option<Platform>,
    ) -> Result<Vec<ConnectionInfo>, ApiError> {
        let rows = sqlx::query(
            r#"
            SELECT id, platform, account_id, account_name, scopes, expires_at,
                   status, failure_count, last_synced_at, created_at, updated_at
            FROM platform_connections
            WHERE org_id = $1 AND ($2::text IS NULL OR platform = $2)
            ORDER BY platform, account_name
            "#,
        )
        .bind(org_id)
        .bind(platform.map(|p| p.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ConnectionInfo {
                    id: row.get(0),
                    platform: platform_column(row, 1)?,
                    account_id: row.get(2),
                    account_name: row.get(3),
                    scopes: row.get(4),
                    expires_at: row.get(5),
                    status: row.get(6),
                    failure_count: row.get(7),
                    last_synced_at: row.get(8),
                    created_at: row.get(9),
                    updated_at: row.get(10),
                })
            })
            .collect()
    }

    /// Delete a connection.
    pub async fn delete_connection(&self, org_id: &str, connection_id: Uuid) -> Result<(), ApiError> {
        let affected = sqlx::query("DELETE FROM platform_connections WHERE id = $1 AND org_id = $2")
            .bind(connection_id)
            .bind(org_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected == 0 {
            return Err(ApiError::NotFound("connection".into()));
        }

        Ok(())
    }

    /// Connections expiring soon that still have a refresh token (for the refresh daemon).
    /// Revoked grants are skipped until the account is reconnected.
    pub async fn get_expiring_connections(
        &self,
        within_minutes: i64,
    ) -> Result<Vec<ExpiringConnection>, ApiError> {
        let rows = sqlx::query(
            r#"
            SELECT id, org_id, platform
            FROM platform_connections
            WHERE expires_at < NOW() + make_interval(mins => $1::int)
              AND failure_count < $2
              AND refresh_token IS NOT NULL
              AND status <> $3
            "#,
        )
        .bind(within_minutes as i32)
        .bind(MAX_REFRESH_FAILURES)
        .bind(REAUTHORIZATION_REQUIRED)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ExpiringConnection {
                    id: row.get(0),
                    org_id: row.get(1),
                    platform: platform_column(row, 2)?,
                })
            })
            .collect()
    }

    /// Update a connection's tokens after a refresh.
    pub async fn update_refreshed_tokens(
        &self,
        cipher: &TokenCipher,
        connection_id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        let enc_access = cipher.encrypt(access_token)?;
        let enc_refresh = cipher.encrypt_opt(refresh_token)?;

        sqlx::query(
            r#"
            UPDATE platform_connections
            SET access_token = $1,
                refresh_token = COALESCE($2, refresh_token),
                expires_at = $3,
                status = 'active',
                failure_count = 0,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(&enc_access)
        .bind(&enc_refresh)
        .bind(expires_at)
        .bind(connection_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Count a failed refresh. The connection is flagged `error` once it hits the limit.
    pub async fn increment_failure(&self, connection_id: Uuid) -> Result<i32, ApiError> {
        let row = sqlx::query(
            r#"
            UPDATE platform_connections
            SET failure_count = failure_count + 1,
                status = CASE WHEN failure_count + 1 >= $2 THEN 'error' ELSE status END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING failure_count
            "#,
        )
        .bind(connection_id)
        .bind(MAX_REFRESH_FAILURES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get(0)).unwrap_or(0))
    }

    /// Flag a connection whose grant was revoked on the platform side.
    pub async fn mark_reauthorization_required(&self, connection_id: Uuid) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE platform_connections SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(connection_id)
        .bind(REAUTHORIZATION_REQUIRED)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a successful asset sync.
    pub async fn mark_synced(&self, connection_id: Uuid) -> Result<(), ApiError> {
        sqlx::query("UPDATE platform_connections SET last_synced_at = NOW() WHERE id = $1")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Log an audit event.
    pub async fn log_event(
        &self,
        org_id: &str,
        connection_id: Option<Uuid>,
        event_type: &str,
        platform: Platform,
        metadata: serde_json::Value,
    ) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO sync_events (org_id, connection_id, event_type, platform, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(org_id)
        .bind(connection_id)
        .bind(event_type)
        .bind(platform.as_str())
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Quota usage
    // =========================================================================

    /// Add `amount` to every window in one transaction unless one of them is
    /// already at its limit. Returns the new totals in window order, or `None`
    /// when a window was full and nothing was recorded.
    ///
    /// The conditional upsert row-locks each window, so concurrent callers
    /// cannot overshoot a limit. Windows are always locked in the same order.
    pub async fn reserve_usage(
        &self,
        org_id: &str,
        resource: &str,
        windows: &[UsageWindow],
        amount: i64,
    ) -> Result<Option<Vec<i64>>, ApiError> {
        let mut tx = self.pool.begin().await?;
        let mut totals = Vec::with_capacity(windows.len());

        for window in windows {
            let row = sqlx::query(
                r#"
                INSERT INTO quota_usage (org_id, resource, window_kind, window_start, used)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (org_id, resource, window_kind, window_start)
                DO UPDATE SET used = quota_usage.used + EXCLUDED.used, updated_at = NOW()
                WHERE $6::bigint <= 0 OR quota_usage.used < $6::bigint
                RETURNING used
                "#,
            )
            .bind(org_id)
            .bind(resource)
            .bind(window.kind)
            .bind(window.start)
            .bind(amount)
            .bind(window.limit)
            .fetch_optional(&mut *tx)
            .await?;

            match row {
                Some(row) => totals.push(row.get(0)),
                None => {
                    tx.rollback().await?;
                    return Ok(None);
                }
            }
        }

        tx.commit().await?;
        Ok(Some(totals))
    }

    /// Take `amount` back out of previously reserved windows.
    pub async fn release_usage(
        &self,
        org_id: &str,
        resource: &str,
        windows: &[UsageWindow],
        amount: i64,
    ) -> Result<(), ApiError> {
        for window in windows {
            sqlx::query(
                r#"
                UPDATE quota_usage
                SET used = GREATEST(used - $5, 0), updated_at = NOW()
                WHERE org_id = $1 AND resource = $2 AND window_kind = $3 AND window_start = $4
                "#,
            )
            .bind(org_id)
            .bind(resource)
            .bind(window.kind)
            .bind(window.start)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Usage recorded in one window (0 when nothing was recorded).
    pub async fn get_usage(
        &self,
        org_id: &str,
        resource: &str,
        window_kind: &str,
        window_start: NaiveDate,
    ) -> Result<i64, ApiError> {
        let row = sqlx::query(
            r#"
            SELECT used FROM quota_usage
            WHERE org_id = $1 AND resource = $2 AND window_kind = $3 AND window_start = $4
            "#,
        )
        .bind(org_id)
        .bind(resource)
        .bind(window_kind)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get(0)).unwrap_or(0))
    }
}

fn platform_column(row: &PgRow, idx: usize) -> Result<Platform, ApiError> {
    let raw: String = row.get(idx);
    raw.parse()
        .map_err(|_| ApiError::Database(format!("unknown platform '{raw}' in platform_connections")))
}

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ConnectionUpsert {
    pub org_id: String,
    pub platform: Platform,
    pub account_id: String,
    pub account_name: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scopes: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A connection with decrypted tokens. Never serialized.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub org_id: String,
    pub platform: Platform,
    pub account_id: String,
    pub account_name: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: String,
    pub failure_count: i32,
}

#[derive(Debug, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub platform: Platform,
    pub account_id: String,
    pub account_name: String,
    pub scopes: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: String,
    pub failure_count: i32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One metering window of a resource and its cap (0 = unlimited).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindow {
    pub kind: &'static str,
    pub start: NaiveDate,
    pub limit: i64,
}

#[derive(Debug)]
pub struct ExpiringConnection {
    pub id: Uuid,
    pub org_id: String,
    pub platform: Platform,
}
