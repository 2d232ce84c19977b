//! Postgres-backed session ledger.
//!
//! Assumes a `refresh_tokens` table owned by the embedding service's
//! migrations: `token_id uuid primary key, user_id bigint, token_hash text
//! unique, device_name/device_type/ip/user_agent text, location text null,
//! issued_at/expires_at timestamptz, revoked boolean default false,
//! revoked_at timestamptz null, revoked_reason text null, last_used_at
//! timestamptz null`.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{DeviceInfo, NewRefreshToken, RefreshTokenRecord, RevocationReason, SessionLedger};
use crate::error::AuthError;

pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> RefreshTokenRecord {
    let reason: Option<String> = row.get("revoked_reason");
    RefreshTokenRecord {
        token_id: row.get("token_id"),
        user_id: row.get("user_id"),
        token_hash: row.get("token_hash"),
        device: DeviceInfo {
            device_name: row.get("device_name"),
            device_type: row.get("device_type"),
            ip: row.get("ip"),
            location: row.get("location"),
            user_agent: row.get("user_agent"),
        },
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        revoked: row.get("revoked"),
        revoked_at: row.get("revoked_at"),
        revoked_reason: reason.and_then(|value| value.parse().ok()),
        last_used_at: row.get("last_used_at"),
    }
}

const RECORD_COLUMNS: &str = r"
    token_id, user_id, token_hash, device_name, device_type, ip, location,
    user_agent, issued_at, expires_at, revoked, revoked_at, revoked_reason,
    last_used_at
";

#[async_trait]
impl SessionLedger for PostgresLedger {
    async fn insert(&self, token: NewRefreshToken) -> Result<(), AuthError> {
        let query = r"
            INSERT INTO refresh_tokens
                (token_id, user_id, token_hash, device_name, device_type,
                 ip, location, user_agent, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token.token_id)
            .bind(token.user_id)
            .bind(&token.token_hash)
            .bind(&token.device.device_name)
            .bind(&token.device.device_type)
            .bind(&token.device.ip)
            .bind(&token.device.location)
            .bind(&token.device.user_agent)
            .bind(token.issued_at)
            .bind(token.expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, AuthError> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM refresh_tokens WHERE token_hash = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        Ok(row.as_ref().map(record_from_row))
    }

    async fn find_by_id(
        &self,
        user_id: i64,
        token_id: Uuid,
    ) -> Result<Option<RefreshTokenRecord>, AuthError> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM refresh_tokens WHERE user_id = $1 AND token_id = $2"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        Ok(row.as_ref().map(record_from_row))
    }

    async fn mark_revoked(
        &self,
        token_id: Uuid,
        reason: RevocationReason,
    ) -> Result<(), AuthError> {
        // `revoked = FALSE` guard keeps the transition one-way; the first
        // reason recorded wins.
        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = NOW(), revoked_reason = $2
            WHERE token_id = $1
              AND revoked = FALSE
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_id)
            .bind(reason.as_str())
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn revoke_all_active(
        &self,
        user_id: i64,
        reason: RevocationReason,
    ) -> Result<Vec<RefreshTokenRecord>, AuthError> {
        let query = format!(
            r"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = NOW(), revoked_reason = $2
            WHERE user_id = $1
              AND revoked = FALSE
            RETURNING {RECORD_COLUMNS}
            "
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(reason.as_str())
            .fetch_all(&self.pool)
            .instrument(span)
            .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn touch_last_used(&self, token_id: Uuid) -> Result<(), AuthError> {
        let query = "UPDATE refresh_tokens SET last_used_at = NOW() WHERE token_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_id)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn list_active(&self, user_id: i64) -> Result<Vec<RefreshTokenRecord>, AuthError> {
        let query = format!(
            r"
            SELECT {RECORD_COLUMNS}
            FROM refresh_tokens
            WHERE user_id = $1
              AND revoked = FALSE
              AND expires_at > NOW()
            ORDER BY COALESCE(last_used_at, issued_at) DESC
            "
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn has_active_for_device(
        &self,
        user_id: i64,
        device_name: &str,
    ) -> Result<bool, AuthError> {
        let query = r"
            SELECT 1 AS present
            FROM refresh_tokens
            WHERE user_id = $1
              AND device_name = $2
              AND revoked = FALSE
              AND expires_at > NOW()
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(device_name)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        Ok(row.is_some())
    }
}

// Query-shape checks live here; end-to-end coverage runs against
// MemoryLedger, and the Postgres path is exercised by the embedding
// service's integration environment.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_columns_cover_every_field() {
        for column in [
            "token_id",
            "user_id",
            "token_hash",
            "device_name",
            "device_type",
            "ip",
            "location",
            "user_agent",
            "issued_at",
            "expires_at",
            "revoked",
            "revoked_at",
            "revoked_reason",
            "last_used_at",
        ] {
            assert!(RECORD_COLUMNS.contains(column), "missing column {column}");
        }
    }
}
