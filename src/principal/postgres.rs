//! Postgres-backed principal repo.
//!
//! Assumes a `principals` table owned by the embedding service's
//! migrations: `id bigserial primary key, full_name/email/date_of_birth/
//! address text (EncryptedValue wire format), email_hash text unique,
//! pin_hash text null, token_version bigint default 0, lock_until
//! timestamptz null, created_at timestamptz default now()`.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use tracing::Instrument;

use super::{NewPrincipal, PiiUpdate, PrincipalRecord, PrincipalRepo};
use crate::error::{is_unique_violation, AuthError};
use crate::keyring::{EncryptedValue, LookupHash};

pub struct PostgresPrincipalRepo {
    pool: PgPool,
}

impl PostgresPrincipalRepo {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Parse a stored EncryptedValue column, failing loudly on a row that no
/// longer round-trips. The error names the row and column only.
fn encrypted_column(
    row: &sqlx::postgres::PgRow,
    id: i64,
    column: &str,
) -> Result<EncryptedValue, AuthError> {
    let raw: String = row.get(column);
    raw.parse().map_err(|_| AuthError::CorruptedRecord {
        record: format!("principal:{id}:{column}"),
    })
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<PrincipalRecord, AuthError> {
    let id: i64 = row.get("id");
    Ok(PrincipalRecord {
        id,
        full_name: encrypted_column(row, id, "full_name")?,
        email: encrypted_column(row, id, "email")?,
        email_hash: LookupHash::from_stored(row.get("email_hash")),
        date_of_birth: encrypted_column(row, id, "date_of_birth")?,
        address: encrypted_column(row, id, "address")?,
        pin_hash: row.get("pin_hash"),
        token_version: row.get("token_version"),
        lock_until: row.get("lock_until"),
        created_at: row.get("created_at"),
    })
}

const RECORD_COLUMNS: &str = r"
    id, full_name, email, email_hash, date_of_birth, address, pin_hash,
    token_version, lock_until, created_at
";

#[async_trait]
impl PrincipalRepo for PostgresPrincipalRepo {
    async fn insert(&self, principal: NewPrincipal) -> Result<PrincipalRecord, AuthError> {
        let query = format!(
            r"
            INSERT INTO principals
                (full_name, email, email_hash, date_of_birth, address)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {RECORD_COLUMNS}
            "
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(principal.full_name.to_string())
            .bind(principal.email.to_string())
            .bind(principal.email_hash.as_str())
            .bind(principal.date_of_birth.to_string())
            .bind(principal.address.to_string())
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    AuthError::Conflict("email already registered".to_string())
                } else {
                    AuthError::from(err)
                }
            })?;
        record_from_row(&row)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<PrincipalRecord>, AuthError> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM principals WHERE id = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_email_hash(
        &self,
        email_hash: &LookupHash,
    ) -> Result<Option<PrincipalRecord>, AuthError> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM principals WHERE email_hash = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(email_hash.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn exists_by_email_hash(&self, email_hash: &LookupHash) -> Result<bool, AuthError> {
        // Hash-index probe only; the encrypted columns are never read.
        let query = "SELECT 1 AS present FROM principals WHERE email_hash = $1 LIMIT 1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email_hash.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        Ok(row.is_some())
    }

    async fn update_pii(&self, id: i64, update: PiiUpdate) -> Result<(), AuthError> {
        let query = r"
            UPDATE principals
            SET full_name = $2, email = $3, email_hash = $4,
                date_of_birth = $5, address = $6
            WHERE id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .bind(update.full_name.to_string())
            .bind(update.email.to_string())
            .bind(update.email_hash.as_str())
            .bind(update.date_of_birth.to_string())
            .bind(update.address.to_string())
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    AuthError::Conflict("email already registered".to_string())
                } else {
                    AuthError::from(err)
                }
            })?;
        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    async fn set_pin_hash(&self, id: i64, pin_hash: String) -> Result<(), AuthError> {
        let query = "UPDATE principals SET pin_hash = $2 WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .bind(pin_hash)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    async fn set_lock(
        &self,
        id: i64,
        lock_until: Option<OffsetDateTime>,
    ) -> Result<(), AuthError> {
        let query = "UPDATE principals SET lock_until = $2 WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .bind(lock_until)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    async fn bump_token_version(&self, id: i64) -> Result<i64, AuthError> {
        let query = r"
            UPDATE principals
            SET token_version = token_version + 1
            WHERE id = $1
            RETURNING token_version
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        let row = row.ok_or(AuthError::NotFound)?;
        Ok(row.get("token_version"))
    }

    async fn token_version(&self, id: i64) -> Result<Option<i64>, AuthError> {
        let query = "SELECT token_version FROM principals WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        Ok(row.map(|row| row.get("token_version")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_columns_cover_every_field() {
        for column in [
            "id",
            "full_name",
            "email",
            "email_hash",
            "date_of_birth",
            "address",
            "pin_hash",
            "token_version",
            "lock_until",
            "created_at",
        ] {
            assert!(RECORD_COLUMNS.contains(column), "missing column {column}");
        }
    }
}
