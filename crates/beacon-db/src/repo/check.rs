//! Check ledger.

use async_trait::async_trait;
use beacon_core::check::{CHECK_SCHEMA, Check, CheckMetadata, CheckStatus, Plan};
use beacon_core::{CheckId, ScopeId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;

use crate::{DbError, DbResult};

/// Fields of a check about to be created.
#[derive(Debug, Clone)]
pub struct NewCheck {
    pub scope_id: ScopeId,
    pub manually_triggered: bool,
    pub plan: Plan,
    pub metadata: CheckMetadata,
}

#[async_trait]
pub trait CheckRepo: Send + Sync {
    /// Insert a `started` check unless the scope already has one.
    /// `Ok(None)` means another in-flight check won.
    async fn create_check(&self, new: NewCheck) -> DbResult<Option<Check>>;

    async fn get_check(&self, id: CheckId) -> DbResult<Option<Check>>;

    async fn started_checks(&self) -> DbResult<Vec<Check>>;

    /// Claim one started check for `claimer` that is unclaimed or whose
    /// previous claim has lapsed. The claim holds for `lease`.
    async fn claim_started_check(
        &self,
        claimer: &str,
        lease: Duration,
    ) -> DbResult<Option<Check>>;

    /// Extend a claim `claimer` still holds to `lease` from now. `false`
    /// means the claim lapsed and passed on, or the check already finished.
    async fn renew_claim(&self, id: CheckId, claimer: &str, lease: Duration) -> DbResult<bool>;

    /// Move a started check to a terminal status and stamp the checked rows.
    async fn finish_check(
        &self,
        id: CheckId,
        status: CheckStatus,
        error: Option<&str>,
    ) -> DbResult<Check>;
}

/// A check row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckRecord {
    pub id: uuid::Uuid,
    pub resource_config_scope_id: uuid::Uuid,
    pub status: String,
    pub schema: String,
    pub plan: serde_json::Value,
    pub manually_triggered: bool,
    pub metadata: Option<serde_json::Value>,
    pub check_error: Option<String>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TryFrom<CheckRecord> for Check {
    type Error = DbError;

    fn try_from(row: CheckRecord) -> DbResult<Check> {
        let status = row
            .status
            .parse()
            .map_err(|_| DbError::Corrupt(format!("check {} status '{}'", row.id, row.status)))?;

        // Older rows may predate denormalized metadata.
        let metadata = match row.metadata {
            Some(value) if !value.is_null() => serde_json::from_value(value)?,
            _ => CheckMetadata::default(),
        };

        Ok(Check {
            id: CheckId::from_uuid(row.id),
            scope_id: ScopeId::from_uuid(row.resource_config_scope_id),
            status,
            schema: row.schema,
            plan: serde_json::from_value(row.plan)?,
            manually_triggered: row.manually_triggered,
            create_time: row.create_time,
            start_time: row.start_time,
            end_time: row.end_time,
            check_error: row.check_error,
            metadata,
        })
    }
}

const CHECK_COLUMNS: &str = "id, resource_config_scope_id, status, schema, plan, \
     manually_triggered, metadata, check_error, create_time, start_time, end_time";

/// PostgreSQL implementation of CheckRepo.
pub struct PgCheckRepo {
    pool: PgPool,
}

impl PgCheckRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckRepo for PgCheckRepo {
    async fn create_check(&self, new: NewCheck) -> DbResult<Option<Check>> {
        let row = sqlx::query_as::<_, CheckRecord>(&format!(
            r#"
            INSERT INTO checks (id, resource_config_scope_id, status, schema, plan,
                                manually_triggered, metadata, create_time)
            VALUES ($1, $2, 'started', $3, $4, $5, $6, NOW())
            ON CONFLICT DO NOTHING
            RETURNING {CHECK_COLUMNS}
            "#
        ))
        .bind(uuid::Uuid::now_v7())
        .bind(new.scope_id.as_uuid())
        .bind(CHECK_SCHEMA)
        .bind(serde_json::to_value(&new.plan)?)
        .bind(new.manually_triggered)
        .bind(serde_json::to_value(&new.metadata)?)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Check::try_from).transpose()
    }

    async fn get_check(&self, id: CheckId) -> DbResult<Option<Check>> {
        let row = sqlx::query_as::<_, CheckRecord>(&format!(
            "SELECT {CHECK_COLUMNS} FROM checks WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Check::try_from).transpose()
    }

    async fn started_checks(&self) -> DbResult<Vec<Check>> {
        let rows = sqlx::query_as::<_, CheckRecord>(&format!(
            "SELECT {CHECK_COLUMNS} FROM checks WHERE status = 'started' ORDER BY create_time"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Check::try_from).collect()
    }

    async fn claim_started_check(
        &self,
        claimer: &str,
        lease: Duration,
    ) -> DbResult<Option<Check>> {
        // SKIP LOCKED keeps concurrent schedulers from claiming the same row.
        let row = sqlx::query_as::<_, CheckRecord>(&format!(
            r#"
            UPDATE checks
            SET claimed_by = $1,
                claim_expires_at = NOW() + make_interval(secs => $2),
                start_time = NOW()
            WHERE id = (
                SELECT id FROM checks
                WHERE status = 'started'
                  AND (claimed_by IS NULL OR claim_expires_at <= NOW())
                ORDER BY manually_triggered DESC, create_time ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {CHECK_COLUMNS}
            "#
        ))
        .bind(claimer)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Check::try_from).transpose()
    }

    async fn renew_claim(&self, id: CheckId, claimer: &str, lease: Duration) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE checks
            SET claim_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND claimed_by = $2 AND status = 'started'
            "#,
        )
        .bind(id.as_uuid())
        .bind(claimer)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_check(
        &self,
        id: CheckId,
        status: CheckStatus,
        error: Option<&str>,
    ) -> DbResult<Check> {
        if !status.is_terminal() {
            return Err(DbError::InvalidTransition(format!(
                "check {} cannot finish as {}",
                id, status
            )));
        }

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, CheckRecord>(&format!(
            r#"
            UPDATE checks
            SET status = $2, check_error = $3, end_time = NOW()
            WHERE id = $1 AND status = 'started'
            RETURNING {CHECK_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(error)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::InvalidTransition(format!("check {} is not started", id)))?;

        for table in ["resources", "resource_types"] {
            sqlx::query(&format!(
                "UPDATE {table} SET last_check_end_time = $2 WHERE resource_config_scope_id = $1"
            ))
            .bind(row.resource_config_scope_id)
            .bind(row.end_time)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Check::try_from(row)
    }
}
