//! Container ownership ledger.
//!
//! A record is inserted as `creating` before anything physical exists, and
//! the partial unique index on `(worker_name, owner_key)` over live states is
//! what keeps two schedulers from building the same owner's container.

use async_trait::async_trait;
use beacon_core::container::{
    ContainerMetadata, ContainerRecord, ContainerState, CreatedContainer, CreatingContainer,
    LedgerEntry,
};
use beacon_core::owner::{ContainerOwner, OwnerKey};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait ContainerLedger: Send + Sync {
    /// The live, unexpired record for `owner` on `worker_name`.
    async fn find(&self, worker_name: &str, owner: &ContainerOwner) -> DbResult<LedgerEntry>;

    /// Insert a `creating` record. When another caller won the race, the
    /// winner's live record is returned instead.
    async fn create(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> DbResult<LedgerEntry>;

    /// `creating` -> `created`.
    async fn created(&self, handle: &str) -> DbResult<CreatedContainer>;

    /// `creating` -> `failed`.
    async fn failed(&self, handle: &str) -> DbResult<()>;

    /// Any live state -> `destroying`.
    async fn destroying(&self, handle: &str) -> DbResult<()>;

    /// Workers holding a live, unexpired container for `owner`.
    async fn workers_with_owner(&self, owner: &ContainerOwner) -> DbResult<Vec<String>>;

    async fn containers(&self, worker_name: &str) -> DbResult<Vec<ContainerRecord>>;
}

pub fn new_handle() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A container row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContainerRow {
    pub handle: String,
    pub worker_name: String,
    pub owner_key: String,
    pub state: String,
    pub metadata: serde_json::Value,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ContainerRow {
    fn state(&self) -> DbResult<ContainerState> {
        self.state.parse().map_err(|_| {
            DbError::Corrupt(format!("container {} state '{}'", self.handle, self.state))
        })
    }

    fn into_entry(self) -> DbResult<LedgerEntry> {
        let state = self.state()?;
        let owner_key = OwnerKey::from(self.owner_key);
        match state {
            ContainerState::Creating => Ok(LedgerEntry::Creating(CreatingContainer {
                handle: self.handle,
                worker_name: self.worker_name,
                owner_key,
            })),
            ContainerState::Created => Ok(LedgerEntry::Created(CreatedContainer {
                handle: self.handle,
                worker_name: self.worker_name,
                owner_key,
            })),
            other => Err(DbError::Corrupt(format!(
                "container {} is {} but was returned as live",
                self.handle, other
            ))),
        }
    }

    fn into_record(self) -> DbResult<ContainerRecord> {
        Ok(ContainerRecord {
            state: self.state()?,
            metadata: serde_json::from_value(self.metadata)?,
            handle: self.handle,
            worker_name: self.worker_name,
            owner_key: OwnerKey::from(self.owner_key),
            expires_at: self.expires_at,
            created_at: self.created_at,
        })
    }
}

const CONTAINER_COLUMNS: &str =
    "handle, worker_name, owner_key, state, metadata, expires_at, created_at";

/// PostgreSQL implementation of ContainerLedger.
pub struct PgContainerLedger {
    pool: PgPool,
}

impl PgContainerLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_live(&self, worker_name: &str, key: &OwnerKey) -> DbResult<Option<ContainerRow>> {
        let row = sqlx::query_as::<_, ContainerRow>(&format!(
            r#"
            SELECT {CONTAINER_COLUMNS} FROM containers
            WHERE worker_name = $1 AND owner_key = $2
              AND state IN ('creating', 'created')
              AND (expires_at IS NULL OR expires_at > NOW())
            "#
        ))
        .bind(worker_name)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl ContainerLedger for PgContainerLedger {
    async fn find(&self, worker_name: &str, owner: &ContainerOwner) -> DbResult<LedgerEntry> {
        match self.find_live(worker_name, &owner.key()).await? {
            Some(row) => row.into_entry(),
            None => Ok(LedgerEntry::Absent),
        }
    }

    async fn create(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> DbResult<LedgerEntry> {
        let key = owner.key();
        let now = Utc::now();

        // Expired sessions give up the owner key before a new record claims it.
        let expired = sqlx::query(
            r#"
            UPDATE containers SET state = 'destroying'
            WHERE worker_name = $1 AND owner_key = $2
              AND state IN ('creating', 'created')
              AND expires_at IS NOT NULL AND expires_at <= $3
            "#,
        )
        .bind(worker_name)
        .bind(key.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if expired.rows_affected() > 0 {
            tracing::debug!(worker = %worker_name, owner = %key, "expired session containers released");
        }

        let row = sqlx::query_as::<_, ContainerRow>(&format!(
            r#"
            INSERT INTO containers (handle, worker_name, owner_key, owner, state, metadata, expires_at, created_at)
            VALUES ($1, $2, $3, $4, 'creating', $5, $6, $7)
            ON CONFLICT DO NOTHING
            RETURNING {CONTAINER_COLUMNS}
            "#
        ))
        .bind(new_handle())
        .bind(worker_name)
        .bind(key.as_str())
        .bind(serde_json::to_value(owner)?)
        .bind(serde_json::to_value(metadata)?)
        .bind(owner.expires_at(now))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row.into_entry();
        }

        match self.find_live(worker_name, &key).await? {
            Some(row) => row.into_entry(),
            // The winner vanished between our insert and this read.
            None => Err(DbError::InvalidTransition(format!(
                "owner {} on {} lost the creation race to a record that no longer exists",
                key, worker_name
            ))),
        }
    }

    async fn created(&self, handle: &str) -> DbResult<CreatedContainer> {
        let row = sqlx::query_as::<_, ContainerRow>(&format!(
            r#"
            UPDATE containers SET state = 'created'
            WHERE handle = $1 AND state = 'creating'
            RETURNING {CONTAINER_COLUMNS}
            "#
        ))
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            DbError::InvalidTransition(format!("container {} is not creating", handle))
        })?;

        Ok(CreatedContainer {
            handle: row.handle,
            worker_name: row.worker_name,
            owner_key: OwnerKey::from(row.owner_key),
        })
    }

    async fn failed(&self, handle: &str) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE containers SET state = 'failed' WHERE handle = $1 AND state = 'creating'",
        )
        .bind(handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::InvalidTransition(format!(
                "container {} is not creating",
                handle
            )));
        }
        Ok(())
    }

    async fn destroying(&self, handle: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE containers SET state = 'destroying'
            WHERE handle = $1 AND state IN ('creating', 'created')
            "#,
        )
        .bind(handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::InvalidTransition(format!(
                "container {} is not live",
                handle
            )));
        }
        Ok(())
    }

    async fn workers_with_owner(&self, owner: &ContainerOwner) -> DbResult<Vec<String>> {
        let names = sqlx::query_scalar(
            r#"
            SELECT worker_name FROM containers
            WHERE owner_key = $1
              AND state IN ('creating', 'created')
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY worker_name
            "#,
        )
        .bind(owner.key().as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn containers(&self, worker_name: &str) -> DbResult<Vec<ContainerRecord>> {
        let rows = sqlx::query_as::<_, ContainerRow>(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE worker_name = $1 ORDER BY created_at"
        ))
        .bind(worker_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ContainerRow::into_record).collect()
    }
}
