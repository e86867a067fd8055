//! Worker registry.

use async_trait::async_trait;
use beacon_core::TeamId;
use beacon_core::worker::{Worker, WorkerResourceType};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn get_worker(&self, name: &str) -> DbResult<Option<Worker>>;

    /// Running workers with their current live container counts.
    async fn running_workers(&self) -> DbResult<Vec<Worker>>;

    /// Register or refresh a worker.
    async fn save_worker(&self, worker: &Worker) -> DbResult<()>;
}

/// A worker row joined with its live container count.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerRow {
    pub name: String,
    pub addr: Option<String>,
    pub team_id: Option<uuid::Uuid>,
    pub tags: Vec<String>,
    pub resource_types: serde_json::Value,
    pub state: String,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub active_containers: i64,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = DbError;

    fn try_from(row: WorkerRow) -> DbResult<Worker> {
        let state = row
            .state
            .parse()
            .map_err(|_| DbError::Corrupt(format!("worker {} state '{}'", row.name, row.state)))?;
        let resource_types: Vec<WorkerResourceType> = serde_json::from_value(row.resource_types)?;

        Ok(Worker {
            name: row.name,
            addr: row.addr,
            team_id: row.team_id.map(TeamId::from_uuid),
            tags: row.tags,
            resource_types,
            state,
            active_containers: row.active_containers,
            heartbeat_at: row.heartbeat_at,
        })
    }
}

const WORKER_SELECT: &str = r#"
    SELECT w.name, w.addr, w.team_id, w.tags, w.resource_types, w.state, w.heartbeat_at,
           (SELECT COUNT(*) FROM containers c
            WHERE c.worker_name = w.name AND c.state IN ('creating', 'created')) AS active_containers
    FROM workers w
"#;

/// PostgreSQL implementation of WorkerRegistry.
pub struct PgWorkerRegistry {
    pool: PgPool,
}

impl PgWorkerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRegistry for PgWorkerRegistry {
    async fn get_worker(&self, name: &str) -> DbResult<Option<Worker>> {
        let row = sqlx::query_as::<_, WorkerRow>(&format!("{WORKER_SELECT} WHERE w.name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Worker::try_from).transpose()
    }

    async fn running_workers(&self) -> DbResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>(&format!(
            "{WORKER_SELECT} WHERE w.state = 'running' ORDER BY w.name"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn save_worker(&self, worker: &Worker) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (name, addr, team_id, tags, resource_types, state, heartbeat_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (name) DO UPDATE SET
                addr = EXCLUDED.addr,
                team_id = EXCLUDED.team_id,
                tags = EXCLUDED.tags,
                resource_types = EXCLUDED.resource_types,
                state = EXCLUDED.state,
                heartbeat_at = EXCLUDED.heartbeat_at
            "#,
        )
        .bind(&worker.name)
        .bind(&worker.addr)
        .bind(worker.team_id.map(|t| *t.as_uuid()))
        .bind(&worker.tags)
        .bind(serde_json::to_value(&worker.resource_types)?)
        .bind(worker.state.as_str())
        .execute(&self.pool)
        .await?;

        tracing::debug!(worker = %worker.name, state = %worker.state, "worker saved");
        Ok(())
    }
}
