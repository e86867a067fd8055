//! Resources, resource types, resource config scopes and their versions.

use async_trait::async_trait;
use beacon_core::check::{Source, Version, VersionedResourceType};
use beacon_core::resource::{CheckTarget, Resource, ResourceConfigScope, ResourceType};
use beacon_core::{
    BaseResourceTypeId, PipelineId, ResourceConfigId, ResourceId, ResourceTypeId, ScopeId, TeamId,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait ResourceRepo: Send + Sync {
    /// Active resources of unpaused pipelines that some job reads with a `get`.
    async fn resources(&self) -> DbResult<Vec<Resource>>;

    /// Active resource types, each with its latest discovered version.
    async fn resource_types(&self) -> DbResult<Vec<ResourceType>>;

    async fn find_resource(&self, pipeline: &str, name: &str) -> DbResult<Option<Resource>>;

    async fn find_resource_type(
        &self,
        pipeline: &str,
        name: &str,
    ) -> DbResult<Option<ResourceType>>;

    /// Find or create the scope for an evaluated source and bind `target` to it.
    async fn set_resource_config(
        &self,
        target: CheckTarget,
        base_type: &str,
        source: &Source,
        resource_types: &[VersionedResourceType],
    ) -> DbResult<ResourceConfigScope>;

    async fn latest_version(&self, scope_id: ScopeId) -> DbResult<Option<Version>>;

    /// Record versions in discovery order; the last one becomes the latest.
    async fn save_versions(&self, scope_id: ScopeId, versions: &[Version]) -> DbResult<()>;
}

/// Stable hash of an evaluated source and the type chain it runs on.
pub fn source_hash(source: &Source, resource_types: &[VersionedResourceType]) -> DbResult<String> {
    let doc = serde_json::json!({
        "source": source,
        "resource_types": resource_types,
    });
    Ok(format!("{:x}", md5::compute(serde_json::to_vec(&doc)?)))
}

pub fn version_md5(version: &Version) -> DbResult<String> {
    Ok(format!("{:x}", md5::compute(serde_json::to_vec(version)?)))
}

/// A resource or resource type row joined with its pipeline and team.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckableRecord {
    pub id: uuid::Uuid,
    pub name: String,
    #[sqlx(rename = "type")]
    pub type_: String,
    pub source: serde_json::Value,
    pub tags: Vec<String>,
    pub check_timeout: Option<String>,
    pub check_every: Option<String>,
    pub active: bool,
    pub pipeline_id: uuid::Uuid,
    pub pipeline_name: String,
    pub team_id: uuid::Uuid,
    pub team_name: String,
    pub resource_config_scope_id: Option<uuid::Uuid>,
    pub last_check_end_time: Option<DateTime<Utc>>,
    pub version: Option<serde_json::Value>,
}

impl CheckableRecord {
    fn source(&self) -> DbResult<Source> {
        match &self.source {
            serde_json::Value::Object(map) => Ok(map.clone()),
            serde_json::Value::Null => Ok(Source::new()),
            _ => Err(DbError::Corrupt(format!("source of '{}' is not an object", self.name))),
        }
    }

    fn into_resource(self) -> DbResult<Resource> {
        Ok(Resource {
            source: self.source()?,
            id: ResourceId::from_uuid(self.id),
            name: self.name,
            type_: self.type_,
            tags: self.tags,
            check_timeout: self.check_timeout,
            check_every: self.check_every,
            active: self.active,
            pipeline_id: PipelineId::from_uuid(self.pipeline_id),
            pipeline_name: self.pipeline_name,
            team_id: TeamId::from_uuid(self.team_id),
            team_name: self.team_name,
            scope_id: self.resource_config_scope_id.map(ScopeId::from_uuid),
            last_check_end_time: self.last_check_end_time,
        })
    }

    fn into_resource_type(self) -> DbResult<ResourceType> {
        let version = self.version.clone().map(serde_json::from_value).transpose()?;
        Ok(ResourceType {
            source: self.source()?,
            id: ResourceTypeId::from_uuid(self.id),
            name: self.name,
            type_: self.type_,
            tags: self.tags,
            check_timeout: self.check_timeout,
            check_every: self.check_every,
            active: self.active,
            pipeline_id: PipelineId::from_uuid(self.pipeline_id),
            pipeline_name: self.pipeline_name,
            team_id: TeamId::from_uuid(self.team_id),
            team_name: self.team_name,
            scope_id: self.resource_config_scope_id.map(ScopeId::from_uuid),
            version,
            last_check_end_time: self.last_check_end_time,
        })
    }
}

const RESOURCE_SELECT: &str = r#"
    SELECT r.id, r.name, r.type, r.source, r.tags, r.check_timeout, r.check_every, r.active,
           p.id AS pipeline_id, p.name AS pipeline_name, t.id AS team_id, t.name AS team_name,
           r.resource_config_scope_id, r.last_check_end_time, NULL::jsonb AS version
    FROM resources r
    JOIN pipelines p ON p.id = r.pipeline_id
    JOIN teams t ON t.id = p.team_id
"#;

const RESOURCE_TYPE_SELECT: &str = r#"
    SELECT rt.id, rt.name, rt.type, rt.source, rt.tags, rt.check_timeout, rt.check_every,
           rt.active, p.id AS pipeline_id, p.name AS pipeline_name, t.id AS team_id,
           t.name AS team_name, rt.resource_config_scope_id, rt.last_check_end_time,
           (SELECT v.version FROM resource_config_versions v
            WHERE v.scope_id = rt.resource_config_scope_id
            ORDER BY v.check_order DESC LIMIT 1) AS version
    FROM resource_types rt
    JOIN pipelines p ON p.id = rt.pipeline_id
    JOIN teams t ON t.id = p.team_id
"#;

/// PostgreSQL implementation of ResourceRepo.
pub struct PgResourceRepo {
    pool: PgPool,
}

impl PgResourceRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResourceRepo for PgResourceRepo {
    async fn resources(&self) -> DbResult<Vec<Resource>> {
        let rows = sqlx::query_as::<_, CheckableRecord>(&format!(
            r#"
            {RESOURCE_SELECT}
            WHERE r.active
              AND NOT p.paused
              AND EXISTS (SELECT 1 FROM job_inputs ji WHERE ji.resource_id = r.id)
            ORDER BY p.name, r.name
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CheckableRecord::into_resource).collect()
    }

    async fn resource_types(&self) -> DbResult<Vec<ResourceType>> {
        let rows = sqlx::query_as::<_, CheckableRecord>(&format!(
            "{RESOURCE_TYPE_SELECT} WHERE rt.active ORDER BY p.name, rt.name"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(CheckableRecord::into_resource_type)
            .collect()
    }

    async fn find_resource(&self, pipeline: &str, name: &str) -> DbResult<Option<Resource>> {
        let row = sqlx::query_as::<_, CheckableRecord>(&format!(
            "{RESOURCE_SELECT} WHERE p.name = $1 AND r.name = $2"
        ))
        .bind(pipeline)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CheckableRecord::into_resource).transpose()
    }

    async fn find_resource_type(
        &self,
        pipeline: &str,
        name: &str,
    ) -> DbResult<Option<ResourceType>> {
        let row = sqlx::query_as::<_, CheckableRecord>(&format!(
            "{RESOURCE_TYPE_SELECT} WHERE p.name = $1 AND rt.name = $2"
        ))
        .bind(pipeline)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CheckableRecord::into_resource_type).transpose()
    }

    async fn set_resource_config(
        &self,
        target: CheckTarget,
        base_type: &str,
        source: &Source,
        resource_types: &[VersionedResourceType],
    ) -> DbResult<ResourceConfigScope> {
        let hash = source_hash(source, resource_types)?;
        let mut tx = self.pool.begin().await?;

        // The no-op DO UPDATE makes RETURNING yield the existing row on conflict.
        let base_id: uuid::Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO base_resource_types (id, name) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(base_type)
        .fetch_one(&mut *tx)
        .await?;

        let config_id: uuid::Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO resource_configs (id, base_resource_type_id, source_hash, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (base_resource_type_id, source_hash)
                DO UPDATE SET source_hash = EXCLUDED.source_hash
            RETURNING id
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(base_id)
        .bind(&hash)
        .fetch_one(&mut *tx)
        .await?;

        let scope_id: uuid::Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO resource_config_scopes (id, resource_config_id, base_resource_type_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (resource_config_id)
                DO UPDATE SET base_resource_type_id = EXCLUDED.base_resource_type_id
            RETURNING id
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(config_id)
        .bind(base_id)
        .fetch_one(&mut *tx)
        .await?;

        let (table, id) = match target {
            CheckTarget::Resource(id) => ("resources", *id.as_uuid()),
            CheckTarget::ResourceType(id) => ("resource_types", *id.as_uuid()),
        };
        let updated = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET resource_config_id = $2, resource_config_scope_id = $3
            WHERE id = $1
            "#
        ))
        .bind(id)
        .bind(config_id)
        .bind(scope_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("{} {}", table, id)));
        }

        tx.commit().await?;

        Ok(ResourceConfigScope {
            id: ScopeId::from_uuid(scope_id),
            resource_config_id: ResourceConfigId::from_uuid(config_id),
            base_resource_type_id: BaseResourceTypeId::from_uuid(base_id),
        })
    }

    async fn latest_version(&self, scope_id: ScopeId) -> DbResult<Option<Version>> {
        let value: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT version FROM resource_config_versions
            WHERE scope_id = $1
            ORDER BY check_order DESC
            LIMIT 1
            "#,
        )
        .bind(scope_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.map(serde_json::from_value).transpose()?)
    }

    async fn save_versions(&self, scope_id: ScopeId, versions: &[Version]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        for version in versions {
            sqlx::query(
                r#"
                INSERT INTO resource_config_versions (scope_id, version, version_md5, check_order)
                VALUES ($1, $2, $3,
                        (SELECT COALESCE(MAX(check_order), 0) + 1
                         FROM resource_config_versions WHERE scope_id = $1))
                ON CONFLICT (scope_id, version_md5) DO NOTHING
                "#,
            )
            .bind(scope_id.as_uuid())
            .bind(serde_json::to_value(version)?)
            .bind(version_md5(version)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
