//! PostgreSQL store
//!
//! Enum columns are stored as text. Every guarded transition is either a
//! single conditional UPDATE or a short transaction that locks the pipeline
//! row first (`SELECT ... FOR UPDATE`).

use super::{PipelineStore, Release, StoreError};
use crate::model::{
    Group, Namespace, PhaseKey, PhaseStatus, PhaseWrite, Pipeline, PipelinePhase,
    PipelineStatus, ResourceQuota, Service,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::info;

/// Terminal phase statuses as an SQL list
const TERMINAL_PHASE: &str = "('success', 'failed')";

/// Terminal pipeline statuses as an SQL list
const TERMINAL_PIPELINE: &str =
    "('success', 'failed', 'rollback_success', 'rollback_failed', 'terminate')";

const PIPELINE_COLUMNS: &str = "id, service_id, status, image, created_by, created_at, updated_at";

const PHASE_COLUMNS: &str = "id, pipeline_id, kind, name, status, resource_version, deployment, \
                             log, created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create the tables if they do not exist
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS namespace (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR(253) NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS service (
                id BIGSERIAL PRIMARY KEY,
                namespace_id BIGINT NOT NULL REFERENCES namespace(id),
                name VARCHAR(63) NOT NULL,
                replicas INTEGER NOT NULL DEFAULT 1,
                port INTEGER NOT NULL DEFAULT 8080,
                cpu_request VARCHAR(32),
                cpu_limit VARCHAR(32),
                memory_request VARCHAR(32),
                memory_limit VARCHAR(32),
                config JSONB NOT NULL DEFAULT '{}',
                online_group VARCHAR(8) NOT NULL DEFAULT '',
                deploy_group VARCHAR(8) NOT NULL DEFAULT '',
                "lock" VARCHAR(255) NOT NULL DEFAULT '',
                UNIQUE (namespace_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline (
                id BIGSERIAL PRIMARY KEY,
                service_id BIGINT NOT NULL REFERENCES service(id),
                status VARCHAR(32) NOT NULL DEFAULT 'wait',
                image TEXT NOT NULL DEFAULT '',
                created_by VARCHAR(255) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_phase (
                id BIGSERIAL PRIMARY KEY,
                pipeline_id BIGINT NOT NULL REFERENCES pipeline(id) ON DELETE CASCADE,
                kind VARCHAR(16) NOT NULL,
                name VARCHAR(16) NOT NULL,
                status VARCHAR(16) NOT NULL,
                resource_version VARCHAR(64) NOT NULL DEFAULT '',
                deployment TEXT,
                log TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (pipeline_id, kind, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pipeline_service_id ON pipeline(service_id, id DESC)",
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Lock the pipeline row and read its status
    async fn locked_status(
        tx: &mut Transaction<'_, Postgres>,
        pipeline_id: i64,
    ) -> Result<PipelineStatus, StoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM pipeline WHERE id = $1 FOR UPDATE")
                .bind(pipeline_id)
                .fetch_optional(&mut **tx)
                .await?;
        let status = status.ok_or_else(|| StoreError::NotFound(format!("pipeline {}", pipeline_id)))?;
        parse_column(&status)
    }

    /// Explain why a conditional service update matched no row
    async fn lock_failure(
        tx: &mut Transaction<'_, Postgres>,
        service_id: i64,
    ) -> Result<StoreError, StoreError> {
        let holder: Option<String> = sqlx::query_scalar(r#"SELECT "lock" FROM service WHERE id = $1"#)
            .bind(service_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(match holder {
            Some(holder) => StoreError::Locked { holder },
            None => StoreError::NotFound(format!("service {}", service_id)),
        })
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Corrupt)
}

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: i64,
    service_id: i64,
    status: String,
    image: String,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = StoreError;

    fn try_from(row: PipelineRow) -> Result<Self, Self::Error> {
        Ok(Pipeline {
            id: row.id,
            service_id: row.service_id,
            status: parse_column(&row.status)?,
            image: row.image,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: i64,
    namespace_id: i64,
    name: String,
    replicas: i32,
    port: i32,
    cpu_request: Option<String>,
    cpu_limit: Option<String>,
    memory_request: Option<String>,
    memory_limit: Option<String>,
    config: serde_json::Value,
    online_group: String,
    deploy_group: String,
    lock: String,
}

impl TryFrom<ServiceRow> for Service {
    type Error = StoreError;

    fn try_from(row: ServiceRow) -> Result<Self, Self::Error> {
        let config = serde_json::from_value(row.config)
            .map_err(|e| StoreError::Corrupt(format!("service {} config: {}", row.id, e)))?;
        Ok(Service {
            id: row.id,
            namespace_id: row.namespace_id,
            name: row.name,
            replicas: row.replicas,
            port: row.port,
            quota: ResourceQuota {
                cpu_request: row.cpu_request,
                cpu_limit: row.cpu_limit,
                memory_request: row.memory_request,
                memory_limit: row.memory_limit,
            },
            config,
            online_group: Group::from_column(&row.online_group).map_err(StoreError::Corrupt)?,
            deploy_group: Group::from_column(&row.deploy_group).map_err(StoreError::Corrupt)?,
            lock: row.lock,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PhaseRow {
    id: i64,
    pipeline_id: i64,
    kind: String,
    name: String,
    status: String,
    resource_version: String,
    deployment: Option<String>,
    log: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PhaseRow> for PipelinePhase {
    type Error = StoreError;

    fn try_from(row: PhaseRow) -> Result<Self, Self::Error> {
        Ok(PipelinePhase {
            id: row.id,
            pipeline_id: row.pipeline_id,
            kind: parse_column(&row.kind)?,
            name: parse_column(&row.name)?,
            status: parse_column(&row.status)?,
            resource_version: row.resource_version,
            deployment: row.deployment,
            log: row.log,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn pipeline(&self, id: i64) -> Result<Pipeline, StoreError> {
        let row = sqlx::query_as::<_, PipelineRow>(&format!(
            "SELECT {} FROM pipeline WHERE id = $1",
            PIPELINE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::NotFound(format!("pipeline {}", id)))?
            .try_into()
    }

    async fn latest_pipeline(&self, service_id: i64) -> Result<Pipeline, StoreError> {
        let row = sqlx::query_as::<_, PipelineRow>(&format!(
            "SELECT {} FROM pipeline WHERE service_id = $1 ORDER BY id DESC LIMIT 1",
            PIPELINE_COLUMNS
        ))
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::NotFound(format!("pipeline for service {}", service_id)))?
            .try_into()
    }

    async fn create_pipeline(
        &self,
        service_id: i64,
        created_by: &str,
    ) -> Result<Pipeline, StoreError> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, PipelineRow>(&format!(
            r#"
            INSERT INTO pipeline (service_id, status, image, created_by, created_at, updated_at)
            SELECT id, 'wait', '', $2, $3, $3 FROM service WHERE id = $1
            RETURNING {}
            "#,
            PIPELINE_COLUMNS
        ))
        .bind(service_id)
        .bind(created_by)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::NotFound(format!("service {}", service_id)))?
            .try_into()
    }

    async fn record_image(&self, pipeline_id: i64, image: &str) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE pipeline SET image = $1, updated_at = $2 WHERE id = $3 AND status NOT IN {}",
            TERMINAL_PIPELINE
        ))
        .bind(image)
        .bind(Utc::now())
        .bind(pipeline_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let pipeline = self.pipeline(pipeline_id).await?;
            return Err(StoreError::Conflict(format!(
                "pipeline {} is {}",
                pipeline_id, pipeline.status
            )));
        }
        Ok(())
    }

    async fn service(&self, id: i64) -> Result<Service, StoreError> {
        let row = sqlx::query_as::<_, ServiceRow>(
            r#"
            SELECT id, namespace_id, name, replicas, port, cpu_request, cpu_limit,
                   memory_request, memory_limit, config, online_group, deploy_group,
                   "lock" AS lock
            FROM service
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::NotFound(format!("service {}", id)))?
            .try_into()
    }

    async fn namespace(&self, id: i64) -> Result<Namespace, StoreError> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM namespace WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let (id, name) = row.ok_or_else(|| StoreError::NotFound(format!("namespace {}", id)))?;
        Ok(Namespace { id, name })
    }

    async fn phase(&self, key: PhaseKey) -> Result<PipelinePhase, StoreError> {
        let row = sqlx::query_as::<_, PhaseRow>(&format!(
            "SELECT {} FROM pipeline_phase WHERE pipeline_id = $1 AND kind = $2 AND name = $3",
            PHASE_COLUMNS
        ))
        .bind(key.pipeline_id)
        .bind(key.kind.as_str())
        .bind(key.name.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::NotFound(format!("phase {}", key)))?
            .try_into()
    }

    async fn phases(&self, pipeline_id: i64) -> Result<Vec<PipelinePhase>, StoreError> {
        let rows = sqlx::query_as::<_, PhaseRow>(&format!(
            "SELECT {} FROM pipeline_phase WHERE pipeline_id = $1",
            PHASE_COLUMNS
        ))
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        let mut phases = rows
            .into_iter()
            .map(PipelinePhase::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        phases.sort_by_key(|p| (p.kind.as_str(), p.name));
        Ok(phases)
    }

    async fn write_phase(&self, write: PhaseWrite) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO pipeline_phase
                (pipeline_id, kind, name, status, deployment, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (pipeline_id, kind, name) DO UPDATE
            SET status = EXCLUDED.status,
                deployment = COALESCE(EXCLUDED.deployment, pipeline_phase.deployment),
                updated_at = EXCLUDED.updated_at
            WHERE pipeline_phase.status NOT IN {}
              AND NOT (pipeline_phase.status = 'process' AND EXCLUDED.status = 'wait')
            "#,
            TERMINAL_PHASE
        ))
        .bind(write.key.pipeline_id)
        .bind(write.key.kind.as_str())
        .bind(write.key.name.as_str())
        .bind(write.status.as_str())
        .bind(write.deployment)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_phase(
        &self,
        key: PhaseKey,
        status: PhaseStatus,
        resource_version: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE pipeline_phase
            SET status = $1, resource_version = $2, updated_at = $3
            WHERE pipeline_id = $4 AND kind = $5 AND name = $6
              AND status NOT IN {}
              AND resource_version <> $2
            "#,
            TERMINAL_PHASE
        ))
        .bind(status.as_str())
        .bind(resource_version)
        .bind(Utc::now())
        .bind(key.pipeline_id)
        .bind(key.kind.as_str())
        .bind(key.name.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_phase_log(&self, key: PhaseKey, line: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE pipeline_phase
            SET log = log || $1, updated_at = $2
            WHERE pipeline_id = $3 AND kind = $4 AND name = $5
              AND status NOT IN {}
            "#,
            TERMINAL_PHASE
        ))
        .bind(format!("{}\n", line))
        .bind(Utc::now())
        .bind(key.pipeline_id)
        .bind(key.kind.as_str())
        .bind(key.name.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn lock_for_deploy(
        &self,
        pipeline_id: i64,
        service_id: i64,
        deploy_group: Group,
    ) -> Result<(), StoreError> {
        let holder = Service::pipeline_holder(pipeline_id);
        let mut tx = self.pool.begin().await?;

        let status = Self::locked_status(&mut tx, pipeline_id).await?;
        if status.is_terminal() || status.is_rollback() {
            return Err(StoreError::Conflict(format!(
                "pipeline {} is {}",
                pipeline_id, status
            )));
        }

        let locked = sqlx::query(
            r#"
            UPDATE service SET "lock" = $1, deploy_group = $2
            WHERE id = $3 AND ("lock" = '' OR "lock" = $1)
            "#,
        )
        .bind(&holder)
        .bind(deploy_group.as_str())
        .bind(service_id)
        .execute(&mut *tx)
        .await?;
        if locked.rows_affected() == 0 {
            return Err(Self::lock_failure(&mut tx, service_id).await?);
        }

        sqlx::query(
            r#"
            UPDATE pipeline
            SET status = CASE WHEN status = 'wait' THEN 'process' ELSE status END,
                updated_at = $1
            WHERE id = $2
            "#,
        )
        .bind(Utc::now())
        .bind(pipeline_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn lock_for_rollback(
        &self,
        pipeline_id: i64,
        service_id: i64,
        username: &str,
    ) -> Result<(), StoreError> {
        let holder = Service::pipeline_holder(pipeline_id);
        let mut tx = self.pool.begin().await?;

        let status = Self::locked_status(&mut tx, pipeline_id).await?;
        if matches!(
            status,
            PipelineStatus::RollbackSuccess | PipelineStatus::Terminate
        ) {
            return Err(StoreError::Conflict(format!(
                "pipeline {} is {}",
                pipeline_id, status
            )));
        }

        let locked = sqlx::query(
            r#"
            UPDATE service SET "lock" = $1
            WHERE id = $2 AND ("lock" = '' OR "lock" = $3 OR $4)
            "#,
        )
        .bind(username)
        .bind(service_id)
        .bind(&holder)
        .bind(status == PipelineStatus::Rollbacking)
        .execute(&mut *tx)
        .await?;
        if locked.rows_affected() == 0 {
            return Err(Self::lock_failure(&mut tx, service_id).await?);
        }

        sqlx::query("UPDATE pipeline SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(PipelineStatus::Rollbacking.as_str())
            .bind(Utc::now())
            .bind(pipeline_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn release(&self, release: Release) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let status = Self::locked_status(&mut tx, release.pipeline_id).await?;
        if status != release.from {
            return Err(StoreError::Conflict(format!(
                "pipeline {} is {}, expected {}",
                release.pipeline_id, status, release.from
            )));
        }

        if let Some(holder) = &release.holder {
            let unlocked = sqlx::query(
                r#"UPDATE service SET "lock" = '' WHERE id = $1 AND ("lock" = '' OR "lock" = $2)"#,
            )
            .bind(release.service_id)
            .bind(holder)
            .execute(&mut *tx)
            .await?;
            if unlocked.rows_affected() == 0 {
                return Err(Self::lock_failure(&mut tx, release.service_id).await?);
            }
        }

        if let Some(groups) = release.groups {
            sqlx::query("UPDATE service SET online_group = $1, deploy_group = $2 WHERE id = $3")
                .bind(Group::to_column(groups.online))
                .bind(Group::to_column(groups.deploy))
                .bind(release.service_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE pipeline SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(release.to.as_str())
            .bind(Utc::now())
            .bind(release.pipeline_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
