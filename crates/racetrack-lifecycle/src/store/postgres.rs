//! PostgreSQL job registry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::config::DatabaseConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::types::{generate_id, AuditLogEvent, Deployment, DeploymentId, Job, JobFamily};

use super::{
    deployment_not_found, expect_single_row, family_not_found, job_not_found, AuditFilter,
    DeploymentFilter, JobFilter, JobOrder, JobStore, AUDIT_QUERY_LIMIT,
};

const JOB_COLUMNS: &str = "id, family_id, name, version, status, create_time, update_time, \
    manifest, internal_name, pub_url, error, image_tag, deployed_by, last_call_time, \
    infrastructure_target, replica_internal_names, job_type_version, infrastructure_stats";

const DEPLOYMENT_COLUMNS: &str = "id, status, create_time, update_time, manifest, error, \
    job_name, job_version, deployed_by, build_logs, phase, image_name, \
    infrastructure_target, warnings";

const AUDIT_COLUMNS: &str = "id, version, timestamp, event_type, properties, \
    username_executor, username_subject, job_name, job_version";

/// PostgreSQL-backed job registry.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the database named by the config URL.
    ///
    /// Creates the required tables if they don't exist.
    pub async fn connect(config: &DatabaseConfig) -> LifecycleResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> LifecycleResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> LifecycleResult<()> {
        let statements = [
            r"
            CREATE TABLE IF NOT EXISTS registry_jobfamily (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS registry_job (
                id TEXT PRIMARY KEY,
                family_id TEXT NOT NULL,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                status TEXT NOT NULL,
                create_time TIMESTAMPTZ NOT NULL,
                update_time TIMESTAMPTZ NOT NULL,
                manifest TEXT,
                internal_name TEXT,
                pub_url TEXT,
                error TEXT,
                image_tag TEXT,
                deployed_by TEXT,
                last_call_time TIMESTAMPTZ,
                infrastructure_target TEXT,
                replica_internal_names TEXT[] NOT NULL DEFAULT '{}',
                job_type_version TEXT NOT NULL DEFAULT '',
                infrastructure_stats JSONB,
                UNIQUE (name, version)
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS registry_deployment (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                create_time TIMESTAMPTZ NOT NULL,
                update_time TIMESTAMPTZ NOT NULL,
                manifest TEXT NOT NULL,
                error TEXT,
                job_name TEXT NOT NULL,
                job_version TEXT NOT NULL,
                deployed_by TEXT,
                build_logs TEXT,
                phase TEXT,
                image_name TEXT,
                infrastructure_target TEXT,
                warnings TEXT
            )
            ",
            r"
            CREATE INDEX IF NOT EXISTS idx_deployment_status
            ON registry_deployment (status, job_name, job_version)
            ",
            r"
            CREATE TABLE IF NOT EXISTS registry_auditlogevent (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                event_type TEXT NOT NULL,
                properties JSONB,
                username_executor TEXT,
                username_subject TEXT,
                job_name TEXT,
                job_version TEXT
            )
            ",
            r"
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp
            ON registry_auditlogevent (timestamp DESC)
            ",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn row_to_job(row: &PgRow) -> LifecycleResult<Job> {
        let status: String = row.try_get("status")?;

        Ok(Job {
            id: row.try_get("id")?,
            family_id: row.try_get("family_id")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            status: status.parse().map_err(LifecycleError::Serialisation)?,
            create_time: row.try_get("create_time")?,
            update_time: row.try_get("update_time")?,
            manifest_yaml: row.try_get("manifest")?,
            internal_name: row.try_get("internal_name")?,
            pub_url: row.try_get("pub_url")?,
            error: row.try_get("error")?,
            image_tag: row.try_get("image_tag")?,
            deployed_by: row.try_get("deployed_by")?,
            last_call_time: row.try_get("last_call_time")?,
            infrastructure_target: row.try_get("infrastructure_target")?,
            replica_internal_names: row.try_get("replica_internal_names")?,
            job_type_version: row.try_get("job_type_version")?,
            infrastructure_stats: row.try_get("infrastructure_stats")?,
        })
    }

    fn row_to_deployment(row: &PgRow) -> LifecycleResult<Deployment> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;

        Ok(Deployment {
            id: DeploymentId::new(id),
            status: status.parse().map_err(LifecycleError::Serialisation)?,
            create_time: row.try_get("create_time")?,
            update_time: row.try_get("update_time")?,
            manifest_yaml: row.try_get("manifest")?,
            error: row.try_get("error")?,
            job_name: row.try_get("job_name")?,
            job_version: row.try_get("job_version")?,
            deployed_by: row.try_get("deployed_by")?,
            build_logs: row.try_get("build_logs")?,
            phase: row.try_get("phase")?,
            image_name: row.try_get("image_name")?,
            infrastructure_target: row.try_get("infrastructure_target")?,
            warnings: row.try_get("warnings")?,
        })
    }

    fn row_to_audit(row: &PgRow) -> LifecycleResult<AuditLogEvent> {
        let event_type: String = row.try_get("event_type")?;

        Ok(AuditLogEvent {
            id: row.try_get("id")?,
            version: row.try_get("version")?,
            timestamp: row.try_get("timestamp")?,
            event_type: event_type.parse().map_err(LifecycleError::Serialisation)?,
            properties: row.try_get("properties")?,
            username_executor: row.try_get("username_executor")?,
            username_subject: row.try_get("username_subject")?,
            job_name: row.try_get("job_name")?,
            job_version: row.try_get("job_version")?,
        })
    }
}

fn unique_violation(e: sqlx::Error, what: impl FnOnce() -> String) -> LifecycleError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            LifecycleError::AlreadyExists(what())
        }
        _ => e.into(),
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn create_family_if_not_exists(&self, name: &str) -> LifecycleResult<JobFamily> {
        let row = sqlx::query(
            r"
            INSERT INTO registry_jobfamily (id, name) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name
            ",
        )
        .bind(generate_id())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobFamily {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    async fn find_family(&self, name: &str) -> LifecycleResult<JobFamily> {
        let row = sqlx::query("SELECT id, name FROM registry_jobfamily WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| family_not_found(name))?;
        Ok(JobFamily {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    async fn list_families(&self) -> LifecycleResult<Vec<JobFamily>> {
        let rows = sqlx::query("SELECT id, name FROM registry_jobfamily ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(JobFamily {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    async fn create_job(&self, job: &Job) -> LifecycleResult<Job> {
        let mut created = job.clone();
        if created.id.is_empty() {
            created.id = generate_id();
        }
        created.update_time = Utc::now();

        sqlx::query(&format!(
            "INSERT INTO registry_job ({JOB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        ))
        .bind(&created.id)
        .bind(&created.family_id)
        .bind(&created.name)
        .bind(&created.version)
        .bind(created.status.as_str())
        .bind(created.create_time)
        .bind(created.update_time)
        .bind(&created.manifest_yaml)
        .bind(&created.internal_name)
        .bind(&created.pub_url)
        .bind(&created.error)
        .bind(&created.image_tag)
        .bind(&created.deployed_by)
        .bind(created.last_call_time)
        .bind(&created.infrastructure_target)
        .bind(&created.replica_internal_names)
        .bind(&created.job_type_version)
        .bind(&created.infrastructure_stats)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            unique_violation(e, || {
                format!("job {} v{} already exists", job.name, job.version)
            })
        })?;

        Ok(created)
    }

    async fn find_job(&self, name: &str, version: &str) -> LifecycleResult<Job> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM registry_job WHERE name = $1 AND version = $2"
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| job_not_found(name, version))?;
        Self::row_to_job(&row)
    }

    async fn update_job(&self, job: &Job) -> LifecycleResult<()> {
        let result = sqlx::query(
            r"
            UPDATE registry_job
            SET family_id = $1, name = $2, version = $3, status = $4, update_time = NOW(),
                manifest = $5, internal_name = $6, pub_url = $7, error = $8, image_tag = $9,
                deployed_by = $10, last_call_time = $11, infrastructure_target = $12,
                replica_internal_names = $13, job_type_version = $14,
                infrastructure_stats = $15
            WHERE id = $16
            ",
        )
        .bind(&job.family_id)
        .bind(&job.name)
        .bind(&job.version)
        .bind(job.status.as_str())
        .bind(&job.manifest_yaml)
        .bind(&job.internal_name)
        .bind(&job.pub_url)
        .bind(&job.error)
        .bind(&job.image_tag)
        .bind(&job.deployed_by)
        .bind(job.last_call_time)
        .bind(&job.infrastructure_target)
        .bind(&job.replica_internal_names)
        .bind(&job.job_type_version)
        .bind(&job.infrastructure_stats)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;

        expect_single_row(
            result.rows_affected(),
            format!("job {} v{}", job.name, job.version),
        )
    }

    async fn list_jobs(&self, filter: &JobFilter) -> LifecycleResult<Vec<Job>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {JOB_COLUMNS} FROM registry_job WHERE TRUE"
        ));
        if let Some(name) = &filter.name {
            query.push(" AND name = ").push_bind(name.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(target) = &filter.infrastructure_target {
            query
                .push(" AND infrastructure_target = ")
                .push_bind(target.clone());
        }
        query.push(match filter.order {
            JobOrder::NameVersion => " ORDER BY name, version",
            JobOrder::RecentlyUpdated => " ORDER BY update_time DESC",
        });

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn delete_job(&self, name: &str, version: &str) -> LifecycleResult<()> {
        let result = sqlx::query("DELETE FROM registry_job WHERE name = $1 AND version = $2")
            .bind(name)
            .bind(version)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(job_not_found(name, version));
        }
        Ok(())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> LifecycleResult<()> {
        sqlx::query(&format!(
            "INSERT INTO registry_deployment ({DEPLOYMENT_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(deployment.id.as_str())
        .bind(deployment.status.as_str())
        .bind(deployment.create_time)
        .bind(deployment.update_time)
        .bind(&deployment.manifest_yaml)
        .bind(&deployment.error)
        .bind(&deployment.job_name)
        .bind(&deployment.job_version)
        .bind(&deployment.deployed_by)
        .bind(&deployment.build_logs)
        .bind(&deployment.phase)
        .bind(&deployment.image_name)
        .bind(&deployment.infrastructure_target)
        .bind(&deployment.warnings)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, || format!("deployment {} already exists", deployment.id)))?;
        Ok(())
    }

    async fn find_deployment(&self, id: &DeploymentId) -> LifecycleResult<Deployment> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM registry_deployment WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| deployment_not_found(id))?;
        Self::row_to_deployment(&row)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> LifecycleResult<()> {
        let result = sqlx::query(
            r"
            UPDATE registry_deployment
            SET status = $1, update_time = NOW(), manifest = $2, error = $3, job_name = $4,
                job_version = $5, deployed_by = $6, build_logs = $7, phase = $8,
                image_name = $9, infrastructure_target = $10, warnings = $11
            WHERE id = $12
            ",
        )
        .bind(deployment.status.as_str())
        .bind(&deployment.manifest_yaml)
        .bind(&deployment.error)
        .bind(&deployment.job_name)
        .bind(&deployment.job_version)
        .bind(&deployment.deployed_by)
        .bind(&deployment.build_logs)
        .bind(&deployment.phase)
        .bind(&deployment.image_name)
        .bind(&deployment.infrastructure_target)
        .bind(&deployment.warnings)
        .bind(deployment.id.as_str())
        .execute(&self.pool)
        .await?;

        expect_single_row(result.rows_affected(), format!("deployment {}", deployment.id))
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> LifecycleResult<Vec<Deployment>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM registry_deployment WHERE TRUE"
        ));
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(name) = &filter.job_name {
            query.push(" AND job_name = ").push_bind(name.clone());
        }
        if let Some(version) = &filter.job_version {
            query.push(" AND job_version = ").push_bind(version.clone());
        }
        if let Some(before) = filter.updated_before {
            query.push(" AND update_time < ").push_bind(before);
        }
        if let Some(since) = filter.updated_since {
            query.push(" AND update_time >= ").push_bind(since);
        }
        query.push(" ORDER BY create_time DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn append_audit_event(&self, event: &AuditLogEvent) -> LifecycleResult<()> {
        sqlx::query(&format!(
            "INSERT INTO registry_auditlogevent ({AUDIT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(&event.id)
        .bind(event.version)
        .bind(event.timestamp)
        .bind(event.event_type.as_str())
        .bind(&event.properties)
        .bind(&event.username_executor)
        .bind(&event.username_subject)
        .bind(&event.job_name)
        .bind(&event.job_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit_events(&self, filter: &AuditFilter) -> LifecycleResult<Vec<AuditLogEvent>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {AUDIT_COLUMNS} FROM registry_auditlogevent WHERE TRUE"
        ));
        if let Some(username) = &filter.username {
            query
                .push(" AND (username_executor = ")
                .push_bind(username.clone())
                .push(" OR username_subject = ")
                .push_bind(username.clone())
                .push(")");
        }
        if let Some(name) = &filter.job_name {
            query.push(" AND job_name = ").push_bind(name.clone());
        }
        if let Some(version) = &filter.job_version {
            query.push(" AND job_version = ").push_bind(version.clone());
        }
        query
            .push(" ORDER BY timestamp DESC LIMIT ")
            .push_bind(i64::from(AUDIT_QUERY_LIMIT));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_audit).collect()
    }

    async fn ping(&self) -> LifecycleResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
