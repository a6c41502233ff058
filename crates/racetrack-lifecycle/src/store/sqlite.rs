//! Embedded SQLite job registry.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::config::DatabaseConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::types::{
    generate_id, AuditLogEvent, Deployment, DeploymentId, Job, JobFamily, JobStatus,
};

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

/// SQLite-backed job registry stored in a single file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file named by the config URL.
    ///
    /// The required tables are created if they don't exist.
    pub async fn connect(config: &DatabaseConfig) -> LifecycleResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Open a private in-memory database.
    pub async fn in_memory() -> LifecycleResult<Self> {
        // every connection to `:memory:` is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: SqlitePool) -> LifecycleResult<Self> {
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
                create_time TEXT NOT NULL,
                update_time TEXT NOT NULL,
                manifest TEXT,
                internal_name TEXT,
                pub_url TEXT,
                error TEXT,
                image_tag TEXT,
                deployed_by TEXT,
                last_call_time TEXT,
                infrastructure_target TEXT,
                replica_internal_names TEXT NOT NULL DEFAULT '[]',
                job_type_version TEXT NOT NULL DEFAULT '',
                infrastructure_stats TEXT,
                UNIQUE (name, version)
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS registry_deployment (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                create_time TEXT NOT NULL,
                update_time TEXT NOT NULL,
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
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                properties TEXT,
                username_executor TEXT,
                username_subject TEXT,
                job_name TEXT,
                job_version TEXT
            )
            ",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn row_to_job(row: &SqliteRow) -> LifecycleResult<Job> {
        let status: String = row.try_get("status")?;
        let replicas: String = row.try_get("replica_internal_names")?;
        let stats: Option<String> = row.try_get("infrastructure_stats")?;

        Ok(Job {
            id: row.try_get("id")?,
            family_id: row.try_get("family_id")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            status: JobStatus::from_str(&status).map_err(LifecycleError::Serialisation)?,
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
            replica_internal_names: serde_json::from_str(&replicas)?,
            job_type_version: row.try_get("job_type_version")?,
            infrastructure_stats: stats.as_deref().map(serde_json::from_str).transpose()?,
        })
    }

    fn row_to_deployment(row: &SqliteRow) -> LifecycleResult<Deployment> {
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

    fn row_to_audit(row: &SqliteRow) -> LifecycleResult<AuditLogEvent> {
        let event_type: String = row.try_get("event_type")?;
        let properties: Option<String> = row.try_get("properties")?;

        Ok(AuditLogEvent {
            id: row.try_get("id")?,
            version: row.try_get("version")?,
            timestamp: row.try_get("timestamp")?,
            event_type: event_type.parse().map_err(LifecycleError::Serialisation)?,
            properties: properties.as_deref().map(serde_json::from_str).transpose()?,
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

fn stats_json(job: &Job) -> LifecycleResult<Option<String>> {
    Ok(job
        .infrastructure_stats
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?)
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_family_if_not_exists(&self, name: &str) -> LifecycleResult<JobFamily> {
        sqlx::query("INSERT INTO registry_jobfamily (id, name) VALUES (?, ?) ON CONFLICT (name) DO NOTHING")
            .bind(generate_id())
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.find_family(name).await
    }

    async fn find_family(&self, name: &str) -> LifecycleResult<JobFamily> {
        let row = sqlx::query("SELECT id, name FROM registry_jobfamily WHERE name = ?")
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
            "INSERT INTO registry_job ({JOB_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
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
        .bind(serde_json::to_string(&created.replica_internal_names)?)
        .bind(&created.job_type_version)
        .bind(stats_json(&created)?)
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
            "SELECT {JOB_COLUMNS} FROM registry_job WHERE name = ? AND version = ?"
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
            SET family_id = ?, name = ?, version = ?, status = ?, update_time = ?,
                manifest = ?, internal_name = ?, pub_url = ?, error = ?, image_tag = ?,
                deployed_by = ?, last_call_time = ?, infrastructure_target = ?,
                replica_internal_names = ?, job_type_version = ?, infrastructure_stats = ?
            WHERE id = ?
            ",
        )
        .bind(&job.family_id)
        .bind(&job.name)
        .bind(&job.version)
        .bind(job.status.as_str())
        .bind(Utc::now())
        .bind(&job.manifest_yaml)
        .bind(&job.internal_name)
        .bind(&job.pub_url)
        .bind(&job.error)
        .bind(&job.image_tag)
        .bind(&job.deployed_by)
        .bind(job.last_call_time)
        .bind(&job.infrastructure_target)
        .bind(serde_json::to_string(&job.replica_internal_names)?)
        .bind(&job.job_type_version)
        .bind(stats_json(job)?)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;

        expect_single_row(
            result.rows_affected(),
            format!("job {} v{}", job.name, job.version),
        )
    }

    async fn list_jobs(&self, filter: &JobFilter) -> LifecycleResult<Vec<Job>> {
        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM registry_job WHERE 1=1"));
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
            JobOrder::RecentlyUpdated => " ORDER BY julianday(update_time) DESC",
        });

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn delete_job(&self, name: &str, version: &str) -> LifecycleResult<()> {
        let result = sqlx::query("DELETE FROM registry_job WHERE name = ? AND version = ?")
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
            "INSERT INTO registry_deployment ({DEPLOYMENT_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
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
            "SELECT {DEPLOYMENT_COLUMNS} FROM registry_deployment WHERE id = ?"
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
            SET status = ?, update_time = ?, manifest = ?, error = ?, job_name = ?,
                job_version = ?, deployed_by = ?, build_logs = ?, phase = ?, image_name = ?,
                infrastructure_target = ?, warnings = ?
            WHERE id = ?
            ",
        )
        .bind(deployment.status.as_str())
        .bind(Utc::now())
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
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM registry_deployment WHERE 1=1"
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
            query
                .push(" AND julianday(update_time) < julianday(")
                .push_bind(before)
                .push(")");
        }
        if let Some(since) = filter.updated_since {
            query
                .push(" AND julianday(update_time) >= julianday(")
                .push_bind(since)
                .push(")");
        }
        query.push(" ORDER BY julianday(create_time) DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn append_audit_event(&self, event: &AuditLogEvent) -> LifecycleResult<()> {
        let properties = event
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(&format!(
            "INSERT INTO registry_auditlogevent ({AUDIT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&event.id)
        .bind(event.version)
        .bind(event.timestamp)
        .bind(event.event_type.as_str())
        .bind(properties)
        .bind(&event.username_executor)
        .bind(&event.username_subject)
        .bind(&event.job_name)
        .bind(&event.job_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit_events(&self, filter: &AuditFilter) -> LifecycleResult<Vec<AuditLogEvent>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {AUDIT_COLUMNS} FROM registry_auditlogevent WHERE 1=1"
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
            .push(" ORDER BY julianday(timestamp) DESC LIMIT ")
            .push_bind(i64::from(AUDIT_QUERY_LIMIT));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_audit).collect()
    }

    async fn ping(&self) -> LifecycleResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::older_than;
    use crate::types::{AuditLogEventType, DeploymentStatus, JobKey};

    #[tokio::test]
    async fn job_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let family = store.create_family_if_not_exists("adder").await.unwrap();

        let mut job = Job::new("adder", "1.0.0");
        job.family_id = family.id;
        job.manifest_yaml = Some("name: adder\nversion: 1.0.0\n# trailing comment\n".to_owned());
        job.replica_internal_names = vec!["pod-a:7000".to_owned(), "pod-b:7000".to_owned()];
        job.infrastructure_stats = Some(serde_json::json!({"restarts": 2}));
        let created = store.create_job(&job).await.unwrap();

        let found = store.find_job("adder", "1.0.0").await.unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.manifest_yaml, job.manifest_yaml);
        assert_eq!(found.replica_internal_names, job.replica_internal_names);
        assert_eq!(found.infrastructure_stats, job.infrastructure_stats);
        assert_eq!(found.status, JobStatus::Created);
    }

    #[tokio::test]
    async fn duplicate_job_is_already_exists() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_job(&Job::new("adder", "1")).await.unwrap();
        let err = store.create_job(&Job::new("adder", "1")).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.find_job("x", "1").await.unwrap_err().is_not_found());
        assert!(store.delete_job("x", "1").await.unwrap_err().is_not_found());
        assert!(store
            .find_deployment(&DeploymentId::new("nope"))
            .await
            .unwrap_err()
            .is_not_found());

        let mut ghost = Job::new("x", "1");
        ghost.id = "ghost".to_owned();
        assert!(matches!(
            store.update_job(&ghost).await.unwrap_err(),
            LifecycleError::NoRowsAffected(_)
        ));
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("registry.db").display()),
            ..DatabaseConfig::default()
        };

        {
            let store = SqliteStore::connect(&config).await.unwrap();
            store.create_job(&Job::new("adder", "1")).await.unwrap();
        }

        let reopened = SqliteStore::connect(&config).await.unwrap();
        assert_eq!(reopened.find_job("adder", "1").await.unwrap().name, "adder");
    }

    #[tokio::test]
    async fn stale_deployments_are_selected_by_age() {
        let store = SqliteStore::in_memory().await.unwrap();
        let key = JobKey::new("adder", "1");

        let mut stale = Deployment::new(&key, "name: adder", None, None);
        stale.update_time = Utc::now() - chrono::Duration::days(2);
        let fresh = Deployment::new(&key, "name: adder", None, None);
        store.create_deployment(&stale).await.unwrap();
        store.create_deployment(&fresh).await.unwrap();

        let found = store
            .list_deployments(
                &DeploymentFilter::new()
                    .with_status(DeploymentStatus::InProgress)
                    .updated_before(older_than(Duration::from_secs(24 * 3600))),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);
    }

    #[tokio::test]
    async fn audit_filter_by_job() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut event = AuditLogEvent::new(AuditLogEventType::JobDeployed);
        event.job_name = Some("adder".to_owned());
        event.job_version = Some("1".to_owned());
        event.properties = Some(serde_json::json!({"infrastructure_target": "docker"}));
        store.append_audit_event(&event).await.unwrap();
        store
            .append_audit_event(&AuditLogEvent::new(AuditLogEventType::JobDeleted))
            .await
            .unwrap();

        let filter = AuditFilter {
            job_name: Some("adder".to_owned()),
            ..AuditFilter::default()
        };
        let events = store.list_audit_events(&filter).await.unwrap();
        assert_eq!(events, vec![event]);
    }
}
