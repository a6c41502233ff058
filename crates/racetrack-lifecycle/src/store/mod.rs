//! Job registry storage backends.
//!
//! The registry persists job families, jobs, deployments and audit events
//! behind one [`JobStore`] trait. Two durable backends are provided: an
//! embedded SQLite file and a PostgreSQL server. An in-memory
//! implementation is provided for testing and local runs.
//!
//! Contracts shared by every backend:
//! - `create_*` assigns a generated ID when the record has none.
//! - `update_*` must match exactly one row; zero rows is
//!   [`LifecycleError::NoRowsAffected`], more is
//!   [`LifecycleError::TooManyRowsAffected`]. `update_time` is refreshed.
//! - `find_*` returns [`LifecycleError::EntityNotFound`] for a missing record,
//!   distinct from backend errors.

mod memory;
mod postgres;
mod sqlite;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::{LifecycleError, LifecycleResult, ResultExt};
use crate::types::{
    AuditLogEvent, Deployment, DeploymentId, DeploymentStatus, Job, JobFamily, JobStatus,
};

/// Maximum number of audit events returned by one query.
pub const AUDIT_QUERY_LIMIT: u32 = 100;

/// Ordering of job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobOrder {
    /// By name, then version.
    #[default]
    NameVersion,
    /// Most recently updated first.
    RecentlyUpdated,
}

/// Filter criteria for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Filter by job name.
    pub name: Option<String>,
    /// Filter by status.
    pub status: Option<JobStatus>,
    /// Filter by infrastructure target.
    pub infrastructure_target: Option<String>,
    /// Result ordering.
    pub order: JobOrder,
}

impl JobFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            name: None,
            status: None,
            infrastructure_target: None,
            order: JobOrder::NameVersion,
        }
    }

    /// Filter by job name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by infrastructure target.
    #[must_use]
    pub fn with_infrastructure_target(mut self, target: impl Into<String>) -> Self {
        self.infrastructure_target = Some(target.into());
        self
    }

    /// Set result ordering.
    #[must_use]
    pub const fn ordered_by(mut self, order: JobOrder) -> Self {
        self.order = order;
        self
    }

    pub(crate) fn matches(&self, job: &Job) -> bool {
        self.name.as_ref().map_or(true, |n| &job.name == n)
            && self.status.map_or(true, |s| job.status == s)
            && self
                .infrastructure_target
                .as_ref()
                .map_or(true, |t| job.infrastructure_target.as_ref() == Some(t))
    }
}

/// Filter criteria for listing deployments.
///
/// Results are ordered by `create_time` descending (newest first).
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Filter by job name.
    pub job_name: Option<String>,
    /// Filter by job version.
    pub job_version: Option<String>,
    /// Only deployments updated strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    /// Only deployments updated at or after this instant.
    pub updated_since: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: None,
            job_name: None,
            job_version: None,
            updated_before: None,
            updated_since: None,
            limit: None,
        }
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by job name and version.
    #[must_use]
    pub fn with_job(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self.job_version = Some(version.into());
        self
    }

    /// Only deployments last updated before `instant`.
    #[must_use]
    pub const fn updated_before(mut self, instant: DateTime<Utc>) -> Self {
        self.updated_before = Some(instant);
        self
    }

    /// Only deployments last updated at or after `instant`.
    #[must_use]
    pub const fn updated_since(mut self, instant: DateTime<Utc>) -> Self {
        self.updated_since = Some(instant);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn matches(&self, d: &Deployment) -> bool {
        self.status.map_or(true, |s| d.status == s)
            && self.job_name.as_ref().map_or(true, |n| &d.job_name == n)
            && self
                .job_version
                .as_ref()
                .map_or(true, |v| &d.job_version == v)
            && self.updated_before.map_or(true, |t| d.update_time < t)
            && self.updated_since.map_or(true, |t| d.update_time >= t)
    }
}

/// Filter criteria for audit log queries.
///
/// Results are ordered newest first and capped at [`AUDIT_QUERY_LIMIT`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Matches either the executor or the subject username.
    pub username: Option<String>,
    /// Filter by job name.
    pub job_name: Option<String>,
    /// Filter by job version.
    pub job_version: Option<String>,
}

impl AuditFilter {
    pub(crate) fn matches(&self, e: &AuditLogEvent) -> bool {
        self.username.as_ref().map_or(true, |u| {
            e.username_executor.as_ref() == Some(u) || e.username_subject.as_ref() == Some(u)
        }) && self
            .job_name
            .as_ref()
            .map_or(true, |n| e.job_name.as_ref() == Some(n))
            && self
                .job_version
                .as_ref()
                .map_or(true, |v| e.job_version.as_ref() == Some(v))
    }
}

/// Backend for the job registry.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Get the family with the given name, creating it when absent.
    async fn create_family_if_not_exists(&self, name: &str) -> LifecycleResult<JobFamily>;

    /// Find a family by name.
    async fn find_family(&self, name: &str) -> LifecycleResult<JobFamily>;

    /// List all families ordered by name.
    async fn list_families(&self) -> LifecycleResult<Vec<JobFamily>>;

    /// Insert a job record, returning it with its assigned ID.
    ///
    /// Fails with [`LifecycleError::AlreadyExists`] if the `(name, version)` is taken.
    async fn create_job(&self, job: &Job) -> LifecycleResult<Job>;

    /// Find a job by name and version.
    async fn find_job(&self, name: &str, version: &str) -> LifecycleResult<Job>;

    /// Overwrite a job record identified by its ID.
    async fn update_job(&self, job: &Job) -> LifecycleResult<()>;

    /// List jobs matching the filter.
    async fn list_jobs(&self, filter: &JobFilter) -> LifecycleResult<Vec<Job>>;

    /// Delete a job by name and version.
    async fn delete_job(&self, name: &str, version: &str) -> LifecycleResult<()>;

    /// Insert a deployment record.
    async fn create_deployment(&self, deployment: &Deployment) -> LifecycleResult<()>;

    /// Find a deployment by ID.
    async fn find_deployment(&self, id: &DeploymentId) -> LifecycleResult<Deployment>;

    /// Overwrite a deployment record identified by its ID.
    async fn update_deployment(&self, deployment: &Deployment) -> LifecycleResult<()>;

    /// List deployments matching the filter, newest first.
    async fn list_deployments(&self, filter: &DeploymentFilter)
        -> LifecycleResult<Vec<Deployment>>;

    /// Append an audit event.
    async fn append_audit_event(&self, event: &AuditLogEvent) -> LifecycleResult<()>;

    /// Query audit events, newest first, capped at [`AUDIT_QUERY_LIMIT`].
    async fn list_audit_events(&self, filter: &AuditFilter) -> LifecycleResult<Vec<AuditLogEvent>>;

    /// Check the backend is reachable.
    async fn ping(&self) -> LifecycleResult<()>;
}

/// Check that an update touched exactly one row.
pub(crate) fn expect_single_row(affected: u64, what: impl Into<String>) -> LifecycleResult<()> {
    match affected {
        1 => Ok(()),
        0 => Err(LifecycleError::NoRowsAffected(what.into())),
        affected => Err(LifecycleError::TooManyRowsAffected {
            what: what.into(),
            affected,
        }),
    }
}

/// Instant `age` before now, saturating at the earliest representable time.
#[must_use]
pub fn older_than(age: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn job_not_found(name: &str, version: &str) -> LifecycleError {
    LifecycleError::not_found(format!("job {name} v{version} not found"))
}

pub(crate) fn family_not_found(name: &str) -> LifecycleError {
    LifecycleError::not_found(format!("job family {name} not found"))
}

pub(crate) fn deployment_not_found(id: &DeploymentId) -> LifecycleError {
    LifecycleError::not_found(format!("deployment {id} not found"))
}

/// Open the store selected by configuration.
///
/// A backend that can't be opened fails startup, unless
/// `fallback_to_memory` is set; the in-memory store then keeps the service
/// running without durable records.
pub async fn open_store(config: &DatabaseConfig) -> LifecycleResult<Arc<dyn JobStore>> {
    let opened: LifecycleResult<Arc<dyn JobStore>> = match config.backend {
        DatabaseBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        DatabaseBackend::Sqlite => SqliteStore::connect(config)
            .await
            .map(|s| Arc::new(s) as Arc<dyn JobStore>),
        DatabaseBackend::Postgres => PostgresStore::connect(config)
            .await
            .map(|s| Arc::new(s) as Arc<dyn JobStore>),
    };

    match opened {
        Ok(store) => {
            info!(backend = ?config.backend, "job registry opened");
            Ok(store)
        }
        Err(e) if config.fallback_to_memory => {
            error!(
                backend = ?config.backend,
                error = %e,
                "failed to open job registry, records will be lost on restart"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
        Err(e) => Err(e).context("opening job registry"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn unreachable_sqlite(dir: &tempfile::TempDir) -> DatabaseConfig {
        DatabaseConfig {
            backend: DatabaseBackend::Sqlite,
            url: format!("sqlite://{}", dir.path().join("missing/racetrack.db").display()),
            connect_timeout_secs: 1,
            ..DatabaseConfig::default()
        }
    }

    #[tokio::test]
    async fn unreachable_backend_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_store(&unreachable_sqlite(&dir)).await.err().unwrap();
        assert!(err.to_string().starts_with("opening job registry"), "{err}");
    }

    #[tokio::test]
    async fn memory_fallback_is_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            fallback_to_memory: true,
            ..unreachable_sqlite(&dir)
        };
        let store = open_store(&config).await.unwrap();
        assert!(store.list_families().await.unwrap().is_empty());
    }

    #[test]
    fn older_than_saturates() {
        assert_eq!(older_than(std::time::Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
