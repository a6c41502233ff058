//! Job registry: jobs, families, deployments and audit events on top of a
//! [`JobStore`] backend.

mod audit;
mod deployments;
mod versions;

pub use audit::AuditLogger;
pub use deployments::BUILD_LOGS_TRUNCATED;
pub use versions::{is_x_pattern, VersionSelector, LATEST};

use std::sync::Arc;

use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};
use crate::store::{JobFilter, JobOrder, JobStore};
use crate::types::{Job, JobFamily};

/// Registry of deployed jobs.
#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
}

impl JobRegistry {
    /// Create a registry backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// All jobs, most recently updated first.
    pub async fn list_jobs(&self) -> LifecycleResult<Vec<Job>> {
        self.store
            .list_jobs(&JobFilter::new().ordered_by(JobOrder::RecentlyUpdated))
            .await
    }

    /// All job families, ordered by name.
    pub async fn list_families(&self) -> LifecycleResult<Vec<JobFamily>> {
        self.store.list_families().await
    }

    /// Job with exactly this name and version.
    pub async fn read_job(&self, name: &str, version: &str) -> LifecycleResult<Job> {
        self.store.find_job(name, version).await
    }

    /// Job by name and a version that may be an alias (`latest`, `1.x`).
    pub async fn read_versioned_job(&self, name: &str, version: &str) -> LifecycleResult<Job> {
        let selector = VersionSelector::parse(version);
        if let VersionSelector::Exact(exact) = selector {
            return self.read_job(name, exact).await;
        }

        let family = self
            .store
            .list_jobs(&JobFilter::new().with_name(name))
            .await?;
        if family.is_empty() {
            return Err(LifecycleError::not_found(format!("No job named {name}")));
        }
        let resolved = selector
            .select(family.iter().map(|job| job.version.as_str()))
            .map(str::to_owned)
            .ok_or_else(|| match &selector {
                VersionSelector::Wildcard(pattern) => LifecycleError::not_found(format!(
                    "Not found any stable version matching pattern: {pattern}"
                )),
                _ => LifecycleError::not_found("No stable version found"),
            })?;
        debug!(job_name = %name, requested = %version, resolved = %resolved, "version alias resolved");

        family
            .into_iter()
            .find(|job| job.version == resolved)
            .ok_or_else(|| LifecycleError::not_found(format!("job {name} v{resolved} not found")))
    }

    /// Whether a job with this name and version is registered.
    pub async fn job_exists(&self, name: &str, version: &str) -> LifecycleResult<bool> {
        exists(self.store.find_job(name, version).await)
    }

    /// Whether a family with this name is registered.
    pub async fn family_exists(&self, name: &str) -> LifecycleResult<bool> {
        exists(self.store.find_family(name).await)
    }

    /// Family with this name, created when missing.
    pub async fn create_job_family_if_not_exist(&self, name: &str) -> LifecycleResult<JobFamily> {
        self.store.create_family_if_not_exists(name).await
    }

    /// Insert the job, or overwrite the registered job of the same name and version.
    ///
    /// Returns the stored record.
    pub async fn save_job(&self, job: &Job) -> LifecycleResult<Job> {
        match self.store.find_job(&job.name, &job.version).await {
            Ok(existing) => {
                let mut updated = job.clone();
                updated.id = existing.id;
                updated.create_time = existing.create_time;
                self.store.update_job(&updated).await?;
                Ok(updated)
            }
            Err(e) if e.is_not_found() => {
                let family = self.create_job_family_if_not_exist(&job.name).await?;
                let mut created = job.clone();
                created.family_id = family.id;
                self.store.create_job(&created).await
            }
            Err(e) => Err(e),
        }
    }

    /// Overwrite a registered job.
    pub async fn update_job(&self, job: &Job) -> LifecycleResult<()> {
        self.store.update_job(job).await
    }

    /// Remove a job record.
    pub async fn delete_job(&self, name: &str, version: &str) -> LifecycleResult<()> {
        self.store.delete_job(name, version).await
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry").finish_non_exhaustive()
    }
}

fn exists<T>(found: LifecycleResult<T>) -> LifecycleResult<bool> {
    match found {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
