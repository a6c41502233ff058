//! In-memory job registry for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{LifecycleError, LifecycleResult};
use crate::types::{generate_id, AuditLogEvent, Deployment, DeploymentId, Job, JobFamily};

use super::{
    deployment_not_found, expect_single_row, family_not_found, job_not_found, AuditFilter,
    DeploymentFilter, JobFilter, JobOrder, JobStore, AUDIT_QUERY_LIMIT,
};

/// In-memory job registry.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    families: RwLock<HashMap<String, JobFamily>>,
    jobs: RwLock<HashMap<String, Job>>,
    deployments: RwLock<HashMap<String, Deployment>>,
    audit: RwLock<Vec<AuditLogEvent>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> LifecycleError {
    LifecycleError::internal("lock poisoned")
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_family_if_not_exists(&self, name: &str) -> LifecycleResult<JobFamily> {
        let mut families = self.families.write().map_err(poisoned)?;
        Ok(families
            .entry(name.to_owned())
            .or_insert_with(|| JobFamily::new(name))
            .clone())
    }

    async fn find_family(&self, name: &str) -> LifecycleResult<JobFamily> {
        let families = self.families.read().map_err(poisoned)?;
        families
            .get(name)
            .cloned()
            .ok_or_else(|| family_not_found(name))
    }

    async fn list_families(&self) -> LifecycleResult<Vec<JobFamily>> {
        let families = self.families.read().map_err(poisoned)?;
        let mut results: Vec<_> = families.values().cloned().collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }

    async fn create_job(&self, job: &Job) -> LifecycleResult<Job> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;

        if jobs
            .values()
            .any(|j| j.name == job.name && j.version == job.version)
        {
            return Err(LifecycleError::AlreadyExists(format!(
                "job {} v{} already exists",
                job.name, job.version
            )));
        }

        let mut created = job.clone();
        if created.id.is_empty() {
            created.id = generate_id();
        }
        created.update_time = Utc::now();
        jobs.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn find_job(&self, name: &str, version: &str) -> LifecycleResult<Job> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        jobs.values()
            .find(|j| j.name == name && j.version == version)
            .cloned()
            .ok_or_else(|| job_not_found(name, version))
    }

    async fn update_job(&self, job: &Job) -> LifecycleResult<()> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let Some(record) = jobs.get_mut(&job.id) else {
            return expect_single_row(0, format!("job {} v{}", job.name, job.version));
        };
        *record = job.clone();
        record.update_time = Utc::now();
        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> LifecycleResult<Vec<Job>> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut results: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        match filter.order {
            JobOrder::NameVersion => results.sort_by(|a, b| {
                a.name
                    .cmp(&b.name)
                    .then_with(|| a.version.cmp(&b.version))
            }),
            JobOrder::RecentlyUpdated => {
                results.sort_by(|a, b| b.update_time.cmp(&a.update_time));
            }
        }
        Ok(results)
    }

    async fn delete_job(&self, name: &str, version: &str) -> LifecycleResult<()> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let id = jobs
            .values()
            .find(|j| j.name == name && j.version == version)
            .map(|j| j.id.clone())
            .ok_or_else(|| job_not_found(name, version))?;
        jobs.remove(&id);
        Ok(())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> LifecycleResult<()> {
        let mut deployments = self.deployments.write().map_err(poisoned)?;
        let key = deployment.id.as_str().to_owned();
        if deployments.contains_key(&key) {
            return Err(LifecycleError::AlreadyExists(format!(
                "deployment {key} already exists"
            )));
        }
        deployments.insert(key, deployment.clone());
        Ok(())
    }

    async fn find_deployment(&self, id: &DeploymentId) -> LifecycleResult<Deployment> {
        let deployments = self.deployments.read().map_err(poisoned)?;
        deployments
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| deployment_not_found(id))
    }

    async fn update_deployment(&self, deployment: &Deployment) -> LifecycleResult<()> {
        let mut deployments = self.deployments.write().map_err(poisoned)?;
        let Some(record) = deployments.get_mut(deployment.id.as_str()) else {
            return expect_single_row(0, format!("deployment {}", deployment.id));
        };
        *record = deployment.clone();
        record.update_time = Utc::now();
        Ok(())
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> LifecycleResult<Vec<Deployment>> {
        let deployments = self.deployments.read().map_err(poisoned)?;
        let mut results: Vec<_> = deployments
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        if let Some(limit) = filter.limit {
            results.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(results)
    }

    async fn append_audit_event(&self, event: &AuditLogEvent) -> LifecycleResult<()> {
        let mut audit = self.audit.write().map_err(poisoned)?;
        audit.push(event.clone());
        Ok(())
    }

    async fn list_audit_events(&self, filter: &AuditFilter) -> LifecycleResult<Vec<AuditLogEvent>> {
        let audit = self.audit.read().map_err(poisoned)?;
        let mut results: Vec<_> = audit.iter().filter(|e| filter.matches(e)).cloned().collect();
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        results.truncate(usize::try_from(AUDIT_QUERY_LIMIT).unwrap_or(usize::MAX));
        Ok(results)
    }

    async fn ping(&self) -> LifecycleResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{AuditLogEventType, DeploymentStatus, JobKey, JobStatus};

    #[tokio::test]
    async fn job_round_trip_keeps_manifest_bytes() {
        let store = MemoryStore::new();
        let family = store.create_family_if_not_exists("adder").await.unwrap();

        let mut job = Job::new("adder", "1.0.0");
        job.family_id = family.id.clone();
        job.manifest_yaml = Some("name: adder\nversion: '1.0.0'   # keep me\n".to_owned());
        let created = store.create_job(&job).await.unwrap();
        assert!(!created.id.is_empty());

        let found = store.find_job("adder", "1.0.0").await.unwrap();
        assert_eq!(found, created);
    }

    #[tokio::test]
    async fn duplicate_job_is_rejected() {
        let store = MemoryStore::new();
        store.create_job(&Job::new("adder", "1")).await.unwrap();
        let err = store.create_job(&Job::new("adder", "1")).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn family_creation_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.create_family_if_not_exists("adder").await.unwrap();
        let second = store.create_family_if_not_exists("adder").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_families().await.unwrap().len(), 1);
        assert!(store.find_family("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_of_missing_job_affects_no_rows() {
        let store = MemoryStore::new();
        let mut job = Job::new("adder", "1");
        job.id = "missing".to_owned();
        let err = store.update_job(&job).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NoRowsAffected(_)));
    }

    #[tokio::test]
    async fn update_refreshes_update_time() {
        let store = MemoryStore::new();
        let mut job = store.create_job(&Job::new("adder", "1")).await.unwrap();
        let before = job.update_time;
        job.status = JobStatus::Running;
        store.update_job(&job).await.unwrap();

        let found = store.find_job("adder", "1").await.unwrap();
        assert_eq!(found.status, JobStatus::Running);
        assert!(found.update_time >= before);
    }

    #[tokio::test]
    async fn delete_twice_is_not_found() {
        let store = MemoryStore::new();
        store.create_job(&Job::new("adder", "1")).await.unwrap();
        store.delete_job("adder", "1").await.unwrap();
        let err = store.delete_job("adder", "1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn deployments_filter_by_status_and_job() {
        let store = MemoryStore::new();
        let key = JobKey::new("adder", "1");
        let running = Deployment::new(&key, "name: adder", None, None);
        let mut failed = Deployment::new(&key, "name: adder", None, None);
        failed.status = DeploymentStatus::Failed;
        store.create_deployment(&running).await.unwrap();
        store.create_deployment(&failed).await.unwrap();

        let in_progress = store
            .list_deployments(
                &DeploymentFilter::new()
                    .with_status(DeploymentStatus::InProgress)
                    .with_job("adder", "1"),
            )
            .await
            .unwrap();
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].id, running.id);
    }

    #[tokio::test]
    async fn audit_matches_executor_or_subject() {
        let store = MemoryStore::new();
        let mut by_alice = AuditLogEvent::new(AuditLogEventType::JobDeployed);
        by_alice.username_executor = Some("alice".to_owned());
        let mut about_alice = AuditLogEvent::new(AuditLogEventType::JobRedeployed);
        about_alice.username_executor = Some("bob".to_owned());
        about_alice.username_subject = Some("alice".to_owned());
        let mut unrelated = AuditLogEvent::new(AuditLogEventType::JobDeleted);
        unrelated.username_executor = Some("carol".to_owned());

        for event in [&by_alice, &about_alice, &unrelated] {
            store.append_audit_event(event).await.unwrap();
        }

        let filter = AuditFilter {
            username: Some("alice".to_owned()),
            ..AuditFilter::default()
        };
        let events = store.list_audit_events(&filter).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.username_executor.as_deref() != Some("carol")));
    }

    #[tokio::test]
    async fn audit_is_capped() {
        let store = MemoryStore::new();
        for _ in 0..120 {
            store
                .append_audit_event(&AuditLogEvent::new(AuditLogEventType::JobDeployed))
                .await
                .unwrap();
        }
        let events = store.list_audit_events(&AuditFilter::default()).await.unwrap();
        assert_eq!(events.len(), 100);
    }
}
