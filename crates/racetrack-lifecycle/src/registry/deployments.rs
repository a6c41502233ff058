//! Deployment attempt records.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::store::{older_than, DeploymentFilter};
use crate::types::{Deployment, DeploymentId, DeploymentStatus, JobKey};

use super::JobRegistry;

/// Marker appended to build logs cut down to the storage limit.
pub const BUILD_LOGS_TRUNCATED: &str = "\n[build logs truncated]";

/// Error recorded on deployments abandoned by a previous process.
pub(crate) const HALTED_BY_RESTART: &str = "halted due to server restart";

impl JobRegistry {
    /// Record a new deployment attempt in progress.
    ///
    /// Fails with a conflict when another attempt for the same job was
    /// active within `window`.
    pub async fn create_deployment(
        &self,
        key: &JobKey,
        manifest_yaml: &str,
        deployed_by: Option<&str>,
        infrastructure_target: &str,
        window: Duration,
    ) -> LifecycleResult<Deployment> {
        self.check_for_concurrent_deployments(key, window).await?;

        let deployment = Deployment::new(
            key,
            manifest_yaml,
            deployed_by.map(str::to_owned),
            Some(infrastructure_target.to_owned()),
        );
        self.store().create_deployment(&deployment).await?;
        Ok(deployment)
    }

    async fn check_for_concurrent_deployments(
        &self,
        key: &JobKey,
        window: Duration,
    ) -> LifecycleResult<()> {
        let filter = DeploymentFilter::new()
            .with_status(DeploymentStatus::InProgress)
            .with_job(&key.name, &key.version)
            .updated_since(older_than(window))
            .with_limit(1);
        match self.store().list_deployments(&filter).await?.first() {
            Some(ongoing) => Err(LifecycleError::conflict(format!(
                "There's already ongoing deployment of job {} {}, recently updated at {}",
                key.name, key.version, ongoing.update_time
            ))),
            None => Ok(()),
        }
    }

    /// Deployment by ID.
    pub async fn find_deployment(&self, id: &DeploymentId) -> LifecycleResult<Deployment> {
        self.store().find_deployment(id).await
    }

    /// Most recently started deployments.
    pub async fn list_recent_deployments(&self, limit: u32) -> LifecycleResult<Vec<Deployment>> {
        self.store()
            .list_deployments(&DeploymentFilter::new().with_limit(limit))
            .await
    }

    /// Store the terminal status of a deployment.
    ///
    /// Success clears the error and the phase.
    pub async fn save_deployment_result(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> LifecycleResult<()> {
        let mut deployment = self.find_deployment(id).await?;
        deployment.status = status;
        match error {
            Some(error) => deployment.error = Some(error.to_owned()),
            None => {
                deployment.error = None;
                deployment.phase = None;
            }
        }
        self.store().update_deployment(&deployment).await
    }

    /// Store the pipeline phase a deployment entered.
    pub async fn save_deployment_phase(&self, id: &DeploymentId, phase: &str) -> LifecycleResult<()> {
        let mut deployment = self.find_deployment(id).await?;
        deployment.phase = Some(phase.to_owned());
        self.store().update_deployment(&deployment).await
    }

    /// Append warnings to a deployment, one block per call.
    pub async fn save_deployment_warnings(
        &self,
        id: &DeploymentId,
        warnings: &str,
    ) -> LifecycleResult<()> {
        let mut deployment = self.find_deployment(id).await?;
        deployment.warnings = Some(match deployment.warnings.take() {
            Some(previous) if !previous.is_empty() => format!("{previous}\n{warnings}"),
            _ => warnings.to_owned(),
        });
        self.store().update_deployment(&deployment).await
    }

    /// Store build logs, truncated to `limit` bytes.
    pub async fn save_deployment_build_logs(
        &self,
        id: &DeploymentId,
        logs: &str,
        limit: usize,
    ) -> LifecycleResult<()> {
        let mut deployment = self.find_deployment(id).await?;
        deployment.build_logs = Some(truncate_logs(logs, limit));
        self.store().update_deployment(&deployment).await
    }

    /// Store the name of the image built for a deployment.
    pub async fn save_deployment_image_name(
        &self,
        id: &DeploymentId,
        image_name: &str,
    ) -> LifecycleResult<()> {
        let mut deployment = self.find_deployment(id).await?;
        deployment.image_name = Some(image_name.to_owned());
        self.store().update_deployment(&deployment).await
    }

    /// Fail every deployment left `in_progress` for longer than `age`.
    ///
    /// Returns the number of halted deployments.
    pub async fn halt_stale_deployments(&self, age: Duration) -> LifecycleResult<usize> {
        let filter = DeploymentFilter::new()
            .with_status(DeploymentStatus::InProgress)
            .updated_before(older_than(age));
        let stale = self.store().list_deployments(&filter).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        info!(count = stale.len(), "halting stale in-progress deployments");
        let mut halted = 0;
        for mut deployment in stale {
            deployment.status = DeploymentStatus::Failed;
            deployment.error = Some(HALTED_BY_RESTART.to_owned());
            match self.store().update_deployment(&deployment).await {
                Ok(()) => halted += 1,
                Err(e) => warn!(
                    deployment_id = %deployment.id,
                    error = %e,
                    "failed to halt stale deployment"
                ),
            }
        }
        Ok(halted)
    }

    /// Build logs of the latest deployment of a job; `tail` of 0 returns all lines.
    pub async fn read_build_logs(&self, name: &str, version: &str, tail: usize) -> LifecycleResult<String> {
        let job = self.read_versioned_job(name, version).await?;
        let filter = DeploymentFilter::new().with_job(&job.name, &job.version);
        let latest = self
            .store()
            .list_deployments(&filter)
            .await?
            .into_iter()
            .max_by_key(|d| d.update_time)
            .ok_or_else(|| {
                LifecycleError::not_found(format!("No deployment matching to a job {name}"))
            })?;

        let logs = latest.build_logs.unwrap_or_default();
        Ok(tail_lines(&logs, tail))
    }
}

/// Keep the head of `logs` within `limit` bytes, marking the cut.
#[must_use]
pub(crate) fn truncate_logs(logs: &str, limit: usize) -> String {
    if logs.len() <= limit {
        return logs.to_owned();
    }
    let mut end = limit;
    while !logs.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{BUILD_LOGS_TRUNCATED}", &logs[..end])
}

/// Last `tail` lines of `text`, or all of it when `tail` is 0.
#[must_use]
pub(crate) fn tail_lines(text: &str, tail: usize) -> String {
    if tail == 0 {
        return text.to_owned();
    }
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(tail)..].join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::store::{JobStore, MemoryStore};
    use crate::types::Job;

    const WINDOW: Duration = Duration::from_secs(60);

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn key() -> JobKey {
        JobKey::new("adder", "1.0.0")
    }

    #[tokio::test]
    async fn second_attempt_within_window_conflicts() {
        let registry = registry();
        let first = registry
            .create_deployment(&key(), "name: adder", Some("alice"), "docker", WINDOW)
            .await
            .unwrap();
        let err = registry
            .create_deployment(&key(), "name: adder", Some("bob"), "docker", WINDOW)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));
        assert!(err
            .to_string()
            .starts_with("There's already ongoing deployment of job adder 1.0.0"));

        registry
            .save_deployment_result(&first.id, DeploymentStatus::Done, None)
            .await
            .unwrap();
        registry
            .create_deployment(&key(), "name: adder", Some("bob"), "docker", WINDOW)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn result_phase_and_warnings_are_tracked() {
        let registry = registry();
        let d = registry
            .create_deployment(&key(), "name: adder", None, "docker", WINDOW)
            .await
            .unwrap();

        registry.save_deployment_phase(&d.id, "building image").await.unwrap();
        registry.save_deployment_warnings(&d.id, "deprecated base image").await.unwrap();
        registry.save_deployment_warnings(&d.id, "no tests").await.unwrap();
        registry.save_deployment_image_name(&d.id, "registry/adder:1").await.unwrap();
        let tracked = registry.find_deployment(&d.id).await.unwrap();
        assert_eq!(tracked.phase.as_deref(), Some("building image"));
        assert_eq!(tracked.warnings.as_deref(), Some("deprecated base image\nno tests"));
        assert_eq!(tracked.image_name.as_deref(), Some("registry/adder:1"));

        registry
            .save_deployment_result(&d.id, DeploymentStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let failed = registry.find_deployment(&d.id).await.unwrap();
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(failed.phase.as_deref(), Some("building image"));

        registry
            .save_deployment_result(&d.id, DeploymentStatus::Done, None)
            .await
            .unwrap();
        let done = registry.find_deployment(&d.id).await.unwrap();
        assert!(done.error.is_none());
        assert!(done.phase.is_none());
    }

    #[tokio::test]
    async fn only_old_in_progress_deployments_are_halted() {
        let store = Arc::new(MemoryStore::new());
        let registry = JobRegistry::new(store.clone());

        let mut stale = Deployment::new(&key(), "", None, None);
        stale.update_time = Utc::now() - chrono::Duration::hours(25);
        store.create_deployment(&stale).await.unwrap();
        let fresh = Deployment::new(&JobKey::new("adder", "2.0.0"), "", None, None);
        store.create_deployment(&fresh).await.unwrap();

        let halted = registry
            .halt_stale_deployments(Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(halted, 1);
        let stale = registry.find_deployment(&stale.id).await.unwrap();
        assert_eq!(stale.status, DeploymentStatus::Failed);
        assert_eq!(stale.error.as_deref(), Some("halted due to server restart"));
        assert_eq!(
            registry.find_deployment(&fresh.id).await.unwrap().status,
            DeploymentStatus::InProgress
        );
    }

    #[tokio::test]
    async fn build_logs_are_truncated_and_tailed() {
        let registry = registry();
        registry.save_job(&Job::new("adder", "1.0.0")).await.unwrap();
        let d = registry
            .create_deployment(&key(), "", None, "docker", WINDOW)
            .await
            .unwrap();
        registry
            .save_deployment_build_logs(&d.id, "step 1\nstep 2\nstep 3", 1024)
            .await
            .unwrap();

        assert_eq!(
            registry.read_build_logs("adder", "latest", 2).await.unwrap(),
            "step 2\nstep 3"
        );
        assert_eq!(
            registry.read_build_logs("adder", "1.0.0", 0).await.unwrap(),
            "step 1\nstep 2\nstep 3"
        );

        let truncated = truncate_logs("żółw żółw", 3);
        assert_eq!(truncated, format!("ż{BUILD_LOGS_TRUNCATED}"));
    }
}
