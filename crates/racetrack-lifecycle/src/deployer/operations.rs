//! Operations on already deployed jobs.

use tracing::{info, warn};

use super::{record_phase, DeploymentLease, DeploymentManager};
use crate::error::{LifecycleError, LifecycleResult, ResultExt};
use crate::infrastructure::JobSecrets;
use crate::manifest::Manifest;
use crate::monitor::read_recent_logs;
use crate::types::{AuditLogEvent, AuditLogEventType, Deployment, DeploymentStatus, Job, JobStatus};

/// Username the platform acts as when healing jobs on its own.
pub const SYSTEM_USERNAME: &str = "racetrack";

impl DeploymentManager {
    /// Rebuild and provision a job again from its stored manifest, reusing its secrets.
    pub async fn redeploy_job(&self, name: &str, version: &str, username: Option<&str>) -> LifecycleResult<Job> {
        let job = self.registry.read_job(name, version).await?;
        let manifest = stored_manifest(&job)?;
        self.check_permissions(username, &manifest).await?;

        let target = current_target(&job)?;
        let (deployment, _lease) = self.track(&job, &manifest, username, target, "redeploy").await?;
        let outcome = async {
            let secrets = self.retrieve_job_secrets(&job).await?;
            self.build_and_provision(&deployment, &manifest, &secrets, None, &[], Some(&job))
                .await
                .context("redeploying job")
        }
        .await;
        self.finish(&deployment, outcome).await
    }

    /// Provision the already built image of a job again.
    pub async fn reprovision_job(&self, name: &str, version: &str, username: Option<&str>) -> LifecycleResult<Job> {
        let job = self.registry.read_job(name, version).await?;
        let manifest = stored_manifest(&job)?;
        self.check_permissions(username, &manifest).await?;
        self.reprovision(&job, &manifest, username).await
    }

    /// Provision a lost job again as the platform itself.
    pub async fn reprovision_lost_job(&self, job: &Job) -> LifecycleResult<Job> {
        let manifest = stored_manifest(job)?;
        self.reprovision(job, &manifest, Some(SYSTEM_USERNAME)).await
    }

    async fn reprovision(&self, job: &Job, manifest: &Manifest, username: Option<&str>) -> LifecycleResult<Job> {
        let tag = job
            .image_tag
            .clone()
            .ok_or_else(|| LifecycleError::validation("latest image tag is unknown"))?;
        let target = current_target(job)?;
        let (deployment, _lease) = self.track(job, manifest, username, target, "reprovision").await?;
        let outcome = async {
            let secrets = self.runtime_secrets(job, manifest).await?;
            self.provision(&deployment, manifest, &tag, &secrets, Some(job))
                .await
                .context("reprovisioning job")
        }
        .await;
        self.finish(&deployment, outcome).await
    }

    /// Move a job to another infrastructure target.
    ///
    /// The job is provisioned on the new target first and removed from the
    /// former one afterwards.
    pub async fn move_job(
        &self,
        name: &str,
        version: &str,
        new_target: &str,
        username: Option<&str>,
    ) -> LifecycleResult<Job> {
        let job = self.registry.read_job(name, version).await?;
        let manifest = stored_manifest(&job)?;
        let tag = job
            .image_tag
            .clone()
            .ok_or_else(|| LifecycleError::validation("job's image tag is unknown"))?;
        if new_target.is_empty() {
            return Err(LifecycleError::validation("infrastructure target has to be specified"));
        }
        let old_target = current_target(&job)?.to_owned();
        if new_target == old_target {
            return Err(LifecycleError::validation(
                "new infrastructure target has to be different from the current one",
            ));
        }
        self.targets().get(new_target)?;
        self.check_permissions(username, &manifest).await?;

        let (deployment, _lease) = self.track(&job, &manifest, username, new_target, "move").await?;
        let outcome = async {
            let secrets = self.runtime_secrets(&job, &manifest).await?;
            let moved = self
                .provision(&deployment, &manifest, &tag, &secrets, None)
                .await
                .context("deploying job to a new infrastructure")?;

            async {
                record_phase(&self.registry, &deployment.id, "deleting job from a former infrastructure").await;
                self.decommission(name, version, &old_target, username).await
            }
            .await
            .context("deleting job from a former infrastructure")?;

            self.audit
                .log_event(
                    AuditLogEvent::new(AuditLogEventType::JobMoved)
                        .executor(username)
                        .subject(job.deployed_by.as_deref())
                        .job(name, version),
                )
                .await?;
            info!(job_name = %name, job_version = %version, from = %old_target, to = %new_target, "job moved");
            Ok::<_, LifecycleError>(moved)
        }
        .await;
        self.finish(&deployment, outcome).await
    }

    /// Delete a job from its infrastructure and from the registry.
    ///
    /// Lost jobs have nothing left on the infrastructure and are only
    /// unregistered.
    pub async fn delete_job(&self, name: &str, version: &str, username: Option<&str>) -> LifecycleResult<()> {
        let job = self.registry.read_job(name, version).await?;
        let _lease = self.leases.acquire(&job.key(), "delete")?;

        if job.status != JobStatus::Lost {
            let target = self.targets().get(current_target(&job)?)?;
            target.deployer()?.delete(name, version).await?;
        }
        self.audit
            .log_event(
                AuditLogEvent::new(AuditLogEventType::JobDeleted)
                    .executor(username)
                    .subject(job.deployed_by.as_deref())
                    .job(name, version),
            )
            .await?;
        self.registry.delete_job(name, version).await?;
        self.plugins.post_job_delete(&job, username).await?;

        info!(job_name = %name, job_version = %version, "job deleted");
        Ok(())
    }

    /// Remove a job from one infrastructure target, keeping its record.
    async fn decommission(
        &self,
        name: &str,
        version: &str,
        target: &str,
        username: Option<&str>,
    ) -> LifecycleResult<()> {
        let job = self.registry.read_job(name, version).await?;
        if job.status != JobStatus::Lost {
            self.targets().get(target)?.deployer()?.delete(name, version).await?;
        }
        self.audit
            .log_event(
                AuditLogEvent::new(AuditLogEventType::JobDeleted)
                    .executor(username)
                    .subject(job.deployed_by.as_deref())
                    .job(name, version),
            )
            .await?;
        self.plugins.post_job_delete(&job, username).await
    }

    /// Recent runtime output of a job; the version may be an alias.
    pub async fn read_runtime_logs(&self, name: &str, version: &str, tail: usize) -> LifecycleResult<String> {
        let job = self.registry.read_versioned_job(name, version).await?;
        read_recent_logs(self.targets(), &job, tail).await
    }

    /// Build output of the latest deployment of a job; the version may be an alias.
    pub async fn read_build_logs(&self, name: &str, version: &str, tail: usize) -> LifecycleResult<String> {
        self.registry.read_build_logs(name, version, tail).await
    }

    async fn track(
        &self,
        job: &Job,
        manifest: &Manifest,
        username: Option<&str>,
        target: &str,
        operation: &str,
    ) -> LifecycleResult<(Deployment, DeploymentLease)> {
        let lease = self.leases.acquire(&job.key(), operation)?;
        let manifest_yaml = match &job.manifest_yaml {
            Some(yaml) => yaml.clone(),
            None => serde_yaml::to_string(manifest)?,
        };
        let deployment = self
            .registry
            .create_deployment(
                &job.key(),
                &manifest_yaml,
                username,
                target,
                self.config.deployment.concurrent_deployment_window,
            )
            .await?;
        info!(deployment_id = %deployment.id, job_name = %job.name, job_version = %job.version, operation, "deployment started");
        Ok((deployment, lease))
    }

    async fn finish(&self, deployment: &Deployment, outcome: LifecycleResult<Job>) -> LifecycleResult<Job> {
        let saved = match &outcome {
            Ok(_) => {
                self.registry
                    .save_deployment_result(&deployment.id, DeploymentStatus::Done, None)
                    .await
            }
            Err(e) => {
                self.registry
                    .save_deployment_result(&deployment.id, DeploymentStatus::Failed, Some(&e.to_string()))
                    .await
            }
        };
        if let Err(e) = saved {
            warn!(deployment_id = %deployment.id, error = %e, "failed to save deployment result");
        }
        if let Err(e) = &outcome {
            self.mark_job_failed(&deployment.job_name, &deployment.job_version, e)
                .await;
        }
        outcome
    }

    async fn retrieve_job_secrets(&self, job: &Job) -> LifecycleResult<JobSecrets> {
        async {
            let target_name = current_target(job)?;
            let target = self.targets().get(target_name)?;
            match target.deployer()?.get_secrets(&job.name, &job.version).await {
                Err(e) if matches!(e.root_cause(), LifecycleError::Unsupported(_)) => {
                    warn!("managing secrets is not supported on {target_name}");
                    Ok(JobSecrets::default())
                }
                secrets => secrets,
            }
        }
        .await
        .context("retrieving job secrets")
    }

    async fn runtime_secrets(&self, job: &Job, manifest: &Manifest) -> LifecycleResult<JobSecrets> {
        if manifest.secret_runtime_env_file.is_some() {
            self.retrieve_job_secrets(job).await
        } else {
            Ok(JobSecrets::default())
        }
    }
}

fn stored_manifest(job: &Job) -> LifecycleResult<Manifest> {
    let yaml = job.manifest_yaml.as_deref().ok_or_else(|| {
        LifecycleError::validation(format!(
            "job {} v{} doesn't have Manifest data specified",
            job.name, job.version
        ))
    })?;
    Manifest::from_yaml(yaml)
}

fn current_target(job: &Job) -> LifecycleResult<&str> {
    job.infrastructure_target
        .as_deref()
        .filter(|target| !target.is_empty())
        .ok_or_else(|| {
            LifecycleError::validation(format!(
                "job {} v{} has no infrastructure target",
                job.name, job.version
            ))
        })
}
