//! Build-and-provision pipeline stages.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{info, warn};

use super::{record_phase, DeploymentManager, JobDeploymentRequest, ANONYMOUS};
use crate::builder::BuildRequest;
use crate::error::{LifecycleError, LifecycleResult, ResultExt};
use crate::infrastructure::{deployment_timestamp, DeployRequest, JobSecrets, OnJobAlive};
use crate::manifest::{resolve_resources, verify_manifest_consistency, Manifest, RepositoryManifest};
use crate::monitor::check_job_condition;
use crate::permissions::check_deploy_permissions;
use crate::plugin::manifest_job_type;
use crate::types::{AuditLogEvent, AuditLogEventType, Deployment, Job, JobStatus};

/// Name of the manifest file in a job repository.
const MANIFEST_FILE: &str = "job.yaml";

impl DeploymentManager {
    /// Validate a new deployment, save its secrets, then build and provision it.
    pub(super) async fn deploy_new_job(
        &self,
        deployment: &Deployment,
        manifest: &Manifest,
        request: &JobDeploymentRequest,
    ) -> LifecycleResult<Job> {
        record_phase(&self.registry, &deployment.id, "validating job manifest").await;
        if !self.config.deployment.allow_job_overwrite {
            self.protect_job_overwriting(manifest, request.force).await?;
        }
        self.check_permissions(deployment.deployed_by.as_deref(), manifest)
            .await?;
        self.verify_repository_manifest(manifest, request)
            .await
            .context("verifying manifest consistency")?;
        self.plugins
            .validate_job_manifest(manifest, &manifest_job_type(manifest))
            .await?;

        let secrets = JobSecrets {
            git_credentials: request.git_credentials.clone(),
            secret_build_env: request.secret_vars.build_env.clone(),
            secret_runtime_env: request.secret_vars.runtime_env.clone(),
        };
        self.save_job_secrets(deployment, manifest, &secrets)
            .await
            .context("saving job secrets")?;

        self.build_and_provision(
            deployment,
            manifest,
            &secrets,
            request.build_context.clone(),
            &request.build_flags,
            None,
        )
        .await
    }

    async fn protect_job_overwriting(&self, manifest: &Manifest, force: bool) -> LifecycleResult<()> {
        if !self.registry.job_exists(&manifest.name, &manifest.version).await? {
            return Ok(());
        }
        if force {
            info!(
                job_name = %manifest.name,
                job_version = %manifest.version,
                "overwriting job due to force deployment"
            );
            return Ok(());
        }
        Err(LifecycleError::AlreadyExists(format!(
            "job {} v{} is already deployed. Try deploying next version or use --force flag",
            manifest.name, manifest.version
        )))
    }

    pub(super) async fn check_permissions(
        &self,
        username: Option<&str>,
        manifest: &Manifest,
    ) -> LifecycleResult<()> {
        let family_exists = self.registry.family_exists(&manifest.name).await?;
        check_deploy_permissions(
            self.permissions.as_ref(),
            username.unwrap_or(ANONYMOUS),
            manifest,
            family_exists,
        )
        .await
    }

    async fn verify_repository_manifest(
        &self,
        manifest: &Manifest,
        request: &JobDeploymentRequest,
    ) -> LifecycleResult<()> {
        let repository = match &request.repository_manifest_yaml {
            Some(content) => Some(RepositoryManifest {
                content: content.clone(),
                base: request.repository_base_manifest_yaml.clone(),
            }),
            None => self.read_workspace_manifest(manifest).await?,
        };

        match repository {
            Some(repository) => verify_manifest_consistency(&request.manifest_yaml, &repository),
            None => {
                warn!(
                    job_name = %manifest.name,
                    "repository manifest unavailable, skipping consistency check"
                );
                Ok(())
            }
        }
    }

    async fn read_workspace_manifest(&self, manifest: &Manifest) -> LifecycleResult<Option<RepositoryManifest>> {
        let Some(workspace) = &self.config.deployment.repository_workspace else {
            return Ok(None);
        };
        let directory: PathBuf = workspace.join(&manifest.name).join(&manifest.git.directory);
        let path = directory.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            LifecycleError::internal(format!("reading {}: {e}", path.display()))
        })?;
        let base = match &manifest.extends {
            Some(base) => {
                let base_path = directory.join(base);
                Some(tokio::fs::read_to_string(&base_path).await.map_err(|e| {
                    LifecycleError::validation(format!(
                        "base manifest {} can't be read: {e}",
                        base_path.display()
                    ))
                })?)
            }
            None => None,
        };
        Ok(Some(RepositoryManifest { content, base }))
    }

    async fn save_job_secrets(
        &self,
        deployment: &Deployment,
        manifest: &Manifest,
        secrets: &JobSecrets,
    ) -> LifecycleResult<()> {
        let target_name = deployment.infrastructure_target.as_deref().unwrap_or_default();
        let target = self.targets().get(target_name)?;
        match target
            .deployer()?
            .save_secrets(&manifest.name, &manifest.version, secrets)
            .await
        {
            Err(e) if matches!(e.root_cause(), LifecycleError::Unsupported(_)) => {
                warn!("managing secrets is not supported on {target_name}");
                Ok(())
            }
            saved => saved,
        }
    }

    /// Build a fresh image of the job, then provision it.
    pub(super) async fn build_and_provision(
        &self,
        deployment: &Deployment,
        manifest: &Manifest,
        secrets: &JobSecrets,
        build_context: Option<String>,
        build_flags: &[String],
        previous_job: Option<&Job>,
    ) -> LifecycleResult<Job> {
        let tag = Utc::now().format("%Y-%m-%dT%H%M%S").to_string();
        self.build_image(deployment, manifest, secrets, build_context, &tag, build_flags)
            .await
            .context("building an image")?;
        self.provision(deployment, manifest, &tag, secrets, previous_job)
            .await
    }

    async fn build_image(
        &self,
        deployment: &Deployment,
        manifest: &Manifest,
        secrets: &JobSecrets,
        build_context: Option<String>,
        tag: &str,
        build_flags: &[String],
    ) -> LifecycleResult<()> {
        record_phase(&self.registry, &deployment.id, "building image").await;
        info!(deployment_id = %deployment.id, job_name = %manifest.name, "building job image");

        let request = BuildRequest {
            manifest: manifest.clone(),
            git_credentials: secrets.git_credentials.clone(),
            secret_build_env: secrets.secret_build_env.clone(),
            tag: tag.to_owned(),
            build_context,
            deployment_id: deployment.id.clone(),
            build_flags: build_flags.to_vec(),
        };
        let outcome = self.builder.build(&request).await?;

        let image_name = self.config.registry.job_image(&manifest.name, tag);
        self.registry
            .save_deployment_build_logs(&deployment.id, &outcome.logs, self.config.deployment.build_logs_limit)
            .await?;
        self.registry
            .save_deployment_image_name(&deployment.id, &image_name)
            .await?;
        if let Some(error) = outcome.error.filter(|e| !e.is_empty()) {
            return Err(LifecycleError::Builder(error));
        }

        info!(deployment_id = %deployment.id, image = %image_name, "job image has been built");
        Ok(())
    }

    /// Start an already built image on the deployment's infrastructure target
    /// and wait until it's operational.
    pub(super) async fn provision(
        &self,
        deployment: &Deployment,
        manifest: &Manifest,
        tag: &str,
        secrets: &JobSecrets,
        previous_job: Option<&Job>,
    ) -> LifecycleResult<Job> {
        let target_name = deployment
            .infrastructure_target
            .clone()
            .unwrap_or_default();
        let fencing = deployment_timestamp();
        let image_name = self.config.registry.job_image(&manifest.name, tag);

        let deployed = async {
            record_phase(&self.registry, &deployment.id, "creating cluster resources").await;
            info!(
                job_name = %manifest.name,
                job_version = %manifest.version,
                image = %image_name,
                target = %target_name,
                "provisioning job"
            );
            let target = self.targets().get(&target_name)?;
            let family = self
                .registry
                .create_job_family_if_not_exist(&manifest.name)
                .await?;
            let request = DeployRequest {
                manifest: manifest.clone(),
                family,
                image_name: image_name.clone(),
                image_tag: tag.to_owned(),
                runtime_env: runtime_env_vars(
                    manifest,
                    &secrets.secret_build_env,
                    &secrets.secret_runtime_env,
                ),
                runtime_secrets: secrets.secret_runtime_env.clone(),
                plugin_env: self.plugins.job_runtime_env_vars()?,
                resources: resolve_resources(manifest, &self.config.resources)?,
                deployment_timestamp: fencing,
            };
            target.deployer()?.deploy(&request).await
        }
        .await
        .context("creating job resource")?;

        let registered = self
            .registry
            .job_exists(&manifest.name, &manifest.version)
            .await
            .context("saving job in database")?;
        let mut job = async {
            let mut job = deployed;
            job.status = JobStatus::Created;
            job.error = None;
            job.deployed_by = deployment.deployed_by.clone();
            job.manifest_yaml = Some(deployment.manifest_yaml.clone());
            job.job_type_version = manifest_job_type(manifest);
            job.image_tag = Some(tag.to_owned());
            job.infrastructure_target = Some(target_name.clone());
            if job.pub_url.is_none() {
                job.pub_url = Some(self.config.pub_url.job_url(&job.name, &job.version));
            }
            self.registry.save_job(&job).await
        }
        .await
        .context("saving job in database")?;

        if let Err(e) = self
            .verify_and_finish(deployment, manifest, &job, &image_name, fencing, previous_job)
            .await
        {
            if registered {
                job.status = JobStatus::Error;
                job.error = Some(e.to_string());
                if let Err(update) = self.registry.update_job(&job).await {
                    warn!(job_name = %job.name, job_version = %job.version, error = %update, "failed to mark job as failed");
                }
            } else if let Err(delete) = self.registry.delete_job(&job.name, &job.version).await {
                warn!(job_name = %job.name, job_version = %job.version, error = %delete, "failed to unregister job");
            }
            return Err(e);
        }

        job.status = JobStatus::Running;
        job.error = None;
        self.registry.update_job(&job).await?;
        info!(
            deployment_id = %deployment.id,
            job_name = %job.name,
            job_version = %job.version,
            "job has been provisioned"
        );
        Ok(job)
    }

    async fn verify_and_finish(
        &self,
        deployment: &Deployment,
        manifest: &Manifest,
        job: &Job,
        image_name: &str,
        fencing: i64,
        previous_job: Option<&Job>,
    ) -> LifecycleResult<()> {
        async {
            record_phase(&self.registry, &deployment.id, "starting Job server").await;
            let registry = self.registry.clone();
            let id = deployment.id.clone();
            let on_alive = move || -> BoxFuture<'static, ()> {
                let registry = registry.clone();
                let id = id.clone();
                async move { record_phase(&registry, &id, "initializing Job entrypoint").await }.boxed()
            };
            let on_alive: OnJobAlive<'_> = &on_alive;
            check_job_condition(self.targets(), job, fencing, Some(on_alive)).await
        }
        .await
        .context("verifying deployed job")?;

        async {
            record_phase(&self.registry, &deployment.id, "post-deploy hooks").await;
            self.plugins
                .post_job_deploy(job, manifest, image_name, deployment.deployed_by.as_deref())
                .await?;

            let event = match previous_job {
                None => AuditLogEvent::new(AuditLogEventType::JobDeployed),
                Some(previous) => AuditLogEvent::new(AuditLogEventType::JobRedeployed)
                    .subject(previous.deployed_by.as_deref()),
            };
            self.audit
                .log_event(
                    event
                        .executor(deployment.deployed_by.as_deref())
                        .job(&job.name, &job.version),
                )
                .await
        }
        .await
        .context("invoking post-deploy actions")
    }
}

/// Plain runtime variables of a job.
///
/// Build variables that aren't declared for runtime are blanked, so build
/// secrets never leak into the running job.
fn runtime_env_vars(
    manifest: &Manifest,
    secret_build_env: &BTreeMap<String, String>,
    secret_runtime_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut runtime_env = manifest.runtime_env.clone();
    for name in manifest.build_env.keys().chain(secret_build_env.keys()) {
        if !manifest.runtime_env.contains_key(name) && !secret_runtime_env.contains_key(name) {
            runtime_env.insert(name.clone(), String::new());
        }
    }
    runtime_env
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn build_variables_are_hidden_at_runtime() {
        let manifest = Manifest::from_yaml(
            "name: adder\nversion: 1.0.0\njobtype: python3:latest\ngit:\n  remote: https://example.com/adder\n\
             build_env:\n  PIP_INDEX: internal\n  SHARED: build\n\
             runtime_env:\n  SHARED: runtime\n  DEBUG: 'true'\n",
        )
        .unwrap();
        let secret_build = BTreeMap::from([
            ("PIP_TOKEN".to_owned(), "s3cret".to_owned()),
            ("DB_PASSWORD".to_owned(), "build".to_owned()),
        ]);
        let secret_runtime = BTreeMap::from([("DB_PASSWORD".to_owned(), "runtime".to_owned())]);

        let env = runtime_env_vars(&manifest, &secret_build, &secret_runtime);
        assert_eq!(env["PIP_INDEX"], "");
        assert_eq!(env["PIP_TOKEN"], "");
        assert_eq!(env["SHARED"], "runtime");
        assert_eq!(env["DEBUG"], "true");
        assert!(!env.contains_key("DB_PASSWORD"));
    }
}
