//! Deployment orchestration.
//!
//! A deployment runs as a pipeline of stages, each wrapping its failures
//! with the stage name:
//!
//! 1. overwrite protection, permissions and manifest validation,
//! 2. saving job secrets on the infrastructure target,
//! 3. building the image by the external image builder,
//! 4. provisioning the job on its infrastructure target,
//! 5. waiting until the job is alive and ready,
//! 6. post-deploy hooks and audit.
//!
//! At most one pipeline runs per job version: an in-process lease guards
//! this process and the deployment records guard the whole registry. Resources
//! created before a failure are not rolled back; the next reconciliation
//! takes care of them.

mod lease;
mod operations;
mod pipeline;

pub use lease::{DeploymentLease, DeploymentLeases};
pub use operations::SYSTEM_USERNAME;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::builder::ImageBuilder;
use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::infrastructure::{GitCredentials, TargetRegistry};
use crate::manifest::Manifest;
use crate::permissions::PermissionChecker;
use crate::plugin::PluginEngine;
use crate::registry::{AuditLogger, JobRegistry};
use crate::types::{
    AuditLogEvent, AuditLogEventType, Deployment, DeploymentId, DeploymentStatus, JobStatus,
};

/// Subject of permission checks for requests without a username.
pub const ANONYMOUS: &str = "anonymous";

/// Secret variables submitted alongside a manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretVars {
    /// Secret variables visible while building.
    #[serde(default)]
    pub build_env: BTreeMap<String, String>,
    /// Secret variables visible at runtime.
    #[serde(default)]
    pub runtime_env: BTreeMap<String, String>,
}

/// Request to deploy a job version.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDeploymentRequest {
    /// Manifest as submitted, in YAML.
    pub manifest_yaml: String,
    /// Manifest file found in the job repository, when the client has it.
    #[serde(default)]
    pub repository_manifest_yaml: Option<String>,
    /// Base manifest the repository manifest extends.
    #[serde(default)]
    pub repository_base_manifest_yaml: Option<String>,
    /// Credentials for a private repository.
    #[serde(default)]
    pub git_credentials: Option<GitCredentials>,
    /// Secret build and runtime variables.
    #[serde(default)]
    pub secret_vars: SecretVars,
    /// Encoded local build context.
    #[serde(default)]
    pub build_context: Option<String>,
    /// Extra image build flags.
    #[serde(default)]
    pub build_flags: Vec<String>,
    /// Overwrite an already deployed version.
    #[serde(default)]
    pub force: bool,
}

impl JobDeploymentRequest {
    /// Request deploying the given manifest with no secrets.
    #[must_use]
    pub fn new(manifest_yaml: impl Into<String>) -> Self {
        Self {
            manifest_yaml: manifest_yaml.into(),
            repository_manifest_yaml: None,
            repository_base_manifest_yaml: None,
            git_credentials: None,
            secret_vars: SecretVars::default(),
            build_context: None,
            build_flags: Vec::new(),
            force: false,
        }
    }
}

/// Orchestrates deployments, redeployments, moves and deletions of jobs.
pub struct DeploymentManager {
    config: Arc<LifecycleConfig>,
    registry: JobRegistry,
    audit: AuditLogger,
    plugins: Arc<PluginEngine>,
    builder: Arc<dyn ImageBuilder>,
    permissions: Arc<dyn PermissionChecker>,
    leases: Arc<DeploymentLeases>,
}

impl DeploymentManager {
    /// Create a deployment manager.
    pub fn new(
        config: Arc<LifecycleConfig>,
        registry: JobRegistry,
        plugins: Arc<PluginEngine>,
        builder: Arc<dyn ImageBuilder>,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        let audit = AuditLogger::new(Arc::clone(registry.store()));
        Self {
            config,
            registry,
            audit,
            plugins,
            builder,
            permissions,
            leases: Arc::new(DeploymentLeases::new()),
        }
    }

    /// Service configuration.
    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Job registry.
    #[must_use]
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Audit trail.
    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Plugin engine.
    #[must_use]
    pub fn plugins(&self) -> &Arc<PluginEngine> {
        &self.plugins
    }

    /// Available infrastructure targets.
    #[must_use]
    pub fn targets(&self) -> &Arc<TargetRegistry> {
        self.plugins.targets()
    }

    /// Start deploying a job in a background task.
    ///
    /// Returns the `in_progress` deployment record right away; its status
    /// tells the outcome later. Requests that can't even start (unparsable
    /// manifest, no infrastructure target, ongoing deployment) fail here.
    pub async fn deploy_in_background(
        self: &Arc<Self>,
        request: JobDeploymentRequest,
        username: Option<String>,
    ) -> LifecycleResult<Deployment> {
        let (manifest, deployment, lease) = self.start_deployment(&request, username.as_deref()).await?;
        info!(deployment_id = %deployment.id, "starting deployment in background");

        let manager = Arc::clone(self);
        let started = deployment.clone();
        tokio::spawn(async move {
            let _lease = lease;
            manager.deploy_saving_result(&started, &manifest, &request).await;
        });
        Ok(deployment)
    }

    /// Deploy a job and wait for the outcome.
    ///
    /// Pipeline failures don't fail the call: they are recorded on the
    /// returned deployment.
    pub async fn deploy(
        &self,
        request: JobDeploymentRequest,
        username: Option<String>,
    ) -> LifecycleResult<Deployment> {
        let (manifest, deployment, _lease) = self.start_deployment(&request, username.as_deref()).await?;
        self.deploy_saving_result(&deployment, &manifest, &request).await;
        self.registry.find_deployment(&deployment.id).await
    }

    async fn start_deployment(
        &self,
        request: &JobDeploymentRequest,
        username: Option<&str>,
    ) -> LifecycleResult<(Manifest, Deployment, DeploymentLease)> {
        let manifest = Manifest::from_yaml(&request.manifest_yaml)?;
        let target = self.targets().determine_infrastructure_name(
            manifest.infrastructure_target.as_deref(),
            self.config.deployment.infrastructure_target.as_deref(),
        )?;
        let lease = self.leases.acquire(&manifest.key(), "deploy")?;
        let deployment = self
            .registry
            .create_deployment(
                &manifest.key(),
                &request.manifest_yaml,
                username,
                &target,
                self.config.deployment.concurrent_deployment_window,
            )
            .await?;
        Ok((manifest, deployment, lease))
    }

    async fn deploy_saving_result(
        &self,
        deployment: &Deployment,
        manifest: &Manifest,
        request: &JobDeploymentRequest,
    ) {
        let outcome = async {
            self.builder.wait_ready().await?;
            self.deploy_new_job(deployment, manifest, request).await
        }
        .await;

        match outcome {
            Ok(job) => {
                info!(
                    deployment_id = %deployment.id,
                    job_name = %job.name,
                    job_version = %job.version,
                    "deployment finished"
                );
                self.save_result(&deployment.id, Ok(())).await;
            }
            Err(e) => {
                error!(deployment_id = %deployment.id, error = %e, "deployment failed");
                self.save_result(&deployment.id, Err(&e)).await;
                self.mark_job_failed(&deployment.job_name, &deployment.job_version, &e)
                    .await;
                let event = AuditLogEvent::new(AuditLogEventType::DeploymentFailed)
                    .executor(deployment.deployed_by.as_deref())
                    .job(&deployment.job_name, &deployment.job_version);
                if let Err(e) = self.audit.log_event(event).await {
                    warn!(deployment_id = %deployment.id, error = %e, "failed to audit failed deployment");
                }
            }
        }
    }

    /// Store the terminal status of a deployment, logging storage failures.
    async fn save_result(&self, id: &DeploymentId, outcome: Result<(), &LifecycleError>) {
        let saved = match outcome {
            Ok(()) => {
                self.registry
                    .save_deployment_result(id, DeploymentStatus::Done, None)
                    .await
            }
            Err(e) => {
                self.registry
                    .save_deployment_result(id, DeploymentStatus::Failed, Some(&e.to_string()))
                    .await
            }
        };
        if let Err(e) = saved {
            error!(deployment_id = %id, error = %e, "failed to save deployment result");
        }
    }
}

impl DeploymentManager {
    /// Mark an already registered job as `error` after a failed attempt.
    ///
    /// Rejected requests leave the job as it is, and so does an attempt whose
    /// job never got registered.
    pub(super) async fn mark_job_failed(&self, name: &str, version: &str, failure: &LifecycleError) {
        if matches!(
            failure.root_cause(),
            LifecycleError::AlreadyExists(_) | LifecycleError::Unauthorized(_)
        ) {
            return;
        }
        let mut job = match self.registry.read_job(name, version).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                warn!(job_name = %name, job_version = %version, error = %e, "failed to read job of a failed deployment");
                return;
            }
        };
        job.status = JobStatus::Error;
        job.error = Some(failure.to_string());
        if let Err(e) = self.registry.update_job(&job).await {
            warn!(job_name = %name, job_version = %version, error = %e, "failed to mark job as failed");
        }
    }
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

/// Record the phase a deployment entered.
///
/// Phase reporting is best effort: storage failures are only logged.
pub(crate) async fn record_phase(registry: &JobRegistry, id: &DeploymentId, phase: &str) {
    if let Err(e) = registry.save_deployment_phase(id, phase).await {
        warn!(deployment_id = %id, phase, error = %e, "failed to save deployment phase");
    }
}
