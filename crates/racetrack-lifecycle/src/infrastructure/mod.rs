//! Infrastructure targets hosting jobs.
//!
//! Every back-end exposes up to three capabilities:
//! - [`JobDeployer`] creates and removes job workloads,
//! - [`JobMonitor`] lists workloads and probes their condition,
//! - [`LogsStreamer`] pushes live log lines to a client session.
//!
//! An [`InfrastructureTarget`] bundles them under a name. A capability that a
//! target lacks is reported as an error when requested, never skipped.

mod docker;
mod memory;
mod registry;
mod remote;
mod shell;

pub use docker::{DockerDeployer, DockerLogsStreamer, DockerMonitor, DockerOptions};
pub use memory::MemoryInfrastructure;
pub use registry::{builtin_targets, TargetRegistry};
pub use remote::{RemoteShell, GATEWAY_TOKEN_HEADER, JOB_INTERNAL_NAME_HEADER};
pub use shell::{render_command, CommandRunner, LocalShell};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{LifecycleError, LifecycleResult};
use crate::manifest::{Manifest, ResolvedResources};
use crate::types::{Job, JobFamily};

/// Environment variables set by the platform that jobs may not override.
pub const RESERVED_ENV_VARS: [&str; 4] = [
    "PUB_URL",
    "JOB_NAME",
    "AUTH_TOKEN",
    "JOB_DEPLOYMENT_TIMESTAMP",
];

/// Callback fired once a job is live but still initialising.
pub type OnJobAlive<'a> = &'a (dyn Fn() -> BoxFuture<'static, ()> + Send + Sync);

/// Credentials for cloning a private job repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCredentials {
    /// Username.
    pub username: String,
    /// Password or access token.
    pub password: String,
}

/// Secrets needed to build and run a job.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSecrets {
    /// Credentials for the job repository.
    pub git_credentials: Option<GitCredentials>,
    /// Secret variables available while building.
    #[serde(default)]
    pub secret_build_env: BTreeMap<String, String>,
    /// Secret variables available at runtime.
    #[serde(default)]
    pub secret_runtime_env: BTreeMap<String, String>,
}

impl fmt::Debug for JobSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSecrets")
            .field("git_credentials", &self.git_credentials.is_some())
            .field("secret_build_env", &self.secret_build_env.keys())
            .field("secret_runtime_env", &self.secret_runtime_env.keys())
            .finish()
    }
}

/// Everything a deployer needs to start a job workload.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Parsed job manifest.
    pub manifest: Manifest,
    /// Family the job belongs to.
    pub family: JobFamily,
    /// Full name of the image to run.
    pub image_name: String,
    /// Tag of the image to run.
    pub image_tag: String,
    /// Plain runtime environment, already merged and with hidden build vars blanked.
    pub runtime_env: BTreeMap<String, String>,
    /// Secret runtime environment.
    pub runtime_secrets: BTreeMap<String, String>,
    /// Extra variables contributed by plugins.
    pub plugin_env: BTreeMap<String, String>,
    /// Resolved resource limits.
    pub resources: ResolvedResources,
    /// Fencing token exposed to the job and echoed back by its liveness probe.
    pub deployment_timestamp: i64,
}

impl DeployRequest {
    /// Fail if user variables collide with the platform-reserved names.
    pub fn check_reserved_env(&self) -> LifecycleResult<()> {
        let conflicts: Vec<&str> = RESERVED_ENV_VARS
            .iter()
            .copied()
            .filter(|name| {
                self.runtime_env.contains_key(*name) || self.runtime_secrets.contains_key(*name)
            })
            .collect();
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::validation(format!(
                "found illegal runtime env vars, which conflict with reserved names: {conflicts:?}"
            )))
        }
    }
}

/// Properties of a resource whose logs are streamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogResource {
    /// Job name.
    pub job_name: String,
    /// Job version.
    pub job_version: String,
    /// Number of recent lines to send before following, 0 for all.
    pub tail: usize,
}

/// Channel pushing log lines to one client session.
#[derive(Debug, Clone)]
pub struct LogSink {
    session_id: String,
    tx: mpsc::Sender<String>,
}

impl LogSink {
    /// Create a sink for the given session.
    #[must_use]
    pub fn new(session_id: impl Into<String>, tx: mpsc::Sender<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
        }
    }

    /// Session this sink delivers to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send a line to the subscribed client.
    ///
    /// Returns `false` once the client has gone away.
    pub async fn broadcast(&self, line: impl Into<String>) -> bool {
        self.tx.send(line.into()).await.is_ok()
    }
}

/// Creates and removes job workloads.
#[async_trait]
pub trait JobDeployer: Send + Sync {
    /// Start a workload for the job, replacing any previous one of the same version.
    async fn deploy(&self, request: &DeployRequest) -> LifecycleResult<Job>;

    /// Remove the job's workload.
    async fn delete(&self, name: &str, version: &str) -> LifecycleResult<()>;

    /// Whether a workload exists for the job.
    async fn exists(&self, name: &str, version: &str) -> LifecycleResult<bool>;

    /// Store secrets of the job.
    async fn save_secrets(
        &self,
        name: &str,
        version: &str,
        secrets: &JobSecrets,
    ) -> LifecycleResult<()> {
        let _ = (name, version, secrets);
        Err(LifecycleError::Unsupported("managing secrets".to_owned()))
    }

    /// Read back secrets stored for the job.
    async fn get_secrets(&self, name: &str, version: &str) -> LifecycleResult<JobSecrets> {
        let _ = (name, version);
        Err(LifecycleError::Unsupported("managing secrets".to_owned()))
    }
}

/// Discovers job workloads and checks their condition.
#[async_trait]
pub trait JobMonitor: Send + Sync {
    /// List every job workload visible on the infrastructure.
    async fn list_jobs(&self) -> LifecycleResult<Vec<Job>>;

    /// Wait until the job is live and ready.
    ///
    /// Probe responses carrying a `deployment_timestamp` other than the given
    /// one come from a superseded workload and are ignored. Zero disables the
    /// check. `on_alive` fires once the job is live but not yet ready.
    async fn check_condition(
        &self,
        job: &Job,
        deployment_timestamp: i64,
        on_alive: Option<OnJobAlive<'_>>,
    ) -> LifecycleResult<()>;

    /// Last `tail` lines of the job's output, or all of it when `tail` is 0.
    async fn read_recent_logs(&self, job: &Job, tail: usize) -> LifecycleResult<String>;
}

/// Produces live log lines for client sessions.
#[async_trait]
pub trait LogsStreamer: Send + Sync {
    /// Start pushing log lines of `resource` into `sink`.
    ///
    /// Returns once streaming is set up; lines keep flowing from a background
    /// task until `cancel` fires or the client goes away.
    async fn create_session(
        &self,
        resource: &LogResource,
        sink: LogSink,
        cancel: CancellationToken,
    ) -> LifecycleResult<()>;

    /// Release streamer-side state of a closed session.
    async fn close_session(&self, session_id: &str) {
        let _ = session_id;
    }
}

/// A named back-end able to host jobs.
#[derive(Clone)]
pub struct InfrastructureTarget {
    /// Name jobs refer to.
    pub name: String,
    /// Workload manager.
    pub deployer: Option<Arc<dyn JobDeployer>>,
    /// Workload observer.
    pub monitor: Option<Arc<dyn JobMonitor>>,
    /// Log source.
    pub logs_streamer: Option<Arc<dyn LogsStreamer>>,
    /// Address of the remote Pub gateway fronting the infrastructure.
    pub remote_gateway_url: Option<String>,
    /// Token authenticating with the remote gateway.
    pub remote_gateway_token: Option<String>,
}

impl InfrastructureTarget {
    /// Create a target with no capabilities.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deployer: None,
            monitor: None,
            logs_streamer: None,
            remote_gateway_url: None,
            remote_gateway_token: None,
        }
    }

    /// Set the deployer.
    #[must_use]
    pub fn with_deployer(mut self, deployer: Arc<dyn JobDeployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    /// Set the monitor.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn JobMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Set the logs streamer.
    #[must_use]
    pub fn with_logs_streamer(mut self, streamer: Arc<dyn LogsStreamer>) -> Self {
        self.logs_streamer = Some(streamer);
        self
    }

    /// Set the remote gateway address and token.
    #[must_use]
    pub fn with_remote_gateway(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.remote_gateway_url = Some(url.into());
        self.remote_gateway_token = Some(token.into());
        self
    }

    /// The deployer, or an error naming the missing capability.
    pub fn deployer(&self) -> LifecycleResult<&Arc<dyn JobDeployer>> {
        self.deployer.as_ref().ok_or_else(|| self.missing("job deployer"))
    }

    /// The monitor, or an error naming the missing capability.
    pub fn monitor(&self) -> LifecycleResult<&Arc<dyn JobMonitor>> {
        self.monitor.as_ref().ok_or_else(|| self.missing("job monitor"))
    }

    /// The logs streamer, or an error naming the missing capability.
    pub fn logs_streamer(&self) -> LifecycleResult<&Arc<dyn LogsStreamer>> {
        self.logs_streamer
            .as_ref()
            .ok_or_else(|| self.missing("logs streamer"))
    }

    fn missing(&self, capability: &str) -> LifecycleError {
        LifecycleError::infrastructure(format!(
            "infrastructure target \"{}\" has no {capability}",
            self.name
        ))
    }
}

impl fmt::Debug for InfrastructureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfrastructureTarget")
            .field("name", &self.name)
            .field("deployer", &self.deployer.is_some())
            .field("monitor", &self.monitor.is_some())
            .field("logs_streamer", &self.logs_streamer.is_some())
            .field("remote_gateway_url", &self.remote_gateway_url)
            .finish_non_exhaustive()
    }
}

/// The last `tail` entries of `lines`; all of them when `tail` is 0.
#[must_use]
pub fn tail_lines<T>(lines: &[T], tail: usize) -> &[T] {
    if tail == 0 {
        lines
    } else {
        &lines[lines.len().saturating_sub(tail)..]
    }
}

/// Seconds since the epoch, used as a deployment fencing token.
#[must_use]
pub fn deployment_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    fn request(runtime_env: &[(&str, &str)]) -> DeployRequest {
        let manifest = Manifest::from_yaml(
            "name: adder\nversion: 1.0.0\ngit:\n  remote: https://example.com/adder\njobtype: python3:latest\n",
        )
        .unwrap();
        DeployRequest {
            manifest,
            family: JobFamily::new("adder"),
            image_name: "registry/adder:1".to_owned(),
            image_tag: "1".to_owned(),
            runtime_env: runtime_env
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            runtime_secrets: BTreeMap::new(),
            plugin_env: BTreeMap::new(),
            resources: ResolvedResources {
                memory_min: "256Mi".to_owned(),
                memory_max: "1Gi".to_owned(),
                cpu_min: "10m".to_owned(),
                cpu_max: "1000m".to_owned(),
            },
            deployment_timestamp: 1,
        }
    }

    #[test]
    fn reserved_env_names_are_rejected() {
        assert!(request(&[("DEBUG", "1")]).check_reserved_env().is_ok());
        let err = request(&[("PUB_URL", "x")]).check_reserved_env().unwrap_err();
        assert!(err.to_string().contains("conflict with reserved names"));
        assert!(err.to_string().contains("PUB_URL"));
    }

    #[test]
    fn missing_capability_is_an_error() {
        let target = InfrastructureTarget::new("bare");
        let err = target.monitor().err().unwrap();
        assert_eq!(
            err.to_string(),
            "infrastructure target \"bare\" has no job monitor"
        );
        assert!(target.deployer().is_err());
        assert!(target.logs_streamer().is_err());
    }

    #[test]
    fn secrets_debug_hides_values() {
        let secrets = JobSecrets {
            git_credentials: None,
            secret_build_env: BTreeMap::from([("TOKEN".to_owned(), "hunter2".to_owned())]),
            secret_runtime_env: BTreeMap::new(),
        };
        let printed = format!("{secrets:?}");
        assert!(printed.contains("TOKEN"));
        assert!(!printed.contains("hunter2"));
    }
}
