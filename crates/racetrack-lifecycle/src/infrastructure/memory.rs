//! In-process infrastructure keeping job workloads in memory.
//!
//! Useful for local runs without a container engine and for tests, which
//! can inject failures and simulate drift between the registry and the
//! infrastructure.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};
use crate::types::{job_resource_name, Job, JobKey, JobStatus, JOB_INTERNAL_PORT};

use super::{
    tail_lines, DeployRequest, InfrastructureTarget, JobDeployer, JobMonitor, JobSecrets,
    LogResource, LogSink, LogsStreamer, OnJobAlive,
};

const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Workload {
    job: Job,
    deployment_timestamp: i64,
    env: BTreeMap<String, String>,
    condition_error: Option<String>,
}

#[derive(Default)]
struct State {
    workloads: HashMap<JobKey, Workload>,
    secrets: HashMap<JobKey, JobSecrets>,
    logs: HashMap<JobKey, Vec<String>>,
    failing_deploys: Option<String>,
    deploy_count: usize,
}

/// Infrastructure target storing workloads in process memory.
#[derive(Clone)]
pub struct MemoryInfrastructure {
    name: String,
    state: Arc<RwLock<State>>,
    log_lines: broadcast::Sender<(JobKey, String)>,
}

impl std::fmt::Debug for MemoryInfrastructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryInfrastructure")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MemoryInfrastructure {
    /// Create an empty infrastructure registered under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (log_lines, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(State::default())),
            log_lines,
        }
    }

    /// Target name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bundle this infrastructure as a target with every capability.
    #[must_use]
    pub fn target(&self) -> InfrastructureTarget {
        let shared = Arc::new(self.clone());
        InfrastructureTarget::new(&self.name)
            .with_deployer(Arc::clone(&shared) as Arc<dyn JobDeployer>)
            .with_monitor(Arc::clone(&shared) as Arc<dyn JobMonitor>)
            .with_logs_streamer(shared)
    }

    fn read(&self) -> LifecycleResult<std::sync::RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| LifecycleError::internal("lock poisoned"))
    }

    fn write(&self) -> LifecycleResult<std::sync::RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| LifecycleError::internal("lock poisoned"))
    }

    /// Make every following deploy fail with `error`, or succeed again with `None`.
    pub fn fail_deploys(&self, error: Option<&str>) -> LifecycleResult<()> {
        self.write()?.failing_deploys = error.map(str::to_owned);
        Ok(())
    }

    /// Make the job report an initialisation error when probed.
    pub fn set_condition_error(&self, name: &str, version: &str, error: Option<&str>) -> LifecycleResult<()> {
        let mut state = self.write()?;
        let workload = state
            .workloads
            .get_mut(&JobKey::new(name, version))
            .ok_or_else(|| LifecycleError::not_found(format!("workload {name} v{version} not found")))?;
        workload.condition_error = error.map(str::to_owned);
        Ok(())
    }

    /// Drop a workload behind the registry's back.
    pub fn remove(&self, name: &str, version: &str) -> LifecycleResult<bool> {
        Ok(self
            .write()?
            .workloads
            .remove(&JobKey::new(name, version))
            .is_some())
    }

    /// Start a workload the registry doesn't know about.
    pub fn insert_foreign(&self, name: &str, version: &str) -> LifecycleResult<()> {
        let mut job = Job::new(name, version);
        job.status = JobStatus::Running;
        job.internal_name = Some(format!("{}:{JOB_INTERNAL_PORT}", job_resource_name(name, version)));
        job.infrastructure_target = Some(self.name.clone());
        self.write()?.workloads.insert(
            JobKey::new(name, version),
            Workload {
                job,
                deployment_timestamp: 0,
                env: BTreeMap::new(),
                condition_error: None,
            },
        );
        Ok(())
    }

    /// Number of successful deploys so far.
    pub fn deploy_count(&self) -> LifecycleResult<usize> {
        Ok(self.read()?.deploy_count)
    }

    /// Environment the workload was started with.
    pub fn workload_env(&self, name: &str, version: &str) -> LifecycleResult<Option<BTreeMap<String, String>>> {
        Ok(self
            .read()?
            .workloads
            .get(&JobKey::new(name, version))
            .map(|w| w.env.clone()))
    }

    /// Append an output line to the job's logs, pushing it to live sessions.
    pub fn push_log(&self, name: &str, version: &str, line: impl Into<String>) -> LifecycleResult<()> {
        let key = JobKey::new(name, version);
        let line = line.into();
        self.write()?
            .logs
            .entry(key.clone())
            .or_default()
            .push(line.clone());
        // No receivers simply means nobody is streaming.
        let _ = self.log_lines.send((key, line));
        Ok(())
    }
}

#[async_trait]
impl JobDeployer for MemoryInfrastructure {
    async fn deploy(&self, request: &DeployRequest) -> LifecycleResult<Job> {
        request.check_reserved_env()?;
        let mut state = self.write()?;
        if let Some(error) = &state.failing_deploys {
            return Err(LifecycleError::infrastructure(error.clone()));
        }

        let manifest = &request.manifest;
        let key = manifest.key();
        let mut job = Job::new(&manifest.name, &manifest.version);
        job.family_id = request.family.id.clone();
        job.internal_name = Some(format!("{}:{JOB_INTERNAL_PORT}", key.resource_name()));
        job.image_tag = Some(request.image_tag.clone());
        job.infrastructure_target = Some(self.name.clone());

        let mut env = request.runtime_env.clone();
        env.extend(request.runtime_secrets.clone());
        env.insert(
            "JOB_DEPLOYMENT_TIMESTAMP".to_owned(),
            request.deployment_timestamp.to_string(),
        );
        env.extend(request.plugin_env.clone());

        let mut running = job.clone();
        running.status = JobStatus::Running;
        state.workloads.insert(
            key,
            Workload {
                job: running,
                deployment_timestamp: request.deployment_timestamp,
                env,
                condition_error: None,
            },
        );
        state.deploy_count += 1;
        debug!(job_name = %job.name, job_version = %job.version, target = %self.name, "workload started");
        Ok(job)
    }

    async fn delete(&self, name: &str, version: &str) -> LifecycleResult<()> {
        let mut state = self.write()?;
        let key = JobKey::new(name, version);
        state.workloads.remove(&key);
        state.logs.remove(&key);
        Ok(())
    }

    async fn exists(&self, name: &str, version: &str) -> LifecycleResult<bool> {
        Ok(self.read()?.workloads.contains_key(&JobKey::new(name, version)))
    }

    async fn save_secrets(&self, name: &str, version: &str, secrets: &JobSecrets) -> LifecycleResult<()> {
        self.write()?
            .secrets
            .insert(JobKey::new(name, version), secrets.clone());
        Ok(())
    }

    async fn get_secrets(&self, name: &str, version: &str) -> LifecycleResult<JobSecrets> {
        self.read()?
            .secrets
            .get(&JobKey::new(name, version))
            .cloned()
            .ok_or_else(|| LifecycleError::not_found(format!("secrets of job {name} v{version} not found")))
    }
}

#[async_trait]
impl JobMonitor for MemoryInfrastructure {
    async fn list_jobs(&self) -> LifecycleResult<Vec<Job>> {
        let state = self.read()?;
        let mut jobs: Vec<Job> = state
            .workloads
            .values()
            .map(|workload| {
                let mut job = workload.job.clone();
                if let Some(error) = &workload.condition_error {
                    job.status = JobStatus::Error;
                    job.error = Some(format!("Job initialization error: {error}"));
                }
                job
            })
            .collect();
        jobs.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(jobs)
    }

    async fn check_condition(
        &self,
        job: &Job,
        deployment_timestamp: i64,
        on_alive: Option<OnJobAlive<'_>>,
    ) -> LifecycleResult<()> {
        let workload = self
            .read()?
            .workloads
            .get(&job.key())
            .cloned()
            .ok_or_else(|| {
                LifecycleError::infrastructure("Cluster error: can't reach Job: workload not found")
            })?;

        if deployment_timestamp != 0 && workload.deployment_timestamp != deployment_timestamp {
            return Err(LifecycleError::Timeout(
                "Cluster error: can't reach newer Job, incorrect deployment_timestamp field".to_owned(),
            ));
        }
        if let Some(error) = workload.condition_error {
            return Err(LifecycleError::infrastructure(format!(
                "Job initialization error: {error}"
            )));
        }
        if let Some(on_alive) = on_alive {
            on_alive().await;
        }
        Ok(())
    }

    async fn read_recent_logs(&self, job: &Job, tail: usize) -> LifecycleResult<String> {
        let state = self.read()?;
        let lines = state.logs.get(&job.key()).map(Vec::as_slice).unwrap_or_default();
        Ok(tail_lines(lines, tail).join("\n"))
    }
}

#[async_trait]
impl LogsStreamer for MemoryInfrastructure {
    async fn create_session(
        &self,
        resource: &LogResource,
        sink: LogSink,
        cancel: CancellationToken,
    ) -> LifecycleResult<()> {
        let key = JobKey::new(&resource.job_name, &resource.job_version);
        let backlog = {
            let state = self.read()?;
            let lines = state.logs.get(&key).map(Vec::as_slice).unwrap_or_default();
            tail_lines(lines, resource.tail).to_vec()
        };
        let mut receiver = self.log_lines.subscribe();

        tokio::spawn(async move {
            for line in backlog {
                if !sink.broadcast(line).await {
                    return;
                }
            }
            loop {
                let (line_key, line) = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(entry) => entry,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if line_key == key && !sink.broadcast(line).await {
                    break;
                }
            }
            debug!(session_id = %sink.session_id(), "memory log stream finished");
        });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::{Manifest, ResolvedResources};
    use crate::types::JobFamily;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn request(timestamp: i64) -> DeployRequest {
        DeployRequest {
            manifest: Manifest::from_yaml(
                "name: adder\nversion: 1.0.0\ngit:\n  remote: https://example.com/adder\njobtype: python3:latest\n",
            )
            .unwrap(),
            family: JobFamily::new("adder"),
            image_name: "registry/adder:1".to_owned(),
            image_tag: "1".to_owned(),
            runtime_env: BTreeMap::new(),
            runtime_secrets: BTreeMap::new(),
            plugin_env: BTreeMap::new(),
            resources: ResolvedResources {
                memory_min: "256Mi".to_owned(),
                memory_max: "1Gi".to_owned(),
                cpu_min: "10m".to_owned(),
                cpu_max: "1000m".to_owned(),
            },
            deployment_timestamp: timestamp,
        }
    }

    #[tokio::test]
    async fn deployed_workload_is_listed_and_operational() {
        let infra = MemoryInfrastructure::new("sandbox");
        let job = infra.deploy(&request(10)).await.unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert!(infra.exists("adder", "1.0.0").await.unwrap());

        let listed = infra.list_jobs().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, JobStatus::Running);
        assert_eq!(listed[0].infrastructure_target.as_deref(), Some("sandbox"));

        infra.check_condition(&job, 10, None).await.unwrap();
        let stale = infra.check_condition(&job, 9, None).await.unwrap_err();
        assert!(matches!(stale, LifecycleError::Timeout(_)));
    }

    #[tokio::test]
    async fn condition_error_is_reported() {
        let infra = MemoryInfrastructure::new("sandbox");
        let job = infra.deploy(&request(1)).await.unwrap();
        infra
            .set_condition_error("adder", "1.0.0", Some("missing model file"))
            .unwrap();

        let err = infra.check_condition(&job, 1, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Job initialization error: missing model file");
        assert_eq!(infra.list_jobs().await.unwrap()[0].status, JobStatus::Error);
    }

    #[tokio::test]
    async fn injected_failure_blocks_deploys() {
        let infra = MemoryInfrastructure::new("sandbox");
        infra.fail_deploys(Some("quota exceeded")).unwrap();
        assert!(infra.deploy(&request(1)).await.is_err());
        assert_eq!(infra.deploy_count().unwrap(), 0);

        infra.fail_deploys(None).unwrap();
        infra.deploy(&request(1)).await.unwrap();
        assert_eq!(infra.deploy_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn recent_logs_respect_tail() {
        let infra = MemoryInfrastructure::new("sandbox");
        let job = infra.deploy(&request(1)).await.unwrap();
        for i in 0..5 {
            infra.push_log("adder", "1.0.0", format!("line {i}")).unwrap();
        }
        assert_eq!(infra.read_recent_logs(&job, 2).await.unwrap(), "line 3\nline 4");
        assert_eq!(infra.read_recent_logs(&job, 0).await.unwrap().lines().count(), 5);
    }

    #[tokio::test]
    async fn session_receives_backlog_then_live_lines() {
        let infra = MemoryInfrastructure::new("sandbox");
        infra.push_log("adder", "1.0.0", "old").unwrap();
        infra.push_log("adder", "1.0.0", "recent").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let resource = LogResource {
            job_name: "adder".to_owned(),
            job_version: "1.0.0".to_owned(),
            tail: 1,
        };
        infra
            .create_session(&resource, LogSink::new("s1", tx), cancel.clone())
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), "recent");
        infra.push_log("other", "1.0.0", "ignored").unwrap();
        infra.push_log("adder", "1.0.0", "live").unwrap();
        assert_eq!(rx.recv().await.unwrap(), "live");

        cancel.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn zero_tail_streams_whole_backlog() {
        let infra = MemoryInfrastructure::new("sandbox");
        let job = infra.deploy(&request(1)).await.unwrap();
        for i in 0..3 {
            infra.push_log("adder", "1.0.0", format!("line {i}")).unwrap();
        }

        let (tx, mut rx) = mpsc::channel(8);
        let resource = LogResource {
            job_name: "adder".to_owned(),
            job_version: "1.0.0".to_owned(),
            tail: 0,
        };
        infra
            .create_session(&resource, LogSink::new("s1", tx), CancellationToken::new())
            .await
            .unwrap();

        let mut streamed = Vec::new();
        for _ in 0..3 {
            streamed.push(rx.recv().await.unwrap());
        }
        assert_eq!(streamed.join("\n"), infra.read_recent_logs(&job, 0).await.unwrap());
    }
}
