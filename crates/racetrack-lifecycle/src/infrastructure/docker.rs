//! Jobs running as containers on a docker daemon.
//!
//! The daemon is driven through the `docker` CLI. The same deployer and
//! monitor serve both a local daemon ([`LocalShell`](super::LocalShell)) and
//! one behind a remote gateway ([`RemoteShell`](super::RemoteShell)).

use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::monitor::{JobEndpoint, JobProbe};
use crate::types::{job_resource_name, Job, JobStatus, JOB_INTERNAL_PORT};

use super::shell::CommandRunner;
use super::{
    DeployRequest, JobDeployer, JobMonitor, LogResource, LogSink, LogsStreamer, OnJobAlive,
};

const FIRST_JOB_PORT: u16 = 7000;
const LAST_JOB_PORT: u16 = 8000;
const JOB_PORT_STEP: usize = 10;
const NAME_LABEL: &str = "job-name";
const VERSION_LABEL: &str = "job-version";
const LOGS_ON_ERROR_TAIL: usize = 20;

/// Settings shared by the docker deployer and monitor of one target.
#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Infrastructure target name stamped on discovered jobs.
    pub target_name: String,
    /// Docker network job containers join.
    pub network: String,
    /// Pub address passed to jobs as `PUB_URL`.
    pub pub_internal_url: String,
    /// Address jobs through `localhost` and their published ports.
    pub local: bool,
}

impl DockerOptions {
    fn internal_name(&self, resource_name: &str, port: u16) -> String {
        if self.local {
            format!("localhost:{port}")
        } else {
            format!("{resource_name}:{JOB_INTERNAL_PORT}")
        }
    }
}

fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Manages job containers with `docker run` and `docker rm`.
pub struct DockerDeployer {
    runner: Arc<dyn CommandRunner>,
    options: DockerOptions,
}

impl DockerDeployer {
    /// Create a deployer issuing commands through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, options: DockerOptions) -> Self {
        Self { runner, options }
    }

    async fn container_exists(&self, container: &str) -> LifecycleResult<bool> {
        let output = self
            .runner
            .run(&args([
                "docker".to_owned(),
                "ps".to_owned(),
                "-a".to_owned(),
                "--filter".to_owned(),
                format!("name=^/{container}$"),
                "--format".to_owned(),
                "{{.Names}}".to_owned(),
            ]))
            .await?;
        Ok(output.lines().any(|line| line.trim() == container))
    }

    async fn next_free_port(&self) -> LifecycleResult<u16> {
        let output = self
            .runner
            .run(&args([
                "docker",
                "ps",
                "--filter",
                "name=^/job-",
                "--format",
                "{{.Names}} {{.Ports}}",
            ]))
            .await?;
        let occupied: BTreeSet<u16> = output.lines().flat_map(published_ports).collect();
        Ok((FIRST_JOB_PORT..LAST_JOB_PORT)
            .step_by(JOB_PORT_STEP)
            .find(|port| !occupied.contains(port))
            .unwrap_or(LAST_JOB_PORT))
    }

    fn environment(&self, request: &DeployRequest) -> BTreeMap<String, String> {
        let mut env = request.runtime_env.clone();
        env.extend(request.runtime_secrets.clone());
        env.insert("PUB_URL".to_owned(), self.options.pub_internal_url.clone());
        env.insert("JOB_NAME".to_owned(), request.manifest.name.clone());
        env.insert(
            "JOB_DEPLOYMENT_TIMESTAMP".to_owned(),
            request.deployment_timestamp.to_string(),
        );
        env.extend(request.plugin_env.clone());
        env
    }
}

#[async_trait]
impl JobDeployer for DockerDeployer {
    async fn deploy(&self, request: &DeployRequest) -> LifecycleResult<Job> {
        request.check_reserved_env()?;
        let manifest = &request.manifest;
        let resource_name = job_resource_name(&manifest.name, &manifest.version);

        if self.container_exists(&resource_name).await? {
            self.delete(&manifest.name, &manifest.version).await?;
        }

        let port = self.next_free_port().await?;
        let mut command = args([
            "docker".to_owned(),
            "run".to_owned(),
            "-d".to_owned(),
            "--name".to_owned(),
            resource_name.clone(),
            "-p".to_owned(),
            format!("{port}:{JOB_INTERNAL_PORT}"),
        ]);
        for (name, value) in self.environment(request) {
            command.push("--env".to_owned());
            command.push(format!("{name}={value}"));
        }
        command.extend(args([
            "--pull".to_owned(),
            "always".to_owned(),
            format!("--network={}", self.options.network),
            "--add-host=host.docker.internal:host-gateway".to_owned(),
            "--label".to_owned(),
            format!("{NAME_LABEL}={}", manifest.name),
            "--label".to_owned(),
            format!("{VERSION_LABEL}={}", manifest.version),
            request.image_name.clone(),
        ]));
        self.runner.run(&command).await?;

        info!(
            job_name = %manifest.name,
            job_version = %manifest.version,
            container = %resource_name,
            port,
            "job container started"
        );

        let mut job = Job::new(&manifest.name, &manifest.version);
        job.family_id = request.family.id.clone();
        job.internal_name = Some(self.options.internal_name(&resource_name, port));
        job.image_tag = Some(request.image_tag.clone());
        job.infrastructure_target = Some(self.options.target_name.clone());
        Ok(job)
    }

    async fn delete(&self, name: &str, version: &str) -> LifecycleResult<()> {
        let container = job_resource_name(name, version);
        if self.container_exists(&container).await? {
            self.runner
                .run(&args(["docker".to_owned(), "rm".to_owned(), "-f".to_owned(), container]))
                .await?;
        }
        Ok(())
    }

    async fn exists(&self, name: &str, version: &str) -> LifecycleResult<bool> {
        self.container_exists(&job_resource_name(name, version)).await
    }
}

/// Discovers job containers and probes their health endpoints.
pub struct DockerMonitor {
    runner: Arc<dyn CommandRunner>,
    probe: JobProbe,
    options: DockerOptions,
    gateway: Option<(String, String)>,
}

impl DockerMonitor {
    /// Create a monitor probing jobs directly.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, probe: JobProbe, options: DockerOptions) -> Self {
        Self {
            runner,
            probe,
            options,
            gateway: None,
        }
    }

    /// Probe jobs through the forwarding endpoint of a remote gateway.
    #[must_use]
    pub fn with_gateway(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.gateway = Some((url.into(), token.into()));
        self
    }

    fn endpoint(&self, job: &Job) -> LifecycleResult<JobEndpoint> {
        match &self.gateway {
            Some((url, token)) => JobEndpoint::through_gateway(url, token, job),
            None => Ok(JobEndpoint::direct(format!(
                "http://{}",
                job.internal_name.as_deref().unwrap_or_default()
            ))),
        }
    }

    async fn inspect(&self, job: &mut Job) {
        let endpoint = match self.endpoint(job) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                job.status = JobStatus::Error;
                job.error = Some(e.to_string());
                return;
            }
        };
        if let Err(e) = self.probe.quick_check(&endpoint).await {
            warn!(job_name = %job.name, job_version = %job.version, error = %e, "job is in bad condition");
            job.status = JobStatus::Error;
            job.error = Some(e.to_string());
            return;
        }
        match self.probe.read_last_call_time(&endpoint).await {
            Ok(last_call_time) => job.last_call_time = last_call_time,
            Err(e) => debug!(job_name = %job.name, error = %e, "failed to scrape job metrics"),
        }
    }
}

#[async_trait]
impl JobMonitor for DockerMonitor {
    async fn list_jobs(&self) -> LifecycleResult<Vec<Job>> {
        let output = self
            .runner
            .run(&args([
                "docker".to_owned(),
                "ps".to_owned(),
                "-a".to_owned(),
                "--filter".to_owned(),
                "name=^/job-".to_owned(),
                "--format".to_owned(),
                format!(
                    "{{{{.Names}}}} {{{{.Label \"{NAME_LABEL}\"}}}} {{{{.Label \"{VERSION_LABEL}\"}}}} {{{{.Ports}}}}"
                ),
            ]))
            .await?;

        let mut jobs = Vec::new();
        for line in output.lines() {
            let Some(container) = ListedContainer::parse(line) else {
                continue;
            };
            let mut job = Job::new(container.job_name, container.job_version);
            job.status = JobStatus::Running;
            job.internal_name = Some(self.options.internal_name(container.resource_name, container.port));
            job.infrastructure_target = Some(self.options.target_name.clone());
            self.inspect(&mut job).await;
            jobs.push(job);
        }
        Ok(jobs)
    }

    async fn check_condition(
        &self,
        job: &Job,
        deployment_timestamp: i64,
        on_alive: Option<OnJobAlive<'_>>,
    ) -> LifecycleResult<()> {
        let endpoint = self.endpoint(job)?;
        let Err(e) = self
            .probe
            .check_until_operational(&endpoint, deployment_timestamp, on_alive)
            .await
        else {
            return Ok(());
        };

        let logs = self
            .read_recent_logs(job, LOGS_ON_ERROR_TAIL)
            .await
            .unwrap_or_else(|logs_error| format!("<failed to read logs: {logs_error}>"));
        let message = format!("{e}\nJob logs:\n{logs}");
        Err(match e {
            LifecycleError::Timeout(_) => LifecycleError::Timeout(message),
            _ => LifecycleError::infrastructure(message),
        })
    }

    async fn read_recent_logs(&self, job: &Job, tail: usize) -> LifecycleResult<String> {
        self.runner
            .run(&args([
                "docker".to_owned(),
                "logs".to_owned(),
                job.resource_name(),
                "--tail".to_owned(),
                docker_tail(tail),
            ]))
            .await
    }
}

/// `docker logs --tail` value; docker reads 0 as no lines at all.
fn docker_tail(tail: usize) -> String {
    if tail == 0 {
        "all".to_owned()
    } else {
        tail.to_string()
    }
}

/// Follows `docker logs` of local job containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerLogsStreamer;

#[async_trait]
impl LogsStreamer for DockerLogsStreamer {
    async fn create_session(
        &self,
        resource: &LogResource,
        sink: LogSink,
        cancel: CancellationToken,
    ) -> LifecycleResult<()> {
        let container = job_resource_name(&resource.job_name, &resource.job_version);
        let mut child = Command::new("docker")
            .args(["logs", "--follow", "--tail", &docker_tail(resource.tail), &container])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LifecycleError::infrastructure(format!("failed to follow logs: {e}")))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(LifecycleError::internal("docker logs output not captured"));
        };

        tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout).lines();
            let mut stderr = BufReader::new(stderr).lines();
            let (mut stdout_open, mut stderr_open) = (true, true);

            while stdout_open || stderr_open {
                let (from_stdout, line) = tokio::select! {
                    () = cancel.cancelled() => break,
                    line = stdout.next_line(), if stdout_open => (true, line),
                    line = stderr.next_line(), if stderr_open => (false, line),
                };
                match line {
                    Ok(Some(line)) => {
                        if !sink.broadcast(line).await {
                            break;
                        }
                    }
                    Ok(None) | Err(_) if from_stdout => stdout_open = false,
                    Ok(None) | Err(_) => stderr_open = false,
                }
            }
            debug!(session_id = %sink.session_id(), "log stream finished");
            drop(child);
        });
        Ok(())
    }
}

/// One line of the job container listing.
#[derive(Debug, PartialEq, Eq)]
struct ListedContainer<'a> {
    resource_name: &'a str,
    job_name: &'a str,
    job_version: &'a str,
    port: u16,
}

impl<'a> ListedContainer<'a> {
    /// Parse `<container> <name label> <version label> <ports>`.
    ///
    /// Stopped containers publish no ports and are skipped.
    fn parse(line: &'a str) -> Option<Self> {
        let mut fields = line.trim().splitn(4, ' ');
        let resource_name = fields.next()?;
        let job_name = fields.next()?;
        let job_version = fields.next()?;
        let port = port_mappings(fields.next()?)
            .find(|(_, target)| *target == format!("{JOB_INTERNAL_PORT}/tcp"))
            .map(|(host_port, _)| host_port)?;
        if !resource_name.starts_with("job-") || job_name.is_empty() || job_version.is_empty() {
            return None;
        }
        Some(Self {
            resource_name,
            job_name,
            job_version,
            port,
        })
    }
}

/// Host ports published by a `<name> <ports>` listing line.
fn published_ports(line: &str) -> Vec<u16> {
    line.trim()
        .split_once(' ')
        .map(|(_, ports)| port_mappings(ports).map(|(host, _)| host).collect())
        .unwrap_or_default()
}

/// `(host port, container target)` pairs of a docker ports column such as
/// `0.0.0.0:7010->7000/tcp, :::7010->7000/tcp`.
fn port_mappings(ports: &str) -> impl Iterator<Item = (u16, &str)> {
    ports.split(',').filter_map(|mapping| {
        let (host, target) = mapping.trim().split_once("->")?;
        let (_, port) = host.rsplit_once(':')?;
        Some((port.parse().ok()?, target))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::infrastructure::RESERVED_ENV_VARS;
    use crate::manifest::{Manifest, ResolvedResources};
    use crate::monitor::ProbeSettings;
    use crate::types::JobFamily;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records commands and answers them from a script.
    #[derive(Default)]
    struct ScriptedShell {
        calls: Mutex<Vec<String>>,
        responses: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedShell {
        fn respond(&self, prefix: &str, output: &str) {
            self.responses
                .lock()
                .push((prefix.to_owned(), output.to_owned()));
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedShell {
        async fn run(&self, args: &[String]) -> LifecycleResult<String> {
            let command = args.join(" ");
            self.calls.lock().push(command.clone());
            Ok(self
                .responses
                .lock()
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_default())
        }
    }

    fn options() -> DockerOptions {
        DockerOptions {
            target_name: "docker".to_owned(),
            network: "racetrack_default".to_owned(),
            pub_internal_url: "http://pub:7205/pub".to_owned(),
            local: false,
        }
    }

    fn request() -> DeployRequest {
        let manifest = Manifest::from_yaml(
            "name: adder\nversion: 1.0.0\ngit:\n  remote: https://example.com/adder\njobtype: python3:latest\n",
        )
        .unwrap();
        DeployRequest {
            manifest,
            family: JobFamily::new("adder"),
            image_name: "127.0.0.1:5000/racetrack/job-entrypoint:adder-1".to_owned(),
            image_tag: "1".to_owned(),
            runtime_env: BTreeMap::from([("DEBUG".to_owned(), "true".to_owned())]),
            runtime_secrets: BTreeMap::from([("API_KEY".to_owned(), "s3cr3t".to_owned())]),
            plugin_env: BTreeMap::new(),
            resources: ResolvedResources {
                memory_min: "256Mi".to_owned(),
                memory_max: "1Gi".to_owned(),
                cpu_min: "10m".to_owned(),
                cpu_max: "1000m".to_owned(),
            },
            deployment_timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn port_column_is_parsed() {
        assert_eq!(published_ports("job-adder-v-1 0.0.0.0:7010->7000/tcp"), vec![7010]);
        assert_eq!(
            published_ports("job-a-v-1 0.0.0.0:7000->7000/tcp, :::7000->7000/tcp"),
            vec![7000, 7000]
        );
        assert!(published_ports("job-stopped-v-1").is_empty());
    }

    #[test]
    fn container_listing_is_parsed() {
        let line = "job-adder-v-1-0-0 adder 1.0.0 0.0.0.0:7020->7000/tcp, :::7020->7000/tcp";
        assert_eq!(
            ListedContainer::parse(line),
            Some(ListedContainer {
                resource_name: "job-adder-v-1-0-0",
                job_name: "adder",
                job_version: "1.0.0",
                port: 7020,
            })
        );
        assert_eq!(ListedContainer::parse("job-adder-v-1-0-0 adder 1.0.0 "), None);
        assert_eq!(ListedContainer::parse("garbage"), None);
    }

    #[tokio::test]
    async fn deploy_picks_free_port_and_sets_platform_env() {
        let shell = Arc::new(ScriptedShell::default());
        shell.respond(
            "docker ps --filter",
            "job-other-v-1 0.0.0.0:7000->7000/tcp\njob-third-v-1 0.0.0.0:7010->7000/tcp\n",
        );
        let deployer = DockerDeployer::new(Arc::clone(&shell) as Arc<dyn CommandRunner>, options());

        let job = deployer.deploy(&request()).await.unwrap();
        assert_eq!(job.internal_name.as_deref(), Some("job-adder-v-1-0-0:7000"));
        assert_eq!(job.image_tag.as_deref(), Some("1"));
        assert_eq!(job.status, JobStatus::Created);

        let run = shell
            .calls()
            .into_iter()
            .find(|c| c.starts_with("docker run"))
            .unwrap();
        assert!(run.contains("-p 7020:7000"), "{run}");
        assert!(run.contains("--env API_KEY=s3cr3t"));
        assert!(run.contains("--env JOB_DEPLOYMENT_TIMESTAMP=1700000000"));
        assert!(run.contains("--env PUB_URL=http://pub:7205/pub"));
        assert!(run.contains("--label job-name=adder --label job-version=1.0.0"));
        assert!(run.ends_with("job-entrypoint:adder-1"));
    }

    #[tokio::test]
    async fn deploy_replaces_existing_container() {
        let shell = Arc::new(ScriptedShell::default());
        shell.respond("docker ps -a", "job-adder-v-1-0-0\n");
        let deployer = DockerDeployer::new(Arc::clone(&shell) as Arc<dyn CommandRunner>, options());

        deployer.deploy(&request()).await.unwrap();
        let calls = shell.calls();
        let removed = calls.iter().position(|c| c == "docker rm -f job-adder-v-1-0-0");
        let started = calls.iter().position(|c| c.starts_with("docker run"));
        assert!(removed.unwrap() < started.unwrap());
    }

    #[tokio::test]
    async fn deploy_rejects_reserved_env() {
        let shell = Arc::new(ScriptedShell::default());
        let deployer = DockerDeployer::new(Arc::clone(&shell) as Arc<dyn CommandRunner>, options());
        let mut request = request();
        request
            .runtime_env
            .insert(RESERVED_ENV_VARS[1].to_owned(), "x".to_owned());

        assert!(deployer.deploy(&request).await.is_err());
        assert!(shell.calls().is_empty());
    }

    #[tokio::test]
    async fn secrets_are_unsupported() {
        let deployer = DockerDeployer::new(Arc::new(ScriptedShell::default()), options());
        let err = deployer.get_secrets("adder", "1.0.0").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Unsupported(_)));
    }

    #[tokio::test]
    async fn failed_condition_includes_logs() {
        let shell = Arc::new(ScriptedShell::default());
        shell.respond("docker logs", "Traceback: ZeroDivisionError\n");
        let probe = JobProbe::new(ProbeSettings {
            timeout_until_alive: Duration::from_millis(100),
            timeout_until_ready: Duration::from_millis(100),
            request_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        })
        .unwrap();
        let monitor = DockerMonitor::new(Arc::clone(&shell) as Arc<dyn CommandRunner>, probe, options());

        let mut job = Job::new("adder", "1.0.0");
        job.internal_name = Some("127.0.0.1:9".to_owned());
        let err = monitor.check_condition(&job, 0, None).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Job logs:\nTraceback: ZeroDivisionError"), "{message}");
        assert!(shell
            .calls()
            .contains(&"docker logs job-adder-v-1-0-0 --tail 20".to_owned()));
    }

    #[tokio::test]
    async fn zero_tail_reads_all_logs() {
        let shell = Arc::new(ScriptedShell::default());
        shell.respond("docker logs", "first\nsecond\n");
        let monitor = DockerMonitor::new(
            Arc::clone(&shell) as Arc<dyn CommandRunner>,
            JobProbe::new(ProbeSettings::default()).unwrap(),
            options(),
        );

        let logs = monitor
            .read_recent_logs(&Job::new("adder", "1.0.0"), 0)
            .await
            .unwrap();
        assert_eq!(logs, "first\nsecond\n");
        assert!(shell
            .calls()
            .contains(&"docker logs job-adder-v-1-0-0 --tail all".to_owned()));
    }
}
