//! Configuration for racetrack-lifecycle.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{LifecycleError, LifecycleResult};
use crate::permissions::Grant;

/// Top-level configuration for the lifecycle service.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Job registry storage configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Image builder client configuration.
    #[serde(default)]
    pub image_builder: ImageBuilderConfig,

    /// Docker registry the built images are pushed to.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Addresses of the Pub gateway fronting the jobs.
    #[serde(default)]
    pub pub_url: PubConfig,

    /// Deployment pipeline behaviour.
    #[serde(default)]
    pub deployment: DeploymentConfig,

    /// Default job resource demands.
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Periodic background tasks.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Built-in infrastructure targets.
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,

    /// Directory for plugin data and generated files.
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,

    /// Deploy permission grants. Every caller may deploy anything when absent.
    #[serde(default)]
    pub permissions: Option<PermissionsConfig>,
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from(".plugins")
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            image_builder: ImageBuilderConfig::default(),
            registry: RegistryConfig::default(),
            pub_url: PubConfig::default(),
            deployment: DeploymentConfig::default(),
            resources: ResourceConfig::default(),
            supervisor: SupervisorConfig::default(),
            infrastructure: InfrastructureConfig::default(),
            plugins_dir: default_plugins_dir(),
            permissions: None,
        }
    }
}

impl LifecycleConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `lifecycle.toml` in the current directory (if present)
    /// 3. Environment variables with `RACETRACK_LIFECYCLE_` prefix
    pub fn load() -> LifecycleResult<Self> {
        Self::from_file("lifecycle.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> LifecycleResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RACETRACK_LIFECYCLE_").split("__"))
            .extract()
            .map_err(|e| LifecycleError::Config(e.to_string()))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7202),
        }
    }
}

/// Storage backend of the job registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    /// Embedded single-file SQLite database.
    #[default]
    Sqlite,
    /// PostgreSQL server.
    Postgres,
    /// Process memory, lost on exit.
    Memory,
}

/// Job registry storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Backend to use.
    #[serde(default)]
    pub backend: DatabaseBackend,

    /// Connection URL for the selected backend.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Keep running on an in-memory registry when the backend can't be opened.
    #[serde(default)]
    pub fallback_to_memory: bool,
}

fn default_database_url() -> String {
    "sqlite://racetrack.db?mode=rwc".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            fallback_to_memory: false,
        }
    }
}

/// Image builder client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageBuilderConfig {
    /// Base URL of the image builder API.
    pub url: String,
    /// Connection timeout.
    #[serde(with = "serde_duration_secs")]
    pub connect_timeout: Duration,
    /// Read timeout of a build request.
    #[serde(with = "serde_duration_secs")]
    pub read_timeout: Duration,
    /// How long to wait for the builder to report healthy before a build.
    #[serde(with = "serde_duration_secs")]
    pub ready_timeout: Duration,
}

impl Default for ImageBuilderConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7201".to_owned(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30 * 60),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

/// Docker registry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry host.
    pub docker_registry: String,
    /// Namespace (path prefix) for job images.
    pub docker_registry_namespace: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            docker_registry: "127.0.0.1:5000".to_owned(),
            docker_registry_namespace: "racetrack".to_owned(),
        }
    }
}

impl RegistryConfig {
    /// Full image name of a job built with the given tag.
    #[must_use]
    pub fn job_image(&self, job_name: &str, tag: &str) -> String {
        format!(
            "{}/{}/job-entrypoint:{job_name}-{tag}",
            self.docker_registry, self.docker_registry_namespace
        )
    }
}

/// Pub gateway addresses.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubConfig {
    /// Address jobs use to reach Pub from inside the cluster.
    pub internal: String,
    /// Address users reach Pub at.
    pub external: String,
}

impl Default for PubConfig {
    fn default() -> Self {
        Self {
            internal: "http://pub:7205/pub".to_owned(),
            external: "http://127.0.0.1:7205/pub".to_owned(),
        }
    }
}

impl PubConfig {
    /// Public URL of a job version.
    #[must_use]
    pub fn job_url(&self, name: &str, version: &str) -> String {
        format!("{}/job/{name}/{version}", self.external.trim_end_matches('/'))
    }
}

/// Deployment pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Allow deploying over an existing job version without `force`.
    pub allow_job_overwrite: bool,
    /// Infrastructure target used when the manifest doesn't pick one.
    pub infrastructure_target: Option<String>,
    /// How long a job may take to answer its liveness probe.
    #[serde(with = "serde_duration_secs")]
    pub timeout_until_job_alive: Duration,
    /// How long a live job may take to become ready.
    #[serde(with = "serde_duration_secs")]
    pub timeout_until_job_ready: Duration,
    /// Age after which an `in_progress` deployment is considered abandoned at startup.
    #[serde(with = "serde_duration_secs")]
    pub stale_deployment_age: Duration,
    /// Window in which another `in_progress` deployment of the same job blocks a new one.
    #[serde(with = "serde_duration_secs")]
    pub concurrent_deployment_window: Duration,
    /// Local checkout root used to verify submitted manifests.
    pub repository_workspace: Option<PathBuf>,
    /// Maximum stored size of build logs, in bytes.
    pub build_logs_limit: usize,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            allow_job_overwrite: false,
            infrastructure_target: None,
            timeout_until_job_alive: Duration::from_secs(15 * 60),
            timeout_until_job_ready: Duration::from_secs(10 * 60),
            stale_deployment_age: Duration::from_secs(24 * 60 * 60),
            concurrent_deployment_window: Duration::from_secs(60),
            repository_workspace: None,
            build_logs_limit: 64 * 1024,
        }
    }
}

/// Default resource demands applied to jobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Default minimum memory.
    pub default_memory_min: String,
    /// Default maximum memory.
    pub default_memory_max: String,
    /// Default minimum CPU.
    pub default_cpu_min: String,
    /// Default maximum CPU.
    pub default_cpu_max: String,
    /// Upper bound of any job's maximum memory.
    pub max_job_memory_limit: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            default_memory_min: "256Mi".to_owned(),
            default_memory_max: "1Gi".to_owned(),
            default_cpu_min: "10m".to_owned(),
            default_cpu_max: "1000m".to_owned(),
            max_job_memory_limit: "8Gi".to_owned(),
        }
    }
}

/// Periodic background task configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Granularity of the scheduling loop.
    #[serde(with = "serde_duration_secs")]
    pub tick: Duration,
    /// Interval of registry sync against the infrastructure.
    #[serde(with = "serde_duration_secs")]
    pub sync_interval: Duration,
    /// Interval of the reconciliation of lost jobs.
    #[serde(with = "serde_duration_secs")]
    pub reconcile_interval: Duration,
    /// Interval of metrics target population.
    #[serde(with = "serde_duration_secs")]
    pub metrics_interval: Duration,
    /// Whether lost jobs are redeployed automatically.
    pub reconciliation_enabled: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            sync_interval: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(10 * 60),
            metrics_interval: Duration::from_secs(60),
            reconciliation_enabled: true,
        }
    }
}

/// Deploy permission grants per username.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermissionsConfig {
    /// Scopes granted to each username.
    #[serde(default)]
    pub grants: BTreeMap<String, Vec<Grant>>,
}

/// Built-in infrastructure targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfrastructureConfig {
    /// Targets available without any plugin.
    pub targets: Vec<TargetConfig>,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            targets: vec![TargetConfig::Docker {
                name: "docker".to_owned(),
                network: default_docker_network(),
                local: false,
            }],
        }
    }
}

/// Definition of a built-in infrastructure target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetConfig {
    /// Containers on the local docker daemon.
    Docker {
        /// Target name.
        name: String,
        /// Docker network the job containers join.
        #[serde(default = "default_docker_network")]
        network: String,
        /// Reach jobs through their published host ports instead of the
        /// container network, for a lifecycle running outside docker.
        #[serde(default)]
        local: bool,
    },
    /// Infrastructure behind a remote Pub gateway.
    Remote {
        /// Target name.
        name: String,
        /// Base URL of the remote gateway.
        gateway_url: String,
        /// Token authenticating with the remote gateway.
        gateway_token: String,
    },
    /// In-process target keeping jobs in memory.
    Memory {
        /// Target name.
        name: String,
    },
}

fn default_docker_network() -> String {
    "racetrack_default".to_owned()
}

impl TargetConfig {
    /// Name the target is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Docker { name, .. } | Self::Remote { name, .. } | Self::Memory { name } => name,
        }
    }
}

mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = LifecycleConfig::default();
        assert_eq!(config.server.listen_addr.port(), 7202);
        assert_eq!(config.database.backend, DatabaseBackend::Sqlite);
        assert_eq!(config.image_builder.url, "http://127.0.0.1:7201");
        assert_eq!(
            config.deployment.timeout_until_job_alive,
            Duration::from_secs(900)
        );
        assert_eq!(config.supervisor.reconcile_interval, Duration::from_secs(600));
        assert_eq!(config.infrastructure.targets.len(), 1);
        assert!(!config.deployment.allow_job_overwrite);
        assert!(!config.database.fallback_to_memory);
        assert!(config.permissions.is_none());
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            plugins_dir = "/var/racetrack/plugins"

            [server]
            listen_addr = "127.0.0.1:9000"

            [database]
            backend = "postgres"
            url = "postgres://racetrack:secret@db:5432/racetrack"

            [deployment]
            allow_job_overwrite = true
            infrastructure_target = "remote-eu"
            timeout_until_job_ready = 30

            [[infrastructure.targets]]
            type = "remote"
            name = "remote-eu"
            gateway_url = "https://pub.eu.example.com"
            gateway_token = "t0ken"

            [[infrastructure.targets]]
            type = "memory"
            name = "sandbox"
        "#;

        let config: LifecycleConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.database.backend, DatabaseBackend::Postgres);
        assert!(config.deployment.allow_job_overwrite);
        assert_eq!(
            config.deployment.timeout_until_job_ready,
            Duration::from_secs(30)
        );
        assert_eq!(
            config.deployment.timeout_until_job_alive,
            Duration::from_secs(900)
        );
        let names: Vec<_> = config
            .infrastructure
            .targets
            .iter()
            .map(TargetConfig::name)
            .collect();
        assert_eq!(names, ["remote-eu", "sandbox"]);
        assert_eq!(config.plugins_dir, PathBuf::from("/var/racetrack/plugins"));
    }

    #[test]
    fn permission_grants_from_toml() {
        let toml = r#"
            [permissions.grants]
            alice = [{ scope = "deploy_new_family" }, { scope = "deploy_job" }]
            bob = [{ scope = "deploy_job", job_name = "adder" }]
        "#;

        let config: LifecycleConfig = toml::from_str(toml).unwrap();
        let grants = config.permissions.unwrap().grants;
        assert_eq!(grants["alice"].len(), 2);
        assert_eq!(
            grants["bob"],
            [Grant {
                scope: crate::permissions::AuthScope::DeployJob,
                job_name: Some("adder".to_owned()),
            }]
        );
    }

    #[test]
    fn image_and_pub_urls() {
        let config = LifecycleConfig::default();
        assert_eq!(
            config.registry.job_image("adder", "2024-01-02T030405"),
            "127.0.0.1:5000/racetrack/job-entrypoint:adder-2024-01-02T030405"
        );
        assert_eq!(
            config.pub_url.job_url("adder", "1.0.0"),
            "http://127.0.0.1:7205/pub/job/adder/1.0.0"
        );
    }
}
