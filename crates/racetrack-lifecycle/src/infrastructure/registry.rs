//! Name-to-target registry of infrastructure back-ends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use crate::config::{PubConfig, TargetConfig};
use crate::error::{LifecycleError, LifecycleResult};
use crate::monitor::JobProbe;

use super::docker::{DockerDeployer, DockerLogsStreamer, DockerMonitor, DockerOptions};
use super::memory::MemoryInfrastructure;
use super::remote::RemoteShell;
use super::shell::{CommandRunner, LocalShell};
use super::InfrastructureTarget;

const REMOTE_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

type TargetMap = BTreeMap<String, InfrastructureTarget>;

/// Process-wide map of available infrastructure targets.
///
/// Readers take a cheap snapshot; a reload swaps the whole map at once so
/// in-flight operations keep working with the targets they started with.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: RwLock<Arc<TargetMap>>,
}

impl TargetRegistry {
    /// Create a registry from targets; later entries win on a name clash.
    #[must_use]
    pub fn new(targets: impl IntoIterator<Item = InfrastructureTarget>) -> Self {
        Self {
            targets: RwLock::new(Arc::new(collect(targets))),
        }
    }

    /// Replace every target at once.
    pub fn replace(&self, targets: impl IntoIterator<Item = InfrastructureTarget>) {
        let targets = collect(targets);
        info!(targets = ?targets.keys().collect::<Vec<_>>(), "infrastructure targets loaded");
        *self.targets.write() = Arc::new(targets);
    }

    /// Current set of targets.
    #[must_use]
    pub fn snapshot(&self) -> Arc<BTreeMap<String, InfrastructureTarget>> {
        Arc::clone(&self.targets.read())
    }

    /// Target registered under `name`.
    pub fn get(&self, name: &str) -> LifecycleResult<InfrastructureTarget> {
        self.snapshot().get(name).cloned().ok_or_else(|| {
            LifecycleError::not_found(format!("infrastructure target \"{name}\" is not available"))
        })
    }

    /// Names of all targets, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    /// All targets, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<InfrastructureTarget> {
        self.snapshot().values().cloned().collect()
    }

    /// Pick the target a job should be deployed to.
    ///
    /// An explicitly requested target must exist. Otherwise the configured
    /// default is used, then the only available target.
    pub fn determine_infrastructure_name(
        &self,
        requested: Option<&str>,
        default: Option<&str>,
    ) -> LifecycleResult<String> {
        let targets = self.snapshot();
        let available = || targets.keys().cloned().collect::<Vec<_>>().join(", ");

        let selected = requested
            .filter(|name| !name.is_empty())
            .or_else(|| default.filter(|name| !name.is_empty()));
        if let Some(name) = selected {
            if targets.contains_key(name) {
                return Ok(name.to_owned());
            }
            return Err(LifecycleError::validation(format!(
                "Selected infrastructure target \"{name}\" is unavailable. Available are {}.",
                available()
            )));
        }

        match targets.len() {
            0 => Err(LifecycleError::validation(
                "No infrastructure targets available. Install appropriate plugin.",
            )),
            1 => Ok(targets.keys().next().cloned().unwrap_or_default()),
            _ => Err(LifecycleError::validation(format!(
                "Multiple infrastructure targets available: {:?}. Please pick one.",
                targets.keys().collect::<Vec<_>>()
            ))),
        }
    }
}

fn collect(targets: impl IntoIterator<Item = InfrastructureTarget>) -> TargetMap {
    targets
        .into_iter()
        .map(|target| (target.name.clone(), target))
        .collect()
}

/// Build the targets defined in configuration.
pub fn builtin_targets(
    configs: &[TargetConfig],
    probe: &JobProbe,
    pub_config: &PubConfig,
) -> LifecycleResult<Vec<InfrastructureTarget>> {
    configs
        .iter()
        .map(|config| builtin_target(config, probe, pub_config))
        .collect()
}

fn builtin_target(
    config: &TargetConfig,
    probe: &JobProbe,
    pub_config: &PubConfig,
) -> LifecycleResult<InfrastructureTarget> {
    match config {
        TargetConfig::Docker {
            name,
            network,
            local,
        } => {
            let options = DockerOptions {
                target_name: name.clone(),
                network: network.clone(),
                pub_internal_url: pub_config.internal.clone(),
                local: *local,
            };
            let runner: Arc<dyn CommandRunner> = Arc::new(LocalShell);
            Ok(InfrastructureTarget::new(name)
                .with_deployer(Arc::new(DockerDeployer::new(Arc::clone(&runner), options.clone())))
                .with_monitor(Arc::new(DockerMonitor::new(runner, probe.clone(), options)))
                .with_logs_streamer(Arc::new(DockerLogsStreamer)))
        }
        TargetConfig::Remote {
            name,
            gateway_url,
            gateway_token,
        } => {
            let options = DockerOptions {
                target_name: name.clone(),
                network: "racetrack_default".to_owned(),
                pub_internal_url: pub_config.internal.clone(),
                local: false,
            };
            let runner: Arc<dyn CommandRunner> = Arc::new(RemoteShell::new(
                gateway_url.as_str(),
                gateway_token.as_str(),
                REMOTE_COMMAND_TIMEOUT,
            )?);
            let monitor = DockerMonitor::new(Arc::clone(&runner), probe.clone(), options.clone())
                .with_gateway(gateway_url.as_str(), gateway_token.as_str());
            Ok(InfrastructureTarget::new(name)
                .with_deployer(Arc::new(DockerDeployer::new(runner, options)))
                .with_monitor(Arc::new(monitor))
                .with_remote_gateway(gateway_url.as_str(), gateway_token.as_str()))
        }
        TargetConfig::Memory { name } => Ok(MemoryInfrastructure::new(name).target()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::monitor::ProbeSettings;

    fn registry(names: &[&str]) -> TargetRegistry {
        TargetRegistry::new(names.iter().map(|n| InfrastructureTarget::new(*n)))
    }

    #[test]
    fn requested_target_must_be_available() {
        let registry = registry(&["docker", "kubernetes"]);
        assert_eq!(
            registry
                .determine_infrastructure_name(Some("kubernetes"), Some("docker"))
                .unwrap(),
            "kubernetes"
        );
        let err = registry
            .determine_infrastructure_name(Some("nomad"), None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Selected infrastructure target \"nomad\" is unavailable. Available are docker, kubernetes."
        );
    }

    #[test]
    fn default_then_single_target_is_used() {
        let registry = registry(&["docker", "kubernetes"]);
        assert_eq!(
            registry.determine_infrastructure_name(None, Some("docker")).unwrap(),
            "docker"
        );
        let err = registry.determine_infrastructure_name(None, None).unwrap_err();
        assert!(err.to_string().starts_with("Multiple infrastructure targets available"));

        let single = self::registry(&["docker"]);
        assert_eq!(single.determine_infrastructure_name(None, None).unwrap(), "docker");

        let empty = self::registry(&[]);
        assert_eq!(
            empty.determine_infrastructure_name(None, None).unwrap_err().to_string(),
            "No infrastructure targets available. Install appropriate plugin."
        );
    }

    #[test]
    fn later_registration_wins_and_reload_swaps() {
        let first = InfrastructureTarget::new("docker");
        let second = InfrastructureTarget::new("docker").with_remote_gateway("http://gw", "t");
        let registry = TargetRegistry::new([first, second]);
        assert_eq!(
            registry.get("docker").unwrap().remote_gateway_url.as_deref(),
            Some("http://gw")
        );

        let before = registry.snapshot();
        registry.replace([InfrastructureTarget::new("sandbox")]);
        assert_eq!(registry.names(), ["sandbox"]);
        assert!(before.contains_key("docker"));
        assert!(registry.get("docker").unwrap_err().is_not_found());
    }

    #[test]
    fn builtin_targets_follow_config() {
        let probe = JobProbe::new(ProbeSettings::default()).unwrap();
        let configs = vec![
            TargetConfig::Docker {
                name: "docker".to_owned(),
                network: "racetrack_default".to_owned(),
                local: false,
            },
            TargetConfig::Remote {
                name: "remote-eu".to_owned(),
                gateway_url: "https://pub.eu.example.com".to_owned(),
                gateway_token: "t0ken".to_owned(),
            },
            TargetConfig::Memory {
                name: "sandbox".to_owned(),
            },
        ];
        let targets = builtin_targets(&configs, &probe, &PubConfig::default()).unwrap();
        let registry = TargetRegistry::new(targets);

        let docker = registry.get("docker").unwrap();
        assert!(docker.logs_streamer().is_ok());
        let remote = registry.get("remote-eu").unwrap();
        assert!(remote.deployer().is_ok());
        assert!(remote.logs_streamer().is_err());
        assert_eq!(remote.remote_gateway_token.as_deref(), Some("t0ken"));
        assert!(registry.get("sandbox").unwrap().monitor().is_ok());
    }
}
