//! Common test utilities for lifecycle integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use racetrack_lifecycle::builder::{BuildOutcome, BuildRequest, ImageBuilder};
use racetrack_lifecycle::infrastructure::MemoryInfrastructure;
use racetrack_lifecycle::permissions::{AllowAll, PermissionChecker};
use racetrack_lifecycle::plugin::{Plugin, PluginEngine};
use racetrack_lifecycle::{
    DeploymentManager, JobDeploymentRequest, JobRegistry, LifecycleConfig, LifecycleResult,
    MemoryStore, Supervisor,
};

/// Manifest of the `adder` job in a given version.
pub fn adder_manifest(version: &str) -> String {
    format!(
        "name: adder\nversion: {version}\nowner_email: nobody@example.com\njobtype: python3:latest\n\
         git:\n  remote: https://github.com/example/adder\n"
    )
}

/// Image builder answering instantly, optionally held back until released.
#[derive(Default)]
pub struct FakeBuilder {
    builds: AtomicUsize,
    gate: Option<Arc<Notify>>,
    failure: Mutex<Option<String>>,
}

impl FakeBuilder {
    /// Builder whose builds wait until the returned handle is notified.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let builder = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (builder, gate)
    }

    /// Make every following build report `error`, or succeed again with `None`.
    pub fn fail_builds(&self, error: Option<&str>) {
        *self.failure.lock().unwrap() = error.map(str::to_owned);
    }

    /// Number of builds started.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn wait_ready(&self) -> LifecycleResult<()> {
        Ok(())
    }

    async fn build(&self, request: &BuildRequest) -> LifecycleResult<BuildOutcome> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(BuildOutcome {
            image_names: vec![format!(
                "registry.local/racetrack/job-entrypoint:{}-{}",
                request.manifest.name, request.tag
            )],
            logs: format!("building {}\ndone", request.manifest.name),
            error: self.failure.lock().unwrap().clone(),
        })
    }
}

/// Complete lifecycle setup on an in-memory store and infrastructure target.
pub struct TestLifecycle {
    pub infrastructure: MemoryInfrastructure,
    pub builder: Arc<FakeBuilder>,
    pub manager: Arc<DeploymentManager>,
    pub supervisor: Supervisor,
}

impl TestLifecycle {
    /// Creates a lifecycle with default configuration.
    pub fn new() -> Self {
        Self::with_builder(FakeBuilder::default())
    }

    /// Creates a lifecycle using the given image builder.
    pub fn with_builder(builder: FakeBuilder) -> Self {
        Self::build(builder, Vec::new(), Arc::new(AllowAll))
    }

    /// Creates a lifecycle with the given plugins loaded.
    pub fn with_plugins(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self::build(FakeBuilder::default(), plugins, Arc::new(AllowAll))
    }

    /// Creates a lifecycle checking deploy permissions with `permissions`.
    pub fn with_permissions(permissions: Arc<dyn PermissionChecker>) -> Self {
        Self::build(FakeBuilder::default(), Vec::new(), permissions)
    }

    fn build(
        builder: FakeBuilder,
        plugins: Vec<Arc<dyn Plugin>>,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        let infrastructure = MemoryInfrastructure::new("memory");
        let plugins = Arc::new(PluginEngine::new(vec![infrastructure.target()], plugins).unwrap());
        let builder = Arc::new(builder);
        let manager = Arc::new(DeploymentManager::new(
            Arc::new(LifecycleConfig::default()),
            JobRegistry::new(Arc::new(MemoryStore::new())),
            plugins,
            Arc::clone(&builder) as Arc<dyn ImageBuilder>,
            permissions,
        ));
        let supervisor = Supervisor::new(Arc::clone(&manager));

        Self {
            infrastructure,
            builder,
            manager,
            supervisor,
        }
    }

    /// The job registry.
    pub fn registry(&self) -> &JobRegistry {
        self.manager.registry()
    }

    /// Deploys `adder` in the given version and waits for the outcome.
    pub async fn deploy_adder(&self, version: &str) -> racetrack_lifecycle::Deployment {
        self.manager
            .deploy(
                JobDeploymentRequest::new(adder_manifest(version)),
                Some("alice".to_owned()),
            )
            .await
            .unwrap()
    }
}

impl Default for TestLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
