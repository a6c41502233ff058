//! Plugin interface and the engine invoking plugin hooks.
//!
//! Plugins are compiled in and handed to the [`PluginEngine`] at startup.
//! Every plugin declares the hook API version it was written against; the
//! engine refuses plugins built for a version it doesn't speak.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{LifecycleError, LifecycleResult, ResultExt};
use crate::infrastructure::{InfrastructureTarget, TargetRegistry};
use crate::manifest::Manifest;
use crate::types::Job;

/// Hook API version spoken by this engine.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Extension hooks invoked around the job lifecycle.
///
/// Every hook has a no-op default, so a plugin only overrides what it needs.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name.
    fn name(&self) -> &str;

    /// Plugin version.
    fn version(&self) -> &str;

    /// Hook API version the plugin implements.
    fn api_version(&self) -> u32 {
        PLUGIN_API_VERSION
    }

    /// Infrastructure targets contributed by the plugin.
    fn infrastructure_targets(&self) -> Vec<InfrastructureTarget> {
        Vec::new()
    }

    /// Extra runtime variables set on every deployed job.
    fn job_runtime_env_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Check job-type-specific parts of a manifest.
    async fn validate_job_manifest(&self, manifest: &Manifest, job_type: &str) -> LifecycleResult<()> {
        let _ = (manifest, job_type);
        Ok(())
    }

    /// Act on a freshly deployed job.
    async fn post_job_deploy(
        &self,
        job: &Job,
        manifest: &Manifest,
        image_name: &str,
        deployer_username: Option<&str>,
    ) -> LifecycleResult<()> {
        let _ = (job, manifest, image_name, deployer_username);
        Ok(())
    }

    /// Act on a deleted job.
    async fn post_job_delete(&self, job: &Job, username_executor: Option<&str>) -> LifecycleResult<()> {
        let _ = (job, username_executor);
        Ok(())
    }
}

/// Owns the loaded plugins and the infrastructure registry built from them.
pub struct PluginEngine {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    builtin_targets: Vec<InfrastructureTarget>,
    targets: Arc<TargetRegistry>,
}

impl PluginEngine {
    /// Create an engine with the given built-in targets and plugins.
    pub fn new(
        builtin_targets: Vec<InfrastructureTarget>,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> LifecycleResult<Self> {
        check_api_versions(&plugins)?;
        let engine = Self {
            plugins: RwLock::new(plugins),
            builtin_targets,
            targets: Arc::new(TargetRegistry::default()),
        };
        engine.reload()?;
        Ok(engine)
    }

    /// Registry of available infrastructure targets.
    #[must_use]
    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.targets
    }

    /// Swap the plugin set and rebuild the infrastructure registry.
    pub fn replace_plugins(&self, plugins: Vec<Arc<dyn Plugin>>) -> LifecycleResult<()> {
        check_api_versions(&plugins)?;
        *self
            .plugins
            .write()
            .map_err(|_| LifecycleError::internal("lock poisoned"))? = plugins;
        self.reload()
    }

    /// Rebuild the infrastructure registry from built-ins and plugin targets.
    ///
    /// Plugin targets override built-ins of the same name; later plugins
    /// override earlier ones.
    pub fn reload(&self) -> LifecycleResult<()> {
        let plugins = self.plugins()?;
        let mut targets = self.builtin_targets.clone();
        for plugin in &plugins {
            targets.extend(plugin.infrastructure_targets());
        }
        self.targets.replace(targets);

        let loaded: Vec<String> = plugins
            .iter()
            .map(|p| format!("{} ({})", p.name(), p.version()))
            .collect();
        info!(plugins = ?loaded, "plugins loaded");
        Ok(())
    }

    /// Name and version of every loaded plugin.
    pub fn plugin_list(&self) -> LifecycleResult<Vec<(String, String)>> {
        Ok(self
            .plugins()?
            .iter()
            .map(|p| (p.name().to_owned(), p.version().to_owned()))
            .collect())
    }

    /// Runtime variables contributed by all plugins; later plugins win.
    pub fn job_runtime_env_vars(&self) -> LifecycleResult<BTreeMap<String, String>> {
        let mut vars = BTreeMap::new();
        for plugin in self.plugins()? {
            vars.extend(plugin.job_runtime_env_vars());
        }
        Ok(vars)
    }

    /// Run every plugin's manifest validation.
    ///
    /// Any failure is reported as an invalid manifest.
    pub async fn validate_job_manifest(&self, manifest: &Manifest, job_type: &str) -> LifecycleResult<()> {
        for plugin in self.plugins()? {
            plugin
                .validate_job_manifest(manifest, job_type)
                .await
                .with_context(|| hook_context("validate_job_manifest", plugin.as_ref()))
                .map_err(|e| LifecycleError::validation(format!("job manifest is invalid: {e}")))?;
        }
        Ok(())
    }

    /// Run every plugin's post-deploy hook.
    pub async fn post_job_deploy(
        &self,
        job: &Job,
        manifest: &Manifest,
        image_name: &str,
        deployer_username: Option<&str>,
    ) -> LifecycleResult<()> {
        for plugin in self.plugins()? {
            plugin
                .post_job_deploy(job, manifest, image_name, deployer_username)
                .await
                .with_context(|| hook_context("post_job_deploy", plugin.as_ref()))?;
        }
        Ok(())
    }

    /// Run every plugin's post-delete hook.
    pub async fn post_job_delete(&self, job: &Job, username_executor: Option<&str>) -> LifecycleResult<()> {
        for plugin in self.plugins()? {
            plugin
                .post_job_delete(job, username_executor)
                .await
                .with_context(|| hook_context("post_job_delete", plugin.as_ref()))?;
        }
        Ok(())
    }

    fn plugins(&self) -> LifecycleResult<Vec<Arc<dyn Plugin>>> {
        self.plugins
            .read()
            .map(|plugins| plugins.clone())
            .map_err(|_| LifecycleError::internal("lock poisoned"))
    }
}

impl std::fmt::Debug for PluginEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEngine")
            .field("targets", &self.targets.names())
            .finish_non_exhaustive()
    }
}

fn hook_context(hook: &str, plugin: &dyn Plugin) -> String {
    debug!(hook, plugin = plugin.name(), "invoking plugin hook");
    format!(
        "Invoking hook \"{hook}\" of plugin {} {}",
        plugin.name(),
        plugin.version()
    )
}

fn check_api_versions(plugins: &[Arc<dyn Plugin>]) -> LifecycleResult<()> {
    for plugin in plugins {
        if plugin.api_version() != PLUGIN_API_VERSION {
            return Err(LifecycleError::Config(format!(
                "plugin {} {} implements API version {}, supported is {PLUGIN_API_VERSION}",
                plugin.name(),
                plugin.version(),
                plugin.api_version()
            )));
        }
    }
    Ok(())
}

/// Job type name a manifest is built with.
#[must_use]
pub fn manifest_job_type(manifest: &Manifest) -> String {
    manifest
        .jobtype
        .clone()
        .unwrap_or_else(|| "dockerfile".to_owned())
}
