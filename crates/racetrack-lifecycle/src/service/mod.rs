//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling and graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api;
use crate::builder::ImageBuilderClient;
use crate::config::LifecycleConfig;
use crate::deployer::DeploymentManager;
use crate::error::{LifecycleError, LifecycleResult};
use crate::infrastructure::builtin_targets;
use crate::monitor::{JobProbe, ProbeSettings};
use crate::permissions::permission_checker;
use crate::plugin::PluginEngine;
use crate::registry::JobRegistry;
use crate::store::open_store;
use crate::supervisor::Supervisor;

/// The lifecycle service.
///
/// Manages the lifecycle of the lifecycle service, including:
/// - Database connection
/// - Plugins and infrastructure targets
/// - Supervisor loop
/// - HTTP API server
/// - Signal handling and graceful shutdown
pub struct LifecycleService {
    config: Arc<LifecycleConfig>,
    cancel: CancellationToken,
}

impl LifecycleService {
    /// Create a new lifecycle service with the given configuration.
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    /// Run the lifecycle service.
    ///
    /// This will:
    /// 1. Open the store (or use the in-memory store as fallback)
    /// 2. Halt deployments interrupted by a previous shutdown
    /// 3. Load plugins and infrastructure targets
    /// 4. Start the supervisor loop
    /// 5. Serve the HTTP API until a shutdown signal
    pub async fn run(&self) -> LifecycleResult<()> {
        let manager = Arc::new(self.create_manager().await?);
        info!("deployment manager initialised");

        let supervisor = Supervisor::new(Arc::clone(&manager));
        if let Err(e) = supervisor.startup_cleanup().await {
            warn!(error = %e, "failed to halt stale deployments");
        }
        let supervisor_cancel = self.cancel.child_token();
        let supervisor_task = tokio::spawn(async move {
            supervisor.run(supervisor_cancel).await;
        });

        let app = api::router(api::AppState::new(manager));
        let listener = tokio::net::TcpListener::bind(self.config.server.listen_addr)
            .await
            .map_err(|e| LifecycleError::Config(format!("failed to bind TCP: {e}")))?;
        info!(listen_addr = %self.config.server.listen_addr, "lifecycle service listening");

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(self.cancel.clone()))
            .await
            .map_err(|e| LifecycleError::Config(format!("server error: {e}")));

        self.cancel.cancel();
        if let Err(e) = supervisor_task.await {
            error!(error = %e, "supervisor task panicked");
        }
        served?;

        info!("lifecycle service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn create_manager(&self) -> LifecycleResult<DeploymentManager> {
        let store = open_store(&self.config.database).await?;
        let registry = JobRegistry::new(store);

        let probe = JobProbe::new(ProbeSettings {
            timeout_until_alive: self.config.deployment.timeout_until_job_alive,
            timeout_until_ready: self.config.deployment.timeout_until_job_ready,
            ..ProbeSettings::default()
        })?;
        let targets = builtin_targets(
            &self.config.infrastructure.targets,
            &probe,
            &self.config.pub_url,
        )?;
        let plugins = Arc::new(PluginEngine::new(targets, Vec::new())?);
        info!(targets = ?plugins.targets().names(), "infrastructure targets configured");

        let builder = ImageBuilderClient::new(&self.config.image_builder)?;
        info!(url = %self.config.image_builder.url, "image builder client configured");

        Ok(DeploymentManager::new(
            Arc::clone(&self.config),
            registry,
            plugins,
            Arc::new(builder),
            permission_checker(self.config.permissions.as_ref()),
        ))
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
