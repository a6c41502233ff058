//! Background supervision of deployed jobs.
//!
//! The supervisor runs a single scheduling loop. On every tick it runs the
//! tasks whose interval has elapsed, one after another:
//!
//! - registry sync against the infrastructure,
//! - reconciliation of lost jobs (when enabled),
//! - Prometheus discovery file population.
//!
//! A failing task is logged and retried on its next due time.

mod metrics;
mod reconcile;
mod sync;

pub use metrics::{populate_metrics_jobs, service_discovery_file, TargetGroup};
pub use reconcile::{reconcile_jobs, ReconcileReport};
pub use sync::{sync_registry_jobs, StatusCounts};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::deployer::DeploymentManager;
use crate::error::LifecycleResult;

/// Kind of periodic work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorTask {
    /// Registry sync against the infrastructure.
    Sync,
    /// Reprovisioning of lost jobs.
    Reconcile,
    /// Metrics discovery file population.
    Metrics,
}

impl SupervisorTask {
    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Reconcile => "reconcile",
            Self::Metrics => "metrics",
        }
    }
}

/// A task with its interval and the next instant it is due.
#[derive(Debug, Clone)]
struct Periodic {
    task: SupervisorTask,
    interval: Duration,
    due: Instant,
}

impl Periodic {
    fn new(task: SupervisorTask, interval: Duration, now: Instant) -> Self {
        Self {
            task,
            interval,
            due: now,
        }
    }

    /// Whether the task should run at `now`; moves the due time forward if so.
    fn poll(&mut self, now: Instant) -> bool {
        if now < self.due {
            return false;
        }
        self.due = now + self.interval;
        true
    }
}

/// Runs the periodic supervision tasks.
pub struct Supervisor {
    manager: Arc<DeploymentManager>,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Create a supervisor over the given deployment manager.
    #[must_use]
    pub fn new(manager: Arc<DeploymentManager>) -> Self {
        let config = manager.config().supervisor.clone();
        Self { manager, config }
    }

    /// Mark deployments interrupted by a previous shutdown as failed.
    pub async fn startup_cleanup(&self) -> LifecycleResult<usize> {
        let age = self.manager.config().deployment.stale_deployment_age;
        let halted = self.manager.registry().halt_stale_deployments(age).await?;
        if halted > 0 {
            warn!(halted, "stale deployments halted");
        }
        Ok(halted)
    }

    /// Run one task now.
    pub async fn run_task(&self, task: SupervisorTask) -> LifecycleResult<()> {
        match task {
            SupervisorTask::Sync => {
                let counts = sync_registry_jobs(self.manager.registry(), self.manager.targets()).await?;
                debug!(counts = ?counts, "registry synchronised");
            }
            SupervisorTask::Reconcile => {
                let report = reconcile_jobs(&self.manager).await?;
                if report.reprovisioned > 0 || report.failed > 0 {
                    info!(
                        reprovisioned = report.reprovisioned,
                        failed = report.failed,
                        "lost jobs reconciled"
                    );
                }
            }
            SupervisorTask::Metrics => {
                populate_metrics_jobs(self.manager.registry(), &self.manager.config().plugins_dir).await?;
            }
        }
        Ok(())
    }

    fn schedule(&self, now: Instant) -> Vec<Periodic> {
        let mut tasks = vec![Periodic::new(SupervisorTask::Sync, self.config.sync_interval, now)];
        if self.config.reconciliation_enabled {
            tasks.push(Periodic::new(
                SupervisorTask::Reconcile,
                self.config.reconcile_interval,
                now,
            ));
        }
        tasks.push(Periodic::new(SupervisorTask::Metrics, self.config.metrics_interval, now));
        tasks
    }

    /// Run the scheduling loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tasks = self.schedule(Instant::now());
        let mut ticker = tokio::time::interval(self.config.tick);
        info!(
            tick_secs = self.config.tick.as_secs(),
            reconciliation = self.config.reconciliation_enabled,
            "supervisor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    for periodic in &mut tasks {
                        if !periodic.poll(now) {
                            continue;
                        }
                        if let Err(e) = self.run_task(periodic.task).await {
                            error!(task = periodic.task.as_str(), error = %e, "periodic task failure");
                        }
                    }
                }
                () = cancel.cancelled() => {
                    break;
                }
            }
        }
        info!("supervisor stopped");
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
