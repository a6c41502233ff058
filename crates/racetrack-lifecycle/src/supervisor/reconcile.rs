//! Healing of lost jobs.

use tracing::{error, info};

use crate::deployer::DeploymentManager;
use crate::error::{LifecycleResult, ResultExt};
use crate::types::{Job, JobStatus};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Lost jobs provisioned again.
    pub reprovisioned: usize,
    /// Lost jobs whose reprovisioning failed.
    pub failed: usize,
}

/// Provision every lost job again.
///
/// A failing job is logged and skipped; it never stops the others.
pub async fn reconcile_jobs(manager: &DeploymentManager) -> LifecycleResult<ReconcileReport> {
    let jobs = manager
        .registry()
        .list_jobs()
        .await
        .context("reconciling jobs")?;

    let mut report = ReconcileReport::default();
    for job in jobs.iter().filter(|job| is_reconcile_eligible(job)) {
        info!(job_name = %job.name, job_version = %job.version, "reconciling lost job");
        match manager.reprovision_lost_job(job).await {
            Ok(_) => report.reprovisioned += 1,
            Err(e) => {
                report.failed += 1;
                error!(
                    job_name = %job.name,
                    job_version = %job.version,
                    error = %e,
                    "failed to reconcile job"
                );
            }
        }
    }
    Ok(report)
}

fn is_reconcile_eligible(job: &Job) -> bool {
    job.status == JobStatus::Lost && job.manifest_yaml.is_some()
}
