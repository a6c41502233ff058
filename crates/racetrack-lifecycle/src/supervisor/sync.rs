//! Registry synchronisation with the infrastructure.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use crate::error::{LifecycleError, LifecycleResult, ResultExt};
use crate::infrastructure::TargetRegistry;
use crate::monitor::list_cluster_jobs;
use crate::registry::JobRegistry;
use crate::types::{Job, JobStatus};

/// Number of jobs per status after a synchronisation.
pub type StatusCounts = BTreeMap<JobStatus, usize>;

/// Confront registered jobs with the workloads the infrastructure reports.
///
/// - Jobs still being created are left alone.
/// - Present jobs take the infrastructure's view of their state.
/// - Missing jobs become `lost`.
/// - Workloads nobody registered are counted and logged as `orphaned`.
pub async fn sync_registry_jobs(
    registry: &JobRegistry,
    targets: &TargetRegistry,
) -> LifecycleResult<StatusCounts> {
    async {
        let mut infrastructure_jobs = job_map(list_cluster_jobs(targets).await?);
        let registry_jobs = registry.list_jobs().await?;
        let mut counts = StatusCounts::new();

        for mut registry_job in registry_jobs {
            let resource_name = registry_job.resource_name();
            let infrastructure_job = infrastructure_jobs.remove(&resource_name);
            if registry_job.status != JobStatus::Created {
                match infrastructure_job {
                    Some(infrastructure_job) => {
                        if apply_infrastructure_state(&mut registry_job, infrastructure_job) {
                            registry.update_job(&registry_job).await?;
                        }
                    }
                    None if registry_job.status != JobStatus::Lost => {
                        info!(job_name = %registry_job.name, job_version = %registry_job.version, "job is lost");
                        registry_job.status = JobStatus::Lost;
                        registry.update_job(&registry_job).await?;
                    }
                    None => {}
                }
            }
            *counts.entry(registry_job.status).or_default() += 1;
        }

        for orphan in infrastructure_jobs.into_values() {
            *counts.entry(JobStatus::Orphaned).or_default() += 1;
            warn!(
                job_name = %orphan.name,
                job_version = %orphan.version,
                internal_name = orphan.internal_name.as_deref().unwrap_or_default(),
                "orphaned job found"
            );
        }

        let total: usize = counts.values().sum();
        if counts.get(&JobStatus::Running).copied().unwrap_or_default() != total {
            debug!(counts = ?counts, "jobs synchronised");
        }
        Ok::<_, LifecycleError>(counts)
    }
    .await
    .context("synchronizing jobs")
}

fn job_map(jobs: Vec<Job>) -> HashMap<String, Job> {
    jobs.into_iter().map(|job| (job.resource_name(), job)).collect()
}

/// Copy the infrastructure's view onto a registry job.
///
/// Returns whether anything changed.
fn apply_infrastructure_state(registry_job: &mut Job, infrastructure_job: Job) -> bool {
    let mut changed = false;

    if registry_job.status != infrastructure_job.status {
        debug!(
            job_name = %registry_job.name,
            job_version = %registry_job.version,
            from = %registry_job.status,
            to = %infrastructure_job.status,
            "job changed status"
        );
        registry_job.status = infrastructure_job.status;
        changed = true;
    }
    if registry_job.error != infrastructure_job.error {
        registry_job.error = infrastructure_job.error;
        changed = true;
    }
    if infrastructure_job.infrastructure_target.is_some()
        && registry_job.infrastructure_target != infrastructure_job.infrastructure_target
    {
        registry_job.infrastructure_target = infrastructure_job.infrastructure_target;
        changed = true;
    }
    if registry_job.internal_name != infrastructure_job.internal_name {
        registry_job.internal_name = infrastructure_job.internal_name;
        changed = true;
    }
    if registry_job.replica_internal_names != infrastructure_job.replica_internal_names {
        registry_job.replica_internal_names = infrastructure_job.replica_internal_names;
        changed = true;
    }
    if registry_job.infrastructure_stats != infrastructure_job.infrastructure_stats {
        registry_job.infrastructure_stats = infrastructure_job.infrastructure_stats;
        changed = true;
    }
    if let Some(last_call) = infrastructure_job.last_call_time {
        if registry_job.last_call_time.map_or(true, |known| known < last_call) {
            registry_job.last_call_time = Some(last_call);
            changed = true;
        }
    }

    changed
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::infrastructure::MemoryInfrastructure;
    use crate::store::MemoryStore;

    async fn registered(registry: &JobRegistry, version: &str, status: JobStatus) -> Job {
        let mut job = Job::new("adder", version);
        job.status = status;
        job.infrastructure_target = Some("memory".to_owned());
        registry.save_job(&job).await.unwrap()
    }

    #[tokio::test]
    async fn missing_jobs_become_lost_and_orphans_are_counted() {
        let infrastructure = MemoryInfrastructure::new("memory");
        let targets = TargetRegistry::new([infrastructure.target()]);
        let registry = JobRegistry::new(Arc::new(MemoryStore::new()));

        registered(&registry, "1.0.0", JobStatus::Running).await;
        registered(&registry, "2.0.0", JobStatus::Created).await;
        infrastructure.insert_foreign("stranger", "0.1.0").unwrap();

        let counts = sync_registry_jobs(&registry, &targets).await.unwrap();
        assert_eq!(counts.get(&JobStatus::Lost), Some(&1));
        assert_eq!(counts.get(&JobStatus::Created), Some(&1));
        assert_eq!(counts.get(&JobStatus::Orphaned), Some(&1));

        assert_eq!(
            registry.read_job("adder", "1.0.0").await.unwrap().status,
            JobStatus::Lost
        );
        assert_eq!(
            registry.read_job("adder", "2.0.0").await.unwrap().status,
            JobStatus::Created
        );
    }

    #[tokio::test]
    async fn present_jobs_take_infrastructure_state() {
        let infrastructure = MemoryInfrastructure::new("memory");
        let targets = TargetRegistry::new([infrastructure.target()]);
        let registry = JobRegistry::new(Arc::new(MemoryStore::new()));

        registered(&registry, "1.0.0", JobStatus::Lost).await;
        infrastructure.insert_foreign("adder", "1.0.0").unwrap();

        let counts = sync_registry_jobs(&registry, &targets).await.unwrap();
        assert_eq!(counts.get(&JobStatus::Running), Some(&1));
        let job = registry.read_job("adder", "1.0.0").await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.internal_name.is_some());
    }

    #[test]
    fn only_newer_call_times_are_taken() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::minutes(5);

        let mut registry_job = Job::new("adder", "1.0.0");
        registry_job.last_call_time = Some(now);
        let mut infrastructure_job = registry_job.clone();
        infrastructure_job.last_call_time = Some(earlier);
        assert!(!apply_infrastructure_state(&mut registry_job, infrastructure_job));
        assert_eq!(registry_job.last_call_time, Some(now));

        let mut infrastructure_job = registry_job.clone();
        infrastructure_job.last_call_time = None;
        infrastructure_job.error = Some("crash loop".to_owned());
        assert!(apply_infrastructure_state(&mut registry_job, infrastructure_job));
        assert_eq!(registry_job.error.as_deref(), Some("crash loop"));
        assert_eq!(registry_job.last_call_time, Some(now));
    }
}
