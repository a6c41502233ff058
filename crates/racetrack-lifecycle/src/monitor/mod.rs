//! Observing jobs on their infrastructure targets.

mod probe;

pub use probe::{JobEndpoint, JobProbe, ProbeSettings, METRIC_LAST_CALL_TIMESTAMP};

use crate::error::{LifecycleResult, ResultExt};
use crate::infrastructure::{OnJobAlive, TargetRegistry};
use crate::types::Job;

/// List job workloads of every infrastructure target.
///
/// Fails as a whole if any target can't be listed, so that its jobs are
/// not mistaken for missing ones.
pub async fn list_cluster_jobs(targets: &TargetRegistry) -> LifecycleResult<Vec<Job>> {
    let mut jobs = Vec::new();
    for target in targets.list() {
        let listed = async { target.monitor()?.list_jobs().await }
            .await
            .with_context(|| format!("listing jobs of infrastructure target \"{}\"", target.name))?;
        jobs.extend(listed);
    }
    Ok(jobs)
}

/// Wait until a freshly deployed job is operational.
pub async fn check_job_condition(
    targets: &TargetRegistry,
    job: &Job,
    deployment_timestamp: i64,
    on_alive: Option<OnJobAlive<'_>>,
) -> LifecycleResult<()> {
    let target = targets.get(job.infrastructure_target.as_deref().unwrap_or_default())?;
    target
        .monitor()?
        .check_condition(job, deployment_timestamp, on_alive)
        .await
}

/// Last `tail` output lines of a job.
pub async fn read_recent_logs(targets: &TargetRegistry, job: &Job, tail: usize) -> LifecycleResult<String> {
    async {
        let target = targets.get(job.infrastructure_target.as_deref().unwrap_or_default())?;
        target.monitor()?.read_recent_logs(job, tail).await
    }
    .await
    .context("reading job logs")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::infrastructure::{InfrastructureTarget, MemoryInfrastructure};

    #[tokio::test]
    async fn listing_spans_all_targets() {
        let a = MemoryInfrastructure::new("a");
        let b = MemoryInfrastructure::new("b");
        a.insert_foreign("adder", "1.0.0").unwrap();
        b.insert_foreign("python-class", "0.1.0").unwrap();
        let registry = TargetRegistry::new([a.target(), b.target()]);

        let jobs = list_cluster_jobs(&registry).await.unwrap();
        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, ["adder", "python-class"]);
    }

    #[tokio::test]
    async fn target_without_monitor_fails_listing() {
        let registry = TargetRegistry::new([InfrastructureTarget::new("bare")]);
        let err = list_cluster_jobs(&registry).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "listing jobs of infrastructure target \"bare\": infrastructure target \"bare\" has no job monitor"
        );
    }

    #[tokio::test]
    async fn logs_are_read_from_the_job_target() {
        let infra = MemoryInfrastructure::new("sandbox");
        infra.push_log("adder", "1.0.0", "hello").unwrap();
        let registry = TargetRegistry::new([infra.target()]);

        let mut job = Job::new("adder", "1.0.0");
        job.infrastructure_target = Some("sandbox".to_owned());
        assert_eq!(read_recent_logs(&registry, &job, 20).await.unwrap(), "hello");

        job.infrastructure_target = Some("gone".to_owned());
        let err = read_recent_logs(&registry, &job, 20).await.unwrap_err();
        assert!(err.to_string().starts_with("reading job logs: "));
    }
}
