//! Prometheus service discovery file of running jobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult, ResultExt};
use crate::registry::JobRegistry;
use crate::types::{Job, JobStatus};

/// Location of the discovery file under the plugins directory.
#[must_use]
pub fn service_discovery_file(plugins_dir: &Path) -> PathBuf {
    plugins_dir.join("metrics").join("sd_config_jobs.yaml")
}

/// One `file_sd` entry: the scrape addresses of a job and its labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    /// Addresses to scrape.
    pub targets: Vec<String>,
    /// Labels attached to every scraped series.
    pub labels: BTreeMap<String, String>,
}

/// Write a `file_sd` config listing every job that isn't lost.
pub async fn populate_metrics_jobs(registry: &JobRegistry, plugins_dir: &Path) -> LifecycleResult<PathBuf> {
    let path = service_discovery_file(plugins_dir);
    let (content, groups) = async {
        let jobs = registry.list_jobs().await?;
        let groups = service_discovery_groups(&jobs);
        Ok::<_, LifecycleError>((serde_yaml::to_string(&groups)?, groups.len()))
    }
    .await
    .context("populating Prometheus configuration")?;

    async {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, content).await
    }
    .await
    .map_err(|e| LifecycleError::internal(format!("writing {}: {e}", path.display())))?;

    debug!(path = %path.display(), groups, "metrics discovery file written");
    Ok(path)
}

/// Target groups of every job that isn't lost and has somewhere to scrape.
fn service_discovery_groups(jobs: &[Job]) -> Vec<TargetGroup> {
    jobs.iter()
        .filter(|job| job.status != JobStatus::Lost)
        .filter_map(job_target_group)
        .collect()
}

fn job_target_group(job: &Job) -> Option<TargetGroup> {
    let targets: Vec<String> = if job.replica_internal_names.is_empty() {
        job.internal_name.iter().cloned().collect()
    } else {
        job.replica_internal_names.clone()
    };
    if targets.is_empty() {
        return None;
    }

    let labels = BTreeMap::from([
        ("job".to_owned(), format!("job-{}-v-{}", job.name, job.version)),
        ("job_name".to_owned(), job.name.clone()),
        ("job_version".to_owned(), job.version.clone()),
    ]);
    Some(TargetGroup { targets, labels })
}
