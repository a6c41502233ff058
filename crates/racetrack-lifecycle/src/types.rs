//! Core registry types for racetrack-lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Port every job's HTTP server listens on inside its workload.
pub const JOB_INTERNAL_PORT: u16 = 7000;

/// Generate a fresh lowercase ULID string.
#[must_use]
pub fn generate_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// Name of the infrastructure resource hosting a job version.
///
/// Dots and other characters not allowed in DNS labels are replaced with `-`.
#[must_use]
pub fn job_resource_name(name: &str, version: &str) -> String {
    let sanitise = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!("job-{}-v-{}", sanitise(name), sanitise(version))
}

/// Unique identifier for a deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Create a deployment ID from an existing value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique deployment ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_id())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DeploymentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of a job version: `(name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    /// Job (family) name.
    pub name: String,
    /// Job version.
    pub version: String,
}

impl JobKey {
    /// Create a new job key.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Infrastructure resource name for this job version.
    #[must_use]
    pub fn resource_name(&self) -> String {
        job_resource_name(&self.name, &self.version)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// Status of a job as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Workload is being created; the deployment is still in progress.
    Created,
    /// Workload is live and ready.
    Running,
    /// Workload exists but reported a failure.
    Error,
    /// Infrastructure hosts a workload the registry doesn't know about.
    Orphaned,
    /// Registry expects a workload the infrastructure doesn't report.
    Lost,
}

impl JobStatus {
    /// All statuses, in display order.
    pub const ALL: [Self; 5] = [
        Self::Created,
        Self::Running,
        Self::Error,
        Self::Orphaned,
        Self::Lost,
    ];

    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Error => "error",
            Self::Orphaned => "orphaned",
            Self::Lost => "lost",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            "orphaned" => Ok(Self::Orphaned),
            "lost" => Ok(Self::Lost),
            _ => Err(format!("unknown job status: {s}")),
        }
    }
}

/// Status of a deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Pipeline is running.
    InProgress,
    /// Pipeline finished successfully.
    Done,
    /// Pipeline failed or was halted.
    Failed,
}

impl DeploymentStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// Named group of job versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFamily {
    /// Unique identifier.
    pub id: String,
    /// Family name, shared by all its job versions.
    pub name: String,
}

impl JobFamily {
    /// Create a family record with a generated ID.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
        }
    }
}

/// A deployed (or deploying) job version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier. Empty until the store assigns one.
    pub id: String,
    /// Family this version belongs to.
    pub family_id: String,
    /// Job name.
    pub name: String,
    /// Job version.
    pub version: String,
    /// Current status.
    pub status: JobStatus,
    /// When the record was created.
    pub create_time: DateTime<Utc>,
    /// When the record was last written.
    pub update_time: DateTime<Utc>,
    /// Manifest YAML exactly as submitted.
    pub manifest_yaml: Option<String>,
    /// Address the job is reachable at inside the cluster (`host:port`).
    pub internal_name: Option<String>,
    /// Public URL the job is exposed at.
    pub pub_url: Option<String>,
    /// Last error reported for the job.
    pub error: Option<String>,
    /// Image tag the job runs.
    pub image_tag: Option<String>,
    /// Username that deployed the job.
    pub deployed_by: Option<String>,
    /// Last time the job was called through the gateway.
    pub last_call_time: Option<DateTime<Utc>>,
    /// Infrastructure target hosting the job.
    pub infrastructure_target: Option<String>,
    /// Internal hostnames of the job replicas.
    #[serde(default)]
    pub replica_internal_names: Vec<String>,
    /// Job type and version used to build the job.
    #[serde(default)]
    pub job_type_version: String,
    /// Statistics of the job seen by the infrastructure.
    pub infrastructure_stats: Option<serde_json::Value>,
}

impl Job {
    /// Create a job record in the `created` state.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            family_id: String::new(),
            name: name.into(),
            version: version.into(),
            status: JobStatus::Created,
            create_time: now,
            update_time: now,
            manifest_yaml: None,
            internal_name: None,
            pub_url: None,
            error: None,
            image_tag: None,
            deployed_by: None,
            last_call_time: None,
            infrastructure_target: None,
            replica_internal_names: Vec::new(),
            job_type_version: String::new(),
            infrastructure_stats: None,
        }
    }

    /// The `(name, version)` identity.
    #[must_use]
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.name, &self.version)
    }

    /// Infrastructure resource name for this job.
    #[must_use]
    pub fn resource_name(&self) -> String {
        job_resource_name(&self.name, &self.version)
    }
}

/// A single deployment attempt of a job version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique identifier.
    pub id: DeploymentId,
    /// Current status.
    pub status: DeploymentStatus,
    /// When the attempt started.
    pub create_time: DateTime<Utc>,
    /// When the record was last written.
    pub update_time: DateTime<Utc>,
    /// Manifest YAML being deployed.
    pub manifest_yaml: String,
    /// Terminal error message of a failed attempt.
    pub error: Option<String>,
    /// Job name.
    pub job_name: String,
    /// Job version.
    pub job_version: String,
    /// Username that requested the deployment.
    pub deployed_by: Option<String>,
    /// Logs returned by the image builder.
    pub build_logs: Option<String>,
    /// Current pipeline phase, cleared on success.
    pub phase: Option<String>,
    /// Name of the built image.
    pub image_name: Option<String>,
    /// Infrastructure target selected for the attempt.
    pub infrastructure_target: Option<String>,
    /// Newline-separated warnings collected during the attempt.
    pub warnings: Option<String>,
}

impl Deployment {
    /// Create a deployment record in the `in_progress` state.
    #[must_use]
    pub fn new(
        key: &JobKey,
        manifest_yaml: impl Into<String>,
        deployed_by: Option<String>,
        infrastructure_target: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            status: DeploymentStatus::InProgress,
            create_time: now,
            update_time: now,
            manifest_yaml: manifest_yaml.into(),
            error: None,
            job_name: key.name.clone(),
            job_version: key.version.clone(),
            deployed_by,
            build_logs: None,
            phase: None,
            image_name: None,
            infrastructure_target,
            warnings: None,
        }
    }

    /// The `(name, version)` identity of the deployed job.
    #[must_use]
    pub fn job_key(&self) -> JobKey {
        JobKey::new(&self.job_name, &self.job_version)
    }
}

/// Kind of audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLogEventType {
    /// New job version deployed.
    JobDeployed,
    /// Existing job version deployed again.
    JobRedeployed,
    /// Job version deleted.
    JobDeleted,
    /// Job version moved to another infrastructure target.
    JobMoved,
    /// Deployment attempt failed.
    DeploymentFailed,
}

impl AuditLogEventType {
    /// Get the event type name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::JobDeployed => "job_deployed",
            Self::JobRedeployed => "job_redeployed",
            Self::JobDeleted => "job_deleted",
            Self::JobMoved => "job_moved",
            Self::DeploymentFailed => "deployment_failed",
        }
    }
}

impl fmt::Display for AuditLogEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AuditLogEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job_deployed" => Ok(Self::JobDeployed),
            "job_redeployed" => Ok(Self::JobRedeployed),
            "job_deleted" => Ok(Self::JobDeleted),
            "job_moved" => Ok(Self::JobMoved),
            "deployment_failed" => Ok(Self::DeploymentFailed),
            _ => Err(format!("unknown audit event type: {s}")),
        }
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEvent {
    /// Unique identifier.
    pub id: String,
    /// Record format version.
    pub version: i32,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Kind of event.
    pub event_type: AuditLogEventType,
    /// Free-form event properties.
    pub properties: Option<serde_json::Value>,
    /// User who performed the action.
    pub username_executor: Option<String>,
    /// User affected by the action.
    pub username_subject: Option<String>,
    /// Job name the event concerns.
    pub job_name: Option<String>,
    /// Job version the event concerns.
    pub job_version: Option<String>,
}

impl AuditLogEvent {
    /// Current audit record format version.
    pub const FORMAT_VERSION: i32 = 1;

    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: AuditLogEventType) -> Self {
        Self {
            id: generate_id(),
            version: Self::FORMAT_VERSION,
            timestamp: Utc::now(),
            event_type,
            properties: None,
            username_executor: None,
            username_subject: None,
            job_name: None,
            job_version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_name_is_dns_friendly() {
        assert_eq!(job_resource_name("adder", "1.0.0"), "job-adder-v-1-0-0");
        assert_eq!(
            JobKey::new("Python_Class", "0.1.2-rc").resource_name(),
            "job-python-class-v-0-1-2-rc"
        );
    }

    #[test]
    fn statuses_parse_their_own_names() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert_eq!(
            "in_progress".parse::<DeploymentStatus>(),
            Ok(DeploymentStatus::InProgress)
        );
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_serialises_snake_case() {
        let json = serde_json::to_string(&DeploymentStatus::InProgress).unwrap_or_default();
        assert_eq!(json, "\"in_progress\"");
    }
}
