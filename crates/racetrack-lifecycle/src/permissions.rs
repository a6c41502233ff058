//! Deploy permission checks.
//!
//! Authentication and token handling live outside this service; it only
//! asks a [`PermissionChecker`] whether a subject holds a scope.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PermissionsConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::manifest::Manifest;

/// Operation a subject may be allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScope {
    /// Deploy a job whose family doesn't exist yet.
    DeployNewFamily,
    /// Deploy a version of an existing job family.
    DeployJob,
}

impl AuthScope {
    /// Get the scope name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DeployNewFamily => "deploy_new_family",
            Self::DeployJob => "deploy_job",
        }
    }
}

impl fmt::Display for AuthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AuthScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy_new_family" => Ok(Self::DeployNewFamily),
            "deploy_job" => Ok(Self::DeployJob),
            _ => Err(format!("unknown auth scope: {s}")),
        }
    }
}

/// Decides whether a subject holds a scope.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Require a scope that isn't tied to any job.
    async fn check_scope(&self, subject: &str, scope: AuthScope) -> LifecycleResult<()>;

    /// Require a scope on a particular job version.
    async fn check_resource_scope(
        &self,
        subject: &str,
        job_name: &str,
        job_version: &str,
        scope: AuthScope,
    ) -> LifecycleResult<()>;
}

/// Grants every scope to everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check_scope(&self, _subject: &str, _scope: AuthScope) -> LifecycleResult<()> {
        Ok(())
    }

    async fn check_resource_scope(
        &self,
        _subject: &str,
        _job_name: &str,
        _job_version: &str,
        _scope: AuthScope,
    ) -> LifecycleResult<()> {
        Ok(())
    }
}

/// A scope granted to a subject, optionally limited to one job family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Granted scope.
    pub scope: AuthScope,
    /// Family the grant is limited to, or any when absent.
    #[serde(default)]
    pub job_name: Option<String>,
}

/// Fixed subject-to-grants table.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    grants: HashMap<String, Vec<Grant>>,
}

impl StaticPermissions {
    /// Create an empty table denying everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding the configured grants.
    #[must_use]
    pub fn from_config(config: &PermissionsConfig) -> Self {
        let grants = config
            .grants
            .iter()
            .map(|(subject, grants)| (subject.clone(), grants.clone()))
            .collect();
        Self { grants }
    }

    /// Grant `scope` to `subject`, on every job or only on `job_name`.
    #[must_use]
    pub fn grant(mut self, subject: impl Into<String>, scope: AuthScope, job_name: Option<&str>) -> Self {
        self.grants.entry(subject.into()).or_default().push(Grant {
            scope,
            job_name: job_name.map(str::to_owned),
        });
        self
    }

    fn holds(&self, subject: &str, scope: AuthScope, job_name: Option<&str>) -> bool {
        self.grants.get(subject).is_some_and(|grants| {
            grants.iter().any(|grant| {
                grant.scope == scope
                    && match (&grant.job_name, job_name) {
                        (None, _) => true,
                        (Some(granted), Some(requested)) => granted == requested,
                        (Some(_), None) => false,
                    }
            })
        })
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissions {
    async fn check_scope(&self, subject: &str, scope: AuthScope) -> LifecycleResult<()> {
        if self.holds(subject, scope, None) {
            Ok(())
        } else {
            Err(LifecycleError::Unauthorized(format!(
                "{subject} has no access to scope {scope}"
            )))
        }
    }

    async fn check_resource_scope(
        &self,
        subject: &str,
        job_name: &str,
        job_version: &str,
        scope: AuthScope,
    ) -> LifecycleResult<()> {
        if self.holds(subject, scope, Some(job_name)) {
            Ok(())
        } else {
            Err(LifecycleError::Unauthorized(format!(
                "{subject} has no access to job {job_name} v{job_version} with scope {scope}"
            )))
        }
    }
}

/// Checker enforcing the configured grants, or allowing everything when
/// none are configured.
#[must_use]
pub fn permission_checker(config: Option<&PermissionsConfig>) -> Arc<dyn PermissionChecker> {
    match config {
        Some(config) => {
            info!(subjects = config.grants.len(), "deploy permissions enforced");
            Arc::new(StaticPermissions::from_config(config))
        }
        None => {
            warn!("no permission grants configured, every caller may deploy");
            Arc::new(AllowAll)
        }
    }
}

/// Require the scope needed to deploy the manifest.
///
/// Deploying into an existing family needs [`AuthScope::DeployJob`] on it;
/// starting a new family needs [`AuthScope::DeployNewFamily`].
pub async fn check_deploy_permissions(
    checker: &dyn PermissionChecker,
    subject: &str,
    manifest: &Manifest,
    family_exists: bool,
) -> LifecycleResult<()> {
    if family_exists {
        checker
            .check_resource_scope(subject, &manifest.name, &manifest.version, AuthScope::DeployJob)
            .await
    } else {
        checker.check_scope(subject, AuthScope::DeployNewFamily).await
    }
}
