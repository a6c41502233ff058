//! Audit trail of job lifecycle actions.

use std::sync::Arc;

use tracing::info;

use crate::error::LifecycleResult;
use crate::store::{AuditFilter, JobStore};
use crate::types::{AuditLogEvent, AuditLogEventType};

impl AuditLogEvent {
    /// Set the user who performed the action.
    #[must_use]
    pub fn executor(mut self, username: Option<&str>) -> Self {
        self.username_executor = username.map(str::to_owned);
        self
    }

    /// Set the user affected by the action.
    #[must_use]
    pub fn subject(mut self, username: Option<&str>) -> Self {
        self.username_subject = username.map(str::to_owned);
        self
    }

    /// Set the job the event concerns.
    #[must_use]
    pub fn job(mut self, name: &str, version: &str) -> Self {
        self.job_name = Some(name.to_owned());
        self.job_version = Some(version.to_owned());
        self
    }

    /// Attach free-form properties.
    #[must_use]
    pub fn properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Writes and queries audit events.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn JobStore>,
}

impl AuditLogger {
    /// Create a logger writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Persist an event.
    pub async fn log_event(&self, event: AuditLogEvent) -> LifecycleResult<()> {
        self.store.append_audit_event(&event).await?;
        info!(
            event_type = %event.event_type,
            executor = event.username_executor.as_deref().unwrap_or_default(),
            job_name = event.job_name.as_deref().unwrap_or_default(),
            job_version = event.job_version.as_deref().unwrap_or_default(),
            "Audit log event saved"
        );
        Ok(())
    }

    /// Shorthand for an event about a job.
    pub async fn log_job_event(
        &self,
        event_type: AuditLogEventType,
        job_name: &str,
        job_version: &str,
        executor: Option<&str>,
        subject: Option<&str>,
    ) -> LifecycleResult<()> {
        self.log_event(
            AuditLogEvent::new(event_type)
                .job(job_name, job_version)
                .executor(executor)
                .subject(subject),
        )
        .await
    }

    /// Events matching the filter, newest first.
    pub async fn read_events(&self, filter: &AuditFilter) -> LifecycleResult<Vec<AuditLogEvent>> {
        self.store.list_audit_events(filter).await
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger").finish_non_exhaustive()
    }
}
