//! Live log streaming sessions.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;

use crate::error::{LifecycleError, LifecycleResult};
use crate::infrastructure::{LogResource, LogSink, TargetRegistry};
use crate::registry::JobRegistry;

const SESSION_BUFFER: usize = 256;

#[derive(Debug)]
struct LogSession {
    cancel: CancellationToken,
    resource: LogResource,
    target: String,
}

/// Tracks open log streaming sessions.
pub struct LogSessionHub {
    registry: JobRegistry,
    targets: Arc<TargetRegistry>,
    sessions: DashMap<String, LogSession>,
}

impl LogSessionHub {
    /// Create a hub resolving jobs through `registry` and `targets`.
    #[must_use]
    pub fn new(registry: JobRegistry, targets: Arc<TargetRegistry>) -> Self {
        Self {
            registry,
            targets,
            sessions: DashMap::new(),
        }
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a session following the logs of a job; the version may be an alias.
    ///
    /// The returned subscription closes the session when dropped.
    pub async fn create_session(
        self: &Arc<Self>,
        job_name: &str,
        job_version: &str,
        tail: usize,
    ) -> LifecycleResult<LogSubscription> {
        let job = self.registry.read_versioned_job(job_name, job_version).await?;
        let target_name = job.infrastructure_target.clone().ok_or_else(|| {
            LifecycleError::validation(format!(
                "job {} v{} has no infrastructure target",
                job.name, job.version
            ))
        })?;
        let streamer = Arc::clone(self.targets.get(&target_name)?.logs_streamer()?);

        let session_id = Ulid::new().to_string();
        let resource = LogResource {
            job_name: job.name.clone(),
            job_version: job.version.clone(),
            tail,
        };
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);

        streamer
            .create_session(&resource, LogSink::new(session_id.clone(), tx), cancel.clone())
            .await?;
        info!(
            session_id = %session_id,
            job_name = %resource.job_name,
            job_version = %resource.job_version,
            target = %target_name,
            "log session opened"
        );
        self.sessions.insert(
            session_id.clone(),
            LogSession {
                cancel,
                resource,
                target: target_name,
            },
        );

        Ok(LogSubscription {
            session_id,
            lines: rx,
            hub: Arc::clone(self),
        })
    }

    /// Close a session, stopping its stream.
    ///
    /// Returns whether the session was open.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        session.cancel.cancel();
        if let Ok(target) = self.targets.get(&session.target) {
            if let Ok(streamer) = target.logs_streamer() {
                streamer.close_session(session_id).await;
            }
        }
        debug!(
            session_id,
            job_name = %session.resource.job_name,
            job_version = %session.resource.job_version,
            "log session closed"
        );
        true
    }

    fn close_detached(self: &Arc<Self>, session_id: String) {
        if let Some(session) = self.sessions.get(&session_id) {
            session.cancel.cancel();
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let hub = Arc::clone(self);
                handle.spawn(async move {
                    hub.close_session(&session_id).await;
                });
            }
            Err(_) => {
                self.sessions.remove(&session_id);
            }
        }
    }
}

impl std::fmt::Debug for LogSessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSessionHub")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

/// Receiving end of a log session.
#[derive(Debug)]
pub struct LogSubscription {
    session_id: String,
    lines: mpsc::Receiver<String>,
    hub: Arc<LogSessionHub>,
}

impl LogSubscription {
    /// Id of the underlying session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next log line; `None` once the stream has ended.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.hub.close_detached(std::mem::take(&mut self.session_id));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::infrastructure::MemoryInfrastructure;
    use crate::store::MemoryStore;
    use crate::types::Job;

    async fn hub_with_job(infrastructure: &MemoryInfrastructure) -> Arc<LogSessionHub> {
        let registry = JobRegistry::new(Arc::new(MemoryStore::new()));
        let mut job = Job::new("adder", "1.0.0");
        job.infrastructure_target = Some(infrastructure.name().to_owned());
        registry.save_job(&job).await.unwrap();
        let targets = Arc::new(TargetRegistry::new([infrastructure.target()]));
        Arc::new(LogSessionHub::new(registry, targets))
    }

    #[tokio::test]
    async fn session_receives_backlog_and_new_lines() {
        let infrastructure = MemoryInfrastructure::new("memory");
        infrastructure.push_log("adder", "1.0.0", "old line").unwrap();
        infrastructure.push_log("adder", "1.0.0", "recent line").unwrap();
        let hub = hub_with_job(&infrastructure).await;

        let mut subscription = hub.create_session("adder", "latest", 1).await.unwrap();
        assert_eq!(hub.session_count(), 1);
        assert_eq!(subscription.next_line().await.as_deref(), Some("recent line"));

        infrastructure.push_log("adder", "1.0.0", "live line").unwrap();
        let line = tokio::time::timeout(Duration::from_secs(1), subscription.next_line())
            .await
            .unwrap();
        assert_eq!(line.as_deref(), Some("live line"));
    }

    #[tokio::test]
    async fn closing_ends_the_stream() {
        let infrastructure = MemoryInfrastructure::new("memory");
        let hub = hub_with_job(&infrastructure).await;

        let mut subscription = hub.create_session("adder", "1.0.0", 10).await.unwrap();
        let session_id = subscription.session_id().to_owned();
        assert!(hub.close_session(&session_id).await);
        assert!(!hub.close_session(&session_id).await);
        assert_eq!(hub.session_count(), 0);

        let end = tokio::time::timeout(Duration::from_secs(1), subscription.next_line())
            .await
            .unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let infrastructure = MemoryInfrastructure::new("memory");
        let hub = hub_with_job(&infrastructure).await;

        let err = hub.create_session("missing", "1.0.0", 10).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
