//! In-process leases enforcing one running pipeline per job version.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};
use crate::types::JobKey;

/// Job versions with a pipeline running in this process.
#[derive(Debug, Default)]
pub struct DeploymentLeases {
    held: DashMap<JobKey, String>,
}

impl DeploymentLeases {
    /// Create an empty lease table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease of `key` for `operation`.
    ///
    /// Fails with a conflict while another pipeline holds it. The lease is
    /// released when the returned guard is dropped.
    pub fn acquire(self: &Arc<Self>, key: &JobKey, operation: &str) -> LifecycleResult<DeploymentLease> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(holder) => Err(LifecycleError::conflict(format!(
                "There's already ongoing deployment of job {} {} ({})",
                key.name,
                key.version,
                holder.get()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(operation.to_owned());
                debug!(job_name = %key.name, job_version = %key.version, operation, "deployment lease taken");
                Ok(DeploymentLease {
                    leases: Arc::clone(self),
                    key: key.clone(),
                })
            }
        }
    }

    /// Whether a pipeline currently holds the lease of `key`.
    #[must_use]
    pub fn is_held(&self, key: &JobKey) -> bool {
        self.held.contains_key(key)
    }
}

/// Exclusive right to run a pipeline for one job version.
#[derive(Debug)]
pub struct DeploymentLease {
    leases: Arc<DeploymentLeases>,
    key: JobKey,
}

impl Drop for DeploymentLease {
    fn drop(&mut self) {
        self.leases.held.remove(&self.key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let leases = Arc::new(DeploymentLeases::new());
        let key = JobKey::new("adder", "1.0.0");

        let lease = leases.acquire(&key, "deploy").unwrap();
        let err = leases.acquire(&key, "redeploy").unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));
        assert!(err.to_string().contains("(deploy)"));

        leases.acquire(&JobKey::new("adder", "2.0.0"), "deploy").unwrap();

        drop(lease);
        assert!(!leases.is_held(&key));
        leases.acquire(&key, "redeploy").unwrap();
    }
}
