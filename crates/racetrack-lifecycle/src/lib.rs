//! Racetrack lifecycle
//!
//! Deployment orchestration and supervision of Racetrack jobs: versioned
//! services built from a manifest into an image and provisioned on an
//! infrastructure target.
//!
//! # Architecture
//!
//! - **Registry**: durable record of job families, jobs, deployment attempts
//!   and the audit trail, behind a [`store::JobStore`] backend.
//! - **Deployer**: the deployment pipeline (validation, image build,
//!   provisioning, readiness, post-deploy hooks) plus redeploy, reprovision,
//!   move and delete.
//! - **Infrastructure**: named targets bundling a deployer, a monitor and a
//!   logs streamer; built in or contributed by plugins.
//! - **Supervisor**: periodic registry sync, reconciliation of lost jobs and
//!   metrics discovery file population.
//! - **API**: the lifecycle HTTP endpoints.
//!
//! # Job status
//!
//! ```text
//! created ──▶ running ◀──▶ error
//!                │
//!                ▼
//!              lost ──(reconcile)──▶ running
//! ```
//!
//! Workloads found on the infrastructure without a registry entry are
//! reported as `orphaned`.

#![forbid(unsafe_code)]

pub mod api;
pub mod builder;
pub mod config;
pub mod deployer;
pub mod error;
pub mod infrastructure;
pub mod manifest;
pub mod monitor;
pub mod permissions;
pub mod plugin;
pub mod registry;
pub mod service;
pub mod store;
pub mod streaming;
pub mod supervisor;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::LifecycleConfig;
pub use deployer::{DeploymentManager, JobDeploymentRequest};
pub use error::{LifecycleError, LifecycleResult, ResultExt};
pub use manifest::Manifest;
pub use registry::JobRegistry;
pub use service::LifecycleService;
pub use store::{JobStore, MemoryStore};
pub use supervisor::Supervisor;
pub use types::{AuditLogEvent, AuditLogEventType, Deployment, DeploymentId, DeploymentStatus, Job, JobStatus};
