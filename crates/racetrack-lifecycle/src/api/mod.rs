//! HTTP API of the lifecycle service.
//!
//! Provides endpoints for:
//! - Job deployment, redeployment, reprovisioning, moves and deletion
//! - Deployment progress and results
//! - Runtime logs, build logs and live log streams
//! - Audit log, infrastructure targets and plugin reload
//! - Health, liveness and readiness checks

mod deployments;
mod jobs;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::deployer::DeploymentManager;
use crate::error::LifecycleError;
use crate::streaming::LogSessionHub;

pub use deployments::{DeploymentStarted, PhaseUpdate, WarningsUpdate};
pub use jobs::{LogsQuery, MoveJobRequest};

/// Header carrying the name of the user performing a request.
pub const USERNAME_HEADER: &str = "x-racetrack-username";

/// Shared application state for the lifecycle service.
#[derive(Clone)]
pub struct AppState {
    /// Deployment manager orchestrating every job operation.
    pub manager: Arc<DeploymentManager>,
    /// Live log sessions.
    pub logs: Arc<LogSessionHub>,
}

impl AppState {
    /// Build the state around a deployment manager.
    #[must_use]
    pub fn new(manager: Arc<DeploymentManager>) -> Self {
        let logs = Arc::new(LogSessionHub::new(
            manager.registry().clone(),
            Arc::clone(manager.targets()),
        ));
        Self { manager, logs }
    }
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/live", get(liveness_check))
        .route("/ready", get(readiness_check))
        // Jobs
        .route("/job", get(jobs::list_jobs))
        .route("/job_family", get(jobs::list_job_families))
        .route(
            "/job/{name}/{version}",
            get(jobs::get_job)
                .post(deployments::deploy_job)
                .delete(jobs::delete_job),
        )
        .route("/job/{name}/{version}/redeploy", post(jobs::redeploy_job))
        .route("/job/{name}/{version}/reprovision", post(jobs::reprovision_job))
        .route("/job/{name}/{version}/move", post(jobs::move_job))
        .route("/job/{name}/{version}/logs", get(jobs::runtime_logs))
        .route("/job/{name}/{version}/logs/stream", get(jobs::stream_logs))
        .route("/job/{name}/{version}/build-logs", get(jobs::build_logs))
        // Deployments
        .route(
            "/deploy",
            get(deployments::list_deployments).post(deployments::create_deployment),
        )
        .route("/deploy/{id}", get(deployments::get_deployment))
        .route("/deploy/{id}/phase", put(deployments::update_phase))
        .route("/deploy/{id}/warnings", put(deployments::add_warnings))
        // Platform
        .route("/audit", get(jobs::audit_events))
        .route("/infrastructure_targets", get(infrastructure_targets))
        .route("/plugins/reload", post(reload_plugins))
        .with_state(state)
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

/// Result of a handler: a value or a status with an error body.
pub type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

pub(crate) fn api_error(error: LifecycleError) -> (StatusCode, Json<ErrorResponse>) {
    let status = error_to_status(&error);
    if status.is_server_error() {
        warn!(status = %status, error = %error, "request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// HTTP status matching an error; wrapped errors take their root cause's status.
#[must_use]
pub fn error_to_status(error: &LifecycleError) -> StatusCode {
    match error.root_cause() {
        LifecycleError::Validation(_) => StatusCode::BAD_REQUEST,
        LifecycleError::Unauthorized(_) => StatusCode::FORBIDDEN,
        LifecycleError::EntityNotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::AlreadyExists(_) | LifecycleError::Conflict(_) => StatusCode::CONFLICT,
        LifecycleError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Username sent by the caller, if any.
pub(crate) fn request_username(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USERNAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Liveness check endpoint.
async fn liveness_check() -> Json<LiveResponse> {
    Json(LiveResponse { live: true })
}

/// Readiness check endpoint.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    match state.manager.registry().store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                error: Some(format!("database is unavailable: {e}")),
            }),
        ),
    }
}

/// Names of the available infrastructure targets.
async fn infrastructure_targets(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.manager.targets().names())
}

/// Reload plugins and rebuild the infrastructure registry.
async fn reload_plugins(State(state): State<AppState>) -> ApiResult<Json<Vec<PluginResponse>>> {
    let plugins = state.manager.plugins();
    plugins.reload().map_err(api_error)?;
    let loaded = plugins.plugin_list().map_err(api_error)?;
    info!(plugins = loaded.len(), "plugins reloaded via API");
    Ok(Json(
        loaded
            .into_iter()
            .map(|(name, version)| PluginResponse { name, version })
            .collect(),
    ))
}

/// Health response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Liveness response.
#[derive(Serialize)]
struct LiveResponse {
    live: bool,
}

/// Readiness response.
#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Loaded plugin.
#[derive(Serialize)]
struct PluginResponse {
    name: String,
    version: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::builder::{BuildOutcome, BuildRequest, ImageBuilder};
    use crate::config::LifecycleConfig;
    use crate::error::LifecycleResult;
    use crate::infrastructure::MemoryInfrastructure;
    use crate::permissions::AllowAll;
    use crate::plugin::PluginEngine;
    use crate::registry::JobRegistry;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct InstantBuilder;

    #[async_trait]
    impl ImageBuilder for InstantBuilder {
        async fn wait_ready(&self) -> LifecycleResult<()> {
            Ok(())
        }

        async fn build(&self, request: &BuildRequest) -> LifecycleResult<BuildOutcome> {
            Ok(BuildOutcome {
                image_names: vec![format!("registry/job:{}", request.tag)],
                logs: "built".to_owned(),
                error: None,
            })
        }
    }

    pub(crate) fn make_app_state() -> (AppState, MemoryInfrastructure) {
        let infrastructure = MemoryInfrastructure::new("memory");
        let plugins = Arc::new(PluginEngine::new(vec![infrastructure.target()], Vec::new()).unwrap());
        let manager = Arc::new(DeploymentManager::new(
            Arc::new(LifecycleConfig::default()),
            JobRegistry::new(Arc::new(MemoryStore::new())),
            plugins,
            Arc::new(InstantBuilder),
            Arc::new(AllowAll),
        ));
        (AppState::new(manager), infrastructure)
    }

    pub(crate) async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get(app: Router, uri: &str) -> axum::response::Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (state, _) = make_app_state();
        let response = get(router(state), "/health").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn live_and_ready_endpoints() {
        let (state, _) = make_app_state();
        let app = router(state);

        assert_eq!(get(app.clone(), "/live").await.status(), StatusCode::OK);
        let response = get(app, "/ready").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ready"], true);
    }

    #[tokio::test]
    async fn infrastructure_targets_endpoint() {
        let (state, _) = make_app_state();
        let response = get(router(state), "/infrastructure_targets").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!(["memory"]));
    }

    #[tokio::test]
    async fn plugins_reload_endpoint() {
        let (state, _) = make_app_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/plugins/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }

    #[test]
    fn wrapped_errors_take_root_cause_status() {
        let err = LifecycleError::Context {
            context: "building an image".to_owned(),
            source: Box::new(LifecycleError::not_found("job adder v1 not found")),
        };
        assert_eq!(error_to_status(&err), StatusCode::NOT_FOUND);
        assert_eq!(
            error_to_status(&LifecycleError::Unsupported("managing secrets".to_owned())),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            error_to_status(&LifecycleError::conflict("ongoing")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_to_status(&LifecycleError::Builder("oops".to_owned())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn username_header_is_trimmed() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_username(&headers), None);
        headers.insert(USERNAME_HEADER, " alice ".parse().unwrap());
        assert_eq!(request_username(&headers).as_deref(), Some("alice"));
    }
}
