//! Deployment endpoints.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::deployer::JobDeploymentRequest;
use crate::error::LifecycleError;
use crate::manifest::Manifest;
use crate::types::{Deployment, DeploymentId, DeploymentStatus};

use super::{api_error, request_username, ApiResult, AppState};

const DEFAULT_DEPLOYMENT_LIST_LIMIT: u32 = 20;

/// Response for a started deployment.
#[derive(Debug, Serialize)]
pub struct DeploymentStarted {
    /// The assigned deployment ID.
    pub id: DeploymentId,
    /// Initial status.
    pub status: DeploymentStatus,
}

/// Phase reported for a running deployment.
#[derive(Debug, Deserialize)]
pub struct PhaseUpdate {
    /// Phase name.
    pub phase: String,
}

/// Warnings reported for a running deployment.
#[derive(Debug, Deserialize)]
pub struct WarningsUpdate {
    /// Warning text, appended to the ones already recorded.
    pub warnings: String,
}

/// Query parameters for listing deployments.
#[derive(Debug, Default, Deserialize)]
pub struct ListDeploymentsQuery {
    /// Maximum number of results.
    pub limit: Option<u32>,
}

/// Deploy the job whose manifest is submitted.
pub async fn create_deployment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JobDeploymentRequest>,
) -> ApiResult<(StatusCode, Json<DeploymentStarted>)> {
    start(&state, request, &headers).await
}

/// Deploy a job version; the submitted manifest must describe it.
pub async fn deploy_job(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<JobDeploymentRequest>,
) -> ApiResult<(StatusCode, Json<DeploymentStarted>)> {
    let manifest = Manifest::from_yaml(&request.manifest_yaml).map_err(api_error)?;
    if manifest.name != name || manifest.version != version {
        return Err(api_error(LifecycleError::validation(format!(
            "manifest describes job {} v{}, but {name} v{version} was requested",
            manifest.name, manifest.version
        ))));
    }
    start(&state, request, &headers).await
}

async fn start(
    state: &AppState,
    request: JobDeploymentRequest,
    headers: &HeaderMap,
) -> ApiResult<(StatusCode, Json<DeploymentStarted>)> {
    let username = request_username(headers);
    info!(username = username.as_deref().unwrap_or_default(), "deployment requested via API");

    let deployment = state
        .manager
        .deploy_in_background(request, username)
        .await
        .map_err(api_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DeploymentStarted {
            id: deployment.id,
            status: deployment.status,
        }),
    ))
}

/// Get a deployment by ID.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deployment>> {
    state
        .manager
        .registry()
        .find_deployment(&DeploymentId::new(id))
        .await
        .map(Json)
        .map_err(api_error)
}

/// List the most recent deployments.
pub async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<ListDeploymentsQuery>,
) -> ApiResult<Json<Vec<Deployment>>> {
    state
        .manager
        .registry()
        .list_recent_deployments(query.limit.unwrap_or(DEFAULT_DEPLOYMENT_LIST_LIMIT))
        .await
        .map(Json)
        .map_err(api_error)
}

/// Record the phase a deployment entered.
pub async fn update_phase(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<PhaseUpdate>,
) -> ApiResult<StatusCode> {
    state
        .manager
        .registry()
        .save_deployment_phase(&DeploymentId::new(id), &update.phase)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::OK)
}

/// Append warnings to a deployment.
pub async fn add_warnings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<WarningsUpdate>,
) -> ApiResult<StatusCode> {
    state
        .manager
        .registry()
        .save_deployment_warnings(&DeploymentId::new(id), &update.warnings)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::OK)
}
