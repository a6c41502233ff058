//! Job management endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use tracing::info;

use crate::store::AuditFilter;
use crate::types::{AuditLogEvent, Job, JobFamily};

use super::{api_error, request_username, ApiResult, AppState};

const DEFAULT_RUNTIME_LOGS_TAIL: usize = 20;

/// Query parameters for log reads.
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Number of trailing lines; zero means all of them for build logs.
    pub tail: Option<usize>,
}

/// Request to move a job to another infrastructure target.
#[derive(Debug, Deserialize)]
pub struct MoveJobRequest {
    /// Destination target name.
    pub infrastructure_target: String,
}

/// Query parameters for the audit log.
#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    /// Executor or subject username.
    pub username: Option<String>,
    /// Job name.
    pub job_name: Option<String>,
    /// Job version.
    pub job_version: Option<String>,
}

/// List every registered job.
pub async fn list_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<Job>>> {
    state.manager.registry().list_jobs().await.map(Json).map_err(api_error)
}

/// List every job family.
pub async fn list_job_families(State(state): State<AppState>) -> ApiResult<Json<Vec<JobFamily>>> {
    state
        .manager
        .registry()
        .list_families()
        .await
        .map(Json)
        .map_err(api_error)
}

/// Get a job; the version may be an alias such as `latest`.
pub async fn get_job(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> ApiResult<Json<Job>> {
    state
        .manager
        .registry()
        .read_versioned_job(&name, &version)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Delete a job.
pub async fn delete_job(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let username = request_username(&headers);
    info!(job_name = %name, job_version = %version, "deleting job via API");
    state
        .manager
        .delete_job(&name, &version, username.as_deref())
        .await
        .map_err(api_error)?;
    Ok(StatusCode::OK)
}

/// Rebuild and provision a job again.
pub async fn redeploy_job(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Job>> {
    let username = request_username(&headers);
    info!(job_name = %name, job_version = %version, "redeploying job via API");
    state
        .manager
        .redeploy_job(&name, &version, username.as_deref())
        .await
        .map(Json)
        .map_err(api_error)
}

/// Provision a job's image again.
pub async fn reprovision_job(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Job>> {
    let username = request_username(&headers);
    info!(job_name = %name, job_version = %version, "reprovisioning job via API");
    state
        .manager
        .reprovision_job(&name, &version, username.as_deref())
        .await
        .map(Json)
        .map_err(api_error)
}

/// Move a job to another infrastructure target.
pub async fn move_job(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<MoveJobRequest>,
) -> ApiResult<Json<Job>> {
    let username = request_username(&headers);
    info!(
        job_name = %name,
        job_version = %version,
        target = %request.infrastructure_target,
        "moving job via API"
    );
    state
        .manager
        .move_job(&name, &version, &request.infrastructure_target, username.as_deref())
        .await
        .map(Json)
        .map_err(api_error)
}

/// Recent runtime output of a job.
pub async fn runtime_logs(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<String> {
    state
        .manager
        .read_runtime_logs(&name, &version, query.tail.unwrap_or(DEFAULT_RUNTIME_LOGS_TAIL))
        .await
        .map_err(api_error)
}

/// Build output of a job's latest deployment.
pub async fn build_logs(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<String> {
    state
        .manager
        .read_build_logs(&name, &version, query.tail.unwrap_or_default())
        .await
        .map_err(api_error)
}

/// Follow a job's output as server-sent events.
///
/// The session closes when the client disconnects.
pub async fn stream_logs(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state
        .logs
        .create_session(&name, &version, query.tail.unwrap_or(DEFAULT_RUNTIME_LOGS_TAIL))
        .await
        .map_err(api_error)?;

    let stream = stream::unfold(subscription, |mut subscription| async move {
        let line = subscription.next_line().await?;
        Some((Ok(Event::default().data(line)), subscription))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Query the audit log.
pub async fn audit_events(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditLogEvent>>> {
    let filter = AuditFilter {
        username: query.username,
        job_name: query.job_name,
        job_version: query.job_version,
    };
    state
        .manager
        .audit()
        .read_events(&filter)
        .await
        .map(Json)
        .map_err(api_error)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::super::router;
    use super::super::tests::{body_json, make_app_state};
    use super::*;
    use crate::types::JobStatus;

    async fn call(app: axum::Router, method: &str, uri: &str) -> axum::response::Response {
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn save_running_job(state: &AppState) {
        let mut job = Job::new("adder", "1.0.0");
        job.status = JobStatus::Running;
        job.infrastructure_target = Some("memory".to_owned());
        state.manager.registry().save_job(&job).await.unwrap();
    }

    #[tokio::test]
    async fn jobs_are_listed_and_read_by_alias() {
        let (state, _infrastructure) = make_app_state();
        save_running_job(&state).await;
        let app = router(state);

        let response = call(app.clone(), "GET", "/job").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        let response = call(app.clone(), "GET", "/job/adder/latest").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["version"], "1.0.0");

        let response = call(app, "GET", "/job_family").await;
        assert_eq!(body_json(response).await[0]["name"], "adder");
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let (state, _infrastructure) = make_app_state();
        let response = call(router(state), "GET", "/job/adder/1.0.0").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn deleting_twice_is_not_found_the_second_time() {
        let (state, infrastructure) = make_app_state();
        infrastructure.insert_foreign("adder", "1.0.0").unwrap();
        save_running_job(&state).await;
        let app = router(state);

        let response = call(app.clone(), "DELETE", "/job/adder/1.0.0").await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = call(app.clone(), "DELETE", "/job/adder/1.0.0").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = call(app, "GET", "/audit?job_name=adder").await;
        let events = body_json(response).await;
        assert_eq!(events[0]["event_type"], "job_deleted");
    }

    #[tokio::test]
    async fn runtime_logs_honour_tail() {
        let (state, infrastructure) = make_app_state();
        infrastructure.insert_foreign("adder", "1.0.0").unwrap();
        for line in ["one", "two", "three"] {
            infrastructure.push_log("adder", "1.0.0", line).unwrap();
        }
        save_running_job(&state).await;

        let response = call(router(state), "GET", "/job/adder/1.0.0/logs?tail=2").await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), "two\nthree");
    }

    #[tokio::test]
    async fn move_to_same_target_is_rejected() {
        let (state, _infrastructure) = make_app_state();
        let mut job = Job::new("adder", "1.0.0");
        job.infrastructure_target = Some("memory".to_owned());
        job.image_tag = Some("2026-01-01T000000".to_owned());
        job.manifest_yaml = Some(
            "name: adder\nversion: 1.0.0\njobtype: python3:latest\ngit:\n  remote: https://example.com/adder\n"
                .to_owned(),
        );
        state.manager.registry().save_job(&job).await.unwrap();

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/job/adder/1.0.0/move")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"infrastructure_target":"memory"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
