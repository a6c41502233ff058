//! HTTP health probing of deployed jobs.
//!
//! A job is operational once it passes two stages:
//! 1. **alive**: `GET /live` answers, and for a fenced deployment it echoes
//!    the expected `deployment_timestamp`. Unreachable or superseded
//!    workloads are retried with exponential backoff.
//! 2. **ready**: `GET /ready` returns 200. A non-200 answer re-reads
//!    `/live` so that a crash during initialisation is reported at once
//!    instead of waiting for the readiness timeout.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};
use crate::infrastructure::{OnJobAlive, GATEWAY_TOKEN_HEADER, JOB_INTERNAL_NAME_HEADER};
use crate::types::Job;

/// Name of the Prometheus gauge carrying the time of the last job call.
pub const METRIC_LAST_CALL_TIMESTAMP: &str = "last_call_timestamp";

/// Calculate exponential backoff delay for a given attempt number.
///
/// Uses exponential backoff: `initial_delay * 2^attempt`, capped at `max_delay`.
fn calculate_backoff_delay(attempt: u32, initial_delay: Duration, max_delay: Duration) -> Duration {
    let multiplier = u32::try_from(2u64.saturating_pow(attempt)).unwrap_or(u32::MAX);
    initial_delay.saturating_mul(multiplier).min(max_delay)
}

/// Timing of health probes.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// How long to wait for the liveness endpoint to answer.
    pub timeout_until_alive: Duration,
    /// How long a live job may take to report ready.
    pub timeout_until_ready: Duration,
    /// Timeout of a single probe request.
    pub request_timeout: Duration,
    /// First retry delay.
    pub initial_backoff: Duration,
    /// Retry delay ceiling.
    pub max_backoff: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout_until_alive: Duration::from_secs(15 * 60),
            timeout_until_ready: Duration::from_secs(10 * 60),
            request_timeout: Duration::from_secs(3),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
        }
    }
}

/// Where a job's HTTP server can be reached from the lifecycle service.
#[derive(Debug, Clone)]
pub struct JobEndpoint {
    base_url: String,
    headers: HeaderMap,
}

impl JobEndpoint {
    /// Address the job directly, e.g. `http://job-adder-v-1:7000`.
    #[must_use]
    pub fn direct(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            headers: HeaderMap::new(),
        }
    }

    /// Address the job through the forwarding endpoint of a remote gateway.
    pub fn through_gateway(gateway_url: &str, gateway_token: &str, job: &Job) -> LifecycleResult<Self> {
        let internal_name = job.internal_name.as_deref().unwrap_or_default();
        let mut endpoint = Self::direct(format!(
            "{}/remote/forward/{}/{}",
            gateway_url.trim_end_matches('/'),
            job.name,
            job.version
        ));
        endpoint.insert_header(GATEWAY_TOKEN_HEADER, gateway_token)?;
        endpoint.insert_header(JOB_INTERNAL_NAME_HEADER, internal_name)?;
        Ok(endpoint)
    }

    fn insert_header(&mut self, name: &str, value: &str) -> LifecycleResult<()> {
        let invalid = |e: &dyn std::fmt::Display| {
            LifecycleError::validation(format!("invalid {name} header: {e}"))
        };
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(&e))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(&e))?;
        self.headers.insert(header, value);
        Ok(())
    }

    /// Base URL of the job.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

struct ProbeResponse {
    status: StatusCode,
    json: Option<serde_json::Value>,
}

impl ProbeResponse {
    fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.json.as_ref().and_then(|body| body.get(name))
    }
}

enum AliveAttempt {
    Live(ProbeResponse),
    Retry(String),
}

enum ReadyAttempt {
    Ready,
    Initialising,
}

/// Probes job health endpoints.
#[derive(Debug, Clone)]
pub struct JobProbe {
    client: Client,
    settings: ProbeSettings,
}

impl JobProbe {
    /// Create a probe with the given timing.
    pub fn new(settings: ProbeSettings) -> LifecycleResult<Self> {
        let client = Client::builder().timeout(settings.request_timeout).build()?;
        Ok(Self { client, settings })
    }

    /// Probe timing in use.
    #[must_use]
    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Wait until the job is alive and then until it's ready.
    ///
    /// `deployment_timestamp` of zero accepts any live workload.
    pub async fn check_until_operational(
        &self,
        endpoint: &JobEndpoint,
        deployment_timestamp: i64,
        on_alive: Option<OnJobAlive<'_>>,
    ) -> LifecycleResult<()> {
        let live = self.wait_until_alive(endpoint, deployment_timestamp).await?;
        validate_live_response(&live)?;

        if let Some(on_alive) = on_alive {
            on_alive().await;
        }

        self.wait_until_ready(endpoint).await
    }

    /// Single-shot check that the job is both live and ready.
    pub async fn quick_check(&self, endpoint: &JobEndpoint) -> LifecycleResult<()> {
        let live = self
            .get(endpoint, "/live")
            .await
            .map_err(|e| LifecycleError::infrastructure(format!("Cluster error: can't reach Job: {e}")))?;
        validate_live_response(&live)?;

        let ready = self
            .get(endpoint, "/ready")
            .await
            .map_err(|e| LifecycleError::infrastructure(format!("Cluster error: can't reach Job: {e}")))?;
        match ready.status {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(LifecycleError::infrastructure(
                "Job health error: readiness endpoint not found",
            )),
            _ => Err(LifecycleError::infrastructure("Job is still initializing")),
        }
    }

    /// Read the last call time reported by the job's metrics endpoint.
    ///
    /// Jobs without a metrics endpoint report `None`.
    pub async fn read_last_call_time(
        &self,
        endpoint: &JobEndpoint,
    ) -> LifecycleResult<Option<DateTime<Utc>>> {
        let response = self
            .client
            .get(endpoint.url("/metrics"))
            .headers(endpoint.headers.clone())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response.error_for_status()?.text().await?;
        Ok(parse_last_call_timestamp(&text).and_then(seconds_to_datetime))
    }

    async fn wait_until_alive(
        &self,
        endpoint: &JobEndpoint,
        deployment_timestamp: i64,
    ) -> LifecycleResult<ProbeResponse> {
        let deadline = Instant::now() + self.settings.timeout_until_alive;
        let mut attempt = 0;
        loop {
            let reason = match self.check_alive(endpoint, deployment_timestamp).await? {
                AliveAttempt::Live(response) => return Ok(response),
                AliveAttempt::Retry(reason) => reason,
            };
            debug!(url = %endpoint.base_url, attempt, reason = %reason, "job not alive yet");
            self.pause(deadline, attempt).await.map_err(|()| {
                LifecycleError::Timeout(format!(
                    "Job didn't become alive within {}s: {reason}",
                    self.settings.timeout_until_alive.as_secs()
                ))
            })?;
            attempt += 1;
        }
    }

    async fn check_alive(
        &self,
        endpoint: &JobEndpoint,
        expected_timestamp: i64,
    ) -> LifecycleResult<AliveAttempt> {
        let response = match self.get(endpoint, "/live").await {
            Ok(response) => response,
            Err(e) => {
                return Ok(AliveAttempt::Retry(format!(
                    "Cluster error: can't reach Job: {e}"
                )))
            }
        };

        // A dying workload of a previous deployment may still answer.
        if expected_timestamp != 0 {
            let body = response.json.as_ref().filter(|body| body.is_object()).ok_or_else(|| {
                LifecycleError::infrastructure("live endpoint should respond with JSON object")
            })?;
            let reported = body.get("deployment_timestamp").ok_or_else(|| {
                LifecycleError::infrastructure(
                    "live endpoint JSON should have \"deployment_timestamp\" field",
                )
            })?;
            if json_timestamp(reported) != expected_timestamp {
                return Ok(AliveAttempt::Retry(
                    "Cluster error: can't reach newer Job, incorrect deployment_timestamp field"
                        .to_owned(),
                ));
            }
        }
        Ok(AliveAttempt::Live(response))
    }

    async fn wait_until_ready(&self, endpoint: &JobEndpoint) -> LifecycleResult<()> {
        let deadline = Instant::now() + self.settings.timeout_until_ready;
        let mut attempt = 0;
        loop {
            if let ReadyAttempt::Ready = self.check_ready(endpoint).await? {
                return Ok(());
            }
            debug!(url = %endpoint.base_url, attempt, "job still initialising");
            self.pause(deadline, attempt).await.map_err(|()| {
                LifecycleError::Timeout("Job initialization timed out".to_owned())
            })?;
            attempt += 1;
        }
    }

    async fn check_ready(&self, endpoint: &JobEndpoint) -> LifecycleResult<ReadyAttempt> {
        let ready = self.get(endpoint, "/ready").await.map_err(|e| {
            LifecycleError::infrastructure(format!("Job server crashed while initialization: {e}"))
        })?;
        match ready.status {
            StatusCode::OK => return Ok(ReadyAttempt::Ready),
            StatusCode::NOT_FOUND => {
                return Err(LifecycleError::infrastructure(
                    "Job health error: readiness endpoint not found",
                ))
            }
            _ => {}
        }

        let live = self.get(endpoint, "/live").await.map_err(|e| {
            LifecycleError::infrastructure(format!("Job server crashed while initialization: {e}"))
        })?;
        validate_live_response(&live)?;
        Ok(ReadyAttempt::Initialising)
    }

    /// Sleep before the next attempt, or fail once the deadline has passed.
    async fn pause(&self, deadline: Instant, attempt: u32) -> Result<(), ()> {
        let now = Instant::now();
        if now >= deadline {
            return Err(());
        }
        let delay = calculate_backoff_delay(
            attempt,
            self.settings.initial_backoff,
            self.settings.max_backoff,
        );
        tokio::time::sleep(delay.min(deadline - now)).await;
        Ok(())
    }

    async fn get(&self, endpoint: &JobEndpoint, path: &str) -> Result<ProbeResponse, reqwest::Error> {
        let response = self
            .client
            .get(endpoint.url(path))
            .headers(endpoint.headers.clone())
            .send()
            .await?;
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));
        let json = if is_json {
            response.json::<serde_json::Value>().await.ok()
        } else {
            None
        };
        Ok(ProbeResponse { status, json })
    }
}

/// Report a crashed job as soon as its liveness endpoint says so.
fn validate_live_response(response: &ProbeResponse) -> LifecycleResult<()> {
    match response.status {
        StatusCode::OK => Ok(()),
        StatusCode::NOT_FOUND => Err(LifecycleError::infrastructure(
            "Job health error: liveness endpoint not found",
        )),
        status => match response.field("error") {
            Some(error) => Err(LifecycleError::infrastructure(format!(
                "Job initialization error: {}",
                json_text(error)
            ))),
            None => Err(LifecycleError::infrastructure(format!(
                "Job liveness error: {status}"
            ))),
        },
    }
}

#[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
fn json_timestamp(value: &serde_json::Value) -> i64 {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or_default(),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or_default(),
        _ => 0,
    }
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Find the value of the last-call gauge in Prometheus text exposition.
fn parse_last_call_timestamp(exposition: &str) -> Option<f64> {
    exposition
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let (name, rest) = line.split_once(|c: char| c == ' ' || c == '{')?;
            if name != METRIC_LAST_CALL_TIMESTAMP {
                return None;
            }
            let values = rest.rsplit_once('}').map_or(rest, |(_, values)| values);
            values.split_whitespace().next()?.parse().ok()
        })
}

#[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
fn seconds_to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    Utc.timestamp_millis_opt((seconds * 1000.0) as i64).single()
}
