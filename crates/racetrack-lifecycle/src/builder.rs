//! Client of the external image builder service.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::ImageBuilderConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::infrastructure::GitCredentials;
use crate::manifest::Manifest;
use crate::types::DeploymentId;

const READY_MAX_BACKOFF: Duration = Duration::from_secs(3);

/// Everything the image builder needs to build a job image.
#[derive(Debug, Clone, Serialize)]
pub struct BuildRequest {
    /// Build recipe.
    pub manifest: Manifest,
    /// Credentials for a private repository.
    pub git_credentials: Option<GitCredentials>,
    /// Secret variables available while building.
    pub secret_build_env: BTreeMap<String, String>,
    /// Tag given to the built image.
    pub tag: String,
    /// Encoded local build context, used instead of cloning the repository.
    pub build_context: Option<String>,
    /// Deployment the build belongs to.
    pub deployment_id: DeploymentId,
    /// Extra flags passed to the image build.
    pub build_flags: Vec<String>,
}

/// Result reported by the image builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BuildOutcome {
    /// Full names of the built images.
    #[serde(default)]
    pub image_names: Vec<String>,
    /// Build output.
    #[serde(default)]
    pub logs: String,
    /// Build failure, if any. Logs are still meaningful when set.
    #[serde(default)]
    pub error: Option<String>,
}

/// Builds job images.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Wait until the builder accepts requests.
    async fn wait_ready(&self) -> LifecycleResult<()>;

    /// Build the image described by the request.
    ///
    /// A build that ran and failed is returned as an outcome carrying an
    /// `error`, so that its logs aren't lost.
    async fn build(&self, request: &BuildRequest) -> LifecycleResult<BuildOutcome>;
}

/// HTTP client of the image builder API.
#[derive(Debug, Clone)]
pub struct ImageBuilderClient {
    client: Client,
    base_url: String,
    ready_timeout: Duration,
}

impl ImageBuilderClient {
    /// Create a client from configuration.
    pub fn new(config: &ImageBuilderConfig) -> LifecycleResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(LifecycleError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
            ready_timeout: config.ready_timeout,
        })
    }

    async fn health(&self) -> LifecycleResult<()> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(LifecycleError::Builder(format!(
                "health check failed: {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl ImageBuilder for ImageBuilderClient {
    async fn wait_ready(&self) -> LifecycleResult<()> {
        let deadline = Instant::now() + self.ready_timeout;
        let (mut delay, mut next) = (Duration::from_secs(1), Duration::from_secs(1));
        loop {
            match self.health().await {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() + delay >= deadline => {
                    return Err(LifecycleError::Timeout(format!(
                        "image builder is not ready: {e}"
                    )));
                }
                Err(e) => debug!(error = %e, "image builder not ready yet"),
            }
            sleep(delay).await;
            // Fibonacci steps, capped.
            let following = (delay + next).min(READY_MAX_BACKOFF);
            delay = next.min(READY_MAX_BACKOFF);
            next = following;
        }
    }

    async fn build(&self, request: &BuildRequest) -> LifecycleResult<BuildOutcome> {
        info!(
            deployment_id = %request.deployment_id,
            job_name = %request.manifest.name,
            tag = %request.tag,
            "requesting image build"
        );
        let url = format!("{}/api/v1/build", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
                .unwrap_or(body);
            return Err(LifecycleError::Builder(format!(
                "Image builder API error: {status}: {detail}"
            )));
        }

        Ok(response.json().await?)
    }
}
