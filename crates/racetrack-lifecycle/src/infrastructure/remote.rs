//! Infrastructure reached through a remote Pub gateway.
//!
//! Management commands are posted to the gateway's `/remote/command`
//! endpoint and executed on the remote host. Calls to jobs go through
//! `/remote/forward/{name}/{version}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};

use super::shell::{render_command, CommandRunner};

/// Header carrying the gateway token.
pub const GATEWAY_TOKEN_HEADER: &str = "X-Racetrack-Gateway-Token";

/// Header naming the job a forwarded call is meant for.
pub const JOB_INTERNAL_NAME_HEADER: &str = "X-Racetrack-Job-Internal-Name";

#[derive(Serialize)]
struct RemoteCommandRequest<'a> {
    command: &'a str,
    workdir: Option<&'a str>,
}

#[derive(Deserialize)]
struct RemoteCommandResponse {
    output: String,
    exit_code: i32,
}

#[derive(Deserialize)]
struct GatewayError {
    error: String,
}

/// Runs commands on the host behind a remote gateway.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    client: Client,
    gateway_url: String,
    gateway_token: String,
}

impl RemoteShell {
    /// Create a runner for the given gateway.
    pub fn new(
        gateway_url: impl Into<String>,
        gateway_token: impl Into<String>,
        timeout: Duration,
    ) -> LifecycleResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            gateway_url: gateway_url.into().trim_end_matches('/').to_owned(),
            gateway_token: gateway_token.into(),
        })
    }

    /// Base URL of the gateway.
    #[must_use]
    pub fn gateway_url(&self) -> &str {
        &self.gateway_url
    }
}

#[async_trait]
impl CommandRunner for RemoteShell {
    async fn run(&self, args: &[String]) -> LifecycleResult<String> {
        let command = render_command(args);
        let url = format!("{}/remote/command", self.gateway_url);
        debug!(url = %url, command = %command, "running remote command");

        let response = self
            .client
            .post(&url)
            .header(GATEWAY_TOKEN_HEADER, &self.gateway_token)
            .json(&RemoteCommandRequest {
                command: &command,
                workdir: None,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<GatewayError>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            return Err(LifecycleError::infrastructure(format!(
                "remote gateway responded with {status}: {detail}"
            )));
        }

        let result: RemoteCommandResponse = response.json().await?;
        if result.exit_code != 0 {
            return Err(LifecycleError::infrastructure(format!(
                "remote command failed: {command}: {}",
                result.output.trim()
            )));
        }
        Ok(result.output)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn command_is_posted_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/remote/command"))
            .and(header(GATEWAY_TOKEN_HEADER, "secret"))
            .and(body_json(serde_json::json!({
                "command": "docker rm -f job-adder-v-1",
                "workdir": null,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"output": "job-adder-v-1\n", "exit_code": 0})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let shell = RemoteShell::new(server.uri(), "secret", Duration::from_secs(5)).unwrap();
        let out = shell
            .run(&args(&["docker", "rm", "-f", "job-adder-v-1"]))
            .await
            .unwrap();
        assert_eq!(out, "job-adder-v-1\n");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/remote/command"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"output": "no such container", "exit_code": 1})),
            )
            .mount(&server)
            .await;

        let shell = RemoteShell::new(server.uri(), "secret", Duration::from_secs(5)).unwrap();
        let err = shell.run(&args(&["docker", "logs", "x"])).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "remote command failed: docker logs x: no such container"
        );
    }

    #[tokio::test]
    async fn gateway_rejection_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/remote/command"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({"error": "Remote command: remote Pub token is invalid"})),
            )
            .mount(&server)
            .await;

        let shell = RemoteShell::new(server.uri(), "wrong", Duration::from_secs(5)).unwrap();
        let err = shell.run(&args(&["docker", "ps"])).await.unwrap_err();
        assert!(err.to_string().contains("token is invalid"));
    }
}
