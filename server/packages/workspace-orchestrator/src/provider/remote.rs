use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;
use workspace_orchestrator_error::OrchestratorError;

use super::{CommandOutput, PreviewLink, SandboxInfo, SandboxProvider, SessionState};

pub const API_URL_ENV: &str = "WORKSPACE_PROVIDER_API_URL";
pub const API_KEY_ENV: &str = "WORKSPACE_PROVIDER_API_KEY";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RemoteProviderConfig {
    pub api_url: Url,
    pub api_key: String,
}

impl RemoteProviderConfig {
    pub fn new(api_url: &str, api_key: impl Into<String>) -> Result<Self, OrchestratorError> {
        let api_url = Url::parse(api_url).map_err(|err| OrchestratorError::InvalidRequest {
            message: format!("invalid provider api url `{api_url}`: {err}"),
        })?;
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(OrchestratorError::MissingCredentials {
                what: API_KEY_ENV.to_string(),
            });
        }
        Ok(Self { api_url, api_key })
    }

    pub fn from_env() -> Result<Self, OrchestratorError> {
        let api_url =
            std::env::var(API_URL_ENV).map_err(|_| OrchestratorError::MissingCredentials {
                what: API_URL_ENV.to_string(),
            })?;
        let api_key =
            std::env::var(API_KEY_ENV).map_err(|_| OrchestratorError::MissingCredentials {
                what: API_KEY_ENV.to_string(),
            })?;
        Self::new(&api_url, api_key)
    }
}

/// REST client for a hosted sandbox API.
#[derive(Debug, Clone)]
pub struct RemoteProvider {
    config: RemoteProviderConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct SandboxResponse {
    id: String,
    state: SessionState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    /// Seconds.
    timeout: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    result: String,
}

impl RemoteProvider {
    pub fn new(config: RemoteProviderConfig) -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| OrchestratorError::Provider {
                message: format!("failed to build http client: {err}"),
                status: None,
            })?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, OrchestratorError> {
        let mut url = self.config.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| OrchestratorError::InvalidRequest {
                message: format!("provider api url cannot be a base: {}", self.config.api_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `timeout` bounds the whole request and is what a timeout reports.
    async fn send(
        &self,
        request: RequestBuilder,
        sandbox_id: &str,
        operation: &str,
        timeout: Duration,
    ) -> Result<Response, OrchestratorError> {
        let response = request
            .bearer_auth(&self.config.api_key)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| map_transport_error(err, operation, timeout))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(sandbox_id, operation, status = %status, "provider request failed");
        Err(map_status(status, sandbox_id, operation, timeout, body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        sandbox_id: &str,
        operation: &str,
        timeout: Duration,
    ) -> Result<T, OrchestratorError> {
        self.send(request, sandbox_id, operation, timeout)
            .await?
            .json::<T>()
            .await
            .map_err(|err| OrchestratorError::Provider {
                message: format!("{operation}: invalid response body: {err}"),
                status: None,
            })
    }
}

#[async_trait]
impl SandboxProvider for RemoteProvider {
    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo, OrchestratorError> {
        let url = self.endpoint(&["sandbox", sandbox_id])?;
        let response: SandboxResponse = self
            .send_json(self.client.get(url), sandbox_id, "get sandbox", REQUEST_TIMEOUT)
            .await?;
        Ok(SandboxInfo {
            id: response.id,
            state: response.state,
        })
    }

    async fn start(&self, sandbox_id: &str) -> Result<(), OrchestratorError> {
        let url = self.endpoint(&["sandbox", sandbox_id, "start"])?;
        self.send(
            self.client.post(url),
            sandbox_id,
            "start sandbox",
            REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        let url = self.endpoint(&["toolbox", sandbox_id, "toolbox", "process", "execute"])?;
        let body = ExecuteRequest {
            command,
            cwd,
            timeout: timeout.as_secs().max(1),
        };
        // Leave the server room to report its own timeout first.
        let request = self.client.post(url).json(&body);
        let response: ExecuteResponse = self
            .send_json(
                request,
                sandbox_id,
                "execute command",
                timeout + CONNECT_TIMEOUT,
            )
            .await?;
        Ok(CommandOutput {
            result: response.result,
            exit_code: response.exit_code,
        })
    }

    async fn preview_link(
        &self,
        sandbox_id: &str,
        port: u16,
    ) -> Result<PreviewLink, OrchestratorError> {
        let port = port.to_string();
        let url = self.endpoint(&["sandbox", sandbox_id, "ports", &port, "preview-url"])?;
        self.send_json(self.client.get(url), sandbox_id, "preview link", REQUEST_TIMEOUT)
            .await
    }
}

fn map_transport_error(err: reqwest::Error, operation: &str, timeout: Duration) -> OrchestratorError {
    if err.is_timeout() {
        OrchestratorError::RemoteTimeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if err.is_connect() || err.is_request() {
        OrchestratorError::RemoteUnavailable {
            message: format!("{operation}: {err}"),
        }
    } else {
        OrchestratorError::Provider {
            message: format!("{operation}: {err}"),
            status: None,
        }
    }
}

fn map_status(
    status: StatusCode,
    sandbox_id: &str,
    operation: &str,
    timeout: Duration,
    body: String,
) -> OrchestratorError {
    match status {
        StatusCode::NOT_FOUND => OrchestratorError::SandboxNotFound {
            sandbox_id: sandbox_id.to_string(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => OrchestratorError::MissingCredentials {
            what: format!("{API_KEY_ENV} was rejected ({status})"),
        },
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
            OrchestratorError::RemoteUnavailable {
                message: format!("{operation}: {status}"),
            }
        }
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => {
            OrchestratorError::RemoteTimeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        }
        _ => OrchestratorError::Provider {
            message: if body.is_empty() {
                format!("{operation} failed")
            } else {
                format!("{operation} failed: {body}")
            },
            status: Some(status.as_u16()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(base: &str) -> RemoteProvider {
        RemoteProvider::new(RemoteProviderConfig::new(base, "key").expect("config"))
            .expect("provider")
    }

    #[test]
    fn builds_endpoints_under_the_api_base() {
        let provider = provider("https://sandboxes.example.com/api/");
        let url = provider
            .endpoint(&["sandbox", "sbx 1", "ports", "8080", "preview-url"])
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "https://sandboxes.example.com/api/sandbox/sbx%201/ports/8080/preview-url"
        );
    }

    #[test]
    fn empty_key_is_missing_credentials() {
        let err = RemoteProviderConfig::new("https://sandboxes.example.com", " ").unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingCredentials { .. }));
    }

    #[test]
    #[serial_test::serial]
    fn reads_credentials_from_env() {
        std::env::set_var(API_URL_ENV, "https://sandboxes.example.com");
        std::env::remove_var(API_KEY_ENV);
        let missing = RemoteProviderConfig::from_env();

        std::env::set_var(API_KEY_ENV, "key-1");
        let present = RemoteProviderConfig::from_env();
        std::env::remove_var(API_URL_ENV);
        std::env::remove_var(API_KEY_ENV);

        assert!(matches!(
            missing,
            Err(OrchestratorError::MissingCredentials { ref what }) if what == API_KEY_ENV
        ));
        let config = present.expect("config");
        assert_eq!(config.api_key, "key-1");
        assert_eq!(config.api_url.host_str(), Some("sandboxes.example.com"));
    }

    #[test]
    fn maps_not_found_to_sandbox_not_found() {
        let err = map_status(
            StatusCode::NOT_FOUND,
            "sbx-9",
            "get sandbox",
            REQUEST_TIMEOUT,
            String::new(),
        );
        assert!(matches!(
            err,
            OrchestratorError::SandboxNotFound { ref sandbox_id } if sandbox_id == "sbx-9"
        ));
        assert!(map_status(
            StatusCode::SERVICE_UNAVAILABLE,
            "sbx-9",
            "get sandbox",
            REQUEST_TIMEOUT,
            String::new()
        )
        .is_transient());
    }

    #[test]
    fn gateway_timeout_reports_the_request_timeout() {
        let err = map_status(
            StatusCode::GATEWAY_TIMEOUT,
            "sbx-9",
            "execute command",
            Duration::from_secs(15),
            String::new(),
        );
        assert!(matches!(
            err,
            OrchestratorError::RemoteTimeout { timeout_ms: 15_000, .. }
        ));
    }

    #[tokio::test]
    async fn command_timeout_reports_the_command_budget() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let provider = provider(&format!("http://{addr}/"));
        let err = provider
            .execute_command("sbx-1", "true", None, Duration::from_millis(200))
            .await
            .expect_err("never answered");
        server.abort();

        let expected = (Duration::from_millis(200) + CONNECT_TIMEOUT).as_millis() as u64;
        match err {
            OrchestratorError::RemoteTimeout { timeout_ms, .. } => {
                assert_eq!(timeout_ms, expected)
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
    }
}
