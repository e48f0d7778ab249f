//! The sandbox provider seam: the few compute-session operations the
//! orchestrator needs, and the two backends that implement them.

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use utoipa::ToSchema;
use workspace_orchestrator_error::OrchestratorError;

mod local;
mod remote;

pub use local::LocalProvider;
pub use remote::{RemoteProvider, RemoteProviderConfig};

const START_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Started,
    Starting,
    Stopped,
    Stopping,
    Archived,
    Error,
    #[serde(other)]
    Unknown,
}

/// The coarse session state carried by health reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Started,
    Stopped,
    Error,
}

impl SessionState {
    pub fn sandbox_state(self) -> SandboxState {
        match self {
            Self::Started => SandboxState::Started,
            Self::Starting | Self::Stopped | Self::Stopping | Self::Archived => {
                SandboxState::Stopped
            }
            Self::Error | Self::Unknown => SandboxState::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
    pub id: String,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub result: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewLink {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Operations the orchestrator calls on the compute-session backend. Creating
/// and deleting sessions is done elsewhere.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo, OrchestratorError>;

    async fn start(&self, sandbox_id: &str) -> Result<(), OrchestratorError>;

    /// Runs `command` through the session's shell. A non-zero exit is not an
    /// error; callers inspect [`CommandOutput::exit_code`].
    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError>;

    async fn preview_link(
        &self,
        sandbox_id: &str,
        port: u16,
    ) -> Result<PreviewLink, OrchestratorError>;
}

/// Starts the session if needed and waits until the provider reports it as
/// started.
pub async fn ensure_running(
    provider: &dyn SandboxProvider,
    sandbox_id: &str,
    wait: Duration,
) -> Result<SandboxInfo, OrchestratorError> {
    let info = provider.get(sandbox_id).await?;
    if info.state == SessionState::Started {
        return Ok(info);
    }

    tracing::info!(sandbox_id, state = ?info.state, "sandbox not running; starting");
    let started = Instant::now();
    provider.start(sandbox_id).await?;

    loop {
        let info = provider.get(sandbox_id).await?;
        match info.state {
            SessionState::Started => {
                tracing::info!(
                    sandbox_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sandbox started"
                );
                return Ok(info);
            }
            SessionState::Error => {
                return Err(OrchestratorError::Provider {
                    message: format!("sandbox {sandbox_id} entered the error state while starting"),
                    status: None,
                });
            }
            _ => {}
        }
        if started.elapsed() >= wait {
            return Err(OrchestratorError::RemoteTimeout {
                operation: format!("start sandbox {sandbox_id}"),
                timeout_ms: wait.as_millis() as u64,
            });
        }
        tokio::time::sleep(START_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_session_states() {
        assert_eq!(SessionState::Started.sandbox_state(), SandboxState::Started);
        assert_eq!(SessionState::Archived.sandbox_state(), SandboxState::Stopped);
        assert_eq!(SessionState::Starting.sandbox_state(), SandboxState::Stopped);
        assert_eq!(SessionState::Unknown.sandbox_state(), SandboxState::Error);
    }

    #[test]
    fn unrecognized_states_deserialize_as_unknown() {
        let state: SessionState = serde_json::from_str("\"pulling_snapshot\"").expect("parse");
        assert_eq!(state, SessionState::Unknown);
    }
}
