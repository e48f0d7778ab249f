use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use workspace_orchestrator_error::OrchestratorError;

use super::{CommandOutput, PreviewLink, SandboxInfo, SandboxProvider, SessionState};

/// Runs everything on this host. Every sandbox id names the same machine.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    home: PathBuf,
}

impl LocalProvider {
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        Self { home }
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo, OrchestratorError> {
        Ok(SandboxInfo {
            id: sandbox_id.to_string(),
            state: SessionState::Started,
        })
    }

    async fn start(&self, _sandbox_id: &str) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn execute_command(
        &self,
        _sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        let dir = match cwd {
            Some(cwd) => self.home.join(cwd),
            None => self.home.clone(),
        };
        let mut child = Command::new("sh");
        child
            .arg("-c")
            .arg(command)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, child.output())
            .await
            .map_err(|_| OrchestratorError::RemoteTimeout {
                operation: command.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|err| OrchestratorError::Provider {
                message: format!("failed to run `sh -c` in {}: {err}", dir.display()),
                status: None,
            })?;

        let mut result = String::from_utf8_lossy(&output.stdout).into_owned();
        result.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            result,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn preview_link(
        &self,
        _sandbox_id: &str,
        port: u16,
    ) -> Result<PreviewLink, OrchestratorError> {
        Ok(PreviewLink {
            url: format!("http://localhost:{port}"),
            token: None,
        })
    }
}
