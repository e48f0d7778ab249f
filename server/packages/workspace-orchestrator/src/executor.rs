use std::sync::Arc;
use std::time::Duration;

use workspace_orchestrator_error::OrchestratorError;

use crate::provider::{CommandOutput, SandboxProvider};

/// Runs shell commands in one sandbox with a hard per-call deadline.
///
/// The provider is given the timeout too, but a hung connection would never
/// honour it, so the deadline is also enforced here.
#[derive(Clone)]
pub struct RemoteCommandExecutor {
    provider: Arc<dyn SandboxProvider>,
    sandbox_id: String,
}

impl std::fmt::Debug for RemoteCommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommandExecutor")
            .field("sandbox_id", &self.sandbox_id)
            .finish_non_exhaustive()
    }
}

impl RemoteCommandExecutor {
    pub fn new(provider: Arc<dyn SandboxProvider>, sandbox_id: impl Into<String>) -> Self {
        Self {
            provider,
            sandbox_id: sandbox_id.into(),
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        self.run_in(command, None, timeout).await
    }

    pub async fn run_in(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        let started = tokio::time::Instant::now();
        let result = tokio::time::timeout(
            timeout,
            self.provider
                .execute_command(&self.sandbox_id, command, cwd, timeout),
        )
        .await
        .unwrap_or_else(|_| {
            Err(OrchestratorError::RemoteTimeout {
                operation: summarize(command),
                timeout_ms: timeout.as_millis() as u64,
            })
        });

        match &result {
            Ok(output) => tracing::debug!(
                sandbox_id = %self.sandbox_id,
                command = %summarize(command),
                exit_code = output.exit_code,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "remote command finished"
            ),
            Err(err) => tracing::debug!(
                sandbox_id = %self.sandbox_id,
                command = %summarize(command),
                error = %err,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "remote command failed"
            ),
        }
        result
    }
}

/// First line of a command, shortened for logs and error messages.
fn summarize(command: &str) -> String {
    const MAX: usize = 80;
    let line = command.lines().next().unwrap_or_default();
    match line.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}
