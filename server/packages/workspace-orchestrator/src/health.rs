//! Point-in-time health of every service in a sandbox.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use utoipa::ToSchema;
use workspace_orchestrator_error::OrchestratorError;

use crate::config::OrchestratorConfig;
use crate::executor::RemoteCommandExecutor;
use crate::metadata::{MetadataStore, Workspace};
use crate::provider::{SandboxProvider, SandboxState};
use crate::services::{
    http_probe_command, is_success_status, parse_http_status, parse_listening_ports,
    parse_process_table, ProcessEntry, ServiceKind, LISTENING_PORTS_COMMAND,
    PROCESS_TABLE_COMMAND,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub repository_id: String,
    pub repository_name: String,
    pub name: ServiceKind,
    pub port: u16,
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHealthReport {
    pub sandbox_id: String,
    pub sandbox_state: SandboxState,
    pub services: Vec<ServiceStatus>,
    /// `ps` lines of the service daemons, for debugging.
    pub process_snapshot: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SandboxHealthReport {
    pub fn running_count(&self) -> usize {
        self.services
            .iter()
            .filter(|service| service.state == ServiceState::Running)
            .count()
    }

    pub fn all_running(&self) -> bool {
        self.services
            .iter()
            .all(|service| service.state == ServiceState::Running)
    }

    /// A report with every service of `workspace` in `state`, without probing.
    fn uniform(
        workspace: &Workspace,
        sandbox_state: SandboxState,
        state: ServiceState,
        error: Option<String>,
    ) -> Self {
        let services = workspace
            .repositories
            .iter()
            .flat_map(|repo| {
                let ports = repo.port_triple();
                let error = error.clone();
                ServiceKind::ALL.into_iter().map(move |service| ServiceStatus {
                    repository_id: repo.id.clone(),
                    repository_name: repo.name.clone(),
                    name: service,
                    port: ports.port(service),
                    state,
                    pid: None,
                    url: None,
                    error: error.clone(),
                })
            })
            .collect();
        Self {
            sandbox_id: workspace.sandbox_id.clone(),
            sandbox_state,
            services,
            process_snapshot: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct HealthProber {
    provider: Arc<dyn SandboxProvider>,
    store: Arc<dyn MetadataStore>,
    config: Arc<OrchestratorConfig>,
}

impl std::fmt::Debug for HealthProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProber").finish_non_exhaustive()
    }
}

impl HealthProber {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        store: Arc<dyn MetadataStore>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            provider,
            store,
            config,
        }
    }

    /// Samples the sandbox. A service is `running` only when its process,
    /// its listening port and an HTTP probe all agree; `error` when the
    /// process exists but does not serve; `stopped` otherwise.
    ///
    /// Only an unknown sandbox or an unreadable store is an error. Remote
    /// failures while probing are reported inside the report.
    pub async fn probe(&self, sandbox_id: &str) -> Result<SandboxHealthReport, OrchestratorError> {
        let started = Instant::now();
        let workspace = self.store.load_workspace(sandbox_id).await?;

        let sandbox_state = match self.provider.get(sandbox_id).await {
            Ok(info) => info.state.sandbox_state(),
            Err(err @ OrchestratorError::SandboxNotFound { .. }) => return Err(err),
            Err(err) => {
                tracing::warn!(sandbox_id, error = %err, "sandbox state unavailable");
                return Ok(SandboxHealthReport::uniform(
                    &workspace,
                    SandboxState::Error,
                    ServiceState::Stopped,
                    Some(err.to_string()),
                ));
            }
        };
        if sandbox_state != SandboxState::Started {
            return Ok(SandboxHealthReport::uniform(
                &workspace,
                sandbox_state,
                ServiceState::Stopped,
                None,
            ));
        }

        let executor = RemoteCommandExecutor::new(self.provider.clone(), sandbox_id);
        let processes = match executor
            .run(PROCESS_TABLE_COMMAND, self.config.check_timeout)
            .await
        {
            Ok(output) => parse_process_table(&output.result),
            Err(err) => {
                return Ok(SandboxHealthReport::uniform(
                    &workspace,
                    sandbox_state,
                    ServiceState::Error,
                    Some(format!("process table unavailable: {err}")),
                ));
            }
        };
        // `None` when the session cannot list sockets; the HTTP probe decides.
        let listening = match executor
            .run(LISTENING_PORTS_COMMAND, self.config.check_timeout)
            .await
        {
            Ok(output) if output.exit_code == 0 && !output.result.trim().is_empty() => {
                Some(parse_listening_ports(&output.result))
            }
            Ok(output) => {
                tracing::warn!(
                    sandbox_id,
                    exit_code = output.exit_code,
                    "listening ports unavailable"
                );
                None
            }
            Err(err) => {
                tracing::warn!(sandbox_id, error = %err, "listening ports unavailable");
                None
            }
        };

        let mut services = Vec::with_capacity(workspace.repositories.len() * 3);
        for repo in &workspace.repositories {
            let ports = repo.port_triple();
            for service in ServiceKind::ALL {
                let port = ports.port(service);
                let process = processes
                    .iter()
                    .find(|entry| service.matches_process(&entry.args, port));
                let mut status = ServiceStatus {
                    repository_id: repo.id.clone(),
                    repository_name: repo.name.clone(),
                    name: service,
                    port,
                    state: ServiceState::Stopped,
                    pid: process.map(|entry| entry.pid),
                    url: None,
                    error: None,
                };
                if process.is_some() {
                    self.classify_live(&executor, listening.as_ref(), &mut status)
                        .await;
                    if status.state == ServiceState::Running {
                        status.url = repo.service_urls.get(&service).cloned();
                    }
                }
                services.push(status);
            }
        }

        let report = SandboxHealthReport {
            sandbox_id: sandbox_id.to_string(),
            sandbox_state,
            services,
            process_snapshot: daemon_lines(&processes),
            timestamp: Utc::now(),
        };
        tracing::debug!(
            sandbox_id,
            running = report.running_count(),
            total = report.services.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "health probe finished"
        );
        Ok(report)
    }

    async fn classify_live(
        &self,
        executor: &RemoteCommandExecutor,
        listening: Option<&HashSet<u16>>,
        status: &mut ServiceStatus,
    ) {
        let port = status.port;
        let probe = executor
            .run(&http_probe_command(port), self.config.short_command_timeout)
            .await;
        let http_ok = match probe {
            Ok(output) => match parse_http_status(&output.result) {
                Some(code) if is_success_status(code) => true,
                Some(code) => {
                    status.error = Some(format!("HTTP {code} from port {port}"));
                    false
                }
                None => {
                    status.error = Some(format!("no HTTP response on port {port}"));
                    false
                }
            },
            Err(err) => {
                status.error = Some(format!("probe failed: {err}"));
                false
            }
        };
        let port_listening = listening.map_or(true, |ports| ports.contains(&port));
        status.state = if http_ok && port_listening {
            ServiceState::Running
        } else {
            if http_ok {
                status.error = Some(format!("port {port} is not listening"));
            }
            ServiceState::Error
        };
    }
}

fn daemon_lines(processes: &[ProcessEntry]) -> Vec<String> {
    processes
        .iter()
        .filter(|entry| entry.args.contains("code-server") || entry.args.contains("ttyd"))
        .map(|entry| format!("{} {}", entry.pid, entry.args))
        .collect()
}
