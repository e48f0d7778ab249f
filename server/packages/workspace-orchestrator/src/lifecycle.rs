//! Kill, launch and verify the per-repository daemons of a sandbox.
//!
//! [`ServiceLifecycleManager::restart_services_complete`] is the only entry
//! point that mutates services. It always kills before launching, so running
//! it repeatedly converges on the same state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use utoipa::ToSchema;
use workspace_orchestrator_error::OrchestratorError;

use crate::config::OrchestratorConfig;
use crate::executor::RemoteCommandExecutor;
use crate::metadata::{MetadataStore, RepositoryRecord, Workspace};
use crate::provider::{ensure_running, SandboxProvider};
use crate::services::{
    directory_check_command, directory_exists, http_probe_command, is_success_status,
    kill_ports_command, parse_http_status, parse_launch_pid, ServiceKind,
};

static JOB_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum CleanupOutcome {
    /// Something was listening and was sent SIGKILL.
    Killed,
    /// Nothing was listening.
    NotFound,
    /// The port could not be looked up, or the kill command did not report
    /// on it.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortCleanup {
    pub port: u16,
    pub outcome: CleanupOutcome,
}

/// Reads the `killed:<port>` / `free:<port>` / `unknown:<port>` markers
/// printed by the kill command. Ports without a marker are `Unknown`.
pub fn parse_cleanup(output: &str, ports: &[u16]) -> Vec<PortCleanup> {
    ports
        .iter()
        .map(|&port| {
            let killed = format!("killed:{port}");
            let free = format!("free:{port}");
            let unknown = format!("unknown:{port}");
            let outcome = output
                .lines()
                .map(str::trim)
                .find_map(|line| {
                    if line == killed {
                        Some(CleanupOutcome::Killed)
                    } else if line == free {
                        Some(CleanupOutcome::NotFound)
                    } else if line == unknown {
                        Some(CleanupOutcome::Unknown)
                    } else {
                        None
                    }
                })
                .unwrap_or(CleanupOutcome::Unknown);
            PortCleanup { port, outcome }
        })
        .collect()
}

/// Correlation handle for one detached launch. It says nothing about
/// liveness; only a probe does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LaunchHandle {
    pub token: String,
    pub service: ServiceKind,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl LaunchHandle {
    fn next(service: ServiceKind, port: u16, pid: Option<u32>) -> Self {
        let id = JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            token: format!("job-{id}"),
            service,
            port,
            pid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LaunchStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLaunchResult {
    pub service: ServiceKind,
    pub port: u16,
    pub status: LaunchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<LaunchHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceLaunchResult {
    fn failed(service: ServiceKind, port: u16, error: String) -> Self {
        Self {
            service,
            port,
            status: LaunchStatus::Failed,
            url: None,
            token: None,
            job: None,
            http_status: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryStatus {
    Success,
    Partial,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryServiceResult {
    pub repository_id: String,
    pub repository_name: String,
    pub status: RepositoryStatus,
    pub cleanup: Vec<PortCleanup>,
    pub services: Vec<ServiceLaunchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RepositoryServiceResult {
    fn from_services(
        repo: &RepositoryRecord,
        cleanup: Vec<PortCleanup>,
        services: Vec<ServiceLaunchResult>,
    ) -> Self {
        let succeeded = services
            .iter()
            .filter(|service| service.status == LaunchStatus::Success)
            .count();
        let status = if succeeded == services.len() {
            RepositoryStatus::Success
        } else if succeeded == 0 {
            RepositoryStatus::Failed
        } else {
            RepositoryStatus::Partial
        };
        Self {
            repository_id: repo.id.clone(),
            repository_name: repo.name.clone(),
            status,
            cleanup,
            services,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestartSummary {
    pub repositories: usize,
    /// Services a launch was attempted for. Skipped repositories add none.
    pub total_services: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped_repositories: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRestartResult {
    pub summary: RestartSummary,
    pub per_repository: Vec<RepositoryServiceResult>,
}

impl ServiceRestartResult {
    fn from_repositories(per_repository: Vec<RepositoryServiceResult>) -> Self {
        let mut summary = RestartSummary {
            repositories: per_repository.len(),
            ..RestartSummary::default()
        };
        for repo in &per_repository {
            if repo.status == RepositoryStatus::Skipped {
                summary.skipped_repositories += 1;
            }
            for service in &repo.services {
                summary.total_services += 1;
                match service.status {
                    LaunchStatus::Success => summary.successful += 1,
                    LaunchStatus::Failed => summary.failed += 1,
                }
            }
        }
        Self {
            summary,
            per_repository,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.summary.failed == 0 && self.summary.successful == self.summary.total_services
    }
}

#[derive(Clone)]
pub struct ServiceLifecycleManager {
    provider: Arc<dyn SandboxProvider>,
    store: Arc<dyn MetadataStore>,
    config: Arc<OrchestratorConfig>,
}

impl std::fmt::Debug for ServiceLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLifecycleManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceLifecycleManager {
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

    /// Restarts every service of every repository in the sandbox.
    ///
    /// Errors are returned only when the sandbox itself cannot be reached or
    /// its repositories cannot be loaded. Anything that goes wrong for one
    /// service is recorded in that service's result.
    pub async fn restart_services_complete(
        &self,
        sandbox_id: &str,
    ) -> Result<ServiceRestartResult, OrchestratorError> {
        let started = Instant::now();
        ensure_running(self.provider.as_ref(), sandbox_id, self.config.session_start_wait).await?;
        let mut workspace = self.store.load_repaired(sandbox_id).await?;
        let executor = RemoteCommandExecutor::new(self.provider.clone(), sandbox_id);

        tracing::info!(
            sandbox_id,
            repositories = workspace.repositories.len(),
            "restarting services"
        );

        let mut cleanups = Vec::with_capacity(workspace.repositories.len());
        for repo in &workspace.repositories {
            cleanups.push(self.cleanup(&executor, repo).await);
        }
        if !workspace.repositories.is_empty() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let mut per_repository = Vec::with_capacity(workspace.repositories.len());
        for (repo, cleanup) in workspace.repositories.iter().zip(cleanups) {
            let result = self.restart_repository(&executor, repo, cleanup).await;
            tracing::info!(
                sandbox_id,
                repository = %repo.name,
                status = ?result.status,
                "repository services processed"
            );
            per_repository.push(result);
        }

        let result = ServiceRestartResult::from_repositories(per_repository);
        self.record_urls(&mut workspace, &result).await;

        tracing::info!(
            sandbox_id,
            total_services = result.summary.total_services,
            successful = result.summary.successful,
            failed = result.summary.failed,
            skipped = result.summary.skipped_repositories,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "service restart finished"
        );
        Ok(result)
    }

    async fn cleanup(
        &self,
        executor: &RemoteCommandExecutor,
        repo: &RepositoryRecord,
    ) -> Vec<PortCleanup> {
        let ports = repo.port_triple().all();
        match executor
            .run(&kill_ports_command(&ports), self.config.short_command_timeout)
            .await
        {
            Ok(output) => parse_cleanup(&output.result, &ports),
            Err(err) => {
                tracing::warn!(
                    sandbox_id = executor.sandbox_id(),
                    repository = %repo.name,
                    error = %err,
                    "stale listener cleanup failed; continuing"
                );
                parse_cleanup("", &ports)
            }
        }
    }

    async fn restart_repository(
        &self,
        executor: &RemoteCommandExecutor,
        repo: &RepositoryRecord,
        cleanup: Vec<PortCleanup>,
    ) -> RepositoryServiceResult {
        let dir = repo.working_dir(&self.config.workspace_root);
        let ports = repo.port_triple();

        match executor
            .run(&directory_check_command(&dir), self.config.check_timeout)
            .await
        {
            Ok(output) if directory_exists(&output.result) => {}
            Ok(_) => {
                tracing::warn!(
                    sandbox_id = executor.sandbox_id(),
                    repository = %repo.name,
                    dir = %dir,
                    "repository directory missing; skipping"
                );
                return RepositoryServiceResult {
                    repository_id: repo.id.clone(),
                    repository_name: repo.name.clone(),
                    status: RepositoryStatus::Skipped,
                    cleanup,
                    services: Vec::new(),
                    message: Some(
                        OrchestratorError::DirectoryMissing { path: dir }.to_string(),
                    ),
                };
            }
            Err(err) => {
                let message = format!("directory check failed: {err}");
                let services = ServiceKind::ALL
                    .iter()
                    .map(|&service| {
                        ServiceLaunchResult::failed(service, ports.port(service), message.clone())
                    })
                    .collect();
                let mut result = RepositoryServiceResult::from_services(repo, cleanup, services);
                result.message = Some(message);
                return result;
            }
        }

        let mut services = Vec::with_capacity(ServiceKind::ALL.len());
        for service in ServiceKind::ALL {
            services.push(
                self.launch_service(executor, service, ports.port(service), &dir)
                    .await,
            );
        }
        RepositoryServiceResult::from_services(repo, cleanup, services)
    }

    async fn launch_service(
        &self,
        executor: &RemoteCommandExecutor,
        service: ServiceKind,
        port: u16,
        dir: &str,
    ) -> ServiceLaunchResult {
        let launch = match executor
            .run(
                &service.launch_command(port, dir),
                self.config.short_command_timeout,
            )
            .await
        {
            Ok(output) => LaunchHandle::next(service, port, parse_launch_pid(&output.result)),
            Err(err) => {
                tracing::warn!(
                    sandbox_id = executor.sandbox_id(),
                    service = %service,
                    port,
                    error = %err,
                    "launch failed"
                );
                return ServiceLaunchResult::failed(service, port, format!("launch failed: {err}"));
            }
        };
        tracing::debug!(
            sandbox_id = executor.sandbox_id(),
            service = %service,
            port,
            job = %launch.token,
            pid = ?launch.pid,
            "service launched"
        );

        let mut last_status = None;
        let mut last_error = None;
        for _ in 0..self.config.probe_attempts.max(1) {
            tokio::time::sleep(self.config.post_launch_delay).await;
            match executor
                .run(&http_probe_command(port), self.config.short_command_timeout)
                .await
            {
                Ok(output) => match parse_http_status(&output.result) {
                    Some(status) if is_success_status(status) => {
                        return self.succeeded(executor, launch, Some(status)).await;
                    }
                    Some(status) => last_status = Some(status),
                    None => last_error = Some(format!("nothing answered on port {port}")),
                },
                Err(err) => last_error = Some(format!("probe failed: {err}")),
            }
        }

        tracing::warn!(
            sandbox_id = executor.sandbox_id(),
            service = %service,
            port,
            http_status = ?last_status,
            "service did not become healthy"
        );
        ServiceLaunchResult {
            service,
            port,
            status: LaunchStatus::Failed,
            url: None,
            token: None,
            job: Some(launch),
            http_status: last_status,
            error: Some(match (last_status, last_error) {
                (Some(status), _) => format!("HTTP {status} from port {port}"),
                (None, Some(error)) => error,
                (None, None) => format!("no response from port {port}"),
            }),
        }
    }

    async fn succeeded(
        &self,
        executor: &RemoteCommandExecutor,
        launch: LaunchHandle,
        http_status: Option<u16>,
    ) -> ServiceLaunchResult {
        let (url, token) = match self
            .provider
            .preview_link(executor.sandbox_id(), launch.port)
            .await
        {
            Ok(link) => (Some(link.url), link.token),
            Err(err) => {
                tracing::warn!(
                    sandbox_id = executor.sandbox_id(),
                    port = launch.port,
                    error = %err,
                    "preview link unavailable"
                );
                (None, None)
            }
        };
        ServiceLaunchResult {
            service: launch.service,
            port: launch.port,
            status: LaunchStatus::Success,
            url,
            token,
            job: Some(launch),
            http_status,
            error: None,
        }
    }

    /// Stores the preview links of successful services. Failure here does not
    /// affect the restart result.
    async fn record_urls(&self, workspace: &mut Workspace, result: &ServiceRestartResult) {
        let mut changed = false;
        for repo_result in &result.per_repository {
            let Some(record) = workspace.repository_mut(&repo_result.repository_id) else {
                continue;
            };
            for service in &repo_result.services {
                if let Some(url) = &service.url {
                    changed |= record.service_urls.get(&service.service) != Some(url);
                    record.service_urls.insert(service.service, url.clone());
                }
                if let Some(token) = &service.token {
                    changed |= record.tokens.get(&service.service) != Some(token);
                    record.tokens.insert(service.service, token.clone());
                }
            }
        }
        if !changed {
            return;
        }
        if let Err(err) = self.store.save_workspace(workspace).await {
            tracing::warn!(
                sandbox_id = %workspace.sandbox_id,
                error = %err,
                "failed to record service urls"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_markers_map_to_outcomes() {
        let output = "killed:8080\nfree:10000\n";
        assert_eq!(
            parse_cleanup(output, &[8080, 10000, 4000]),
            vec![
                PortCleanup {
                    port: 8080,
                    outcome: CleanupOutcome::Killed
                },
                PortCleanup {
                    port: 10000,
                    outcome: CleanupOutcome::NotFound
                },
                PortCleanup {
                    port: 4000,
                    outcome: CleanupOutcome::Unknown
                },
            ]
        );
    }

    #[test]
    fn unknown_marker_is_not_read_as_free() {
        let output = "unknown:8080\nfree:10000\nkilled:4000\n";
        let outcomes: Vec<CleanupOutcome> = parse_cleanup(output, &[8080, 10000, 4000])
            .into_iter()
            .map(|cleanup| cleanup.outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![
                CleanupOutcome::Unknown,
                CleanupOutcome::NotFound,
                CleanupOutcome::Killed
            ]
        );
    }

    #[test]
    fn launch_tokens_are_unique() {
        let first = LaunchHandle::next(ServiceKind::Editor, 8080, None);
        let second = LaunchHandle::next(ServiceKind::Editor, 8080, None);
        assert_ne!(first.token, second.token);
        assert!(first.token.starts_with("job-"));
    }

    #[test]
    fn summary_counts_only_attempted_services() {
        let record = RepositoryRecord {
            id: "r1".to_string(),
            name: "web".to_string(),
            source_type: crate::metadata::SourceType::Github,
            slot: crate::ports::RepositorySlot::new(0).expect("slot"),
            ports: Default::default(),
            service_urls: Default::default(),
            tokens: Default::default(),
        };
        let partial = RepositoryServiceResult::from_services(
            &record,
            Vec::new(),
            vec![
                ServiceLaunchResult::failed(ServiceKind::Editor, 8080, "boom".to_string()),
                ServiceLaunchResult {
                    status: LaunchStatus::Success,
                    error: None,
                    ..ServiceLaunchResult::failed(ServiceKind::Terminal, 10000, String::new())
                },
            ],
        );
        assert_eq!(partial.status, RepositoryStatus::Partial);

        let skipped = RepositoryServiceResult {
            status: RepositoryStatus::Skipped,
            services: Vec::new(),
            ..partial.clone()
        };
        let result = ServiceRestartResult::from_repositories(vec![partial, skipped]);
        assert_eq!(result.summary.repositories, 2);
        assert_eq!(result.summary.total_services, 2);
        assert_eq!(result.summary.successful, 1);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.summary.skipped_repositories, 1);
    }
}
