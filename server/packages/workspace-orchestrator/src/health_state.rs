//! The per-sandbox health state machine.
//!
//! [`HealthState::apply`] is the only transition function. It is pure apart
//! from the `now` it is handed, so every rule can be exercised without
//! timers; the observer actor in [`crate::monitor`] owns the state and feeds
//! it events.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::config::HealthPolicy;
use crate::health::SandboxHealthReport;
use crate::lifecycle::RestartSummary;
use crate::provider::SandboxState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthPhase {
    Unknown,
    Checking,
    Healthy,
    Degraded,
    Stopped,
    Restarting,
}

impl HealthPhase {
    /// Phase implied by a single report, ignoring history.
    pub fn classify(report: &SandboxHealthReport) -> Self {
        match report.sandbox_state {
            SandboxState::Started if report.all_running() => Self::Healthy,
            SandboxState::Started => Self::Degraded,
            SandboxState::Stopped | SandboxState::Error => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// A probe was issued.
    CheckStarted,
    Report(SandboxHealthReport),
    /// The probe itself could not run.
    ProbeFailed { message: String },
    RestartRequested,
    RestartCompleted(RestartSummary),
    RestartFailed { message: String, transient: bool },
    /// Periodic wakeup; only used to notice an expired restart.
    Tick,
}

#[derive(Debug, Clone)]
pub struct HealthState {
    phase: HealthPhase,
    last_report: Option<SandboxHealthReport>,
    restart_started_at: Option<Instant>,
    last_error: Option<String>,
    last_restart: Option<RestartSummary>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            phase: HealthPhase::Unknown,
            last_report: None,
            restart_started_at: None,
            last_error: None,
            last_restart: None,
        }
    }

    /// State of a sandbox nobody observes, built from one report.
    pub fn from_report(report: SandboxHealthReport) -> Self {
        let mut state = Self::new();
        state.apply(HealthEvent::Report(report), Instant::now(), &HealthPolicy::default());
        state
    }

    pub fn phase(&self) -> HealthPhase {
        self.phase
    }

    pub fn last_report(&self) -> Option<&SandboxHealthReport> {
        self.last_report.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn apply(&mut self, event: HealthEvent, now: Instant, policy: &HealthPolicy) -> HealthPhase {
        match event {
            HealthEvent::CheckStarted => {
                if self.phase == HealthPhase::Unknown {
                    self.phase = HealthPhase::Checking;
                }
            }
            HealthEvent::Report(report) => {
                let classified = HealthPhase::classify(&report);
                self.last_report = Some(report);
                if self.phase == HealthPhase::Restarting {
                    if classified == HealthPhase::Healthy {
                        self.restart_started_at = None;
                        self.last_error = None;
                        self.phase = HealthPhase::Healthy;
                    } else if self.restart_expired(now, policy) {
                        self.abandon_restart(policy);
                    }
                } else {
                    self.last_error = self.describe_report();
                    self.phase = classified;
                }
            }
            HealthEvent::ProbeFailed { message } => {
                self.last_error = Some(message);
                if self.phase == HealthPhase::Restarting {
                    if self.restart_expired(now, policy) {
                        self.abandon_restart(policy);
                    }
                } else {
                    self.phase = self.fallback_phase();
                }
            }
            HealthEvent::RestartRequested => {
                self.phase = HealthPhase::Restarting;
                self.restart_started_at = Some(now);
                self.last_error = None;
            }
            HealthEvent::RestartCompleted(summary) => {
                self.last_restart = Some(summary);
            }
            HealthEvent::RestartFailed { message, transient } => {
                self.last_error = Some(message);
                if self.phase == HealthPhase::Restarting && !transient {
                    self.restart_started_at = None;
                    self.phase = self.fallback_phase();
                }
            }
            HealthEvent::Tick => {
                if self.phase == HealthPhase::Restarting && self.restart_expired(now, policy) {
                    self.abandon_restart(policy);
                }
            }
        }
        self.phase
    }

    fn restart_expired(&self, now: Instant, policy: &HealthPolicy) -> bool {
        self.restart_started_at
            .map(|started| now.saturating_duration_since(started) >= policy.restart_timeout)
            .unwrap_or(true)
    }

    fn abandon_restart(&mut self, policy: &HealthPolicy) {
        self.restart_started_at = None;
        self.phase = self.fallback_phase();
        let detail = self
            .describe_report()
            .or_else(|| self.last_error.take())
            .unwrap_or_else(|| "no health report was received".to_string());
        self.last_error = Some(format!(
            "services did not recover within {}s: {detail}",
            policy.restart_timeout.as_secs()
        ));
    }

    /// Degraded when the sandbox was last seen running, Stopped otherwise.
    /// Never Healthy: nothing has confirmed the services.
    fn fallback_phase(&self) -> HealthPhase {
        match &self.last_report {
            Some(report) if report.sandbox_state == SandboxState::Started => HealthPhase::Degraded,
            _ => HealthPhase::Stopped,
        }
    }

    fn describe_report(&self) -> Option<String> {
        let report = self.last_report.as_ref()?;
        match HealthPhase::classify(report) {
            HealthPhase::Healthy => None,
            HealthPhase::Stopped => Some(format!("sandbox is {:?}", report.sandbox_state).to_lowercase()),
            _ => {
                let failing = report
                    .services
                    .iter()
                    .filter(|service| service.state != crate::health::ServiceState::Running)
                    .map(|service| format!("{}/{}", service.repository_name, service.name))
                    .collect::<Vec<_>>();
                Some(format!("not running: {}", failing.join(", ")))
            }
        }
    }

    /// Errors are expected while daemons come back and are held back until
    /// the restart settles.
    pub fn should_surface_error(&self) -> bool {
        self.phase != HealthPhase::Restarting && self.last_error.is_some()
    }

    pub fn poll_interval(&self, policy: &HealthPolicy) -> std::time::Duration {
        match self.phase {
            HealthPhase::Restarting => policy.restart_poll,
            _ => policy.steady_poll,
        }
    }

    pub fn user_message(&self) -> String {
        match self.phase {
            HealthPhase::Unknown => "Workspace status has not been checked yet.".to_string(),
            HealthPhase::Checking => "Checking workspace services...".to_string(),
            HealthPhase::Healthy => "All services are running.".to_string(),
            HealthPhase::Degraded => {
                let (running, total) = self
                    .last_report
                    .as_ref()
                    .map(|report| (report.running_count(), report.services.len()))
                    .unwrap_or((0, 0));
                format!(
                    "{running} of {total} services are running. Fix services to restart them."
                )
            }
            HealthPhase::Stopped => {
                "The workspace sandbox is not running. Fix services to start it.".to_string()
            }
            HealthPhase::Restarting => "Restarting services...".to_string(),
        }
    }

    pub fn view(&self, sandbox_id: &str, now: Instant) -> HealthStateView {
        let (running, total, checked_at) = match &self.last_report {
            Some(report) => (
                report.running_count(),
                report.services.len(),
                Some(report.timestamp),
            ),
            None => (0, 0, None),
        };
        HealthStateView {
            sandbox_id: sandbox_id.to_string(),
            phase: self.phase,
            message: self.user_message(),
            services_healthy: self.phase == HealthPhase::Healthy,
            running_services: running,
            total_services: total,
            error: if self.should_surface_error() {
                self.last_error.clone()
            } else {
                None
            },
            last_checked_at: checked_at,
            restarting_for_ms: self
                .restart_started_at
                .map(|started| now.saturating_duration_since(started).as_millis() as u64),
            last_restart: self.last_restart,
        }
    }
}

/// Serializable snapshot of a [`HealthState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthStateView {
    pub sandbox_id: String,
    pub phase: HealthPhase,
    pub message: String,
    pub services_healthy: bool,
    pub running_services: usize,
    pub total_services: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarting_for_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<RestartSummary>,
}

/// Body of `GET /workspace-status/{sandboxId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    pub status: HealthPhase,
    pub services_healthy: bool,
    pub message: String,
}

impl From<&HealthStateView> for WorkspaceStatus {
    fn from(view: &HealthStateView) -> Self {
        let message = match &view.error {
            Some(error) => format!("{} ({error})", view.message),
            None => view.message.clone(),
        };
        Self {
            status: view.phase,
            services_healthy: view.services_healthy,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::health::{ServiceState, ServiceStatus};
    use crate::services::ServiceKind;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            steady_poll: Duration::from_secs(90),
            restart_poll: Duration::from_secs(5),
            restart_timeout: Duration::from_secs(60),
        }
    }

    fn report(sandbox_state: SandboxState, states: &[ServiceState]) -> SandboxHealthReport {
        let services = states
            .iter()
            .zip(ServiceKind::ALL)
            .enumerate()
            .map(|(idx, (&state, service))| ServiceStatus {
                repository_id: "r1".to_string(),
                repository_name: "web".to_string(),
                name: service,
                port: 8080 + idx as u16,
                state,
                pid: None,
                url: None,
                error: None,
            })
            .collect();
        SandboxHealthReport {
            sandbox_id: "sbx-1".to_string(),
            sandbox_state,
            services,
            process_snapshot: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    fn healthy() -> SandboxHealthReport {
        report(SandboxState::Started, &[ServiceState::Running; 3])
    }

    fn two_of_three() -> SandboxHealthReport {
        report(
            SandboxState::Started,
            &[ServiceState::Running, ServiceState::Running, ServiceState::Stopped],
        )
    }

    #[test]
    fn first_check_goes_through_checking() {
        let mut state = HealthState::new();
        let now = Instant::now();
        assert_eq!(
            state.apply(HealthEvent::CheckStarted, now, &policy()),
            HealthPhase::Checking
        );
        assert_eq!(
            state.apply(HealthEvent::Report(healthy()), now, &policy()),
            HealthPhase::Healthy
        );
        assert!(!state.should_surface_error());
    }

    #[test]
    fn partially_running_sandbox_is_degraded() {
        let mut state = HealthState::new();
        let now = Instant::now();
        state.apply(HealthEvent::CheckStarted, now, &policy());
        let phase = state.apply(HealthEvent::Report(two_of_three()), now, &policy());
        assert_eq!(phase, HealthPhase::Degraded);
        assert_eq!(state.view("sbx-1", now).running_services, 2);
        assert!(state.user_message().starts_with("2 of 3"));
    }

    #[test]
    fn stopped_session_is_stopped() {
        let mut state = HealthState::new();
        let stopped = report(SandboxState::Stopped, &[ServiceState::Stopped; 3]);
        assert_eq!(
            state.apply(HealthEvent::Report(stopped), Instant::now(), &policy()),
            HealthPhase::Stopped
        );
    }

    #[test]
    fn restarting_holds_back_failures_until_timeout() {
        let mut state = HealthState::new();
        let start = Instant::now();
        state.apply(HealthEvent::Report(healthy()), start, &policy());
        state.apply(HealthEvent::RestartRequested, start, &policy());

        let later = start + Duration::from_secs(10);
        let phase = state.apply(
            HealthEvent::ProbeFailed {
                message: "connection reset".to_string(),
            },
            later,
            &policy(),
        );
        assert_eq!(phase, HealthPhase::Restarting);
        let stopped = report(SandboxState::Started, &[ServiceState::Stopped; 3]);
        assert_eq!(
            state.apply(HealthEvent::Report(stopped.clone()), later, &policy()),
            HealthPhase::Restarting
        );
        assert!(!state.should_surface_error());
        assert_eq!(state.view("sbx-1", later).error, None);
        assert_eq!(state.poll_interval(&policy()), Duration::from_secs(5));

        let expired = start + Duration::from_secs(61);
        assert_eq!(
            state.apply(HealthEvent::Report(stopped), expired, &policy()),
            HealthPhase::Degraded
        );
        assert!(state.should_surface_error());
        assert!(state
            .last_error()
            .unwrap_or_default()
            .contains("did not recover within 60s"));
    }

    #[test]
    fn healthy_report_ends_restart() {
        let mut state = HealthState::new();
        let start = Instant::now();
        state.apply(HealthEvent::RestartRequested, start, &policy());
        assert_eq!(
            state.apply(HealthEvent::Report(healthy()), start, &policy()),
            HealthPhase::Healthy
        );
        assert_eq!(state.view("sbx-1", start).restarting_for_ms, None);
    }

    #[test]
    fn tick_expires_restart_without_report() {
        let mut state = HealthState::new();
        let start = Instant::now();
        state.apply(HealthEvent::RestartRequested, start, &policy());
        assert_eq!(
            state.apply(HealthEvent::Tick, start + Duration::from_secs(30), &policy()),
            HealthPhase::Restarting
        );
        assert_eq!(
            state.apply(HealthEvent::Tick, start + Duration::from_secs(60), &policy()),
            HealthPhase::Stopped
        );
        assert!(state.should_surface_error());
    }

    #[test]
    fn precondition_failure_leaves_restarting_immediately() {
        let mut state = HealthState::new();
        let start = Instant::now();
        state.apply(HealthEvent::Report(two_of_three()), start, &policy());
        state.apply(HealthEvent::RestartRequested, start, &policy());
        let phase = state.apply(
            HealthEvent::RestartFailed {
                message: "missing credentials".to_string(),
                transient: false,
            },
            start,
            &policy(),
        );
        assert_eq!(phase, HealthPhase::Degraded);
        assert_eq!(state.last_error(), Some("missing credentials"));
    }

    #[test]
    fn probe_failure_outside_restart_degrades() {
        let mut state = HealthState::new();
        let now = Instant::now();
        state.apply(HealthEvent::Report(healthy()), now, &policy());
        assert_eq!(
            state.apply(
                HealthEvent::ProbeFailed {
                    message: "timeout".to_string()
                },
                now,
                &policy()
            ),
            HealthPhase::Degraded
        );
        assert!(state.should_surface_error());
    }

    #[test]
    fn workspace_status_appends_surfaced_error() {
        let mut state = HealthState::new();
        let now = Instant::now();
        state.apply(HealthEvent::Report(two_of_three()), now, &policy());
        let status = WorkspaceStatus::from(&state.view("sbx-1", now));
        assert_eq!(status.status, HealthPhase::Degraded);
        assert!(!status.services_healthy);
        assert!(status.message.contains("web/agent-terminal"));
    }
}
