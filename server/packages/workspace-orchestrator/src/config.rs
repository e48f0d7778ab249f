use std::time::Duration;

/// Timing and layout policy for one orchestrator instance. None of these
/// values are part of the correctness contract; the health prober is what
/// confirms a restart actually worked.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Kill, launch and HTTP probe commands.
    pub short_command_timeout: Duration,
    /// Directory, process table and listening-port checks.
    pub check_timeout: Duration,
    /// How long to wait for a suspended session to come back.
    pub session_start_wait: Duration,
    /// Pause between killing stale listeners and launching.
    pub settle_delay: Duration,
    /// Pause before each post-launch HTTP probe.
    pub post_launch_delay: Duration,
    pub probe_attempts: u32,
    /// Repository directories live under this path. Relative paths resolve
    /// against the session user's home.
    pub workspace_root: String,
    pub health: HealthPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            short_command_timeout: Duration::from_secs(5),
            check_timeout: Duration::from_secs(10),
            session_start_wait: Duration::from_secs(10),
            settle_delay: Duration::from_secs(3),
            post_launch_delay: Duration::from_secs(2),
            probe_attempts: 5,
            workspace_root: "workspace".to_string(),
            health: HealthPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub steady_poll: Duration,
    pub restart_poll: Duration,
    pub restart_timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            steady_poll: Duration::from_secs(90),
            restart_poll: Duration::from_secs(5),
            restart_timeout: Duration::from_secs(120),
        }
    }
}
