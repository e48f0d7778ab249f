use std::sync::Arc;
use std::time::Duration;

use workspace_orchestrator::config::OrchestratorConfig;
use workspace_orchestrator::health::HealthProber;
use workspace_orchestrator::lifecycle::ServiceLifecycleManager;
use workspace_orchestrator::metadata::MemoryStore;
use workspace_orchestrator::testing::{workspace_with, FakeSandbox};

const SANDBOX_ID: &str = "sbx-test";

/// No settle or post-launch pauses; the fake sandbox answers immediately.
fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        settle_delay: Duration::ZERO,
        post_launch_delay: Duration::ZERO,
        probe_attempts: 2,
        ..OrchestratorConfig::default()
    }
}

struct Harness {
    sandbox: Arc<FakeSandbox>,
    store: Arc<MemoryStore>,
    config: Arc<OrchestratorConfig>,
}

impl Harness {
    fn new(repositories: &[&str]) -> Self {
        Self {
            sandbox: Arc::new(FakeSandbox::new(SANDBOX_ID)),
            store: Arc::new(MemoryStore::with_workspace(workspace_with(
                SANDBOX_ID,
                repositories,
            ))),
            config: Arc::new(fast_config()),
        }
    }

    fn lifecycle(&self) -> ServiceLifecycleManager {
        ServiceLifecycleManager::new(
            self.sandbox.clone(),
            self.store.clone(),
            self.config.clone(),
        )
    }

    fn prober(&self) -> HealthProber {
        HealthProber::new(
            self.sandbox.clone(),
            self.store.clone(),
            self.config.clone(),
        )
    }
}
