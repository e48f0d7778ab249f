//! Observers: one task per watched sandbox, owning its [`HealthState`].
//!
//! The observer task is the only writer of its state. Probes and restarts
//! run as child tasks and report back over a channel, so a slow remote call
//! never blocks snapshots. An observer ends on its own once the provider
//! reports the sandbox gone.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use workspace_orchestrator_error::OrchestratorError;

use crate::config::HealthPolicy;
use crate::health::{HealthProber, SandboxHealthReport};
use crate::health_state::{HealthEvent, HealthPhase, HealthState, HealthStateView};
use crate::lifecycle::{ServiceLifecycleManager, ServiceRestartResult};

const COMMAND_BUFFER: usize = 16;

enum Command {
    Snapshot(oneshot::Sender<HealthStateView>),
    Restart(oneshot::Sender<HealthStateView>),
    Stop,
}

enum TaskResult {
    Probe {
        epoch: u64,
        result: Result<SandboxHealthReport, OrchestratorError>,
    },
    Restart(Result<ServiceRestartResult, OrchestratorError>),
}

struct ObserverHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug)]
pub struct HealthMonitor {
    prober: HealthProber,
    lifecycle: ServiceLifecycleManager,
    policy: HealthPolicy,
    observers: Mutex<HashMap<String, ObserverHandle>>,
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(
        prober: HealthProber,
        lifecycle: ServiceLifecycleManager,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            prober,
            lifecycle,
            policy,
            observers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts observing `sandbox_id`. Observing an already observed sandbox
    /// returns its current state; an unknown sandbox is `SandboxNotFound`.
    pub async fn observe(&self, sandbox_id: &str) -> Result<HealthStateView, OrchestratorError> {
        let commands = self.observer(sandbox_id).await?;
        request(&commands, sandbox_id, Command::Snapshot).await
    }

    pub async fn snapshot(&self, sandbox_id: &str) -> Result<HealthStateView, OrchestratorError> {
        let commands = self
            .live_observers()
            .await
            .get(sandbox_id)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| OrchestratorError::ObservationNotFound {
                sandbox_id: sandbox_id.to_string(),
            })?;
        request(&commands, sandbox_id, Command::Snapshot).await
    }

    /// Puts the sandbox into `Restarting` and restarts its services in the
    /// background. Unobserved sandboxes are observed first.
    pub async fn restart(&self, sandbox_id: &str) -> Result<HealthStateView, OrchestratorError> {
        let commands = self.observer(sandbox_id).await?;
        request(&commands, sandbox_id, Command::Restart).await
    }

    /// Stops observing. The observer's timer and any in-flight probe are
    /// cancelled; a restart already running is left to finish.
    pub async fn unobserve(&self, sandbox_id: &str) -> Result<(), OrchestratorError> {
        let handle = self
            .live_observers()
            .await
            .remove(sandbox_id)
            .ok_or_else(|| OrchestratorError::ObservationNotFound {
                sandbox_id: sandbox_id.to_string(),
            })?;
        let _ = handle.commands.send(Command::Stop).await;
        tracing::info!(sandbox_id, "stopped observing sandbox");
        Ok(())
    }

    pub async fn observed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live_observers().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The registry without observers whose sandbox has gone away.
    async fn live_observers(&self) -> MutexGuard<'_, HashMap<String, ObserverHandle>> {
        let mut observers = self.observers.lock().await;
        observers.retain(|sandbox_id, handle| {
            let live = !handle.task.is_finished();
            if !live {
                tracing::debug!(sandbox_id = %sandbox_id, "dropping finished observer");
            }
            live
        });
        observers
    }

    async fn observer(&self, sandbox_id: &str) -> Result<mpsc::Sender<Command>, OrchestratorError> {
        if let Some(handle) = self.live_observers().await.get(sandbox_id) {
            return Ok(handle.commands.clone());
        }

        // The first probe runs before registering so an unknown sandbox is
        // refused instead of observed.
        let first = match self.prober.probe(sandbox_id).await {
            Err(err @ OrchestratorError::SandboxNotFound { .. }) => return Err(err),
            first => first,
        };

        let mut observers = self.live_observers().await;
        if let Some(handle) = observers.get(sandbox_id) {
            return Ok(handle.commands.clone());
        }

        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let observer = Observer {
            sandbox_id: sandbox_id.to_string(),
            prober: self.prober.clone(),
            lifecycle: self.lifecycle.clone(),
            policy: self.policy,
            commands: receiver,
        };
        let task = tokio::spawn(observer.run(first));
        tracing::info!(sandbox_id, "observing sandbox");
        observers.insert(
            sandbox_id.to_string(),
            ObserverHandle {
                commands: commands.clone(),
                task,
            },
        );
        Ok(commands)
    }
}

async fn request(
    commands: &mpsc::Sender<Command>,
    sandbox_id: &str,
    build: fn(oneshot::Sender<HealthStateView>) -> Command,
) -> Result<HealthStateView, OrchestratorError> {
    let gone = || OrchestratorError::ObservationNotFound {
        sandbox_id: sandbox_id.to_string(),
    };
    let (reply, response) = oneshot::channel();
    commands.send(build(reply)).await.map_err(|_| gone())?;
    response.await.map_err(|_| gone())
}

struct Observer {
    sandbox_id: String,
    prober: HealthProber,
    lifecycle: ServiceLifecycleManager,
    policy: HealthPolicy,
    commands: mpsc::Receiver<Command>,
}

impl Observer {
    async fn run(mut self, first: Result<SandboxHealthReport, OrchestratorError>) {
        let mut state = HealthState::new();
        let (results_tx, mut results) = mpsc::channel::<TaskResult>(4);
        let mut probe: Option<JoinHandle<()>> = None;
        let mut restarting = false;
        // Probe results from before the latest restart request are stale.
        let mut epoch = 0u64;

        let now = Instant::now();
        self.transition(&mut state, HealthEvent::CheckStarted, now);
        self.transition(&mut state, probe_event(first), now);
        let mut next_wake = Some(now + state.poll_interval(&self.policy));

        loop {
            let wake = next_wake;
            let timer = async move {
                match wake {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Stop) => break,
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(state.view(&self.sandbox_id, Instant::now()));
                    }
                    Some(Command::Restart(reply)) => {
                        let now = Instant::now();
                        if !restarting {
                            epoch += 1;
                            if let Some(task) = probe.take() {
                                task.abort();
                            }
                            self.transition(&mut state, HealthEvent::RestartRequested, now);
                            restarting = true;
                            let lifecycle = self.lifecycle.clone();
                            let sandbox_id = self.sandbox_id.clone();
                            let tx = results_tx.clone();
                            tokio::spawn(async move {
                                let result = lifecycle.restart_services_complete(&sandbox_id).await;
                                let _ = tx.send(TaskResult::Restart(result)).await;
                            });
                            next_wake = Some(now + self.policy.restart_poll);
                        }
                        let _ = reply.send(state.view(&self.sandbox_id, now));
                    }
                },
                Some(result) = results.recv() => {
                    let now = Instant::now();
                    match result {
                        TaskResult::Probe { epoch: probe_epoch, .. } if probe_epoch != epoch => {}
                        TaskResult::Probe { result: Err(OrchestratorError::SandboxNotFound { .. }), .. }
                        | TaskResult::Restart(Err(OrchestratorError::SandboxNotFound { .. })) => {
                            tracing::info!(sandbox_id = %self.sandbox_id, "sandbox no longer exists");
                            break;
                        }
                        TaskResult::Probe { result, .. } => {
                            probe = None;
                            self.transition(&mut state, probe_event(result), now);
                            next_wake = Some(now + state.poll_interval(&self.policy));
                        }
                        TaskResult::Restart(result) => {
                            restarting = false;
                            let event = match result {
                                Ok(result) => HealthEvent::RestartCompleted(result.summary),
                                Err(err) => HealthEvent::RestartFailed {
                                    transient: err.is_transient(),
                                    message: err.to_string(),
                                },
                            };
                            self.transition(&mut state, event, now);
                            // Confirm the outcome right away.
                            next_wake = Some(now);
                        }
                    }
                }
                _ = timer => {
                    let now = Instant::now();
                    self.transition(&mut state, HealthEvent::Tick, now);
                    if restarting {
                        next_wake = Some(now + self.policy.restart_poll);
                        continue;
                    }
                    self.transition(&mut state, HealthEvent::CheckStarted, now);
                    let prober = self.prober.clone();
                    let sandbox_id = self.sandbox_id.clone();
                    let tx = results_tx.clone();
                    let probe_epoch = epoch;
                    probe = Some(tokio::spawn(async move {
                        let result = prober.probe(&sandbox_id).await;
                        let _ = tx.send(TaskResult::Probe { epoch: probe_epoch, result }).await;
                    }));
                    next_wake = None;
                }
            }
        }

        if let Some(task) = probe.take() {
            task.abort();
        }
        tracing::debug!(sandbox_id = %self.sandbox_id, "observer stopped");
    }

    fn transition(&self, state: &mut HealthState, event: HealthEvent, now: Instant) {
        let before = state.phase();
        let after = state.apply(event, now, &self.policy);
        if before != after {
            if after == HealthPhase::Degraded || after == HealthPhase::Stopped {
                tracing::warn!(
                    sandbox_id = %self.sandbox_id,
                    from = ?before,
                    to = ?after,
                    error = state.last_error().unwrap_or_default(),
                    "sandbox health changed"
                );
            } else {
                tracing::info!(
                    sandbox_id = %self.sandbox_id,
                    from = ?before,
                    to = ?after,
                    "sandbox health changed"
                );
            }
        }
    }
}

fn probe_event(result: Result<SandboxHealthReport, OrchestratorError>) -> HealthEvent {
    match result {
        Ok(report) => HealthEvent::Report(report),
        Err(err) => HealthEvent::ProbeFailed {
            message: err.to_string(),
        },
    }
}
