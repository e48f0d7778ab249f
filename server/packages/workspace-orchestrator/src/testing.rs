//! In-memory sandbox that understands the shell snippets in
//! [`crate::services`]. Used by the crate's tests and by `test-utils`
//! consumers.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use workspace_orchestrator_error::OrchestratorError;

use crate::metadata::{SourceType, Workspace};
use crate::provider::{CommandOutput, PreviewLink, SandboxInfo, SandboxProvider, SessionState};
use crate::services::{ServiceKind, LISTENING_PORTS_COMMAND, PROCESS_TABLE_COMMAND};

#[derive(Debug, Clone)]
struct FakeProcess {
    pid: u32,
    args: String,
    listening: bool,
}

#[derive(Debug)]
struct FakeState {
    state: SessionState,
    missing_dirs: HashSet<String>,
    broken_ports: HashSet<u16>,
    processes: BTreeMap<u16, FakeProcess>,
    next_pid: u32,
    unavailable: bool,
    deleted: bool,
    start_outcome: SessionState,
    network_tools: bool,
    start_calls: usize,
    commands: Vec<String>,
}

/// A single fake sandbox. Other sandbox ids are reported as not found.
#[derive(Debug)]
pub struct FakeSandbox {
    sandbox_id: String,
    inner: Mutex<FakeState>,
}

impl FakeSandbox {
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            inner: Mutex::new(FakeState {
                state: SessionState::Started,
                missing_dirs: HashSet::new(),
                broken_ports: HashSet::new(),
                processes: BTreeMap::new(),
                next_pid: 100,
                unavailable: false,
                deleted: false,
                start_outcome: SessionState::Started,
                network_tools: true,
                start_calls: 0,
                commands: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    /// The directory of repository `name` does not exist.
    pub fn remove_repository_dir(&self, name: &str) {
        self.lock().missing_dirs.insert(name.to_string());
    }

    /// Daemons launched on `port` start but never listen.
    pub fn break_port(&self, port: u16) {
        self.lock().broken_ports.insert(port);
    }

    /// Every command fails as if the provider could not be reached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// The sandbox is deleted; every call reports it as not found.
    pub fn delete(&self) {
        self.lock().deleted = true;
    }

    /// The state a `start` call leaves the session in. `Starting` models a
    /// session that never finishes booting.
    pub fn set_start_outcome(&self, state: SessionState) {
        self.lock().start_outcome = state;
    }

    /// The image ships without `lsof`, `fuser`, `ss` and `netstat`.
    pub fn remove_network_tools(&self) {
        self.lock().network_tools = false;
    }

    /// Kills a daemon out from under the orchestrator.
    pub fn crash(&self, port: u16) {
        self.lock().processes.remove(&port);
    }

    pub fn running_ports(&self) -> Vec<u16> {
        self.lock()
            .processes
            .iter()
            .filter(|(_, process)| process.listening)
            .map(|(port, _)| *port)
            .collect()
    }

    pub fn start_calls(&self) -> usize {
        self.lock().start_calls
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    fn check_id(&self, sandbox_id: &str) -> Result<(), OrchestratorError> {
        if sandbox_id == self.sandbox_id && !self.lock().deleted {
            Ok(())
        } else {
            Err(OrchestratorError::SandboxNotFound {
                sandbox_id: sandbox_id.to_string(),
            })
        }
    }
}

impl FakeState {
    fn run(&mut self, command: &str) -> CommandOutput {
        self.commands.push(command.to_string());
        let result = if let Some(rest) = command.strip_prefix("for p in ") {
            self.kill(rest)
        } else if command.starts_with("test -d ") {
            let dir = quoted(command).unwrap_or_default();
            let name = dir.rsplit('/').next().unwrap_or_default();
            if self.missing_dirs.contains(name) {
                "missing\n".to_string()
            } else {
                "exists\n".to_string()
            }
        } else if let Some(rest) = command.strip_prefix("nohup ") {
            match self.launch(rest) {
                Some(pid) => format!("{pid}\n"),
                None => {
                    return CommandOutput {
                        result: "nohup: unrecognized command\n".to_string(),
                        exit_code: 1,
                    }
                }
            }
        } else if command.starts_with("curl ") {
            let port = command
                .split("localhost:")
                .nth(1)
                .and_then(|rest| rest.trim_end_matches('/').parse::<u16>().ok());
            match port.and_then(|port| self.processes.get(&port)) {
                Some(process) if process.listening => "200".to_string(),
                _ => "000".to_string(),
            }
        } else if command == PROCESS_TABLE_COMMAND {
            let mut out = "    PID COMMAND\n      1 /sbin/init\n".to_string();
            for process in self.processes.values() {
                out.push_str(&format!("{:>7} {}\n", process.pid, process.args));
            }
            out
        } else if command == LISTENING_PORTS_COMMAND {
            if !self.network_tools {
                return CommandOutput {
                    result: String::new(),
                    exit_code: 127,
                };
            }
            self.processes
                .iter()
                .filter(|(_, process)| process.listening)
                .map(|(port, _)| format!("LISTEN 0 511 0.0.0.0:{port} 0.0.0.0:*\n"))
                .collect()
        } else {
            return CommandOutput {
                result: format!("sh: unsupported command: {command}\n"),
                exit_code: 127,
            };
        };
        CommandOutput {
            result,
            exit_code: 0,
        }
    }

    fn kill(&mut self, rest: &str) -> String {
        let list = rest.split(';').next().unwrap_or_default();
        list.split_whitespace()
            .filter_map(|port| port.parse::<u16>().ok())
            .map(|port| {
                if !self.network_tools {
                    format!("unknown:{port}\n")
                } else if self.processes.remove(&port).is_some() {
                    format!("killed:{port}\n")
                } else {
                    format!("free:{port}\n")
                }
            })
            .collect()
    }

    fn launch(&mut self, rest: &str) -> Option<u32> {
        let (program, redirect) = rest.split_once(" > ")?;
        let log = redirect.split_whitespace().next()?;
        let stem = log.strip_prefix("/tmp/")?.strip_suffix(".log")?;
        let (kind, port) = stem.rsplit_once('-')?;
        let _service: ServiceKind = kind.parse().ok()?;
        let port: u16 = port.parse().ok()?;

        let pid = self.next_pid;
        self.next_pid += 1;
        let listening = !self.broken_ports.contains(&port);
        self.processes.insert(
            port,
            FakeProcess {
                pid,
                args: program.to_string(),
                listening,
            },
        );
        Some(pid)
    }
}

fn quoted(command: &str) -> Option<&str> {
    let start = command.find('\'')? + 1;
    let len = command[start..].find('\'')?;
    Some(&command[start..start + len])
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo, OrchestratorError> {
        self.check_id(sandbox_id)?;
        let state = self.lock();
        if state.unavailable {
            return Err(OrchestratorError::RemoteUnavailable {
                message: "fake sandbox unavailable".to_string(),
            });
        }
        Ok(SandboxInfo {
            id: sandbox_id.to_string(),
            state: state.state,
        })
    }

    async fn start(&self, sandbox_id: &str) -> Result<(), OrchestratorError> {
        self.check_id(sandbox_id)?;
        let mut state = self.lock();
        state.start_calls += 1;
        state.state = state.start_outcome;
        Ok(())
    }

    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
        _cwd: Option<&str>,
        _timeout: Duration,
    ) -> Result<CommandOutput, OrchestratorError> {
        self.check_id(sandbox_id)?;
        let mut state = self.lock();
        if state.unavailable {
            return Err(OrchestratorError::RemoteUnavailable {
                message: "fake sandbox unavailable".to_string(),
            });
        }
        if state.state != SessionState::Started {
            return Err(OrchestratorError::Provider {
                message: format!("sandbox {sandbox_id} is not started"),
                status: Some(409),
            });
        }
        Ok(state.run(command))
    }

    async fn preview_link(
        &self,
        sandbox_id: &str,
        port: u16,
    ) -> Result<PreviewLink, OrchestratorError> {
        self.check_id(sandbox_id)?;
        Ok(PreviewLink {
            url: format!("https://{port}-{sandbox_id}.preview.test"),
            token: Some(format!("tok-{port}")),
        })
    }
}

/// A workspace with one GitHub repository per name, on consecutive slots.
pub fn workspace_with(sandbox_id: &str, names: &[&str]) -> Workspace {
    let mut workspace = Workspace::new(sandbox_id);
    for (idx, name) in names.iter().enumerate() {
        let id = format!("repo-{}", idx + 1);
        if let Err(err) = workspace.add_repository(id, *name, SourceType::Github) {
            panic!("invalid test workspace: {err}");
        }
    }
    workspace
}
