//! The three daemons run per repository and the shell snippets used to
//! launch, find and stop them on a sandbox.

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
    JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Editor,
    Terminal,
    AgentTerminal,
}

impl ServiceKind {
    /// Launch order within a repository.
    pub const ALL: [ServiceKind; 3] = [Self::Editor, Self::Terminal, Self::AgentTerminal];

    pub fn name(self) -> &'static str {
        match self {
            Self::Editor => "editor",
            Self::Terminal => "terminal",
            Self::AgentTerminal => "agent-terminal",
        }
    }

    fn program(self, port: u16, dir: &str) -> String {
        let dir = shell_quote(dir);
        match self {
            Self::Editor => format!(
                "code-server --bind-addr 0.0.0.0:{port} --auth none --disable-telemetry {dir}"
            ),
            Self::Terminal => format!("ttyd -p {port} -W -w {dir} bash"),
            Self::AgentTerminal => format!("ttyd -p {port} -W -w {dir} bash -lc claude"),
        }
    }

    pub fn log_path(self, port: u16) -> String {
        format!("/tmp/{}-{port}.log", self.name())
    }

    /// Detached launch. Prints the background pid on stdout.
    pub fn launch_command(self, port: u16, dir: &str) -> String {
        format!(
            "nohup {} > {} 2>&1 & echo $!",
            self.program(port, dir),
            self.log_path(port)
        )
    }

    /// Whether a `ps` args line is this service's daemon on `port`.
    pub fn matches_process(self, args: &str, port: u16) -> bool {
        match self {
            Self::Editor => args
                .find("code-server")
                .map(|idx| contains_port(&args[idx..], port))
                .unwrap_or(false),
            Self::Terminal | Self::AgentTerminal => {
                let needle = format!("ttyd -p {port}");
                args.match_indices(&needle).any(|(idx, _)| {
                    !args[idx + needle.len()..]
                        .starts_with(|c: char| c.is_ascii_digit())
                })
            }
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ServiceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "editor" | "code-server" => Ok(Self::Editor),
            "terminal" => Ok(Self::Terminal),
            "agent-terminal" | "agent" | "claude" => Ok(Self::AgentTerminal),
            _ => Err(format!("unknown service: {value}")),
        }
    }
}

/// `port` appears in `haystack` with no digit on either side.
fn contains_port(haystack: &str, port: u16) -> bool {
    let needle = port.to_string();
    haystack.match_indices(&needle).any(|(idx, _)| {
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + needle.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_digit()) && !after.is_some_and(|c| c.is_ascii_digit())
    })
}

pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Working directory of a repository. Relative roots resolve against the
/// session user's home, which is where remote commands start.
pub fn repository_dir(workspace_root: &str, repository_name: &str) -> String {
    format!("{}/{}", workspace_root.trim_end_matches('/'), repository_name)
}

pub fn directory_check_command(dir: &str) -> String {
    format!("test -d {} && echo exists || echo missing", shell_quote(dir))
}

pub fn directory_exists(output: &str) -> bool {
    output.lines().any(|line| line.trim() == "exists")
}

/// Kills whatever listens on each port and reports `killed:<port>` or
/// `free:<port>` per port, or `unknown:<port>` when the session has neither
/// `lsof` nor `fuser` to look the port up with.
pub fn kill_ports_command(ports: &[u16]) -> String {
    let list = ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "for p in {list}; do \
         if ! command -v lsof >/dev/null 2>&1 && ! command -v fuser >/dev/null 2>&1; then \
         echo \"unknown:$p\"; continue; fi; \
         pids=$(lsof -ti tcp:$p 2>/dev/null || fuser $p/tcp 2>/dev/null); \
         if [ -n \"$pids\" ]; then kill -9 $pids 2>/dev/null; echo \"killed:$p\"; \
         else echo \"free:$p\"; fi; \
         done"
    )
}

pub const PROCESS_TABLE_COMMAND: &str = "ps -eo pid,args";

pub const LISTENING_PORTS_COMMAND: &str = "ss -ltnH 2>/dev/null || netstat -ltn 2>/dev/null";

pub fn http_probe_command(port: u16) -> String {
    format!("curl -s -o /dev/null -w '%{{http_code}}' --max-time 3 http://localhost:{port}/")
}

/// Status code printed by [`http_probe_command`]. curl prints `000` when it
/// could not connect.
pub fn parse_http_status(output: &str) -> Option<u16> {
    output
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|status| *status != 0)
}

pub fn is_success_status(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Last numeric line of a launch command's output.
pub fn parse_launch_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .rev()
        .find_map(|line| line.trim().parse::<u32>().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub args: String,
}

/// Parses `ps -eo pid,args`, skipping the header and anything malformed.
pub fn parse_process_table(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, args) = line.split_once(char::is_whitespace)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                args: args.trim().to_string(),
            })
        })
        .collect()
}

/// Local ports in LISTEN state, from either `ss` or `netstat` output.
pub fn parse_listening_ports(output: &str) -> HashSet<u16> {
    output
        .lines()
        .flat_map(str::split_whitespace)
        .filter_map(|token| token.rsplit_once(':'))
        .filter_map(|(_, port)| port.parse::<u16>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_command_is_detached_and_logged() {
        let command = ServiceKind::AgentTerminal.launch_command(4002, "workspace/api");
        assert_eq!(
            command,
            "nohup ttyd -p 4002 -W -w 'workspace/api' bash -lc claude \
             > /tmp/agent-terminal-4002.log 2>&1 & echo $!"
        );
        let editor = ServiceKind::Editor.launch_command(8080, "workspace/web");
        assert!(editor.starts_with("nohup code-server --bind-addr 0.0.0.0:8080 "));
        assert!(editor.contains("> /tmp/editor-8080.log 2>&1 &"));
    }

    #[test]
    fn process_matching_respects_port_boundaries() {
        let editor = "/usr/lib/code-server/lib/node /usr/lib/code-server --bind-addr 0.0.0.0:8081 --auth none";
        assert!(ServiceKind::Editor.matches_process(editor, 8081));
        assert!(!ServiceKind::Editor.matches_process(editor, 808));
        assert!(!ServiceKind::Editor.matches_process(editor, 8080));

        let ttyd = "ttyd -p 4000 -W -w workspace/app bash -lc claude";
        assert!(ServiceKind::AgentTerminal.matches_process(ttyd, 4000));
        assert!(!ServiceKind::Terminal.matches_process("ttyd -p 40001 bash", 4000));
        assert!(!ServiceKind::Editor.matches_process(ttyd, 4000));
    }

    #[test]
    fn kill_command_reports_unknown_without_lookup_tools() {
        let command = kill_ports_command(&[8080, 10000]);
        assert!(command.starts_with("for p in 8080 10000; do "));
        let guard = command.find("echo \"unknown:$p\"; continue").expect("unknown marker");
        let lookup = command.find("lsof -ti").expect("lsof lookup");
        assert!(guard < lookup, "tool check must run before the lookup");
    }

    #[test]
    fn quotes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn parses_ss_and_netstat_listings() {
        let ss = "LISTEN 0 511 0.0.0.0:8080 0.0.0.0:*\nLISTEN 0 128 [::]:10000 [::]:*\n";
        let ports = parse_listening_ports(ss);
        assert!(ports.contains(&8080));
        assert!(ports.contains(&10000));

        let netstat = "Active Internet connections (only servers)\n\
                       Proto Recv-Q Send-Q Local Address Foreign Address State\n\
                       tcp 0 0 0.0.0.0:4000 0.0.0.0:* LISTEN\n";
        assert_eq!(parse_listening_ports(netstat), HashSet::from([4000]));
    }

    #[test]
    fn parses_process_table() {
        let output = "    PID COMMAND\n      1 /sbin/init\n    42 ttyd -p 10000 -W bash\n";
        let entries = parse_process_table(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].pid, 42);
        assert_eq!(entries[1].args, "ttyd -p 10000 -W bash");
    }

    #[test]
    fn http_status_parsing() {
        assert_eq!(parse_http_status("200"), Some(200));
        assert_eq!(parse_http_status("000"), None);
        assert_eq!(parse_http_status(""), None);
        assert!(is_success_status(302));
        assert!(!is_success_status(404));
    }

    #[test]
    fn parses_service_aliases() {
        assert_eq!("Editor".parse::<ServiceKind>(), Ok(ServiceKind::Editor));
        assert_eq!("agent".parse::<ServiceKind>(), Ok(ServiceKind::AgentTerminal));
        assert!("db".parse::<ServiceKind>().is_err());
    }
}
