use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use terminal_wire::{TerminalClient, TerminalClientConfig, TerminalSize};
use thiserror::Error;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use workspace_orchestrator_error::OrchestratorError;

// Include the generated version constant
mod build_version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}

use crate::config::OrchestratorConfig;
use crate::health::HealthProber;
use crate::health_state::{HealthState, WorkspaceStatus};
use crate::lifecycle::ServiceLifecycleManager;
use crate::metadata::{JsonFileStore, MetadataStore, SourceType, STORE_ENV};
use crate::ports::{ports_for_slot, RepositorySlot};
use crate::provider::{LocalProvider, RemoteProvider, RemoteProviderConfig, SandboxProvider};
use crate::router::{build_router_with_state, AppState, AuthConfig};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2470;
const PROVIDER_ENV: &str = "WORKSPACE_PROVIDER";

#[derive(Parser, Debug)]
#[command(name = "workspace-orchestrator", bin_name = "workspace-orchestrator")]
#[command(
    about = "Keeps editor and terminal daemons running in workspace sandboxes",
    version = build_version::VERSION
)]
#[command(arg_required_else_help = true)]
pub struct OrchestratorCli {
    #[command(subcommand)]
    command: Command,

    /// Bearer token required by the HTTP server.
    #[arg(long, short = 't', global = true)]
    token: Option<String>,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP control server.
    Server(ServerArgs),
    /// Print the ports assigned to a repository slot.
    Ports(PortsArgs),
    /// Restart every service in a sandbox and print the result.
    FixServices(SandboxArgs),
    /// Print the summarized health of a sandbox.
    Status(SandboxArgs),
    /// Print the full health report of a sandbox.
    DebugServices(SandboxArgs),
    /// Add a repository to a sandbox's metadata.
    Register(RegisterArgs),
    /// Send input to a running terminal daemon.
    Terminal(TerminalArgs),
}

#[derive(Args, Debug)]
pub struct BackendArgs {
    #[arg(long, global = true, value_enum, env = PROVIDER_ENV, default_value = "remote")]
    provider: ProviderKind,

    /// Metadata store file.
    #[arg(long, global = true, env = STORE_ENV)]
    store: Option<PathBuf>,

    /// Repository directories, relative to the sandbox user's home.
    #[arg(long, global = true)]
    workspace_root: Option<String>,

    #[arg(long, global = true)]
    settle_ms: Option<u64>,

    #[arg(long, global = true)]
    steady_poll_secs: Option<u64>,

    #[arg(long, global = true)]
    restart_poll_secs: Option<u64>,

    #[arg(long, global = true)]
    restart_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Hosted sandbox API.
    Remote,
    /// Run commands on this machine.
    Local,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct PortsArgs {
    slot: u32,
}

#[derive(Args, Debug)]
pub struct SandboxArgs {
    sandbox_id: String,
}

#[derive(Args, Debug)]
pub struct RegisterArgs {
    sandbox_id: String,
    /// Directory name under the workspace root.
    name: String,
    /// Repository id. Defaults to the name.
    #[arg(long)]
    id: Option<String>,
    #[arg(long, value_enum, default_value = "github")]
    source_type: SourceTypeArg,
    #[arg(long)]
    user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceTypeArg {
    Github,
    Local,
    Template,
}

impl From<SourceTypeArg> for SourceType {
    fn from(value: SourceTypeArg) -> Self {
        match value {
            SourceTypeArg::Github => SourceType::Github,
            SourceTypeArg::Local => SourceType::Local,
            SourceTypeArg::Template => SourceType::Template,
        }
    }
}

#[derive(Args, Debug)]
#[command(group(
    clap::ArgGroup::new("action")
        .required(true)
        .args(["text", "execute", "key", "paste", "resize"])
))]
pub struct TerminalArgs {
    /// WebSocket URL of the terminal daemon, e.g. ws://localhost:10000/ws.
    url: String,

    /// Auth token sent in the terminal handshake.
    #[arg(long)]
    auth_token: Option<String>,

    #[arg(long, default_value_t = 80)]
    columns: u16,

    #[arg(long, default_value_t = 24)]
    rows: u16,

    /// Type text without pressing Enter.
    #[arg(long)]
    text: Option<String>,

    /// Type a command and press Enter.
    #[arg(long)]
    execute: Option<String>,

    /// Named keys such as Enter, Ctrl+C or ArrowUp. Repeatable.
    #[arg(long)]
    key: Vec<String>,

    /// Paste text as a single input frame.
    #[arg(long)]
    paste: Option<String>,

    /// New size as COLUMNS,ROWS.
    #[arg(long, value_parser = parse_size)]
    resize: Option<TerminalSize>,

    /// Print terminal output for this long before closing.
    #[arg(long, default_value_t = 0)]
    wait_ms: u64,
}

fn parse_size(value: &str) -> Result<TerminalSize, String> {
    let (columns, rows) = value
        .split_once(',')
        .or_else(|| value.split_once('x'))
        .ok_or_else(|| format!("expected COLUMNS,ROWS, got `{value}`"))?;
    let columns = columns
        .trim()
        .parse::<u16>()
        .map_err(|err| format!("invalid columns: {err}"))?;
    let rows = rows
        .trim()
        .parse::<u16>()
        .map_err(|err| format!("invalid rows: {err}"))?;
    Ok(TerminalSize { columns, rows })
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("terminal connect failed: {0}")]
    TerminalConnect(#[from] terminal_wire::ConnectError),
    #[error("terminal send failed: {0}")]
    TerminalSend(#[from] terminal_wire::SendError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("{failed} of {total} services failed to restart")]
    ServicesFailed { failed: usize, total: usize },
}

pub struct CliConfig {
    pub token: Option<String>,
    pub backend: BackendArgs,
}

pub fn run_orchestrator() -> Result<(), CliError> {
    let cli = OrchestratorCli::parse();
    let OrchestratorCli {
        command,
        token,
        backend,
    } = cli;
    let config = CliConfig { token, backend };
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&command, &config)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(cli, args),
        Command::Ports(args) => print_ports(args),
        Command::FixServices(args) => run_fix_services(cli, args),
        Command::Status(args) => run_status(cli, args),
        Command::DebugServices(args) => run_debug_services(cli, args),
        Command::Register(args) => run_register(cli, args),
        Command::Terminal(args) => run_terminal(args),
    }
}

impl BackendArgs {
    fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        if let Some(root) = &self.workspace_root {
            config.workspace_root = root.clone();
        }
        if let Some(ms) = self.settle_ms {
            config.settle_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.steady_poll_secs {
            config.health.steady_poll = Duration::from_secs(secs);
        }
        if let Some(secs) = self.restart_poll_secs {
            config.health.restart_poll = Duration::from_secs(secs);
        }
        if let Some(secs) = self.restart_timeout_secs {
            config.health.restart_timeout = Duration::from_secs(secs);
        }
        config
    }

    fn provider(&self) -> Result<Arc<dyn SandboxProvider>, CliError> {
        let provider: Arc<dyn SandboxProvider> = match self.provider {
            ProviderKind::Remote => {
                Arc::new(RemoteProvider::new(RemoteProviderConfig::from_env()?)?)
            }
            ProviderKind::Local => Arc::new(LocalProvider::new()),
        };
        Ok(provider)
    }

    fn store(&self) -> Arc<dyn MetadataStore> {
        let path = self
            .store
            .clone()
            .unwrap_or_else(JsonFileStore::default_path);
        Arc::new(JsonFileStore::new(path))
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_server(cli: &CliConfig, server: &ServerArgs) -> Result<(), CliError> {
    let auth = if let Some(token) = cli.token.clone() {
        AuthConfig::with_token(token)
    } else {
        AuthConfig::disabled()
    };

    let provider = cli.backend.provider()?;
    let store = cli.backend.store();
    let config = cli.backend.orchestrator_config();
    let state = Arc::new(AppState::new(auth, provider, store, config));
    let (mut router, _state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    runtime()?.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, provider = ?cli.backend.provider, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn print_ports(args: &PortsArgs) -> Result<(), CliError> {
    let slot = RepositorySlot::new(args.slot)?;
    let ports = ports_for_slot(slot);
    let body = json!({
        "slot": slot.get(),
        "editor": ports.editor,
        "terminal": ports.terminal,
        "agent": ports.agent,
    });
    print_json(&body)
}

fn run_fix_services(cli: &CliConfig, args: &SandboxArgs) -> Result<(), CliError> {
    let lifecycle = ServiceLifecycleManager::new(
        cli.backend.provider()?,
        cli.backend.store(),
        Arc::new(cli.backend.orchestrator_config()),
    );
    let result = runtime()?.block_on(lifecycle.restart_services_complete(&args.sandbox_id))?;
    print_json(&result)?;
    if result.summary.failed > 0 {
        return Err(CliError::ServicesFailed {
            failed: result.summary.failed,
            total: result.summary.total_services,
        });
    }
    Ok(())
}

fn prober(cli: &CliConfig) -> Result<HealthProber, CliError> {
    Ok(HealthProber::new(
        cli.backend.provider()?,
        cli.backend.store(),
        Arc::new(cli.backend.orchestrator_config()),
    ))
}

fn run_status(cli: &CliConfig, args: &SandboxArgs) -> Result<(), CliError> {
    let prober = prober(cli)?;
    let report = runtime()?.block_on(prober.probe(&args.sandbox_id))?;
    let view = HealthState::from_report(report).view(&args.sandbox_id, Instant::now());
    print_json(&WorkspaceStatus::from(&view))
}

fn run_debug_services(cli: &CliConfig, args: &SandboxArgs) -> Result<(), CliError> {
    let prober = prober(cli)?;
    let report = runtime()?.block_on(prober.probe(&args.sandbox_id))?;
    print_json(&report)
}

fn run_register(cli: &CliConfig, args: &RegisterArgs) -> Result<(), CliError> {
    let store = cli.backend.store();
    runtime()?.block_on(async {
        let mut workspace = store.load_workspace(&args.sandbox_id).await?;
        if let Some(user_id) = &args.user_id {
            workspace.user_id = Some(user_id.clone());
        }
        let id = args.id.clone().unwrap_or_else(|| args.name.clone());
        let record = workspace
            .add_repository(id, args.name.clone(), args.source_type.into())?
            .clone();
        store.save_workspace(&workspace).await?;
        tracing::info!(
            sandbox_id = %args.sandbox_id,
            repository = %record.name,
            slot = record.slot.get(),
            "repository registered"
        );
        print_json(&record)
    })
}

fn run_terminal(args: &TerminalArgs) -> Result<(), CliError> {
    runtime()?.block_on(async {
        let config = TerminalClientConfig {
            size: TerminalSize {
                columns: args.columns,
                rows: args.rows,
            },
            auth_token: args.auth_token.clone(),
            ..TerminalClientConfig::default()
        };
        let (client, mut output) = TerminalClient::connect(&args.url, config).await?;

        if let Some(text) = &args.text {
            client.send_text(text)?;
        }
        if let Some(command) = &args.execute {
            client.execute(command)?;
        }
        for key in &args.key {
            client.send_key(key)?;
        }
        if let Some(text) = &args.paste {
            client.paste(text)?;
        }
        if let Some(size) = args.resize {
            client.resize(size.columns, size.rows)?;
        }

        if args.wait_ms > 0 {
            let deadline = Instant::now() + Duration::from_millis(args.wait_ms);
            let mut out = std::io::stdout();
            while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, output.recv()).await {
                out.write_all(&chunk)?;
            }
            out.flush()?;
        }
        client.close().await;
        Ok::<(), CliError>(())
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let pretty = serde_json::to_string_pretty(value)?;
    write_stdout_line(&pretty)
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
