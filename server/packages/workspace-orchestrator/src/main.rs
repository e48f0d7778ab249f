fn main() {
    if let Err(err) = workspace_orchestrator::cli::run_orchestrator() {
        tracing::error!(error = %err, "workspace-orchestrator failed");
        std::process::exit(1);
    }
}
