use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};
use workspace_orchestrator_error::{ErrorClass, ErrorType, OrchestratorError, ProblemDetails};

use crate::config::OrchestratorConfig;
use crate::health::{HealthProber, SandboxHealthReport, ServiceState, ServiceStatus};
use crate::health_state::{HealthPhase, HealthState, HealthStateView, WorkspaceStatus};
use crate::lifecycle::{
    CleanupOutcome, LaunchHandle, LaunchStatus, PortCleanup, RepositoryServiceResult,
    RepositoryStatus, RestartSummary, ServiceLaunchResult, ServiceLifecycleManager,
    ServiceRestartResult,
};
use crate::metadata::MetadataStore;
use crate::monitor::HealthMonitor;
use crate::provider::{SandboxProvider, SandboxState};
use crate::services::ServiceKind;

mod types;

pub use types::*;

pub const LOG_HTTP_ENV: &str = "WORKSPACE_ORCHESTRATOR_LOG_HTTP";

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    lifecycle: ServiceLifecycleManager,
    prober: HealthProber,
    monitor: HealthMonitor,
}

impl AppState {
    pub fn new(
        auth: AuthConfig,
        provider: Arc<dyn SandboxProvider>,
        store: Arc<dyn MetadataStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let policy = config.health;
        let config = Arc::new(config);
        let lifecycle = ServiceLifecycleManager::new(provider.clone(), store.clone(), config.clone());
        let prober = HealthProber::new(provider, store, config);
        let monitor = HealthMonitor::new(prober.clone(), lifecycle.clone(), policy);
        Self {
            auth,
            lifecycle,
            prober,
            monitor,
        }
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut router = Router::new()
        .route("/v1/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/fix-services/:sandbox_id", post(fix_services))
        .route("/workspace-status/:sandbox_id", get(workspace_status))
        .route("/debug-services/:sandbox_id", get(debug_services))
        .route("/observe", get(list_observed))
        .route(
            "/observe/:sandbox_id",
            post(observe_sandbox)
                .get(get_observation)
                .delete(stop_observing),
        )
        .route("/observe/:sandbox_id/restart", post(restart_observed))
        .fallback(not_found)
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        router = router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let http_logging = match std::env::var(LOG_HTTP_ENV) {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::debug!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        fix_services,
        workspace_status,
        debug_services,
        list_observed,
        observe_sandbox,
        get_observation,
        stop_observing,
        restart_observed
    ),
    components(
        schemas(
            HealthResponse,
            ObservedListResponse,
            ServiceRestartResult,
            RestartSummary,
            RepositoryServiceResult,
            RepositoryStatus,
            PortCleanup,
            CleanupOutcome,
            ServiceLaunchResult,
            LaunchStatus,
            LaunchHandle,
            ServiceKind,
            SandboxHealthReport,
            SandboxState,
            ServiceStatus,
            ServiceState,
            WorkspaceStatus,
            HealthStateView,
            HealthPhase,
            ProblemDetails,
            ErrorType,
            ErrorClass
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "services", description = "Service restart and health"),
        (name = "observe", description = "Background health observation")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2470")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Orchestrator(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(problem),
        )
            .into_response()
    }
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if req.uri().path() == "/v1/health" {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(OrchestratorError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.trim().to_string()),
        _ => None,
    }
}

const SERVER_INFO: &str = "\
This is a workspace orchestrator server.

Endpoints: /fix-services/{id}, /workspace-status/{id}, /debug-services/{id}, /observe/{id}.
The OpenAPI document is served at /openapi.json.";

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Kills and relaunches every service of every repository in the sandbox.
/// Per-service failures are reported in the body, not as an error status.
#[utoipa::path(
    post,
    path = "/fix-services/{sandbox_id}",
    responses(
        (status = 200, body = ServiceRestartResult),
        (status = 404, body = ProblemDetails),
        (status = 503, body = ProblemDetails),
        (status = 504, body = ProblemDetails)
    ),
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    tag = "services"
)]
async fn fix_services(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<ServiceRestartResult>, ApiError> {
    let result = state.lifecycle.restart_services_complete(&sandbox_id).await?;
    Ok(Json(result))
}

/// Observed sandboxes answer from their observer; others are probed once.
#[utoipa::path(
    get,
    path = "/workspace-status/{sandbox_id}",
    responses(
        (status = 200, body = WorkspaceStatus),
        (status = 404, body = ProblemDetails)
    ),
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    tag = "services"
)]
async fn workspace_status(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<WorkspaceStatus>, ApiError> {
    let view = match state.monitor.snapshot(&sandbox_id).await {
        Ok(view) => view,
        Err(OrchestratorError::ObservationNotFound { .. }) => {
            let report = state.prober.probe(&sandbox_id).await?;
            HealthState::from_report(report).view(&sandbox_id, Instant::now())
        }
        Err(err) => return Err(err.into()),
    };
    Ok(Json(WorkspaceStatus::from(&view)))
}

#[utoipa::path(
    get,
    path = "/debug-services/{sandbox_id}",
    responses(
        (status = 200, body = SandboxHealthReport),
        (status = 404, body = ProblemDetails)
    ),
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    tag = "services"
)]
async fn debug_services(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<SandboxHealthReport>, ApiError> {
    let report = state.prober.probe(&sandbox_id).await?;
    Ok(Json(report))
}

#[utoipa::path(
    get,
    path = "/observe",
    responses((status = 200, body = ObservedListResponse)),
    tag = "observe"
)]
async fn list_observed(State(state): State<Arc<AppState>>) -> Json<ObservedListResponse> {
    Json(ObservedListResponse {
        sandbox_ids: state.monitor.observed().await,
    })
}

#[utoipa::path(
    post,
    path = "/observe/{sandbox_id}",
    responses((status = 200, body = HealthStateView)),
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    tag = "observe"
)]
async fn observe_sandbox(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<HealthStateView>, ApiError> {
    let view = state.monitor.observe(&sandbox_id).await?;
    Ok(Json(view))
}

#[utoipa::path(
    get,
    path = "/observe/{sandbox_id}",
    responses(
        (status = 200, body = HealthStateView),
        (status = 404, body = ProblemDetails)
    ),
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    tag = "observe"
)]
async fn get_observation(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<HealthStateView>, ApiError> {
    let view = state.monitor.snapshot(&sandbox_id).await?;
    Ok(Json(view))
}

#[utoipa::path(
    delete,
    path = "/observe/{sandbox_id}",
    responses(
        (status = 204, description = "Observation stopped"),
        (status = 404, body = ProblemDetails)
    ),
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    tag = "observe"
)]
async fn stop_observing(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.monitor.unobserve(&sandbox_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Enters `restarting` and runs the restart in the background. Poll
/// `GET /observe/{sandbox_id}` for the outcome.
#[utoipa::path(
    post,
    path = "/observe/{sandbox_id}/restart",
    responses((status = 200, body = HealthStateView)),
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    tag = "observe"
)]
async fn restart_observed(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<HealthStateView>, ApiError> {
    let view = state.monitor.restart(&sandbox_id).await?;
    Ok(Json(view))
}
