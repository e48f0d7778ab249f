use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;
use workspace_orchestrator::config::OrchestratorConfig;
use workspace_orchestrator::metadata::MemoryStore;
use workspace_orchestrator::router::{build_router, AppState, AuthConfig};
use workspace_orchestrator::testing::{workspace_with, FakeSandbox};

const SANDBOX_ID: &str = "sbx-test";

struct TestApp {
    app: Router,
    sandbox: Arc<FakeSandbox>,
}

impl TestApp {
    fn new(repositories: &[&str]) -> Self {
        Self::new_with_auth(repositories, AuthConfig::disabled())
    }

    fn new_with_auth(repositories: &[&str], auth: AuthConfig) -> Self {
        let sandbox = Arc::new(FakeSandbox::new(SANDBOX_ID));
        let store = Arc::new(MemoryStore::with_workspace(workspace_with(
            SANDBOX_ID,
            repositories,
        )));
        let config = OrchestratorConfig {
            settle_delay: Duration::ZERO,
            post_launch_delay: Duration::ZERO,
            probe_attempts: 2,
            ..OrchestratorConfig::default()
        };
        let state = AppState::new(auth, sandbox.clone(), store, config);
        Self {
            app: build_router(state),
            sandbox,
        }
    }
}

async fn send_request(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, headers, value)
}

async fn send_json(app: &Router, method: Method, path: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .expect("request");
    let (status, _, value) = send_request(app, request).await;
    (status, value)
}

async fn send_with_token(
    app: &Router,
    method: Method,
    path: &str,
    token: &str,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request");
    let (status, _, value) = send_request(app, request).await;
    (status, value)
}
