include!("common/http.rs");

use workspace_orchestrator::provider::SessionState;

#[tokio::test]
async fn token_guards_everything_but_health() {
    let app = TestApp::new_with_auth(&["web"], AuthConfig::with_token("secret".to_string()));

    let (status, payload) = send_json(&app.app, Method::GET, "/v1/health").await;
    assert_eq!(status, StatusCode::OK, "health should be public");
    assert_eq!(payload["status"], "ok");

    let (status, payload) =
        send_json(&app.app, Method::GET, &format!("/debug-services/{SANDBOX_ID}")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED, "missing token should 401");
    assert_eq!(
        payload["type"],
        "urn:workspace-orchestrator:error:token_invalid"
    );

    let (status, _) = send_with_token(
        &app.app,
        Method::GET,
        &format!("/debug-services/{SANDBOX_ID}"),
        "wrong",
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, payload) = send_with_token(
        &app.app,
        Method::GET,
        &format!("/debug-services/{SANDBOX_ID}"),
        "secret",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["sandboxId"], SANDBOX_ID);
}

#[tokio::test]
async fn fix_services_restarts_every_repository() {
    let app = TestApp::new(&["web", "api"]);

    let (status, payload) =
        send_json(&app.app, Method::POST, &format!("/fix-services/{SANDBOX_ID}")).await;
    assert_eq!(status, StatusCode::OK, "{payload}");
    assert_eq!(payload["summary"]["totalServices"], 6);
    assert_eq!(payload["summary"]["successful"], 6);
    assert_eq!(payload["summary"]["failed"], 0);

    let api = &payload["perRepository"][1];
    assert_eq!(api["repositoryName"], "api");
    assert_eq!(api["status"], "success");
    assert_eq!(api["services"][0]["service"], "editor");
    assert_eq!(api["services"][0]["port"], 8081);
    assert_eq!(
        api["services"][2]["url"],
        "https://4001-sbx-test.preview.test"
    );

    let (status, payload) =
        send_json(&app.app, Method::POST, &format!("/fix-services/{SANDBOX_ID}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["summary"]["successful"], 6);
    assert_eq!(payload["perRepository"][0]["cleanup"][0]["outcome"], "killed");
}

#[tokio::test]
async fn fix_services_reports_partial_failures_in_the_body() {
    let app = TestApp::new(&["web", "api", "docs"]);
    app.sandbox.remove_repository_dir("api");
    app.sandbox.break_port(4002);

    let (status, payload) =
        send_json(&app.app, Method::POST, &format!("/fix-services/{SANDBOX_ID}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["summary"]["skippedRepositories"], 1);
    assert_eq!(payload["summary"]["successful"], 5);
    assert_eq!(payload["summary"]["failed"], 1);
    assert_eq!(payload["perRepository"][1]["status"], "skipped");
    assert_eq!(payload["perRepository"][2]["status"], "partial");
}

#[tokio::test]
async fn unknown_sandbox_is_problem_details() {
    let app = TestApp::new(&["web"]);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/fix-services/sbx-missing")
        .body(Body::empty())
        .expect("request");
    let (status, headers, payload) = send_request(&app.app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("application/problem+json")
    );
    assert_eq!(
        payload["type"],
        "urn:workspace-orchestrator:error:sandbox_not_found"
    );
    assert_eq!(payload["status"], 404);
    assert_eq!(payload["sandboxId"], "sbx-missing");
    assert_eq!(payload["class"], "precondition");
}

#[tokio::test]
async fn debug_services_follows_restarts() {
    let app = TestApp::new(&["web"]);

    let (status, payload) =
        send_json(&app.app, Method::GET, &format!("/debug-services/{SANDBOX_ID}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["sandboxState"], "started");
    let services = payload["services"].as_array().expect("services");
    assert_eq!(services.len(), 3);
    assert!(services.iter().all(|service| service["state"] == "stopped"));

    send_json(&app.app, Method::POST, &format!("/fix-services/{SANDBOX_ID}")).await;

    let (_, payload) =
        send_json(&app.app, Method::GET, &format!("/debug-services/{SANDBOX_ID}")).await;
    let services = payload["services"].as_array().expect("services");
    assert!(services.iter().all(|service| service["state"] == "running"));
    assert_eq!(services[1]["name"], "terminal");
    assert_eq!(services[1]["port"], 10000);
    assert_eq!(payload["processSnapshot"].as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn workspace_status_summarizes_health() {
    let app = TestApp::new(&["web"]);
    let path = format!("/workspace-status/{SANDBOX_ID}");

    let (status, payload) = send_json(&app.app, Method::GET, &path).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "degraded");
    assert_eq!(payload["servicesHealthy"], false);

    send_json(&app.app, Method::POST, &format!("/fix-services/{SANDBOX_ID}")).await;
    let (_, payload) = send_json(&app.app, Method::GET, &path).await;
    assert_eq!(payload["status"], "healthy");
    assert_eq!(payload["servicesHealthy"], true);
    assert_eq!(payload["message"], "All services are running.");

    app.sandbox.set_state(SessionState::Stopped);
    let (_, payload) = send_json(&app.app, Method::GET, &path).await;
    assert_eq!(payload["status"], "stopped");
    assert_eq!(payload["servicesHealthy"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observation_can_be_started_read_and_stopped() {
    let app = TestApp::new(&["web"]);
    let path = format!("/observe/{SANDBOX_ID}");

    let (status, _) = send_json(&app.app, Method::GET, &path).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, payload) = send_json(&app.app, Method::POST, &path).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["sandboxId"], SANDBOX_ID);

    let (status, payload) = send_json(&app.app, Method::GET, "/observe").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["sandboxIds"][0], SANDBOX_ID);

    let (status, payload) = send_json(&app.app, Method::GET, &path).await;
    assert_eq!(status, StatusCode::OK);
    assert!(payload["phase"].is_string());

    let (status, payload) = send_json(&app.app, Method::DELETE, &path).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(payload, Value::Null);

    let (status, payload) = send_json(&app.app, Method::GET, &path).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        payload["type"],
        "urn:workspace-orchestrator:error:observation_not_found"
    );
}

#[tokio::test]
async fn observing_an_unknown_sandbox_is_404() {
    let app = TestApp::new(&["web"]);

    let (status, payload) = send_json(&app.app, Method::POST, "/observe/sbx-missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        payload["type"],
        "urn:workspace-orchestrator:error:sandbox_not_found"
    );

    let (_, payload) = send_json(&app.app, Method::GET, "/observe").await;
    assert_eq!(payload["sandboxIds"], serde_json::json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observed_restart_enters_restarting() {
    let app = TestApp::new(&["web"]);

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        &format!("/observe/{SANDBOX_ID}/restart"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["phase"], "restarting");
    assert_eq!(payload["message"], "Restarting services...");
}

#[tokio::test]
async fn openapi_document_lists_the_control_surface() {
    let app = TestApp::new(&[]);

    let (status, payload) = send_json(&app.app, Method::GET, "/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    let paths = payload["paths"].as_object().expect("paths");
    for path in [
        "/v1/health",
        "/fix-services/{sandbox_id}",
        "/workspace-status/{sandbox_id}",
        "/debug-services/{sandbox_id}",
        "/observe/{sandbox_id}",
        "/observe/{sandbox_id}/restart",
    ] {
        assert!(paths.contains_key(path), "missing {path}");
    }
    assert!(payload["components"]["schemas"]["ServiceRestartResult"].is_object());
}

#[tokio::test]
async fn unknown_routes_are_404() {
    let app = TestApp::new(&[]);
    let (status, _) = send_json(&app.app, Method::GET, "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
