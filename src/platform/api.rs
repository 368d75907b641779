use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use super::control::ControlPlane;
use super::models::{DeployRequest, EditRequest};
use crate::errors::PlatformError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub control: Arc<ControlPlane>,
    pub ws_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RedeployQuery {
    #[serde(default)]
    pub wipe: bool,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
    pub since: Option<u64>,
}

#[derive(Deserialize)]
pub struct ImportQuery {
    #[serde(default)]
    pub redeploy: bool,
    #[serde(default)]
    pub confirm_wipe: bool,
}

#[derive(Deserialize)]
pub struct ConfigUpdateRequest {
    pub base_domain: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub struct ApiError(PlatformError);

impl From<PlatformError> for ApiError {
    fn from(e: PlatformError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PlatformError::Validation(_) => StatusCode::BAD_REQUEST,
            PlatformError::Conflict(_) | PlatformError::ConfirmationRequired { .. } => StatusCode::CONFLICT,
            PlatformError::Unauthorized => StatusCode::UNAUTHORIZED,
            PlatformError::NotFound { .. } => StatusCode::NOT_FOUND,
            PlatformError::PortsExhausted | PlatformError::Halted(_) => StatusCode::SERVICE_UNAVAILABLE,
            PlatformError::BuildFailed { .. } | PlatformError::Process { .. } | PlatformError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self.0 {
            PlatformError::ConfirmationRequired { reasons, .. } => json!({
                "detail": self.0.to_string(),
                "requires_wipe": true,
                "reasons": reasons,
            }),
            other => json!({"detail": other.to_string()}),
        };
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_json(body: &str) -> ApiResult<Value> {
    serde_json::from_str(body)
        .map_err(|e| PlatformError::Validation(format!("Body is not valid JSON: {}", e)).into())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/apps", get(list_apps).post(create_app))
        .route("/api/deploy", post(deploy_compat))
        .route(
            "/api/apps/{name}",
            get(get_app).put(update_app).delete(delete_app),
        )
        .route("/api/apps/{name}/plan", post(plan_edit))
        .route("/api/apps/{name}/redeploy", post(redeploy_app))
        .route("/api/apps/{name}/start", post(start_app))
        .route("/api/apps/{name}/stop", post(stop_app))
        .route("/api/apps/{name}/logs", get(get_logs))
        .route("/api/apps/{name}/deploys", get(get_deploys))
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/system-stats", get(system_stats))
        .route("/api/system/status", get(system_status))
        .route("/api/system/resume", post(system_resume))
        .route("/api/routes", get(list_routes))
        .route("/api/export", get(export_snapshot))
        .route("/api/import", post(import_snapshot))
        .route("/api/validate-config", post(validate_config))
        .route("/api/hooks/{token}", post(webhook))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_apps(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.list_apps().await?))
}

async fn create_app(
    State(state): State<SharedState>,
    Json(req): Json<DeployRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.control.create_app(req).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Create-or-update in the response shape the bundled client expects.
async fn deploy_compat(
    State(state): State<SharedState>,
    Json(req): Json<DeployRequest>,
) -> ApiResult<Response> {
    let (app, report) = state.control.deploy_request(req).await?;
    if !report.success {
        let detail = report.error.clone().unwrap_or_else(|| "Deploy failed".to_string());
        return Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": detail, "logs": report.logs})),
        )
            .into_response());
    }
    Ok(Json(json!({
        "message": "Deployed successfully",
        "app_url": format!("http://{}", app.app.domain),
        "logs": report.logs,
        "app": app,
    }))
    .into_response())
}

async fn get_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.get_app(&name).await?))
}

async fn update_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(req): Json<EditRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.apply_edit(&name, req).await?))
}

async fn plan_edit(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(req): Json<EditRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.plan_edit(&name, &req).await?))
}

async fn delete_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.control.delete_app(&name).await?;
    Ok(Json(json!({"message": "App deleted successfully"})))
}

async fn redeploy_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Query(query): Query<RedeployQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.redeploy(&name, query.wipe).await?))
}

async fn start_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.start_app(&name).await?))
}

async fn stop_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.stop_app(&name).await?))
}

async fn get_logs(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.logs(&name, query.lines, query.since).await?))
}

async fn get_deploys(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.deploys(&name).await?))
}

async fn get_config(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let base_domain = state.control.base_domain().await?;
    Ok(Json(json!({"base_domain": base_domain})))
}

async fn update_config(
    State(state): State<SharedState>,
    Json(req): Json<ConfigUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.set_base_domain(&req.base_domain).await?))
}

async fn system_stats(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.control.system_stats())
}

async fn system_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.control.status())
}

async fn system_resume(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.control.resume())
}

async fn list_routes(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.control.routes())
}

async fn export_snapshot(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.control.export().await?))
}

async fn import_snapshot(
    State(state): State<SharedState>,
    Query(query): Query<ImportQuery>,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let value = parse_json(&body)?;
    let report = state
        .control
        .import(&value, query.redeploy, query.confirm_wipe)
        .await?;
    Ok(Json(report))
}

async fn validate_config(State(state): State<SharedState>, body: String) -> ApiResult<impl IntoResponse> {
    let value = parse_json(&body)?;
    let apps = state.control.validate_snapshot(&value)?;
    Ok(Json(json!({"valid": true, "apps": apps})))
}

async fn webhook(
    State(state): State<SharedState>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let app = state.control.handle_webhook(&token).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"message": "Deploy queued", "app": app})),
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::platform::db::AppDb;
    use crate::platform::test_support::git_repo;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: SharedState,
        repo: String,
        _data: TempDir,
    }

    fn test_app() -> TestApp {
        let data = tempfile::tempdir().unwrap();
        let repo = data.path().join("src-repo");
        git_repo(&repo);
        let mut config = PlatformConfig::with_data_dir(data.path());
        config.settings.ports.start = 25000;
        config.settings.ports.end = 25200;
        config.settings.supervisor.stop_grace_secs = 2;
        let (ws_tx, _) = broadcast::channel(256);
        let control = ControlPlane::new(&config, AppDb::new_in_memory().unwrap(), ws_tx.clone()).unwrap();
        let state = Arc::new(AppState { control, ws_tx });
        TestApp {
            router: api_router().with_state(state.clone()),
            state,
            repo: repo.display().to_string(),
            _data: data,
        }
    }

    async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn deploy_body(app: &TestApp, name: &str) -> Value {
        json!({
            "name": name,
            "repo_url": app.repo,
            "domain": name,
            "build_command": "true",
            "start_command": "sleep 30",
            "language_version": "node@20",
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_list_apps_empty() {
        let app = test_app();
        let (status, body) = send(&app, "GET", "/api/apps", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_create_and_get_app() {
        let app = test_app();
        let (status, body) = send(&app, "POST", "/api/apps", Some(deploy_body(&app, "demo"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["deploy"]["success"], true);
        assert_eq!(body["app"]["status"], "running");
        assert_eq!(body["app"]["domain"], "demo.paas.local");

        let (status, body) = send(&app, "GET", "/api/apps/demo", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "demo");
        assert!(body["deploy_token"].as_str().is_some());

        let (status, body) = send(&app, "GET", "/api/routes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["domain"], "demo.paas.local");
        app.state.control.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_validation_and_conflict() {
        let app = test_app();
        let mut bad = deploy_body(&app, "demo");
        bad["language_version"] = json!("node");
        let (status, body) = send(&app, "POST", "/api/apps", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("language_version"));

        send(&app, "POST", "/api/apps", Some(deploy_body(&app, "demo"))).await;
        let (status, _) = send(&app, "POST", "/api/apps", Some(deploy_body(&app, "demo"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        app.state.control.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_unknown_app_is_404() {
        let app = test_app();
        let (status, body) = send(&app, "GET", "/api/apps/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "App 'ghost' not found");
    }

    #[tokio::test]
    async fn test_destructive_edit_two_step() {
        let app = test_app();
        send(&app, "POST", "/api/apps", Some(deploy_body(&app, "demo"))).await;

        let edit = json!({"language_version": "python@3.12"});
        let (status, body) = send(&app, "POST", "/api/apps/demo/plan", Some(edit.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requires_wipe"], true);

        let (status, body) = send(&app, "PUT", "/api/apps/demo", Some(edit)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["requires_wipe"], true);
        assert_eq!(body["reasons"], json!(["language_version"]));

        let confirmed = json!({"language_version": "python@3.12", "confirm_wipe": true});
        let (status, body) = send(&app, "PUT", "/api/apps/demo", Some(confirmed)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requires_wipe"], true);
        assert_eq!(body["deploy"]["wiped"], true);
        app.state.control.shutdown().await;
    }

    #[tokio::test]
    async fn test_deploy_compat_shapes() {
        let app = test_app();
        let (status, body) = send(&app, "POST", "/api/deploy", Some(deploy_body(&app, "demo"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Deployed successfully");
        assert_eq!(body["app_url"], "http://demo.paas.local");

        let mut failing = deploy_body(&app, "demo");
        failing["build_command"] = json!("exit 3");
        let (status, body) = send(&app, "POST", "/api/deploy", Some(failing)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["logs"].as_str().unwrap().contains("Deploy failed"));
        app.state.control.shutdown().await;
    }

    #[tokio::test]
    async fn test_logs_and_deploys() {
        let app = test_app();
        send(&app, "POST", "/api/apps", Some(deploy_body(&app, "demo"))).await;
        let (status, body) = send(&app, "GET", "/api/apps/demo/logs?lines=500", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["logs"].as_str().unwrap().contains("Deploy (create) started"));
        assert!(body["next_seq"].as_u64().unwrap() > 1);

        let (status, body) = send(&app, "GET", "/api/apps/demo/deploys", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["trigger"], "create");
        app.state.control.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_start_delete() {
        let app = test_app();
        send(&app, "POST", "/api/apps", Some(deploy_body(&app, "demo"))).await;
        let (status, body) = send(&app, "POST", "/api/apps/demo/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");

        let (status, body) = send(&app, "POST", "/api/apps/demo/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");

        let (status, body) = send(&app, "DELETE", "/api/apps/demo", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "App deleted successfully");
        let (status, _) = send(&app, "GET", "/api/apps/demo", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_rejects_unknown_token() {
        let app = test_app();
        let (status, body) = send(&app, "POST", "/api/hooks/not-a-token", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["detail"], "Invalid deploy token");
    }

    #[tokio::test]
    async fn test_webhook_accepts_known_token() {
        let app = test_app();
        send(&app, "POST", "/api/apps", Some(deploy_body(&app, "demo"))).await;
        let (_, view) = send(&app, "GET", "/api/apps/demo", None).await;
        let token = view["deploy_token"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "POST", &format!("/api/hooks/{}", token), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["app"], "demo");
        app.state.control.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let app = test_app();
        let (_, body) = send(&app, "GET", "/api/config", None).await;
        assert_eq!(body["base_domain"], "paas.local");
        let (status, _) = send(&app, "POST", "/api/config", Some(json!({"base_domain": "apps.example.com"}))).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&app, "GET", "/api/config", None).await;
        assert_eq!(body["base_domain"], "apps.example.com");
    }

    #[tokio::test]
    async fn test_validate_and_import() {
        let app = test_app();
        let snapshot = json!({
            "version": 1,
            "apps": [{
                "name": "imported",
                "repo_url": app.repo,
                "domain": "imported.paas.local",
                "build_command": "true",
                "start_command": "sleep 30",
                "language_version": "node@20",
            }]
        });
        let (status, body) = send(&app, "POST", "/api/validate-config", Some(snapshot.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"valid": true, "apps": 1}));

        let (status, body) = send(&app, "POST", "/api/validate-config", Some(json!({"apps": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().is_some());

        let (status, body) = send(&app, "POST", "/api/import", Some(snapshot)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["created"], json!(["imported"]));

        let (_, body) = send(&app, "GET", "/api/export", None).await;
        assert_eq!(body["version"], 1);
        assert_eq!(body["apps"][0]["name"], "imported");
        assert!(body["apps"][0].get("deploy_token").is_none());
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_json() {
        let app = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/import")
            .body(Body::from("{nope"))
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_halted_platform_returns_503() {
        let app = test_app();
        app.state.control.halt_gate().halt("store corrupted");
        let (status, body) = send(&app, "POST", "/api/apps", Some(deploy_body(&app, "demo"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["detail"].as_str().unwrap().contains("store corrupted"));

        let (status, body) = send(&app, "GET", "/api/system/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepting_deploys"], false);

        let (_, body) = send(&app, "POST", "/api/system/resume", None).await;
        assert_eq!(body["accepting_deploys"], true);
    }

    #[tokio::test]
    async fn test_system_stats_shape() {
        let app = test_app();
        let (status, body) = send(&app, "GET", "/api/system-stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("cpu_percent").is_some());
        assert!(body["memory"].get("total").is_some());
        assert!(body["disk"].get("free").is_some());
    }
}
