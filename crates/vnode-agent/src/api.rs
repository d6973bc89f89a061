use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vnode_env::{EnvStatus, EnvironmentRecord, ResourceSummary};

use crate::error::EnvError;
use crate::error_payload::ApiError;
use crate::logs;
use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

fn default_rom_gb() -> u64 {
    2048
}

fn default_ram_gb() -> u64 {
    32
}

fn default_name() -> String {
    "kortana".to_string()
}

#[derive(Debug, Deserialize)]
struct AllocateRequest {
    #[serde(default = "default_rom_gb")]
    rom_gb: u64,
    #[serde(default = "default_ram_gb")]
    ram_gb: u64,
    #[serde(default = "default_name", alias = "blockchain_name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct DeployRequest {
    env_id: String,
    #[serde(default)]
    repo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    env_id: String,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct EnvRequest {
    env_id: String,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    lines: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AllocateResponse {
    env_id: String,
    status: EnvStatus,
    resources: ResourceSummary,
    path: String,
    rpc_port: u16,
    p2p_port: u16,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    env_id: String,
    status: EnvStatus,
    blockchain_path: String,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    env_id: String,
    status: EnvStatus,
    rpc_endpoint: String,
    public_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    env_id: String,
    status: EnvStatus,
    stopped: bool,
}

#[derive(Debug, Serialize)]
struct DeallocateResponse {
    env_id: String,
    deallocated: bool,
}

#[derive(Debug, Serialize)]
struct ListEntry {
    env_id: String,
    status: EnvStatus,
    public_url: String,
    resources: ResourceSummary,
}

impl From<EnvironmentRecord> for ListEntry {
    fn from(r: EnvironmentRecord) -> Self {
        Self {
            resources: r.resources(),
            env_id: r.env_id,
            status: r.status,
            public_url: r.public_url,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    env_id: String,
    status: EnvStatus,
    resources: ResourceSummary,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    env_id: String,
    logs: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environments: usize,
    running: usize,
}

fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| EnvError::ParseError(e.body_text()).into())
}

async fn allocate(
    State(state): State<AppState>,
    payload: Result<Json<AllocateRequest>, JsonRejection>,
) -> ApiResult<AllocateResponse> {
    let req = parse_body(payload)?;
    let record = state
        .service
        .allocate(req.rom_gb, req.ram_gb, &req.name)
        .await?;
    Ok(Json(AllocateResponse {
        resources: record.resources(),
        path: record.base_path.display().to_string(),
        env_id: record.env_id,
        status: record.status,
        rpc_port: record.rpc_port,
        p2p_port: record.p2p_port,
        created_at: record.created_at,
    }))
}

async fn deploy(
    State(state): State<AppState>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> ApiResult<DeployResponse> {
    let req = parse_body(payload)?;
    let out = state
        .service
        .deploy(&req.env_id, req.repo.as_deref())
        .await
        .map_err(|e| ApiError::for_env(&req.env_id, e))?;
    Ok(Json(DeployResponse {
        env_id: out.record.env_id,
        status: out.record.status,
        blockchain_path: out.workspace.display().to_string(),
    }))
}

async fn start(
    State(state): State<AppState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> ApiResult<StartResponse> {
    let req = parse_body(payload)?;
    let out = state
        .service
        .start(&req.env_id)
        .await
        .map_err(|e| ApiError::for_env(&req.env_id, e))?;
    if let Some(port) = req.port.filter(|p| *p != out.record.rpc_port) {
        tracing::warn!(
            env_id = %req.env_id,
            requested = port,
            assigned = out.record.rpc_port,
            "ignoring requested port; node uses its assigned rpc port"
        );
    }
    Ok(Json(StartResponse {
        env_id: out.record.env_id,
        status: out.record.status,
        rpc_endpoint: out.rpc_endpoint,
        public_url: out.public_url,
        proxy_error: out.proxy_error,
    }))
}

async fn stop(
    State(state): State<AppState>,
    payload: Result<Json<EnvRequest>, JsonRejection>,
) -> ApiResult<StopResponse> {
    let req = parse_body(payload)?;
    let (record, stopped) = state
        .service
        .stop(&req.env_id)
        .await
        .map_err(|e| ApiError::for_env(&req.env_id, e))?;
    Ok(Json(StopResponse {
        env_id: record.env_id,
        status: record.status,
        stopped,
    }))
}

async fn deallocate(
    State(state): State<AppState>,
    payload: Result<Json<EnvRequest>, JsonRejection>,
) -> ApiResult<DeallocateResponse> {
    let req = parse_body(payload)?;
    if !state.service.deallocate(&req.env_id).await {
        let err = EnvError::NotFound(req.env_id.clone());
        return Err(ApiError::for_env(req.env_id, err));
    }
    Ok(Json(DeallocateResponse {
        env_id: req.env_id,
        deallocated: true,
    }))
}

async fn list(State(state): State<AppState>) -> Json<Vec<ListEntry>> {
    let mut entries: Vec<ListEntry> = state
        .service
        .list()
        .await
        .into_iter()
        .map(ListEntry::from)
        .collect();
    entries.sort_by(|a, b| a.env_id.cmp(&b.env_id));
    Json(entries)
}

async fn status(State(state): State<AppState>, Path(env_id): Path<String>) -> ApiResult<StatusResponse> {
    let record = state
        .service
        .status(&env_id)
        .await
        .map_err(|e| ApiError::for_env(&env_id, e))?;
    Ok(Json(StatusResponse {
        resources: record.resources(),
        env_id: record.env_id,
        status: record.status,
    }))
}

async fn env_logs(
    State(state): State<AppState>,
    Path(env_id): Path<String>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> ApiResult<LogsResponse> {
    let Query(q) = query.map_err(|e| ApiError::for_env(&env_id, EnvError::ParseError(e.body_text())))?;
    let lines = logs::clamp_lines(q.lines.unwrap_or(logs::DEFAULT_LINES));
    let text = state
        .service
        .logs(&env_id, lines)
        .await
        .map_err(|e| ApiError::for_env(&env_id, e))?;
    Ok(Json(LogsResponse { env_id, logs: text }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let summary = state.service.health().await;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environments: summary.environments,
        running: summary.running,
    })
}

fn routes() -> Router<AppState> {
    Router::new()
        .route("/allocate", post(allocate))
        .route("/deploy", post(deploy))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/deallocate", post(deallocate))
        .route("/list", get(list))
        .route("/status/health", get(health))
        .route("/status/:id", get(status))
        .route("/logs/:id", get(env_logs))
}

/// The HTTP surface, served at the root and mirrored under `/api`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes())
        .nest("/api", routes())
        .with_state(state)
}

#[cfg(all(test, unix))]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::service::tests::service_for;
    use crate::supervisor::tests::{LONG_RUNNING, fixture};

    fn app(root: &std::path::Path) -> Router {
        let service = service_for(fixture(root, LONG_RUNNING), Vec::new());
        router(AppState { service })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (code, body) = call(
            &app,
            "POST",
            "/api/allocate",
            Some(json!({"rom_gb": 10, "ram_gb": 4, "name": "alpha"})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["env_id"], "alpha-testnet");
        assert_eq!(body["status"], "allocated");
        assert_eq!(body["resources"]["rom"]["allocated_gb"], 10);
        assert_eq!(body["resources"]["ram"]["allocated_gb"], 4);
        assert_eq!(body["rpc_port"], 8545);

        let (code, body) = call(&app, "POST", "/api/deploy", Some(json!({"env_id": "alpha-testnet"}))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "deployed");
        assert!(body["blockchain_path"].as_str().unwrap().ends_with("alpha-testnet/blockchain"));

        let (code, body) = call(
            &app,
            "POST",
            "/start",
            Some(json!({"env_id": "alpha-testnet", "port": 9999})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["rpc_endpoint"], "http://localhost:8545");
        assert_eq!(body["public_url"], "https://alpha-testnet-rpc.worchsester.xyz");

        let (_, body) = call(&app, "GET", "/list", None).await;
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["status"], "running");

        let (code, body) = call(&app, "GET", "/api/logs/alpha-testnet?lines=20", None).await;
        assert_eq!(code, StatusCode::OK);
        assert!(body["logs"].as_str().unwrap().contains("[vnode-agent]"));

        let (code, body) = call(&app, "POST", "/api/stop", Some(json!({"env_id": "alpha-testnet"}))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["stopped"], true);

        let (_, body) = call(&app, "GET", "/api/status/alpha-testnet", None).await;
        assert_eq!(body["status"], "stopped");

        let (code, body) = call(&app, "POST", "/deallocate", Some(json!({"env_id": "alpha-testnet"}))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["deallocated"], true);
        let (code, body) = call(&app, "POST", "/deallocate", Some(json!({"env_id": "alpha-testnet"}))).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "failed");
    }

    #[tokio::test]
    async fn allocate_defaults_and_name_alias() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (code, body) = call(&app, "POST", "/allocate", Some(json!({}))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["env_id"], "kortana-testnet");
        assert_eq!(body["resources"]["rom"]["allocated_gb"], 2048);
        assert_eq!(body["resources"]["ram"]["allocated_gb"], 32);

        let (_, body) = call(
            &app,
            "POST",
            "/allocate",
            Some(json!({"rom_gb": 1, "ram_gb": 1, "blockchain_name": "beta"})),
        )
        .await;
        assert_eq!(body["env_id"], "beta-testnet");
        assert_eq!(body["rpc_port"], 8546);
    }

    #[tokio::test]
    async fn failures_use_error_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/allocate")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "parse_error");
        assert!(body.get("env_id").is_none());

        let (code, body) = call(&app, "POST", "/allocate", Some(json!({"rom_gb": 0}))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_quota");

        let (code, body) = call(&app, "GET", "/status/ghost", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["env_id"], "ghost");
        assert_eq!(body["status"], "failed");
        assert_eq!(body["error"]["code"], "not_found");

        let (_, body) = call(&app, "POST", "/allocate", Some(json!({"rom_gb": 1, "ram_gb": 1, "name": "early"}))).await;
        let id = body["env_id"].as_str().unwrap().to_string();
        let (code, body) = call(&app, "POST", "/start", Some(json!({"env_id": id}))).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "invalid_transition");
        assert!(body["error"]["hint"].is_string());

        let (code, body) = call(&app, "GET", &format!("/logs/{id}?lines=many"), None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "parse_error");
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        call(&app, "POST", "/allocate", Some(json!({"rom_gb": 1, "ram_gb": 1}))).await;

        let (code, body) = call(&app, "GET", "/api/status/health", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["environments"], 1);
        assert_eq!(body["running"], 0);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
