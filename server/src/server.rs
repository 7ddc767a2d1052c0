//! HTTP server over the flow runner.
//!
//! Thin adapter: run controls, definition and schema views, flow upload and
//! the SSE event stream. All engine behaviour stays in `flowk-core`.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use flowk_core::{schema, ActionRegistry, EventHub, FlowRunner, FlowkConfig};

use crate::errors::{ServerError, ServerResult};
use crate::sse;
use crate::types::{FlowSummary, RunRequest, StopAtRequest};
use crate::upload;

/// Shared state behind every request handler.
pub struct ServerState {
    pub runner: FlowRunner,
    pub hub: Arc<EventHub>,
    pub registry: Arc<ActionRegistry>,
    pub upload_root: PathBuf,
    pub search_roots: Vec<PathBuf>,
}

/// The FlowK HTTP server.
pub struct FlowServer {
    bind_address: String,
    state: Arc<ServerState>,
}

impl FlowServer {
    pub fn new(
        config: &FlowkConfig,
        runner: FlowRunner,
        hub: Arc<EventHub>,
        registry: Arc<ActionRegistry>,
    ) -> Self {
        Self {
            bind_address: config.bind_address(),
            state: Arc::new(ServerState {
                runner,
                hub,
                registry,
                upload_root: config.server.upload_dir.clone(),
                search_roots: config.server.search_roots.clone(),
            }),
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Serve until the listener fails or the process ends.
    pub async fn run(&self) -> ServerResult<()> {
        let addr: std::net::SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| ServerError::ConfigError(format!("invalid bind address: {e}")))?;

        let state = self.state.clone();
        let make_svc = make_service_fn(move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let state = state.clone();
                    handle_request(req, state)
                }))
            }
        });

        info!("FlowK server listening on http://{addr}");
        Server::bind(&addr)
            .serve(make_svc)
            .await
            .map_err(|e| ServerError::ServerError(format!("HTTP server error: {e}")))
    }
}

/// Route a single request.
pub async fn handle_request(
    req: Request<Body>,
    state: Arc<ServerState>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Ok(Response::new(Body::from("OK"))),

        (&Method::GET, "/api/flow") => handle_get_flow(&state),

        (&Method::GET, "/api/schema") => handle_get_schema(&state),

        (&Method::POST, "/api/flow") => handle_upload_flow(req, state).await,

        (&Method::POST, "/api/run") => handle_run(req, state).await,

        (&Method::POST, "/api/run/stop") => handle_stop(&state),

        (&Method::POST, "/api/run/stop-at") => handle_stop_at(req, state).await,

        (&Method::GET, "/api/run/events") => Ok(sse::event_stream_response(&state.hub)),

        _ => error_response(404, "not found"),
    }
}

fn handle_get_flow(state: &ServerState) -> Result<Response<Body>, hyper::Error> {
    // Prefer the definition bound to the last run; otherwise load the
    // currently configured flow file.
    if let Some(definition) = state.runner.definition() {
        return json_response(StatusCode::OK, FlowSummary::from_definition(&definition));
    }
    match state.runner.load_definition() {
        Ok(definition) => json_response(StatusCode::OK, FlowSummary::from_definition(&definition)),
        Err(e) => {
            let error = ServerError::from(e);
            error_response(error.status_code(), &error.to_string())
        }
    }
}

fn handle_get_schema(state: &ServerState) -> Result<Response<Body>, hyper::Error> {
    match schema::combined_schema(&state.registry) {
        Ok(schema) => json_response(StatusCode::OK, schema),
        Err(e) => error_response(500, &e.to_string()),
    }
}

async fn handle_upload_flow(
    req: Request<Body>,
    state: Arc<ServerState>,
) -> Result<Response<Body>, hyper::Error> {
    let filename = req
        .headers()
        .get("X-Flow-Filename")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let body = hyper::body::to_bytes(req.into_body()).await?;
    match upload::store_flow(
        &body,
        filename.as_deref(),
        &state.upload_root,
        &state.search_roots,
    ) {
        Ok(path) => {
            state.runner.update_flow_path(&path);
            json_response(
                StatusCode::CREATED,
                json!({"stored": path.display().to_string()}),
            )
        }
        Err(error) => {
            error!("flow upload rejected: {error}");
            error_response(error.status_code(), &error.to_string())
        }
    }
}

async fn handle_run(
    req: Request<Body>,
    state: Arc<ServerState>,
) -> Result<Response<Body>, hyper::Error> {
    let body = hyper::body::to_bytes(req.into_body()).await?;
    let request: RunRequest = if body.is_empty() {
        RunRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return error_response(400, &format!("invalid run request: {e}")),
        }
    };

    match state.runner.start(request.into_options()) {
        Ok(_handle) => json_response(StatusCode::ACCEPTED, json!({"status": "started"})),
        Err(e) => {
            let error = ServerError::from(e);
            error_response(error.status_code(), &error.to_string())
        }
    }
}

fn handle_stop(state: &ServerState) -> Result<Response<Body>, hyper::Error> {
    match state.runner.request_stop() {
        Ok(()) => json_response(StatusCode::ACCEPTED, json!({"status": "stopping"})),
        Err(e) => {
            let error = ServerError::from(e);
            error_response(error.status_code(), &error.to_string())
        }
    }
}

async fn handle_stop_at(
    req: Request<Body>,
    state: Arc<ServerState>,
) -> Result<Response<Body>, hyper::Error> {
    let body = hyper::body::to_bytes(req.into_body()).await?;
    let request: StopAtRequest = if body.is_empty() {
        StopAtRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return error_response(400, &format!("invalid stop-at request: {e}")),
        }
    };

    state
        .runner
        .set_stop_at_task(request.task_id.as_deref().unwrap_or(""));
    json_response(StatusCode::OK, json!({"status": "ok"}))
}

/// Helper function to create a JSON response
fn json_response<T: Serialize>(
    status: StatusCode,
    data: T,
) -> Result<Response<Body>, hyper::Error> {
    let body = serde_json::to_string(&data).unwrap_or_else(|_| "{}".to_string());
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap())
}

/// Helper function to create error response
fn error_response(status: u16, message: &str) -> Result<Response<Body>, hyper::Error> {
    let body = serde_json::to_string(&json!({"error": message}))
        .unwrap_or_else(|_| r#"{"error":"internal"}"#.to_string());
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowk_core::register_builtin_actions;
    use serde_json::Value;
    use std::fs;
    use tempfile::TempDir;

    fn state_fixture(dir: &TempDir) -> Arc<ServerState> {
        let flow_path = dir.path().join("flow.json");
        fs::write(
            &flow_path,
            serde_json::to_string(&json!({
                "id": "demo",
                "tasks": [{"id": "a", "action": "PRINT", "entries": [{"message": "hi"}]}]
            }))
            .unwrap(),
        )
        .unwrap();

        let mut registry = ActionRegistry::new();
        register_builtin_actions(&mut registry).unwrap();
        let registry = Arc::new(registry);
        let hub = Arc::new(EventHub::new());
        let runner = FlowRunner::new(
            registry.clone(),
            hub.clone(),
            &flow_path,
            dir.path().join("logs"),
        );

        Arc::new(ServerState {
            runner,
            hub,
            registry,
            upload_root: dir.path().join("uploads"),
            search_roots: vec![],
        })
    }

    async fn body_json(response: Response<Body>) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let state = state_fixture(&dir);
        let response = handle_request(
            Request::get("/health").body(Body::empty()).unwrap(),
            state,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_flow_summary() {
        let dir = TempDir::new().unwrap();
        let state = state_fixture(&dir);
        let response = handle_request(
            Request::get("/api/flow").body(Body::empty()).unwrap(),
            state,
        )
        .await
        .unwrap();
        let (status, body) = body_json(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "demo");
        assert_eq!(body["tasks"][0]["id"], "a");
    }

    #[tokio::test]
    async fn test_get_schema() {
        let dir = TempDir::new().unwrap();
        let state = state_fixture(&dir);
        let response = handle_request(
            Request::get("/api/schema").body(Body::empty()).unwrap(),
            state,
        )
        .await
        .unwrap();
        let (status, body) = body_json(response).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("definitions").is_some());
    }

    #[tokio::test]
    async fn test_run_then_conflict() {
        let dir = TempDir::new().unwrap();
        let state = state_fixture(&dir);

        // Conflicting filters are rejected up front.
        let response = handle_request(
            Request::post("/api/run")
                .body(Body::from(
                    serde_json::to_vec(&json!({"taskId": "a", "flowId": "demo"})).unwrap(),
                ))
                .unwrap(),
            state.clone(),
        )
        .await
        .unwrap();
        let (status, _) = body_json(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let response = handle_request(
            Request::post("/api/run").body(Body::empty()).unwrap(),
            state.clone(),
        )
        .await
        .unwrap();
        let (status, body) = body_json(response).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "started");
    }

    #[tokio::test]
    async fn test_stop_without_run_conflicts() {
        let dir = TempDir::new().unwrap();
        let state = state_fixture(&dir);
        let response = handle_request(
            Request::post("/api/run/stop").body(Body::empty()).unwrap(),
            state,
        )
        .await
        .unwrap();
        let (status, body) = body_json(response).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("No run"));
    }

    #[tokio::test]
    async fn test_stop_at_roundtrip() {
        let dir = TempDir::new().unwrap();
        let state = state_fixture(&dir);
        let response = handle_request(
            Request::post("/api/run/stop-at")
                .body(Body::from(
                    serde_json::to_vec(&json!({"taskId": "a"})).unwrap(),
                ))
                .unwrap(),
            state,
        )
        .await
        .unwrap();
        let (status, _) = body_json(response).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upload_rebinds_runner() {
        let dir = TempDir::new().unwrap();
        let state = state_fixture(&dir);

        let response = handle_request(
            Request::post("/api/flow")
                .header("X-Flow-Filename", "uploaded.json")
                .body(Body::from(
                    serde_json::to_vec(&json!({"id": "up", "tasks": []})).unwrap(),
                ))
                .unwrap(),
            state.clone(),
        )
        .await
        .unwrap();
        let (status, body) = body_json(response).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["stored"].as_str().unwrap().ends_with("uploaded.json"));
        assert!(state
            .runner
            .flow_path()
            .ends_with("uploads/uploaded.json"));
    }

    #[tokio::test]
    async fn test_unknown_route_404() {
        let dir = TempDir::new().unwrap();
        let state = state_fixture(&dir);
        let response = handle_request(
            Request::get("/api/nope").body(Body::empty()).unwrap(),
            state,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
