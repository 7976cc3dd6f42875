//! Admin HTTP API.
//!
//! A thin axum front for the path-routed JSON API on the server actor, plus
//! read access to the server log and a health check.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::json_api::{split_path, JsonApiMethod, JsonApiResult, JsonApiStatus};
use crate::server_log::{JsonOptions, Level, ServerLog};
use crate::session_server::ServerHandle;

const DEFAULT_LOG_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct AdminState {
    pub server: ServerHandle,
    pub log: Arc<ServerLog>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/log", get(server_log))
        .route("/api/{*path}", any(json_api))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the admin API until the listener fails
pub async fn serve(addr: SocketAddr, state: AdminState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        component = "admin_http",
        event = "admin_http.started",
        %addr,
        "Admin API listening"
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}

impl IntoResponse for JsonApiResult {
    fn into_response(self) -> Response {
        (status_code(self.status), Json(self.body)).into_response()
    }
}

fn status_code(status: JsonApiStatus) -> StatusCode {
    match status {
        JsonApiStatus::Ok => StatusCode::OK,
        JsonApiStatus::BadRequest => StatusCode::BAD_REQUEST,
        JsonApiStatus::NotFound => StatusCode::NOT_FOUND,
        JsonApiStatus::BadMethod => StatusCode::METHOD_NOT_ALLOWED,
        JsonApiStatus::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_method(method: &Method) -> Option<JsonApiMethod> {
    match *method {
        Method::GET => Some(JsonApiMethod::Get),
        Method::PUT | Method::POST | Method::PATCH => Some(JsonApiMethod::Update),
        Method::DELETE => Some(JsonApiMethod::Delete),
        _ => None,
    }
}

/// An empty body is an empty request object
fn parse_body(body: &[u8]) -> Result<Value, JsonApiResult> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(JsonApiResult::bad_request("request body must be an object")),
        Err(e) => Err(JsonApiResult::bad_request(&format!("invalid JSON: {e}"))),
    }
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let status = state.server.status();
    Json(json!({
        "status": "ok",
        "server": &*status,
    }))
}

async fn json_api(
    State(state): State<AdminState>,
    method: Method,
    Path(path): Path<String>,
    body: Bytes,
) -> JsonApiResult {
    let Some(method) = api_method(&method) else {
        return JsonApiResult::bad_method();
    };
    let request = match parse_body(&body) {
        Ok(request) => request,
        Err(result) => return result,
    };
    state
        .server
        .json_api(method, split_path(&path), request)
        .await
}

#[derive(Debug, Default, Deserialize)]
struct LogParams {
    session: Option<String>,
    after: Option<String>,
    atleast: Option<String>,
    #[serde(default)]
    page: usize,
    limit: Option<usize>,
}

async fn server_log(
    State(state): State<AdminState>,
    Query(params): Query<LogParams>,
) -> JsonApiResult {
    let after = match params.after.as_deref().map(DateTime::parse_from_rfc3339) {
        Some(Ok(ts)) => Some(ts.with_timezone(&Utc)),
        Some(Err(e)) => return JsonApiResult::bad_request(&format!("invalid timestamp: {e}")),
        None => None,
    };
    let atleast = match params.atleast.as_deref().map(str::parse::<Level>) {
        Some(Ok(level)) => level,
        Some(Err(e)) => return JsonApiResult::bad_request(&e.to_string()),
        None => Level::Debug,
    };
    let limit = params.limit.unwrap_or(DEFAULT_LOG_PAGE_SIZE);

    let log = state.log.clone();
    let session = params.session.unwrap_or_default();
    let page = params.page;
    let entries = tokio::task::spawn_blocking(move || {
        let mut query = log.query().session(session).atleast(atleast).page(page, limit);
        if let Some(after) = after {
            query = query.after(after);
        }
        query.get()
    })
    .await;

    match entries {
        Ok(Ok(entries)) => JsonApiResult::ok(Value::Array(
            entries
                .iter()
                .map(|e| e.to_json(JsonOptions::default()))
                .collect(),
        )),
        Ok(Err(e)) => {
            warn!(
                component = "admin_http",
                event = "admin_http.log_query_failed",
                error = %e,
                "Log query failed"
            );
            JsonApiResult::internal_error(&e.to_string())
        }
        Err(e) => JsonApiResult::internal_error(&e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server_log::{Log, Topic};
    use crate::session_server::SessionServer;

    fn admin_state() -> (AdminState, tokio::task::JoinHandle<()>) {
        let log = Arc::new(ServerLog::in_memory());
        log.set_silent(true);
        let (server, task) =
            ServerHandle::spawn(SessionServer::new(ServerConfig::default(), log.clone()));
        (AdminState { server, log }, task)
    }

    #[test]
    fn statuses_map_to_http() {
        assert_eq!(status_code(JsonApiStatus::Ok), StatusCode::OK);
        assert_eq!(status_code(JsonApiStatus::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_code(JsonApiStatus::BadMethod),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            JsonApiResult::bad_request("nope").into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn methods_map_to_api_methods() {
        assert_eq!(api_method(&Method::GET), Some(JsonApiMethod::Get));
        assert_eq!(api_method(&Method::PUT), Some(JsonApiMethod::Update));
        assert_eq!(api_method(&Method::DELETE), Some(JsonApiMethod::Delete));
        assert_eq!(api_method(&Method::OPTIONS), None);
    }

    #[test]
    fn bodies_must_be_objects() {
        assert_eq!(parse_body(b"").unwrap(), json!({}));
        assert_eq!(parse_body(b" \n").unwrap(), json!({}));
        assert_eq!(parse_body(br#"{"a":1}"#).unwrap()["a"], 1);
        assert!(parse_body(b"[1]").is_err());
        assert!(parse_body(b"{oops").is_err());
    }

    #[tokio::test]
    async fn api_requests_reach_the_server() {
        let (state, task) = admin_state();

        let result = json_api(
            State(state.clone()),
            Method::GET,
            Path("sessions".to_string()),
            Bytes::new(),
        )
        .await;
        assert_eq!(result, JsonApiResult::ok(json!([])));

        let result = json_api(
            State(state.clone()),
            Method::GET,
            Path("nothing/here".to_string()),
            Bytes::new(),
        )
        .await;
        assert_eq!(result.status, JsonApiStatus::NotFound);

        let result = json_api(
            State(state.clone()),
            Method::HEAD,
            Path("sessions".to_string()),
            Bytes::new(),
        )
        .await;
        assert_eq!(result.status, JsonApiStatus::BadMethod);

        state.server.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn log_entries_are_filtered() {
        let (state, task) = admin_state();
        state.log.log_message(
            Log::new()
                .about(Level::Info, Topic::Join)
                .session("abc")
                .message("joined"),
        );
        state.log.log_message(
            Log::new()
                .about(Level::Warn, Topic::Kick)
                .session("abc")
                .message("kicked"),
        );

        let result = server_log(
            State(state.clone()),
            Query(LogParams {
                atleast: Some("warn".into()),
                ..Default::default()
            }),
        )
        .await;
        assert!(result.is_ok());
        let entries = result.body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["topic"], "Kick");

        let result = server_log(
            State(state.clone()),
            Query(LogParams {
                after: Some("yesterday".into()),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(result.status, JsonApiStatus::BadRequest);

        state.server.shutdown().await;
        task.await.unwrap();
    }
}
