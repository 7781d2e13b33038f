use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    error::ConfigError,
    range::AddressRange,
    scanner::{ScanHandle, ScanOptions, ScanOrchestrator},
    types::{Credentials, RemoteCommand},
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>,
}

struct ServerState {
    orchestrator: ScanOrchestrator,
    defaults: ScanOptions,
    current: Option<ScanHandle>,
}

impl AppState {
    pub fn new(orchestrator: ScanOrchestrator, defaults: ScanOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState {
                orchestrator,
                defaults,
                current: None,
            })),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub range: String,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub session_concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ScanRequest {
    fn options(&self, defaults: &ScanOptions) -> ScanOptions {
        ScanOptions {
            concurrency_limit: self.concurrency.unwrap_or(defaults.concurrency_limit),
            session_limit: self.session_concurrency.unwrap_or(defaults.session_limit),
            probe_timeout: self
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            session_timeout: self
                .session_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.session_timeout),
            interval: self
                .interval_secs
                .map(Duration::from_secs)
                .or(defaults.interval),
        }
    }

    fn remote_command(&self) -> Result<Option<RemoteCommand>, ConfigError> {
        let Some(command) = self.command.as_deref() else {
            return Ok(None);
        };
        let credentials = Credentials::new(
            self.username.clone().unwrap_or_default(),
            self.password.clone().unwrap_or_default(),
        );
        RemoteCommand::new(credentials, command).map(Some)
    }
}

#[derive(Debug, Deserialize)]
pub struct StopParams {
    #[serde(default)]
    pub hard: bool,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/scan/stop", post(post_stop))
        .route("/unreachable", get(get_unreachable))
        .route("/results", get(get_results))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving status API");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    match s.current.as_ref() {
        Some(handle) => Json(handle.run().summary().await).into_response(),
        None => Json(json!({ "state": "idle" })).into_response(),
    }
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    match s.current.as_ref() {
        Some(handle) => (StatusCode::OK, Json(handle.store().snapshot().await)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_unreachable(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let details = match s.current.as_ref() {
        Some(handle) => handle.store().unreachable().await,
        None => Vec::new(),
    };
    let ips: Vec<String> = details.iter().map(|o| o.address.to_string()).collect();
    Json(json!({ "unreachable_ips": ips, "details": details }))
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> Response {
    let range = match AddressRange::parse(&req.range) {
        Ok(r) => r,
        Err(e) => return bad_request(&e),
    };
    let command = match req.remote_command() {
        Ok(c) => c,
        Err(e) => return bad_request(&e),
    };

    let mut s = app.inner.write().await;
    let options = req.options(&s.defaults);
    let handle = match s.orchestrator.run(range, options, command) {
        Ok(h) => h,
        Err(e) => return bad_request(&e),
    };
    // Only one run at a time; the previous one drains in the background.
    if let Some(previous) = s.current.replace(handle) {
        previous.cancel();
    }

    let summary = match s.current.as_ref() {
        Some(h) => h.run().summary().await,
        None => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    (StatusCode::ACCEPTED, Json(summary)).into_response()
}

async fn post_stop(State(app): State<AppState>, Query(params): Query<StopParams>) -> Response {
    let s = app.inner.read().await;
    let Some(handle) = s.current.as_ref() else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "no scan has been started" })))
            .into_response();
    };
    if params.hard {
        handle.hard_cancel();
    } else {
        handle.cancel();
    }
    (StatusCode::OK, Json(handle.run().summary().await)).into_response()
}

fn bad_request(e: &ConfigError) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
}
