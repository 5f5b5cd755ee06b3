use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::ScanError;
use crate::orchestrator::Orchestrator;
use crate::types::ScanId;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    /// CIDRs or single addresses. Omitted or empty means auto-detect.
    #[serde(default)]
    pub targets: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanAccepted {
    pub scan_id: ScanId,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    scan_id: Option<ScanId>,
}

fn error_response(err: ScanError) -> Response {
    let (code, scan_id) = match &err {
        ScanError::NoTargets { scan_id, .. } | ScanError::InvalidTarget { scan_id, .. } => {
            (StatusCode::BAD_REQUEST, Some(*scan_id))
        }
        ScanError::NotFound(_) => (StatusCode::NOT_FOUND, None),
        _ => {
            error!("api error: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, None)
        }
    };
    let body = ErrorBody {
        error: err.to_string(),
        scan_id,
    };
    (code, Json(body)).into_response()
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scans", get(list_scans).post(post_scan))
        .route("/scans/{id}", get(get_scan))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving API on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn post_scan(State(app): State<AppState>, body: Option<Json<ScanRequest>>) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    match app.orchestrator.start_scan(req.targets).await {
        Ok(scan_id) => (StatusCode::ACCEPTED, Json(ScanAccepted { scan_id })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_scans(State(app): State<AppState>) -> Response {
    match app.orchestrator.list_scans().await {
        Ok(scans) => (StatusCode::OK, Json(scans)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_scan(State(app): State<AppState>, Path(id): Path<u64>) -> Response {
    match app.orchestrator.scan_status(ScanId(id)).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => error_response(e),
    }
}
