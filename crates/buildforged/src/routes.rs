//! HTTP routes and the mapping from pipeline outcomes to responses.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use buildforge_core::{
    PackageFailure, Pipeline, PipelineError, PublishResolver, ResolvedArtifact, VERSION,
};
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// Name under `/api/download/` that serves the canonical archive.
const EXTERNAL_DOWNLOAD: &str = "external";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    resolver: PublishResolver,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let resolver = PublishResolver::new(Arc::clone(&pipeline));
        Self { pipeline, resolver }
    }
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/build", post(build))
        .route("/api/package", post(package))
        .route("/api/package-info", get(package_info))
        .route("/api/download/:name", get(download))
        .with_state(AppState::new(pipeline))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": VERSION }))
}

async fn build(State(state): State<AppState>) -> Response {
    match state.pipeline.build().await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn package(State(state): State<AppState>) -> Response {
    match state.pipeline.package().await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(failure) => package_failure_response(&failure),
    }
}

async fn package_info(State(state): State<AppState>) -> Json<Value> {
    let info = state.pipeline.package_info().await;
    Json(serde_json::to_value(info).unwrap_or_else(|_| json!({ "exists": false })))
}

async fn download(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let resolved = if name == EXTERNAL_DOWNLOAD {
        state.resolver.resolve().await
    } else {
        state.resolver.resolve_download(&name).await
    };
    match resolved {
        Ok(artifact) => file_response(artifact),
        Err(err) => error_response(&err),
    }
}

fn file_response(artifact: ResolvedArtifact) -> Response {
    info!(
        name = %artifact.name,
        path = %artifact.path.display(),
        size_bytes = artifact.size_bytes,
        rebuilt = artifact.rebuilt,
        "Serving artifact"
    );
    let content_type = if artifact.name.ends_with(".zip") {
        "application/zip"
    } else {
        "application/octet-stream"
    };
    let headers = [
        (header::CONTENT_TYPE, content_type.to_string()),
        (header::CONTENT_LENGTH, artifact.size_bytes.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.name.replace('"', "")),
        ),
    ];
    let body = Body::from_stream(ReaderStream::new(artifact.file));
    (headers, body).into_response()
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::BuildInProgress => StatusCode::CONFLICT,
        PipelineError::ArtifactNotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &PipelineError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        warn!(code = err.code(), error = %err, "Request failed");
    }

    let body = match err {
        PipelineError::ToolchainFailure { result, .. } => {
            serde_json::to_value(&**result).unwrap_or_else(|_| json!({}))
        }
        PipelineError::ArtifactNotFound {
            name,
            searched,
            listing,
            rebuild,
        } => {
            let mut body = json!({
                "success": false,
                "code": err.code(),
                "error": err.to_string(),
                "name": name,
                "searched": searched,
                "listing": listing,
            });
            if let Some(failure) = rebuild {
                body["rebuild"] = package_failure_body(failure);
            }
            body
        }
        _ => json!({
            "success": false,
            "code": err.code(),
            "error": err.to_string(),
        }),
    };
    (status, Json(body)).into_response()
}

fn package_failure_response(failure: &PackageFailure) -> Response {
    (status_for(&failure.error), Json(package_failure_body(failure))).into_response()
}

fn package_failure_body(failure: &PackageFailure) -> Value {
    let mut body = json!({
        "success": false,
        "run_id": failure.run_id,
        "stage": failure.stage,
        "states": failure.states,
        "code": failure.error.code(),
        "error": failure.error.to_string(),
    });
    if let Some(result) = failure.error.build_result() {
        body["build"] = serde_json::to_value(result).unwrap_or(Value::Null);
    }
    if let PipelineError::StagingTreeMissing { path, listing } = &failure.error {
        body["diagnostics"] = json!({ "missing": path, "listing": listing });
    }
    body
}
