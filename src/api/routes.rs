//! HTTP route handlers.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, State},
    http::{header, header::HeaderValue, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audit::AuditReport;
use crate::config::Config;
use crate::engine::{Artifacts, AuditEngine, EngineError, ReportLookup};
use crate::task::{Task, TaskId, TaskStatus};

use super::types::*;

/// Largest accepted upload.
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub engine: AuditEngine,
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.docs_dir).await?;

    let engine = AuditEngine::from_config(&config);
    let state = Arc::new(AppState {
        config: config.clone(),
        engine,
    });
    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight tasks finish before exiting.
    match Arc::try_unwrap(state) {
        Ok(state) => state.engine.shutdown().await,
        Err(_) => tracing::warn!("Application state still shared, skipping worker drain"),
    }

    Ok(())
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let upload_route = Router::new()
        .route("/api/v1/upload", post(upload))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/v1/tasks", get(list_tasks))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/report/:id", get(get_report))
        .route("/api/v1/download/:id", get(download))
        .route("/api/v1/artifacts/:id", get(get_artifacts))
        .merge(upload_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining audit workers...");
}

fn engine_error(e: EngineError) -> (StatusCode, String) {
    if e.is_not_found() {
        (StatusCode::NOT_FOUND, e.to_string())
    } else if matches!(e, EngineError::QueueClosed(_)) {
        tracing::error!("{}", e);
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    } else {
        tracing::error!("{}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn pending(task: &Task) -> Response {
    (StatusCode::ACCEPTED, Json(PendingResponse::from(task))).into_response()
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tasks: state.engine.store().len().await,
        inference: state.engine.breaker_snapshot().into(),
    })
}

/// Accept a document and start auditing it.
///
/// The multipart field `file` is stored as `<docs_dir>/<task_id>.<ext>`.
async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, String)> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let task_id = TaskId::new();
        let file_name = match field
            .file_name()
            .and_then(|name| FsPath::new(name).extension())
            .and_then(|ext| ext.to_str())
        {
            Some(ext) => format!("{}.{}", task_id, ext.to_ascii_lowercase()),
            None => task_id.to_string(),
        };
        let target = state.config.docs_dir.join(file_name);
        let partial = target.with_extension("part");

        tokio::fs::create_dir_all(&state.config.docs_dir)
            .await
            .map_err(internal_error)?;
        let size = match write_field(&mut field, &partial, &target).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&partial).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %partial.display(), "Failed to remove partial upload: {}", rm);
                    }
                }
                return Err(e);
            }
        };

        tracing::info!(task_id = %task_id, bytes = size, path = %target.display(), "Upload stored");
        let task_id = state
            .engine
            .submit_as(task_id, target)
            .await
            .map_err(engine_error)?;
        return Ok((StatusCode::ACCEPTED, Json(UploadResponse { task_id })));
    }

    Err((StatusCode::BAD_REQUEST, "missing file".to_string()))
}

/// Stream a multipart field into `partial`, then move it to `target`.
async fn write_field(
    field: &mut Field<'_>,
    partial: &FsPath,
    target: &FsPath,
) -> Result<usize, (StatusCode, String)> {
    let mut f = tokio::fs::File::create(partial)
        .await
        .map_err(internal_error)?;
    let mut size = 0usize;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        size += chunk.len();
        f.write_all(&chunk).await.map_err(internal_error)?;
    }
    f.flush().await.map_err(internal_error)?;
    drop(f);
    tokio::fs::rename(partial, target)
        .await
        .map_err(internal_error)?;
    Ok(size)
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskSummary>> {
    let tasks = state.engine.store().list().await;
    Json(tasks.into_iter().map(TaskSummary::from).collect())
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<Task>, (StatusCode, String)> {
    state.engine.status(id).await.map(Json).map_err(engine_error)
}

async fn get_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Response, (StatusCode, String)> {
    match state.engine.report(id).await.map_err(engine_error)? {
        ReportLookup::Ready(report) => Ok(Json::<AuditReport>(report).into_response()),
        ReportLookup::NotReady(_) => {
            let task = state.engine.status(id).await.map_err(engine_error)?;
            Ok(pending(&task))
        }
    }
}

async fn get_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<Artifacts>, (StatusCode, String)> {
    state.engine.artifacts(id).await.map(Json).map_err(engine_error)
}

/// Download the annotated document, or the report when no annotated copy exists.
async fn download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Response, (StatusCode, String)> {
    let task = state.engine.status(id).await.map_err(engine_error)?;
    if task.status != TaskStatus::Completed {
        return Ok(pending(&task));
    }

    let annotated = match task.annotated_path.as_deref() {
        Some(path) if tokio::fs::try_exists(path).await.unwrap_or(false) => {
            Some(path.to_path_buf())
        }
        _ => None,
    };
    let path: PathBuf = annotated
        .or_else(|| task.report_path.clone())
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Task {} has no artifacts", id)))?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, format!("File not found: {}", e)))?;

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", filename)
            .parse()
            .map_err(|_| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Filename produces an invalid header value: {}", filename),
                )
            })?,
    );
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_path(&path)),
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn content_type_for_path(path: &FsPath) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("doc") => "application/msword",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
