//! HTTP API over the ingestion pipeline and the retrieval coordinator.
//!
//! | Method   | Path                            | Description                                  |
//! |----------|---------------------------------|----------------------------------------------|
//! | `POST`   | `/process-file`                 | Ingest a multipart `file` (optional `doc_id`) |
//! | `POST`   | `/process-text`                 | Answer `{text, session_id?}`                 |
//! | `GET`    | `/documents`                    | All metadata records                         |
//! | `GET`    | `/documents/{doc_id}`           | One metadata record                          |
//! | `DELETE` | `/documents/{doc_id}`           | Remove a document from both indices          |
//! | `POST`   | `/maintenance/clear-metadata`   | Empty the metadata index                     |
//! | `POST`   | `/maintenance/clear-chunks`     | Drop the chunk index                         |
//! | `GET`    | `/health`                       | Liveness and version                         |
//!
//! Failures are returned as an [`Outcome`] with `success: false`, the error
//! kind and message, and a status code derived from the kind.

use crate::services::Services;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use deeprecall_core::{
    metadata_to_csv, DeletionReport, EphemeralSession, ErrorKind, MetadataRecord, Outcome,
    RecallError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    services: Arc<Services>,
}

pub fn router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/process-file", post(process_file))
        .route("/process-text", post(process_text))
        .route("/documents", get(list_documents))
        .route("/documents/{doc_id}", get(get_document).delete(delete_document))
        .route("/maintenance/clear-metadata", post(clear_metadata))
        .route("/maintenance/clear-chunks", post(clear_chunks))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(AppState { services })
}

pub async fn serve(services: Arc<Services>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "deeprecall API listening");
    axum::serve(listener, router(services))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
    }
}

struct AppError(RecallError);

impl From<RecallError> for AppError {
    fn from(error: RecallError) -> Self {
        Self(error)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::DuplicateDocId => StatusCode::CONFLICT,
        ErrorKind::MissingDocId | ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::DocumentNotFound | ErrorKind::IndexNotFound | ErrorKind::NoCandidate => {
            StatusCode::NOT_FOUND
        }
        ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::BackendResponse
        | ErrorKind::EmbeddingFailure
        | ErrorKind::ExtractionFailed
        | ErrorKind::PartialIndexFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(Outcome::<()>::failed(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

#[derive(Debug, Deserialize)]
struct ProcessFileParams {
    doc_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProcessFileResponse {
    success: bool,
    doc_id: String,
    csv: String,
    paragraphs: usize,
}

async fn process_file(
    State(state): State<AppState>,
    Query(params): Query<ProcessFileParams>,
    mut multipart: Multipart,
) -> ApiResult<ProcessFileResponse> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| RecallError::InvalidArgument(error.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload.pdf").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|error| RecallError::InvalidArgument(error.to_string()))?;
        upload = Some((file_name, bytes));
        break;
    }

    let Some((file_name, bytes)) = upload else {
        return Err(RecallError::InvalidArgument("multipart field 'file' is required".to_string()).into());
    };

    let services = &state.services;
    let report = services
        .ingestion
        .ingest_file(&services.pages, &file_name, &bytes, params.doc_id.as_deref())
        .await?;

    Ok(Json(ProcessFileResponse {
        success: true,
        doc_id: report.record.doc_id.clone(),
        csv: metadata_to_csv(&report.record)?,
        paragraphs: report.chunks.indexed,
    }))
}

#[derive(Debug, Deserialize)]
struct ProcessTextRequest {
    text: String,
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProcessTextResponse {
    result: String,
    session_id: String,
    doc_id: String,
}

async fn process_text(
    State(state): State<AppState>,
    Json(request): Json<ProcessTextRequest>,
) -> ApiResult<ProcessTextResponse> {
    let services = &state.services;
    // Released when the handler returns or is dropped on client disconnect.
    let (session_id, _ephemeral) = match request.session_id {
        Some(session_id) if !session_id.trim().is_empty() => (session_id, None),
        _ => {
            let session_id = uuid::Uuid::new_v4().to_string();
            let guard = EphemeralSession::new(&services.sessions, session_id.clone());
            (session_id, Some(guard))
        }
    };

    let answer = services
        .retrieval
        .answer(&services.sessions, &session_id, &request.text, &services.llm)
        .await?;

    Ok(Json(ProcessTextResponse {
        result: answer.reply,
        session_id,
        doc_id: answer.retrieval.doc_id,
    }))
}

async fn list_documents(State(state): State<AppState>) -> ApiResult<Outcome<Vec<MetadataRecord>>> {
    let records = state.services.ingestion.metadata().get_all().await?;
    let message = format!("{} documents", records.len());
    Ok(Json(Outcome::ok(records, message)))
}

async fn get_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> ApiResult<Outcome<MetadataRecord>> {
    let record = state
        .services
        .ingestion
        .metadata()
        .get_by_id(&doc_id)
        .await?
        .ok_or_else(|| RecallError::DocumentNotFound(doc_id.clone()))?;
    Ok(Json(Outcome::ok(record, format!("found {doc_id}"))))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> ApiResult<Outcome<DeletionReport>> {
    let report = state.services.ingestion.delete_document(&doc_id).await?;
    Ok(Json(Outcome::ok(report, format!("deleted {doc_id}"))))
}

async fn clear_metadata(State(state): State<AppState>) -> ApiResult<Outcome<u64>> {
    let deleted = state.services.ingestion.metadata().delete_all().await?;
    Ok(Json(Outcome::ok(deleted, format!("deleted {deleted} metadata records"))))
}

async fn clear_chunks(State(state): State<AppState>) -> ApiResult<Outcome<bool>> {
    let existed = state.services.ingestion.chunks().clear().await?;
    let message = if existed {
        "chunk index dropped"
    } else {
        "chunk index did not exist"
    };
    Ok(Json(Outcome::ok(existed, message)))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
