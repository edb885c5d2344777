//! HTTP API.
//!
//! Starts crawls, ingests text and Q&A sources, and serves sources, chunks,
//! job records and live crawl progress. The worker pool runs in the same
//! process and is shut down when the server stops.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/crawl` | Create a website source and enqueue its crawl |
//! | `POST`   | `/sources/{id}/recrawl` | Re-run the crawl of a website source |
//! | `GET`    | `/sources/{id}` | Source row with metadata |
//! | `DELETE` | `/sources/{id}` | Delete a source and its chunks |
//! | `GET`    | `/sources/{id}/chunks` | Chunks in position order (`offset`, `limit`) |
//! | `GET`    | `/sources/{id}/events` | Crawl progress as Server-Sent Events |
//! | `POST`   | `/sources/text` | Ingest raw text |
//! | `POST`   | `/sources/qa` | Ingest a question and answer |
//! | `GET`    | `/jobs/{id}` | Job record (status, attempts, last error) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "source 3f2c… already has an active crawl job" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `unavailable` (503), `internal` (500).

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use ingest_harness_core::models::JobRecord;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::error::QueueError;
use crate::get::{get_chunks, get_source, ChunkPage, SourceResponse, DEFAULT_CHUNK_LIMIT};
use crate::pubsub::{progress_topic, PubSub};
use crate::queue::JobQueue;
use crate::sources::{CrawlRequest, SourceService, StartedCrawl};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sources: Arc<SourceService>,
    pub queue: Arc<JobQueue>,
    pub pubsub: Arc<dyn PubSub>,
}

/// Build the router. Split out from [`run_server`] so tests can serve it on
/// an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/crawl", post(handle_crawl))
        .route("/sources/text", post(handle_text))
        .route("/sources/qa", post(handle_qa))
        .route(
            "/sources/{id}",
            get(handle_get_source).delete(handle_delete_source),
        )
        .route("/sources/{id}/recrawl", post(handle_recrawl))
        .route("/sources/{id}/chunks", get(handle_chunks))
        .route("/sources/{id}/events", get(handle_events))
        .route("/jobs/{id}", get(handle_job))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `[server] bind` until Ctrl-C, then drain the job queue.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.server.bind.clone();
    let queue = state.queue.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("ingest server listening on http://{}", bind_addr);
    info!(bind = %bind_addr, "server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    queue.shutdown().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict",
        message: message.into(),
    }
}

/// Maps pipeline errors to a status. Queue errors are typed; the rest is
/// matched on message the same way for every handler.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(queue_err) = err.downcast_ref::<QueueError>() {
            return match queue_err {
                QueueError::SourceBusy(_) => conflict(queue_err.to_string()),
                QueueError::Closed => AppError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    code: "unavailable",
                    message: queue_err.to_string(),
                },
            };
        }

        let msg = format!("{:#}", err);
        if msg.contains("not found") {
            not_found(msg)
        } else if msg.contains("must not be empty")
            || msg.contains("cannot be crawled")
            || msg.contains("invalid")
        {
            bad_request(msg)
        } else {
            error!(error = %msg, "request failed");
            AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: msg,
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Crawls ============

async fn handle_crawl(
    State(state): State<AppState>,
    Json(request): Json<CrawlRequest>,
) -> Result<(StatusCode, Json<StartedCrawl>), AppError> {
    let started = state.sources.start_crawl(&state.queue, &request).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn handle_recrawl(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<StartedCrawl>), AppError> {
    let started = state.sources.recrawl(&state.queue, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn handle_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    match state.sources.store().get_job(&id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(not_found(format!("job not found: {}", id))),
    }
}

// ============ Sources ============

async fn handle_get_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SourceResponse>, AppError> {
    Ok(Json(get_source(state.sources.store().as_ref(), &id).await?))
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn handle_delete_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    if state.queue.is_active(&id) {
        return Err(conflict(format!("source {} has an active crawl job", id)));
    }
    if !state.sources.delete(&id).await? {
        return Err(not_found(format!("source not found: {}", id)));
    }
    Ok(Json(DeleteResponse { deleted: true }))
}

#[derive(Deserialize)]
struct ChunkQuery {
    #[serde(default)]
    offset: i64,
    limit: Option<i64>,
}

async fn handle_chunks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ChunkQuery>,
) -> Result<Json<ChunkPage>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_CHUNK_LIMIT);
    let page = get_chunks(state.sources.store().as_ref(), &id, query.offset, limit).await?;
    Ok(Json(page))
}

/// Streams the source as it is now, then every progress message published
/// for it. Lagged messages are skipped.
async fn handle_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Subscribe before reading the snapshot so nothing falls in between.
    let rx = state.pubsub.subscribe(&progress_topic(&id));
    let snapshot = get_source(state.sources.store().as_ref(), &id).await?;

    let first = Event::default()
        .event("source")
        .json_data(&snapshot)
        .unwrap_or_else(|_| Event::default().event("source"));
    let updates = BroadcastStream::new(rx).filter_map(|message| {
        let value = message.ok()?;
        Event::default().event("progress").json_data(value).ok()
    });
    let stream = tokio_stream::once(first).chain(updates).map(Ok);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
struct TextRequest {
    agent_id: String,
    #[serde(default)]
    project_id: String,
    title: String,
    text: String,
}

async fn handle_text(
    State(state): State<AppState>,
    Json(request): Json<TextRequest>,
) -> Result<(StatusCode, Json<SourceResponse>), AppError> {
    if request.agent_id.trim().is_empty() {
        return Err(bad_request("agent_id must not be empty"));
    }
    if request.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let source = state
        .sources
        .ingest_text(
            &request.agent_id,
            &request.project_id,
            &request.title,
            &request.text,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(source.into())))
}

#[derive(Deserialize)]
struct QaRequest {
    agent_id: String,
    #[serde(default)]
    project_id: String,
    question: String,
    answer: String,
}

async fn handle_qa(
    State(state): State<AppState>,
    Json(request): Json<QaRequest>,
) -> Result<(StatusCode, Json<SourceResponse>), AppError> {
    if request.agent_id.trim().is_empty() {
        return Err(bad_request("agent_id must not be empty"));
    }
    let source = state
        .sources
        .ingest_qa(
            &request.agent_id,
            &request.project_id,
            &request.question,
            &request.answer,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(source.into())))
}
