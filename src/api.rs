//! HTTP surface for the chunk cursor.
//!
//! `GET /v1/enrich/:dataset?chunk=N` with `Authorization: Bearer <secret>` processes one chunk and
//! answers `{"processed": .., "nextChunk": ..}`. `GET /healthz` answers 200.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::chunk::{parse_chunk_index, ChunkCursor, ChunkOutcome};
use crate::enrich::Enrich;
use crate::error::{PipelineError, StoreError};
use crate::rate_limit::RateLimiter;
use crate::store::{Sink, Source};

/// Shared state behind the router.
#[derive(Clone)]
pub struct ApiState {
    enricher: Arc<dyn Enrich>,
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    secret: Arc<str>,
    chunk_size: usize,
    item_delay: Duration,
    limiter: Option<Arc<RateLimiter>>,
    // Chunk calls append to the sink; running two at once could interleave their records.
    chunk_lock: Arc<Mutex<()>>,
}

impl ApiState {
    /// Builds the state. Requests must present `secret` as a bearer token.
    pub fn new(
        enricher: Arc<dyn Enrich>,
        source: Arc<dyn Source>,
        sink: Arc<dyn Sink>,
        secret: impl Into<Arc<str>>,
        chunk_size: usize,
        item_delay: Duration,
    ) -> Self {
        Self {
            enricher,
            source,
            sink,
            secret: secret.into(),
            chunk_size,
            item_delay,
            limiter: None,
            chunk_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Throttles callers per client IP.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

#[derive(Debug, Deserialize)]
struct ChunkParams {
    chunk: Option<String>,
}

/// JSON error payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason.
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

/// Routes of the chunk API.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/enrich/:dataset", get(enrich_chunk))
        .with_state(state)
}

/// Serves the router on `listener` until the future is dropped.
pub async fn serve(listener: TcpListener, state: ApiState) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn enrich_chunk(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(dataset): Path<String>,
    Query(params): Query<ChunkParams>,
    headers: HeaderMap,
) -> Result<Json<ChunkOutcome>, ApiError> {
    if !authorized(&headers, &state.secret) {
        return Err(error(StatusCode::UNAUTHORIZED, "missing or invalid bearer token"));
    }
    if let Some(limiter) = &state.limiter {
        let decision = limiter.allow(&peer.ip().to_string()).await;
        if !decision.allowed {
            return Err(error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"));
        }
    }
    if !valid_dataset_name(&dataset) {
        return Err(error(StatusCode::BAD_REQUEST, "invalid dataset name"));
    }
    let chunk_index = parse_chunk_index(params.chunk.as_deref())
        .map_err(|err| error(StatusCode::BAD_REQUEST, err.to_string()))?;

    let _guard = state.chunk_lock.lock().await;
    let cursor = ChunkCursor::new(
        state.enricher.as_ref(),
        state.source.as_ref(),
        state.sink.as_ref(),
        state.chunk_size,
        state.item_delay,
    );
    match cursor.handle(&dataset, chunk_index).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(err) => {
            let status = status_for(&err);
            if status.is_server_error() {
                tracing::error!(dataset = %dataset, chunk = chunk_index, error = %err, "chunk failed");
            } else {
                tracing::warn!(dataset = %dataset, chunk = chunk_index, error = %err, "chunk rejected");
            }
            Err(error(status, err.to_string()))
        }
    }
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Store(StoreError::MissingDataset(_)) => StatusCode::NOT_FOUND,
        PipelineError::ChunkOutOfOrder { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn authorized(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .is_some_and(|token| !secret.is_empty() && token == secret)
}

fn valid_dataset_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}
