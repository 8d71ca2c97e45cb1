//! HTTP API Request Handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use tracing::{debug, error, warn};

use crate::daemon::processor::LogProcessor;
use crate::index::IndexLifecycleManager;
use crate::query::SearchFederation;
use crate::queue::Queue;
use crate::types::{LogRecord, SearchQuery};

use super::types::*;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn Queue>,
    pub ilm: Arc<IndexLifecycleManager>,
    pub search: SearchFederation,
    pub processor: Arc<LogProcessor>,
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Accept a log record for asynchronous indexing. Always answers `200 OK`;
/// a malformed body is logged and a zero-value record is queued in its place.
pub async fn ingest(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let record: LogRecord = serde_json::from_slice(&body).unwrap_or_else(|e| {
        warn!("Cannot decode log record: {}", e);
        LogRecord::default()
    });

    debug!(id = %record.document_id(), level = %record.level, "ingest");
    if let Err(e) = state.queue.enqueue(record).await {
        error!("Failed to enqueue log record: {}", e);
    }

    (StatusCode::OK, "OK")
}

/// Free-text search across every live shard
pub async fn search(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let query: SearchQuery = serde_json::from_slice(&body).unwrap_or_else(|e| {
        warn!("Cannot decode search query: {}", e);
        SearchQuery::new("")
    });

    let results = match state.search.search_with_query(&query).await {
        Ok(results) => results,
        Err(e) => {
            error!(query = %query.query, "Search failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("search failed: {}", e))
                .into_response();
        }
    };

    match serde_json::to_string(&results) {
        Ok(json) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode search results: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode results: {}", e),
            )
                .into_response()
        }
    }
}

/// Delete documents older than the retention window from the active shard
pub async fn delete_expired(State(state): State<AppState>) -> impl IntoResponse {
    let retention = state.ilm.config().retention();

    match state.search.delete_expired(retention).await {
        Ok(deleted) => (StatusCode::OK, Json(DeleteResponse { deleted })).into_response(),
        Err(e) => {
            error!("Delete of expired documents failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("delete failed: {}", e)).into_response()
        }
    }
}

/// Shard and processor status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        active_shard: state.ilm.active_shard().map(|s| s.name().to_string()),
        shards: state.ilm.federation().shard_names(),
        retention_hours: state.ilm.config().retention_hours,
        processor: state.processor.stats(),
    })
}
