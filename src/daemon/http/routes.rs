//! HTTP API Route Definitions

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers::{self, AppState};

/// Create the API router with all routes
pub fn create_router(app_state: AppState) -> Router {
    let api_v1 = Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/log/ingest", post(handlers::ingest))
        .route("/log/search", post(handlers::search))
        .route("/log/delete", delete(handlers::delete_expired))
        .with_state(app_state);

    Router::new()
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::config::IndexConfig;
    use crate::daemon::http::types::{DeleteResponse, StatusResponse};
    use crate::daemon::processor::LogProcessor;
    use crate::index::IndexLifecycleManager;
    use crate::query::SearchFederation;
    use crate::queue::{ChannelQueue, Queue};
    use crate::types::{LogRecord, SearchResults};

    async fn state(dir: &TempDir) -> (AppState, Arc<ChannelQueue>) {
        let config = IndexConfig {
            base_prefix: dir.path().join("index"),
            retry_delay_ms: 10,
            ..Default::default()
        };
        let ilm = IndexLifecycleManager::open(config).await.unwrap();
        let queue = Arc::new(ChannelQueue::new(16));
        let processor = Arc::new(LogProcessor::new(queue.clone(), ilm.clone(), 4));
        let state = AppState {
            queue: queue.clone(),
            search: SearchFederation::new(ilm.clone()),
            ilm,
            processor,
        };
        (state, queue)
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_health() {
        let temp_dir = TempDir::new().unwrap();
        let (state, _) = state(&temp_dir).await;
        let response = create_router(state)
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ingest_enqueues_and_answers_ok() {
        let temp_dir = TempDir::new().unwrap();
        let (state, queue) = state(&temp_dir).await;

        let body = r#"{"timestamp":"2024-01-01T10:30:00Z","level":"INFO","message":"boot"}"#;
        let response = create_router(state)
            .oneshot(
                Request::post("/api/v1/log/ingest")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"OK");
        assert_eq!(queue.dequeue().await.unwrap().record.message, "boot");
    }

    #[tokio::test]
    async fn test_malformed_ingest_is_still_ok() {
        let temp_dir = TempDir::new().unwrap();
        let (state, queue) = state(&temp_dir).await;

        let response = create_router(state)
            .oneshot(Request::post("/api/v1/log/ingest").body(Body::from("{not json")).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.dequeue().await.unwrap().record, LogRecord::default());
    }

    #[tokio::test]
    async fn test_search_returns_results_json() {
        let temp_dir = TempDir::new().unwrap();
        let (state, _) = state(&temp_dir).await;
        state
            .ilm
            .index_with_retry(&LogRecord::new(chrono::Utc::now(), "INFO", "boot"))
            .await;

        let response = create_router(state)
            .oneshot(
                Request::post("/api/v1/log/search")
                    .body(Body::from(r#"{"query":"boot"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let results: SearchResults = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(results.total_hits, 1);
        assert_eq!(results.hits[0].fields.message, "boot");
    }

    #[tokio::test]
    async fn test_oversized_search_size_is_clamped() {
        let temp_dir = TempDir::new().unwrap();
        let (state, _) = state(&temp_dir).await;
        let now = chrono::Utc::now();
        for n in 0..3 {
            let record = LogRecord::new(now + chrono::Duration::milliseconds(n), "INFO", "boot");
            state.ilm.index_with_retry(&record).await;
        }

        let response = create_router(state)
            .oneshot(
                Request::post("/api/v1/log/search")
                    .body(Body::from(r#"{"query":"boot","size":4000000000}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let results: SearchResults = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(results.total_hits, 3);
        assert_eq!(results.hits.len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_query_is_500_plain_text() {
        let temp_dir = TempDir::new().unwrap();
        let (state, _) = state(&temp_dir).await;

        let response = create_router(state)
            .oneshot(
                Request::post("/api/v1/log/search")
                    .body(Body::from(r#"{"query":"message:("}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.starts_with("search failed"));
    }

    #[tokio::test]
    async fn test_delete_reports_count() {
        let temp_dir = TempDir::new().unwrap();
        let (state, _) = state(&temp_dir).await;
        let ancient = chrono::Utc::now() - chrono::Duration::days(60);
        state
            .ilm
            .index_with_retry(&LogRecord::new(ancient, "INFO", "ancient"))
            .await;

        let response = create_router(state)
            .oneshot(Request::delete("/api/v1/log/delete").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: DeleteResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body.deleted, 1);
    }

    #[tokio::test]
    async fn test_status_lists_active_shard() {
        let temp_dir = TempDir::new().unwrap();
        let (state, _) = state(&temp_dir).await;

        let response = create_router(state)
            .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status: StatusResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(status.active_shard.is_some());
        assert_eq!(status.shards.len(), 1);
    }
}
