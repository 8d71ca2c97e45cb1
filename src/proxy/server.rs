//! Sharding proxy HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::forward::{BackendResponse, ForwardRequest, SearchOutcome, ShardingProxy};

/// Build the proxy router: the same ingest and search paths as a backend
pub fn create_router(proxy: Arc<ShardingProxy>) -> Router {
    let api_v1 = Router::new()
        .route("/log/ingest", post(proxy_ingest))
        .route("/log/search", post(proxy_search))
        .with_state(proxy);

    Router::new()
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
}

fn forward_request(
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> ForwardRequest {
    ForwardRequest {
        method,
        path_and_query: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        headers,
        body,
        client_addr: connect_info.map(|ConnectInfo(addr)| addr),
    }
}

async fn proxy_ingest(
    State(proxy): State<Arc<ShardingProxy>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = forward_request(method, &uri, headers, body, connect_info);

    match proxy.ingest(request).await {
        Ok(response) => relay(response),
        Err(e) => {
            error!("Ingest forwarding failed: {}", e);
            (StatusCode::BAD_GATEWAY, "Error sending proxy request").into_response()
        }
    }
}

async fn proxy_search(
    State(proxy): State<Arc<ShardingProxy>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = forward_request(method, &uri, headers, body, connect_info);

    match proxy.search(request).await {
        SearchOutcome::Merged(results) => (StatusCode::OK, Json(results)).into_response(),
        SearchOutcome::Concatenated(body) => (StatusCode::OK, body).into_response(),
        SearchOutcome::AllFailed(backends) => {
            error!(?backends, "Search failed on backends");
            (
                StatusCode::BAD_GATEWAY,
                format!("Error sending proxy request to {}", backends.join(", ")),
            )
                .into_response()
        }
    }
}

/// Turn a buffered backend response into ours, status and headers intact
fn relay(backend: BackendResponse) -> Response {
    let mut response = Response::new(Body::from(backend.body));
    *response.status_mut() = backend.status;
    *response.headers_mut() = backend.headers;
    response.headers_mut().remove(header::CONTENT_LENGTH);
    response
}

/// Standalone proxy process
pub struct ProxyServer {
    listen_addr: String,
    proxy: Arc<ShardingProxy>,
}

impl ProxyServer {
    pub fn new(listen_addr: impl Into<String>, proxy: Arc<ShardingProxy>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            proxy,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self
            .listen_addr
            .parse()
            .context("Invalid proxy listen address")?;
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind proxy to {}", addr))
    }

    /// Serve until the shutdown signal fires
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let app = create_router(self.proxy)
            .into_make_service_with_connect_info::<SocketAddr>();

        if let Ok(addr) = listener.local_addr() {
            info!("Sharding proxy listening on http://{}", addr);
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("Sharding proxy shutting down");
            })
            .await
            .context("Proxy server error")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, SearchMode};
    use crate::proxy::ProxySearchResults;
    use crate::types::{HitFields, LogRecord, SearchHit, SearchResults};

    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Fake backend recording ingested bodies and answering searches with a
    /// single hit named after itself
    async fn spawn_backend(name: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
        let received: Arc<Mutex<Vec<String>>> = Arc::default();

        let ingest_log = received.clone();
        let app = Router::new()
            .route(
                "/api/v1/log/ingest",
                post(move |headers: HeaderMap, body: String| {
                    let ingest_log = ingest_log.clone();
                    async move {
                        assert!(headers.contains_key("x-forwarded-proto"));
                        ingest_log.lock().unwrap().push(body);
                        (StatusCode::OK, [("x-backend", name)], "OK")
                    }
                }),
            )
            .route(
                "/api/v1/log/search",
                post(move || async move {
                    let hit = SearchHit {
                        id: name.to_string(),
                        shard: format!("{name}-shard"),
                        score: 1.0,
                        fields: HitFields {
                            timestamp: chrono::Utc::now(),
                            level: "INFO".to_string(),
                            message: name.to_string(),
                        },
                    };
                    let mut results = SearchResults::merge(vec![hit], 10);
                    results.shards_searched = 1;
                    Json(results)
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), received)
    }

    fn proxy(backends: Vec<String>, mode: SearchMode) -> Arc<ShardingProxy> {
        let config = ProxyConfig {
            backends,
            search_mode: mode,
            request_timeout_secs: 5,
            ..Default::default()
        };
        Arc::new(ShardingProxy::new(&config).unwrap())
    }

    async fn post_json(router: Router, path: &str, body: String) -> Response {
        router
            .oneshot(
                axum::http::Request::post(path)
                    .header("content-type", "application/json")
                    .header("host", "proxy.test")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        use http_body_util::BodyExt;
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_ingest_reaches_exactly_the_owning_backend() {
        let (a, a_log) = spawn_backend("a").await;
        let (b, b_log) = spawn_backend("b").await;
        let proxy = proxy(vec![a.clone(), b.clone()], SearchMode::Merge);

        let record = LogRecord::new(chrono::Utc::now(), "INFO", "boot");
        let owner = proxy.route(&record).to_string();
        let body = serde_json::to_string(&record).unwrap();

        let response = post_json(create_router(proxy), "/api/v1/log/ingest", body.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let expected_name = if owner == a { "a" } else { "b" };
        assert_eq!(response.headers()["x-backend"], expected_name);

        let (owner_log, other_log) = if owner == a { (a_log, b_log) } else { (b_log, a_log) };
        assert_eq!(owner_log.lock().unwrap().as_slice(), &[body]);
        assert!(other_log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_merges_backends() {
        let (a, _) = spawn_backend("a").await;
        let (b, _) = spawn_backend("b").await;
        let router = create_router(proxy(vec![a, b], SearchMode::Merge));

        let response = post_json(router, "/api/v1/log/search", r#"{"query":"x"}"#.into()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let merged: ProxySearchResults = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(merged.results.total_hits, 2);
        assert_eq!(merged.results.shards_searched, 2);
        assert!(merged.failed_backends.is_empty());
    }

    #[tokio::test]
    async fn test_search_reports_unreachable_backend() {
        let (a, _) = spawn_backend("a").await;
        // nothing listens on port 9 on loopback
        let dead = "http://127.0.0.1:9".to_string();
        let router = create_router(proxy(vec![a, dead.clone()], SearchMode::Merge));

        let response = post_json(router, "/api/v1/log/search", r#"{"query":"x"}"#.into()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let merged: ProxySearchResults = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(merged.results.total_hits, 1);
        assert_eq!(merged.failed_backends, vec![dead]);
    }

    #[tokio::test]
    async fn test_concatenate_mode_writes_bodies_back_to_back() {
        let (a, _) = spawn_backend("a").await;
        let (b, _) = spawn_backend("b").await;
        let router = create_router(proxy(vec![a, b], SearchMode::Concatenate));

        let response = post_json(router, "/api/v1/log/search", r#"{"query":"x"}"#.into()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert_eq!(text.matches("\"total_hits\"").count(), 2);
    }

    #[tokio::test]
    async fn test_ingest_to_dead_backend_is_bad_gateway() {
        let router = create_router(proxy(vec!["http://127.0.0.1:9".into()], SearchMode::Merge));
        let response = post_json(router, "/api/v1/log/ingest", "{}".into()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
