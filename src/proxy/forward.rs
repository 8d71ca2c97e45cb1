//! Request forwarding to backend instances

use std::net::SocketAddr;
use std::time::Instant;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, SearchMode};
use crate::routing::{RoutingError, ShardingRing};
use crate::types::{LogRecord, SearchQuery, SearchResults, DEFAULT_SEARCH_SIZE};

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers never copied between hops
const HOP_HEADERS: [HeaderName; 4] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Backend {backend} unreachable: {source}")]
    Backend {
        backend: String,
        #[source]
        source: reqwest::Error,
    },
}

/// An incoming request as seen by the proxy
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path plus query string, e.g. `/api/v1/log/ingest`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: Option<SocketAddr>,
}

/// A backend response, buffered
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Merged broadcast search result plus the backends that did not answer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySearchResults {
    #[serde(flatten)]
    pub results: SearchResults,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_backends: Vec<String>,
}

/// Outcome of a broadcast search
#[derive(Debug)]
pub enum SearchOutcome {
    Merged(ProxySearchResults),
    Concatenated(Bytes),
    /// No backend produced a usable response
    AllFailed(Vec<String>),
}

/// Routes ingest to one backend and fans search out to all of them
pub struct ShardingProxy {
    ring: ShardingRing,
    client: reqwest::Client,
    mode: SearchMode,
}

impl ShardingProxy {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let ring = ShardingRing::new(&config.backends, config.virtual_nodes)?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(ProxyError::Client)?;

        info!(
            backends = ring.backends().len(),
            virtual_nodes = ring.virtual_nodes(),
            mode = ?config.search_mode,
            "sharding proxy ready"
        );
        Ok(Self {
            ring,
            client,
            mode: config.search_mode,
        })
    }

    pub fn ring(&self) -> &ShardingRing {
        &self.ring
    }

    pub fn search_mode(&self) -> SearchMode {
        self.mode
    }

    /// Backend owning a record
    pub fn route(&self, record: &LogRecord) -> &str {
        self.ring.get_node(&record.routing_key())
    }

    /// Forward an ingest request to the backend owning its record. A body
    /// that does not decode routes as the zero-value record.
    pub async fn ingest(&self, request: ForwardRequest) -> Result<BackendResponse, ProxyError> {
        let record: LogRecord = serde_json::from_slice(&request.body).unwrap_or_else(|e| {
            warn!("Cannot decode log record for routing: {}", e);
            LogRecord::default()
        });
        let backend = self.route(&record).to_string();
        debug!(backend = %backend, key = %record.routing_key(), "routing ingest");

        self.forward(&backend, &request).await
    }

    /// Send the search request to every backend concurrently and combine
    /// the answers according to the configured mode.
    pub async fn search(&self, request: ForwardRequest) -> SearchOutcome {
        let started = Instant::now();
        let backends = self.ring.backends();

        let responses = join_all(backends.iter().map(|b| self.forward(b, &request))).await;

        match self.mode {
            SearchMode::Merge => {
                let size = serde_json::from_slice::<SearchQuery>(&request.body)
                    .map(|q| q.limit())
                    .unwrap_or(DEFAULT_SEARCH_SIZE);
                merge_responses(backends, responses, size, started)
            }
            SearchMode::Concatenate => concatenate_responses(backends, responses),
        }
    }

    async fn forward(
        &self,
        backend: &str,
        request: &ForwardRequest,
    ) -> Result<BackendResponse, ProxyError> {
        let url = format!("{}{}", backend.trim_end_matches('/'), request.path_and_query);
        let headers = forwarded_headers(&request.headers, request.client_addr);

        let response = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|source| ProxyError::Backend {
                backend: backend.to_string(),
                source,
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        for name in &HOP_HEADERS {
            headers.remove(name);
        }
        let body = response.bytes().await.map_err(|source| ProxyError::Backend {
            backend: backend.to_string(),
            source,
        })?;

        debug!(backend = %backend, status = %status, bytes = body.len(), "backend responded");
        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }
}

/// Copy client headers minus hop headers, then append `X-Forwarded-*`
fn forwarded_headers(incoming: &HeaderMap, client_addr: Option<SocketAddr>) -> HeaderMap {
    let mut headers = incoming.clone();
    for name in &HOP_HEADERS {
        headers.remove(name);
    }

    if let Some(host) = incoming.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    if let Some(addr) = client_addr {
        let ip = addr.ip().to_string();
        let chain = match incoming.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
            _ => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    headers
}

fn merge_responses(
    backends: &[String],
    responses: Vec<Result<BackendResponse, ProxyError>>,
    size: usize,
    started: Instant,
) -> SearchOutcome {
    let mut hits = Vec::new();
    let mut shards_searched = 0;
    let mut failed_backends = Vec::new();

    for (backend, response) in backends.iter().zip(responses) {
        let parsed = match response {
            Ok(r) if r.status.is_success() => {
                serde_json::from_slice::<SearchResults>(&r.body).map_err(|e| e.to_string())
            }
            Ok(r) => Err(format!("status {}", r.status)),
            Err(e) => Err(e.to_string()),
        };

        match parsed {
            Ok(results) => {
                shards_searched += results.shards_searched;
                hits.extend(results.hits);
            }
            Err(reason) => {
                warn!(backend = %backend, "backend search failed: {}", reason);
                failed_backends.push(backend.clone());
            }
        }
    }

    if failed_backends.len() == backends.len() {
        return SearchOutcome::AllFailed(failed_backends);
    }

    let mut results = SearchResults::merge(hits, size);
    results.shards_searched = shards_searched;
    results.took_ms = started.elapsed().as_millis() as u64;

    SearchOutcome::Merged(ProxySearchResults {
        results,
        failed_backends,
    })
}

/// Raw bodies back to back. Any unreachable backend fails the whole request.
fn concatenate_responses(
    backends: &[String],
    responses: Vec<Result<BackendResponse, ProxyError>>,
) -> SearchOutcome {
    let mut body = Vec::new();
    let mut failed = Vec::new();

    for (backend, response) in backends.iter().zip(responses) {
        match response {
            Ok(r) => body.extend_from_slice(&r.body),
            Err(e) => {
                warn!(backend = %backend, "backend search failed: {}", e);
                failed.push(backend.clone());
            }
        }
    }

    if failed.is_empty() {
        SearchOutcome::Concatenated(Bytes::from(body))
    } else {
        SearchOutcome::AllFailed(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HitFields, SearchHit};

    fn results(ids: &[(&str, f32)]) -> BackendResponse {
        let hits = ids
            .iter()
            .map(|(id, score)| SearchHit {
                id: id.to_string(),
                shard: "s".to_string(),
                score: *score,
                fields: HitFields {
                    timestamp: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
                    level: "INFO".to_string(),
                    message: id.to_string(),
                },
            })
            .collect::<Vec<_>>();
        let mut body = SearchResults::merge(hits, 10);
        body.shards_searched = 1;
        BackendResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    #[test]
    fn test_forwarded_headers() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, HeaderValue::from_static("proxy.local:8256"));
        incoming.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        incoming.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.1.1.1"));
        incoming.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let addr: SocketAddr = "192.168.0.7:5555".parse().unwrap();
        let headers = forwarded_headers(&incoming, Some(addr));

        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(headers[X_FORWARDED_HOST], "proxy.local:8256");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
        assert_eq!(headers[X_FORWARDED_FOR], "10.1.1.1, 192.168.0.7");
    }

    #[test]
    fn test_merge_dedups_and_reports_failures() {
        let backends = vec!["http://a".to_string(), "http://b".to_string(), "http://c".to_string()];
        let down = BackendResponse {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"search failed"),
        };
        let responses = vec![
            Ok(results(&[("x", 0.5), ("y", 0.2)])),
            Ok(results(&[("x", 0.9)])),
            Ok(down),
        ];

        let SearchOutcome::Merged(merged) = merge_responses(&backends, responses, 10, Instant::now())
        else {
            panic!("expected merged results");
        };
        assert_eq!(merged.results.total_hits, 2);
        assert_eq!(merged.results.hits[0].id, "x");
        assert_eq!(merged.results.hits[0].score, 0.9);
        assert_eq!(merged.results.shards_searched, 2);
        assert_eq!(merged.failed_backends, vec!["http://c".to_string()]);
    }

    #[test]
    fn test_merge_all_failed() {
        let backends = vec!["http://a".to_string()];
        let responses = vec![Ok(BackendResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"not json"),
        })];
        assert!(matches!(
            merge_responses(&backends, responses, 10, Instant::now()),
            SearchOutcome::AllFailed(_)
        ));
    }

    #[test]
    fn test_concatenate_preserves_raw_bodies() {
        let backends = vec!["http://a".to_string(), "http://b".to_string()];
        let body = |s: &'static str| BackendResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(s.as_bytes()),
        };
        let SearchOutcome::Concatenated(bytes) =
            concatenate_responses(&backends, vec![Ok(body("{\"a\":1}")), Ok(body("{\"b\":2}"))])
        else {
            panic!("expected concatenation");
        };
        assert_eq!(&bytes[..], b"{\"a\":1}{\"b\":2}");
    }

    #[test]
    fn test_failed_backends_omitted_when_empty() {
        let json = serde_json::to_value(ProxySearchResults::default()).unwrap();
        assert!(json.get("failed_backends").is_none());
        assert!(json.get("total_hits").is_some());
    }
}
