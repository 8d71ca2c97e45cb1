//! HTTP API Server Module
//!
//! Ingest, search and cleanup endpoints under `/api/v1`.

pub mod handlers;
pub mod routes;
pub mod server;
pub mod types;

pub use handlers::AppState;
pub use routes::create_router;
pub use server::HttpServer;
