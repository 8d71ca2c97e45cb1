//! Daemon Lifecycle Management
//!
//! Wires the index, queue, processor and HTTP API together, waits for a
//! shutdown signal, then tears everything down in order under one deadline.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::Config;
use crate::index::IndexLifecycleManager;
use crate::query::SearchFederation;
use crate::queue::{self, Queue};

use super::http::{AppState, HttpServer};
use super::processor::LogProcessor;

/// Running application instance
pub struct Daemon {
    config: Config,
    ilm: Arc<IndexLifecycleManager>,
    queue: Arc<dyn Queue>,
    processor: Arc<LogProcessor>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Open the index, start the hourly jobs, connect the queue and start
    /// the processor. A scheduler failure is fatal.
    pub async fn start(config: Config) -> Result<Self> {
        info!("Starting logfed daemon");

        let ilm = IndexLifecycleManager::open(config.index.clone())
            .await
            .context("Failed to open index")?;

        ilm.start_scheduler()
            .await
            .context("Failed to start rollover and retention scheduler")?;

        let queue = queue::connect(&config.queue)
            .await
            .context("Failed to connect ingest queue")?;

        let processor = Arc::new(LogProcessor::new(
            queue.clone(),
            ilm.clone(),
            config.processor.max_concurrency,
        ));
        processor.start();

        let (shutdown_tx, _) = broadcast::channel(16);

        info!(
            base_prefix = %config.index.base_prefix.display(),
            retention_hours = config.index.retention_hours,
            "Daemon initialized"
        );

        Ok(Self {
            config,
            ilm,
            queue,
            processor,
            shutdown_tx,
        })
    }

    pub fn index(&self) -> Arc<IndexLifecycleManager> {
        self.ilm.clone()
    }

    pub fn queue(&self) -> Arc<dyn Queue> {
        self.queue.clone()
    }

    pub fn processor(&self) -> Arc<LogProcessor> {
        self.processor.clone()
    }

    /// State shared by the HTTP handlers
    pub fn app_state(&self) -> AppState {
        AppState {
            queue: self.queue.clone(),
            ilm: self.ilm.clone(),
            search: SearchFederation::new(self.ilm.clone()),
            processor: self.processor.clone(),
        }
    }

    /// Ask a running daemon to shut down
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Serve the HTTP API until Ctrl+C, SIGTERM or [`Self::request_shutdown`],
    /// then shut down.
    pub async fn run(&self) -> Result<()> {
        let server = HttpServer::new(self.config.http.clone(), self.app_state());
        let listener = server.bind().await?;

        let mut requested = self.shutdown_tx.subscribe();
        let http_shutdown = self.shutdown_tx.subscribe();
        let mut http_handle = tokio::spawn(server.serve(listener, http_shutdown));

        info!("Daemon running");

        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
            _ = wait_for_sigterm() => info!("Received SIGTERM, shutting down"),
            _ = requested.recv() => info!("Shutdown requested"),
            result = &mut http_handle => {
                // the server exited on its own; still run the rest of shutdown
                match result {
                    Ok(Ok(())) => info!("HTTP server stopped"),
                    Ok(Err(e)) => error!("HTTP server failed: {:#}", e),
                    Err(e) => error!("HTTP server task failed: {}", e),
                }
                return self.shutdown(None).await;
            }
        }

        self.shutdown(Some(http_handle)).await
    }

    /// Staged shutdown: stop HTTP, stop the scheduler, close the queue,
    /// drain the processor, close every shard. All stages share one deadline;
    /// missing it fails with the name of the stage that was still running.
    pub async fn shutdown(
        &self,
        http_handle: Option<tokio::task::JoinHandle<Result<()>>>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.config.http.shutdown_deadline();
        info!(
            deadline_secs = self.config.http.shutdown_deadline_secs,
            "Shutting down daemon"
        );

        let _ = self.shutdown_tx.send(());
        if let Some(handle) = http_handle {
            match stage("stopping the HTTP server", deadline, handle).await? {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("HTTP server error during shutdown: {:#}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
            }
        }

        stage("stopping the scheduler", deadline, self.ilm.stop_scheduler()).await?;
        stage("closing the queue", deadline, self.queue.close()).await?;
        stage("draining the processor", deadline, self.processor.shutdown()).await?;
        stage("closing shards", deadline, self.ilm.close_all())
            .await?
            .context("Failed to close shards")?;

        info!("Daemon shutdown complete");
        Ok(())
    }
}

async fn stage<F: Future>(name: &'static str, deadline: Instant, fut: F) -> Result<F::Output> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| anyhow!("shutdown deadline exceeded while {}", name))
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
