//! Index lifecycle manager
//!
//! Owns the active shard, the federation view over every live shard, and
//! the registry of open shard handles. Two hourly jobs keep it current:
//! rollover activates the shard for the new hour, and the retention sweep
//! evicts shards older than the retention window.
//!
//! Lock order is registry (async) then active (sync). The active reference
//! is only ever held for a swap or a clone, never across an await.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::error::{ShardError, ShardResult};
use super::federation::FederationView;
use super::shard::{discover_shards, shard_path, Shard};
use crate::config::IndexConfig;
use crate::daemon::scheduler::{CronScheduler, Job, Scheduler, SchedulerError, HOURLY};
use crate::types::LogRecord;

/// Time-sharded index with hourly rollover and age-based retention
pub struct IndexLifecycleManager {
    config: IndexConfig,
    active: RwLock<Option<Arc<Shard>>>,
    federation: Arc<FederationView>,
    /// Every open shard handle by name; serializes rollover, retention and
    /// recovery
    registry: Mutex<BTreeMap<String, Arc<Shard>>>,
    scheduler: Mutex<Option<Box<dyn Scheduler>>>,
}

impl IndexLifecycleManager {
    /// Open the active shard for the current hour, then recover every
    /// existing shard under the base prefix.
    pub async fn open(config: IndexConfig) -> ShardResult<Arc<Self>> {
        Self::open_at(config, Utc::now()).await
    }

    /// [`Self::open`] with an explicit clock
    pub async fn open_at(config: IndexConfig, now: DateTime<Utc>) -> ShardResult<Arc<Self>> {
        if let Some(parent) = config.base_prefix.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let manager = Arc::new(Self {
            config,
            active: RwLock::new(None),
            federation: Arc::new(FederationView::new()),
            registry: Mutex::new(BTreeMap::new()),
            scheduler: Mutex::new(None),
        });

        let active = manager.get_or_create_active_shard_at(now).await?;
        let recovered = manager.recover().await?;

        info!(
            active = %active.name(),
            recovered,
            shards = manager.federation.len(),
            "index lifecycle manager ready"
        );
        Ok(manager)
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Search surface spanning every live shard
    pub fn federation(&self) -> Arc<FederationView> {
        self.federation.clone()
    }

    /// Shard currently receiving writes, if any
    pub fn active_shard(&self) -> Option<Arc<Shard>> {
        self.active.read().clone()
    }

    /// Names of every shard held in the registry
    pub async fn registered_shards(&self) -> Vec<String> {
        self.registry.lock().await.keys().cloned().collect()
    }

    /// Return the active shard for the current hour, opening or creating it
    /// if needed.
    pub async fn get_or_create_active_shard(&self) -> ShardResult<Arc<Shard>> {
        self.get_or_create_active_shard_at(Utc::now()).await
    }

    pub async fn get_or_create_active_shard_at(
        &self,
        now: DateTime<Utc>,
    ) -> ShardResult<Arc<Shard>> {
        let mut registry = self.registry.lock().await;
        let path = shard_path(&self.config.base_prefix, now);
        let name = path.display().to_string();

        if let Some(active) = self.active_shard() {
            if active.name() == name && !active.is_closed() {
                return Ok(active);
            }
        }

        let shard = self.activate(&mut registry, path).await?;
        Ok(shard)
    }

    /// Open (or reuse) the shard at `path`, register it and publish it as
    /// the active shard. Caller holds the registry lock.
    async fn activate(
        &self,
        registry: &mut BTreeMap<String, Arc<Shard>>,
        path: PathBuf,
    ) -> ShardResult<Arc<Shard>> {
        let name = path.display().to_string();

        let shard = match registry.get(&name) {
            Some(existing) if !existing.is_closed() => existing.clone(),
            _ => {
                let shard = Shard::open_with_timeout(path, self.config.open_timeout()).await?;
                Arc::new(shard)
            }
        };

        registry.insert(name.clone(), shard.clone());
        self.federation.add(shard.clone());
        *self.active.write() = Some(shard.clone());

        info!(shard = %name, "active shard set");
        Ok(shard)
    }

    /// Reopen every shard directory under the base prefix not already
    /// registered. Recovered shards are past hours, so each is closed right
    /// after opening: it stays searchable without holding a writer. Busy or
    /// unreadable shards are skipped.
    async fn recover(&self) -> ShardResult<usize> {
        let mut registry = self.registry.lock().await;
        let prefix = self.config.base_prefix.clone();
        let paths = tokio::task::spawn_blocking(move || discover_shards(&prefix))
            .await
            .map_err(|e| ShardError::Task(e.to_string()))??;

        let mut recovered = 0;
        for path in paths {
            let name = path.display().to_string();
            if registry.contains_key(&name) {
                continue;
            }

            match Shard::open_with_timeout(path, self.config.open_timeout()).await {
                Ok(shard) => {
                    let shard = Arc::new(shard);
                    let closing = shard.clone();
                    let closed = tokio::task::spawn_blocking(move || closing.close())
                        .await
                        .map_err(|e| ShardError::Task(e.to_string()))?;
                    if let Err(e) = closed {
                        warn!(shard = %name, "failed to close recovered shard: {}", e);
                    }

                    registry.insert(name.clone(), shard.clone());
                    self.federation.add(shard);
                    recovered += 1;
                    debug!(shard = %name, "recovered shard");
                }
                Err(e) => warn!(shard = %name, "skipping shard during recovery: {}", e),
            }
        }

        Ok(recovered)
    }

    /// Index a record into the active shard, retrying up to the configured
    /// number of attempts. Returns false once retries are exhausted; the
    /// record is dropped.
    pub async fn index_with_retry(&self, record: &LogRecord) -> bool {
        let attempts = self.config.retry_attempts.max(1);
        let delay = self.config.retry_delay();

        for attempt in 1..=attempts {
            match self.try_index(record).await {
                Ok(id) => {
                    debug!(id = %id, attempt, "record indexed");
                    return true;
                }
                Err(e) if !e.is_transient() => {
                    error!(id = %record.document_id(), attempt, "dropping record: {}", e);
                    return false;
                }
                Err(e) => {
                    warn!(
                        id = %record.document_id(),
                        attempt,
                        attempts,
                        "indexing attempt failed: {}",
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(
            id = %record.document_id(),
            attempts,
            "giving up on record after exhausting retries"
        );
        false
    }

    /// One indexing attempt. The active reference is cloned and released
    /// immediately; a rollover that closes the shard afterwards makes this
    /// attempt fail with `Closed` instead of writing to a retired shard.
    async fn try_index(&self, record: &LogRecord) -> ShardResult<String> {
        let shard = self.active_shard().ok_or(ShardError::NoActiveShard)?;
        let record = record.clone();

        tokio::task::spawn_blocking(move || shard.index_record(&record))
            .await
            .map_err(|e| ShardError::Task(e.to_string()))?
    }

    /// Retire the active shard and activate the one for the current hour
    pub async fn rollover(&self) -> ShardResult<Arc<Shard>> {
        self.rollover_at(Utc::now()).await
    }

    /// Close the active shard, then open or create the shard for `now`'s
    /// hour. If the new shard cannot be opened the old one stays closed and
    /// there is no active shard until the next successful rollover.
    pub async fn rollover_at(&self, now: DateTime<Utc>) -> ShardResult<Arc<Shard>> {
        let mut registry = self.registry.lock().await;

        let retired = self.active.write().take();
        if let Some(old) = retired {
            let name = old.name().to_string();
            let closed = tokio::task::spawn_blocking(move || old.close())
                .await
                .map_err(|e| ShardError::Task(e.to_string()))?;
            match closed {
                Ok(()) => info!(shard = %name, "retired shard on rollover"),
                Err(e) => warn!(shard = %name, "failed to close shard on rollover: {}", e),
            }
        }

        let path = shard_path(&self.config.base_prefix, now);
        match self.activate(&mut registry, path).await {
            Ok(shard) => Ok(shard),
            Err(e) => {
                error!("rollover failed, no active shard until next rollover: {}", e);
                Err(e)
            }
        }
    }

    /// Evict every shard older than the retention window
    pub async fn sweep_retention(&self) -> ShardResult<Vec<String>> {
        self.sweep_retention_at(Utc::now()).await
    }

    /// Remove from the federation view, close, then delete storage, for each
    /// shard whose hour bucket is more than the retention window before
    /// `now`. Returns the names of evicted shards.
    pub async fn sweep_retention_at(&self, now: DateTime<Utc>) -> ShardResult<Vec<String>> {
        let mut registry = self.registry.lock().await;
        let retention = self.config.retention();
        let active_name = self.active_shard().map(|s| s.name().to_string());

        let expired: Vec<String> = registry
            .iter()
            .filter(|(name, shard)| {
                Some(name.as_str()) != active_name.as_deref() && now - shard.bucket() > retention
            })
            .map(|(name, _)| name.clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for name in expired {
            self.federation.remove(&name);

            let Some(shard) = registry.remove(&name) else {
                continue;
            };

            let result = tokio::task::spawn_blocking(move || {
                shard.close()?;
                shard.destroy()
            })
            .await
            .map_err(|e| ShardError::Task(e.to_string()))?;

            match result {
                Ok(()) => {
                    info!(shard = %name, "evicted shard past retention");
                    evicted.push(name);
                }
                Err(e) => error!(shard = %name, "failed to delete evicted shard: {}", e),
            }
        }

        Ok(evicted)
    }

    /// Register the hourly rollover and retention jobs on a cron scheduler
    /// and start it.
    pub async fn start_scheduler(self: &Arc<Self>) -> Result<(), SchedulerError> {
        self.start_scheduler_with(Box::new(CronScheduler::new()))
            .await
    }

    /// Register the hourly jobs on `scheduler` and start it. Jobs hold weak
    /// references so a running scheduler never keeps the manager alive.
    pub async fn start_scheduler_with(
        self: &Arc<Self>,
        mut scheduler: Box<dyn Scheduler>,
    ) -> Result<(), SchedulerError> {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let weak = Arc::downgrade(self);
        scheduler.schedule_recurring(HOURLY, rollover_job(weak.clone()))?;
        scheduler.schedule_recurring(HOURLY, retention_job(weak))?;
        scheduler.start();

        *slot = Some(scheduler);
        info!(cron = HOURLY, "rollover and retention jobs scheduled");
        Ok(())
    }

    /// Stop the recurring jobs. Shards are left open.
    pub async fn stop_scheduler(&self) {
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop().await;
        }
    }

    /// Close every registered shard. Shards stay in the federation view and
    /// remain searchable, but no further writes are accepted.
    pub async fn close_all(&self) -> ShardResult<()> {
        let registry = self.registry.lock().await;
        self.active.write().take();

        let shards: Vec<Arc<Shard>> = registry.values().cloned().collect();
        let count = shards.len();

        let result = tokio::task::spawn_blocking(move || {
            let mut first_err = None;
            for shard in shards {
                if let Err(e) = shard.close() {
                    warn!(shard = %shard.name(), "failed to close shard: {}", e);
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        })
        .await
        .map_err(|e| ShardError::Task(e.to_string()))?;

        info!(shards = count, "closed all shards");
        result
    }
}

fn rollover_job(manager: Weak<IndexLifecycleManager>) -> Job {
    Arc::new(move || {
        let manager = manager.clone();
        async move {
            if let Some(manager) = manager.upgrade() {
                // failure already logged inside rollover
                let _ = manager.rollover().await;
            }
        }
        .boxed()
    })
}

fn retention_job(manager: Weak<IndexLifecycleManager>) -> Job {
    Arc::new(move || {
        let manager = manager.clone();
        async move {
            if let Some(manager) = manager.upgrade() {
                match manager.sweep_retention().await {
                    Ok(evicted) if !evicted.is_empty() => {
                        info!(count = evicted.len(), "retention sweep evicted shards")
                    }
                    Ok(_) => debug!("retention sweep found nothing to evict"),
                    Err(e) => error!("retention sweep failed: {}", e),
                }
            }
        }
        .boxed()
    })
}
