//! Recurring job scheduler with cron support
//!
//! Each scheduled job runs in its own tokio task that sleeps until the next
//! fire time of its cron expression. Expressions use the six-field form
//! (`sec min hour day month weekday`), e.g. `0 0 * * * *` for the top of
//! every hour.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cron expression firing at the top of every hour
pub const HOURLY: &str = "0 0 * * * *";

/// A recurring unit of work
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("Scheduler already started")]
    AlreadyStarted,
}

/// Capability for running recurring jobs
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register a job. Jobs registered after `start` are rejected.
    fn schedule_recurring(&mut self, cron_expr: &str, job: Job) -> Result<(), SchedulerError>;

    /// Launch every registered job
    fn start(&mut self);

    /// Stop all jobs and wait for their tasks to exit
    async fn stop(&mut self);
}

struct ScheduledJob {
    expr: String,
    schedule: Schedule,
    job: Job,
}

/// [`Scheduler`] backed by the `cron` crate and tokio timers
pub struct CronScheduler {
    jobs: Vec<ScheduledJob>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CronScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            jobs: Vec::new(),
            handles: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl Scheduler for CronScheduler {
    fn schedule_recurring(&mut self, cron_expr: &str, job: Job) -> Result<(), SchedulerError> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let schedule =
            Schedule::from_str(cron_expr).map_err(|e| SchedulerError::InvalidSchedule {
                expr: cron_expr.to_string(),
                reason: e.to_string(),
            })?;

        debug!(cron = %cron_expr, "scheduled recurring job");
        self.jobs.push(ScheduledJob {
            expr: cron_expr.to_string(),
            schedule,
            job,
        });
        Ok(())
    }

    fn start(&mut self) {
        if self.is_running() {
            return;
        }

        for scheduled in &self.jobs {
            let schedule = scheduled.schedule.clone();
            let expr = scheduled.expr.clone();
            let job = scheduled.job.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            self.handles.push(tokio::spawn(async move {
                loop {
                    let Some(next) = schedule.upcoming(Utc).next() else {
                        warn!(cron = %expr, "schedule has no upcoming fire time, stopping job");
                        break;
                    };
                    let wait = (next - Utc::now()).to_std().unwrap_or_default();

                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            debug!(cron = %expr, "running scheduled job");
                            job().await;
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        info!(jobs = self.jobs.len(), "scheduler started");
    }

    async fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }

        let _ = self.shutdown_tx.send(());
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("scheduled job task failed: {}", e);
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_job(counter: Arc<AtomicUsize>) -> Job {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let mut scheduler = CronScheduler::new();
        let err = scheduler
            .schedule_recurring("not a cron", counting_job(Arc::default()))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
        assert_eq!(scheduler.job_count(), 0);
    }

    #[test]
    fn test_hourly_expression_parses() {
        let mut scheduler = CronScheduler::new();
        scheduler
            .schedule_recurring(HOURLY, counting_job(Arc::default()))
            .unwrap();
        assert_eq!(scheduler.job_count(), 1);
    }

    #[tokio::test]
    async fn test_every_second_job_fires_and_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = CronScheduler::new();
        scheduler
            .schedule_recurring("* * * * * *", counting_job(counter.clone()))
            .unwrap();

        scheduler.start();
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.stop().await;

        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1, "job fired {fired} times");

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), fired);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_schedule_after_start_is_rejected() {
        let mut scheduler = CronScheduler::new();
        scheduler
            .schedule_recurring(HOURLY, counting_job(Arc::default()))
            .unwrap();
        scheduler.start();

        let err = scheduler
            .schedule_recurring(HOURLY, counting_job(Arc::default()))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyStarted));
        scheduler.stop().await;
    }
}
