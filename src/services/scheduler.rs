//! In-process scheduler for deferred dispatch jobs.
//!
//! The job table is the only state shared between request handlers and the
//! firing worker. A job leaves the table exactly once, either through
//! `cancel` or by being taken as due, and both happen under the table lock.
//! Whoever removes the entry first wins and the other side sees nothing, so a
//! job's action runs at most once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinError, JoinSet};

use crate::error::{AppError, AppResult};
use crate::services::clock::Clock;

/// Deferred work run when a job fires.
pub type JobAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

pub struct ScheduledJob {
    pub job_id: i64,
    pub record_id: i64,
    pub run_at: DateTime<Utc>,
    action: JobAction,
}

impl std::fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("job_id", &self.job_id)
            .field("record_id", &self.record_id)
            .field("run_at", &self.run_at)
            .finish()
    }
}

pub struct JobScheduler {
    jobs: Mutex<HashMap<i64, ScheduledJob>>,
    wakeup: Notify,
    clock: Arc<dyn Clock>,
    max_idle: Duration,
}

impl JobScheduler {
    pub fn new(clock: Arc<dyn Clock>, max_idle: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
            clock,
            max_idle,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<i64, ScheduledJob>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `action` to run at or after `run_at`. The job id is the record id.
    pub fn schedule(&self, job_id: i64, run_at: DateTime<Utc>, action: JobAction) -> AppResult<()> {
        {
            let mut jobs = self.table();
            if jobs.contains_key(&job_id) {
                return Err(AppError::AlreadyScheduled(job_id));
            }
            jobs.insert(
                job_id,
                ScheduledJob {
                    job_id,
                    record_id: job_id,
                    run_at,
                    action,
                },
            );
        }

        tracing::debug!("Job {} queued for {}", job_id, run_at);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Drop a queued job. Returns `false` if it is unknown or has already fired.
    pub fn cancel(&self, job_id: i64) -> bool {
        let removed = self.table().remove(&job_id).is_some();
        if removed {
            tracing::debug!("Job {} removed from scheduler", job_id);
        }
        removed
    }

    pub fn is_queued(&self, job_id: i64) -> bool {
        self.table().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Remove and return every job due at `now`.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        let mut jobs = self.table();
        let due: Vec<i64> = jobs
            .values()
            .filter(|job| job.run_at <= now)
            .map(|job| job.job_id)
            .collect();
        due.into_iter().filter_map(|id| jobs.remove(&id)).collect()
    }

    fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.table().values().map(|job| job.run_at).min()
    }

    /// Spawn the firing worker. It runs until `shutdown` fires.
    ///
    /// Each due job runs in its own task, so a slow backend only delays that job.
    /// On shutdown the worker stops firing and waits for jobs already running,
    /// so the returned handle resolves only once in-flight deliveries are done.
    pub fn start(
        self: &Arc<Self>,
        shutdown: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        let mut shutdown_rx = shutdown.subscribe();

        tokio::spawn(async move {
            tracing::info!("Job scheduler started");
            let mut in_flight = JoinSet::new();
            loop {
                let now = scheduler.clock.now();
                for job in scheduler.take_due(now) {
                    tracing::info!(
                        "Firing job {} for notification {} (run_at={})",
                        job.job_id,
                        job.record_id,
                        job.run_at
                    );
                    in_flight.spawn((job.action)());
                }

                let wait = match scheduler.next_run_at() {
                    Some(at) => (at - scheduler.clock.now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(scheduler.max_idle),
                    None => scheduler.max_idle,
                };

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!(
                            "Job scheduler shutting down with {} job(s) still queued and {} running",
                            scheduler.len(),
                            in_flight.len()
                        );
                        break;
                    }
                    Some(res) = in_flight.join_next(), if !in_flight.is_empty() => {
                        log_job_exit(res);
                    }
                    _ = scheduler.wakeup.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            while let Some(res) = in_flight.join_next().await {
                log_job_exit(res);
            }
            tracing::info!("Job scheduler stopped");
        })
    }
}

fn log_job_exit(res: Result<(), JoinError>) {
    if let Err(e) = res {
        tracing::error!("Scheduled job task failed: {}", e);
    }
}
