use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::{Result, WorkflowError};
use crate::executor::job::{apply_timer_ops, Job, JobAction, JobStore};
use crate::executor::lock::LockService;
use crate::executor::retry::RetryPolicy;
use crate::executor::store::InstanceStore;
use crate::runtime::engine::Engine;

/// Outcome of one job transaction.
enum JobOutcome {
    Completed,
    /// The job succeeded logically but the worker had held the lock past
    /// max_lock_time, so nothing was committed; the job stays due.
    RolledBack,
}

/// Distributed job executor: a fixed pool of worker loops coordinated
/// through one named, TTL-bounded advisory lock. Each cycle refreshes or
/// acquires the lock inside a retrying transaction, and each due job runs in
/// its own retrying transaction as the identity bound to its task.
pub struct JobExecutor {
    config: ExecutorConfig,
    engine: Arc<Engine>,
    instances: Arc<dyn InstanceStore>,
    jobs: Arc<dyn JobStore>,
    locks: Arc<dyn LockService>,
    retry: RetryPolicy,
    shutdown: watch::Sender<bool>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    pub fn new(
        config: ExecutorConfig,
        engine: Arc<Engine>,
        instances: Arc<dyn InstanceStore>,
        jobs: Arc<dyn JobStore>,
        locks: Arc<dyn LockService>,
    ) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy {
            max_attempts: config.max_attempts,
            ..RetryPolicy::default()
        };
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            engine,
            instances,
            jobs,
            locks,
            retry,
            shutdown,
            handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawns the worker pool.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        for index in 0..self.config.workers {
            let executor = self.clone();
            let rx = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                executor.worker_loop(index, rx).await;
            }));
        }
        info!(workers = self.config.workers, "job executor started");
    }

    /// Graceful shutdown: signals every worker and waits for it to finish
    /// its current cycle.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!("job executor stopped");
    }

    async fn worker_loop(&self, index: usize, mut rx: watch::Receiver<bool>) {
        // Holder ids must be unique cluster-wide, not just per process.
        let worker = format!("worker-{}-{}", index, Uuid::new_v4());
        let mut holds_lock = false;
        info!(worker = %worker, "executor worker started");

        loop {
            if *rx.borrow() {
                break;
            }
            let processed = match self.run_cycle(&worker, &mut holds_lock).await {
                Ok(count) => count,
                Err(e) => {
                    error!(worker = %worker, error = %e, "executor cycle failed");
                    0
                }
            };
            if processed == 0 {
                tokio::select! {
                    _ = rx.changed() => {}
                    _ = tokio::time::sleep(self.config.idle_interval) => {}
                }
            }
        }

        if holds_lock {
            let _ = self.locks.release(&self.config.lock_name, &worker).await;
        }
        info!(worker = %worker, "executor worker stopped");
    }

    /// One worker iteration. Refreshes the lock when held, otherwise tries a
    /// fresh acquisition; a busy lock skips the cycle without side effects.
    /// An empty due-job batch releases the lock immediately, bounding the
    /// contention window.
    pub async fn run_cycle(&self, worker: &str, holds_lock: &mut bool) -> Result<usize> {
        let name = self.config.lock_name.as_str();
        let ttl = self.config.lock_ttl;

        if self.config.lock_enabled {
            let held = if *holds_lock {
                self.retry
                    .run(|| self.locks.refresh(name, worker, ttl))
                    .await?
            } else {
                false
            };
            let acquired = held
                || self
                    .retry
                    .run(|| self.locks.try_acquire(name, worker, ttl))
                    .await?;
            if !acquired {
                *holds_lock = false;
                debug!(worker = %worker, lock = %name, "advisory lock busy; skipping cycle");
                return Ok(0);
            }
            *holds_lock = true;
        }

        let cycle_started = Instant::now();
        let due = self
            .retry
            .run(|| self.jobs.due_jobs(Utc::now(), self.config.batch_size))
            .await?;
        if due.is_empty() {
            if self.config.lock_enabled && *holds_lock {
                self.locks.release(name, worker).await?;
                *holds_lock = false;
                debug!(worker = %worker, lock = %name, "no due jobs; released advisory lock");
            }
            return Ok(0);
        }

        let mut processed = 0usize;
        for job in &due {
            match self
                .retry
                .run(|| self.execute_job(job, cycle_started))
                .await
            {
                Ok(JobOutcome::Completed) => processed += 1,
                Ok(JobOutcome::RolledBack) => {
                    warn!(
                        job = %job.id,
                        "lock held past max_lock_time; job rolled back for a later cycle"
                    );
                }
                Err(e) if e.is_conflict() => {
                    // Another worker already completed this unit of work.
                    debug!(job = %job.id, "dropping job after optimistic collision");
                }
                Err(e) if e.is_store_failure() => {
                    error!(job = %job.id, error = %e, "persistence failure during job execution");
                    return Err(e);
                }
                Err(e) => {
                    error!(job = %job.id, error = %e, "job execution failed");
                    self.record_failure(job, &e).await;
                }
            }
        }
        Ok(processed)
    }

    /// One job in its own retrying transaction, executed as the identity
    /// bound to the job's task (or the system identity). On logical success
    /// the job record is deleted, or rescheduled when it repeats.
    async fn execute_job(&self, job: &Job, cycle_started: Instant) -> Result<JobOutcome> {
        let (mut instance, version) = self
            .instances
            .load(job.instance)
            .await?
            .ok_or(WorkflowError::UnknownInstance(job.instance))?;

        let identity = job
            .task
            .and_then(|task| instance.task(task).ok().and_then(|t| t.owner.clone()))
            .unwrap_or_else(|| self.config.system_identity.clone());
        let span = tracing::info_span!("job", job = %job.id, identity = %identity);

        match &job.action {
            JobAction::SignalToken { transition } => {
                let _guard = span.enter();
                self.engine.context.runner.run_as(&identity, &mut || {
                    self.engine
                        .signal(&mut instance, job.token, transition.as_deref())
                })?;
            }
        }

        // Retrospective safety margin: the job ran to completion, but
        // committing after holding the lock this long would starve the other
        // workers, so nothing is persisted and the job stays due.
        if self.config.lock_enabled && cycle_started.elapsed() > self.config.max_lock_time {
            return Ok(JobOutcome::RolledBack);
        }

        apply_timer_ops(self.jobs.as_ref(), &mut instance).await?;
        self.instances.save(instance, version).await?;

        if let Some(repeat) = job.repeat_secs {
            let mut next = job.clone();
            next.due = Utc::now() + chrono::Duration::seconds(repeat as i64);
            next.exception = None;
            self.jobs.save(next).await?;
        } else {
            self.jobs.delete(job.id).await?;
        }
        Ok(JobOutcome::Completed)
    }

    /// Second transaction after a non-collision failure: record the
    /// exception detail and decrement the retry counter, leaving the job for
    /// a future cycle or at its exhausted floor for operator handling. When
    /// this transaction itself fails on persistence, the counter is left at
    /// its current value.
    async fn record_failure(&self, job: &Job, cause: &WorkflowError) {
        let result = self
            .retry
            .run(|| async {
                let Some(mut stored) = self.jobs.load(job.id).await? else {
                    return Ok(());
                };
                stored.exception = Some(cause.to_string());
                if stored.retries > 0 {
                    stored.retries -= 1;
                }
                self.jobs.save(stored).await
            })
            .await;
        if let Err(e) = result {
            error!(job = %job.id, error = %e, "failed to record job failure");
        }
    }
}
