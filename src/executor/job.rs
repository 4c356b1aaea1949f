use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::runtime::instance::{ProcessInstance, TimerOp, TimerRequest, TokenId};

/// Number of execution attempts a freshly scheduled job starts with.
pub const DEFAULT_RETRIES: u32 = 3;

/// A scheduled continuation: fires a token signal when its due date passes.
/// Jobs are removed when their owning token or task is exited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub instance: Uuid,
    pub token: TokenId,
    pub task: Option<Uuid>,
    pub due: DateTime<Utc>,
    pub action: JobAction,
    /// Remaining attempts; a job at zero is left for operator handling.
    pub retries: u32,
    pub repeat_secs: Option<u64>,
    /// Detail of the last failed execution.
    pub exception: Option<String>,
    /// Optimistic version used by the store's conflict check.
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobAction {
    SignalToken { transition: Option<String> },
}

impl Job {
    pub fn from_request(instance: Uuid, request: TimerRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            instance,
            token: request.token,
            task: request.task,
            due: request.due,
            action: JobAction::SignalToken {
                transition: request.transition,
            },
            retries: DEFAULT_RETRIES,
            repeat_secs: request.repeat_secs,
            exception: None,
            version: 0,
        }
    }
}

/// Query-by-criteria surface over scheduled jobs, with optimistic saves.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists the job; fails with a conflict when the stored version has
    /// moved past the one being saved.
    async fn save(&self, job: Job) -> Result<()>;
    async fn load(&self, id: Uuid) -> Result<Option<Job>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    async fn delete_for_token(&self, instance: Uuid, token: TokenId) -> Result<()>;
    async fn delete_for_task(&self, instance: Uuid, task: Uuid) -> Result<()>;
    /// Due jobs ordered by due date. Jobs with exhausted retries are not
    /// returned; they stay in the store for operator inspection.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;
}

/// Maps the timer effects drained from an instance onto the job store. Must
/// run inside the same transaction as the engine call that produced them.
pub async fn apply_timer_ops(store: &dyn JobStore, instance: &mut ProcessInstance) -> Result<()> {
    let instance_id = instance.id;
    for op in instance.drain_timer_ops() {
        match op {
            TimerOp::Schedule(request) => {
                store.save(Job::from_request(instance_id, request)).await?;
            }
            TimerOp::CancelToken(token) => {
                store.delete_for_token(instance_id, token).await?;
            }
            TimerOp::CancelTask(task) => {
                store.delete_for_task(instance_id, task).await?;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<Uuid, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, mut job: Job) -> Result<()> {
        if let Some(existing) = self.jobs.get(&job.id) {
            if existing.version != job.version {
                return Err(WorkflowError::Conflict(format!("job {}", job.id)));
            }
        }
        job.version += 1;
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.jobs.remove(&id);
        Ok(())
    }

    async fn delete_for_token(&self, instance: Uuid, token: TokenId) -> Result<()> {
        self.jobs
            .retain(|_, job| !(job.instance == instance && job.token == token));
        Ok(())
    }

    async fn delete_for_task(&self, instance: Uuid, task: Uuid) -> Result<()> {
        self.jobs
            .retain(|_, job| !(job.instance == instance && job.task == Some(task)));
        Ok(())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let mut due: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.due <= now && j.retries > 0)
            .map(|j| j.clone())
            .collect();
        due.sort_by_key(|j| j.due);
        due.truncate(limit);
        Ok(due)
    }
}
