use std::time::Duration;

use crate::error::{Result, WorkflowError};

/// Configuration for the distributed job executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker loops to spawn.
    pub workers: usize,
    /// How long a worker sleeps after a cycle that yielded no jobs.
    pub idle_interval: Duration,
    /// Time-to-live of the cluster-wide advisory lock.
    pub lock_ttl: Duration,
    /// Once a worker has held the lock longer than this, a logically
    /// successful job is still rolled back so other workers can take over.
    pub max_lock_time: Duration,
    /// Disable to run without cluster coordination (single node, tests).
    pub lock_enabled: bool,
    /// Name of the advisory lock shared by all executor instances.
    pub lock_name: String,
    /// Maximum number of due jobs fetched per cycle.
    pub batch_size: usize,
    /// Attempts per retrying transaction before a transient error escalates.
    pub max_attempts: u32,
    /// Identity jobs run as when no task actor is bound to them.
    pub system_identity: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            idle_interval: Duration::from_millis(500),
            lock_ttl: Duration::from_secs(30),
            max_lock_time: Duration::from_secs(60),
            lock_enabled: true,
            lock_name: "procflow.job-executor".to_string(),
            batch_size: 10,
            max_attempts: 3,
            system_identity: "system".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(WorkflowError::Configuration(
                "workers must be positive".to_string(),
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(WorkflowError::Configuration(
                "lock_ttl must be positive".to_string(),
            ));
        }
        if self.max_lock_time.is_zero() {
            return Err(WorkflowError::Configuration(
                "max_lock_time must be positive".to_string(),
            ));
        }
        if self.lock_name.is_empty() {
            return Err(WorkflowError::Configuration(
                "lock_name must not be empty".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(WorkflowError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(WorkflowError::Configuration(
                "max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
