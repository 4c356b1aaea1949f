use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::runtime::instance::TokenId;

pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;

/// Error taxonomy for the workflow core.
///
/// Validation errors surface synchronously to the caller and are never
/// retried. Transient errors (lock busy, optimistic collision) are retried by
/// the transaction layer. Everything else is fatal and escalated.
#[derive(Debug, Error)]
pub enum WorkflowError {
    // --- validation ---
    #[error("transition '{transition}' is invalid for node '{node}'")]
    InvalidTransition { node: String, transition: String },

    #[error("mandatory properties are missing: {}", .0.join(", "))]
    MissingMandatoryProperties(Vec<String>),

    #[error("value '{value}' is invalid for property '{name}'")]
    InvalidPropertyValue { name: String, value: Value },

    #[error("for-each collection '{0}' is empty or could not be resolved")]
    MalformedCollection(String),

    #[error("expression '{expression}' failed to evaluate: {reason}")]
    Evaluation { expression: String, reason: String },

    #[error("definition '{id}' has {} problem(s): {}", .problems.len(), .problems.join("; "))]
    InvalidDefinition { id: String, problems: Vec<String> },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("task {0} has already ended")]
    TaskEnded(Uuid),

    #[error("token {0:?} has already ended")]
    TokenEnded(TokenId),

    #[error("unknown token {0:?}")]
    UnknownToken(TokenId),

    #[error("unknown task {0}")]
    UnknownTask(Uuid),

    #[error("unknown node index {0}")]
    UnknownNode(usize),

    #[error("unknown definition '{0}'")]
    UnknownDefinition(String),

    #[error("unknown instance {0}")]
    UnknownInstance(Uuid),

    // --- transient ---
    #[error("lock '{0}' is held elsewhere")]
    LockBusy(String),

    #[error("optimistic update conflict on {0}")]
    Conflict(String),

    // --- fatal ---
    #[error("store failure: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse definition: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl WorkflowError {
    /// Caller mistakes: surfaced immediately, never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            WorkflowError::InvalidTransition { .. }
                | WorkflowError::MissingMandatoryProperties(_)
                | WorkflowError::InvalidPropertyValue { .. }
                | WorkflowError::MalformedCollection(_)
                | WorkflowError::Evaluation { .. }
                | WorkflowError::InvalidDefinition { .. }
                | WorkflowError::Configuration(_)
                | WorkflowError::TaskEnded(_)
                | WorkflowError::TokenEnded(_)
        )
    }

    /// Retried automatically by the retrying-transaction layer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WorkflowError::LockBusy(_) | WorkflowError::Conflict(_)
        )
    }

    /// An optimistic-concurrency collision: another worker got there first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, WorkflowError::Conflict(_))
    }

    /// A persistence-layer failure that is neither a collision nor retryable.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, WorkflowError::Store(_) | WorkflowError::Io(_))
    }
}
