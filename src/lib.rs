//! Process-graph workflow execution core: a token-tree transition engine
//! with task instances, typed property mapping, static and collection-driven
//! fork/join, and a distributed, lock-coordinated job executor for
//! timer-based continuations.

pub mod config;
pub mod definition;
pub mod error;
pub mod executor;
pub mod runtime;

pub use config::ExecutorConfig;
pub use error::{Result, WorkflowError};
