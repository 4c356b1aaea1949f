pub mod context;
pub mod engine;
pub mod evaluator;
pub mod identity;
pub mod instance;
pub mod scope;
pub mod task;
