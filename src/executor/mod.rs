pub mod job;
pub mod lock;
pub mod redis_lock;
pub mod retry;
pub mod store;
pub mod worker;
