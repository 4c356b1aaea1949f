use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use procflow::config::ExecutorConfig;
use procflow::definition::loader::load_definition_from_yaml;
use procflow::executor::job::{apply_timer_ops, InMemoryJobStore};
use procflow::executor::redis_lock::RedisLockService;
use procflow::executor::store::{InMemoryInstanceStore, InstanceStore};
use procflow::executor::worker::JobExecutor;
use procflow::runtime::context::EngineContext;
use procflow::runtime::engine::Engine;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis connection URL used for the cluster advisory lock
    #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
    redis: String,

    /// Path to a compiled process definition (YAML)
    #[arg(long)]
    definition: String,

    /// Start one instance of the definition before running
    #[arg(long, default_value_t = false)]
    start_instance: bool,

    /// Number of worker loops
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Idle interval between empty cycles, in milliseconds
    #[arg(long, default_value_t = 500)]
    idle_ms: u64,

    /// Advisory lock TTL, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    lock_ttl_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let engine = Arc::new(Engine::new(EngineContext::default()));
    let definition =
        load_definition_from_yaml(&args.definition).context("failed to load definition")?;
    let definition = engine.deploy(definition).context("invalid definition")?;

    let client = redis::Client::open(args.redis.as_str()).context("invalid redis URL")?;
    let locks = Arc::new(RedisLockService::new(client));
    let instances = Arc::new(InMemoryInstanceStore::new());
    let jobs = Arc::new(InMemoryJobStore::new());

    if args.start_instance {
        let mut instance = engine.start(&definition.id, HashMap::new())?;
        apply_timer_ops(jobs.as_ref(), &mut instance).await?;
        tracing::info!(instance = %instance.id, "started instance");
        instances.insert(instance).await?;
    }

    let config = ExecutorConfig {
        workers: args.workers,
        idle_interval: Duration::from_millis(args.idle_ms),
        lock_ttl: Duration::from_millis(args.lock_ttl_ms),
        ..ExecutorConfig::default()
    };
    let executor = Arc::new(JobExecutor::new(
        config,
        engine,
        instances,
        jobs,
        locks,
    )?);
    executor.start().await;

    tokio::signal::ctrl_c().await?;
    executor.shutdown().await;
    Ok(())
}
