use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use procflow::definition::model::{
    Node, NodeKind, ProcessDefinition, TaskDefinition, TimerDefinition, TimerDelay, Transition,
};
use procflow::executor::job::{apply_timer_ops, InMemoryJobStore, Job, JobAction, JobStore};
use procflow::executor::lock::{InMemoryLockService, LockService};
use procflow::executor::retry::RetryPolicy;
use procflow::executor::store::{InMemoryInstanceStore, InstanceStore};
use procflow::executor::worker::JobExecutor;
use procflow::runtime::context::EngineContext;
use procflow::runtime::engine::Engine;
use procflow::runtime::evaluator::ExprEvaluator;
use procflow::runtime::identity::{IdentityRunner, PassthroughIdentityResolver};
use procflow::runtime::instance::TokenId;
use procflow::{ExecutorConfig, WorkflowError};
use serde_json::json;
use uuid::Uuid;

/// A start node whose timer fires immediately, then an end node.
fn timed_definition() -> ProcessDefinition {
    let start = Node {
        name: "wait".to_string(),
        kind: NodeKind::Plain,
        transitions: vec![Transition {
            name: None,
            target: 1,
            default: false,
        }],
        on_enter: Vec::new(),
        on_leave: Vec::new(),
        tasks: Vec::new(),
        timers: vec![TimerDefinition {
            name: "escalate".to_string(),
            delay: TimerDelay::Seconds(0),
            repeat_secs: None,
            transition: None,
        }],
        for_each: None,
    };
    let end = Node {
        name: "done".to_string(),
        kind: NodeKind::End,
        transitions: Vec::new(),
        on_enter: Vec::new(),
        on_leave: Vec::new(),
        tasks: Vec::new(),
        timers: Vec::new(),
        for_each: None,
    };
    ProcessDefinition {
        id: "timed".to_string(),
        name: "timed".to_string(),
        version: 1,
        nodes: vec![start, end],
        start: 0,
    }
}

/// An approval task whose reminder fires immediately, then an end node.
fn tasked_definition() -> ProcessDefinition {
    let start = Node {
        name: "approve".to_string(),
        kind: NodeKind::Task,
        transitions: vec![Transition {
            name: None,
            target: 1,
            default: false,
        }],
        on_enter: Vec::new(),
        on_leave: Vec::new(),
        tasks: vec![TaskDefinition {
            name: "approval".to_string(),
            properties: Vec::new(),
            associations: Vec::new(),
            timers: vec![TimerDefinition {
                name: "reminder".to_string(),
                delay: TimerDelay::Seconds(0),
                repeat_secs: None,
                transition: None,
            }],
        }],
        timers: Vec::new(),
        for_each: None,
    };
    let end = Node {
        name: "done".to_string(),
        kind: NodeKind::End,
        transitions: Vec::new(),
        on_enter: Vec::new(),
        on_leave: Vec::new(),
        tasks: Vec::new(),
        timers: Vec::new(),
        for_each: None,
    };
    ProcessDefinition {
        id: "tasked".to_string(),
        name: "tasked".to_string(),
        version: 1,
        nodes: vec![start, end],
        start: 0,
    }
}

/// Records every identity the executor asks to run work as.
#[derive(Default)]
struct RecordingRunner {
    identities: std::sync::Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn seen(&self) -> Vec<String> {
        self.identities.lock().unwrap().clone()
    }
}

impl IdentityRunner for RecordingRunner {
    fn run_as(
        &self,
        identity: &str,
        work: &mut dyn FnMut() -> procflow::Result<()>,
    ) -> procflow::Result<()> {
        self.identities.lock().unwrap().push(identity.to_string());
        work()
    }
}

fn test_config() -> ExecutorConfig {
    ExecutorConfig {
        workers: 1,
        idle_interval: Duration::from_millis(10),
        lock_name: "test.job-executor".to_string(),
        ..ExecutorConfig::default()
    }
}

struct Fixture {
    engine: Arc<Engine>,
    instances: Arc<InMemoryInstanceStore>,
    jobs: Arc<InMemoryJobStore>,
    locks: Arc<InMemoryLockService>,
    executor: Arc<JobExecutor>,
}

async fn fixture(config: ExecutorConfig) -> Fixture {
    fixture_with(config, EngineContext::default()).await
}

async fn fixture_with(config: ExecutorConfig, context: EngineContext) -> Fixture {
    let engine = Arc::new(Engine::new(context));
    engine.deploy(timed_definition()).expect("deploy failed");
    engine.deploy(tasked_definition()).expect("deploy failed");
    let instances = Arc::new(InMemoryInstanceStore::new());
    let jobs = Arc::new(InMemoryJobStore::new());
    let locks = Arc::new(InMemoryLockService::new());
    let executor = Arc::new(
        JobExecutor::new(
            config,
            engine.clone(),
            instances.clone(),
            jobs.clone(),
            locks.clone(),
        )
        .expect("executor config"),
    );
    Fixture {
        engine,
        instances,
        jobs,
        locks,
        executor,
    }
}

/// Starts an instance of the timed definition and persists it together with
/// its pending timer job.
async fn start_timed(fx: &Fixture) -> Uuid {
    let mut instance = fx
        .engine
        .start("timed", HashMap::new())
        .expect("start failed");
    let id = instance.id;
    apply_timer_ops(fx.jobs.as_ref(), &mut instance)
        .await
        .expect("apply failed");
    fx.instances.insert(instance).await.expect("insert failed");
    id
}

#[tokio::test]
async fn cycle_processes_due_jobs_and_keeps_the_lock() {
    let fx = fixture(test_config()).await;
    let id = start_timed(&fx).await;
    assert_eq!(fx.jobs.len(), 1);

    let mut holds = false;
    let processed = fx
        .executor
        .run_cycle("w1", &mut holds)
        .await
        .expect("cycle failed");
    assert_eq!(processed, 1);
    assert!(holds);
    // A productive cycle retains the lock for the next one.
    assert_eq!(
        fx.locks.holder("test.job-executor").as_deref(),
        Some("w1")
    );

    let (instance, _) = fx.instances.load(id).await.expect("load").expect("stored");
    assert!(!instance.active);
    assert!(fx.jobs.is_empty());
}

#[tokio::test]
async fn empty_batch_releases_the_lock() {
    let fx = fixture(test_config()).await;
    let mut holds = false;

    let processed = fx
        .executor
        .run_cycle("w1", &mut holds)
        .await
        .expect("cycle failed");
    assert_eq!(processed, 0);
    assert!(!holds);
    assert_eq!(fx.locks.holder("test.job-executor"), None);
}

#[tokio::test]
async fn busy_lock_skips_the_cycle() {
    let fx = fixture(test_config()).await;
    start_timed(&fx).await;
    fx.locks
        .try_acquire("test.job-executor", "other-node", Duration::from_secs(30))
        .await
        .expect("acquire failed");

    let mut holds = false;
    let processed = fx
        .executor
        .run_cycle("w1", &mut holds)
        .await
        .expect("cycle failed");
    assert_eq!(processed, 0);
    assert!(!holds);
    // The jobs stay untouched for whoever holds the lock.
    assert_eq!(fx.jobs.len(), 1);
    assert_eq!(
        fx.locks.holder("test.job-executor").as_deref(),
        Some("other-node")
    );
}

#[tokio::test]
async fn failed_job_records_the_exception_and_burns_a_retry() {
    let fx = fixture(test_config()).await;
    let job = Job {
        id: Uuid::new_v4(),
        name: "escalate".to_string(),
        instance: Uuid::new_v4(),
        token: TokenId(0),
        task: None,
        due: Utc::now(),
        action: JobAction::SignalToken { transition: None },
        retries: 3,
        repeat_secs: None,
        exception: None,
        version: 0,
    };
    let job_id = job.id;
    fx.jobs.save(job).await.expect("save failed");

    let mut holds = false;
    let processed = fx
        .executor
        .run_cycle("w1", &mut holds)
        .await
        .expect("cycle failed");
    assert_eq!(processed, 0);

    let stored = fx.jobs.load(job_id).await.expect("load").expect("job kept");
    assert_eq!(stored.retries, 2);
    assert!(stored.exception.is_some());
}

#[tokio::test]
async fn exhausted_jobs_are_left_for_operators() {
    let fx = fixture(test_config()).await;
    let job = Job {
        id: Uuid::new_v4(),
        name: "escalate".to_string(),
        instance: Uuid::new_v4(),
        token: TokenId(0),
        task: None,
        due: Utc::now(),
        action: JobAction::SignalToken { transition: None },
        retries: 0,
        repeat_secs: None,
        exception: Some("unknown instance".to_string()),
        version: 0,
    };
    fx.jobs.save(job).await.expect("save failed");

    let due = fx
        .jobs
        .due_jobs(Utc::now(), 10)
        .await
        .expect("query failed");
    assert!(due.is_empty());
    // The record itself stays in the store.
    assert_eq!(fx.jobs.len(), 1);
}

#[tokio::test]
async fn overlong_lock_tenure_rolls_the_job_back() {
    let mut config = test_config();
    config.max_lock_time = Duration::from_nanos(1);
    let fx = fixture(config).await;
    let id = start_timed(&fx).await;

    let mut holds = false;
    let processed = fx
        .executor
        .run_cycle("w1", &mut holds)
        .await
        .expect("cycle failed");
    assert_eq!(processed, 0);

    // Nothing was committed: the instance is still live and the job is due.
    let (instance, _) = fx.instances.load(id).await.expect("load").expect("stored");
    assert!(instance.active);
    assert_eq!(fx.jobs.len(), 1);
}

#[tokio::test]
async fn stale_instance_save_conflicts() {
    let fx = fixture(test_config()).await;
    let instance = fx
        .engine
        .start("timed", HashMap::new())
        .expect("start failed");
    let id = instance.id;
    fx.instances.insert(instance).await.expect("insert failed");

    let (loaded, version) = fx.instances.load(id).await.expect("load").expect("stored");
    fx.instances
        .save(loaded.clone(), version)
        .await
        .expect("first save failed");
    let err = fx
        .instances
        .save(loaded, version)
        .await
        .expect_err("second save should conflict");
    assert!(err.is_conflict());
}

#[tokio::test]
async fn retry_policy_retries_transient_failures_only() {
    let policy = RetryPolicy::new(3, Duration::from_millis(1));

    let attempts = AtomicU32::new(0);
    let value = policy
        .run(|| async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(WorkflowError::Conflict("instance x".to_string()))
            } else {
                Ok(7)
            }
        })
        .await
        .expect("should succeed on the third attempt");
    assert_eq!(value, 7);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let attempts = AtomicU32::new(0);
    let err = policy
        .run(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(WorkflowError::Configuration("bad".to_string()))
        })
        .await
        .expect_err("validation errors are not retried");
    assert!(err.is_validation());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_workers_is_rejected() {
    let mut config = test_config();
    config.workers = 0;
    let engine = Arc::new(Engine::new(EngineContext::default()));
    let err = JobExecutor::new(
        config,
        engine,
        Arc::new(InMemoryInstanceStore::new()),
        Arc::new(InMemoryJobStore::new()),
        Arc::new(InMemoryLockService::new()),
    )
    .expect_err("config should be rejected");
    assert!(matches!(err, WorkflowError::Configuration(_)));
}

#[tokio::test]
async fn jobs_without_a_task_run_as_the_system_identity() {
    let runner = Arc::new(RecordingRunner::default());
    let context = EngineContext::new(
        Arc::new(ExprEvaluator),
        Arc::new(PassthroughIdentityResolver),
        runner.clone(),
    );
    let fx = fixture_with(test_config(), context).await;
    start_timed(&fx).await;

    let mut holds = false;
    let processed = fx
        .executor
        .run_cycle("w1", &mut holds)
        .await
        .expect("cycle failed");
    assert_eq!(processed, 1);
    assert_eq!(runner.seen(), vec!["system".to_string()]);
}

#[tokio::test]
async fn task_jobs_run_as_the_task_owner() {
    let runner = Arc::new(RecordingRunner::default());
    let context = EngineContext::new(
        Arc::new(ExprEvaluator),
        Arc::new(PassthroughIdentityResolver),
        runner.clone(),
    );
    let fx = fixture_with(test_config(), context).await;

    let mut instance = fx
        .engine
        .start("tasked", HashMap::new())
        .expect("start failed");
    let task = instance.tasks[0].id;
    let mut props = HashMap::new();
    props.insert("owner".to_string(), json!("gavin"));
    fx.engine
        .set_task_properties(&mut instance, task, &props)
        .expect("set failed");
    apply_timer_ops(fx.jobs.as_ref(), &mut instance)
        .await
        .expect("apply failed");
    fx.instances.insert(instance).await.expect("insert failed");

    let mut holds = false;
    let processed = fx
        .executor
        .run_cycle("w1", &mut holds)
        .await
        .expect("cycle failed");
    assert_eq!(processed, 1);
    assert_eq!(runner.seen(), vec!["gavin".to_string()]);
}

#[tokio::test]
async fn worker_pool_drives_an_instance_to_completion() {
    let fx = fixture(test_config()).await;
    let id = start_timed(&fx).await;

    fx.executor.start().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let (instance, _) = fx.instances.load(id).await.expect("load").expect("stored");
        if !instance.active {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    fx.executor.shutdown().await;

    assert!(fx.jobs.is_empty());
}
