//! Tests for scheduled starts, timers (`sleep`, `wait_for`) and polling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use durableflow::config::EngineConfig;
use durableflow::engine::flow::{PollingConfig, RunOptions, WaitOptions};
use durableflow::engine::scheduler::{QueueInvoker, ScheduledKind};
use durableflow::engine::types::*;
use durableflow::engine::{ExecutionContext, FlowDefinition, FlowEngine, Registry};
use durableflow::error::FlowError;
use durableflow::storage::StateStore;
use durableflow::storage::json_store::JsonStateStore;
use durableflow::storage::memory_store::MemoryStateStore;
use serde_json::{Value, json};

fn napper() -> FlowDefinition {
    FlowDefinition::new("napper", |ctx: ExecutionContext, ms: u64| async move {
        ctx.sleep("nap", Duration::from_millis(ms)).await?;
        let out: String = ctx.run("after", || async { anyhow::Ok("awake".to_string()) }).await?;
        anyhow::Ok(out)
    })
    .durable()
}

fn child() -> FlowDefinition {
    FlowDefinition::new("child", |ctx: ExecutionContext, input: String| async move {
        let reply: String = ctx.interrupt("reply", None).await?;
        anyhow::Ok(format!("{}:{}", input, reply))
    })
    .durable()
}

fn parent(max_attempts: u32) -> FlowDefinition {
    FlowDefinition::new("parent", move |ctx: ExecutionContext, ids: Vec<String>| async move {
        let ops = ctx
            .wait_for(
                "children",
                "child",
                &ids,
                Some(PollingConfig {
                    interval: Duration::from_millis(5),
                    max_attempts,
                }),
            )
            .await?;
        let responses: Vec<Value> = ops
            .into_iter()
            .map(|op| op.into_result())
            .collect::<Result<_, _>>()?;
        anyhow::Ok(responses)
    })
    .durable()
}

fn registry(flows: Vec<FlowDefinition>) -> Arc<Registry> {
    let mut registry = Registry::new();
    for flow in flows {
        registry.register_flow(flow).unwrap();
    }
    Arc::new(registry)
}

fn queued_engine(flows: Vec<FlowDefinition>) -> (FlowEngine, Arc<QueueInvoker>) {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let invoker = Arc::new(QueueInvoker::new());
    let engine = FlowEngine::new(registry(flows), Some(store)).with_invoker(invoker.clone());
    (engine, invoker)
}

async fn run_queued(engine: &FlowEngine, invoker: &QueueInvoker) -> Vec<Operation> {
    let mut ops = Vec::new();
    for run in invoker.drain() {
        ops.push(engine.run_scheduled(&run).await.unwrap());
    }
    ops
}

// --- schedule_flow ---

#[tokio::test]
async fn scheduled_flow_exists_before_it_runs() {
    let (engine, invoker) = queued_engine(vec![napper()]);

    let op = engine
        .schedule_flow("napper", json!(0), Some(Duration::from_secs(60)), RunOptions::default())
        .await
        .unwrap();
    assert!(!op.done);

    let state = engine.load_state("napper", &op.name).await.unwrap();
    assert_eq!(state.status, FlowStatus::Created);
    assert!(state.executions.is_empty());

    let jobs = invoker.drain();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, ScheduledKind::Start);
    assert_eq!(jobs[0].flow_id, op.name);
    assert_eq!(jobs[0].delay, Duration::from_secs(60));
}

#[tokio::test]
async fn scheduled_start_runs_once() {
    let (engine, invoker) = queued_engine(vec![child()]);

    let op = engine
        .schedule_flow("child", json!("a"), None, RunOptions::default())
        .await
        .unwrap();
    let jobs = invoker.drain();
    engine.run_scheduled(&jobs[0]).await.unwrap();
    // a duplicate delivery of the same job is ignored
    engine.run_scheduled(&jobs[0]).await.unwrap();

    let state = engine.load_state("child", &op.name).await.unwrap();
    assert_eq!(state.status, FlowStatus::Blocked);
    assert_eq!(state.executions.len(), 1);
}

#[tokio::test]
async fn tokio_invoker_runs_delayed_flow() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let engine = FlowEngine::new(registry(vec![napper()]), Some(store));

    let op = engine
        .schedule_flow("napper", json!(5), Some(Duration::from_millis(20)), RunOptions::default())
        .await
        .unwrap();
    assert!(!op.done);

    let out = engine
        .wait_flow_to_complete("napper", &op.name, WaitOptions::every(Duration::from_millis(10)))
        .await
        .unwrap();
    assert_eq!(out, json!("awake"));
}

// --- sleep / wake ---

#[tokio::test]
async fn sleep_blocks_until_woken() {
    let (engine, invoker) = queued_engine(vec![napper()]);

    let op = engine.start("napper", json!(30), RunOptions::default()).await.unwrap();
    assert!(!op.done);
    let blocked = op.blocked_on_step.clone().unwrap();
    assert_eq!(blocked.kind, BlockKind::Sleep);
    assert!(blocked.wake_at.is_some());

    let jobs = invoker.drain();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, ScheduledKind::Wake);
    assert!(jobs[0].delay <= Duration::from_millis(30));

    // an early wake is re-dispatched and leaves the flow blocked
    let early = engine.wake(&op.name).await.unwrap();
    assert!(!early.done);
    assert_eq!(invoker.len(), 1);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let ops = run_queued(&engine, &invoker).await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].clone().into_result().unwrap(), json!("awake"));

    let state = engine.load_state("napper", &op.name).await.unwrap();
    let triggers: Vec<ExecutionTrigger> = state.executions.iter().map(|e| e.trigger).collect();
    assert_eq!(triggers, vec![ExecutionTrigger::Start, ExecutionTrigger::Wake]);
    assert!(matches!(state.cache["nap"], StepOutcome::Value(Value::Null)));
}

#[tokio::test]
async fn wake_of_finished_flow_is_ignored() {
    let (engine, invoker) = queued_engine(vec![napper()]);

    let op = engine.start("napper", json!(0), RunOptions::default()).await.unwrap();
    run_queued(&engine, &invoker).await;
    let done = engine.get_flow_state("napper", &op.name).await.unwrap();
    assert!(done.done);

    let again = engine.wake(&op.name).await.unwrap();
    assert_eq!(again, done);
    assert!(invoker.is_empty());
}

#[tokio::test]
async fn wake_of_interrupted_flow_is_ignored() {
    let (engine, invoker) = queued_engine(vec![child()]);

    let op = engine.start("child", json!("a"), RunOptions::default()).await.unwrap();
    let woken = engine.wake(&op.name).await.unwrap();
    assert!(!woken.done);
    assert!(invoker.is_empty());

    let state = engine.load_state("child", &op.name).await.unwrap();
    assert_eq!(state.executions.len(), 1);
}

#[tokio::test]
async fn sleeping_flow_cannot_be_resumed_with_payload() {
    let (engine, _invoker) = queued_engine(vec![napper()]);

    let op = engine.start("napper", json!(10_000), RunOptions::default()).await.unwrap();
    let err = engine
        .resume_flow("napper", &op.name, json!(null), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation { .. }), "got {err:?}");
}

// --- wait_for ---

#[tokio::test]
async fn wait_for_resolves_once_children_finish() {
    let (engine, invoker) = queued_engine(vec![child(), parent(50)]);

    let c1 = engine.start("child", json!("one"), RunOptions::default()).await.unwrap();
    let c2 = engine.start("child", json!("two"), RunOptions::default()).await.unwrap();

    let p = engine
        .start("parent", json!([c1.name.clone(), c2.name.clone()]), RunOptions::default())
        .await
        .unwrap();
    let blocked = p.blocked_on_step.clone().unwrap();
    assert_eq!(blocked.kind, BlockKind::WaitFor);
    assert_eq!(blocked.attempt, 1);

    engine
        .resume_flow("child", &c1.name, json!("x"), RunOptions::default())
        .await
        .unwrap();
    engine
        .resume_flow("child", &c2.name, json!("y"), RunOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    run_queued(&engine, &invoker).await;

    let out = engine
        .get_flow_state("parent", &p.name)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(out, json!(["one:x", "two:y"]));
}

#[tokio::test]
async fn wait_for_times_out_after_budget() {
    let (engine, invoker) = queued_engine(vec![child(), parent(2)]);

    let c = engine.start("child", json!("slow"), RunOptions::default()).await.unwrap();
    let p = engine
        .start("parent", json!([c.name.clone()]), RunOptions::default())
        .await
        .unwrap();
    assert!(!p.done);

    tokio::time::sleep(Duration::from_millis(10)).await;
    run_queued(&engine, &invoker).await;

    let state = engine.load_state("parent", &p.name).await.unwrap();
    assert_eq!(state.status, FlowStatus::Failed);
    assert!(matches!(&state.cache["children"], StepOutcome::Error(e) if e.message.contains("timed out")));
    assert!(
        state
            .operation
            .result
            .unwrap()
            .error
            .unwrap()
            .contains("timed out after 2 polls")
    );
}

#[tokio::test]
async fn wait_for_missing_flow_is_not_cached() {
    let (engine, _invoker) = queued_engine(vec![child(), parent(5)]);

    let p = engine
        .start("parent", json!(["missing"]), RunOptions::default())
        .await
        .unwrap();
    assert!(p.done);
    assert!(p.result.unwrap().error.unwrap().contains("not found"));

    let state = engine.load_state("parent", &p.name).await.unwrap();
    assert!(state.cache.is_empty());
}

#[tokio::test]
async fn wait_for_id_the_file_store_cannot_hold_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(dir.path()));
    let engine = FlowEngine::new(registry(vec![child(), parent(5)]), Some(store))
        .with_invoker(Arc::new(QueueInvoker::new()));

    let p = engine
        .start("parent", json!([".hidden"]), RunOptions::default())
        .await
        .unwrap();
    assert!(p.done);
    assert!(p.result.unwrap().error.unwrap().contains("not found"));
    assert_eq!(engine.load_state("parent", &p.name).await.unwrap().status, FlowStatus::Failed);

    let err = engine.get_flow_state("child", ".hidden").await.unwrap_err();
    assert!(matches!(err, FlowError::NotFound { .. }), "got {err:?}");
    let err = engine
        .resume_flow("child", "../escape", json!("x"), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NotFound { .. }), "got {err:?}");
}

/// Memory store whose lookups of `broken` fail.
struct FlakyLookups(MemoryStateStore);

#[async_trait]
impl StateStore for FlakyLookups {
    async fn load(&self, flow_id: &str) -> anyhow::Result<Option<FlowState>> {
        if flow_id == "broken" {
            anyhow::bail!("disk on fire");
        }
        self.0.load(flow_id).await
    }

    async fn save(&self, flow_id: &str, state: &FlowState) -> anyhow::Result<()> {
        self.0.save(flow_id, state).await
    }

    async fn list(&self, query: &ListQuery) -> anyhow::Result<FlowStateList> {
        self.0.list(query).await
    }
}

#[tokio::test]
async fn wait_for_lookup_failure_fails_the_step() {
    let store: Arc<dyn StateStore> = Arc::new(FlakyLookups(MemoryStateStore::new()));
    let engine = FlowEngine::new(registry(vec![child(), parent(5)]), Some(store))
        .with_invoker(Arc::new(QueueInvoker::new()));

    let p = engine
        .start("parent", json!(["broken"]), RunOptions::default())
        .await
        .unwrap();
    assert!(p.done);
    assert!(p.result.unwrap().error.unwrap().contains("disk on fire"));

    let state = engine.load_state("parent", &p.name).await.unwrap();
    assert_eq!(state.status, FlowStatus::Failed);
    assert!(matches!(&state.cache["children"], StepOutcome::Error(e) if e.message.contains("disk on fire")));
}

// --- sleep bounds ---

#[tokio::test]
async fn sleep_beyond_the_calendar_is_rejected() {
    let (engine, invoker) = queued_engine(vec![FlowDefinition::new(
        "forever",
        |ctx: ExecutionContext, _input: Value| async move {
            ctx.sleep("nap", Duration::from_secs(10_000_000_000_000)).await?;
            anyhow::Ok("never")
        },
    )
    .durable()]);

    let op = engine.start("forever", Value::Null, RunOptions::default()).await.unwrap();
    assert!(op.done);
    assert!(op.result.unwrap().error.unwrap().contains("out of range"));
    assert!(invoker.drain().is_empty());
}

// --- polling ---

#[tokio::test]
async fn wait_flow_to_complete_outlasts_the_polling_budget() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let engine = FlowEngine::new(registry(vec![napper()]), Some(store)).with_config(EngineConfig {
        polling: PollingConfig {
            interval: Duration::from_millis(10),
            max_attempts: 3,
        },
        ..EngineConfig::default()
    });

    let op = engine.start("napper", json!(200), RunOptions::default()).await.unwrap();
    assert!(!op.done);

    let out = engine
        .wait_flow_to_complete("napper", &op.name, WaitOptions::default())
        .await
        .unwrap();
    assert_eq!(out, json!("awake"));
}

#[tokio::test]
async fn wait_flow_to_complete_stops_at_an_explicit_cap() {
    let (engine, _invoker) = queued_engine(vec![child()]);

    let op = engine.start("child", json!("a"), RunOptions::default()).await.unwrap();
    let err = engine
        .wait_flow_to_complete("child", &op.name, WaitOptions::every(Duration::from_millis(1)).at_most(3))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::StillRunning { .. }));
}

#[tokio::test]
async fn list_flow_states_is_scoped_to_the_flow() {
    let (engine, _invoker) = queued_engine(vec![child(), napper()]);

    let a = engine.start("child", json!("a"), RunOptions::default()).await.unwrap();
    let b = engine.start("child", json!("b"), RunOptions::default()).await.unwrap();
    engine.start("napper", json!(0), RunOptions::default()).await.unwrap();
    engine
        .resume_flow("child", &a.name, json!("done"), RunOptions::default())
        .await
        .unwrap();

    let page = engine.list_flow_states("child", ListQuery::default()).await.unwrap();
    assert_eq!(page.flow_states.len(), 2);
    assert!(page.flow_states.iter().all(|s| s.name == "child"));

    let blocked = engine
        .list_flow_states(
            "child",
            ListQuery {
                status: Some(FlowStatus::Blocked),
                ..ListQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(blocked.flow_states.len(), 1);
    assert_eq!(blocked.flow_states[0].flow_id, b.name);
}

// --- concurrency ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resumes_have_a_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(dir.path()));
    let engine = FlowEngine::new(registry(vec![child()]), Some(store))
        .with_invoker(Arc::new(QueueInvoker::new()));

    let op = engine.start("child", json!("race"), RunOptions::default()).await.unwrap();

    let (e1, e2) = (engine.clone(), engine.clone());
    let (id1, id2) = (op.name.clone(), op.name.clone());
    let first = tokio::spawn(async move {
        e1.resume_flow("child", &id1, json!("first"), RunOptions::default()).await
    });
    let second = tokio::spawn(async move {
        e2.resume_flow("child", &id2, json!("second"), RunOptions::default()).await
    });
    let results = [first.await.unwrap(), second.await.unwrap()];

    let winners: Vec<&Operation> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "{results:?}");
    for result in &results {
        if let Err(err) = result {
            assert!(
                matches!(err, FlowError::Conflict { .. } | FlowError::NotBlocked { .. }),
                "unexpected error: {err:?}"
            );
        }
    }

    let final_op = engine.get_flow_state("child", &op.name).await.unwrap();
    assert_eq!(&final_op, winners[0]);
    let state = engine.load_state("child", &op.name).await.unwrap();
    assert_eq!(state.executions.len(), 2);
}
