//! Tests for chunk streaming from a running flow.

use std::sync::Arc;

use durableflow::engine::flow::RunOptions;
use durableflow::engine::{ExecutionContext, FlowDefinition, FlowEngine, Registry};
use durableflow::error::FlowError;
use durableflow::storage::StateStore;
use durableflow::storage::memory_store::MemoryStateStore;
use serde_json::{Value, json};

fn counter() -> FlowDefinition {
    FlowDefinition::new("counter", |ctx: ExecutionContext, n: u32| async move {
        for i in 0..n {
            ctx.send_chunk(json!({ "count": i }))?;
        }
        let suffix = if ctx.is_streaming() { "streamed" } else { "plain" };
        anyhow::Ok(format!("counted {} ({})", n, suffix))
    })
}

fn engine() -> FlowEngine {
    let mut registry = Registry::new();
    registry.register_flow(counter()).unwrap();
    registry
        .register_flow(FlowDefinition::new("half-way", |ctx: ExecutionContext, _input: Value| async move {
            ctx.send_chunk("before")?;
            Err::<Value, _>(anyhow::anyhow!("stream broke"))
        }))
        .unwrap();
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    FlowEngine::new(Arc::new(registry), Some(store))
}

#[tokio::test]
async fn chunks_arrive_in_order_before_output() {
    let engine = engine();
    let stream = engine.stream_flow("counter", json!(5), RunOptions::default()).await.unwrap();
    let flow_id = stream.flow_id.clone();

    let (chunks, op) = stream.collect().await.unwrap();
    let expected: Vec<Value> = (0..5).map(|i| json!({ "count": i })).collect();
    assert_eq!(chunks, expected);
    assert_eq!(op.name, flow_id);
    assert_eq!(op.into_result().unwrap(), json!("counted 5 (streamed)"));
}

#[tokio::test]
async fn output_depends_on_consumer_presence() {
    let engine = engine();
    let out = engine.invoke("counter", json!(2), RunOptions::default()).await.unwrap();
    assert_eq!(out, json!("counted 2 (plain)"));
}

#[tokio::test]
async fn failure_after_chunks_is_reported_in_operation() {
    let engine = engine();
    let stream = engine.stream_flow("half-way", Value::Null, RunOptions::default()).await.unwrap();
    let (chunks, op) = stream.collect().await.unwrap();

    assert_eq!(chunks, vec![json!("before")]);
    assert!(op.done);
    assert_eq!(op.result.unwrap().error.as_deref(), Some("stream broke"));
}

#[tokio::test]
async fn invalid_input_fails_before_streaming() {
    let engine = engine();
    let err = engine
        .stream_flow("counter", json!("not a number"), RunOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FlowError::Validation { .. }));
}
