//! Tests for REST API endpoints, driven through the router with `oneshot`.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use durableflow::api::router;
use durableflow::engine::scheduler::QueueInvoker;
use durableflow::engine::types::{FlowStateList, Operation};
use durableflow::engine::{ExecutionContext, FlowDefinition, FlowEngine, Registry};
use durableflow::storage::StateStore;
use durableflow::storage::json_store::JsonStateStore;
use http_body_util::BodyExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceExt;

#[derive(Deserialize)]
struct Break {
    something: String,
}

fn app(dir: &tempfile::TempDir) -> Router {
    let mut registry = Registry::new();
    registry
        .register_flow(
            FlowDefinition::new("take-a-break", |ctx: ExecutionContext, input: String| async move {
                let r: Value = ctx
                    .interrupt(
                        "take-a-break",
                        Some(json!({
                            "type": "object",
                            "properties": { "something": { "type": "string" } },
                            "required": ["something"]
                        })),
                    )
                    .await?;
                let r: Break = serde_json::from_value(r)?;
                anyhow::Ok(format!("{} {}", input, r.something))
            })
            .durable(),
        )
        .unwrap();
    registry
        .register_flow(
            FlowDefinition::new("explode", |_ctx: ExecutionContext, input: String| async move {
                Err::<String, _>(anyhow::anyhow!("bad happened: {}", input))
            })
            .with_input_schema(json!({ "type": "string" })),
        )
        .unwrap();
    registry
        .register_flow(FlowDefinition::new("counter", |ctx: ExecutionContext, n: u32| async move {
            for i in 0..n {
                ctx.send_chunk(json!({ "count": i }))?;
            }
            anyhow::Ok(n)
        }))
        .unwrap();
    registry
        .register_flow(
            FlowDefinition::new("guarded", |_ctx: ExecutionContext, _input: Value| async move { anyhow::Ok("ok") })
                .with_auth_policy(|auth, _| match auth {
                    Some(_) => Ok(()),
                    None => anyhow::bail!("credentials required"),
                }),
        )
        .unwrap();

    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(dir.path()));
    let engine = FlowEngine::new(Arc::new(registry), Some(store)).with_invoker(Arc::new(QueueInvoker::new()));
    router(engine, 1024 * 1024)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, bytes)
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn health_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = send_json(&app(&dir), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
}

#[tokio::test]
async fn lists_registered_flows() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = send_json(&app(&dir), "GET", "/flows", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], json!(4));
    assert_eq!(body["flows"][0]["name"], json!("counter"));
    assert_eq!(body["flows"][2]["name"], json!("guarded"));
    assert_eq!(body["flows"][3]["durable"], json!(true));
}

#[tokio::test]
async fn schedule_resume_and_poll() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);

    // inline start blocks on the interrupt
    let (status, body) = send_json(&app, "POST", "/flows/take-a-break/run", Some(json!({ "input": "foo" }))).await;
    assert_eq!(status, StatusCode::OK);
    let op: Operation = serde_json::from_value(body.clone()).unwrap();
    assert!(!op.done);
    assert_eq!(body["blockedOnStep"]["name"], json!("take-a-break"));

    let resume_uri = format!("/flows/take-a-break/runs/{}/resume", op.name);
    let (status, body) = send_json(&app, "POST", &resume_uri, Some(json!({ "payload": { "something": 3 } }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("validation"));

    let (status, body) = send_json(&app, "POST", &resume_uri, Some(json!({ "payload": { "something": "bar" } }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["done"], json!(true));
    assert_eq!(body["result"]["response"], json!("foo bar"));

    let (status, polled) = send_json(&app, "GET", &format!("/flows/take-a-break/runs/{}", op.name), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(polled, body);

    let (status, body) = send_json(&app, "POST", &resume_uri, Some(json!({ "payload": { "something": "bar" } }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], json!("not_blocked"));
}

#[tokio::test]
async fn schedule_returns_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);

    let (status, body) = send_json(
        &app,
        "POST",
        "/flows/take-a-break/schedule",
        Some(json!({ "input": "foo", "delayMs": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["done"], json!(false));

    let (status, page) = send_json(&app, "GET", "/flows/take-a-break/runs?status=created", None).await;
    assert_eq!(status, StatusCode::OK);
    let page: FlowStateList = serde_json::from_value(page).unwrap();
    assert_eq!(page.flow_states.len(), 1);
    assert_eq!(page.flow_states[0].flow_id, body["name"].as_str().unwrap());
}

#[tokio::test]
async fn failed_flow_reports_error_in_operation() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = send_json(&app(&dir), "POST", "/flows/explode/run", Some(json!({ "input": "X" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["done"], json!(true));
    assert_eq!(body["result"]["error"], json!("bad happened: X"));
    assert!(body["result"]["stacktrace"].is_string());
}

#[tokio::test]
async fn error_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);

    let (status, body) = send_json(&app, "POST", "/flows/explode/run", Some(json!({ "input": 5 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("validation"));
    assert!(!body["details"].as_array().unwrap().is_empty());

    let (status, body) = send_json(&app, "POST", "/flows/guarded/run", Some(json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], json!("authorization"));

    let (status, body) = send_json(&app, "POST", "/flows/guarded/run", Some(json!({ "auth": { "user": "u" } }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["response"], json!("ok"));

    let (status, body) = send_json(&app, "GET", "/flows/take-a-break/runs/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!("not_found"));

    let (status, body) = send_json(&app, "POST", "/flows/nope/run", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!("unknown_flow"));

    let (status, body) = send_json(&app, "GET", "/flows/counter/runs?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("bad_request"));
}

#[tokio::test]
async fn stream_is_newline_delimited() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);

    let request = Request::builder()
        .method("POST")
        .uri("/flows/counter/stream")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "input": 3 }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/x-ndjson"
    );
    let flow_id = response.headers().get("x-flow-id").unwrap().to_str().unwrap().to_string();

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(lines.len(), 5, "{text:?}");
    for (i, line) in lines[..3].iter().enumerate() {
        let chunk: Value = serde_json::from_str(line).unwrap();
        assert_eq!(chunk, json!({ "count": i }));
    }
    assert_eq!(lines[3], "");
    let op: Operation = serde_json::from_str(lines[4]).unwrap();
    assert_eq!(op.name, flow_id);
    assert_eq!(op.into_result().unwrap(), json!(3));
}
