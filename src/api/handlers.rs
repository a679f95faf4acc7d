use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::FlowStream;
use crate::engine::flow::RunOptions;
use crate::engine::streaming::{encode_chunk, encode_final, failed_operation};
use crate::engine::types::{FlowStateList, FlowStatus, ListQuery, Operation};

use super::AppState;
use super::errors::AppError;

/// Header carrying the flow id of a streamed run.
pub const FLOW_ID_HEADER: &str = "x-flow-id";

// --- Request/Response types ---

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunFlowRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleFlowRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
    /// Delay before the first execution, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResumeFlowRequest {
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub continuation_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInfo {
    pub name: String,
    pub durable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /flows
pub async fn list_flows(State(state): State<Arc<AppState>>) -> Json<Value> {
    let registry = state.engine.registry();
    let flows: Vec<FlowInfo> = registry
        .flow_names()
        .into_iter()
        .filter_map(|name| registry.get_flow(name))
        .map(|def| FlowInfo {
            name: def.name.clone(),
            durable: def.durable,
            input_schema: def.input_schema.clone(),
            output_schema: def.output_schema.clone(),
        })
        .collect();

    let total = flows.len();
    Json(serde_json::json!({
        "flows": flows,
        "total": total,
    }))
}

/// POST /flows/{name}/run
///
/// Runs the flow inline. Failures of the body are reported in the operation.
pub async fn run_flow(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<RunFlowRequest>,
) -> Result<Json<Operation>, AppError> {
    let operation = state
        .engine
        .start(&name, req.input, RunOptions { auth: req.auth })
        .await?;
    Ok(Json(operation))
}

/// POST /flows/{name}/schedule
pub async fn schedule_flow(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<ScheduleFlowRequest>,
) -> Result<(StatusCode, Json<Operation>), AppError> {
    let operation = state
        .engine
        .schedule_flow(
            &name,
            req.input,
            req.delay_ms.map(Duration::from_millis),
            RunOptions { auth: req.auth },
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(operation)))
}

/// POST /flows/{name}/stream
///
/// Newline-delimited JSON: one line per chunk, an empty line, then the
/// final operation.
pub async fn stream_flow(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<RunFlowRequest>,
) -> Result<Response, AppError> {
    let flow = state
        .engine
        .stream_flow(&name, req.input, RunOptions { auth: req.auth })
        .await?;
    let flow_id = flow.flow_id.clone();

    let body = Body::from_stream(stream::unfold(Some(flow), |flow| async move {
        let mut flow: FlowStream = flow?;
        match flow.chunks.recv().await {
            Some(chunk) => Some((Ok::<_, Infallible>(encode_chunk(&chunk)), Some(flow))),
            None => {
                let flow_id = flow.flow_id.clone();
                let operation = flow
                    .output()
                    .await
                    .unwrap_or_else(|e| failed_operation(&flow_id, &e));
                Some((Ok(encode_final(&operation)), None))
            }
        }
    }));

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-ndjson".to_string()),
            (header::HeaderName::from_static(FLOW_ID_HEADER), flow_id),
        ],
        body,
    )
        .into_response())
}

/// GET /flows/{name}/runs
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<ListRunsQuery>,
) -> Result<Json<FlowStateList>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<FlowStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let page = state
        .engine
        .list_flow_states(
            &name,
            ListQuery {
                name: None,
                status,
                limit: params.limit,
                continuation_token: params.continuation_token,
            },
        )
        .await?;
    Ok(Json(page))
}

/// GET /flows/{name}/runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Json<Operation>, AppError> {
    let operation = state.engine.get_flow_state(&name, &id).await?;
    Ok(Json(operation))
}

/// POST /flows/{name}/runs/{id}/resume
pub async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path((name, id)): Path<(String, String)>,
    Json(req): Json<ResumeFlowRequest>,
) -> Result<Json<Operation>, AppError> {
    let operation = state
        .engine
        .resume_flow(&name, &id, req.payload, RunOptions { auth: req.auth })
        .await?;
    Ok(Json(operation))
}
