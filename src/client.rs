//! Client for flows exposed by a remote engine through [`crate::api`].

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::api::ErrorResponse;
use crate::api::handlers::{ResumeFlowRequest, RunFlowRequest, ScheduleFlowRequest};
use crate::engine::flow::{PollingConfig, RunOptions, WaitOptions};
use crate::engine::streaming::{StreamDecoder, StreamEvent};
use crate::engine::types::{FlowStateList, ListQuery, Operation};
use crate::error::FlowError;

/// Talks to a durableflow HTTP server.
#[derive(Debug, Clone)]
pub struct RemoteFlowClient {
    http: Client,
    base_url: String,
}

impl RemoteFlowClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a flow remotely and return its operation.
    pub async fn run_flow(&self, name: &str, input: Value, options: RunOptions) -> Result<Operation, FlowError> {
        let body = RunFlowRequest {
            input,
            auth: options.auth,
        };
        self.post(name, None, &["flows", name, "run"], &body).await
    }

    /// Run a flow remotely and return its response, rebuilding a captured
    /// failure as [`FlowError::Execution`].
    pub async fn invoke(&self, name: &str, input: Value, options: RunOptions) -> Result<Value, FlowError> {
        self.run_flow(name, input, options).await?.into_result()
    }

    pub async fn schedule_flow(
        &self,
        name: &str,
        input: Value,
        delay: Option<Duration>,
        options: RunOptions,
    ) -> Result<Operation, FlowError> {
        let body = ScheduleFlowRequest {
            input,
            auth: options.auth,
            delay_ms: delay.map(|d| d.as_millis() as u64),
        };
        self.post(name, None, &["flows", name, "schedule"], &body)
            .await
    }

    pub async fn resume_flow(
        &self,
        name: &str,
        flow_id: &str,
        payload: Value,
        options: RunOptions,
    ) -> Result<Operation, FlowError> {
        let body = ResumeFlowRequest {
            payload,
            auth: options.auth,
        };
        self.post(
            name,
            Some(flow_id),
            &["flows", name, "runs", flow_id, "resume"],
            &body,
        )
        .await
    }

    pub async fn get_flow_state(&self, name: &str, flow_id: &str) -> Result<Operation, FlowError> {
        let response = self
            .http
            .get(self.url(&["flows", name, "runs", flow_id])?)
            .send()
            .await?;
        decode(response, name, Some(flow_id)).await
    }

    pub async fn list_flow_states(&self, name: &str, query: &ListQuery) -> Result<FlowStateList, FlowError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(status) = query.status {
            params.push(("status", status.to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(token) = &query.continuation_token {
            params.push(("continuationToken", token.clone()));
        }

        let mut url = self.url(&["flows", name, "runs"])?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        let response = self.http.get(url).send().await?;
        decode(response, name, None).await
    }

    /// Poll until the remote flow is done and return its response. Gives up
    /// only when `options.max_attempts` is set.
    pub async fn wait_flow_to_complete(
        &self,
        name: &str,
        flow_id: &str,
        options: WaitOptions,
    ) -> Result<Value, FlowError> {
        let interval = options.interval.unwrap_or(PollingConfig::default().interval);
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let operation = self.get_flow_state(name, flow_id).await?;
            if operation.done {
                return operation.into_result();
            }
            if options.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(FlowError::StillRunning {
                    flow_id: flow_id.to_string(),
                });
            }
            debug!(flow_id = %flow_id, attempt = attempt, "Remote flow not done yet");
            tokio::time::sleep(interval).await;
        }
    }

    /// Run a flow through the streaming endpoint. `on_chunk` sees every chunk
    /// in order before the final operation is returned.
    pub async fn stream_flow<F>(
        &self,
        name: &str,
        input: Value,
        options: RunOptions,
        mut on_chunk: F,
    ) -> Result<Operation, FlowError>
    where
        F: FnMut(Value),
    {
        let body = RunFlowRequest {
            input,
            auth: options.auth,
        };
        let response = self
            .http
            .post(self.url(&["flows", name, "stream"])?)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, name, None).await);
        }

        let mut decoder = StreamDecoder::new();
        let mut bytes = response.bytes_stream();
        while let Some(piece) = bytes.next().await {
            for event in decoder.push(&piece?).map_err(stream_error)? {
                match event {
                    StreamEvent::Chunk(chunk) => on_chunk(chunk),
                    StreamEvent::Done(operation) => return Ok(operation),
                }
            }
        }

        decoder
            .finish()
            .map_err(stream_error)?
            .ok_or_else(|| stream_error(anyhow::anyhow!("stream ended before the final operation")))
    }

    // --- Internals ---

    /// Base url extended with percent-encoded `segments`.
    fn url(&self, segments: &[&str]) -> Result<Url, FlowError> {
        let invalid = |reason: String| FlowError::validation(format!("base url '{}'", self.base_url), vec![reason]);
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        name: &str,
        flow_id: Option<&str>,
        segments: &[&str],
        body: &B,
    ) -> Result<T, FlowError> {
        let response = self.http.post(self.url(segments)?).json(body).send().await?;
        decode(response, name, flow_id).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response, name: &str, flow_id: Option<&str>) -> Result<T, FlowError> {
    if !response.status().is_success() {
        return Err(error_from_response(response, name, flow_id).await);
    }
    Ok(response.json::<T>().await?)
}

/// Rebuild the [`FlowError`] a server reported.
async fn error_from_response(response: Response, name: &str, flow_id: Option<&str>) -> FlowError {
    let status = response.status().as_u16();
    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => return FlowError::Transport(e),
    };
    match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => remote_error(status, body, name, flow_id),
        Err(_) => FlowError::Remote { status, message: text },
    }
}

fn remote_error(status: u16, body: ErrorResponse, name: &str, flow_id: Option<&str>) -> FlowError {
    let flow_id = flow_id.unwrap_or_default().to_string();
    match body.code.as_str() {
        "validation" => FlowError::Validation {
            target: format!("remote flow '{}'", name),
            errors: body.details,
        },
        "authorization" => FlowError::Authorization(body.error),
        "not_found" => FlowError::NotFound { flow_id },
        "unknown_flow" => FlowError::UnknownFlow(name.to_string()),
        "still_running" => FlowError::StillRunning { flow_id },
        "conflict" => FlowError::Conflict { flow_id },
        "not_blocked" => FlowError::NotBlocked {
            flow_id,
            status: body.error,
        },
        "execution" => FlowError::Execution {
            message: body.details.into_iter().next().unwrap_or(body.error),
            stacktrace: body.stacktrace,
        },
        _ => FlowError::Remote {
            status,
            message: body.error,
        },
    }
}

fn stream_error(err: anyhow::Error) -> FlowError {
    FlowError::Remote {
        status: 200,
        message: format!("malformed stream: {:#}", err),
    }
}
