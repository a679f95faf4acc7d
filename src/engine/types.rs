use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Created,
    Running,
    Blocked,
    Completed,
    Failed,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Failed)
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowStatus::Created => write!(f, "created"),
            FlowStatus::Running => write!(f, "running"),
            FlowStatus::Blocked => write!(f, "blocked"),
            FlowStatus::Completed => write!(f, "completed"),
            FlowStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(FlowStatus::Created),
            "running" => Ok(FlowStatus::Running),
            "blocked" => Ok(FlowStatus::Blocked),
            "completed" => Ok(FlowStatus::Completed),
            "failed" => Ok(FlowStatus::Failed),
            _ => Err(format!(
                "Invalid status '{}'. Use: created, running, blocked, completed, failed",
                s
            )),
        }
    }
}

/// Message and stacktrace of a failure, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: None,
        }
    }

    /// Capture an `anyhow::Error`: the full context chain as the message and
    /// the debug rendering (chain plus backtrace when enabled) as the stacktrace.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self {
            message: format!("{:#}", err),
            stacktrace: Some(format!("{:?}", err)),
        }
    }
}

/// Memoized outcome of a step: `{ "value": .. }` or `{ "error": {..} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Value(Value),
    Error(ErrorInfo),
}

/// What kind of step a flow is blocked on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockKind {
    /// Waiting for an external payload delivered through `resume`.
    #[default]
    Interrupt,
    /// Waiting for a timer.
    Sleep,
    /// Waiting for other flows to finish, re-polled on a timer.
    WaitFor,
}

/// The step a flow is currently suspended on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedStep {
    /// Step name as written in the flow body.
    pub name: String,
    /// Memo key of this occurrence of the step.
    pub key: String,
    /// JSON Schema the resume payload must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default)]
    pub kind: BlockKind,
    /// When a timer-driven step should be woken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    /// Poll attempts already made by a `waitFor` step.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// What caused an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTrigger {
    Start,
    Resume,
    Wake,
}

/// One engine invocation against a flow (initial run, resume or wake).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowExecution {
    pub trigger: ExecutionTrigger,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Result part of an [`Operation`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

/// Externally observable handle to a flow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// The flow id.
    pub name: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_on_step: Option<BlockedStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
}

impl Operation {
    pub(crate) fn pending(flow_id: &str) -> Self {
        Self {
            name: flow_id.to_string(),
            done: false,
            blocked_on_step: None,
            result: None,
        }
    }

    /// Whether the flow finished with an error.
    pub fn is_failed(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.error.is_some())
    }

    /// Turn a finished operation into its response, or the error it captured.
    ///
    /// Not-done operations yield [`FlowError::StillRunning`].
    pub fn into_result(self) -> Result<Value, crate::FlowError> {
        if !self.done {
            return Err(crate::FlowError::StillRunning { flow_id: self.name });
        }
        let result = self.result.unwrap_or_default();
        if let Some(message) = result.error {
            return Err(crate::FlowError::Execution {
                message,
                stacktrace: result.stacktrace,
            });
        }
        Ok(result.response.unwrap_or(Value::Null))
    }
}

/// Durable record backing one flow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    /// Flow definition name.
    pub name: String,
    pub flow_id: String,
    pub input: Value,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: FlowStatus,
    /// Step key -> memoized outcome. Append-only.
    #[serde(default)]
    pub cache: BTreeMap<String, StepOutcome>,
    /// Step key -> payload that resumed it.
    #[serde(default)]
    pub events_triggered: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_on_step: Option<BlockedStep>,
    #[serde(default)]
    pub executions: Vec<FlowExecution>,
    pub operation: Operation,
    /// Ambient auth context, replayed for scheduled and woken executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
    /// Incremented by every save; used for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

impl FlowState {
    pub fn new(name: &str, flow_id: &str, input: Value) -> Self {
        Self {
            name: name.to_string(),
            flow_id: flow_id.to_string(),
            input,
            start_time: Utc::now(),
            end_time: None,
            status: FlowStatus::Created,
            cache: BTreeMap::new(),
            events_triggered: HashMap::new(),
            blocked_on_step: None,
            executions: Vec::new(),
            operation: Operation::pending(flow_id),
            auth: None,
            version: 0,
        }
    }

    /// Whether the run reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.operation.done
    }

    /// Project the state to its externally visible operation.
    pub fn to_operation(&self) -> Operation {
        Operation {
            name: self.flow_id.clone(),
            done: self.operation.done,
            blocked_on_step: self.blocked_on_step.clone(),
            result: self.operation.result.clone(),
        }
    }

    /// Record a cache entry unless the key is already set.
    /// Returns `false` when an entry already existed.
    pub fn memoize(&mut self, key: &str, outcome: StepOutcome) -> bool {
        if self.cache.contains_key(key) {
            return false;
        }
        self.cache.insert(key.to_string(), outcome);
        true
    }
}

/// Filter for [`StateStore::list`](crate::storage::StateStore::list).
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Only states of this flow definition.
    pub name: Option<String>,
    pub status: Option<FlowStatus>,
    /// Page size. `None` returns everything.
    pub limit: Option<usize>,
    /// Token returned by the previous page.
    pub continuation_token: Option<String>,
}

/// One page of flow states, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStateList {
    pub flow_states: Vec<FlowState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

impl FlowStateList {
    /// Apply a query to an unordered set of states: filter, sort newest
    /// first, then page using the offset encoded in the continuation token.
    pub fn paginate(states: Vec<FlowState>, query: &ListQuery) -> anyhow::Result<Self> {
        let mut states: Vec<FlowState> = states
            .into_iter()
            .filter(|s| query.name.as_ref().is_none_or(|n| &s.name == n))
            .filter(|s| query.status.is_none_or(|st| s.status == st))
            .collect();
        states.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then_with(|| a.flow_id.cmp(&b.flow_id))
        });

        let offset = match &query.continuation_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| anyhow::anyhow!("Invalid continuation token: {}", token))?,
            None => 0,
        };

        let remaining: Vec<FlowState> = states.into_iter().skip(offset).collect();
        match query.limit {
            Some(limit) if remaining.len() > limit => Ok(Self {
                flow_states: remaining.into_iter().take(limit).collect(),
                continuation_token: Some((offset + limit).to_string()),
            }),
            _ => Ok(Self {
                flow_states: remaining,
                continuation_token: None,
            }),
        }
    }
}
