use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::engine::context::ExecutionContext;
use crate::error::FlowError;
use crate::schema;

type FlowBody = dyn Fn(ExecutionContext, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;
type InputCheck = dyn Fn(&Value) -> Result<(), String> + Send + Sync;
type AuthPolicy = dyn Fn(Option<&Value>, &Value) -> anyhow::Result<()> + Send + Sync;

/// A named flow: schemas, durability, auth policy and the body to run.
#[derive(Clone)]
pub struct FlowDefinition {
    pub name: String,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    /// Persist state even in environments that only persist durable flows.
    pub durable: bool,
    auth_policy: Option<Arc<AuthPolicy>>,
    input_check: Arc<InputCheck>,
    body: Arc<FlowBody>,
}

impl fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("input_schema", &self.input_schema)
            .field("output_schema", &self.output_schema)
            .finish_non_exhaustive()
    }
}

impl FlowDefinition {
    /// Define a flow from a typed async body.
    ///
    /// The body receives its own [`ExecutionContext`] handle and the
    /// deserialized input. Errors returned by step primitives must be
    /// propagated with `?` so interrupts can suspend the run.
    pub fn new<I, O, F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(ExecutionContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let body: Arc<FlowBody> = Arc::new(
            move |ctx: ExecutionContext, input: Value| -> BoxFuture<'static, anyhow::Result<Value>> {
                match serde_json::from_value::<I>(input) {
                    Ok(input) => {
                        let fut = body(ctx, input);
                        Box::pin(async move {
                            let output = fut.await?;
                            Ok(serde_json::to_value(output)?)
                        })
                    }
                    Err(e) => Box::pin(async move { Err(e.into()) }),
                }
            },
        );

        Self {
            name: name.into(),
            input_schema: None,
            output_schema: None,
            durable: false,
            auth_policy: None,
            input_check: Arc::new(|input: &Value| {
                serde_json::from_value::<I>(input.clone())
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
            body,
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Reject runs whose auth context does not satisfy `policy`.
    /// The policy sees the auth context and the flow input.
    pub fn with_auth_policy<P>(mut self, policy: P) -> Self
    where
        P: Fn(Option<&Value>, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.auth_policy = Some(Arc::new(policy));
        self
    }

    /// Check an input against the input schema and the body's input type.
    pub fn validate_input(&self, input: &Value) -> Result<(), FlowError> {
        let target = format!("input of flow '{}'", self.name);
        schema::validate_opt(self.input_schema.as_ref(), input, &target)?;
        (self.input_check)(input).map_err(|e| FlowError::validation(target, vec![e]))
    }

    pub fn validate_output(&self, output: &Value) -> Result<(), FlowError> {
        let target = format!("output of flow '{}'", self.name);
        schema::validate_opt(self.output_schema.as_ref(), output, &target)
    }

    pub fn authorize(&self, auth: Option<&Value>, input: &Value) -> Result<(), FlowError> {
        match &self.auth_policy {
            Some(policy) => policy(auth, input).map_err(|e| FlowError::Authorization(format!("{:#}", e))),
            None => Ok(()),
        }
    }

    pub(crate) fn call(&self, ctx: ExecutionContext, input: Value) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.body)(ctx, input)
    }
}

/// Retry configuration for an idempotent step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial backoff duration in seconds (doubles each attempt).
    pub backoff_s: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_s: 1.0,
        }
    }
}

/// Name and options of a memoized step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepConfig {
    pub name: String,
    /// Safe to execute more than once; enables `retry`.
    pub idempotent: bool,
    pub retry: RetryConfig,
    /// Per-attempt time limit.
    pub timeout: Option<Duration>,
}

impl StepConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, backoff_s: f64) -> Self {
        self.retry = RetryConfig {
            max_retries,
            backoff_s,
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&str> for StepConfig {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for StepConfig {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// How often and how long `wait_for` polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 60,
        }
    }
}

/// How `wait_flow_to_complete` polls. Without `max_attempts` it keeps
/// polling until the flow is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Delay between polls; the engine's polling interval when unset.
    pub interval: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl WaitOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            max_attempts: None,
        }
    }

    /// Give up with [`FlowError::StillRunning`](crate::error::FlowError::StillRunning)
    /// after `max_attempts` polls.
    pub fn at_most(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ambient auth context, checked by the flow's auth policy and exposed
    /// to steps through [`ExecutionContext::auth`].
    pub auth: Option<Value>,
}

impl RunOptions {
    pub fn with_auth(auth: Value) -> Self {
        Self { auth: Some(auth) }
    }
}
