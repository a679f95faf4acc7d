//! Per-attempt execution context threaded through a running flow body.
//!
//! Every step primitive derives a memo key from the step name and the number
//! of times that name was already reached in this attempt, so replaying the
//! body after a resume lines cached outcomes up with the same step
//! occurrences. A step whose key is cached returns the cached outcome without
//! running; otherwise the step runs, its outcome is written to the cache and
//! the state is persisted before the step returns.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::actions::ActionRegistry;
use crate::engine::flow::{PollingConfig, StepConfig};
use crate::engine::types::*;
use crate::error::FlowError;
use crate::schema;
use crate::storage::StateStore;

/// Handle given to a flow body. Cheap to clone; all clones share one attempt.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    flow_id: String,
    flow_name: String,
    state: Mutex<ContextState>,
    /// Where this flow's state is persisted. `None` for non-durable runs.
    store: Option<Arc<dyn StateStore>>,
    /// Store used to look up other flows for `wait_for`.
    lookup: Option<Arc<dyn StateStore>>,
    actions: Arc<ActionRegistry>,
    chunks: Option<UnboundedSender<Value>>,
    auth: Option<Value>,
    polling: PollingConfig,
}

struct ContextState {
    flow: FlowState,
    occurrences: HashMap<String, u32>,
    blocked: Option<BlockedStep>,
    replayed: usize,
    computed: usize,
}

/// Everything the engine hands to a new context.
pub(crate) struct ContextSeed {
    pub state: FlowState,
    pub store: Option<Arc<dyn StateStore>>,
    pub lookup: Option<Arc<dyn StateStore>>,
    pub actions: Arc<ActionRegistry>,
    pub chunks: Option<UnboundedSender<Value>>,
    pub polling: PollingConfig,
}

/// What an attempt left behind once the body returned.
pub(crate) struct AttemptResult {
    pub state: FlowState,
    pub blocked: Option<BlockedStep>,
    pub replayed: usize,
    pub computed: usize,
}

impl ExecutionContext {
    pub(crate) fn new(seed: ContextSeed) -> Self {
        let auth = seed.state.auth.clone();
        Self {
            inner: Arc::new(ContextInner {
                flow_id: seed.state.flow_id.clone(),
                flow_name: seed.state.name.clone(),
                state: Mutex::new(ContextState {
                    flow: seed.state,
                    occurrences: HashMap::new(),
                    blocked: None,
                    replayed: 0,
                    computed: 0,
                }),
                store: seed.store,
                lookup: seed.lookup,
                actions: seed.actions,
                chunks: seed.chunks,
                auth,
                polling: seed.polling,
            }),
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.inner.flow_id
    }

    pub fn flow_name(&self) -> &str {
        &self.inner.flow_name
    }

    /// Ambient auth context of the invocation, if any.
    pub fn auth(&self) -> Option<&Value> {
        self.inner.auth.as_ref()
    }

    /// Whether this run's state is persisted and can therefore block.
    pub fn is_durable(&self) -> bool {
        self.inner.store.is_some()
    }

    /// Whether the caller attached a chunk consumer.
    pub fn is_streaming(&self) -> bool {
        self.inner.chunks.is_some()
    }

    /// Send an intermediate chunk to the caller. A no-op without a consumer.
    pub fn send_chunk<T: Serialize>(&self, chunk: T) -> Result<(), FlowError> {
        if let Some(tx) = &self.inner.chunks {
            let value = serde_json::to_value(chunk)?;
            if tx.send(value).is_err() {
                debug!(flow_id = %self.inner.flow_id, "Chunk consumer went away");
            }
        }
        Ok(())
    }

    /// Run a memoized step.
    ///
    /// `f` is only invoked when the step has no cached outcome. A failure is
    /// cached too, so later attempts see the same error without re-running
    /// `f`. Idempotent steps are retried according to `config.retry`.
    pub async fn run<T, F, Fut>(&self, config: impl Into<StepConfig>, f: F) -> Result<T, FlowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let config = config.into();
        self.ensure_running()?;
        let key = self.next_key(&config.name)?;
        if let Some(outcome) = self.cached(&key) {
            return restore(&config.name, outcome);
        }

        let result = self.attempt(&config, &key, f).await;
        self.settle(&config.name, &key, result).await
    }

    /// Run a memoized step that takes an explicit input.
    pub async fn run_with_input<I, T, F, Fut>(
        &self,
        config: impl Into<StepConfig>,
        input: I,
        mut f: F,
    ) -> Result<T, FlowError>
    where
        I: Clone,
        T: Serialize + DeserializeOwned,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(config, || f(input.clone())).await
    }

    /// Invoke a registered action as a memoized step.
    pub async fn run_action(
        &self,
        config: impl Into<StepConfig>,
        action: &str,
        input: Value,
    ) -> Result<Value, FlowError> {
        let config = config.into();
        let handler = self
            .inner
            .actions
            .get(action)
            .ok_or_else(|| FlowError::UnknownAction(action.to_string()))?;
        self.ensure_running()?;
        let key = self.next_key(&config.name)?;
        if let Some(outcome) = self.cached(&key) {
            return restore(&config.name, outcome);
        }

        schema::validate_opt(
            handler.input_schema(),
            &input,
            &format!("input of action '{}'", action),
        )?;

        let result = self
            .attempt(&config, &key, || handler.execute(input.clone()))
            .await;
        self.settle(&config.name, &key, result).await
    }

    /// Suspend until an external payload arrives through `resume`.
    ///
    /// The first time the step is reached the run blocks and this returns
    /// [`FlowError::Interrupted`], which the body must propagate. When the
    /// engine replays the body after a resume, the payload is validated
    /// against `schema`, deserialized, cached and returned.
    pub async fn interrupt<R>(&self, step: &str, schema: Option<Value>) -> Result<R, FlowError>
    where
        R: Serialize + DeserializeOwned,
    {
        self.interrupt_with(step, schema, |payload| async move {
            anyhow::Ok(serde_json::from_value::<R>(payload)?)
        })
        .await
    }

    /// Like [`interrupt`](Self::interrupt), mapping the payload through `f`
    /// before it is cached.
    pub async fn interrupt_with<R, F, Fut>(
        &self,
        step: &str,
        schema: Option<Value>,
        f: F,
    ) -> Result<R, FlowError>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        self.ensure_running()?;
        let key = self.next_key(step)?;
        if let Some(outcome) = self.cached(&key) {
            return restore(step, outcome);
        }

        let Some(payload) = self.event(&key) else {
            return Err(self.block(BlockedStep {
                name: step.to_string(),
                key,
                schema,
                kind: BlockKind::Interrupt,
                wake_at: None,
                attempt: 0,
            }));
        };

        schema::validate_opt(
            schema.as_ref(),
            &payload,
            &format!("resume payload of step '{}'", step),
        )?;

        let result = f(payload).await;
        self.settle(step, &key, result).await
    }

    /// Pause the flow for `duration`.
    ///
    /// Durable runs block and are woken by the engine's invoker once the
    /// timer fires; a replay after the wake does not sleep again.
    /// Non-durable runs sleep inline.
    pub async fn sleep(&self, step: &str, duration: Duration) -> Result<(), FlowError> {
        self.ensure_running()?;
        let key = self.next_key(step)?;
        if let Some(outcome) = self.cached(&key) {
            return restore::<Value>(step, outcome).map(|_| ());
        }

        if self.is_durable() && self.event(&key).is_none() {
            let wake_at = wake_time(duration, || format!("duration of step '{}'", step))?;
            return Err(self.block(BlockedStep {
                name: step.to_string(),
                key,
                schema: None,
                kind: BlockKind::Sleep,
                wake_at: Some(wake_at),
                attempt: 0,
            }));
        }

        if !self.is_durable() {
            tokio::time::sleep(duration).await;
        }
        self.settle(step, &key, anyhow::Ok(Value::Null))
            .await
            .map(|_: Value| ())
    }

    /// Wait until every flow in `flow_ids` (instances of `flow_name`) is done
    /// and return their operations.
    ///
    /// Durable runs poll once per attempt and block between polls, to be
    /// woken by the invoker after `polling.interval`. Non-durable runs poll
    /// inline. Once `polling.max_attempts` polls found unfinished flows the
    /// step fails with [`FlowError::Timeout`].
    pub async fn wait_for(
        &self,
        step: &str,
        flow_name: &str,
        flow_ids: &[String],
        polling: Option<PollingConfig>,
    ) -> Result<Vec<Operation>, FlowError> {
        self.ensure_running()?;
        let key = self.next_key(step)?;
        if let Some(outcome) = self.cached(&key) {
            return restore(step, outcome);
        }

        let polling = polling.unwrap_or(self.inner.polling);
        let store = self
            .inner
            .lookup
            .clone()
            .ok_or_else(|| FlowError::NotDurable(flow_name.to_string()))?;

        let mut attempt = self
            .event(&key)
            .and_then(|e| e.get("attempt").and_then(Value::as_u64))
            .map(|n| n as u32)
            .unwrap_or(0);

        loop {
            attempt += 1;
            let operations = match poll_operations(store.as_ref(), flow_name, flow_ids).await {
                Ok(operations) => operations,
                // The awaited flows' store failing is this step's failure.
                Err(FlowError::Store(err)) => {
                    return self.settle(step, &key, Err::<Vec<Operation>, _>(err)).await;
                }
                Err(err) => return Err(err),
            };
            let pending = operations.iter().filter(|op| !op.done).count();
            debug!(
                flow_id = %self.inner.flow_id,
                step = %step,
                attempt = attempt,
                pending = pending,
                "Polled awaited flows"
            );

            if pending == 0 {
                return self.settle(step, &key, anyhow::Ok(operations)).await;
            }

            if attempt >= polling.max_attempts {
                let timeout = FlowError::Timeout {
                    step: step.to_string(),
                    attempts: attempt,
                };
                self.record(&key, StepOutcome::Error(ErrorInfo::new(timeout.to_string())))
                    .await?;
                return Err(timeout);
            }

            if self.is_durable() {
                let wake_at = wake_time(polling.interval, || format!("polling interval of step '{}'", step))?;
                return Err(self.block(BlockedStep {
                    name: step.to_string(),
                    key,
                    schema: None,
                    kind: BlockKind::WaitFor,
                    wake_at: Some(wake_at),
                    attempt,
                }));
            }

            tokio::time::sleep(polling.interval).await;
        }
    }

    // --- Internals ---

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn blocked_step(&self) -> Option<String> {
        self.lock().blocked.as_ref().map(|b| b.name.clone())
    }

    /// Steps reached after the run blocked must not execute.
    fn ensure_running(&self) -> Result<(), FlowError> {
        match self.blocked_step() {
            Some(step) => Err(FlowError::Interrupted { step }),
            None => Ok(()),
        }
    }

    /// Allocate the memo key for the next occurrence of `name`: `name` for
    /// the first occurrence, `name[k]` for the k-th repeat.
    fn next_key(&self, name: &str) -> Result<String, FlowError> {
        if name.is_empty() || name.contains(['[', ']']) {
            return Err(FlowError::validation(
                "step name",
                vec![format!("invalid step name {:?}: must be non-empty and must not contain '[' or ']'", name)],
            ));
        }
        let mut st = self.lock();
        let count = st.occurrences.entry(name.to_string()).or_insert(0);
        let key = if *count == 0 {
            name.to_string()
        } else {
            format!("{}[{}]", name, count)
        };
        *count += 1;
        Ok(key)
    }

    fn cached(&self, key: &str) -> Option<StepOutcome> {
        let mut st = self.lock();
        let outcome = st.flow.cache.get(key).cloned();
        if outcome.is_some() {
            st.replayed += 1;
            debug!(flow_id = %self.inner.flow_id, step = %key, "Replaying cached step");
        }
        outcome
    }

    fn event(&self, key: &str) -> Option<Value> {
        self.lock().flow.events_triggered.get(key).cloned()
    }

    fn block(&self, step: BlockedStep) -> FlowError {
        let mut st = self.lock();
        let name = step.name.clone();
        if st.blocked.is_none() {
            info!(
                flow_id = %self.inner.flow_id,
                step = %step.key,
                kind = ?step.kind,
                "Flow blocked on step"
            );
            st.blocked = Some(step);
        }
        FlowError::Interrupted { step: name }
    }

    /// Execute a step body, retrying idempotent steps with exponential backoff.
    async fn attempt<T, F, Fut>(&self, config: &StepConfig, key: &str, mut f: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = if config.idempotent {
            config.retry.max_retries + 1
        } else {
            if config.retry.max_retries > 0 {
                warn!(step = %key, "Retries ignored for a step that is not idempotent");
            }
            1
        };

        let mut attempt = 1;
        loop {
            debug!(flow_id = %self.inner.flow_id, step = %key, attempt = attempt, "Running step");

            let result = match config.timeout {
                Some(limit) => match tokio::time::timeout(limit, f()).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::anyhow!("Step '{}' timed out after {:?}", config.name, limit)),
                },
                None => f().await,
            };

            let retry = attempt < max_attempts && self.blocked_step().is_none();
            match result {
                Ok(value) => return Ok(value),
                Err(e) if retry => {
                    let delay = backoff(config.retry.backoff_s, attempt);
                    warn!(step = %key, attempt = attempt, error = %format!("{:#}", e), delay = ?delay, "Step attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cache the outcome of a freshly executed step and hand it back.
    async fn settle<T: Serialize>(&self, name: &str, key: &str, result: anyhow::Result<T>) -> Result<T, FlowError> {
        match result {
            Ok(value) => {
                self.record(key, StepOutcome::Value(serde_json::to_value(&value)?))
                    .await?;
                Ok(value)
            }
            Err(err) => {
                if let Some(step) = self.blocked_step() {
                    return Err(FlowError::Interrupted { step });
                }
                let error = match err.downcast::<FlowError>() {
                    Ok(flow_err) if flow_err.aborts_run() => return Err(flow_err),
                    Ok(FlowError::Step { error, .. }) => error,
                    Ok(flow_err) => ErrorInfo::new(flow_err.to_string()),
                    Err(err) => ErrorInfo::from_anyhow(&err),
                };
                warn!(flow_id = %self.inner.flow_id, step = %key, error = %error.message, "Step failed");
                self.record(key, StepOutcome::Error(error.clone())).await?;
                Err(FlowError::Step {
                    step: name.to_string(),
                    error,
                })
            }
        }
    }

    /// Write a cache entry and persist the state.
    async fn record(&self, key: &str, outcome: StepOutcome) -> Result<(), FlowError> {
        let snapshot = {
            let mut st = self.lock();
            if !st.flow.memoize(key, outcome) {
                warn!(flow_id = %self.inner.flow_id, step = %key, "Step already cached, keeping the first outcome");
                return Ok(());
            }
            st.computed += 1;
            match self.inner.store {
                Some(_) => {
                    st.flow.version += 1;
                    Some(st.flow.clone())
                }
                None => None,
            }
        };

        if let (Some(store), Some(snapshot)) = (&self.inner.store, snapshot) {
            if let Err(e) = store.save(&self.inner.flow_id, &snapshot).await {
                self.rollback_version();
                return Err(FlowError::from_store(&self.inner.flow_id, e));
            }
        }
        Ok(())
    }

    fn rollback_version(&self) {
        let mut st = self.lock();
        st.flow.version = st.flow.version.saturating_sub(1);
    }

    /// Snapshot of the attempt for the engine.
    pub(crate) fn finish(&self) -> AttemptResult {
        let st = self.lock();
        AttemptResult {
            state: st.flow.clone(),
            blocked: st.blocked.clone(),
            replayed: st.replayed,
            computed: st.computed,
        }
    }
}

/// Exponential backoff before retry `attempt + 1`. Unusable values mean no delay.
fn backoff(backoff_s: f64, attempt: u32) -> Duration {
    let secs = backoff_s * 2.0_f64.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

/// Absolute time `delay` from now, rejected when it leaves the calendar range.
fn wake_time(delay: Duration, target: impl FnOnce() -> String) -> Result<DateTime<Utc>, FlowError> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .ok_or_else(|| FlowError::validation(target(), vec![format!("{:?} is out of range", delay)]))
}

/// Turn a cached outcome back into the step's return value.
fn restore<T: DeserializeOwned>(name: &str, outcome: StepOutcome) -> Result<T, FlowError> {
    match outcome {
        StepOutcome::Value(value) => Ok(serde_json::from_value(value)?),
        StepOutcome::Error(error) => Err(FlowError::Step {
            step: name.to_string(),
            error,
        }),
    }
}

async fn poll_operations(
    store: &dyn StateStore,
    flow_name: &str,
    flow_ids: &[String],
) -> Result<Vec<Operation>, FlowError> {
    let mut operations = Vec::with_capacity(flow_ids.len());
    for flow_id in flow_ids {
        let state = store
            .load(flow_id)
            .await
            .map_err(|e| FlowError::from_store(flow_id, e))?
            .filter(|s| s.name == flow_name)
            .ok_or_else(|| FlowError::not_found(flow_id))?;
        operations.push(state.to_operation());
    }
    Ok(operations)
}
