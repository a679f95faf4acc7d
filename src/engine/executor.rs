use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::context::{ContextSeed, ExecutionContext};
use crate::engine::flow::{FlowDefinition, RunOptions, WaitOptions};
use crate::engine::registry::Registry;
use crate::engine::scheduler::{Invoker, ScheduledKind, ScheduledRun, TokioInvoker};
use crate::engine::streaming::FlowStream;
use crate::engine::types::*;
use crate::error::{FlowError, find_flow_error};
use crate::schema;
use crate::storage::StateStore;

/// The durable flow execution engine.
///
/// Cheap to clone; clones share the registry, store and invoker.
#[derive(Clone)]
pub struct FlowEngine {
    registry: Arc<Registry>,
    store: Option<Arc<dyn StateStore>>,
    invoker: Arc<dyn Invoker>,
    config: EngineConfig,
}

/// Result of one execution attempt.
struct Execution {
    state: FlowState,
    /// The failure to rethrow to a synchronous caller.
    error: Option<FlowError>,
}

impl FlowEngine {
    pub fn new(registry: Arc<Registry>, store: Option<Arc<dyn StateStore>>) -> Self {
        Self {
            registry,
            store,
            invoker: Arc::new(TokioInvoker),
            config: EngineConfig::default(),
        }
    }

    /// Build an engine whose store is the one the registry provides for
    /// `config.env`.
    pub fn from_config(registry: Arc<Registry>, config: EngineConfig) -> anyhow::Result<Self> {
        let store = registry.store_for(&config.env)?;
        if store.is_none() {
            warn!(env = %config.env, "No state store registered, flows will not be persisted");
        }
        Ok(Self::new(registry, store).with_config(config))
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> Option<&Arc<dyn StateStore>> {
        self.store.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a flow inline for a synchronous caller.
    ///
    /// Returns the response, or the error the run ended with. A run that
    /// blocks yields [`FlowError::StillRunning`]; a durable one can then be
    /// resumed by its id.
    pub async fn invoke(&self, name: &str, input: Value, options: RunOptions) -> Result<Value, FlowError> {
        let (def, state) = self.prepare(name, input, options)?;
        let persist = self.persistence_for(&def);
        let execution = self
            .execute(&def, state, ExecutionTrigger::Start, persist, None)
            .await?;
        self.after_execution(&execution.state);

        if let Some(err) = execution.error {
            return Err(err);
        }
        execution.state.to_operation().into_result()
    }

    /// Run a flow inline and report the outcome as an [`Operation`].
    ///
    /// Failures of the flow body are captured in the operation's result
    /// rather than returned as errors.
    pub async fn start(&self, name: &str, input: Value, options: RunOptions) -> Result<Operation, FlowError> {
        let (def, state) = self.prepare(name, input, options)?;
        let persist = self.persistence_for(&def);
        let execution = self
            .execute(&def, state, ExecutionTrigger::Start, persist, None)
            .await?;
        self.after_execution(&execution.state);
        Ok(execution.state.to_operation())
    }

    /// Create a flow and hand its first execution to the invoker.
    ///
    /// The returned operation is never done; the state exists in the store
    /// with status `created` when this returns.
    pub async fn schedule_flow(
        &self,
        name: &str,
        input: Value,
        delay: Option<Duration>,
        options: RunOptions,
    ) -> Result<Operation, FlowError> {
        let (def, mut state) = self.prepare(name, input, options)?;
        let store = self.require_store(&def)?;
        self.save(&store, &mut state).await?;

        let run = ScheduledRun {
            flow_id: state.flow_id.clone(),
            flow_name: def.name.clone(),
            kind: ScheduledKind::Start,
            delay: delay.unwrap_or_default(),
        };
        info!(flow_id = %state.flow_id, flow = %def.name, delay = ?run.delay, "Scheduling flow");
        self.invoker
            .dispatch(self.clone(), run)
            .map_err(FlowError::Dispatch)?;

        Ok(state.to_operation())
    }

    /// Execute a job produced by [`schedule_flow`](Self::schedule_flow) or a
    /// timer-blocked step.
    pub async fn run_scheduled(&self, run: &ScheduledRun) -> Result<Operation, FlowError> {
        match run.kind {
            ScheduledKind::Start => self.start_created(&run.flow_id).await,
            ScheduledKind::Wake => self.wake(&run.flow_id).await,
        }
    }

    /// Resume a flow blocked on an interrupt with the payload it awaits.
    pub async fn resume_flow(
        &self,
        name: &str,
        flow_id: &str,
        payload: Value,
        options: RunOptions,
    ) -> Result<Operation, FlowError> {
        let def = self.flow(name)?;
        let store = self.require_store(&def)?;
        let mut state = self.load_from(&store, &def.name, flow_id).await?;

        let blocked = match (&state.blocked_on_step, state.operation.done) {
            (Some(blocked), false) => blocked.clone(),
            _ => {
                return Err(FlowError::NotBlocked {
                    flow_id: flow_id.to_string(),
                    status: state.status.to_string(),
                });
            }
        };
        if blocked.kind != BlockKind::Interrupt {
            return Err(FlowError::validation(
                format!("resume of step '{}'", blocked.name),
                vec!["step is waiting on a timer and cannot be resumed with a payload".to_string()],
            ));
        }

        schema::validate_opt(
            blocked.schema.as_ref(),
            &payload,
            &format!("resume payload of step '{}'", blocked.name),
        )?;

        let auth = options.auth.or_else(|| state.auth.clone());
        def.authorize(auth.as_ref(), &state.input)?;
        state.auth = auth;

        info!(flow_id = %flow_id, step = %blocked.key, "Resuming flow");
        state.blocked_on_step = None;
        state.events_triggered.insert(blocked.key, payload);

        let execution = self
            .execute(&def, state, ExecutionTrigger::Resume, Some(store), None)
            .await?;
        self.after_execution(&execution.state);
        Ok(execution.state.to_operation())
    }

    /// Re-invoke a flow blocked on `sleep` or `wait_for` once its timer is due.
    ///
    /// Wakes for flows that are done, not blocked or blocked on an interrupt
    /// are ignored; early wakes are re-dispatched for the remaining delay.
    pub async fn wake(&self, flow_id: &str) -> Result<Operation, FlowError> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| FlowError::NotDurable(flow_id.to_string()))?;
        let mut state = store
            .load(flow_id)
            .await
            .map_err(|e| FlowError::from_store(flow_id, e))?
            .ok_or_else(|| FlowError::not_found(flow_id))?;

        let blocked = match (&state.blocked_on_step, state.operation.done) {
            (Some(blocked), false) if blocked.kind != BlockKind::Interrupt => blocked.clone(),
            _ => {
                debug!(flow_id = %flow_id, status = %state.status, "Ignoring wake");
                return Ok(state.to_operation());
            }
        };

        let now = Utc::now();
        if let Some(wake_at) = blocked.wake_at
            && wake_at > now
        {
            let remaining = (wake_at - now).to_std().unwrap_or_default();
            debug!(flow_id = %flow_id, remaining = ?remaining, "Wake arrived early, re-dispatching");
            self.dispatch_wake(&state, remaining)?;
            return Ok(state.to_operation());
        }

        let def = self.flow(&state.name)?;
        info!(flow_id = %flow_id, step = %blocked.key, kind = ?blocked.kind, "Waking flow");
        state.blocked_on_step = None;
        state.events_triggered.insert(
            blocked.key,
            json!({ "attempt": blocked.attempt, "firedAt": now }),
        );

        let execution = self
            .execute(&def, state, ExecutionTrigger::Wake, Some(store), None)
            .await?;
        self.after_execution(&execution.state);
        Ok(execution.state.to_operation())
    }

    /// Current operation of a flow.
    pub async fn get_flow_state(&self, name: &str, flow_id: &str) -> Result<Operation, FlowError> {
        Ok(self.load_state(name, flow_id).await?.to_operation())
    }

    /// Full persisted state of a flow.
    pub async fn load_state(&self, name: &str, flow_id: &str) -> Result<FlowState, FlowError> {
        let def = self.flow(name)?;
        let store = self.require_store(&def)?;
        self.load_from(&store, &def.name, flow_id).await
    }

    /// Persisted states of one flow definition, newest first.
    pub async fn list_flow_states(&self, name: &str, mut query: ListQuery) -> Result<FlowStateList, FlowError> {
        let def = self.flow(name)?;
        let store = self.require_store(&def)?;
        query.name = Some(def.name.clone());
        store
            .list(&query)
            .await
            .map_err(|e| FlowError::from_store(&def.name, e))
    }

    /// Poll a flow until it is done and return its response.
    ///
    /// A captured failure is raised as [`FlowError::Execution`]. Polling only
    /// stops early when `options.max_attempts` is set, with
    /// [`FlowError::StillRunning`].
    pub async fn wait_flow_to_complete(
        &self,
        name: &str,
        flow_id: &str,
        options: WaitOptions,
    ) -> Result<Value, FlowError> {
        let interval = options.interval.unwrap_or(self.config.polling.interval);
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
            debug!(flow_id = %flow_id, attempt = attempt, "Flow not done yet");
            tokio::time::sleep(interval).await;
        }
    }

    /// Start a flow with a chunk consumer attached. The run executes on a
    /// spawned task; chunks arrive on the returned stream before its output.
    pub async fn stream_flow(&self, name: &str, input: Value, options: RunOptions) -> Result<FlowStream, FlowError> {
        let (def, state) = self.prepare(name, input, options)?;
        let persist = self.persistence_for(&def);
        let flow_id = state.flow_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let engine = self.clone();
        let output = tokio::spawn(async move {
            let execution = engine
                .execute(&def, state, ExecutionTrigger::Start, persist, Some(tx))
                .await?;
            engine.after_execution(&execution.state);
            Ok(execution.state.to_operation())
        });

        Ok(FlowStream::new(flow_id, rx, output))
    }

    // --- Internals ---

    fn flow(&self, name: &str) -> Result<Arc<FlowDefinition>, FlowError> {
        self.registry
            .get_flow(name)
            .ok_or_else(|| FlowError::UnknownFlow(name.to_string()))
    }

    /// Store this flow persists into, if persistence is enabled for it.
    fn persistence_for(&self, def: &FlowDefinition) -> Option<Arc<dyn StateStore>> {
        self.store
            .clone()
            .filter(|_| def.durable || self.config.persist_non_durable)
    }

    fn require_store(&self, def: &FlowDefinition) -> Result<Arc<dyn StateStore>, FlowError> {
        self.persistence_for(def)
            .ok_or_else(|| FlowError::NotDurable(def.name.clone()))
    }

    /// Validate and authorize a new invocation and create its state.
    fn prepare(
        &self,
        name: &str,
        input: Value,
        options: RunOptions,
    ) -> Result<(Arc<FlowDefinition>, FlowState), FlowError> {
        let def = self.flow(name)?;
        def.validate_input(&input)?;
        def.authorize(options.auth.as_ref(), &input)?;

        let mut state = FlowState::new(&def.name, &Uuid::new_v4().to_string(), input);
        state.auth = options.auth;
        Ok((def, state))
    }

    async fn load_from(
        &self,
        store: &Arc<dyn StateStore>,
        name: &str,
        flow_id: &str,
    ) -> Result<FlowState, FlowError> {
        store
            .load(flow_id)
            .await
            .map_err(|e| FlowError::from_store(flow_id, e))?
            .filter(|s| s.name == name)
            .ok_or_else(|| FlowError::not_found(flow_id))
    }

    async fn save(&self, store: &Arc<dyn StateStore>, state: &mut FlowState) -> Result<(), FlowError> {
        state.version += 1;
        if let Err(e) = store.save(&state.flow_id, state).await {
            state.version -= 1;
            let err = FlowError::from_store(&state.flow_id, e);
            warn!(flow_id = %state.flow_id, error = %err, "Failed to persist flow state");
            return Err(err);
        }
        Ok(())
    }

    /// First execution of a flow created by `schedule_flow`.
    async fn start_created(&self, flow_id: &str) -> Result<Operation, FlowError> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| FlowError::NotDurable(flow_id.to_string()))?;
        let state = store
            .load(flow_id)
            .await
            .map_err(|e| FlowError::from_store(flow_id, e))?
            .ok_or_else(|| FlowError::not_found(flow_id))?;

        if state.status != FlowStatus::Created {
            debug!(flow_id = %flow_id, status = %state.status, "Scheduled start already handled");
            return Ok(state.to_operation());
        }

        let def = self.flow(&state.name)?;
        let execution = self
            .execute(&def, state, ExecutionTrigger::Start, Some(store), None)
            .await?;
        self.after_execution(&execution.state);
        Ok(execution.state.to_operation())
    }

    /// Run the flow body once against `state` and record the outcome.
    async fn execute(
        &self,
        def: &FlowDefinition,
        mut state: FlowState,
        trigger: ExecutionTrigger,
        store: Option<Arc<dyn StateStore>>,
        chunks: Option<UnboundedSender<Value>>,
    ) -> Result<Execution, FlowError> {
        state.status = FlowStatus::Running;
        state.executions.push(FlowExecution {
            trigger,
            start_time: Utc::now(),
            end_time: None,
        });
        if let Some(store) = &store {
            self.save(store, &mut state).await?;
        }

        let flow_id = state.flow_id.clone();
        info!(flow_id = %flow_id, flow = %def.name, trigger = ?trigger, "Executing flow");

        let input = state.input.clone();
        let ctx = ExecutionContext::new(ContextSeed {
            state,
            store: store.clone(),
            lookup: self.store.clone(),
            actions: self.registry.actions(),
            chunks,
            polling: self.config.polling,
        });

        let result = def.call(ctx.clone(), input).await;
        let attempt = ctx.finish();
        drop(ctx);

        let mut state = attempt.state;
        let now = Utc::now();
        if let Some(execution) = state.executions.last_mut() {
            execution.end_time = Some(now);
        }

        let mut error = None;
        if let Some(blocked) = attempt.blocked {
            info!(
                flow_id = %flow_id,
                step = %blocked.key,
                replayed = attempt.replayed,
                computed = attempt.computed,
                "Flow execution blocked"
            );
            state.status = FlowStatus::Blocked;
            state.blocked_on_step = Some(blocked);
            state.operation = Operation {
                name: flow_id.clone(),
                done: false,
                blocked_on_step: state.blocked_on_step.clone(),
                result: None,
            };
        } else {
            match result {
                Ok(output) => match def.validate_output(&output) {
                    Ok(()) => {
                        info!(
                            flow_id = %flow_id,
                            replayed = attempt.replayed,
                            computed = attempt.computed,
                            "Flow completed"
                        );
                        finish(&mut state, FlowStatus::Completed, OperationResult {
                            response: Some(output),
                            ..OperationResult::default()
                        });
                    }
                    Err(e) => {
                        error!(flow_id = %flow_id, error = %e, "Flow output rejected");
                        finish(&mut state, FlowStatus::Failed, OperationResult {
                            error: Some(e.to_string()),
                            ..OperationResult::default()
                        });
                        error = Some(e);
                    }
                },
                Err(e) => {
                    if let Some(flow_err) = find_flow_error(&e)
                        && matches!(flow_err, FlowError::Conflict { .. } | FlowError::Store(_))
                    {
                        warn!(flow_id = %flow_id, error = %flow_err, "Aborting execution without saving");
                        return Err(e
                            .downcast::<FlowError>()
                            .unwrap_or_else(FlowError::Store));
                    }

                    let info = failure_info(&e);
                    error!(flow_id = %flow_id, error = %info.message, "Flow failed");
                    finish(&mut state, FlowStatus::Failed, OperationResult {
                        response: None,
                        error: Some(info.message.clone()),
                        stacktrace: info.stacktrace.clone(),
                    });
                    error = Some(FlowError::Execution {
                        message: info.message,
                        stacktrace: info.stacktrace,
                    });
                }
            }
        }

        if let Some(store) = &store {
            self.save(store, &mut state).await?;
        }

        Ok(Execution { state, error })
    }

    /// Arrange a wake for flows that blocked on a timer.
    fn after_execution(&self, state: &FlowState) {
        let Some(blocked) = &state.blocked_on_step else {
            return;
        };
        let Some(wake_at) = blocked.wake_at else {
            return;
        };
        if self.store.is_none() || state.is_done() {
            return;
        }
        let delay = (wake_at - Utc::now()).to_std().unwrap_or_default();
        if let Err(e) = self.dispatch_wake(state, delay) {
            error!(flow_id = %state.flow_id, error = %e, "Failed to schedule wake");
        }
    }

    fn dispatch_wake(&self, state: &FlowState, delay: Duration) -> Result<(), FlowError> {
        self.invoker
            .dispatch(
                self.clone(),
                ScheduledRun {
                    flow_id: state.flow_id.clone(),
                    flow_name: state.name.clone(),
                    kind: ScheduledKind::Wake,
                    delay,
                },
            )
            .map_err(FlowError::Dispatch)
    }
}

/// Mark a run terminal.
fn finish(state: &mut FlowState, status: FlowStatus, result: OperationResult) {
    state.status = status;
    state.end_time = Some(Utc::now());
    state.blocked_on_step = None;
    state.operation = Operation {
        name: state.flow_id.clone(),
        done: true,
        blocked_on_step: None,
        result: Some(result),
    };
}

/// Message and stacktrace of a failed flow body. A propagated step failure
/// keeps the outcome recorded for the step.
fn failure_info(err: &anyhow::Error) -> ErrorInfo {
    match err.downcast_ref::<FlowError>() {
        Some(FlowError::Step { error, .. }) => error.clone(),
        _ => ErrorInfo::from_anyhow(err),
    }
}
