//! Unary actions invoked from flow steps (`(input) -> output`).
//!
//! Model calls and other external collaborators are registered here and
//! called through [`ExecutionContext::run_action`](crate::engine::context::ExecutionContext::run_action),
//! which memoizes them like any other step.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;

/// Trait that all actions must implement.
#[async_trait]
pub trait Action: Send + Sync {
    /// Action identifier (e.g., "generate", "embed").
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema the input must satisfy, if any.
    fn input_schema(&self) -> Option<&Value> {
        None
    }

    /// Execute the action with an already validated input.
    async fn execute(&self, input: Value) -> Result<Value>;
}

type ActionFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// Action backed by a closure.
pub struct FnAction {
    name: String,
    description: String,
    input_schema: Option<Value>,
    func: Arc<ActionFn>,
}

impl FnAction {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: None,
            func: Arc::new(move |input: Value| -> BoxFuture<'static, Result<Value>> { Box::pin(func(input)) }),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }
}

#[async_trait]
impl Action for FnAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Option<&Value> {
        self.input_schema.as_ref()
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        (self.func)(input).await
    }
}

/// Registry of available actions.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action implementation, replacing any action of the same name.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    /// Look up an action by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// List all registered actions with descriptions.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .actions
            .values()
            .map(|a| (a.name(), a.description()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}
