use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::actions::{Action, ActionRegistry};
use crate::engine::flow::FlowDefinition;
use crate::error::FlowError;
use crate::storage::StateStore;

/// Builds the state store used in one environment.
pub type StoreFactory = Arc<dyn Fn() -> Result<Arc<dyn StateStore>> + Send + Sync>;

/// Flow definitions, actions and per-environment state stores an engine is
/// built from.
#[derive(Default)]
pub struct Registry {
    flows: HashMap<String, Arc<FlowDefinition>>,
    actions: Arc<ActionRegistry>,
    stores: HashMap<String, StoreFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow definition. Names must be unique.
    pub fn register_flow(&mut self, flow: FlowDefinition) -> Result<(), FlowError> {
        if self.flows.contains_key(&flow.name) {
            return Err(FlowError::DuplicateFlow(flow.name));
        }
        self.flows.insert(flow.name.clone(), Arc::new(flow));
        Ok(())
    }

    /// Register an action implementation, replacing any action of the same name.
    pub fn register_action(&mut self, action: Arc<dyn Action>) {
        Arc::make_mut(&mut self.actions).register(action);
    }

    /// Register the store factory for an environment (e.g. "dev", "prod").
    pub fn register_store<F>(&mut self, env: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn StateStore>> + Send + Sync + 'static,
    {
        self.stores.insert(env.into(), Arc::new(factory));
    }

    /// Look up a flow by name.
    pub fn get_flow(&self, name: &str) -> Option<Arc<FlowDefinition>> {
        self.flows.get(name).cloned()
    }

    /// Registered flow names, sorted.
    pub fn flow_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.flows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn actions(&self) -> Arc<ActionRegistry> {
        self.actions.clone()
    }

    /// Build the state store for an environment, `None` when the environment
    /// has no store registered.
    pub fn store_for(&self, env: &str) -> Result<Option<Arc<dyn StateStore>>> {
        self.stores.get(env).map(|factory| factory()).transpose()
    }
}
