use crate::agent::{Agent, AgentDescriptor};
use phasegate_core::{PhasegateError, PhasegateResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Central registry of available agents, keyed by id.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register an agent, replacing any previous agent with the same id.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let id = agent.descriptor().id.clone();
        if self.agents.contains_key(&id) {
            warn!(agent = %id, "Replacing previously registered agent");
        }
        info!(agent = %id, capabilities = %agent.descriptor().capabilities, "Registered agent");
        self.agents.insert(id, agent);
    }

    /// Agent registered under `id`, if any.
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Agent>> {
        self.agents.get(id)
    }

    /// Look up an agent, failing with a configuration error if unknown.
    pub fn resolve(&self, id: &str) -> PhasegateResult<Arc<dyn Agent>> {
        self.agents
            .get(id)
            .cloned()
            .ok_or_else(|| PhasegateError::Config(format!("Unknown agent: {id}")))
    }

    /// Whether an agent is registered under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Descriptors sorted by id.
    pub fn list_descriptors(&self) -> Vec<&AgentDescriptor> {
        let mut descriptors: Vec<&AgentDescriptor> =
            self.agents.values().map(|a| a.descriptor()).collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    /// Number of registered agents.
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
