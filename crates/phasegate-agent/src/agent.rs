use async_trait::async_trait;
use phasegate_core::{CapabilitySet, Finding, PhasegateResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and declared permissions of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Id pipelines refer to the agent by.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// What the agent may do. Phases requiring more are rejected.
    pub capabilities: CapabilitySet,
}

impl AgentDescriptor {
    /// Descriptor with an empty description.
    pub fn new(id: impl Into<String>, capabilities: CapabilitySet) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            capabilities,
        }
    }

    /// Set the human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Input handed to an agent for one phase attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    /// Work item being processed.
    pub work_item_id: Uuid,
    /// Work item title.
    pub title: String,
    /// Work item description.
    pub description: String,
    /// Phase being run.
    pub phase: String,
    /// Zero-based index of the phase in its pipeline.
    pub phase_index: usize,
    /// Execution count of this phase, starting at 1.
    pub attempt: u32,
    /// Capabilities the phase grants for this call.
    pub capabilities: CapabilitySet,
    /// Findings accumulated by earlier phases.
    #[serde(default)]
    pub prior_findings: Vec<Finding>,
}

/// Trait every agent implements, in-process or backed by an external process.
///
/// An agent returns findings (possibly none) or an execution error. Findings
/// are a normal outcome, errors are retried by the scheduler.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Identity and declared capabilities.
    fn descriptor(&self) -> &AgentDescriptor;

    /// Run one phase attempt and report findings.
    async fn invoke(&self, ctx: &AgentContext) -> PhasegateResult<Vec<Finding>>;
}
