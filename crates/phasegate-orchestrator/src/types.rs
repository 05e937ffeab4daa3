use crate::config::{PhaseDefinition, PipelineDefinition};
use crate::gate::Verdict;
use chrono::{DateTime, Utc};
use phasegate_core::{Finding, WorkItemStatus};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// A unit of development work tracked through a pipeline.
///
/// Snapshots handed out by the engine are clones; only the item's own
/// scheduler task mutates the original.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    /// Unique id, assigned at submission.
    pub id: Uuid,
    /// Short summary of the work.
    pub title: String,
    /// Free-text description handed to agents.
    pub description: String,
    /// Pipeline the item was submitted to.
    pub pipeline: String,
    /// Phase names, resolved from the pipeline at submission.
    pub phases: Vec<String>,
    /// Index of the phase being run, or `phases.len()` once completed.
    pub current_phase: usize,
    /// Lifecycle status.
    pub status: WorkItemStatus,
    /// Every finding reported so far, in order.
    pub findings: Vec<Finding>,
    /// Findings from phases that passed with a WARN verdict.
    pub warnings: Vec<Finding>,
    /// Every phase execution, in order.
    pub history: Vec<PhaseResult>,
    /// Number of restarts from BLOCKED.
    pub restarts: u32,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time of the last change.
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) definition: Arc<PipelineDefinition>,
}

impl WorkItem {
    pub(crate) fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        definition: Arc<PipelineDefinition>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            pipeline: definition.name.clone(),
            phases: definition.phases.iter().map(|p| p.name.clone()).collect(),
            current_phase: 0,
            status: WorkItemStatus::Pending,
            findings: Vec::new(),
            warnings: Vec::new(),
            history: Vec::new(),
            restarts: 0,
            created_at: now,
            updated_at: now,
            definition,
        }
    }

    /// Definition of the phase being run, if any.
    pub fn current_phase_definition(&self) -> Option<&PhaseDefinition> {
        self.definition.phases.get(self.current_phase)
    }

    /// Attempt number the next execution of phase `index` gets.
    pub fn next_attempt(&self, index: usize) -> u32 {
        let previous = self
            .history
            .iter()
            .filter(|r| r.phase_index == index)
            .count();
        previous as u32 + 1
    }

    /// Number of executions recorded for phase `index`.
    pub fn executions_of(&self, index: usize) -> usize {
        self.history.iter().filter(|r| r.phase_index == index).count()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Record of one executed phase attempt, including failed ones.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseResult {
    /// Index of the phase in the pipeline.
    pub phase_index: usize,
    /// Phase name.
    pub phase: String,
    /// Agent that ran the phase.
    pub agent: String,
    /// Findings reported by the agent.
    pub findings: Vec<Finding>,
    /// `None` when the attempt failed before the gate ran.
    pub verdict: Option<Verdict>,
    /// Error of a failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution count of this phase, starting at 1.
    pub attempt: u32,
    /// Time the agent call took.
    pub duration_ms: u64,
    /// Start of the call, once locks were held.
    pub started_at: DateTime<Utc>,
    /// End of the call.
    pub finished_at: DateTime<Utc>,
}
