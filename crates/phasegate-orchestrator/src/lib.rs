//! Work-item pipeline orchestration for Phasegate.
//!
//! A work item is driven through an ordered list of phases. Each phase
//! invokes one agent under a capability check, gates the agent's findings by
//! severity, and either advances, retries or blocks the item.
//!
//! # Main types
//!
//! - [`PipelineEngine`]: Submits, queries, cancels and restarts work items.
//! - [`PipelineCatalog`]: Validated, read-only set of pipeline definitions.
//! - [`PipelineConfig`]: TOML configuration document.
//! - [`GateRules`] / [`evaluate`]: Severity gate producing a [`Verdict`].
//! - [`WorkItem`]: Snapshot of an item's state and phase history.

/// Configuration loading and pipeline catalog.
pub mod config;
/// Work-item lifecycle engine.
pub mod engine;
/// Severity gate evaluation.
pub mod gate;
/// Rebuilding work items from the audit trail.
pub mod replay;
/// Per-item phase state machine.
mod scheduler;
/// Work item and phase result types.
pub mod types;

pub use config::{
    AgentConfig, EngineSettings, PhaseDefinition, PipelineCatalog, PipelineConfig,
    PipelineDefinition,
};
pub use engine::PipelineEngine;
pub use gate::{evaluate, GateRules, Verdict};
pub use replay::{replay_work_item, Replayed};
pub use types::{PhaseResult, WorkItem};
