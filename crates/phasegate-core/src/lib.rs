//! Core types and error definitions for the Phasegate orchestrator.
//!
//! This crate provides the foundational types shared across all Phasegate crates:
//! error handling, findings and their severities, gate actions, work-item
//! status, and the capability model used to constrain agents.
//!
//! # Main types
//!
//! - [`PhasegateError`]: Unified error enum for all Phasegate subsystems.
//! - [`PhasegateResult`]: Convenience alias for `Result<T, PhasegateError>`.
//! - [`Finding`]: A structured observation emitted by an agent.
//! - [`Severity`]: Ordered finding severity (LOW < MEDIUM < HIGH < CRITICAL).
//! - [`GateAction`]: PASS / WARN / BLOCK, used both by gate rules and verdicts.
//! - [`WorkItemStatus`]: Lifecycle status of a work item.
//! - [`Capability`] / [`CapabilitySet`]: Read and scoped write permissions.

/// Capability and artifact scope definitions.
pub mod capability;
/// Error types.
pub mod error;
/// Findings, severities and gate actions.
pub mod finding;
/// Work-item lifecycle status.
pub mod status;

pub use capability::{scope_covers, scopes_overlap, Capability, CapabilitySet};
pub use error::{PhasegateError, PhasegateResult};
pub use finding::{Finding, GateAction, Severity};
pub use status::WorkItemStatus;
