//! Agent abstraction for Phasegate.
//!
//! An [`Agent`] receives an [`AgentContext`] for one phase attempt and
//! returns findings. Agents are looked up in an [`AgentRegistry`] and always
//! called through the [`AgentAdapter`], which enforces declared capabilities,
//! artifact locks and per-phase timeouts.

/// Capability, lock and timeout enforcement around agent calls.
pub mod adapter;
/// Agent trait, descriptor and invocation context.
pub mod agent;
/// In-process agents for dry runs and tests.
pub mod builtin;
/// Agents backed by an external process.
pub mod command;
/// Agent lookup by id.
pub mod registry;
/// Backoff between failed phase attempts.
pub mod retry;

pub use adapter::AgentAdapter;
pub use agent::{Agent, AgentContext, AgentDescriptor};
pub use builtin::{NoopAgent, StaticAgent};
pub use command::CommandAgent;
pub use registry::AgentRegistry;
pub use retry::RetryPolicy;
