//! In-process agents that need no external tooling.

use crate::agent::{Agent, AgentContext, AgentDescriptor};
use async_trait::async_trait;
use phasegate_core::{Capability, CapabilitySet, Finding, PhasegateResult};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Read-only agent that never reports anything. Used for dry runs.
pub struct NoopAgent {
    descriptor: AgentDescriptor,
}

impl NoopAgent {
    /// Clean agent declaring `read`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            descriptor: AgentDescriptor::new(id, [Capability::read()].into_iter().collect())
                .with_description("Reports no findings"),
        }
    }

    /// Declare a capability set other than plain read access.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.descriptor.capabilities = capabilities;
        self
    }
}

#[async_trait]
impl Agent for NoopAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &AgentContext) -> PhasegateResult<Vec<Finding>> {
        Ok(Vec::new())
    }
}

/// Agent returning a fixed list of findings on every call, counting calls.
pub struct StaticAgent {
    descriptor: AgentDescriptor,
    findings: Vec<Finding>,
    invocations: AtomicUsize,
}

impl StaticAgent {
    /// Agent returning `findings` on every call.
    pub fn new(id: impl Into<String>, capabilities: CapabilitySet, findings: Vec<Finding>) -> Self {
        Self {
            descriptor: AgentDescriptor::new(id, capabilities),
            findings,
            invocations: AtomicUsize::new(0),
        }
    }

    /// How many times the agent has been invoked.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for StaticAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &AgentContext) -> PhasegateResult<Vec<Finding>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(self.findings.clone())
    }
}
