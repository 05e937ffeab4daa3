use crate::agent::{Agent, AgentContext, AgentDescriptor};
use phasegate_core::{CapabilitySet, Finding, PhasegateError, PhasegateResult};
use phasegate_security::{LockBatch, LockRequest};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Uniform call path for every agent: permission check, lock check, timeout.
pub struct AgentAdapter;

impl AgentAdapter {
    /// Fail with a configuration error unless the agent declares every
    /// capability the phase requires.
    pub fn check_capabilities(
        descriptor: &AgentDescriptor,
        required: &CapabilitySet,
    ) -> PhasegateResult<()> {
        let missing = descriptor.capabilities.missing(required);
        if missing.is_empty() {
            return Ok(());
        }
        let missing: Vec<String> = missing.iter().map(ToString::to_string).collect();
        warn!(
            agent = %descriptor.id,
            missing = ?missing,
            "Agent lacks required capabilities"
        );
        Err(PhasegateError::Config(format!(
            "Agent '{}' lacks required capabilities: {}",
            descriptor.id,
            missing.join(", ")
        )))
    }

    /// Lock requests a phase with these capabilities must hold while running.
    ///
    /// Write scopes are locked exclusively, scoped reads shared. Unscoped
    /// reads take no lock.
    pub fn lock_requests(required: &CapabilitySet) -> Vec<LockRequest> {
        required
            .write_scopes()
            .map(LockRequest::exclusive)
            .chain(required.read_scopes().map(LockRequest::shared))
            .collect()
    }

    /// Invoke `agent` for one phase attempt.
    ///
    /// The caller must already hold `locks`; every write scope in `required`
    /// has to be covered by an exclusive lock in the batch. Exceeding
    /// `timeout` is an execution error.
    pub async fn invoke(
        agent: &dyn Agent,
        required: &CapabilitySet,
        timeout: Duration,
        locks: &LockBatch,
        ctx: &AgentContext,
    ) -> PhasegateResult<Vec<Finding>> {
        let descriptor = agent.descriptor();
        Self::check_capabilities(descriptor, required)?;

        if let Some(scope) = required.write_scopes().find(|s| !locks.holds_exclusive(s)) {
            return Err(PhasegateError::Config(format!(
                "Agent '{}' invoked without an exclusive lock on '{scope}'",
                descriptor.id
            )));
        }

        let start = Instant::now();
        let result = tokio::time::timeout(timeout, agent.invoke(ctx)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(findings)) => {
                info!(
                    agent = %descriptor.id,
                    phase = %ctx.phase,
                    attempt = ctx.attempt,
                    findings = findings.len(),
                    duration_ms = elapsed_ms,
                    "Agent finished"
                );
                Ok(findings)
            }
            Ok(Err(e)) => {
                warn!(agent = %descriptor.id, phase = %ctx.phase, error = %e, "Agent failed");
                Err(e)
            }
            Err(_) => {
                warn!(agent = %descriptor.id, phase = %ctx.phase, "Agent timed out");
                Err(PhasegateError::Execution(format!(
                    "Agent '{}' timed out after {}ms",
                    descriptor.id,
                    timeout.as_millis()
                )))
            }
        }
    }
}
