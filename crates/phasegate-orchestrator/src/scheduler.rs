use crate::config::PhaseDefinition;
use crate::gate::{self, Verdict};
use crate::types::{PhaseResult, WorkItem};
use chrono::{DateTime, Utc};
use phasegate_agent::{AgentAdapter, AgentContext, AgentRegistry, RetryPolicy};
use phasegate_core::{Finding, GateAction, PhasegateError, PhasegateResult, WorkItemStatus};
use phasegate_security::{
    ArtifactLockManager, AuditEntry, AuditEvent, AuditTrail, LockOwner, Submission,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

/// Shared services every scheduler uses.
#[derive(Clone)]
pub(crate) struct SchedulerContext {
    pub registry: Arc<AgentRegistry>,
    pub locks: ArtifactLockManager,
    pub audit: Arc<AuditTrail>,
    pub retry: RetryPolicy,
    pub lock_timeout: Duration,
}

/// Operator commands delivered to a blocked scheduler.
pub(crate) enum SchedulerCommand {
    Restart {
        /// Restart count the caller observed; stale requests are rejected.
        expected_restarts: u32,
        ack: oneshot::Sender<PhasegateResult<()>>,
    },
}

enum Settled {
    Completed,
    Blocked,
    Cancelled,
}

enum PhaseOutcome {
    Advance,
    Block,
    Cancelled,
}

struct Attempt {
    result: PhasegateResult<Vec<Finding>>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_ms: u64,
}

/// Drives one work item through its phases on its own task.
///
/// The scheduler is the only writer of its [`WorkItem`]; every change is
/// published as a fresh snapshot on the watch channel.
pub(crate) struct PhaseScheduler {
    item: WorkItem,
    ctx: SchedulerContext,
    snapshot: watch::Sender<WorkItem>,
    cancel: watch::Receiver<bool>,
    commands: mpsc::Receiver<SchedulerCommand>,
}

impl PhaseScheduler {
    pub(crate) fn new(
        item: WorkItem,
        ctx: SchedulerContext,
        snapshot: watch::Sender<WorkItem>,
        cancel: watch::Receiver<bool>,
        commands: mpsc::Receiver<SchedulerCommand>,
    ) -> Self {
        Self {
            item,
            ctx,
            snapshot,
            cancel,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        let submission = Submission {
            pipeline: self.item.pipeline.clone(),
            title: self.item.title.clone(),
            description: self.item.description.clone(),
        };
        self.audit(
            AuditEntry::transition(self.item.id, AuditEvent::Submitted, WorkItemStatus::Pending)
                .with_submission(submission),
        );
        self.lifecycle().await;
    }

    /// Pick up an item rebuilt in BLOCKED state: wait for a restart or a
    /// cancel, then carry on as usual.
    pub(crate) async fn resume(mut self) {
        if self.await_restart().await {
            self.lifecycle().await;
        }
    }

    async fn lifecycle(&mut self) {
        loop {
            match self.drive().await {
                Settled::Completed => {
                    self.settle(WorkItemStatus::Completed, AuditEvent::Completed);
                    info!(work_item = %self.item.id, "Work item completed");
                    return;
                }
                Settled::Cancelled => {
                    self.cancelled();
                    return;
                }
                Settled::Blocked => {
                    self.settle(WorkItemStatus::Blocked, AuditEvent::Blocked);
                    warn!(
                        work_item = %self.item.id,
                        phase = self.item.current_phase,
                        "Work item blocked"
                    );
                    if !self.await_restart().await {
                        return;
                    }
                }
            }
        }
    }

    /// Run phases from the current index until the item settles.
    async fn drive(&mut self) -> Settled {
        if self.item.status != WorkItemStatus::Running {
            self.item.status = WorkItemStatus::Running;
            self.publish();
        }

        let pipeline = Arc::clone(&self.item.definition);
        while let Some(phase) = pipeline.phases.get(self.item.current_phase) {
            if *self.cancel.borrow() {
                return Settled::Cancelled;
            }
            match self.run_phase(phase).await {
                PhaseOutcome::Advance => {
                    self.item.current_phase += 1;
                    self.publish();
                }
                PhaseOutcome::Block => return Settled::Blocked,
                PhaseOutcome::Cancelled => return Settled::Cancelled,
            }
        }
        Settled::Completed
    }

    /// Execute one phase, retrying execution errors with backoff.
    async fn run_phase(&mut self, phase: &PhaseDefinition) -> PhaseOutcome {
        let index = self.item.current_phase;
        let mut retries = 0u32;

        loop {
            let attempt_no = self.item.next_attempt(index);
            info!(
                work_item = %self.item.id,
                phase = %phase.name,
                attempt = attempt_no,
                "Running phase"
            );

            let Some(attempt) = self.attempt(phase, index, attempt_no).await else {
                return PhaseOutcome::Cancelled;
            };
            // Results of a call that was in flight when cancel arrived are discarded.
            if *self.cancel.borrow() {
                return PhaseOutcome::Cancelled;
            }

            match attempt.result {
                Ok(findings) => {
                    let verdict = gate::evaluate(&findings, &phase.gate);
                    let action = verdict.action;
                    self.push_result(
                        phase,
                        index,
                        attempt_no,
                        findings.clone(),
                        Some(verdict),
                        None,
                        (attempt.started_at, attempt.finished_at, attempt.duration_ms),
                    );
                    self.item.findings.extend(findings.iter().cloned());

                    return match action {
                        GateAction::Pass => PhaseOutcome::Advance,
                        GateAction::Warn if phase.halt_on_warn => PhaseOutcome::Block,
                        GateAction::Warn => {
                            self.item.warnings.extend(findings);
                            PhaseOutcome::Advance
                        }
                        GateAction::Block => PhaseOutcome::Block,
                    };
                }
                Err(e) if e.is_retryable() && retries < phase.max_retry => {
                    self.push_result(
                        phase,
                        index,
                        attempt_no,
                        Vec::new(),
                        None,
                        Some(e.to_string()),
                        (attempt.started_at, attempt.finished_at, attempt.duration_ms),
                    );
                    let delay = self.ctx.retry.delay(retries);
                    retries += 1;
                    warn!(
                        work_item = %self.item.id,
                        phase = %phase.name,
                        error = %e,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "Phase attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_cancelled(&mut self.cancel) => return PhaseOutcome::Cancelled,
                    }
                }
                Err(e) => {
                    let finding = if e.is_retryable() {
                        Finding::critical(format!("Agent '{}' unavailable: {e}", phase.agent))
                    } else {
                        Finding::critical(format!("Phase '{}' misconfigured: {e}", phase.name))
                    }
                    .with_location(phase.name.clone());
                    self.push_result(
                        phase,
                        index,
                        attempt_no,
                        vec![finding.clone()],
                        None,
                        Some(e.to_string()),
                        (attempt.started_at, attempt.finished_at, attempt.duration_ms),
                    );
                    self.item.findings.push(finding);
                    return PhaseOutcome::Block;
                }
            }
        }
    }

    /// Lock, invoke, unlock. `None` if cancelled while waiting for locks.
    async fn attempt(
        &mut self,
        phase: &PhaseDefinition,
        index: usize,
        attempt: u32,
    ) -> Option<Attempt> {
        let started_at = Utc::now();
        let start = Instant::now();
        let finish = |result: PhasegateResult<Vec<Finding>>, started_at, start: Instant| Attempt {
            result,
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        let agent = match self.ctx.registry.resolve(&phase.agent) {
            Ok(agent) => agent,
            Err(e) => return Some(finish(Err(e), started_at, start)),
        };

        let requests = AgentAdapter::lock_requests(&phase.capabilities);
        let owner = LockOwner::new(self.item.id, phase.name.clone());
        let locks = self.ctx.locks.clone();
        let acquired = tokio::select! {
            res = locks.acquire(requests, owner, self.ctx.lock_timeout) => res,
            _ = wait_cancelled(&mut self.cancel) => return None,
        };
        let batch = match acquired {
            Ok(batch) => batch,
            Err(e) => return Some(finish(Err(e), started_at, start)),
        };

        // The recorded window starts once the locks are held.
        let started_at = Utc::now();
        let start = Instant::now();
        let ctx = AgentContext {
            work_item_id: self.item.id,
            title: self.item.title.clone(),
            description: self.item.description.clone(),
            phase: phase.name.clone(),
            phase_index: index,
            attempt,
            capabilities: phase.capabilities.clone(),
            prior_findings: self.item.findings.clone(),
        };
        let capabilities = phase.capabilities.clone();
        let timeout = phase.timeout();
        // The call runs on its own task so a panicking agent fails the
        // attempt instead of the scheduler. The batch is released only after
        // the window is measured.
        let call = tokio::spawn(async move {
            let result =
                AgentAdapter::invoke(agent.as_ref(), &capabilities, timeout, &batch, &ctx).await;
            let attempt = finish(result, started_at, start);
            drop(batch);
            attempt
        });
        match call.await {
            Ok(attempt) => Some(attempt),
            Err(e) => {
                warn!(
                    work_item = %self.item.id,
                    phase = %phase.name,
                    error = %e,
                    "Agent task failed"
                );
                let err = PhasegateError::Execution(format!(
                    "Agent '{}' panicked: {e}",
                    phase.agent
                ));
                Some(finish(Err(err), started_at, start))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_result(
        &mut self,
        phase: &PhaseDefinition,
        index: usize,
        attempt: u32,
        findings: Vec<Finding>,
        verdict: Option<Verdict>,
        error: Option<String>,
        (started_at, finished_at, duration_ms): (DateTime<Utc>, DateTime<Utc>, u64),
    ) {
        let mut entry = AuditEntry::transition(
            self.item.id,
            AuditEvent::PhaseResult,
            WorkItemStatus::Running,
        )
        .with_phase(phase.name.clone(), attempt)
        .with_window(started_at, duration_ms);
        entry = match &verdict {
            Some(v) => entry.with_verdict(v.action, findings.clone()),
            None => entry.with_findings(findings.clone()),
        };
        if let Some(error) = &error {
            entry = entry.with_error(error.clone());
        }
        self.audit(entry);

        self.item.history.push(PhaseResult {
            phase_index: index,
            phase: phase.name.clone(),
            agent: phase.agent.clone(),
            findings,
            verdict,
            error,
            attempt,
            duration_ms,
            started_at,
            finished_at,
        });
        self.publish();
    }

    /// Wait in BLOCKED for a restart. `false` once the scheduler should exit.
    async fn await_restart(&mut self) -> bool {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(SchedulerCommand::Restart { expected_restarts, ack }) => {
                        if expected_restarts != self.item.restarts {
                            let _ = ack.send(Err(PhasegateError::InvalidTransition(format!(
                                "Work item {} was already restarted",
                                self.item.id
                            ))));
                            continue;
                        }
                        self.item.restarts += 1;
                        self.item.status = WorkItemStatus::Running;
                        self.publish();
                        let attempt = self.item.next_attempt(self.item.current_phase);
                        let phase = self
                            .item
                            .phases
                            .get(self.item.current_phase)
                            .cloned()
                            .unwrap_or_default();
                        self.audit(
                            AuditEntry::transition(
                                self.item.id,
                                AuditEvent::Restarted,
                                WorkItemStatus::Running,
                            )
                            .with_phase(phase.as_str(), attempt),
                        );
                        info!(work_item = %self.item.id, phase = %phase, "Work item restarted");
                        let _ = ack.send(Ok(()));
                        return true;
                    }
                    // Engine gone, nobody can restart this item any more.
                    None => return false,
                },
                _ = wait_cancelled(&mut self.cancel) => {
                    self.cancelled();
                    return false;
                }
            }
        }
    }

    fn cancelled(&mut self) {
        self.settle(WorkItemStatus::Cancelled, AuditEvent::Cancelled);
        info!(work_item = %self.item.id, "Work item cancelled");
    }

    /// Records the transition before publishing it, so a waiter that sees
    /// the settled snapshot finds the entry already queued.
    fn settle(&mut self, status: WorkItemStatus, event: AuditEvent) {
        self.item.status = status;
        let mut entry = AuditEntry::transition(self.item.id, event, status);
        if let Some(name) = self.item.phases.get(self.item.current_phase) {
            let attempt = self.item.executions_of(self.item.current_phase) as u32;
            entry = entry.with_phase(name.as_str(), attempt);
        }
        self.audit(entry);
        self.publish();
    }

    fn publish(&mut self) {
        self.item.touch();
        self.snapshot.send_replace(self.item.clone());
    }

    fn audit(&self, entry: AuditEntry) {
        self.ctx.audit.record(entry);
    }
}

/// Resolves once cancellation is requested. Never resolves if the engine
/// dropped the sender without cancelling.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    let requested = cancel.wait_for(|c| *c).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}
