use crate::config::{EngineSettings, PipelineCatalog, PipelineConfig};
use crate::replay::{replay_work_item, Replayed};
use crate::scheduler::{PhaseScheduler, SchedulerCommand, SchedulerContext};
use crate::types::WorkItem;
use parking_lot::RwLock;
use phasegate_agent::{AgentRegistry, RetryPolicy};
use phasegate_core::{PhasegateError, PhasegateResult, WorkItemStatus};
use phasegate_security::{ArtifactLockManager, AuditTrail};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;
use uuid::Uuid;

struct WorkItemHandle {
    snapshot: watch::Receiver<WorkItem>,
    cancel: watch::Sender<bool>,
    commands: mpsc::Sender<SchedulerCommand>,
}

/// Top-level lifecycle for a population of work items.
///
/// Every submitted item gets its own scheduler task. Items only interact
/// through the shared [`ArtifactLockManager`]. The pipeline catalog can be
/// swapped with [`reload`](Self::reload); items already submitted keep the
/// pipeline they were resolved against.
///
/// Items stay in memory after they settle so they can still be queried;
/// [`forget`](Self::forget) drops finished ones.
pub struct PipelineEngine {
    catalog: RwLock<Arc<PipelineCatalog>>,
    context: SchedulerContext,
    items: RwLock<HashMap<Uuid, WorkItemHandle>>,
}

impl PipelineEngine {
    /// Create an engine, checking every pipeline against the registry.
    pub fn new(
        catalog: PipelineCatalog,
        registry: AgentRegistry,
        audit: Arc<AuditTrail>,
    ) -> PhasegateResult<Self> {
        catalog.validate_agents(&registry)?;
        let settings = EngineSettings::default();
        Ok(Self {
            catalog: RwLock::new(Arc::new(catalog)),
            context: SchedulerContext {
                registry: Arc::new(registry),
                locks: ArtifactLockManager::new(),
                audit,
                retry: settings.retry,
                lock_timeout: settings.lock_timeout(),
            },
            items: RwLock::new(HashMap::new()),
        })
    }

    /// Build the engine described by a configuration document. Must be
    /// called from within a tokio runtime (the audit writer is spawned).
    pub fn from_config(config: &PipelineConfig) -> PhasegateResult<Self> {
        let registry = config.build_registry()?;
        let catalog = config.catalog()?;
        if let Some(dir) = config.engine.audit_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let audit = Arc::new(AuditTrail::new(config.engine.audit_path.clone()));
        Ok(Self::new(catalog, registry, audit)?
            .with_retry_policy(config.engine.retry)
            .with_lock_timeout(config.engine.lock_timeout()))
    }

    /// Backoff between failed attempts.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.context.retry = retry;
        self
    }

    /// Bounded wait for artifact locks, per attempt.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.context.lock_timeout = timeout;
        self
    }

    /// Share a lock manager with other engines.
    pub fn with_lock_manager(mut self, locks: ArtifactLockManager) -> Self {
        self.context.locks = locks;
        self
    }

    /// Lock manager shared by every scheduler.
    pub fn lock_manager(&self) -> &ArtifactLockManager {
        &self.context.locks
    }

    /// Audit trail every scheduler records to.
    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.context.audit
    }

    /// Registered agents.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.context.registry
    }

    /// Current pipeline catalog.
    pub fn catalog(&self) -> Arc<PipelineCatalog> {
        Arc::clone(&self.catalog.read())
    }

    /// Submit a work item to `pipeline` and start driving it.
    ///
    /// Unknown pipelines, unknown agents and capability mismatches are
    /// configuration errors and create no work item.
    pub fn submit(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        pipeline: &str,
    ) -> PhasegateResult<Uuid> {
        let definition = self.catalog.read().get(pipeline)?;
        definition.validate_agents(&self.context.registry)?;

        let item = WorkItem::new(title, description, definition);
        let id = item.id;
        self.spawn(item, false);

        info!(work_item = %id, pipeline = %pipeline, "Work item submitted");
        Ok(id)
    }

    /// Pick up a BLOCKED work item recorded by an earlier process.
    ///
    /// The item is rebuilt from this engine's audit trail against the
    /// current catalog and parked in BLOCKED, ready for
    /// [`restart_blocked`](Self::restart_blocked) or [`cancel`](Self::cancel).
    /// An item this engine already tracks is returned as it is.
    pub async fn resume_blocked(&self, id: Uuid) -> PhasegateResult<WorkItem> {
        if let Ok(item) = self.query(id) {
            return Ok(item);
        }

        let Replayed {
            item,
            last_sequence,
        } = self.replay(id).await?;
        match item.status {
            WorkItemStatus::Blocked => {}
            status if status.is_terminal() => {
                return Err(PhasegateError::InvalidTransition(format!(
                    "Work item {id} is already {status}"
                )));
            }
            status => {
                return Err(PhasegateError::InvalidTransition(format!(
                    "Work item {id} is {status} in another process, only BLOCKED items can be picked up"
                )));
            }
        }
        item.definition.validate_agents(&self.context.registry)?;

        self.context.audit.resume_sequence(id, last_sequence);
        self.spawn(item.clone(), true);
        info!(work_item = %id, phase = item.current_phase, "Work item picked up from audit trail");
        Ok(item)
    }

    fn spawn(&self, item: WorkItem, resume: bool) {
        let id = item.id;
        let (snapshot_tx, snapshot_rx) = watch::channel(item.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::channel(8);

        {
            let mut items = self.items.write();
            if items.contains_key(&id) {
                return;
            }
            items.insert(
                id,
                WorkItemHandle {
                    snapshot: snapshot_rx,
                    cancel: cancel_tx,
                    commands: commands_tx,
                },
            );
        }

        let scheduler = PhaseScheduler::new(
            item,
            self.context.clone(),
            snapshot_tx,
            cancel_rx,
            commands_rx,
        );
        if resume {
            tokio::spawn(scheduler.resume());
        } else {
            tokio::spawn(scheduler.run());
        }
    }

    /// Consistent snapshot of a work item.
    pub fn query(&self, id: Uuid) -> PhasegateResult<WorkItem> {
        self.items
            .read()
            .get(&id)
            .map(|h| h.snapshot.borrow().clone())
            .ok_or_else(|| not_found(id))
    }

    /// Snapshot of a work item, rebuilt from the audit trail when this
    /// engine does not track it.
    pub async fn query_recorded(&self, id: Uuid) -> PhasegateResult<WorkItem> {
        match self.query(id) {
            Ok(item) => Ok(item),
            Err(PhasegateError::NotFound(_)) => Ok(self.replay(id).await?.item),
            Err(e) => Err(e),
        }
    }

    async fn replay(&self, id: Uuid) -> PhasegateResult<Replayed> {
        let audit = &self.context.audit;
        audit.flush().await;
        if matches!(tokio::fs::try_exists(audit.path()).await, Ok(false)) {
            return Err(not_found(id));
        }
        let entries = AuditTrail::read_entries(audit.path(), Some(id)).await?;
        replay_work_item(id, &entries, &self.catalog())
    }

    /// Snapshots of every work item, oldest first.
    pub fn list(&self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self
            .items
            .read()
            .values()
            .map(|h| h.snapshot.borrow().clone())
            .collect();
        items.sort_by_key(|i| i.created_at);
        items
    }

    /// Request cancellation. Takes effect at the item's next safe point;
    /// an agent call in flight is allowed to finish and its result dropped.
    pub fn cancel(&self, id: Uuid) -> PhasegateResult<()> {
        let items = self.items.read();
        let handle = items.get(&id).ok_or_else(|| not_found(id))?;
        let status = handle.snapshot.borrow().status;
        if status.is_terminal() {
            return Err(PhasegateError::InvalidTransition(format!(
                "Work item {id} is already {status}"
            )));
        }
        handle.cancel.send_replace(true);
        info!(work_item = %id, "Cancellation requested");
        Ok(())
    }

    /// Re-run the phase a BLOCKED item stopped at.
    ///
    /// Returns once the item is RUNNING again.
    pub async fn restart_blocked(&self, id: Uuid) -> PhasegateResult<()> {
        let (status, restarts, commands) = {
            let items = self.items.read();
            let handle = items.get(&id).ok_or_else(|| not_found(id))?;
            let snapshot = handle.snapshot.borrow();
            (snapshot.status, snapshot.restarts, handle.commands.clone())
        };
        if status != WorkItemStatus::Blocked {
            return Err(PhasegateError::InvalidTransition(format!(
                "Work item {id} is {status}, only BLOCKED items can be restarted"
            )));
        }

        let stopped = || {
            PhasegateError::InvalidTransition(format!("Work item {id} is no longer blocked"))
        };
        let (ack, acked) = oneshot::channel();
        commands
            .send(SchedulerCommand::Restart {
                expected_restarts: restarts,
                ack,
            })
            .await
            .map_err(|_| stopped())?;
        acked.await.map_err(|_| stopped())?
    }

    /// Wait until the item is COMPLETED, CANCELLED or BLOCKED and return
    /// its snapshot.
    pub async fn wait(&self, id: Uuid) -> PhasegateResult<WorkItem> {
        self.wait_until(id, WorkItemStatus::is_settled).await
    }

    /// Wait until the item is COMPLETED or CANCELLED. Used after `cancel`,
    /// when the item may still be BLOCKED for a moment.
    pub async fn wait_terminal(&self, id: Uuid) -> PhasegateResult<WorkItem> {
        self.wait_until(id, WorkItemStatus::is_terminal).await
    }

    async fn wait_until(
        &self,
        id: Uuid,
        done: fn(WorkItemStatus) -> bool,
    ) -> PhasegateResult<WorkItem> {
        let mut rx = self
            .items
            .read()
            .get(&id)
            .map(|h| h.snapshot.clone())
            .ok_or_else(|| not_found(id))?;
        let reached = rx
            .wait_for(|item| done(item.status))
            .await
            .map(|item| item.clone());
        match reached {
            Ok(item) => Ok(item),
            Err(_) => {
                let last = rx.borrow().clone();
                if done(last.status) {
                    Ok(last)
                } else {
                    Err(PhasegateError::Execution(format!(
                        "Scheduler for work item {id} stopped while {}",
                        last.status
                    )))
                }
            }
        }
    }

    /// Drop a COMPLETED or CANCELLED item from memory and return its last
    /// snapshot. Its audit entries are kept.
    pub fn forget(&self, id: Uuid) -> PhasegateResult<WorkItem> {
        let mut items = self.items.write();
        let item = items
            .get(&id)
            .map(|h| h.snapshot.borrow().clone())
            .ok_or_else(|| not_found(id))?;
        if !item.status.is_terminal() {
            return Err(PhasegateError::InvalidTransition(format!(
                "Work item {id} is {}, only COMPLETED or CANCELLED items can be forgotten",
                item.status
            )));
        }
        items.remove(&id);
        Ok(item)
    }

    /// Replace the pipeline catalog. Only future submissions see it.
    pub fn reload(&self, catalog: PipelineCatalog) -> PhasegateResult<()> {
        catalog.validate_agents(&self.context.registry)?;
        info!(pipelines = catalog.len(), "Reloaded pipeline catalog");
        *self.catalog.write() = Arc::new(catalog);
        Ok(())
    }
}

fn not_found(id: Uuid) -> PhasegateError {
    PhasegateError::NotFound(format!("Work item {id}"))
}
