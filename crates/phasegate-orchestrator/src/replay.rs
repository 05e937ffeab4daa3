//! Rebuilding work items from the audit trail.
//!
//! A work item lives in the memory of the process that submitted it. The
//! trail is what outlives that process, so `query`, `restart` and `cancel`
//! from a later process start by replaying the item's entries against the
//! current pipeline catalog.

use crate::config::PipelineCatalog;
use crate::gate::{self, Verdict};
use crate::types::{PhaseResult, WorkItem};
use phasegate_core::{GateAction, PhasegateError, PhasegateResult, WorkItemStatus};
use phasegate_security::{AuditEntry, AuditEvent};
use uuid::Uuid;

/// A work item rebuilt from its trail, with the last sequence number seen.
#[derive(Debug, Clone)]
pub struct Replayed {
    /// State after the last recorded entry.
    pub item: WorkItem,
    /// Highest sequence number seen for the item.
    pub last_sequence: u64,
}

/// Rebuild work item `id` from `entries`.
///
/// Entries for other items are ignored; the rest are applied in sequence
/// order. The pipeline is resolved by name in `catalog`, so phases recorded
/// under a name the catalog no longer has are a configuration error.
///
/// # Errors
///
/// - `NotFound` if the trail has no entries for `id`.
/// - `Audit` if the item's `submitted` entry is missing.
/// - `Config` if its pipeline or a recorded phase is unknown.
pub fn replay_work_item(
    id: Uuid,
    entries: &[AuditEntry],
    catalog: &PipelineCatalog,
) -> PhasegateResult<Replayed> {
    let mut entries: Vec<&AuditEntry> = entries.iter().filter(|e| e.work_item_id == id).collect();
    if entries.is_empty() {
        return Err(PhasegateError::NotFound(format!("Work item {id}")));
    }
    entries.sort_by_key(|e| e.sequence);

    let submission = entries
        .iter()
        .find_map(|e| e.submission.as_ref())
        .ok_or_else(|| {
            PhasegateError::Audit(format!("Trail for work item {id} has no submission entry"))
        })?;
    let definition = catalog.get(&submission.pipeline)?;

    let mut item = WorkItem::new(
        submission.title.clone(),
        submission.description.clone(),
        definition,
    );
    item.id = id;
    item.created_at = entries[0].timestamp_utc;

    for entry in &entries {
        apply(&mut item, entry)?;
        item.updated_at = entry.timestamp_utc;
    }

    let last_sequence = entries.last().map_or(0, |e| e.sequence);
    Ok(Replayed {
        item,
        last_sequence,
    })
}

fn apply(item: &mut WorkItem, entry: &AuditEntry) -> PhasegateResult<()> {
    match entry.event {
        AuditEvent::Submitted => item.status = WorkItemStatus::Pending,
        AuditEvent::PhaseResult => {
            let Some(name) = entry.phase.as_deref() else {
                return Err(PhasegateError::Audit(format!(
                    "Phase result {} of work item {} names no phase",
                    entry.sequence, item.id
                )));
            };
            let definition = item.definition.clone();
            let (index, phase) = definition
                .phases
                .iter()
                .enumerate()
                .find(|(_, p)| p.name == name)
                .ok_or_else(|| {
                    PhasegateError::Config(format!(
                        "Pipeline '{}' has no phase '{name}'",
                        item.pipeline
                    ))
                })?;

            let verdict = entry.verdict.map(|action| Verdict {
                action,
                triggering: gate::evaluate(&entry.findings, &phase.gate).triggering,
            });
            item.status = WorkItemStatus::Running;
            item.current_phase = index;
            item.findings.extend(entry.findings.iter().cloned());
            match entry.verdict {
                Some(GateAction::Pass) => item.current_phase = index + 1,
                Some(GateAction::Warn) if !phase.halt_on_warn => {
                    item.warnings.extend(entry.findings.iter().cloned());
                    item.current_phase = index + 1;
                }
                _ => {}
            }

            let attempt = entry.attempt.unwrap_or_else(|| item.next_attempt(index));
            item.history.push(PhaseResult {
                phase_index: index,
                phase: phase.name.clone(),
                agent: phase.agent.clone(),
                findings: entry.findings.clone(),
                verdict,
                error: entry.error.clone(),
                attempt,
                duration_ms: entry.duration_ms.unwrap_or(0),
                started_at: entry.started_at.unwrap_or(entry.timestamp_utc),
                finished_at: entry.timestamp_utc,
            });
        }
        AuditEvent::Blocked => item.status = WorkItemStatus::Blocked,
        AuditEvent::Restarted => {
            item.restarts += 1;
            item.status = WorkItemStatus::Running;
        }
        AuditEvent::Completed => {
            item.status = WorkItemStatus::Completed;
            item.current_phase = item.phases.len();
        }
        AuditEvent::Cancelled => item.status = WorkItemStatus::Cancelled,
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{PhaseDefinition, PipelineDefinition};
    use crate::gate::GateRules;
    use phasegate_core::{Finding, Severity};
    use phasegate_security::Submission;

    fn catalog() -> PipelineCatalog {
        PipelineCatalog::new(vec![PipelineDefinition::new(
            "feature",
            vec![
                PhaseDefinition::new("plan", "planner"),
                PhaseDefinition::new("review", "reviewer")
                    .with_gate(GateRules::new().with(Severity::Critical, GateAction::Block)),
            ],
        )])
        .unwrap()
    }

    fn entry(id: Uuid, sequence: u64, event: AuditEvent, status: WorkItemStatus) -> AuditEntry {
        let mut entry = AuditEntry::transition(id, event, status);
        entry.sequence = sequence;
        entry
    }

    fn submitted(id: Uuid) -> AuditEntry {
        entry(id, 1, AuditEvent::Submitted, WorkItemStatus::Pending).with_submission(Submission {
            pipeline: "feature".into(),
            title: "Add login".into(),
            description: "OAuth".into(),
        })
    }

    #[test]
    fn test_blocked_item_is_rebuilt_at_blocking_phase() {
        let id = Uuid::new_v4();
        let entries = vec![
            submitted(id),
            entry(id, 2, AuditEvent::PhaseResult, WorkItemStatus::Running)
                .with_phase("plan", 1)
                .with_verdict(GateAction::Pass, vec![]),
            entry(id, 3, AuditEvent::PhaseResult, WorkItemStatus::Running)
                .with_phase("review", 1)
                .with_verdict(GateAction::Block, vec![Finding::critical("SQL injection")]),
            entry(id, 4, AuditEvent::Blocked, WorkItemStatus::Blocked).with_phase("review", 1),
        ];

        let replayed = replay_work_item(id, &entries, &catalog()).unwrap();
        let item = replayed.item;
        assert_eq!(replayed.last_sequence, 4);
        assert_eq!(item.id, id);
        assert_eq!(item.title, "Add login");
        assert_eq!(item.status, WorkItemStatus::Blocked);
        assert_eq!(item.current_phase, 1);
        assert_eq!(item.history.len(), 2);
        assert_eq!(item.findings.len(), 1);
        let verdict = item.history[1].verdict.as_ref().unwrap();
        assert_eq!(verdict.action, GateAction::Block);
        assert_eq!(verdict.triggering.len(), 1);
        assert_eq!(item.next_attempt(1), 2);
    }

    #[test]
    fn test_completed_item_and_foreign_entries() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        // Out of order on purpose; replay sorts by sequence.
        let entries = vec![
            entry(id, 4, AuditEvent::Completed, WorkItemStatus::Completed),
            submitted(other),
            submitted(id),
            entry(id, 3, AuditEvent::PhaseResult, WorkItemStatus::Running)
                .with_phase("review", 1)
                .with_verdict(GateAction::Warn, vec![Finding::medium("long fn")]),
            entry(id, 2, AuditEvent::PhaseResult, WorkItemStatus::Running)
                .with_phase("plan", 1)
                .with_verdict(GateAction::Pass, vec![]),
        ];

        let item = replay_work_item(id, &entries, &catalog()).unwrap().item;
        assert_eq!(item.status, WorkItemStatus::Completed);
        assert_eq!(item.current_phase, 2);
        assert_eq!(item.warnings.len(), 1);
        assert_eq!(item.history[0].phase, "plan");
    }

    #[test]
    fn test_unknown_item_and_missing_submission() {
        let id = Uuid::new_v4();
        assert!(matches!(
            replay_work_item(id, &[], &catalog()),
            Err(PhasegateError::NotFound(_))
        ));

        let entries = vec![entry(id, 1, AuditEvent::Blocked, WorkItemStatus::Blocked)];
        assert!(matches!(
            replay_work_item(id, &entries, &catalog()),
            Err(PhasegateError::Audit(_))
        ));
    }

    #[test]
    fn test_renamed_pipeline_is_config_error() {
        let id = Uuid::new_v4();
        let entries = vec![submitted(id)];
        let other = PipelineCatalog::new(vec![PipelineDefinition::new(
            "hotfix",
            vec![PhaseDefinition::new("plan", "planner")],
        )])
        .unwrap();
        assert!(matches!(
            replay_work_item(id, &entries, &other),
            Err(PhasegateError::Config(_))
        ));
    }
}
