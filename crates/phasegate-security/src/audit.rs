use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use phasegate_core::{Finding, GateAction, PhasegateError, PhasegateResult, WorkItemStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Submitted,
    PhaseResult,
    Blocked,
    Restarted,
    Completed,
    Cancelled,
}

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Work item the entry belongs to.
    pub work_item_id: Uuid,
    /// Per-work-item sequence number, starting at 1. Assigned on append.
    pub sequence: u64,
    /// What happened.
    pub event: AuditEvent,
    /// Item status after the event.
    pub status: WorkItemStatus,
    /// Phase the event refers to, if any.
    pub phase: Option<String>,
    /// Attempt number of that phase.
    pub attempt: Option<u32>,
    /// Gate outcome of a completed phase attempt.
    pub verdict: Option<GateAction>,
    /// Findings reported by the attempt.
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Error of a failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Start of the attempt's lock-held window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Length of that window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Present on `submitted` entries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<Submission>,
    /// When the entry was recorded.
    #[serde(rename = "timestampUTC")]
    pub timestamp_utc: DateTime<Utc>,
}

impl AuditEntry {
    /// A state-transition entry with no phase detail.
    pub fn transition(work_item_id: Uuid, event: AuditEvent, status: WorkItemStatus) -> Self {
        Self {
            work_item_id,
            sequence: 0,
            event,
            status,
            phase: None,
            attempt: None,
            verdict: None,
            findings: Vec::new(),
            error: None,
            started_at: None,
            duration_ms: None,
            submission: None,
            timestamp_utc: Utc::now(),
        }
    }

    /// Attach the phase and attempt this entry refers to.
    pub fn with_phase(mut self, phase: impl Into<String>, attempt: u32) -> Self {
        self.phase = Some(phase.into());
        self.attempt = Some(attempt);
        self
    }

    /// Attach the gate outcome of a phase attempt.
    pub fn with_verdict(mut self, verdict: GateAction, findings: Vec<Finding>) -> Self {
        self.verdict = Some(verdict);
        self.findings = findings;
        self
    }

    /// Attach findings without a gate outcome (failed attempts).
    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    /// Attach the execution window of a phase attempt.
    pub fn with_window(mut self, started_at: DateTime<Utc>, duration_ms: u64) -> Self {
        self.started_at = Some(started_at);
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach an execution error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach what was submitted, so the item can be rebuilt from the trail.
    pub fn with_submission(mut self, submission: Submission) -> Self {
        self.submission = Some(submission);
        self
    }
}

/// Pipeline and request text recorded when a work item is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Pipeline the item was submitted to.
    pub pipeline: String,
    /// Work item title.
    pub title: String,
    /// Work item description.
    #[serde(default)]
    pub description: String,
}

enum AuditCommand {
    Append(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Append-only, line-per-entry audit trail of work-item transitions.
///
/// Entries are handed to a background writer task, so recording never waits
/// on disk. Each line is flushed and synced before the next is written.
/// Write failures are logged and counted; they never propagate to the caller.
pub struct AuditTrail {
    tx: mpsc::UnboundedSender<AuditCommand>,
    sequences: Mutex<HashMap<Uuid, u64>>,
    failures: Arc<AtomicU64>,
    path: PathBuf,
}

impl AuditTrail {
    /// Create a trail appending to `path`. Spawns the writer task, so this
    /// must be called from within a tokio runtime.
    pub fn new(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditCommand>();
        let failures = Arc::new(AtomicU64::new(0));

        let writer_path = path.clone();
        let writer_failures = Arc::clone(&failures);
        tokio::spawn(async move {
            let mut file: Option<tokio::fs::File> = None;

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    AuditCommand::Append(entry) => {
                        if let Err(e) = write_entry(&writer_path, &mut file, &entry).await {
                            writer_failures.fetch_add(1, Ordering::Relaxed);
                            // Reopen on the next write.
                            file = None;
                            warn!(
                                work_item = %entry.work_item_id,
                                sequence = entry.sequence,
                                error = %e,
                                "Audit write failed"
                            );
                        }
                    }
                    AuditCommand::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self {
            tx,
            sequences: Mutex::new(HashMap::new()),
            failures,
            path,
        }
    }

    /// Path of the underlying JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry, assigning the next sequence number for its work item.
    /// Returns the assigned sequence.
    pub fn record(&self, mut entry: AuditEntry) -> u64 {
        // Numbering and enqueueing happen under one lock so channel order
        // matches sequence order.
        let mut sequences = self.sequences.lock();
        let seq = sequences.entry(entry.work_item_id).or_insert(0);
        *seq += 1;
        entry.sequence = *seq;

        info!(
            work_item = %entry.work_item_id,
            sequence = entry.sequence,
            event = ?entry.event,
            status = %entry.status,
            phase = entry.phase.as_deref().unwrap_or("-"),
            "audit"
        );

        let sequence = entry.sequence;
        if self.tx.send(AuditCommand::Append(entry)).is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Audit writer is gone; entry dropped");
        }
        sequence
    }

    /// Continue numbering for `work_item` after `sequence`.
    ///
    /// Used when a work item recorded by an earlier process is picked up
    /// again, so its sequence keeps increasing across the file.
    pub fn resume_sequence(&self, work_item: Uuid, sequence: u64) {
        let mut sequences = self.sequences.lock();
        let seq = sequences.entry(work_item).or_insert(0);
        *seq = (*seq).max(sequence);
    }

    /// Wait until every entry recorded so far has been written (or failed).
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Number of entries that could not be written.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Load recorded entries from a trail file, optionally for one work item,
    /// in file order.
    pub async fn read_entries(
        path: &Path,
        work_item: Option<Uuid>,
    ) -> PhasegateResult<Vec<AuditEntry>> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            PhasegateError::Audit(format!(
                "Failed to read audit trail '{}': {e}",
                path.display()
            ))
        })?;

        let mut entries = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(line).map_err(|e| {
                PhasegateError::Audit(format!("Malformed audit line {}: {e}", n + 1))
            })?;
            if work_item.map_or(true, |id| id == entry.work_item_id) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

async fn write_entry(
    path: &Path,
    file: &mut Option<tokio::fs::File>,
    entry: &AuditEntry,
) -> std::io::Result<()> {
    if file.is_none() {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let opened = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        *file = Some(opened);
    }

    let line = serde_json::to_string(entry)? + "\n";
    if let Some(f) = file.as_mut() {
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        f.sync_data().await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequences_are_per_work_item() {
        let tmp = tempfile::tempdir().unwrap();
        let trail = AuditTrail::new(tmp.path().join("audit.jsonl"));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let s1 = trail.record(AuditEntry::transition(
            a,
            AuditEvent::Submitted,
            WorkItemStatus::Pending,
        ));
        let s2 = trail.record(AuditEntry::transition(
            b,
            AuditEvent::Submitted,
            WorkItemStatus::Pending,
        ));
        let s3 = trail.record(AuditEntry::transition(
            a,
            AuditEvent::Completed,
            WorkItemStatus::Completed,
        ));
        assert_eq!((s1, s2, s3), (1, 1, 2));
    }

    #[tokio::test]
    async fn test_wire_format_field_names() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let trail = AuditTrail::new(path.clone());
        let id = Uuid::new_v4();

        trail.record(
            AuditEntry::transition(id, AuditEvent::PhaseResult, WorkItemStatus::Running)
                .with_phase("review", 1)
                .with_verdict(GateAction::Warn, vec![Finding::medium("long fn")]),
        );
        trail.flush().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let line: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(line["workItemId"], id.to_string());
        assert_eq!(line["sequence"], 1);
        assert_eq!(line["phase"], "review");
        assert_eq!(line["attempt"], 1);
        assert_eq!(line["verdict"], "WARN");
        assert_eq!(line["findings"][0]["severity"], "MEDIUM");
        assert!(line["timestampUTC"].is_string());
    }

    #[tokio::test]
    async fn test_resumed_sequence_continues_and_submission_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let trail = AuditTrail::new(path.clone());
        let id = Uuid::new_v4();

        trail.resume_sequence(id, 7);
        let seq = trail.record(
            AuditEntry::transition(id, AuditEvent::Submitted, WorkItemStatus::Pending)
                .with_submission(Submission {
                    pipeline: "feature".into(),
                    title: "Add login".into(),
                    description: "OAuth".into(),
                }),
        );
        assert_eq!(seq, 8);
        // Never moves backwards.
        trail.resume_sequence(id, 2);
        assert_eq!(
            trail.record(AuditEntry::transition(
                id,
                AuditEvent::Completed,
                WorkItemStatus::Completed
            )),
            9
        );
        trail.flush().await;

        let entries = AuditTrail::read_entries(&path, Some(id)).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].submission.as_ref().unwrap().pipeline, "feature");
        assert!(entries[1].submission.is_none());
    }

    #[tokio::test]
    async fn test_write_failure_is_counted_not_raised() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every open fail.
        let path = tmp.path().join("audit.jsonl");
        std::fs::create_dir_all(&path).unwrap();
        let trail = AuditTrail::new(path);

        trail.record(AuditEntry::transition(
            Uuid::new_v4(),
            AuditEvent::Submitted,
            WorkItemStatus::Pending,
        ));
        trail.flush().await;
        assert_eq!(trail.failures(), 1);
    }
}
