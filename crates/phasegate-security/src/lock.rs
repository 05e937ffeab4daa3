//! Artifact scope locking.
//!
//! Phases acquire every scope they touch in one batch at phase entry. A batch
//! is granted atomically (all scopes or none) and requests are served in
//! arrival order: a request waits behind any earlier queued request it
//! conflicts with, so a stream of shared readers cannot starve a writer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use phasegate_core::{scopes_overlap, PhasegateError, PhasegateResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Access mode for an artifact scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockMode {
    /// Concurrent readers.
    Shared,
    /// Single writer, no readers.
    Exclusive,
}

/// Phase execution holding (or waiting for) a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// Work item the phase belongs to.
    pub work_item: Uuid,
    /// Phase name.
    pub phase: String,
}

impl LockOwner {
    /// Owner for `phase` of `work_item`.
    pub fn new(work_item: Uuid, phase: impl Into<String>) -> Self {
        Self {
            work_item,
            phase: phase.into(),
        }
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.work_item, self.phase)
    }
}

/// One scope in a lock batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    /// Artifact scope, a `/`-separated path prefix.
    pub scope: String,
    /// Requested access mode.
    pub mode: LockMode,
}

impl LockRequest {
    /// Shared access to `scope`.
    pub fn shared(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            mode: LockMode::Shared,
        }
    }

    /// Exclusive access to `scope`.
    pub fn exclusive(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            mode: LockMode::Exclusive,
        }
    }

    fn conflicts_with(&self, other: &LockRequest) -> bool {
        (self.mode == LockMode::Exclusive || other.mode == LockMode::Exclusive)
            && scopes_overlap(&self.scope, &other.scope)
    }
}

/// A granted lock on one artifact scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    /// Locked scope.
    pub scope: String,
    /// Granted mode.
    pub mode: LockMode,
    /// Phase execution holding the lock.
    pub holder: LockOwner,
    /// When the batch containing this lock was granted.
    pub acquired_at: DateTime<Utc>,
}

struct Held {
    requests: Vec<LockRequest>,
    owner: LockOwner,
    acquired_at: DateTime<Utc>,
}

struct Waiter {
    id: u64,
    requests: Vec<LockRequest>,
    owner: LockOwner,
    notify: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockTable {
    held: HashMap<u64, Held>,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

fn batches_conflict(a: &[LockRequest], b: &[LockRequest]) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.conflicts_with(y)))
}

impl LockTable {
    fn conflicts_with_held(&self, requests: &[LockRequest]) -> bool {
        self.held
            .values()
            .any(|h| batches_conflict(&h.requests, requests))
    }

    fn grant(&mut self, id: u64, requests: Vec<LockRequest>, owner: LockOwner) {
        self.held.insert(
            id,
            Held {
                requests,
                owner,
                acquired_at: Utc::now(),
            },
        );
    }

    /// Grants every queued batch that conflicts neither with holders nor
    /// with an earlier waiter still in the queue.
    fn promote(&mut self) {
        let mut remaining: VecDeque<Waiter> = VecDeque::with_capacity(self.waiters.len());
        while let Some(waiter) = self.waiters.pop_front() {
            let blocked_by_earlier = remaining
                .iter()
                .any(|w| batches_conflict(&w.requests, &waiter.requests));
            if blocked_by_earlier || self.conflicts_with_held(&waiter.requests) {
                remaining.push_back(waiter);
                continue;
            }
            let Waiter {
                id,
                requests,
                owner,
                notify,
            } = waiter;
            self.grant(id, requests, owner);
            if notify.send(()).is_err() {
                // Requester went away while queued.
                self.held.remove(&id);
            }
        }
        self.waiters = remaining;
    }

    fn release(&mut self, id: u64) {
        if self.held.remove(&id).is_some() {
            self.promote();
        }
    }
}

/// Serializes access to artifact scopes across concurrently executing phases.
///
/// Cheap to clone; clones share the same lock table.
#[derive(Clone, Default)]
pub struct ArtifactLockManager {
    table: Arc<Mutex<LockTable>>,
}

impl ArtifactLockManager {
    /// Manager with an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every scope in `requests` atomically, waiting at most `timeout`.
    ///
    /// Scopes are sorted and de-duplicated first (a scope requested in both
    /// modes is taken exclusively). An empty batch is granted immediately.
    pub async fn acquire(
        &self,
        requests: Vec<LockRequest>,
        owner: LockOwner,
        timeout: Duration,
    ) -> PhasegateResult<LockBatch> {
        let requests = normalize(requests);

        let (id, rx) = {
            let mut table = self.table.lock();
            let id = table.next_id;
            table.next_id += 1;

            let queued_conflict = table
                .waiters
                .iter()
                .any(|w| batches_conflict(&w.requests, &requests));
            if !queued_conflict && !table.conflicts_with_held(&requests) {
                table.grant(id, requests.clone(), owner.clone());
                return Ok(self.batch(id, requests, owner));
            }

            debug!(owner = %owner, scopes = requests.len(), "Waiting for artifact locks");
            let (tx, rx) = oneshot::channel();
            table.waiters.push_back(Waiter {
                id,
                requests: requests.clone(),
                owner: owner.clone(),
                notify: tx,
            });
            (id, rx)
        };

        // Leaves the queue on timeout, and when the caller drops this future.
        let mut queued = QueuedWait {
            table: Arc::clone(&self.table),
            id,
            granted: false,
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                queued.granted = true;
                Ok(self.batch(id, requests, owner))
            }
            _ => {
                drop(queued);
                let scopes: Vec<&str> = requests.iter().map(|r| r.scope.as_str()).collect();
                Err(PhasegateError::LockTimeout(format!(
                    "{owner} could not lock {scopes:?} within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Current holders of locks overlapping `scope`.
    pub fn holders(&self, scope: &str) -> Vec<Lock> {
        let table = self.table.lock();
        table
            .held
            .values()
            .flat_map(|h| {
                h.requests
                    .iter()
                    .filter(|r| scopes_overlap(&r.scope, scope))
                    .map(|r| Lock {
                        scope: r.scope.clone(),
                        mode: r.mode,
                        holder: h.owner.clone(),
                        acquired_at: h.acquired_at,
                    })
            })
            .collect()
    }

    /// Number of queued lock batches.
    pub fn waiting(&self) -> usize {
        self.table.lock().waiters.len()
    }

    fn batch(&self, id: u64, requests: Vec<LockRequest>, owner: LockOwner) -> LockBatch {
        let acquired_at = Utc::now();
        let locks = requests
            .into_iter()
            .map(|r| Lock {
                scope: r.scope,
                mode: r.mode,
                holder: owner.clone(),
                acquired_at,
            })
            .collect();
        LockBatch {
            id,
            locks,
            table: Arc::clone(&self.table),
        }
    }
}

fn normalize(mut requests: Vec<LockRequest>) -> Vec<LockRequest> {
    requests.sort_by(|a, b| a.scope.cmp(&b.scope));
    let mut out: Vec<LockRequest> = Vec::with_capacity(requests.len());
    for req in requests {
        match out.last_mut() {
            Some(last) if last.scope == req.scope => {
                if req.mode == LockMode::Exclusive {
                    last.mode = LockMode::Exclusive;
                }
            }
            _ => out.push(req),
        }
    }
    out
}

struct QueuedWait {
    table: Arc<Mutex<LockTable>>,
    id: u64,
    granted: bool,
}

impl Drop for QueuedWait {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        let mut table = self.table.lock();
        if let Some(pos) = table.waiters.iter().position(|w| w.id == self.id) {
            table.waiters.remove(pos);
            table.promote();
        } else {
            // Granted in the instant the wait ended.
            table.release(self.id);
        }
    }
}

/// Locks granted to one phase execution. Released on drop.
pub struct LockBatch {
    id: u64,
    locks: Vec<Lock>,
    table: Arc<Mutex<LockTable>>,
}

impl LockBatch {
    /// Granted locks, sorted by scope.
    pub fn locks(&self) -> &[Lock] {
        &self.locks
    }

    /// Whether this batch holds an exclusive lock covering `scope`.
    pub fn holds_exclusive(&self, scope: &str) -> bool {
        self.locks.iter().any(|l| {
            l.mode == LockMode::Exclusive && phasegate_core::scope_covers(&l.scope, scope)
        })
    }

    /// Whether the batch holds no locks (a phase touching no scopes).
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl std::fmt::Debug for LockBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockBatch")
            .field("id", &self.id)
            .field("locks", &self.locks)
            .finish()
    }
}

impl Drop for LockBatch {
    fn drop(&mut self) {
        self.table.lock().release(self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn owner(phase: &str) -> LockOwner {
        LockOwner::new(Uuid::new_v4(), phase)
    }

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let mgr = ArtifactLockManager::new();
        let a = mgr
            .acquire(vec![LockRequest::shared("src")], owner("review"), WAIT)
            .await
            .unwrap();
        let b = mgr
            .acquire(vec![LockRequest::shared("src")], owner("security"), WAIT)
            .await
            .unwrap();
        assert_eq!(mgr.holders("src").len(), 2);
        drop(a);
        drop(b);
        assert!(mgr.holders("src").is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_excludes_overlapping_scope() {
        let mgr = ArtifactLockManager::new();
        let _held = mgr
            .acquire(vec![LockRequest::exclusive("src")], owner("refactor"), WAIT)
            .await
            .unwrap();
        let err = mgr
            .acquire(vec![LockRequest::shared("src/lib.rs")], owner("docs"), WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, PhasegateError::LockTimeout(_)));
        assert_eq!(mgr.waiting(), 0);

        let disjoint = mgr
            .acquire(vec![LockRequest::exclusive("docs")], owner("docs"), WAIT)
            .await;
        assert!(disjoint.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_granted_on_release() {
        let mgr = ArtifactLockManager::new();
        let held = mgr
            .acquire(vec![LockRequest::exclusive("src")], owner("refactor"), WAIT)
            .await
            .unwrap();

        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move {
            mgr2.acquire(
                vec![LockRequest::exclusive("src")],
                owner("docs"),
                Duration::from_secs(5),
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.waiting(), 1);
        drop(held);

        let batch = waiter.await.unwrap().unwrap();
        assert!(batch.holds_exclusive("src/main.rs"));
    }

    #[tokio::test]
    async fn test_queued_exclusive_is_not_starved_by_readers() {
        let mgr = ArtifactLockManager::new();
        let reader = mgr
            .acquire(vec![LockRequest::shared("src")], owner("review"), WAIT)
            .await
            .unwrap();

        let mgr2 = mgr.clone();
        let writer = tokio::spawn(async move {
            mgr2.acquire(
                vec![LockRequest::exclusive("src")],
                owner("refactor"),
                Duration::from_secs(5),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A later reader queues behind the writer even though the current
        // holder is shared.
        let late = mgr
            .acquire(vec![LockRequest::shared("src")], owner("docs"), WAIT)
            .await;
        assert!(late.is_err());

        drop(reader);
        let batch = writer.await.unwrap().unwrap();
        assert_eq!(batch.locks()[0].mode, LockMode::Exclusive);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let mgr = ArtifactLockManager::new();
        let _docs = mgr
            .acquire(vec![LockRequest::exclusive("docs")], owner("docs"), WAIT)
            .await
            .unwrap();
        let res = mgr
            .acquire(
                vec![LockRequest::exclusive("src"), LockRequest::exclusive("docs")],
                owner("refactor"),
                WAIT,
            )
            .await;
        assert!(res.is_err());
        // `src` was not partially taken.
        assert!(mgr.holders("src").is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_wait_leaves_queue() {
        let mgr = ArtifactLockManager::new();
        let held = mgr
            .acquire(vec![LockRequest::exclusive("src")], owner("refactor"), WAIT)
            .await
            .unwrap();

        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move {
            mgr2.acquire(
                vec![LockRequest::shared("src")],
                owner("review"),
                Duration::from_secs(5),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.waiting(), 1);

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(mgr.waiting(), 0);

        drop(held);
        assert!(mgr.holders("src").is_empty());
    }

    #[test]
    fn test_normalize_sorts_and_upgrades() {
        let out = normalize(vec![
            LockRequest::shared("src"),
            LockRequest::exclusive("docs"),
            LockRequest::exclusive("src"),
        ]);
        assert_eq!(
            out,
            vec![LockRequest::exclusive("docs"), LockRequest::exclusive("src")]
        );
    }

    #[tokio::test]
    async fn test_empty_batch_granted_immediately() {
        let mgr = ArtifactLockManager::new();
        let batch = mgr.acquire(vec![], owner("plan"), WAIT).await.unwrap();
        assert!(batch.is_empty());
    }
}
