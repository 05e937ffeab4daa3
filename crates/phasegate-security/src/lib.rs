//! Concurrency and accountability primitives for Phasegate.
//!
//! Provides the artifact lock manager that serializes phases touching the
//! same files, and the append-only audit trail that records every phase
//! result and state transition.
//!
//! # Main types
//!
//! - [`ArtifactLockManager`]: FIFO-fair shared/exclusive locks over artifact scopes.
//! - [`LockBatch`]: Locks granted to one phase execution, released on drop.
//! - [`AuditTrail`]: Append-only JSONL trail with per-work-item sequence numbers.

/// Audit trail writer.
pub mod audit;
/// Artifact scope locking.
pub mod lock;

pub use audit::{AuditEntry, AuditEvent, AuditTrail, Submission};
pub use lock::{ArtifactLockManager, Lock, LockBatch, LockMode, LockOwner, LockRequest};
