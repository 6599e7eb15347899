//! The persistence contract both backends implement.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use braid_core::ids::{CheckpointId, SessionId};
use braid_core::RetentionPolicy;

use crate::error::StoreError;
use crate::records::{
    CheckpointEntry, CheckpointMetadata, ExecutionCheckpoint, PendingWrite, SessionSnapshot,
    UncommittedTurn,
};

/// Durable-state contract for the agent runtime.
///
/// Sessions are fully independent: operations on different session ids may
/// run concurrently, while operations touching the same session are
/// serialized by the backend. Dropping an in-flight future cancels at an
/// operation boundary only; a committed write stays committed and a
/// half-finished one is never observable.
///
/// `NotFound` is an expected outcome for optimistic probes (e.g. recovery
/// checking for an in-flight checkpoint), not an exceptional path.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Whether `save_snapshot` accumulates browsable history. Single-slot
    /// backends report false and keep only the latest snapshot.
    fn supports_history(&self) -> bool;

    /// Whether the pending-write buffer is available.
    fn supports_pending_writes(&self) -> bool;

    // --- Snapshots ---

    /// Load the most recent snapshot for a session.
    async fn load_snapshot(&self, session_id: &SessionId)
        -> Result<SessionSnapshot, StoreError>;

    /// Persist a snapshot. Single-slot backends overwrite the previous one;
    /// history-bearing backends append a new record.
    async fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError>;

    async fn list_session_ids(&self) -> Result<Vec<SessionId>, StoreError>;

    /// Remove a session and everything recorded under it.
    async fn delete_session(&self, session_id: &SessionId) -> Result<(), StoreError>;

    // --- Execution checkpoints ---

    /// Append a checkpoint. A duplicate checkpoint id is an error; records
    /// are never overwritten in place.
    async fn save_checkpoint(
        &self,
        checkpoint: &ExecutionCheckpoint,
        meta: &CheckpointMetadata,
    ) -> Result<(), StoreError>;

    /// Load the most recently created checkpoint for a session.
    async fn load_latest_checkpoint(
        &self,
        session_id: &SessionId,
    ) -> Result<ExecutionCheckpoint, StoreError>;

    async fn load_checkpoint_at(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<ExecutionCheckpoint, StoreError>;

    /// Checkpoint metadata, newest first. Empty for an unknown session.
    async fn list_checkpoints(
        &self,
        session_id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointEntry>, StoreError>;

    /// Delete specific checkpoints (and their pending writes).
    async fn delete_checkpoints(
        &self,
        session_id: &SessionId,
        checkpoint_ids: &[CheckpointId],
    ) -> Result<(), StoreError>;

    /// Delete every checkpoint and associated pending write for a session.
    /// Snapshots are untouched.
    async fn delete_all_checkpoints(&self, session_id: &SessionId) -> Result<(), StoreError>;

    // --- Uncommitted turn ---

    /// Persist the in-flight turn delta. Last write wins: starting a new
    /// turn discards whatever was there.
    async fn save_uncommitted_turn(&self, turn: &UncommittedTurn) -> Result<(), StoreError>;

    /// `None` when no turn is in flight; absence is not an error here.
    async fn load_uncommitted_turn(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<UncommittedTurn>, StoreError>;

    async fn clear_uncommitted_turn(&self, session_id: &SessionId) -> Result<(), StoreError>;

    // --- Pending writes ---

    /// Append writes under `(session, checkpoint)`. Repeated calls
    /// accumulate in call order; they never replace.
    async fn save_pending_writes(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
        writes: &[PendingWrite],
    ) -> Result<(), StoreError>;

    /// Everything recorded under `(session, checkpoint)`, in append order.
    /// Empty when nothing was recorded.
    async fn load_pending_writes(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Vec<PendingWrite>, StoreError>;

    async fn delete_pending_writes(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<(), StoreError>;

    // --- Maintenance ---

    /// Apply a retention policy to a session's checkpoints. Returns how many
    /// were deleted. A no-op under `FullHistory` or for an unknown session.
    async fn prune_checkpoints(
        &self,
        session_id: &SessionId,
        policy: &RetentionPolicy,
    ) -> Result<usize, StoreError>;

    /// Sweep all sessions, dropping snapshots and checkpoints created before
    /// `cutoff`. A session with nothing left is removed entirely. Returns
    /// the number of records removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Delete sessions whose most recent snapshot or checkpoint is older
    /// than `now - threshold`. With `dry_run`, only counts. Returns the
    /// number of sessions affected.
    async fn delete_inactive_sessions(
        &self,
        threshold: Duration,
        dry_run: bool,
    ) -> Result<usize, StoreError>;
}
