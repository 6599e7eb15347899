//! Volatile in-memory backend.
//!
//! Records live in a map keyed by session id and vanish with the process;
//! that is the documented contract, not a defect. The snapshot slot is
//! single-valued (`supports_history` is false): saving overwrites. Checkpoint
//! history is an insertion-ordered list per session, newest first. Per-session
//! serialization comes from the map's sharded entry locking; there is no
//! cross-session lock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::instrument;

use braid_core::ids::{CheckpointId, SessionId};
use braid_core::RetentionPolicy;

use crate::error::{require_id, StoreError};
use crate::records::{
    CheckpointEntry, CheckpointMetadata, ExecutionCheckpoint, PendingWrite, SessionSnapshot,
    UncommittedTurn,
};
use crate::store::CheckpointStore;

#[derive(Default)]
struct SessionRecords {
    /// Single slot; `save_snapshot` overwrites.
    snapshot: Option<SessionSnapshot>,
    /// Newest first.
    checkpoints: Vec<(CheckpointEntry, ExecutionCheckpoint)>,
    uncommitted: Option<UncommittedTurn>,
    pending: HashMap<CheckpointId, Vec<PendingWrite>>,
}

impl SessionRecords {
    fn last_activity(&self) -> Option<DateTime<Utc>> {
        let snapshot_at = self.snapshot.as_ref().map(|s| s.created_at);
        let checkpoint_at = self.checkpoints.first().map(|(e, _)| e.created_at);
        match (snapshot_at, checkpoint_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<SessionId, SessionRecords>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    fn supports_history(&self) -> bool {
        false
    }

    fn supports_pending_writes(&self) -> bool {
        true
    }

    async fn load_snapshot(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionSnapshot, StoreError> {
        require_id("session id", session_id.as_str())?;
        self.sessions
            .get(session_id)
            .and_then(|records| records.snapshot.clone())
            .ok_or_else(|| StoreError::NotFound(format!("snapshot for session {session_id}")))
    }

    #[instrument(skip(self, snapshot), fields(session_id = %snapshot.session_id))]
    async fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        require_id("session id", snapshot.session_id.as_str())?;
        require_id("snapshot id", snapshot.snapshot_id.as_str())?;
        let mut records = self
            .sessions
            .entry(snapshot.session_id.clone())
            .or_default();
        records.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn list_session_ids(&self) -> Result<Vec<SessionId>, StoreError> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        self.sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
    }

    #[instrument(
        skip(self, checkpoint, meta),
        fields(session_id = %checkpoint.session_id, checkpoint_id = %checkpoint.checkpoint_id)
    )]
    async fn save_checkpoint(
        &self,
        checkpoint: &ExecutionCheckpoint,
        meta: &CheckpointMetadata,
    ) -> Result<(), StoreError> {
        require_id("session id", checkpoint.session_id.as_str())?;
        require_id("checkpoint id", checkpoint.checkpoint_id.as_str())?;
        let mut records = self
            .sessions
            .entry(checkpoint.session_id.clone())
            .or_default();
        if records
            .checkpoints
            .iter()
            .any(|(e, _)| e.checkpoint_id == checkpoint.checkpoint_id)
        {
            return Err(StoreError::InvalidArgument(format!(
                "checkpoint {} already exists for session {}",
                checkpoint.checkpoint_id, checkpoint.session_id
            )));
        }
        let entry = CheckpointEntry::from_parts(checkpoint, meta);
        records.checkpoints.insert(0, (entry, checkpoint.clone()));
        // Newest by creation time first, same ordering as the file backend.
        records
            .checkpoints
            .sort_by(|(a, _), (b, _)| b.created_at.cmp(&a.created_at));
        Ok(())
    }

    async fn load_latest_checkpoint(
        &self,
        session_id: &SessionId,
    ) -> Result<ExecutionCheckpoint, StoreError> {
        require_id("session id", session_id.as_str())?;
        self.sessions
            .get(session_id)
            .and_then(|records| records.checkpoints.first().map(|(_, c)| c.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("checkpoint for session {session_id}")))
    }

    async fn load_checkpoint_at(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<ExecutionCheckpoint, StoreError> {
        require_id("session id", session_id.as_str())?;
        require_id("checkpoint id", checkpoint_id.as_str())?;
        self.sessions
            .get(session_id)
            .and_then(|records| {
                records
                    .checkpoints
                    .iter()
                    .find(|(e, _)| &e.checkpoint_id == checkpoint_id)
                    .map(|(_, c)| c.clone())
            })
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "checkpoint {checkpoint_id} for session {session_id}"
                ))
            })
    }

    async fn list_checkpoints(
        &self,
        session_id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointEntry>, StoreError> {
        require_id("session id", session_id.as_str())?;
        let mut entries: Vec<CheckpointEntry> = self
            .sessions
            .get(session_id)
            .map(|records| records.checkpoints.iter().map(|(e, _)| e.clone()).collect())
            .unwrap_or_default();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn delete_checkpoints(
        &self,
        session_id: &SessionId,
        checkpoint_ids: &[CheckpointId],
    ) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        if let Some(mut records) = self.sessions.get_mut(session_id) {
            records
                .checkpoints
                .retain(|(e, _)| !checkpoint_ids.contains(&e.checkpoint_id));
            for id in checkpoint_ids {
                records.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_all_checkpoints(&self, session_id: &SessionId) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        if let Some(mut records) = self.sessions.get_mut(session_id) {
            records.checkpoints.clear();
            records.pending.clear();
        }
        Ok(())
    }

    async fn save_uncommitted_turn(&self, turn: &UncommittedTurn) -> Result<(), StoreError> {
        require_id("session id", turn.session_id.as_str())?;
        let mut records = self.sessions.entry(turn.session_id.clone()).or_default();
        records.uncommitted = Some(turn.clone());
        Ok(())
    }

    async fn load_uncommitted_turn(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<UncommittedTurn>, StoreError> {
        require_id("session id", session_id.as_str())?;
        Ok(self
            .sessions
            .get(session_id)
            .and_then(|records| records.uncommitted.clone()))
    }

    async fn clear_uncommitted_turn(&self, session_id: &SessionId) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        if let Some(mut records) = self.sessions.get_mut(session_id) {
            records.uncommitted = None;
        }
        Ok(())
    }

    async fn save_pending_writes(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
        writes: &[PendingWrite],
    ) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        require_id("checkpoint id", checkpoint_id.as_str())?;
        let mut records = self.sessions.entry(session_id.clone()).or_default();
        records
            .pending
            .entry(checkpoint_id.clone())
            .or_default()
            .extend(writes.iter().cloned());
        Ok(())
    }

    async fn load_pending_writes(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Vec<PendingWrite>, StoreError> {
        require_id("session id", session_id.as_str())?;
        require_id("checkpoint id", checkpoint_id.as_str())?;
        Ok(self
            .sessions
            .get(session_id)
            .and_then(|records| records.pending.get(checkpoint_id).cloned())
            .unwrap_or_default())
    }

    async fn delete_pending_writes(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        require_id("checkpoint id", checkpoint_id.as_str())?;
        if let Some(mut records) = self.sessions.get_mut(session_id) {
            records.pending.remove(checkpoint_id);
        }
        Ok(())
    }

    #[instrument(skip(self, policy), fields(session_id = %session_id))]
    async fn prune_checkpoints(
        &self,
        session_id: &SessionId,
        policy: &RetentionPolicy,
    ) -> Result<usize, StoreError> {
        require_id("session id", session_id.as_str())?;
        if policy.is_noop() {
            return Ok(0);
        }
        let Some(mut records) = self.sessions.get_mut(session_id) else {
            return Ok(0);
        };
        let created: Vec<DateTime<Utc>> =
            records.checkpoints.iter().map(|(e, _)| e.created_at).collect();
        let decision = policy.partition(&created, Utc::now());
        if decision.delete.is_empty() {
            return Ok(0);
        }

        let doomed: Vec<CheckpointId> = decision
            .delete
            .iter()
            .map(|&i| records.checkpoints[i].0.checkpoint_id.clone())
            .collect();
        records
            .checkpoints
            .retain(|(e, _)| !doomed.contains(&e.checkpoint_id));
        for id in &doomed {
            records.pending.remove(id);
        }
        Ok(doomed.len())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for id in ids {
            let mut drop_session = false;
            if let Some(mut records) = self.sessions.get_mut(&id) {
                if records
                    .snapshot
                    .as_ref()
                    .is_some_and(|s| s.created_at < cutoff)
                {
                    records.snapshot = None;
                    removed += 1;
                }
                let doomed: Vec<CheckpointId> = records
                    .checkpoints
                    .iter()
                    .filter(|(e, _)| e.created_at < cutoff)
                    .map(|(e, _)| e.checkpoint_id.clone())
                    .collect();
                removed += doomed.len();
                records
                    .checkpoints
                    .retain(|(e, _)| !doomed.contains(&e.checkpoint_id));
                for ckpt in &doomed {
                    records.pending.remove(ckpt);
                }
                if records.snapshot.is_none() && records.checkpoints.is_empty() {
                    drop_session = true;
                }
            }
            if drop_session {
                self.sessions.remove(&id);
            }
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn delete_inactive_sessions(
        &self,
        threshold: Duration,
        dry_run: bool,
    ) -> Result<usize, StoreError> {
        let deadline = Utc::now() - threshold;
        let inactive: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| match entry.value().last_activity() {
                Some(at) => at < deadline,
                None => true,
            })
            .map(|entry| entry.key().clone())
            .collect();
        if !dry_run {
            for id in &inactive {
                self.sessions.remove(id);
            }
        }
        Ok(inactive.len())
    }
}
