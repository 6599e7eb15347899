//! Crash-safe file backend.
//!
//! Layout, rooted at a configured base path:
//!
//! ```text
//! <base>/sessions/<sessionId>/manifest.json
//! <base>/sessions/<sessionId>/snapshots/<snapshotId>.json
//! <base>/sessions/<sessionId>/checkpoints/<checkpointId>.json
//! <base>/sessions/<sessionId>/uncommitted.json
//! <base>/pending/<sessionId>_<checkpointId>.json
//! ```
//!
//! Every write goes through the atomic protocol: serialize, write a uniquely
//! named temp sibling, rename over the destination. A reader can only ever
//! observe the old content or the new content, never a partial file. Save
//! paths write the body before the manifest and delete paths rewrite the
//! manifest before removing bodies, so the manifest never references a body
//! that was lost to a crash.
//!
//! A process-local mutex serializes all access to one store instance. Two
//! processes pointed at the same directory are unsupported.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use braid_core::ids::{CheckpointId, SessionId};
use braid_core::RetentionPolicy;

use crate::error::{require_id, StoreError};
use crate::records::{
    CheckpointEntry, CheckpointMetadata, ExecutionCheckpoint, PendingWrite, SessionSnapshot,
    SnapshotEntry, UncommittedTurn,
};
use crate::store::CheckpointStore;

/// Per-session index of snapshot and checkpoint records, newest first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotEntry>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointEntry>,
}

impl SessionManifest {
    fn new(session_id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            created_at: now,
            last_updated: now,
            snapshots: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        let snapshot_at = self.snapshots.first().map(|e| e.created_at);
        let checkpoint_at = self.checkpoints.first().map(|e| e.created_at);
        match (snapshot_at, checkpoint_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

pub struct FileStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("sessions"))?;
        fs::create_dir_all(root.join("pending"))?;
        // Temps abandoned by a crash mid-write are unreachable garbage.
        sweep_stale_temps(&root)?;
        info!(root = %root.display(), "file store opened");
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot history for a session, newest first. Backend-specific
    /// surface: only meaningful where `supports_history` is true.
    pub fn snapshot_history(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<SnapshotEntry>, StoreError> {
        require_id("session id", session_id.as_str())?;
        let _guard = self.lock.lock();
        Ok(self
            .read_manifest(session_id)?
            .map(|m| m.snapshots)
            .unwrap_or_default())
    }

    // --- Paths ---

    fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root.join("sessions").join(session_id.as_str())
    }

    fn manifest_path(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join("manifest.json")
    }

    fn snapshot_path(&self, session_id: &SessionId, snapshot_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join("snapshots")
            .join(format!("{snapshot_id}.json"))
    }

    fn checkpoint_path(&self, session_id: &SessionId, checkpoint_id: &CheckpointId) -> PathBuf {
        self.session_dir(session_id)
            .join("checkpoints")
            .join(format!("{checkpoint_id}.json"))
    }

    fn uncommitted_path(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join("uncommitted.json")
    }

    fn pending_path(&self, session_id: &SessionId, checkpoint_id: &CheckpointId) -> PathBuf {
        self.root
            .join("pending")
            .join(format!("{}_{}.json", session_id.as_str(), checkpoint_id.as_str()))
    }

    // --- Manifest plumbing ---

    fn read_manifest(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionManifest>, StoreError> {
        read_json_opt(&self.manifest_path(session_id))
    }

    fn write_manifest(&self, manifest: &SessionManifest) -> Result<(), StoreError> {
        let path = self.manifest_path(&manifest.session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_json_atomic(&path, manifest)
    }

    fn manifest_or_init(&self, session_id: &SessionId) -> Result<SessionManifest, StoreError> {
        Ok(self
            .read_manifest(session_id)?
            .unwrap_or_else(|| SessionManifest::new(session_id.clone(), Utc::now())))
    }

    // --- Record removal ---

    fn remove_checkpoint_records(
        &self,
        session_id: &SessionId,
        checkpoint_ids: &[CheckpointId],
    ) {
        for id in checkpoint_ids {
            let _ = fs::remove_file(self.checkpoint_path(session_id, id));
            let _ = fs::remove_file(self.pending_path(session_id, id));
        }
    }

    fn remove_pending_for_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let prefix = format!("{}_", session_id.as_str());
        for entry in fs::read_dir(self.root.join("pending"))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&prefix) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    fn remove_session_dir(&self, session_id: &SessionId) -> Result<(), StoreError> {
        fs::remove_dir_all(self.session_dir(session_id))?;
        self.remove_pending_for_session(session_id)
    }

    fn session_ids_on_disk(&self) -> Result<Vec<SessionId>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join("sessions"))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(SessionId::from_raw(name));
                }
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    fn supports_history(&self) -> bool {
        true
    }

    fn supports_pending_writes(&self) -> bool {
        true
    }

    async fn load_snapshot(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionSnapshot, StoreError> {
        require_id("session id", session_id.as_str())?;
        let _guard = self.lock.lock();
        let manifest = self
            .read_manifest(session_id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        let entry = manifest
            .snapshots
            .first()
            .ok_or_else(|| StoreError::NotFound(format!("snapshot for session {session_id}")))?;
        let path = self.snapshot_path(session_id, entry.snapshot_id.as_str());
        read_json_opt(&path)?.ok_or_else(|| StoreError::CorruptRecord {
            path: path.display().to_string(),
            reason: "manifest references a missing snapshot body".into(),
        })
    }

    #[instrument(skip(self, snapshot), fields(session_id = %snapshot.session_id))]
    async fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        require_id("session id", snapshot.session_id.as_str())?;
        require_id("snapshot id", snapshot.snapshot_id.as_str())?;
        let _guard = self.lock.lock();

        let path = self.snapshot_path(&snapshot.session_id, snapshot.snapshot_id.as_str());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Body first: the manifest must never point at a record that is not
        // fully on disk.
        write_json_atomic(&path, snapshot)?;

        let mut manifest = self.manifest_or_init(&snapshot.session_id)?;
        manifest.snapshots.insert(
            0,
            SnapshotEntry {
                snapshot_id: snapshot.snapshot_id.clone(),
                created_at: snapshot.created_at,
                message_index: snapshot.message_index,
            },
        );
        manifest
            .snapshots
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));
        manifest.last_updated = Utc::now();
        self.write_manifest(&manifest)
    }

    async fn list_session_ids(&self) -> Result<Vec<SessionId>, StoreError> {
        let _guard = self.lock.lock();
        self.session_ids_on_disk()
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn delete_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        let _guard = self.lock.lock();
        if !self.session_dir(session_id).is_dir() {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        self.remove_session_dir(session_id)
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
        let _guard = self.lock.lock();

        let mut manifest = self.manifest_or_init(&checkpoint.session_id)?;
        if manifest
            .checkpoints
            .iter()
            .any(|e| e.checkpoint_id == checkpoint.checkpoint_id)
        {
            return Err(StoreError::InvalidArgument(format!(
                "checkpoint {} already exists for session {}",
                checkpoint.checkpoint_id, checkpoint.session_id
            )));
        }

        let path = self.checkpoint_path(&checkpoint.session_id, &checkpoint.checkpoint_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_json_atomic(&path, checkpoint)?;

        manifest
            .checkpoints
            .insert(0, CheckpointEntry::from_parts(checkpoint, meta));
        manifest
            .checkpoints
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));
        manifest.last_updated = Utc::now();
        self.write_manifest(&manifest)
    }

    async fn load_latest_checkpoint(
        &self,
        session_id: &SessionId,
    ) -> Result<ExecutionCheckpoint, StoreError> {
        require_id("session id", session_id.as_str())?;
        let _guard = self.lock.lock();
        let manifest = self
            .read_manifest(session_id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        let entry = manifest
            .checkpoints
            .first()
            .ok_or_else(|| StoreError::NotFound(format!("checkpoint for session {session_id}")))?;
        let path = self.checkpoint_path(session_id, &entry.checkpoint_id);
        read_json_opt(&path)?.ok_or_else(|| StoreError::CorruptRecord {
            path: path.display().to_string(),
            reason: "manifest references a missing checkpoint body".into(),
        })
    }

    async fn load_checkpoint_at(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<ExecutionCheckpoint, StoreError> {
        require_id("session id", session_id.as_str())?;
        require_id("checkpoint id", checkpoint_id.as_str())?;
        let _guard = self.lock.lock();
        let manifest = self
            .read_manifest(session_id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        if !manifest
            .checkpoints
            .iter()
            .any(|e| &e.checkpoint_id == checkpoint_id)
        {
            return Err(StoreError::NotFound(format!(
                "checkpoint {checkpoint_id} for session {session_id}"
            )));
        }
        let path = self.checkpoint_path(session_id, checkpoint_id);
        read_json_opt(&path)?.ok_or_else(|| StoreError::CorruptRecord {
            path: path.display().to_string(),
            reason: "manifest references a missing checkpoint body".into(),
        })
    }

    async fn list_checkpoints(
        &self,
        session_id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointEntry>, StoreError> {
        require_id("session id", session_id.as_str())?;
        let _guard = self.lock.lock();
        let mut entries = self
            .read_manifest(session_id)?
            .map(|m| m.checkpoints)
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
        let _guard = self.lock.lock();
        let Some(mut manifest) = self.read_manifest(session_id)? else {
            return Ok(());
        };
        manifest
            .checkpoints
            .retain(|e| !checkpoint_ids.contains(&e.checkpoint_id));
        manifest.last_updated = Utc::now();
        // Manifest first; bodies orphaned by a crash here are unreachable
        // and harmless.
        self.write_manifest(&manifest)?;
        self.remove_checkpoint_records(session_id, checkpoint_ids);
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn delete_all_checkpoints(&self, session_id: &SessionId) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        let _guard = self.lock.lock();
        let Some(mut manifest) = self.read_manifest(session_id)? else {
            return Ok(());
        };
        let doomed: Vec<CheckpointId> = manifest
            .checkpoints
            .iter()
            .map(|e| e.checkpoint_id.clone())
            .collect();
        manifest.checkpoints.clear();
        manifest.last_updated = Utc::now();
        self.write_manifest(&manifest)?;
        self.remove_checkpoint_records(session_id, &doomed);
        self.remove_pending_for_session(session_id)
    }

    async fn save_uncommitted_turn(&self, turn: &UncommittedTurn) -> Result<(), StoreError> {
        require_id("session id", turn.session_id.as_str())?;
        let _guard = self.lock.lock();
        let path = self.uncommitted_path(&turn.session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_json_atomic(&path, turn)
    }

    async fn load_uncommitted_turn(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<UncommittedTurn>, StoreError> {
        require_id("session id", session_id.as_str())?;
        let _guard = self.lock.lock();
        read_json_opt(&self.uncommitted_path(session_id))
    }

    async fn clear_uncommitted_turn(&self, session_id: &SessionId) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        let _guard = self.lock.lock();
        match fs::remove_file(self.uncommitted_path(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_pending_writes(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
        writes: &[PendingWrite],
    ) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        require_id("checkpoint id", checkpoint_id.as_str())?;
        let _guard = self.lock.lock();
        let path = self.pending_path(session_id, checkpoint_id);
        let mut all: Vec<PendingWrite> = read_json_opt(&path)?.unwrap_or_default();
        all.extend(writes.iter().cloned());
        write_json_atomic(&path, &all)
    }

    async fn load_pending_writes(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Vec<PendingWrite>, StoreError> {
        require_id("session id", session_id.as_str())?;
        require_id("checkpoint id", checkpoint_id.as_str())?;
        let _guard = self.lock.lock();
        Ok(read_json_opt(&self.pending_path(session_id, checkpoint_id))?.unwrap_or_default())
    }

    async fn delete_pending_writes(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<(), StoreError> {
        require_id("session id", session_id.as_str())?;
        require_id("checkpoint id", checkpoint_id.as_str())?;
        let _guard = self.lock.lock();
        match fs::remove_file(self.pending_path(session_id, checkpoint_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
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
        let _guard = self.lock.lock();
        let Some(mut manifest) = self.read_manifest(session_id)? else {
            return Ok(0);
        };
        let created: Vec<DateTime<Utc>> =
            manifest.checkpoints.iter().map(|e| e.created_at).collect();
        let decision = policy.partition(&created, Utc::now());
        if decision.delete.is_empty() {
            return Ok(0);
        }

        let doomed: Vec<CheckpointId> = decision
            .delete
            .iter()
            .map(|&i| manifest.checkpoints[i].checkpoint_id.clone())
            .collect();
        manifest
            .checkpoints
            .retain(|e| !doomed.contains(&e.checkpoint_id));
        manifest.last_updated = Utc::now();
        self.write_manifest(&manifest)?;
        self.remove_checkpoint_records(session_id, &doomed);
        info!(deleted = doomed.len(), "pruned checkpoints");
        Ok(doomed.len())
    }

    #[instrument(skip(self))]
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let _guard = self.lock.lock();
        let mut removed = 0;
        for session_id in self.session_ids_on_disk()? {
            let Some(mut manifest) = self.read_manifest(&session_id)? else {
                continue;
            };

            let old_snapshots: Vec<SnapshotEntry> = manifest
                .snapshots
                .iter()
                .filter(|e| e.created_at < cutoff)
                .cloned()
                .collect();
            let old_checkpoints: Vec<CheckpointId> = manifest
                .checkpoints
                .iter()
                .filter(|e| e.created_at < cutoff)
                .map(|e| e.checkpoint_id.clone())
                .collect();
            if old_snapshots.is_empty() && old_checkpoints.is_empty() {
                continue;
            }
            removed += old_snapshots.len() + old_checkpoints.len();

            manifest.snapshots.retain(|e| e.created_at >= cutoff);
            manifest.checkpoints.retain(|e| e.created_at >= cutoff);

            if manifest.snapshots.is_empty() && manifest.checkpoints.is_empty() {
                self.remove_session_dir(&session_id)?;
                continue;
            }

            manifest.last_updated = Utc::now();
            self.write_manifest(&manifest)?;
            for entry in &old_snapshots {
                let _ = fs::remove_file(self.snapshot_path(&session_id, entry.snapshot_id.as_str()));
            }
            self.remove_checkpoint_records(&session_id, &old_checkpoints);
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn delete_inactive_sessions(
        &self,
        threshold: Duration,
        dry_run: bool,
    ) -> Result<usize, StoreError> {
        let _guard = self.lock.lock();
        let deadline = Utc::now() - threshold;
        let mut affected = 0;
        for session_id in self.session_ids_on_disk()? {
            let inactive = match self.read_manifest(&session_id)? {
                Some(manifest) => match manifest.last_activity() {
                    Some(at) => at < deadline,
                    None => true,
                },
                // A session directory without a manifest holds nothing
                // recoverable.
                None => true,
            };
            if !inactive {
                continue;
            }
            affected += 1;
            if !dry_run {
                self.remove_session_dir(&session_id)?;
            }
        }
        Ok(affected)
    }
}

// --- Atomic JSON I/O ---

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Io(format!("read {}: {e}", path.display()))),
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(StoreError::CorruptRecord {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = tmp_sibling(path);
    if let Err(e) = fs::write(&tmp, &bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::Io(format!("write {}: {e}", tmp.display())));
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::Io(format!(
            "rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

/// Remove `*.tmp` leftovers anywhere under the store root.
fn sweep_stale_temps(dir: &Path) -> Result<(), StoreError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            sweep_stale_temps(&path)?;
        } else if path.extension().is_some_and(|e| e == "tmp") {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

/// Uniquely named temp sibling so an abandoned write can never collide with
/// a later one.
fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    path.with_file_name(format!("{name}.{}.tmp", Uuid::now_v7()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn snapshot(session_id: &SessionId) -> SessionSnapshot {
        SessionSnapshot::new(session_id.clone(), Vec::new(), None, 0)
    }

    fn checkpoint_at(
        session_id: &SessionId,
        iteration: u32,
        created_at: DateTime<Utc>,
    ) -> ExecutionCheckpoint {
        let mut checkpoint = ExecutionCheckpoint::new(session_id.clone(), iteration);
        checkpoint.created_at = created_at;
        checkpoint
    }

    #[tokio::test]
    async fn open_creates_layout() {
        let (dir, _store) = open_store();
        assert!(dir.path().join("sessions").is_dir());
        assert!(dir.path().join("pending").is_dir());
    }

    #[tokio::test]
    async fn snapshot_roundtrip_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let session = SessionId::new();
        let saved = snapshot(&session);
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.save_snapshot(&saved).await.unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        let loaded = store.load_snapshot(&session).await.unwrap();
        assert_eq!(loaded.snapshot_id, saved.snapshot_id);
    }

    #[tokio::test]
    async fn snapshots_accumulate_history_and_load_returns_newest() {
        let (_dir, store) = open_store();
        let session = SessionId::new();

        let mut first = snapshot(&session);
        first.created_at = Utc::now() - Duration::minutes(1);
        let second = snapshot(&session);

        store.save_snapshot(&first).await.unwrap();
        store.save_snapshot(&second).await.unwrap();

        assert!(store.supports_history());
        let history = store.snapshot_history(&session).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].snapshot_id, second.snapshot_id);

        let loaded = store.load_snapshot(&session).await.unwrap();
        assert_eq!(loaded.snapshot_id, second.snapshot_id);
    }

    #[tokio::test]
    async fn out_of_order_snapshot_save_still_loads_newest() {
        let (_dir, store) = open_store();
        let session = SessionId::new();

        let newest = snapshot(&session);
        let mut older = snapshot(&session);
        older.created_at = Utc::now() - Duration::hours(1);

        store.save_snapshot(&newest).await.unwrap();
        store.save_snapshot(&older).await.unwrap();

        let loaded = store.load_snapshot(&session).await.unwrap();
        assert_eq!(loaded.snapshot_id, newest.snapshot_id);
    }

    #[tokio::test]
    async fn checkpoint_scenario_latest_then_prune() {
        let (_dir, store) = open_store();
        let session = SessionId::new();
        let now = Utc::now();

        let c1 = checkpoint_at(&session, 1, now);
        let c2 = checkpoint_at(&session, 2, now + Duration::seconds(10));
        store
            .save_checkpoint(&c1, &CheckpointMetadata::default())
            .await
            .unwrap();
        store
            .save_checkpoint(&c2, &CheckpointMetadata::default())
            .await
            .unwrap();
        store
            .save_pending_writes(
                &session,
                &c1.checkpoint_id,
                &[PendingWrite::new("op", serde_json::json!(1))],
            )
            .await
            .unwrap();

        let latest = store.load_latest_checkpoint(&session).await.unwrap();
        assert_eq!(latest.checkpoint_id, c2.checkpoint_id);

        let deleted = store
            .prune_checkpoints(&session, &RetentionPolicy::LatestOnly)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let entries = store.list_checkpoints(&session, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].checkpoint_id, c2.checkpoint_id);

        let err = store
            .load_checkpoint_at(&session, &c1.checkpoint_id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        // The pruned checkpoint's pending writes went with it.
        let pending = store
            .load_pending_writes(&session, &c1.checkpoint_id)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn prune_under_full_history_is_a_noop() {
        let (_dir, store) = open_store();
        let session = SessionId::new();
        for i in 0..3 {
            let c = checkpoint_at(&session, i, Utc::now() + Duration::seconds(i as i64));
            store
                .save_checkpoint(&c, &CheckpointMetadata::default())
                .await
                .unwrap();
        }
        let deleted = store
            .prune_checkpoints(&session, &RetentionPolicy::FullHistory)
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(store.list_checkpoints(&session, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn checkpoint_metadata_lands_in_the_manifest() {
        let (_dir, store) = open_store();
        let session = SessionId::new();
        let parent = CheckpointId::new();
        let checkpoint = ExecutionCheckpoint::new(session.clone(), 4);
        let meta = CheckpointMetadata {
            step: 9,
            source: crate::records::CheckpointSource::TurnEnd,
            parent_checkpoint_id: Some(parent.clone()),
            message_index: 17,
        };
        store.save_checkpoint(&checkpoint, &meta).await.unwrap();

        let entries = store.list_checkpoints(&session, None).await.unwrap();
        assert_eq!(entries[0].step, 9);
        assert_eq!(entries[0].parent_checkpoint_id, Some(parent));
        assert_eq!(entries[0].message_index, 17);
    }

    #[tokio::test]
    async fn stray_temp_file_never_shadows_committed_content() {
        let (_dir, store) = open_store();
        let session = SessionId::new();
        let saved = snapshot(&session);
        store.save_snapshot(&saved).await.unwrap();

        // Simulate a crash between temp write and rename: a temp sibling
        // full of garbage next to the manifest and the body.
        let manifest_path = store.manifest_path(&session);
        fs::write(
            manifest_path.with_file_name("manifest.json.deadbeef.tmp"),
            b"{ truncated",
        )
        .unwrap();
        let body_path = store.snapshot_path(&session, saved.snapshot_id.as_str());
        fs::write(
            body_path.with_file_name(format!("{}.json.deadbeef.tmp", saved.snapshot_id)),
            b"garbage",
        )
        .unwrap();

        let loaded = store.load_snapshot(&session).await.unwrap();
        assert_eq!(loaded.snapshot_id, saved.snapshot_id);
    }

    #[tokio::test]
    async fn reopen_sweeps_abandoned_temp_files() {
        let dir = TempDir::new().unwrap();
        let session = SessionId::new();
        let saved = snapshot(&session);
        let (manifest_tmp, pending_tmp);
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.save_snapshot(&saved).await.unwrap();
            manifest_tmp = store
                .manifest_path(&session)
                .with_file_name("manifest.json.deadbeef.tmp");
            pending_tmp = dir.path().join("pending").join("sess_x_ckpt_y.json.tmp");
            fs::write(&manifest_tmp, b"{ truncated").unwrap();
            fs::write(&pending_tmp, b"garbage").unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert!(!manifest_tmp.exists());
        assert!(!pending_tmp.exists());
        let loaded = store.load_snapshot(&session).await.unwrap();
        assert_eq!(loaded.snapshot_id, saved.snapshot_id);
    }

    #[tokio::test]
    async fn corrupt_body_is_reported_not_hidden() {
        let (_dir, store) = open_store();
        let session = SessionId::new();
        let checkpoint = ExecutionCheckpoint::new(session.clone(), 1);
        store
            .save_checkpoint(&checkpoint, &CheckpointMetadata::default())
            .await
            .unwrap();

        let path = store.checkpoint_path(&session, &checkpoint.checkpoint_id);
        fs::write(&path, b"{ not json").unwrap();

        let err = store
            .load_checkpoint_at(&session, &checkpoint.checkpoint_id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptRecord { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn corrupt_manifest_is_reported_not_hidden() {
        let (_dir, store) = open_store();
        let session = SessionId::new();
        store.save_snapshot(&snapshot(&session)).await.unwrap();
        fs::write(store.manifest_path(&session), b"###").unwrap();

        let err = store.load_snapshot(&session).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptRecord { .. }));
    }

    #[tokio::test]
    async fn pending_writes_accumulate_across_calls() {
        let (_dir, store) = open_store();
        let session = SessionId::new();
        let ckpt = CheckpointId::new();

        let first = vec![PendingWrite::new("a", serde_json::json!(1))];
        let second = vec![
            PendingWrite::new("b", serde_json::json!(2)),
            PendingWrite::new("c", serde_json::json!(3)),
        ];
        store
            .save_pending_writes(&session, &ckpt, &first)
            .await
            .unwrap();
        store
            .save_pending_writes(&session, &ckpt, &second)
            .await
            .unwrap();

        let loaded = store.load_pending_writes(&session, &ckpt).await.unwrap();
        let ops: Vec<&str> = loaded.iter().map(|w| w.operation.as_str()).collect();
        assert_eq!(ops, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn delete_pending_writes_is_idempotent() {
        let (_dir, store) = open_store();
        let session = SessionId::new();
        let ckpt = CheckpointId::new();
        store.delete_pending_writes(&session, &ckpt).await.unwrap();
        store
            .save_pending_writes(&session, &ckpt, &[PendingWrite::new("x", serde_json::json!(0))])
            .await
            .unwrap();
        store.delete_pending_writes(&session, &ckpt).await.unwrap();
        store.delete_pending_writes(&session, &ckpt).await.unwrap();
        assert!(store
            .load_pending_writes(&session, &ckpt)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn uncommitted_turn_roundtrip_and_clear() {
        let (_dir, store) = open_store();
        let session = SessionId::new();

        store
            .save_uncommitted_turn(&UncommittedTurn::new(session.clone(), 1))
            .await
            .unwrap();
        store
            .save_uncommitted_turn(&UncommittedTurn::new(session.clone(), 5))
            .await
            .unwrap();

        let turn = store.load_uncommitted_turn(&session).await.unwrap().unwrap();
        assert_eq!(turn.iteration, 5);

        store.clear_uncommitted_turn(&session).await.unwrap();
        assert!(store.load_uncommitted_turn(&session).await.unwrap().is_none());
        // Clearing again is fine.
        store.clear_uncommitted_turn(&session).await.unwrap();
    }

    #[tokio::test]
    async fn delete_all_checkpoints_keeps_snapshots() {
        let (_dir, store) = open_store();
        let session = SessionId::new();
        store.save_snapshot(&snapshot(&session)).await.unwrap();
        let checkpoint = ExecutionCheckpoint::new(session.clone(), 1);
        store
            .save_checkpoint(&checkpoint, &CheckpointMetadata::default())
            .await
            .unwrap();
        store
            .save_pending_writes(
                &session,
                &checkpoint.checkpoint_id,
                &[PendingWrite::new("op", serde_json::json!(null))],
            )
            .await
            .unwrap();

        store.delete_all_checkpoints(&session).await.unwrap();

        assert!(store.load_snapshot(&session).await.is_ok());
        assert!(matches!(
            store.load_latest_checkpoint(&session).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store
            .load_pending_writes(&session, &checkpoint.checkpoint_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn delete_session_removes_directory_and_pending_files() {
        let (dir, store) = open_store();
        let session = SessionId::new();
        let checkpoint = ExecutionCheckpoint::new(session.clone(), 1);
        store
            .save_checkpoint(&checkpoint, &CheckpointMetadata::default())
            .await
            .unwrap();
        store
            .save_pending_writes(
                &session,
                &checkpoint.checkpoint_id,
                &[PendingWrite::new("op", serde_json::json!(null))],
            )
            .await
            .unwrap();

        store.delete_session(&session).await.unwrap();

        assert!(!dir.path().join("sessions").join(session.as_str()).exists());
        let pending: Vec<_> = fs::read_dir(dir.path().join("pending"))
            .unwrap()
            .collect();
        assert!(pending.is_empty());
        assert!(matches!(
            store.delete_session(&session).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_older_than_removes_spent_sessions() {
        let (_dir, store) = open_store();
        let old_session = SessionId::new();
        let live_session = SessionId::new();
        let now = Utc::now();

        let old_ckpt = checkpoint_at(&old_session, 1, now - Duration::hours(72));
        store
            .save_checkpoint(&old_ckpt, &CheckpointMetadata::default())
            .await
            .unwrap();

        let mut old_snap = snapshot(&live_session);
        old_snap.created_at = now - Duration::hours(72);
        store.save_snapshot(&old_snap).await.unwrap();
        let live_ckpt = checkpoint_at(&live_session, 2, now);
        store
            .save_checkpoint(&live_ckpt, &CheckpointMetadata::default())
            .await
            .unwrap();

        let removed = store
            .delete_older_than(now - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let ids = store.list_session_ids().await.unwrap();
        assert_eq!(ids, vec![live_session.clone()].into_iter().collect::<Vec<_>>());
        // The live session kept its fresh checkpoint but lost the old snapshot.
        assert!(store.load_snapshot(&live_session).await.is_err());
        assert!(store.load_latest_checkpoint(&live_session).await.is_ok());
    }

    #[tokio::test]
    async fn inactive_sessions_dry_run_then_delete() {
        let (_dir, store) = open_store();
        let session = SessionId::new();
        let mut stale = snapshot(&session);
        stale.created_at = Utc::now() - Duration::hours(48);
        store.save_snapshot(&stale).await.unwrap();

        let counted = store
            .delete_inactive_sessions(Duration::hours(24), true)
            .await
            .unwrap();
        assert_eq!(counted, 1);
        assert_eq!(store.list_session_ids().await.unwrap().len(), 1);

        let deleted = store
            .delete_inactive_sessions(Duration::hours(24), false)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.list_session_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_ids_are_rejected() {
        let (_dir, store) = open_store();
        let blank = SessionId::from_raw("  ");
        assert!(matches!(
            store.load_snapshot(&blank).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store
                .load_pending_writes(&SessionId::new(), &CheckpointId::from_raw(""))
                .await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_checkpoint_id_is_rejected() {
        let (_dir, store) = open_store();
        let checkpoint = ExecutionCheckpoint::new(SessionId::new(), 1);
        let meta = CheckpointMetadata::default();
        store.save_checkpoint(&checkpoint, &meta).await.unwrap();
        assert!(matches!(
            store.save_checkpoint(&checkpoint, &meta).await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn tmp_siblings_are_unique_and_next_to_the_target() {
        let target = Path::new("/data/sessions/s/manifest.json");
        let a = tmp_sibling(target);
        let b = tmp_sibling(target);
        assert_ne!(a, b);
        assert_eq!(a.parent(), target.parent());
        assert!(a.to_str().unwrap().ends_with(".tmp"));
    }
}
