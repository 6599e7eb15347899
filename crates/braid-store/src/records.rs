//! Persisted record bodies shared by both backends.
//!
//! Everything here is serialized as self-describing JSON with
//! `#[serde(default)]` on fields a later build may add, so a store written
//! by one build stays readable by the next.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use braid_core::ids::{BranchId, CheckpointId, PendingWriteId, SessionId, SnapshotId};
use braid_core::{Branch, Message};

/// Low-frequency persisted view of the full conversation state, written
/// after a turn commits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub snapshot_id: SnapshotId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    /// Position in the active branch when the snapshot was taken.
    #[serde(default)]
    pub message_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_branch_id: Option<BranchId>,
    #[serde(default)]
    pub branches: Vec<Branch>,
}

impl SessionSnapshot {
    pub fn new(
        session_id: SessionId,
        branches: Vec<Branch>,
        active_branch_id: Option<BranchId>,
        message_index: usize,
    ) -> Self {
        Self {
            snapshot_id: SnapshotId::new(),
            session_id,
            created_at: Utc::now(),
            message_index,
            active_branch_id,
            branches,
        }
    }
}

/// In-flight execution state persisted for crash recovery. Immutable once
/// written; a new checkpoint is always a new record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    pub checkpoint_id: CheckpointId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub iteration: u32,
    #[serde(default)]
    pub completed_functions: Vec<String>,
    #[serde(default)]
    pub terminated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    #[serde(default)]
    pub middleware_state: HashMap<String, serde_json::Value>,
}

impl ExecutionCheckpoint {
    pub fn new(session_id: SessionId, iteration: u32) -> Self {
        Self {
            checkpoint_id: CheckpointId::new(),
            session_id,
            created_at: Utc::now(),
            iteration,
            completed_functions: Vec::new(),
            terminated: false,
            termination_reason: None,
            middleware_state: HashMap::new(),
        }
    }
}

/// Where in the turn lifecycle a checkpoint was taken.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    TurnStart,
    #[default]
    Iteration,
    TurnEnd,
    Recovery,
}

impl std::fmt::Display for CheckpointSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TurnStart => write!(f, "turn_start"),
            Self::Iteration => write!(f, "iteration"),
            Self::TurnEnd => write!(f, "turn_end"),
            Self::Recovery => write!(f, "recovery"),
        }
    }
}

impl std::str::FromStr for CheckpointSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "turn_start" => Ok(Self::TurnStart),
            "iteration" => Ok(Self::Iteration),
            "turn_end" => Ok(Self::TurnEnd),
            "recovery" => Ok(Self::Recovery),
            other => Err(format!("unknown checkpoint source: {other}")),
        }
    }
}

/// Light indexing fields stored alongside a checkpoint id in the manifest.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    #[serde(default)]
    pub step: u32,
    #[serde(default)]
    pub source: CheckpointSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<CheckpointId>,
    #[serde(default)]
    pub message_index: usize,
}

/// Manifest entry for one snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub snapshot_id: SnapshotId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub message_index: usize,
}

/// Manifest entry for one checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub checkpoint_id: CheckpointId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub step: u32,
    #[serde(default)]
    pub source: CheckpointSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<CheckpointId>,
    #[serde(default)]
    pub message_index: usize,
}

impl CheckpointEntry {
    pub fn from_parts(checkpoint: &ExecutionCheckpoint, meta: &CheckpointMetadata) -> Self {
        Self {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            created_at: checkpoint.created_at,
            step: meta.step,
            source: meta.source.clone(),
            parent_checkpoint_id: meta.parent_checkpoint_id.clone(),
            message_index: meta.message_index,
        }
    }
}

/// Delta messages of the turn currently in flight. One overwritable slot per
/// session; last write wins, cleared when the turn commits into a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UncommittedTurn {
    pub session_id: SessionId,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub iteration: u32,
    #[serde(default)]
    pub completed_functions: Vec<String>,
    #[serde(default)]
    pub terminated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl UncommittedTurn {
    pub fn new(session_id: SessionId, iteration: u32) -> Self {
        Self {
            session_id,
            messages: Vec::new(),
            iteration,
            completed_functions: Vec::new(),
            terminated: false,
            termination_reason: None,
            started_at: Utc::now(),
        }
    }
}

/// A side-effecting operation recorded before external confirmation so it
/// can be found again after a crash. The store only guarantees durable,
/// ordered storage; replay idempotency belongs to the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingWrite {
    pub id: PendingWriteId,
    pub operation: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl PendingWrite {
    pub fn new(operation: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: PendingWriteId::new(),
            operation: operation.into(),
            payload,
            recorded_at: Utc::now(),
        }
    }
}
