//! Branching conversation tree.
//!
//! A session's conversation is a set of branches held in an arena keyed by
//! [`BranchId`]. Relationships (parent, siblings, children) are stored as id
//! references, so forking and removal are plain map updates. Sibling
//! bookkeeping is denormalized onto every branch for O(1) navigation and
//! re-derived by renumbering whenever a fork group changes.
//!
//! A branch forked at several different message indexes heads one sibling
//! group per index, but carries only one set of denormalized sibling fields:
//! they describe whichever of its groups was renumbered most recently. The
//! per-branch invariants hold for every member regardless; callers that need
//! a specific group's ordering should read it off the forks, whose fields
//! are always scoped to their own `(forked_from, forked_at_message_index)`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BranchId, MessageId, SessionId};
use crate::messages::{Message, MessageDraft};

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("branch not found: {0}")]
    NotFound(BranchId),

    #[error("branch {id} has {children} child branches; remove or re-parent them first")]
    HasChildren { id: BranchId, children: usize },

    #[error("fork index {index} out of range for branch {id} with {len} messages")]
    ForkIndexOutOfRange {
        id: BranchId,
        index: usize,
        len: usize,
    },
}

/// One conversation path within a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub session_id: SessionId,

    /// Append-only within a branch.
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Parent branch id; `None` for an original (root) branch.
    pub forked_from: Option<BranchId>,
    /// Message index in the parent this branch diverged at; `None` for roots.
    pub forked_at_message_index: Option<usize>,

    // Denormalized sibling navigation.
    pub sibling_index: usize,
    pub total_siblings: usize,
    pub previous_sibling_id: Option<BranchId>,
    pub next_sibling_id: Option<BranchId>,
    #[serde(default)]
    pub child_branch_ids: Vec<BranchId>,
    pub is_original: bool,
    /// Id of the sibling group's original member; `None` when this branch is it.
    pub original_branch_id: Option<BranchId>,

    /// Branch-scoped opaque state, keyed by middleware/state key. Copied
    /// (not shared) into forks so divergent branches evolve independently.
    #[serde(default)]
    pub state: HashMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// A single invariant violation reported by [`BranchTree::validate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// `is_original` disagrees with `forked_from`.
    OriginalFlagMismatch,
    /// `total_siblings` is zero.
    EmptySiblingGroup,
    /// `sibling_index` is not below `total_siblings`.
    SiblingIndexOutOfRange,
    /// Sibling 0 has a previous-sibling pointer.
    FirstSiblingHasPrevious,
    /// The last sibling has a next-sibling pointer.
    LastSiblingHasNext,
    /// A middle sibling is missing a neighbor pointer.
    MiddleSiblingMissingNeighbor,
    /// An original branch carries an `original_branch_id`.
    OriginalHasOriginalRef,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OriginalFlagMismatch => "is_original disagrees with forked_from",
            Self::EmptySiblingGroup => "total_siblings is zero",
            Self::SiblingIndexOutOfRange => "sibling_index >= total_siblings",
            Self::FirstSiblingHasPrevious => "first sibling has a previous pointer",
            Self::LastSiblingHasNext => "last sibling has a next pointer",
            Self::MiddleSiblingMissingNeighbor => "middle sibling missing a neighbor pointer",
            Self::OriginalHasOriginalRef => "original branch carries original_branch_id",
        };
        f.write_str(s)
    }
}

/// Arena of branches for one session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchTree {
    session_id: SessionId,
    branches: HashMap<BranchId, Branch>,
}

impl BranchTree {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            branches: HashMap::new(),
        }
    }

    /// Rebuild a tree from persisted branches (e.g. a loaded snapshot).
    pub fn from_branches(session_id: SessionId, branches: Vec<Branch>) -> Self {
        Self {
            session_id,
            branches: branches.into_iter().map(|b| (b.id.clone(), b)).collect(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn branch(&self, id: &BranchId) -> Option<&Branch> {
        self.branches.get(id)
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    /// Branches in a stable order (by creation time, then id) for persistence.
    pub fn branches_sorted(&self) -> Vec<Branch> {
        let mut all: Vec<Branch> = self.branches.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Create an original branch for this session.
    pub fn new_root(&mut self) -> BranchId {
        let now = Utc::now();
        let id = BranchId::new();
        let branch = Branch {
            id: id.clone(),
            session_id: self.session_id.clone(),
            messages: Vec::new(),
            forked_from: None,
            forked_at_message_index: None,
            sibling_index: 0,
            total_siblings: 1,
            previous_sibling_id: None,
            next_sibling_id: None,
            child_branch_ids: Vec::new(),
            is_original: true,
            original_branch_id: None,
            state: HashMap::new(),
            created_at: now,
            last_activity: now,
        };
        self.branches.insert(id.clone(), branch);
        debug_assert!(self.validate_all().is_empty());
        id
    }

    /// Fork `parent_id` at `at_index`: the new branch carries the parent's
    /// messages `[..at_index]` and a copy of its branch-scoped state, and
    /// joins the `(parent, at_index)` sibling group. The parent is always
    /// sibling 0 of that group.
    pub fn fork(&mut self, parent_id: &BranchId, at_index: usize) -> Result<BranchId, TreeError> {
        let parent = self
            .branches
            .get(parent_id)
            .ok_or_else(|| TreeError::NotFound(parent_id.clone()))?;
        if at_index > parent.messages.len() {
            return Err(TreeError::ForkIndexOutOfRange {
                id: parent_id.clone(),
                index: at_index,
                len: parent.messages.len(),
            });
        }

        let now = Utc::now();
        let id = BranchId::new();
        let branch = Branch {
            id: id.clone(),
            session_id: self.session_id.clone(),
            messages: parent.messages[..at_index].to_vec(),
            forked_from: Some(parent_id.clone()),
            forked_at_message_index: Some(at_index),
            sibling_index: 0,
            total_siblings: 1,
            previous_sibling_id: None,
            next_sibling_id: None,
            child_branch_ids: Vec::new(),
            is_original: false,
            original_branch_id: Some(parent_id.clone()),
            state: parent.state.clone(),
            created_at: now,
            last_activity: now,
        };
        self.branches.insert(id.clone(), branch);
        if let Some(parent) = self.branches.get_mut(parent_id) {
            parent.child_branch_ids.push(id.clone());
            parent.last_activity = now;
        }
        self.renumber_group(parent_id, at_index);
        debug_assert!(self.validate_all().is_empty());
        Ok(id)
    }

    /// Remove a branch. Never cascades: a branch with children is rejected.
    pub fn remove(&mut self, branch_id: &BranchId) -> Result<(), TreeError> {
        let branch = self
            .branches
            .get(branch_id)
            .ok_or_else(|| TreeError::NotFound(branch_id.clone()))?;
        if !branch.child_branch_ids.is_empty() {
            return Err(TreeError::HasChildren {
                id: branch_id.clone(),
                children: branch.child_branch_ids.len(),
            });
        }
        let forked_from = branch.forked_from.clone();
        let forked_at = branch.forked_at_message_index;
        self.branches.remove(branch_id);

        if let Some(parent_id) = forked_from {
            if let Some(parent) = self.branches.get_mut(&parent_id) {
                parent.child_branch_ids.retain(|c| c != branch_id);
            }
            if let Some(at_index) = forked_at {
                if self.branches.contains_key(&parent_id) {
                    self.renumber_group(&parent_id, at_index);
                }
            }
        }
        debug_assert!(self.validate_all().is_empty());
        Ok(())
    }

    /// Append a message, assigning id and creation time if the draft lacks them.
    pub fn append_message(
        &mut self,
        branch_id: &BranchId,
        draft: MessageDraft,
    ) -> Result<MessageId, TreeError> {
        let branch = self
            .branches
            .get_mut(branch_id)
            .ok_or_else(|| TreeError::NotFound(branch_id.clone()))?;
        let now = Utc::now();
        let message = draft.finalize(now);
        let id = message.id.clone();
        branch.messages.push(message);
        branch.last_activity = now;
        Ok(id)
    }

    /// Write a branch-scoped state value.
    pub fn set_state(
        &mut self,
        branch_id: &BranchId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), TreeError> {
        let branch = self
            .branches
            .get_mut(branch_id)
            .ok_or_else(|| TreeError::NotFound(branch_id.clone()))?;
        branch.state.insert(key.into(), value);
        branch.last_activity = Utc::now();
        Ok(())
    }

    /// Check the branch-local invariants. Empty result means the branch is sound.
    pub fn validate(branch: &Branch) -> Vec<Violation> {
        let mut violations = Vec::new();

        if branch.is_original != branch.forked_from.is_none() {
            violations.push(Violation::OriginalFlagMismatch);
        }
        if branch.total_siblings == 0 {
            violations.push(Violation::EmptySiblingGroup);
        }
        if branch.sibling_index >= branch.total_siblings.max(1) {
            violations.push(Violation::SiblingIndexOutOfRange);
        }
        if branch.sibling_index == 0 && branch.previous_sibling_id.is_some() {
            violations.push(Violation::FirstSiblingHasPrevious);
        }
        if branch.sibling_index + 1 == branch.total_siblings && branch.next_sibling_id.is_some() {
            violations.push(Violation::LastSiblingHasNext);
        }
        if branch.sibling_index > 0
            && branch.sibling_index + 1 < branch.total_siblings
            && (branch.previous_sibling_id.is_none() || branch.next_sibling_id.is_none())
        {
            violations.push(Violation::MiddleSiblingMissingNeighbor);
        }
        if branch.is_original && branch.original_branch_id.is_some() {
            violations.push(Violation::OriginalHasOriginalRef);
        }

        violations
    }

    /// Validate every branch in the arena.
    pub fn validate_all(&self) -> Vec<(BranchId, Violation)> {
        let mut all = Vec::new();
        for branch in self.branches.values() {
            for violation in Self::validate(branch) {
                all.push((branch.id.clone(), violation));
            }
        }
        all
    }

    /// Recompute sibling bookkeeping for the `(parent, at_index)` fork group.
    /// The parent is sibling 0; forks follow in chronological order with ids
    /// as the deterministic tie-break.
    fn renumber_group(&mut self, parent_id: &BranchId, at_index: usize) {
        let mut forks: Vec<(DateTime<Utc>, BranchId)> = self
            .branches
            .values()
            .filter(|b| {
                b.forked_from.as_ref() == Some(parent_id)
                    && b.forked_at_message_index == Some(at_index)
            })
            .map(|b| (b.created_at, b.id.clone()))
            .collect();
        forks.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.as_str().cmp(b.1.as_str())));

        let mut members = Vec::with_capacity(forks.len() + 1);
        members.push(parent_id.clone());
        members.extend(forks.into_iter().map(|(_, id)| id));

        let total = members.len();
        for (i, member_id) in members.iter().enumerate() {
            let previous = if i == 0 {
                None
            } else {
                Some(members[i - 1].clone())
            };
            let next = members.get(i + 1).cloned();
            if let Some(branch) = self.branches.get_mut(member_id) {
                branch.sibling_index = i;
                branch.total_siblings = total;
                branch.previous_sibling_id = previous;
                branch.next_sibling_id = next;
            }
        }
    }
}
