//! Conflict records and the resolution queue.

use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::cmp::{Ordering, Reverse};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::node::NodeRef;

/// The ten conflict kinds, declared in priority order: resolution handles
/// structure-destroying kinds before content-level ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ConflictKind {
    /// A node was moved into a directory deleted on the other side.
    MoveParentDelete,
    /// A node was created inside a directory deleted on the other side.
    CreateParentDelete,
    /// Moved on one side, deleted on the other.
    MoveDelete,
    /// Edited on one side, deleted on the other.
    EditDelete,
    /// The same item moved to different destinations.
    MoveMoveSource,
    /// Different items moved to the same destination.
    MoveMoveDest,
    /// Directories moved into each other across sides.
    MoveMoveCycle,
    /// Items created at the same path on both sides.
    CreateCreate,
    /// The same file edited on both sides.
    EditEdit,
    /// A move destination collides with a create on the other side.
    MoveCreate,
}

/// One detected conflict. Carries node references only; the trees stay
/// with the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub local: NodeRef,
    pub remote: NodeRef,
    /// Path the queue orders on; which node it comes from depends on the
    /// kind (the deleted node for *Delete kinds, the move origin for
    /// move-source conflicts, the created node for move-create).
    ordering_path: PathBuf,
    depth: usize,
}

impl Conflict {
    pub fn new(kind: ConflictKind, local: NodeRef, remote: NodeRef, ordering_path: PathBuf) -> Self {
        let depth = ordering_path.components().count();
        Self {
            kind,
            local,
            remote,
            ordering_path,
            depth,
        }
    }

    pub fn ordering_path(&self) -> &std::path::Path {
        &self.ordering_path
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn node(&self, side: drift_index::ReplicaSide) -> &NodeRef {
        match side {
            drift_index::ReplicaSide::Local => &self.local,
            drift_index::ReplicaSide::Remote => &self.remote,
        }
    }

    fn ordering_key(&self) -> (ConflictKind, usize, &PathBuf) {
        (self.kind, self.depth, &self.ordering_path)
    }
}

impl PartialEq for Conflict {
    fn eq(&self, other: &Self) -> bool {
        self.ordering_key() == other.ordering_key()
    }
}

impl Eq for Conflict {}

impl Ord for Conflict {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering_key().cmp(&other.ordering_key())
    }
}

impl PartialOrd for Conflict {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of conflicts. Pop order is non-decreasing in kind rank;
/// within a kind, shallow paths come first so resolution proceeds
/// top-down.
#[derive(Debug, Default)]
pub struct ConflictQueue {
    heap: BinaryHeap<Reverse<Conflict>>,
    kinds: HashMap<ConflictKind, usize>,
}

impl ConflictQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, conflict: Conflict) {
        *self.kinds.entry(conflict.kind).or_insert(0) += 1;
        self.heap.push(Reverse(conflict));
    }

    pub fn pop(&mut self) -> Option<Conflict> {
        let Reverse(conflict) = self.heap.pop()?;
        if let Some(count) = self.kinds.get_mut(&conflict.kind) {
            *count -= 1;
            if *count == 0 {
                self.kinds.remove(&conflict.kind);
            }
        }
        Some(conflict)
    }

    pub fn peek(&self) -> Option<&Conflict> {
        self.heap.peek().map(|Reverse(c)| c)
    }

    pub fn has_kind(&self, kind: ConflictKind) -> bool {
        self.kinds.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.kinds.clear();
    }

    /// Drains the queue in pop order.
    pub fn into_sorted_vec(mut self) -> Vec<Conflict> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(conflict) = self.pop() {
            out.push(conflict);
        }
        out
    }
}
