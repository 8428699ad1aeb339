//! Conflict detection over the two completed update trees.

use std::collections::HashSet;

use tracing::info;

use drift_index::{NodeId, ReplicaSide, Snapshot};

use crate::conflict::{Conflict, ConflictKind, ConflictQueue};
use crate::correspond::{corresponding_node, db_path_of, is_pseudo_conflict};
use crate::db::SyncDb;
use crate::errors::Result;
use crate::fs_op::OpType;
use crate::node::NodeKey;
use crate::tree::UpdateTree;

/// Walks both trees and fills a [`ConflictQueue`] with every concurrent
/// change pair that cannot be applied as-is.
pub struct ConflictFinder<'a> {
    db: &'a dyn SyncDb,
    local: &'a UpdateTree,
    remote: &'a UpdateTree,
    local_snap: &'a Snapshot,
    remote_snap: &'a Snapshot,
    /// Pairs already reported; several detectors can reach the same pair.
    seen: HashSet<(ConflictKind, NodeId, NodeId)>,
}

impl<'a> ConflictFinder<'a> {
    pub fn new(
        db: &'a dyn SyncDb,
        local: &'a UpdateTree,
        remote: &'a UpdateTree,
        local_snap: &'a Snapshot,
        remote_snap: &'a Snapshot,
    ) -> Self {
        Self {
            db,
            local,
            remote,
            local_snap,
            remote_snap,
            seen: HashSet::new(),
        }
    }

    pub fn find_conflicts(&mut self) -> Result<ConflictQueue> {
        let mut queue = ConflictQueue::new();

        let local_keys: Vec<NodeKey> = self.local.keys().collect();
        for key in &local_keys {
            self.check_local_node(*key, &mut queue)?;
        }

        for key in self.deleted_directories(self.local) {
            self.check_parent_delete(ReplicaSide::Local, key, &mut queue)?;
        }
        for key in self.deleted_directories(self.remote) {
            self.check_parent_delete(ReplicaSide::Remote, key, &mut queue)?;
        }

        self.find_move_move_cycles(&mut queue)?;

        info!(conflicts = queue.len(), "conflict detection finished");
        Ok(queue)
    }

    fn deleted_directories(&self, tree: &UpdateTree) -> Vec<NodeKey> {
        tree.keys()
            .filter(|&key| {
                tree.node(key).is_some_and(|n| {
                    n.is_directory() && n.has_change(OpType::Delete)
                })
            })
            .collect()
    }

    fn moved_directories(&self, tree: &UpdateTree) -> Vec<NodeKey> {
        tree.keys()
            .filter(|&key| {
                tree.node(key)
                    .is_some_and(|n| n.is_directory() && n.has_change(OpType::Move))
            })
            .collect()
    }

    /// All pairwise detectors driven from the local node; every conflict
    /// involves one changed node per side, so the local walk reaches each
    /// pair.
    fn check_local_node(&mut self, key: NodeKey, queue: &mut ConflictQueue) -> Result<()> {
        let (has_create, has_edit, has_delete, has_move, is_file) = {
            let node = self.local.node_ref(key)?;
            if !node.has_any_change() {
                return Ok(());
            }
            (
                node.has_change(OpType::Create),
                node.has_change(OpType::Edit),
                node.has_change(OpType::Delete),
                node.has_change(OpType::Move),
                !node.is_directory(),
            )
        };
        let local_path = self.local.path_of(key)?;
        // Node occupying the same current path on the other side; distinct
        // from the db counterpart when both sides changed independently.
        let path_twin = self.remote.node_by_path(&local_path);
        let corr = corresponding_node(self.db, self.local, self.remote, key)?;

        if has_create {
            if let Some(twin) = path_twin {
                let twin_node = self.remote.node_ref(twin)?;
                if twin_node.has_change(OpType::Create)
                    && !self.pseudo(key, twin)?
                {
                    self.emit(queue, ConflictKind::CreateCreate, key, twin, local_path.clone())?;
                }
                if twin_node.has_change(OpType::Move) {
                    // ordering path is the created node's path
                    self.emit(queue, ConflictKind::MoveCreate, key, twin, local_path.clone())?;
                }
            }
        }

        if has_edit && is_file {
            if let Some(corr) = corr {
                let other = self.remote.node_ref(corr)?;
                if other.has_change(OpType::Delete) {
                    let deleted_path = self.remote.path_of(corr)?;
                    self.emit(queue, ConflictKind::EditDelete, key, corr, deleted_path)?;
                } else if other.has_change(OpType::Edit)
                    && !other.is_directory()
                    && !self.pseudo(key, corr)?
                {
                    self.emit(queue, ConflictKind::EditEdit, key, corr, local_path.clone())?;
                }
            }
        }

        if has_delete {
            if let Some(corr) = corr {
                let other = self.remote.node_ref(corr)?;
                if other.has_change(OpType::Edit) && is_file && !other.has_change(OpType::Delete) {
                    self.emit(queue, ConflictKind::EditDelete, key, corr, local_path.clone())?;
                }
                if other.has_change(OpType::Move) && !other.has_change(OpType::Delete) {
                    self.emit(queue, ConflictKind::MoveDelete, key, corr, local_path.clone())?;
                }
            }
        }

        if has_move {
            if let Some(corr) = corr {
                let other = self.remote.node_ref(corr)?;
                if other.has_change(OpType::Delete) {
                    let deleted_path = self.remote.path_of(corr)?;
                    self.emit(queue, ConflictKind::MoveDelete, key, corr, deleted_path)?;
                } else if other.has_change(OpType::Move) && !self.pseudo(key, corr)? {
                    // same row moved to two destinations
                    let origin = self
                        .local
                        .node_ref(key)?
                        .move_origin()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_else(|| local_path.clone());
                    self.emit(queue, ConflictKind::MoveMoveSource, key, corr, origin)?;
                }
            }
            if let Some(twin) = path_twin {
                let twin_node = self.remote.node_ref(twin)?;
                let local_db = self.local.node_ref(key)?.db_id();
                if twin_node.has_change(OpType::Move)
                    && local_db.is_some()
                    && twin_node.db_id().is_some()
                    && local_db != twin_node.db_id()
                {
                    self.emit(queue, ConflictKind::MoveMoveDest, key, twin, local_path.clone())?;
                }
                if twin_node.has_change(OpType::Create) {
                    let created_path = self.remote.path_of(twin)?;
                    self.emit(queue, ConflictKind::MoveCreate, key, twin, created_path)?;
                }
            }
        }

        Ok(())
    }

    /// A directory deleted on one side fans out one conflict per Move or
    /// Create descendant of its live counterpart: those changes have
    /// nowhere to land once the delete is applied.
    fn check_parent_delete(
        &mut self,
        deleted_side: ReplicaSide,
        deleted_key: NodeKey,
        queue: &mut ConflictQueue,
    ) -> Result<()> {
        let (tree, other) = match deleted_side {
            ReplicaSide::Local => (self.local, self.remote),
            ReplicaSide::Remote => (self.remote, self.local),
        };
        let Some(corr) = corresponding_node(self.db, tree, other, deleted_key)? else {
            return Ok(());
        };
        if other.node_ref(corr)?.has_change(OpType::Delete) {
            // deleted on both sides independently, nothing to rescue
            return Ok(());
        }
        let deleted_path = tree.path_of(deleted_key)?;
        let mut stack: Vec<NodeKey> = other.node_ref(corr)?.children().values().copied().collect();
        while let Some(descendant) = stack.pop() {
            let node = other.node_ref(descendant)?;
            stack.extend(node.children().values().copied());
            let has_move = node.has_change(OpType::Move);
            let has_create = node.has_change(OpType::Create);
            if has_move {
                self.emit_sided(
                    queue,
                    ConflictKind::MoveParentDelete,
                    deleted_side,
                    deleted_key,
                    descendant,
                    deleted_path.clone(),
                )?;
            }
            if has_create {
                self.emit_sided(
                    queue,
                    ConflictKind::CreateParentDelete,
                    deleted_side,
                    deleted_key,
                    descendant,
                    deleted_path.clone(),
                )?;
            }
        }
        Ok(())
    }

    /// Directories moved into each other across sides: applying either
    /// move first makes the other's destination a descendant of its own
    /// source.
    fn find_move_move_cycles(&mut self, queue: &mut ConflictQueue) -> Result<()> {
        let local_moved = self.moved_directories(self.local);
        let remote_moved = self.moved_directories(self.remote);
        for &l in &local_moved {
            for &r in &remote_moved {
                let l_db = self.local.node_ref(l)?.db_id();
                let r_db = self.remote.node_ref(r)?.db_id();
                let (Some(l_db), Some(r_db)) = (l_db, r_db) else {
                    continue;
                };
                if l_db == r_db {
                    continue;
                }
                let Some(l_db_path) = db_path_of(self.db, self.local, l)? else {
                    continue;
                };
                let Some(r_db_path) = db_path_of(self.db, self.remote, r)? else {
                    continue;
                };
                // a nested pair is an ordinary move of a subtree, not a cycle
                if l_db_path.starts_with(&r_db_path) || r_db_path.starts_with(&l_db_path) {
                    continue;
                }
                let Some(r_in_local) = corresponding_node(self.db, self.remote, self.local, r)?
                else {
                    continue;
                };
                let Some(l_in_remote) = corresponding_node(self.db, self.local, self.remote, l)?
                else {
                    continue;
                };
                if self.local.is_ancestor(l, r_in_local)
                    && self.remote.is_ancestor(r, l_in_remote)
                {
                    let path = self.local.path_of(l)?;
                    self.emit(queue, ConflictKind::MoveMoveCycle, l, r, path)?;
                }
            }
        }
        Ok(())
    }

    fn pseudo(&self, local_key: NodeKey, remote_key: NodeKey) -> Result<bool> {
        is_pseudo_conflict(
            self.local,
            local_key,
            self.local_snap,
            self.remote,
            remote_key,
            self.remote_snap,
        )
    }

    fn emit(
        &mut self,
        queue: &mut ConflictQueue,
        kind: ConflictKind,
        local_key: NodeKey,
        remote_key: NodeKey,
        ordering_path: std::path::PathBuf,
    ) -> Result<()> {
        let local_ref = self.local.make_ref(local_key)?;
        let remote_ref = self.remote.make_ref(remote_key)?;
        if !self
            .seen
            .insert((kind, local_ref.id.clone(), remote_ref.id.clone()))
        {
            return Ok(());
        }
        info!(?kind, local = %local_ref.id, remote = %remote_ref.id,
            path = %ordering_path.display(), "conflict detected");
        queue.push(Conflict::new(kind, local_ref, remote_ref, ordering_path));
        Ok(())
    }

    fn emit_sided(
        &mut self,
        queue: &mut ConflictQueue,
        kind: ConflictKind,
        first_side: ReplicaSide,
        first_key: NodeKey,
        second_key: NodeKey,
        ordering_path: std::path::PathBuf,
    ) -> Result<()> {
        match first_side {
            ReplicaSide::Local => self.emit(queue, kind, first_key, second_key, ordering_path),
            ReplicaSide::Remote => self.emit(queue, kind, second_key, first_key, ordering_path),
        }
    }
}
