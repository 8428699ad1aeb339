//! Eight-step update-tree construction.
//!
//! Flat operations from one replica are folded onto a tree rooted at the
//! last-synced root, in a fixed order: directory moves, file moves,
//! directory deletes, file deletes, directory creates, file creates, file
//! edits, then completion against the last-synced store. The order is what
//! makes interleaved renames and deletes land on the right nodes; path
//! segments that are not known yet are materialized as tmp placeholders
//! and resolved against the store in the final step.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, trace, warn};

use drift_index::{normalize_name, ItemType, NodeId, ReplicaSide};

use crate::db::SyncDb;
use crate::errors::{ReconError, Result};
use crate::fs_op::{FsOperation, FsOperationSet, OpType};
use crate::node::{Node, NodeKey};
use crate::session::AbortHandle;
use crate::tree::{generate_tmp_id, UpdateTree};

fn normalize_path(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(normalize_name(&s.to_string_lossy())),
            _ => None,
        })
        .collect()
}

fn leaf_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| ReconError::Data(format!("path {} has no file name", path.display())))
}

fn parent_path(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new(""))
}

/// Builds one replica's update tree from its flat operation set.
pub struct TreeBuilder<'a> {
    db: &'a dyn SyncDb,
    ops: &'a FsOperationSet,
    tree: &'a mut UpdateTree,
    abort: AbortHandle,
    /// Normalized create path -> (node id, item type); filled by step 4,
    /// consumed by the delete+create coalescing and step 6.
    create_map: BTreeMap<PathBuf, (NodeId, ItemType)>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        db: &'a dyn SyncDb,
        ops: &'a FsOperationSet,
        tree: &'a mut UpdateTree,
        abort: AbortHandle,
    ) -> Self {
        Self {
            db,
            ops,
            tree,
            abort,
            create_map: BTreeMap::new(),
        }
    }

    fn side(&self) -> ReplicaSide {
        self.tree.side()
    }

    /// The abort flag is honored between steps, never within one.
    fn checkpoint(&self) -> Result<()> {
        if self.abort.is_aborted() {
            warn!(side = %self.side(), "tree construction aborted between steps");
            return Err(ReconError::Aborted);
        }
        Ok(())
    }

    pub fn build(mut self) -> Result<()> {
        debug!(side = %self.side(), ops = self.ops.len(), "building update tree");
        self.checkpoint()?;
        self.step1_move_directories()?;
        self.checkpoint()?;
        self.step2_move_files()?;
        self.checkpoint()?;
        self.step3_delete_directories()?;
        self.checkpoint()?;
        self.step4_delete_files()?;
        self.checkpoint()?;
        self.step5_create_directories()?;
        self.checkpoint()?;
        self.step6_create_files()?;
        self.checkpoint()?;
        self.step7_edit_files()?;
        self.checkpoint()?;
        self.step8_complete_tree()?;
        self.tree.integrity_check()
    }

    fn step1_move_directories(&mut self) -> Result<()> {
        self.apply_move_ops(ItemType::Directory)
    }

    fn step2_move_files(&mut self) -> Result<()> {
        self.apply_move_ops(ItemType::File)
    }

    fn apply_move_ops(&mut self, item_type: ItemType) -> Result<()> {
        let ops: Vec<FsOperation> = self
            .ops
            .ops_of_type(OpType::Move)
            .filter(|op| op.item_type == item_type)
            .cloned()
            .collect();
        for op in ops {
            let destination = op.destination_path.clone().ok_or_else(|| {
                ReconError::Data(format!(
                    "move operation for {} has no destination",
                    op.node_id
                ))
            })?;
            match self.tree.key_of(&op.node_id) {
                Some(key) => self.relocate_existing_node(&op, key, &destination)?,
                None => self.create_moved_node(&op, &destination)?,
            }
        }
        Ok(())
    }

    /// The moved node is already in the tree (an earlier step placed it):
    /// record its origin and reattach it under the destination parent.
    fn relocate_existing_node(
        &mut self,
        op: &FsOperation,
        key: NodeKey,
        destination: &Path,
    ) -> Result<()> {
        // A placeholder chain may already occupy the destination.
        if let Some(existing) = self.tree.node_by_path(destination) {
            if existing != key && self.tree.node_ref(existing)?.is_tmp() {
                self.tree.merge_tmp_into_real(existing, key)?;
            }
        }
        let old_parent_db_id = match self.tree.node_ref(key)?.parent() {
            Some(parent) => self.tree.node_ref(parent)?.db_id(),
            None => None,
        };
        let parent = self.node_from_path(parent_path(destination), false)?;
        let name = leaf_name(destination)?;
        {
            let node = self.tree.node_ref_mut(key)?;
            node.insert_change_event(OpType::Move);
            node.created_at = op.created_at;
            node.modified_at = op.modified_at;
            node.size = op.size;
            node.move_origin = Some(op.path.clone());
            node.move_origin_parent_db_id = old_parent_db_id;
            node.is_tmp = false;
            node.set_name(name);
        }
        self.tree.set_parent(key, parent)?;
        trace!(side = %self.side(), id = %op.node_id, "relocated node to {}", destination.display());
        Ok(())
    }

    /// The moved node is not in the tree yet: create it from the operation
    /// and the last-synced store.
    fn create_moved_node(&mut self, op: &FsOperation, destination: &Path) -> Result<()> {
        let parent = self.node_from_path(parent_path(destination), false)?;
        let db_id = self.db.db_id(self.side(), &op.node_id)?.ok_or_else(|| {
            ReconError::Data(format!(
                "moved node {} is unknown to the sync database",
                op.node_id
            ))
        })?;
        let mut node = Node::new(
            Some(op.node_id.clone()),
            leaf_name(destination)?,
            op.item_type,
        );
        node.db_id = Some(db_id);
        node.insert_change_event(OpType::Move);
        node.created_at = op.created_at;
        node.modified_at = op.modified_at;
        node.size = op.size;
        node.move_origin = Some(op.path.clone());
        let tmp_at_destination = self
            .tree
            .node_by_path(destination)
            .filter(|&existing| {
                self.tree
                    .node(existing)
                    .is_some_and(|n| n.is_tmp())
            });
        let key = self.tree.attach(node, parent)?;
        if let Some(tmp) = tmp_at_destination {
            self.tree.merge_tmp_into_real(tmp, key)?;
        }
        Ok(())
    }

    fn step3_delete_directories(&mut self) -> Result<()> {
        let ops: Vec<FsOperation> = self
            .ops
            .ops_of_type(OpType::Delete)
            .filter(|op| op.item_type == ItemType::Directory)
            .cloned()
            .collect();
        for op in ops {
            if let Some(key) = self.tree.key_of(&op.node_id) {
                let node = self.tree.node_ref_mut(key)?;
                node.insert_change_event(OpType::Delete);
                node.created_at = op.created_at;
                node.modified_at = op.modified_at;
                node.size = op.size;
                node.is_tmp = false;
                continue;
            }
            // A parent moved in steps 1-2 relocates the deleted subtree.
            let (parent, name) = match self.search_parent_node(&op.path)? {
                Some(parent) => (parent, leaf_name(&op.path)?),
                None => {
                    let new_path = self.new_path_after_move(&op.path)?;
                    let parent = self.node_from_path(parent_path(&new_path), true)?;
                    (parent, leaf_name(&new_path)?)
                }
            };
            let db_id = self.db.db_id(self.side(), &op.node_id)?.ok_or_else(|| {
                ReconError::Data(format!(
                    "deleted directory {} is unknown to the sync database",
                    op.node_id
                ))
            })?;
            let key = match self.tmp_child_by_name(parent, &name)? {
                Some(child) => {
                    self.tree.update_node_id(child, op.node_id.clone())?;
                    child
                }
                None => self.tree.attach(
                    Node::new(Some(op.node_id.clone()), name, ItemType::Directory),
                    parent,
                )?,
            };
            let node = self.tree.node_ref_mut(key)?;
            node.db_id = Some(db_id);
            node.node_type = ItemType::Directory;
            node.insert_change_event(OpType::Delete);
            node.created_at = op.created_at;
            node.modified_at = op.modified_at;
            node.size = op.size;
            node.is_tmp = false;
        }
        Ok(())
    }

    fn step4_delete_files(&mut self) -> Result<()> {
        self.partition_create_ops()?;
        let ops: Vec<FsOperation> = self
            .ops
            .ops_of_type(OpType::Delete)
            .filter(|op| op.item_type == ItemType::File)
            .cloned()
            .collect();
        for delete_op in ops {
            // A delete followed by a create at the same path is one edit:
            // the local replica recycles ids on replace-by-rename, so the
            // pair describes a content change of the synced item.
            let mut folded_op = delete_op.clone();
            let mut op_type = OpType::Delete;
            if self.side() == ReplicaSide::Local {
                let normalized = normalize_path(&delete_op.path);
                let pending_create = self
                    .create_map
                    .get(&normalized)
                    .filter(|(_, item_type)| *item_type == ItemType::File)
                    .map(|(id, _)| id.clone());
                if let Some(create_id) = pending_create {
                    let create_op = self
                        .ops
                        .find_op(&create_id, OpType::Create)
                        .cloned()
                        .ok_or_else(|| {
                            ReconError::Data(format!(
                                "create operation for {create_id} vanished from the set"
                            ))
                        })?;
                    debug!(side = %self.side(), path = %delete_op.path.display(),
                        "coalescing delete+create at one path into an edit");
                    folded_op = create_op;
                    op_type = OpType::Edit;
                    self.create_map.remove(&normalized);
                }
            }

            if let Some(key) = self.tree.key_of(&delete_op.node_id) {
                self.fold_file_delete(key, &delete_op, &folded_op, op_type)?;
                continue;
            }
            let (parent, name) = match self.search_parent_node(&delete_op.path)? {
                Some(parent) => (parent, leaf_name(&delete_op.path)?),
                None => {
                    let new_path = self.new_path_after_move(&delete_op.path)?;
                    let parent = self.node_from_path(parent_path(&new_path), true)?;
                    (parent, leaf_name(&new_path)?)
                }
            };
            let db_id = self.db.db_id(self.side(), &delete_op.node_id)?.ok_or_else(|| {
                ReconError::Data(format!(
                    "deleted file {} is unknown to the sync database",
                    delete_op.node_id
                ))
            })?;
            let key = match self.tmp_child_by_name(parent, &name)? {
                Some(child) => child,
                None => self.tree.attach(
                    Node::new(Some(delete_op.node_id.clone()), name, ItemType::File),
                    parent,
                )?,
            };
            self.tree.node_ref_mut(key)?.db_id = Some(db_id);
            self.fold_file_delete(key, &delete_op, &folded_op, op_type)?;
        }
        Ok(())
    }

    fn fold_file_delete(
        &mut self,
        key: NodeKey,
        delete_op: &FsOperation,
        folded_op: &FsOperation,
        op_type: OpType,
    ) -> Result<()> {
        self.tree.update_node_id(key, folded_op.node_id.clone())?;
        if op_type == OpType::Edit {
            self.tree
                .record_previous_id(delete_op.node_id.clone(), folded_op.node_id.clone());
        }
        let node = self.tree.node_ref_mut(key)?;
        node.node_type = ItemType::File;
        node.insert_change_event(op_type);
        node.created_at = folded_op.created_at;
        node.modified_at = folded_op.modified_at;
        node.size = folded_op.size;
        node.is_tmp = false;
        if op_type == OpType::Edit {
            node.previous_id = Some(delete_op.node_id.clone());
        }
        Ok(())
    }

    /// Buckets create operations by normalized path. Two creates at one
    /// normalized path cannot both exist on a replica; the operation set is
    /// inconsistent and the pass must be rebuilt.
    fn partition_create_ops(&mut self) -> Result<()> {
        self.create_map.clear();
        for op in self.ops.ops_of_type(OpType::Create) {
            let normalized = normalize_path(&op.path);
            if let Some((existing, _)) = self
                .create_map
                .insert(normalized.clone(), (op.node_id.clone(), op.item_type))
            {
                return Err(ReconError::Data(format!(
                    "two creates at normalized path {} (ids {existing} and {})",
                    normalized.display(),
                    op.node_id
                )));
            }
        }
        Ok(())
    }

    fn step5_create_directories(&mut self) -> Result<()> {
        let ops: Vec<FsOperation> = self
            .ops
            .ops_of_type(OpType::Create)
            .filter(|op| op.item_type == ItemType::Directory)
            .cloned()
            .collect();
        for op in ops {
            let key = self.node_from_path(&op.path, false)?;
            // Delete already folded at this position: the directory was
            // removed and recreated under the same name.
            let previous = {
                let node = self.tree.node_ref(key)?;
                if node.has_change(OpType::Delete) && node.id() != Some(&op.node_id) {
                    node.id().cloned()
                } else {
                    None
                }
            };
            self.tree.update_node_id(key, op.node_id.clone())?;
            if let Some(previous) = &previous {
                self.tree
                    .record_previous_id(previous.clone(), op.node_id.clone());
            }
            let node = self.tree.node_ref_mut(key)?;
            node.previous_id = previous;
            node.node_type = ItemType::Directory;
            node.insert_change_event(OpType::Create);
            node.created_at = op.created_at;
            node.modified_at = op.modified_at;
            node.size = op.size;
            node.is_tmp = false;
        }
        Ok(())
    }

    fn step6_create_files(&mut self) -> Result<()> {
        let pending: Vec<NodeId> = self
            .create_map
            .values()
            .filter(|(_, item_type)| *item_type == ItemType::File)
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in pending {
            let op = self
                .ops
                .find_op(&node_id, OpType::Create)
                .cloned()
                .ok_or_else(|| {
                    ReconError::Data(format!(
                        "create operation for {node_id} vanished from the set"
                    ))
                })?;
            let parent = self.node_from_path(parent_path(&op.path), false)?;
            let key = match self.tree.node_ref(parent)?.child_by_id(&op.node_id) {
                Some(child) => child,
                None => self.tree.attach(
                    Node::new(Some(op.node_id.clone()), leaf_name(&op.path)?, ItemType::File),
                    parent,
                )?,
            };
            let node = self.tree.node_ref_mut(key)?;
            node.node_type = ItemType::File;
            node.insert_change_event(OpType::Create);
            node.created_at = op.created_at;
            node.modified_at = op.modified_at;
            node.size = op.size;
            node.is_tmp = false;
        }
        Ok(())
    }

    fn step7_edit_files(&mut self) -> Result<()> {
        let ops: Vec<FsOperation> = self
            .ops
            .ops_of_type(OpType::Edit)
            .filter(|op| op.item_type == ItemType::File)
            .cloned()
            .collect();
        for op in ops {
            if let Some(key) = self.tree.key_of(&op.node_id) {
                let node = self.tree.node_ref_mut(key)?;
                node.insert_change_event(OpType::Edit);
                node.created_at = op.created_at;
                node.modified_at = op.modified_at;
                node.size = op.size;
                node.is_tmp = false;
                continue;
            }
            let parent = self.node_from_path(parent_path(&op.path), false)?;
            let db_id = self.db.db_id(self.side(), &op.node_id)?.ok_or_else(|| {
                ReconError::Data(format!(
                    "edited file {} is unknown to the sync database",
                    op.node_id
                ))
            })?;
            let mut node = Node::new(Some(op.node_id.clone()), leaf_name(&op.path)?, ItemType::File);
            node.db_id = Some(db_id);
            node.insert_change_event(OpType::Edit);
            node.created_at = op.created_at;
            node.modified_at = op.modified_at;
            node.size = op.size;
            self.tree.attach(node, parent)?;
        }
        Ok(())
    }

    fn step8_complete_tree(&mut self) -> Result<()> {
        self.update_nodes_from_db()?;
        self.insert_missing_db_rows()
    }

    /// Breadth-first pass filling every non-created node from its
    /// last-synced row and resolving surviving placeholders.
    fn update_nodes_from_db(&mut self) -> Result<()> {
        let root = self.tree.root_key();
        let mut queue = VecDeque::from([root]);
        let mut visited: HashSet<NodeKey> = HashSet::new();
        while let Some(key) = queue.pop_front() {
            // A placeholder merge in an earlier iteration can remove a
            // queued key or route two queued keys to one node.
            if self.tree.node(key).is_none() || !visited.insert(key) {
                continue;
            }
            let key = if key == root {
                root
            } else {
                self.update_node_from_db(key)?
            };
            visited.insert(key);
            // Children read after the update: placeholder resolution may
            // have adopted nodes.
            if let Some(node) = self.tree.node(key) {
                queue.extend(node.children().values().copied());
            }
        }
        Ok(())
    }

    /// Returns the key the node survives under, which differs from `key`
    /// when a placeholder merged into an already-placed node.
    fn update_node_from_db(&mut self, key: NodeKey) -> Result<NodeKey> {
        let (created_only, is_tmp) = {
            let node = self.tree.node_ref(key)?;
            (
                node.has_change(OpType::Create) && !node.is_recreated(),
                node.is_tmp(),
            )
        };
        if created_only {
            return Ok(key);
        }
        let key = if is_tmp {
            self.resolve_tmp_node(key)?
        } else {
            key
        };
        let (usable_id, has_move) = {
            let node = self.tree.node_ref(key)?;
            let usable_id = if node.is_recreated() {
                node.previous_id().cloned()
            } else {
                node.id().cloned()
            }
            .ok_or_else(|| {
                ReconError::Data("tree node without a replica id after construction".to_string())
            })?;
            (usable_id, node.has_change(OpType::Move))
        };
        let db_node = self
            .db
            .node_by_replica_id(self.side(), &usable_id)?
            .ok_or_else(|| {
                ReconError::Data(format!(
                    "changed node {usable_id} is unknown to the sync database"
                ))
            })?;
        let origin = if has_move {
            self.db.path(self.side(), db_node.db_id)?
        } else {
            None
        };
        let side = self.side();
        let node = self.tree.node_ref_mut(key)?;
        if has_move {
            node.move_origin_parent_db_id = db_node.parent_db_id;
            if let Some(origin) = origin {
                node.move_origin = Some(origin);
            }
        }
        if node.db_id.is_none() {
            node.db_id = Some(db_node.db_id);
        }
        if node.created_at.is_none() {
            node.created_at = db_node.created_at;
        }
        if node.modified_at.is_none() {
            node.modified_at = db_node.modified(side);
        }
        if node.size == 0 {
            node.size = db_node.size;
        }
        Ok(key)
    }

    /// A placeholder that survived to step 8 stands for an unchanged item:
    /// find its pre-move path, look the item up in the store and turn the
    /// placeholder into the real node. When a move step already placed a
    /// node carrying that id (the placeholder marks its pre-move spot),
    /// the placeholder's children fold into that node instead and its key
    /// is returned.
    fn resolve_tmp_node(&mut self, key: NodeKey) -> Result<NodeKey> {
        let origin = self.origin_path(key)?;
        let id = self
            .db
            .id_by_path(self.side(), &origin)?
            .ok_or_else(|| {
                ReconError::Data(format!(
                    "placeholder at {} has no sync database row",
                    origin.display()
                ))
            })?;
        if let Some(placed) = self.tree.key_of(&id).filter(|&k| k != key) {
            self.tree.merge_tmp_into_real(key, placed)?;
            return Ok(placed);
        }
        let db_id = self.db.db_id(self.side(), &id)?.ok_or_else(|| {
            ReconError::Data(format!("no db id for replica id {id}"))
        })?;
        self.tree.update_node_id(key, id)?;
        let node = self.tree.node_ref_mut(key)?;
        node.db_id = Some(db_id);
        node.is_tmp = false;
        Ok(key)
    }

    /// Inserts rows of the last-synced store that no operation touched, so
    /// the completed tree covers the whole synced namespace. Rows are
    /// inserted parents-first (sorted by store path depth).
    fn insert_missing_db_rows(&mut self) -> Result<()> {
        let side = self.side();
        let mut missing: Vec<(usize, i64, NodeId)> = Vec::new();
        for id in self.db.ids(side)? {
            if self.tree.key_of(&id).is_some() {
                continue;
            }
            let db_node = self.db.node_by_replica_id(side, &id)?.ok_or_else(|| {
                ReconError::Data(format!("sync database lost row for {id} mid-pass"))
            })?;
            if db_node.parent_db_id.is_none() {
                continue;
            }
            let depth = self
                .db
                .path(side, db_node.db_id)?
                .map(|p| p.components().count())
                .unwrap_or(0);
            missing.push((depth, db_node.db_id, id));
        }
        missing.sort();
        for (_, db_id, id) in missing {
            let db_node = self.db.node(db_id)?.ok_or_else(|| {
                ReconError::Data(format!("sync database lost row {db_id} mid-pass"))
            })?;
            let Some(parent_db_id) = db_node.parent_db_id else {
                continue;
            };
            let parent_id = self.db.node_id(side, parent_db_id)?.ok_or_else(|| {
                ReconError::Data(format!(
                    "sync database row {parent_db_id} has no {side} replica id"
                ))
            })?;
            let parent = self.tree.key_of(&parent_id).ok_or_else(|| {
                ReconError::Data(format!(
                    "parent {parent_id} missing from the tree while restoring unchanged rows"
                ))
            })?;
            let mut node = Node::new(Some(id), db_node.name(side), db_node.item_type);
            node.db_id = Some(db_node.db_id);
            node.created_at = db_node.created_at;
            node.modified_at = db_node.modified(side);
            node.size = db_node.size;
            self.tree.attach(node, parent)?;
        }
        Ok(())
    }

    /// Pre-move path of a node: climb until a moved ancestor is found and
    /// splice its recorded origin (resolved through the store) in front of
    /// the accumulated names. Correct for both "child moved after parent"
    /// and "parent moved after child" orders.
    fn origin_path(&self, key: NodeKey) -> Result<PathBuf> {
        let root = self.tree.root_key();
        let mut names: Vec<String> = Vec::new();
        let mut current = key;
        let mut depth = 0usize;
        while current != root {
            let node = self.tree.node_ref(current)?;
            if node.has_change(OpType::Move) {
                let origin = node.move_origin().ok_or_else(|| {
                    ReconError::Data("moved node without a recorded origin".to_string())
                })?;
                let parent_db_id = node.move_origin_parent_db_id.ok_or_else(|| {
                    ReconError::Data("moved node without an origin parent db id".to_string())
                })?;
                names.push(leaf_name(origin)?);
                let mut path = self
                    .db
                    .path(self.side(), parent_db_id)?
                    .ok_or_else(|| {
                        ReconError::Data(format!(
                            "origin parent row {parent_db_id} has no store path"
                        ))
                    })?;
                for name in names.iter().rev() {
                    path.push(name);
                }
                return Ok(path);
            }
            names.push(node.name().to_string());
            current = node.parent().ok_or_else(|| {
                ReconError::Data("detached node while computing origin path".to_string())
            })?;
            depth += 1;
            if depth > 1000 {
                return Err(ReconError::Data(
                    "origin path ancestry does not terminate".to_string(),
                ));
            }
        }
        Ok(names.iter().rev().collect())
    }

    /// Where a path points after the moves recorded in this operation set:
    /// any ancestor segment that was itself moved is substituted by its
    /// destination.
    fn new_path_after_move(&self, path: &Path) -> Result<PathBuf> {
        let mut prefix = PathBuf::new();
        let mut result = PathBuf::new();
        for component in path.components() {
            let Component::Normal(segment) = component else {
                continue;
            };
            prefix.push(segment);
            let id = self
                .db
                .id_by_path(self.side(), &prefix)?
                .ok_or_else(|| {
                    ReconError::Data(format!(
                        "path {} is unknown to the sync database",
                        prefix.display()
                    ))
                })?;
            match self.ops.find_op(&id, OpType::Move) {
                Some(move_op) => {
                    result = move_op.destination_path.clone().ok_or_else(|| {
                        ReconError::Data(format!("move operation for {id} has no destination"))
                    })?;
                }
                None => result.push(segment),
            }
        }
        Ok(result)
    }

    /// Key of the tree node holding the db-known parent of a path, if the
    /// store and the tree both know it.
    fn search_parent_node(&self, path: &Path) -> Result<Option<NodeKey>> {
        let parent = parent_path(path);
        if parent.as_os_str().is_empty() {
            return Ok(Some(self.tree.root_key()));
        }
        let Some(id) = self.db.id_by_path(self.side(), parent)? else {
            return Ok(None);
        };
        Ok(self.tree.key_of(&id))
    }

    /// Walks a path from the root, materializing missing segments as tmp
    /// placeholder directories. On a live branch a delete-flagged match is
    /// only accepted for the final segment (delete-then-recreate); on a
    /// deleted branch every match counts.
    fn node_from_path(&mut self, path: &Path, deleted_branch: bool) -> Result<NodeKey> {
        let segments: Vec<String> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        let mut current = self.tree.root_key();
        let last = segments.len().saturating_sub(1);
        for (position, raw) in segments.iter().enumerate() {
            let normalized = normalize_name(raw);
            let children: Vec<NodeKey> = self
                .tree
                .node_ref(current)?
                .children()
                .values()
                .copied()
                .collect();
            let mut live = None;
            let mut deleted = None;
            for child in children {
                let node = self.tree.node_ref(child)?;
                if node.normalized_name() != normalized {
                    continue;
                }
                if node.has_change(OpType::Delete) && !node.has_change(OpType::Create) {
                    deleted.get_or_insert(child);
                } else {
                    live.get_or_insert(child);
                }
            }
            let accept_deleted = deleted_branch || position == last;
            current = match (live, deleted) {
                (Some(key), _) => key,
                (None, Some(key)) if accept_deleted => key,
                _ => {
                    let mut tmp = Node::new(Some(generate_tmp_id()), raw.clone(), ItemType::Directory);
                    tmp.is_tmp = true;
                    self.tree.attach(tmp, current)?
                }
            };
        }
        Ok(current)
    }

    fn tmp_child_by_name(&self, parent: NodeKey, name: &str) -> Result<Option<NodeKey>> {
        let normalized = normalize_name(name);
        let children: Vec<NodeKey> = self
            .tree
            .node_ref(parent)?
            .children()
            .values()
            .copied()
            .collect();
        for child in children {
            let node = self.tree.node_ref(child)?;
            if node.is_tmp() && node.normalized_name() == normalized {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_node;
    use crate::db::{DbNode, SqliteSyncDb};
    use crate::tree::UpdateTree;

    fn db_with(rows: &[DbNode]) -> SqliteSyncDb {
        let db = SqliteSyncDb::open_in_memory().unwrap();
        for row in rows {
            db.upsert_node(row).unwrap();
        }
        db
    }

    fn standard_db() -> SqliteSyncDb {
        db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(2, Some(1), "A", ItemType::Directory, "lA", "rA"),
            test_node(3, Some(1), "B", ItemType::Directory, "lB", "rB"),
            test_node(4, Some(2), "f.txt", ItemType::File, "lf", "rf"),
        ])
    }

    fn build(db: &SqliteSyncDb, ops: &FsOperationSet) -> Result<UpdateTree> {
        let mut tree = UpdateTree::new(ReplicaSide::Local, &db.root()?)?;
        TreeBuilder::new(db, ops, &mut tree, AbortHandle::new()).build()?;
        Ok(tree)
    }

    fn path_of_id(tree: &UpdateTree, id: &str) -> PathBuf {
        let key = tree.key_of(&id.into()).expect("node in tree");
        tree.path_of(key).unwrap()
    }

    #[test]
    fn no_ops_restores_all_db_rows() {
        let db = standard_db();
        let tree = build(&db, &FsOperationSet::new()).unwrap();
        assert_eq!(tree.len(), 4);
        assert_eq!(path_of_id(&tree, "lf"), PathBuf::from("A/f.txt"));
        for key in tree.keys() {
            assert!(!tree.node(key).unwrap().has_any_change());
        }
    }

    #[test]
    fn directory_move_records_origin_and_restores_children() {
        let db = standard_db();
        let mut ops = FsOperationSet::new();
        ops.insert(
            FsOperation::new(OpType::Move, "lA".into(), ItemType::Directory, "A")
                .with_destination("B/A"),
        );
        let tree = build(&db, &ops).unwrap();

        let a = tree.key_of(&"lA".into()).unwrap();
        let node = tree.node(a).unwrap();
        assert!(node.has_change(OpType::Move));
        assert_eq!(node.move_origin(), Some(Path::new("A")));
        assert_eq!(node.move_origin_parent_db_id(), Some(1));
        assert_eq!(tree.path_of(a).unwrap(), PathBuf::from("B/A"));
        // B existed only as a tmp placeholder until step 8
        let b = tree.key_of(&"lB".into()).unwrap();
        assert!(!tree.node(b).unwrap().is_tmp());
        assert_eq!(tree.node(b).unwrap().db_id(), Some(3));
        // the unchanged file follows its moved parent
        assert_eq!(path_of_id(&tree, "lf"), PathBuf::from("B/A/f.txt"));
    }

    #[test]
    fn delete_reattaches_under_moved_ancestor() {
        let db = db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(2, Some(1), "A", ItemType::Directory, "lA", "rA"),
            test_node(5, Some(2), "C", ItemType::Directory, "lC", "rC"),
            test_node(6, Some(5), "D", ItemType::Directory, "lD", "rD"),
        ]);
        let mut ops = FsOperationSet::new();
        ops.insert(
            FsOperation::new(OpType::Move, "lA".into(), ItemType::Directory, "A")
                .with_destination("A2"),
        );
        ops.insert(FsOperation::new(
            OpType::Delete,
            "lD".into(),
            ItemType::Directory,
            "A/C/D",
        ));
        let tree = build(&db, &ops).unwrap();
        let d = tree.key_of(&"lD".into()).unwrap();
        assert!(tree.node(d).unwrap().has_change(OpType::Delete));
        assert_eq!(tree.path_of(d).unwrap(), PathBuf::from("A2/C/D"));
        // the intermediate C started as a placeholder and was resolved
        let c = tree.key_of(&"lC".into()).unwrap();
        assert!(!tree.node(c).unwrap().is_tmp());
        assert_eq!(tree.node(c).unwrap().db_id(), Some(5));
    }

    #[test]
    fn interleaved_parent_and_child_moves_resolve_deterministically() {
        let db = db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(2, Some(1), "A", ItemType::Directory, "lA", "rA"),
            test_node(3, Some(1), "D", ItemType::Directory, "lD", "rD"),
            test_node(5, Some(2), "C", ItemType::Directory, "lC", "rC"),
            test_node(6, Some(1), "E", ItemType::Directory, "lE", "rE"),
        ]);
        let mut ops = FsOperationSet::new();
        ops.insert(
            FsOperation::new(OpType::Move, "lC".into(), ItemType::Directory, "A/C")
                .with_destination("D/C"),
        );
        ops.insert(
            FsOperation::new(OpType::Move, "lD".into(), ItemType::Directory, "D")
                .with_destination("E/D"),
        );
        // C lands under a placeholder for D's pre-move spot while D itself is
        // already placed at its destination; step 8 must fold the placeholder
        // into the placed node. Placeholder ids are random, so the step-8
        // visit order differs between runs.
        for _ in 0..20 {
            let tree = build(&db, &ops).unwrap();
            assert_eq!(tree.len(), 5);
            let d = tree.key_of(&"lD".into()).unwrap();
            assert!(tree.node(d).unwrap().has_change(OpType::Move));
            assert!(!tree.node(d).unwrap().is_tmp());
            assert_eq!(tree.path_of(d).unwrap(), PathBuf::from("E/D"));
            let c = tree.key_of(&"lC".into()).unwrap();
            assert!(tree.node(c).unwrap().has_change(OpType::Move));
            assert_eq!(tree.path_of(c).unwrap(), PathBuf::from("E/D/C"));
            for key in tree.keys() {
                assert!(!tree.node(key).unwrap().is_tmp());
            }
        }
    }

    #[test]
    fn delete_of_unchanged_branch_uses_placeholder_chain() {
        let db = db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(3, Some(1), "B", ItemType::Directory, "lB", "rB"),
            test_node(5, Some(3), "C", ItemType::Directory, "lC", "rC"),
        ]);
        let mut ops = FsOperationSet::new();
        ops.insert(FsOperation::new(
            OpType::Delete,
            "lC".into(),
            ItemType::Directory,
            "B/C",
        ));
        let tree = build(&db, &ops).unwrap();
        let c = tree.key_of(&"lC".into()).unwrap();
        assert!(tree.node(c).unwrap().has_change(OpType::Delete));
        assert_eq!(tree.path_of(c).unwrap(), PathBuf::from("B/C"));
        assert!(!tree.node(tree.key_of(&"lB".into()).unwrap()).unwrap().is_tmp());
    }

    #[test]
    fn delete_plus_create_at_same_path_becomes_edit() {
        let db = db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(4, Some(1), "f.txt", ItemType::File, "lf", "rf"),
        ]);
        let mut ops = FsOperationSet::new();
        ops.insert(FsOperation::new(
            OpType::Delete,
            "lf".into(),
            ItemType::File,
            "f.txt",
        ));
        ops.insert(FsOperation::new(
            OpType::Create,
            "lf2".into(),
            ItemType::File,
            "f.txt",
        ));
        let tree = build(&db, &ops).unwrap();

        let key = tree.key_of(&"lf2".into()).unwrap();
        let node = tree.node(key).unwrap();
        assert!(node.has_change(OpType::Edit));
        assert!(!node.has_change(OpType::Delete));
        assert!(!node.has_change(OpType::Create));
        assert_eq!(node.previous_id(), Some(&"lf".into()));
        assert_eq!(node.db_id(), Some(4));
        assert_eq!(tree.new_id_for(&"lf".into()), Some(&"lf2".into()));
        // the old id resolves to the same node
        assert_eq!(tree.key_of(&"lf".into()), Some(key));
        // only root + the coalesced node
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn duplicate_creates_at_one_normalized_path_fail() {
        let db = db_with(&[test_node(1, None, "", ItemType::Directory, "lroot", "rroot")]);
        let mut ops = FsOperationSet::new();
        ops.insert(FsOperation::new(
            OpType::Create,
            "x1".into(),
            ItemType::File,
            "caf\u{e9}.txt",
        ));
        ops.insert(FsOperation::new(
            OpType::Create,
            "x2".into(),
            ItemType::File,
            "cafe\u{301}.txt",
        ));
        let err = build(&db, &ops).unwrap_err();
        assert!(matches!(err, ReconError::Data(_)), "got {err:?}");
    }

    #[test]
    fn directory_delete_then_recreate_keeps_previous_id() {
        let db = db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(2, Some(1), "A", ItemType::Directory, "lA", "rA"),
        ]);
        let mut ops = FsOperationSet::new();
        ops.insert(FsOperation::new(
            OpType::Delete,
            "lA".into(),
            ItemType::Directory,
            "A",
        ));
        ops.insert(FsOperation::new(
            OpType::Create,
            "lA2".into(),
            ItemType::Directory,
            "A",
        ));
        let tree = build(&db, &ops).unwrap();
        let key = tree.key_of(&"lA2".into()).unwrap();
        let node = tree.node(key).unwrap();
        assert!(node.has_change(OpType::Delete));
        assert!(node.has_change(OpType::Create));
        assert_eq!(node.previous_id(), Some(&"lA".into()));
        assert_eq!(node.db_id(), Some(2));
        assert_eq!(tree.new_id_for(&"lA".into()), Some(&"lA2".into()));
    }

    #[test]
    fn plain_create_and_edit() {
        let db = standard_db();
        let mut ops = FsOperationSet::new();
        ops.insert(
            FsOperation::new(OpType::Create, "lnew".into(), ItemType::File, "B/new.txt")
                .with_size(12),
        );
        ops.insert(
            FsOperation::new(OpType::Edit, "lf".into(), ItemType::File, "A/f.txt").with_size(99),
        );
        let tree = build(&db, &ops).unwrap();
        let new = tree.key_of(&"lnew".into()).unwrap();
        assert!(tree.node(new).unwrap().has_change(OpType::Create));
        assert_eq!(tree.node(new).unwrap().size(), 12);
        assert_eq!(tree.path_of(new).unwrap(), PathBuf::from("B/new.txt"));
        let f = tree.key_of(&"lf".into()).unwrap();
        assert!(tree.node(f).unwrap().has_change(OpType::Edit));
        assert_eq!(tree.node(f).unwrap().size(), 99);
        assert_eq!(tree.node(f).unwrap().db_id(), Some(4));
    }

    #[test]
    fn edit_of_unknown_file_is_a_data_error() {
        let db = standard_db();
        let mut ops = FsOperationSet::new();
        ops.insert(FsOperation::new(
            OpType::Edit,
            "lghost".into(),
            ItemType::File,
            "ghost.txt",
        ));
        assert!(matches!(
            build(&db, &ops).unwrap_err(),
            ReconError::Data(_)
        ));
    }

    #[test]
    fn abort_flag_stops_construction() {
        let db = standard_db();
        let ops = FsOperationSet::new();
        let mut tree = UpdateTree::new(ReplicaSide::Local, &db.root().unwrap()).unwrap();
        let abort = AbortHandle::new();
        abort.request_abort();
        let err = TreeBuilder::new(&db, &ops, &mut tree, abort)
            .build()
            .unwrap_err();
        assert!(matches!(err, ReconError::Aborted));
    }

    #[test]
    fn construction_is_deterministic() {
        let db = standard_db();
        let mut ops = FsOperationSet::new();
        ops.insert(
            FsOperation::new(OpType::Move, "lA".into(), ItemType::Directory, "A")
                .with_destination("B/A"),
        );
        ops.insert(FsOperation::new(
            OpType::Create,
            "lnew".into(),
            ItemType::File,
            "B/new.txt",
        ));
        let shape = |tree: &UpdateTree| -> Vec<(String, PathBuf, String)> {
            let mut out: Vec<_> = tree
                .keys()
                .map(|key| {
                    let node = tree.node(key).unwrap();
                    (
                        node.id().unwrap().to_string(),
                        tree.path_of(key).unwrap(),
                        node.change_events().to_string(),
                    )
                })
                .collect();
            out.sort();
            out
        };
        let first = build(&db, &ops).unwrap();
        let second = build(&db, &ops).unwrap();
        assert_eq!(shape(&first), shape(&second));
    }
}
