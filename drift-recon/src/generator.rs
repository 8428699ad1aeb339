//! Sync-operation generation.
//!
//! Walks both completed update trees breadth-first and turns every change
//! that survived conflict resolution into an operation targeting the
//! other replica. Changes both replicas already made identically are
//! still recorded, flagged omitted, so the last-synced store learns the
//! new row state without touching either filesystem.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, trace};

use drift_index::{NodeId, ReplicaSide, Snapshot};

use crate::correspond::{corresponding_node, is_pseudo_conflict};
use crate::db::SyncDb;
use crate::errors::{ReconError, Result};
use crate::fs_op::OpType;
use crate::node::{NodeKey, NodeStatus};
use crate::operation::{SyncOperation, SyncOperationList};
use crate::tree::UpdateTree;

pub struct OperationGenerator<'a> {
    db: &'a dyn SyncDb,
    local: &'a mut UpdateTree,
    remote: &'a mut UpdateTree,
    local_snap: &'a Snapshot,
    remote_snap: &'a Snapshot,
    list: SyncOperationList,
    /// Ids whose delete has already been emitted; deletes nested under
    /// them fold into the ancestor's operation.
    deleted: HashSet<(ReplicaSide, NodeId)>,
    restart: bool,
}

impl<'a> OperationGenerator<'a> {
    pub fn new(
        db: &'a dyn SyncDb,
        local: &'a mut UpdateTree,
        remote: &'a mut UpdateTree,
        local_snap: &'a Snapshot,
        remote_snap: &'a Snapshot,
    ) -> Self {
        Self {
            db,
            local,
            remote,
            local_snap,
            remote_snap,
            list: SyncOperationList::new(),
            deleted: HashSet::new(),
            restart: false,
        }
    }

    /// Consumes the generator, returning the operation list and whether a
    /// further reconciliation pass is needed once these are applied.
    pub fn generate(mut self) -> Result<(SyncOperationList, bool)> {
        self.local.mark_all_unprocessed();
        self.remote.mark_all_unprocessed();

        let mut queue: VecDeque<(ReplicaSide, NodeKey)> = VecDeque::new();
        queue.push_back((ReplicaSide::Local, self.local.root_key()));
        queue.push_back((ReplicaSide::Remote, self.remote.root_key()));
        while let Some((side, key)) = queue.pop_front() {
            for child in self.tree(side).node_ref(key)?.children().values() {
                queue.push_back((side, *child));
            }
            self.process_node(side, key)?;
        }

        debug!(
            operations = self.list.len(),
            restart = self.restart,
            "operation generation finished"
        );
        Ok((self.list, self.restart))
    }

    fn tree(&self, side: ReplicaSide) -> &UpdateTree {
        match side {
            ReplicaSide::Local => self.local,
            ReplicaSide::Remote => self.remote,
        }
    }

    fn other(&self, side: ReplicaSide) -> &UpdateTree {
        self.tree(side.opposite())
    }

    fn tree_mut(&mut self, side: ReplicaSide) -> &mut UpdateTree {
        match side {
            ReplicaSide::Local => self.local,
            ReplicaSide::Remote => self.remote,
        }
    }

    fn other_mut(&mut self, side: ReplicaSide) -> &mut UpdateTree {
        self.tree_mut(side.opposite())
    }

    fn process_node(&mut self, side: ReplicaSide, key: NodeKey) -> Result<()> {
        let (is_root, status, events) = {
            let tree = self.tree(side);
            let node = tree.node_ref(key)?;
            (key == tree.root_key(), node.status(), node.change_events())
        };
        if is_root || status == NodeStatus::Processed || events.is_empty() {
            return Ok(());
        }

        let corr = {
            let (tree, other) = (self.tree(side), self.other(side));
            corresponding_node(self.db, tree, other, key)?
        };
        let create_only = events.contains(OpType::Create)
            && !events.contains(OpType::Delete)
            && !events.contains(OpType::Move)
            && !events.contains(OpType::Edit);
        let Some(corr_key) = corr else {
            if create_only {
                self.emit(side, key, None, OpType::Create, false, None)?;
                self.tree_mut(side).set_status(key, NodeStatus::Processed)?;
                return Ok(());
            }
            let path = self.tree(side).path_of(key)?;
            return Err(ReconError::Data(format!(
                "no counterpart for changed node {} on {}",
                path.display(),
                side
            )));
        };

        if events.contains(OpType::Create) {
            let omit = self.pseudo(side, key, corr_key)?;
            self.emit(side, key, Some(corr_key), OpType::Create, omit, None)?;
            if omit {
                self.other_mut(side).set_status(corr_key, NodeStatus::Processed)?;
            }
        }

        if events.contains(OpType::Delete) {
            if self.under_deleted_ancestor(side, key)? {
                trace!(side = %side, "delete folded into an ancestor's delete");
                self.tree_mut(side).mark_subtree_processed(key)?;
                self.other_mut(side).mark_subtree_processed(corr_key)?;
                return Ok(());
            }
            let omit = self.other(side).node_ref(corr_key)?.has_change(OpType::Delete);
            self.emit(side, key, Some(corr_key), OpType::Delete, omit, None)?;
            if omit {
                // both replicas dropped the row; the store changes enough
                // that the trees must be rebuilt before generating more
                self.restart = true;
            }
            self.tree_mut(side).mark_subtree_processed(key)?;
            self.other_mut(side).mark_subtree_processed(corr_key)?;
            if let Some(id) = self.tree(side).node_ref(key)?.id().cloned() {
                self.deleted.insert((side, id));
            }
            return Ok(());
        }

        if events.contains(OpType::Move) {
            let omit = self.pseudo(side, key, corr_key)?;
            let new_name = self.tree(side).node_ref(key)?.name().to_string();
            self.emit(side, key, Some(corr_key), OpType::Move, omit, Some(new_name))?;
            let next = if events.contains(OpType::Edit) {
                NodeStatus::PartiallyProcessed
            } else {
                NodeStatus::Processed
            };
            self.tree_mut(side).set_status(key, next)?;
            if omit {
                self.other_mut(side).set_status(corr_key, NodeStatus::Processed)?;
            }
        }

        if events.contains(OpType::Edit) {
            let omit = self.pseudo(side, key, corr_key)?;
            self.emit(side, key, Some(corr_key), OpType::Edit, omit, None)?;
            if omit {
                self.other_mut(side).set_status(corr_key, NodeStatus::Processed)?;
            }
        }

        self.tree_mut(side).set_status(key, NodeStatus::Processed)
    }

    fn pseudo(&self, side: ReplicaSide, key: NodeKey, corr: NodeKey) -> Result<bool> {
        match side {
            ReplicaSide::Local => is_pseudo_conflict(
                self.local,
                key,
                self.local_snap,
                self.remote,
                corr,
                self.remote_snap,
            ),
            ReplicaSide::Remote => is_pseudo_conflict(
                self.remote,
                key,
                self.remote_snap,
                self.local,
                corr,
                self.local_snap,
            ),
        }
    }

    fn under_deleted_ancestor(&self, side: ReplicaSide, key: NodeKey) -> Result<bool> {
        let tree = self.tree(side);
        let mut current = tree.node_ref(key)?.parent();
        let mut depth = 0usize;
        while let Some(parent) = current {
            let node = tree.node_ref(parent)?;
            if let Some(id) = node.id() {
                if self.deleted.contains(&(side, id.clone())) {
                    return Ok(true);
                }
            }
            current = node.parent();
            depth += 1;
            if depth > 1000 {
                return Err(ReconError::Data(
                    "ancestry walk does not terminate".to_string(),
                ));
            }
        }
        Ok(false)
    }

    fn emit(
        &mut self,
        side: ReplicaSide,
        key: NodeKey,
        corr: Option<NodeKey>,
        op_type: OpType,
        omit: bool,
        new_name: Option<String>,
    ) -> Result<u64> {
        let affected = self.tree(side).make_ref(key)?;
        let corresponding = match corr {
            Some(corr) => Some(self.other(side).make_ref(corr)?),
            None => None,
        };
        debug!(%op_type, side = %side, path = %affected.path.display(), omit,
            "operation generated");
        let mut op = SyncOperation::new(op_type, affected, side.opposite());
        op.corresponding = corresponding;
        op.new_name = new_name;
        op.omit = omit;
        Ok(self.list.push(op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use drift_index::ItemType;

    use crate::builder::TreeBuilder;
    use crate::db::tests::test_node;
    use crate::db::{DbNode, SqliteSyncDb};
    use crate::fs_op::{FsOperation, FsOperationSet};
    use crate::node::Node;
    use crate::session::AbortHandle;

    fn db_with(rows: &[DbNode]) -> SqliteSyncDb {
        let db = SqliteSyncDb::open_in_memory().unwrap();
        for row in rows {
            db.upsert_node(row).unwrap();
        }
        db
    }

    fn build_tree(db: &SqliteSyncDb, side: ReplicaSide, ops: &FsOperationSet) -> UpdateTree {
        let mut tree = UpdateTree::new(side, &db.root().unwrap()).unwrap();
        TreeBuilder::new(db, ops, &mut tree, AbortHandle::new())
            .build()
            .unwrap();
        tree
    }

    fn empty_snap(side: ReplicaSide, root: &str) -> Snapshot {
        Snapshot::new(side, root.into())
    }

    fn generate(
        db: &SqliteSyncDb,
        local: &mut UpdateTree,
        remote: &mut UpdateTree,
    ) -> (SyncOperationList, bool) {
        let lsnap = empty_snap(ReplicaSide::Local, "lroot");
        let rsnap = empty_snap(ReplicaSide::Remote, "rroot");
        OperationGenerator::new(db, local, remote, &lsnap, &rsnap)
            .generate()
            .unwrap()
    }

    #[test]
    fn one_sided_create_targets_the_other_replica() {
        let db = db_with(&[test_node(1, None, "", ItemType::Directory, "lroot", "rroot")]);
        let mut local_ops = FsOperationSet::new();
        local_ops.insert(FsOperation::new(
            OpType::Create,
            "lnew".into(),
            ItemType::File,
            "new.txt",
        ));
        let mut local = build_tree(&db, ReplicaSide::Local, &local_ops);
        let mut remote = build_tree(&db, ReplicaSide::Remote, &FsOperationSet::new());

        let (list, restart) = generate(&db, &mut local, &mut remote);
        assert!(!restart);
        assert_eq!(list.len(), 1);
        let op = list.iter().next().unwrap();
        assert_eq!(op.op_type, OpType::Create);
        assert_eq!(op.target_side, ReplicaSide::Remote);
        assert_eq!(op.affected.path, PathBuf::from("new.txt"));
        assert!(op.corresponding.is_none());
        assert!(!op.omit);
    }

    #[test]
    fn identical_directory_creates_collapse_to_one_omitted_op() {
        let db = db_with(&[test_node(1, None, "", ItemType::Directory, "lroot", "rroot")]);
        let mut local_ops = FsOperationSet::new();
        local_ops.insert(FsOperation::new(
            OpType::Create,
            "lA".into(),
            ItemType::Directory,
            "A",
        ));
        let mut remote_ops = FsOperationSet::new();
        remote_ops.insert(FsOperation::new(
            OpType::Create,
            "rA".into(),
            ItemType::Directory,
            "A",
        ));
        let mut local = build_tree(&db, ReplicaSide::Local, &local_ops);
        let mut remote = build_tree(&db, ReplicaSide::Remote, &remote_ops);

        let (list, restart) = generate(&db, &mut local, &mut remote);
        assert!(!restart);
        assert_eq!(list.len(), 1);
        let op = list.iter().next().unwrap();
        assert!(op.omit);
        assert_eq!(op.op_type, OpType::Create);
        assert_eq!(
            op.corresponding.as_ref().map(|c| c.id.clone()),
            Some("rA".into())
        );
    }

    #[test]
    fn nested_deletes_fold_into_the_topmost_one() {
        let db = db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(3, Some(1), "B", ItemType::Directory, "lB", "rB"),
            test_node(5, Some(3), "C", ItemType::Directory, "lC", "rC"),
        ]);
        let mut local_ops = FsOperationSet::new();
        local_ops.insert(FsOperation::new(
            OpType::Delete,
            "lB".into(),
            ItemType::Directory,
            "B",
        ));
        local_ops.insert(FsOperation::new(
            OpType::Delete,
            "lC".into(),
            ItemType::Directory,
            "B/C",
        ));
        let mut local = build_tree(&db, ReplicaSide::Local, &local_ops);
        let mut remote = build_tree(&db, ReplicaSide::Remote, &FsOperationSet::new());

        let (list, restart) = generate(&db, &mut local, &mut remote);
        assert!(!restart);
        assert_eq!(list.len(), 1);
        let op = list.iter().next().unwrap();
        assert_eq!(op.op_type, OpType::Delete);
        assert_eq!(op.affected.path, PathBuf::from("B"));
        assert!(!op.omit);
    }

    #[test]
    fn delete_on_both_sides_is_omitted_and_requests_restart() {
        let db = db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(4, Some(1), "f.txt", ItemType::File, "lf", "rf"),
        ]);
        let mut local_ops = FsOperationSet::new();
        local_ops.insert(FsOperation::new(
            OpType::Delete,
            "lf".into(),
            ItemType::File,
            "f.txt",
        ));
        let mut remote_ops = FsOperationSet::new();
        remote_ops.insert(FsOperation::new(
            OpType::Delete,
            "rf".into(),
            ItemType::File,
            "f.txt",
        ));
        let mut local = build_tree(&db, ReplicaSide::Local, &local_ops);
        let mut remote = build_tree(&db, ReplicaSide::Remote, &remote_ops);

        let (list, restart) = generate(&db, &mut local, &mut remote);
        assert!(restart);
        assert_eq!(list.len(), 1);
        assert!(list.iter().next().unwrap().omit);
    }

    #[test]
    fn move_with_edit_emits_move_first_then_edit() {
        let db = db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(3, Some(1), "B", ItemType::Directory, "lB", "rB"),
            test_node(4, Some(1), "f.txt", ItemType::File, "lf", "rf"),
        ]);
        let mut local_ops = FsOperationSet::new();
        local_ops.insert(
            FsOperation::new(OpType::Move, "lf".into(), ItemType::File, "f.txt")
                .with_destination("B/renamed.txt"),
        );
        local_ops.insert(FsOperation::new(
            OpType::Edit,
            "lf".into(),
            ItemType::File,
            "B/renamed.txt",
        ));
        let mut local = build_tree(&db, ReplicaSide::Local, &local_ops);
        let mut remote = build_tree(&db, ReplicaSide::Remote, &FsOperationSet::new());

        let (list, restart) = generate(&db, &mut local, &mut remote);
        assert!(!restart);
        let ops: Vec<&SyncOperation> = list.iter().collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].op_type, OpType::Move);
        assert_eq!(ops[0].new_name.as_deref(), Some("renamed.txt"));
        assert_eq!(ops[0].affected.path, PathBuf::from("B/renamed.txt"));
        // the counterpart still sits at the pre-move path
        assert_eq!(
            ops[0].corresponding.as_ref().map(|c| c.path.clone()),
            Some(PathBuf::from("f.txt"))
        );
        assert_eq!(ops[1].op_type, OpType::Edit);
        assert!(!ops[0].omit && !ops[1].omit);
    }

    #[test]
    fn identical_moves_emit_one_omitted_op() {
        let db = db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(2, Some(1), "A", ItemType::Directory, "lA", "rA"),
            test_node(4, Some(1), "f.txt", ItemType::File, "lf", "rf"),
        ]);
        let mut local_ops = FsOperationSet::new();
        local_ops.insert(
            FsOperation::new(OpType::Move, "lf".into(), ItemType::File, "f.txt")
                .with_destination("A/f.txt"),
        );
        let mut remote_ops = FsOperationSet::new();
        remote_ops.insert(
            FsOperation::new(OpType::Move, "rf".into(), ItemType::File, "f.txt")
                .with_destination("A/f.txt"),
        );
        let mut local = build_tree(&db, ReplicaSide::Local, &local_ops);
        let mut remote = build_tree(&db, ReplicaSide::Remote, &remote_ops);

        let (list, restart) = generate(&db, &mut local, &mut remote);
        assert!(!restart);
        assert_eq!(list.len(), 1);
        let op = list.iter().next().unwrap();
        assert_eq!(op.op_type, OpType::Move);
        assert!(op.omit);
    }

    #[test]
    fn changed_node_without_counterpart_is_a_data_error() {
        let db = db_with(&[test_node(1, None, "", ItemType::Directory, "lroot", "rroot")]);
        let mut local = build_tree(&db, ReplicaSide::Local, &FsOperationSet::new());
        let mut remote = build_tree(&db, ReplicaSide::Remote, &FsOperationSet::new());
        let mut ghost = Node::new(Some("ghost".into()), "ghost.txt", ItemType::File);
        ghost.insert_change_event(OpType::Edit);
        local.attach(ghost, local.root_key()).unwrap();

        let lsnap = empty_snap(ReplicaSide::Local, "lroot");
        let rsnap = empty_snap(ReplicaSide::Remote, "rroot");
        let err = OperationGenerator::new(&db, &mut local, &mut remote, &lsnap, &rsnap)
            .generate()
            .unwrap_err();
        assert!(matches!(err, ReconError::Data(_)), "got {err:?}");
    }

    #[test]
    fn unchanged_trees_generate_nothing() {
        let db = db_with(&[
            test_node(1, None, "", ItemType::Directory, "lroot", "rroot"),
            test_node(2, Some(1), "A", ItemType::Directory, "lA", "rA"),
            test_node(4, Some(2), "f.txt", ItemType::File, "lf", "rf"),
        ]);
        let mut local = build_tree(&db, ReplicaSide::Local, &FsOperationSet::new());
        let mut remote = build_tree(&db, ReplicaSide::Remote, &FsOperationSet::new());
        let (list, restart) = generate(&db, &mut local, &mut remote);
        assert!(list.is_empty());
        assert!(!restart);
    }
}
