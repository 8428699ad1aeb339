//! Reconciliation session: snapshot pair in, conflicts and operations out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use drift_index::{ReplicaSide, Snapshot};

use crate::builder::TreeBuilder;
use crate::conflict::ConflictQueue;
use crate::db::SyncDb;
use crate::errors::{ReconError, Result};
use crate::finder::ConflictFinder;
use crate::fs_op::FsOperationSet;
use crate::generator::OperationGenerator;
use crate::operation::SyncOperationList;
use crate::tree::UpdateTree;

/// Cooperative cancellation flag, shared between a running session and
/// whoever wants to stop it. Cloning hands out another handle to the same
/// flag.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_abort(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Result of one reconciliation pass.
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// Detected conflicts in resolution priority order.
    pub conflicts: ConflictQueue,
    pub operations: SyncOperationList,
    /// Applying the operations changes the store enough that another pass
    /// is needed before the replicas converge.
    pub restart_requested: bool,
}

/// Drives one replica pair through tree construction, conflict detection
/// and operation generation. The session owns both update trees and can
/// be re-run after each store update until no operations remain.
pub struct ReconciliationSession<'a> {
    db: &'a dyn SyncDb,
    local_snapshot: Arc<Snapshot>,
    remote_snapshot: Arc<Snapshot>,
    local_tree: UpdateTree,
    remote_tree: UpdateTree,
    abort: AbortHandle,
}

impl<'a> ReconciliationSession<'a> {
    pub fn new(
        db: &'a dyn SyncDb,
        local_snapshot: Arc<Snapshot>,
        remote_snapshot: Arc<Snapshot>,
    ) -> Result<Self> {
        let root = db.root()?;
        Ok(Self {
            db,
            local_snapshot,
            remote_snapshot,
            local_tree: UpdateTree::new(ReplicaSide::Local, &root)?,
            remote_tree: UpdateTree::new(ReplicaSide::Remote, &root)?,
            abort: AbortHandle::new(),
        })
    }

    /// Handle to cancel this session from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn local_tree(&self) -> &UpdateTree {
        &self.local_tree
    }

    pub fn remote_tree(&self) -> &UpdateTree {
        &self.remote_tree
    }

    fn checkpoint(&self) -> Result<()> {
        if self.abort.is_aborted() {
            warn!("reconciliation aborted");
            return Err(ReconError::Aborted);
        }
        Ok(())
    }

    /// One full pass over both replicas' pending operations.
    pub fn reconcile(
        &mut self,
        local_ops: &FsOperationSet,
        remote_ops: &FsOperationSet,
    ) -> Result<ReconcileOutcome> {
        info!(
            local_ops = local_ops.len(),
            remote_ops = remote_ops.len(),
            "reconciliation pass started"
        );
        self.checkpoint()?;
        self.local_tree.reset_working_state();
        self.remote_tree.reset_working_state();

        TreeBuilder::new(self.db, local_ops, &mut self.local_tree, self.abort.clone()).build()?;
        TreeBuilder::new(self.db, remote_ops, &mut self.remote_tree, self.abort.clone()).build()?;
        self.checkpoint()?;

        let conflicts = ConflictFinder::new(
            self.db,
            &self.local_tree,
            &self.remote_tree,
            &self.local_snapshot,
            &self.remote_snapshot,
        )
        .find_conflicts()?;
        self.checkpoint()?;

        let (operations, restart_requested) = OperationGenerator::new(
            self.db,
            &mut self.local_tree,
            &mut self.remote_tree,
            &self.local_snapshot,
            &self.remote_snapshot,
        )
        .generate()?;

        debug!(
            conflicts = conflicts.len(),
            operations = operations.len(),
            restart_requested,
            "reconciliation pass finished"
        );
        Ok(ReconcileOutcome {
            conflicts,
            operations,
            restart_requested,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_index::ItemType;

    use crate::db::tests::test_node;
    use crate::db::SqliteSyncDb;
    use crate::fs_op::{FsOperation, OpType};

    fn session_db() -> SqliteSyncDb {
        let db = SqliteSyncDb::open_in_memory().unwrap();
        db.upsert_node(&test_node(
            1,
            None,
            "",
            ItemType::Directory,
            "lroot",
            "rroot",
        ))
        .unwrap();
        db
    }

    fn snapshots() -> (Arc<Snapshot>, Arc<Snapshot>) {
        let local = Snapshot::new(ReplicaSide::Local, "lroot".into());
        let remote = Snapshot::new(ReplicaSide::Remote, "rroot".into());
        (Arc::new(local), Arc::new(remote))
    }

    #[test]
    fn abort_handle_is_shared() {
        let handle = AbortHandle::new();
        let other = handle.clone();
        assert!(!other.is_aborted());
        handle.request_abort();
        assert!(other.is_aborted());
    }

    #[test]
    fn aborted_session_refuses_to_run() {
        let db = session_db();
        let (local_snap, remote_snap) = snapshots();
        let mut session = ReconciliationSession::new(&db, local_snap, remote_snap).unwrap();
        session.abort_handle().request_abort();
        let err = session
            .reconcile(&FsOperationSet::new(), &FsOperationSet::new())
            .unwrap_err();
        assert!(matches!(err, ReconError::Aborted));
    }

    #[test]
    fn session_can_run_repeated_passes() {
        let db = session_db();
        let (local_snap, remote_snap) = snapshots();
        let mut session = ReconciliationSession::new(&db, local_snap, remote_snap).unwrap();

        let mut local_ops = FsOperationSet::new();
        local_ops.insert(FsOperation::new(
            OpType::Create,
            "lnew".into(),
            ItemType::File,
            "new.txt",
        ));
        let outcome = session
            .reconcile(&local_ops, &FsOperationSet::new())
            .unwrap();
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.operations.len(), 1);
        assert!(!outcome.restart_requested);

        // the same pass again must not accumulate state
        let outcome = session
            .reconcile(&local_ops, &FsOperationSet::new())
            .unwrap();
        assert_eq!(outcome.operations.len(), 1);
    }
}
