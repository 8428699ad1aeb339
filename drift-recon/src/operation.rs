//! Synchronization operations emitted by the generator.

use serde::{Deserialize, Serialize};

use drift_index::ReplicaSide;

use crate::fs_op::OpType;
use crate::node::NodeRef;

/// One propagation step: apply `op_type` for `affected` on `target_side`.
///
/// An omitted operation records a change both replicas already agree on;
/// the executor skips it but the store still learns the new row state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: u64,
    pub op_type: OpType,
    /// The changed node, on the side the change was observed.
    pub affected: NodeRef,
    /// Counterpart on the target side, when the store knows one.
    pub corresponding: Option<NodeRef>,
    pub target_side: ReplicaSide,
    /// Name to apply at the destination, set for moves and renames.
    pub new_name: Option<String>,
    pub omit: bool,
}

impl SyncOperation {
    pub fn new(op_type: OpType, affected: NodeRef, target_side: ReplicaSide) -> Self {
        Self {
            id: 0,
            op_type,
            affected,
            corresponding: None,
            target_side,
            new_name: None,
            omit: false,
        }
    }

    pub fn with_corresponding(mut self, corresponding: NodeRef) -> Self {
        self.corresponding = Some(corresponding);
        self
    }

    pub fn with_new_name(mut self, name: impl Into<String>) -> Self {
        self.new_name = Some(name.into());
        self
    }

    pub fn omitted(mut self) -> Self {
        self.omit = true;
        self
    }
}

/// Ordered list of generated operations. Ids are assigned on insertion
/// and are unique within one generation pass.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SyncOperationList {
    ops: Vec<SyncOperation>,
    next_id: u64,
}

impl SyncOperationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut op: SyncOperation) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        op.id = id;
        self.ops.push(op);
        id
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncOperation> {
        self.ops.iter()
    }

    pub fn ops_of_type(&self, op_type: OpType) -> impl Iterator<Item = &SyncOperation> {
        self.ops.iter().filter(move |op| op.op_type == op_type)
    }

    pub fn omitted(&self) -> impl Iterator<Item = &SyncOperation> {
        self.ops.iter().filter(|op| op.omit)
    }

    pub fn find_op(&self, id: u64) -> Option<&SyncOperation> {
        self.ops.iter().find(|op| op.id == id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.next_id = 0;
    }
}
