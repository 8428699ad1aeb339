//! Flat filesystem operations reported by the replica observers.
//!
//! The observers diff consecutive snapshot states into flat per-item
//! operations; reconciliation consumes them as an insertion-ordered set
//! with by-type and by-(id, type) lookups.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drift_index::{ItemType, NodeId};

/// The four change kinds, shared by flat operations, node change-event
/// bitsets and generated sync operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    Create,
    Edit,
    Delete,
    Move,
}

impl OpType {
    fn bit(self) -> u8 {
        match self {
            OpType::Create => 0b0001,
            OpType::Edit => 0b0010,
            OpType::Delete => 0b0100,
            OpType::Move => 0b1000,
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpType::Create => f.write_str("create"),
            OpType::Edit => f.write_str("edit"),
            OpType::Delete => f.write_str("delete"),
            OpType::Move => f.write_str("move"),
        }
    }
}

/// Set of change kinds accumulated on one update-tree node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvents(u8);

impl ChangeEvents {
    pub fn insert(&mut self, op: OpType) {
        self.0 |= op.bit();
    }

    pub fn remove(&mut self, op: OpType) {
        self.0 &= !op.bit();
    }

    pub fn contains(&self, op: OpType) -> bool {
        self.0 & op.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn merge(&mut self, other: ChangeEvents) {
        self.0 |= other.0;
    }
}

impl std::fmt::Display for ChangeEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for op in [OpType::Create, OpType::Edit, OpType::Delete, OpType::Move] {
            if self.contains(op) {
                if !first {
                    f.write_str("|")?;
                }
                write!(f, "{}", op)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One flat operation against a replica, as observed between two snapshot
/// states. `path` is the pre-change path; `destination_path` is set for
/// moves only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsOperation {
    pub id: u64,
    pub op_type: OpType,
    pub node_id: NodeId,
    pub item_type: ItemType,
    pub path: PathBuf,
    pub destination_path: Option<PathBuf>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub size: i64,
}

impl FsOperation {
    pub fn new(
        op_type: OpType,
        node_id: NodeId,
        item_type: ItemType,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: 0,
            op_type,
            node_id,
            item_type,
            path: path.into(),
            destination_path: None,
            created_at: None,
            modified_at: None,
            size: 0,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination_path = Some(destination.into());
        self
    }

    pub fn with_times(mut self, created_at: DateTime<Utc>, modified_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self.modified_at = Some(modified_at);
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }
}

/// Insertion-ordered store of flat operations for one replica.
#[derive(Debug, Default)]
pub struct FsOperationSet {
    ops: Vec<FsOperation>,
    by_type: HashMap<OpType, Vec<usize>>,
    by_node: HashMap<(NodeId, OpType), usize>,
    next_id: u64,
}

impl FsOperationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an operation, assigning it the next operation id.
    pub fn insert(&mut self, mut op: FsOperation) -> u64 {
        self.next_id += 1;
        op.id = self.next_id;
        let index = self.ops.len();
        self.by_type.entry(op.op_type).or_default().push(index);
        self.by_node
            .insert((op.node_id.clone(), op.op_type), index);
        let id = op.id;
        self.ops.push(op);
        id
    }

    /// Operations of one kind, in insertion order.
    pub fn ops_of_type(&self, op_type: OpType) -> impl Iterator<Item = &FsOperation> {
        self.by_type
            .get(&op_type)
            .into_iter()
            .flatten()
            .map(|&i| &self.ops[i])
    }

    pub fn find_op(&self, node_id: &NodeId, op_type: OpType) -> Option<&FsOperation> {
        self.by_node
            .get(&(node_id.clone(), op_type))
            .map(|&i| &self.ops[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &FsOperation> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.by_type.clear();
        self.by_node.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_events_bitset() {
        let mut events = ChangeEvents::default();
        assert!(events.is_empty());
        events.insert(OpType::Create);
        events.insert(OpType::Move);
        assert!(events.contains(OpType::Create));
        assert!(events.contains(OpType::Move));
        assert!(!events.contains(OpType::Delete));
        events.remove(OpType::Create);
        assert!(!events.contains(OpType::Create));
        assert_eq!(events.to_string(), "move");
        events.insert(OpType::Edit);
        assert_eq!(events.to_string(), "edit|move");
    }

    #[test]
    fn op_set_lookups() {
        let mut set = FsOperationSet::new();
        set.insert(FsOperation::new(
            OpType::Create,
            "a".into(),
            ItemType::File,
            "a.txt",
        ));
        set.insert(
            FsOperation::new(OpType::Move, "b".into(), ItemType::Directory, "b")
                .with_destination("c/b"),
        );
        set.insert(FsOperation::new(
            OpType::Delete,
            "a".into(),
            ItemType::File,
            "a.txt",
        ));

        assert_eq!(set.len(), 3);
        assert_eq!(set.ops_of_type(OpType::Move).count(), 1);
        assert!(set.find_op(&"a".into(), OpType::Create).is_some());
        assert!(set.find_op(&"a".into(), OpType::Delete).is_some());
        assert!(set.find_op(&"b".into(), OpType::Delete).is_none());
        let mv = set.find_op(&"b".into(), OpType::Move).unwrap();
        assert_eq!(mv.destination_path.as_deref(), Some(std::path::Path::new("c/b")));
    }

    #[test]
    fn insertion_order_preserved_per_type() {
        let mut set = FsOperationSet::new();
        for name in ["1", "2", "3"] {
            set.insert(FsOperation::new(
                OpType::Create,
                name.into(),
                ItemType::File,
                name,
            ));
        }
        let ids: Vec<&str> = set
            .ops_of_type(OpType::Create)
            .map(|op| op.node_id.as_str())
            .collect();
        assert_eq!(ids, ["1", "2", "3"]);
    }
}
