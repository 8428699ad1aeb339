//! Update-tree nodes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drift_index::{normalize_name, ItemType, NodeId, ReplicaSide};

use crate::fs_op::{ChangeEvents, OpType};

/// Index of a node in its tree's arena. Keys are stable for the lifetime
/// of a tree; removal leaves a tombstone slot.
pub type NodeKey = usize;

/// Operation-generation progress marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unprocessed,
    /// First of two operations emitted (a node carrying Move and Edit).
    PartiallyProcessed,
    Processed,
}

/// One node of an update tree. Structure (parent key, children keyed by
/// child id) is maintained by the owning [`UpdateTree`](crate::UpdateTree);
/// everything else is change bookkeeping.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) db_id: Option<i64>,
    name: String,
    normalized_name: String,
    pub(crate) node_type: ItemType,
    pub(crate) change_events: ChangeEvents,
    pub(crate) id: Option<NodeId>,
    /// Replica id this node carried before a delete+create pair at the same
    /// path was coalesced into an edit.
    pub(crate) previous_id: Option<NodeId>,
    pub(crate) created_at: Option<DateTime<Utc>>,
    pub(crate) modified_at: Option<DateTime<Utc>>,
    pub(crate) size: i64,
    pub(crate) status: NodeStatus,
    pub(crate) parent: Option<NodeKey>,
    pub(crate) children: BTreeMap<NodeId, NodeKey>,
    /// Pre-move path, set while folding move operations.
    pub(crate) move_origin: Option<PathBuf>,
    /// Db id of the parent the node was under before its move.
    pub(crate) move_origin_parent_db_id: Option<i64>,
    /// Placeholder materialized from a path segment; must be resolved
    /// against the db before the tree is complete.
    pub(crate) is_tmp: bool,
}

impl Node {
    pub fn new(id: Option<NodeId>, name: impl Into<String>, node_type: ItemType) -> Self {
        let name = name.into();
        let normalized_name = normalize_name(&name);
        Self {
            db_id: None,
            name,
            normalized_name,
            node_type,
            change_events: ChangeEvents::default(),
            id,
            previous_id: None,
            created_at: None,
            modified_at: None,
            size: 0,
            status: NodeStatus::Unprocessed,
            parent: None,
            children: BTreeMap::new(),
            move_origin: None,
            move_origin_parent_db_id: None,
            is_tmp: false,
        }
    }

    pub fn id(&self) -> Option<&NodeId> {
        self.id.as_ref()
    }

    pub fn db_id(&self) -> Option<i64> {
        self.db_id
    }

    pub fn previous_id(&self) -> Option<&NodeId> {
        self.previous_id.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.normalized_name = normalize_name(&self.name);
    }

    pub fn node_type(&self) -> ItemType {
        self.node_type
    }

    pub fn is_directory(&self) -> bool {
        self.node_type.is_directory()
    }

    pub fn change_events(&self) -> ChangeEvents {
        self.change_events
    }

    pub fn has_change(&self, op: OpType) -> bool {
        self.change_events.contains(op)
    }

    pub fn has_any_change(&self) -> bool {
        !self.change_events.is_empty()
    }

    pub(crate) fn insert_change_event(&mut self, op: OpType) {
        self.change_events.insert(op);
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_at
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    pub fn children(&self) -> &BTreeMap<NodeId, NodeKey> {
        &self.children
    }

    pub fn child_by_id(&self, id: &NodeId) -> Option<NodeKey> {
        self.children.get(id).copied()
    }

    pub fn move_origin(&self) -> Option<&std::path::Path> {
        self.move_origin.as_deref()
    }

    pub fn move_origin_parent_db_id(&self) -> Option<i64> {
        self.move_origin_parent_db_id
    }

    pub fn is_tmp(&self) -> bool {
        self.is_tmp
    }

    /// A delete folded onto this node followed by a create at the same
    /// path, coalesced into an edit.
    pub fn is_recreated(&self) -> bool {
        self.previous_id.is_some() && self.has_change(OpType::Edit)
    }
}

/// Detached reference to a tree node: enough to identify the item in
/// conflict and operation records without holding the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub side: ReplicaSide,
    pub id: NodeId,
    pub db_id: Option<i64>,
    pub path: PathBuf,
    pub node_type: ItemType,
}
