//! Arena-backed update tree.
//!
//! One tree per replica and pass. Nodes live in a slot vector and refer to
//! each other by [`NodeKey`]; parent links and child maps always point at
//! live slots, and every reparenting operation re-checks ancestry so a
//! cycle can never be formed. Lookups by replica id go through a side
//! index, which also honors the previous-id mapping produced when a
//! delete+create pair is coalesced into an edit.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use tracing::trace;

use drift_index::{normalize_name, ItemType, NodeId, ReplicaSide};

use crate::db::DbNode;
use crate::errors::{ReconError, Result};
use crate::node::{Node, NodeKey, NodeStatus};

// Tree walks are capped so corrupted parent links cannot loop forever.
const MAX_DEPTH: usize = 1000;

pub(crate) fn generate_tmp_id() -> NodeId {
    NodeId::new(format!("tmp_{:08x}", rand::random::<u32>()))
}

#[derive(Debug)]
pub struct UpdateTree {
    side: ReplicaSide,
    nodes: Vec<Option<Node>>,
    index: HashMap<NodeId, NodeKey>,
    root: NodeKey,
    /// old replica id -> new replica id, for delete+create coalesced edits.
    previous_ids: HashMap<NodeId, NodeId>,
}

impl UpdateTree {
    /// Builds a root-only tree from the last-synced root row.
    pub fn new(side: ReplicaSide, root_row: &DbNode) -> Result<Self> {
        let root_id = root_row
            .replica_id(side)
            .cloned()
            .ok_or_else(|| {
                ReconError::Data(format!("sync database root has no {side} replica id"))
            })?;
        let mut root = Node::new(Some(root_id.clone()), "", ItemType::Directory);
        root.db_id = Some(root_row.db_id);
        root.created_at = root_row.created_at;
        root.modified_at = root_row.modified(side);
        let mut index = HashMap::new();
        index.insert(root_id, 0);
        Ok(Self {
            side,
            nodes: vec![Some(root)],
            index,
            root: 0,
            previous_ids: HashMap::new(),
        })
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn root_key(&self) -> NodeKey {
        self.root
    }

    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(key).and_then(|slot| slot.as_ref())
    }

    pub fn node_mut(&mut self, key: NodeKey) -> Option<&mut Node> {
        self.nodes.get_mut(key).and_then(|slot| slot.as_mut())
    }

    pub(crate) fn node_ref(&self, key: NodeKey) -> Result<&Node> {
        self.node(key)
            .ok_or_else(|| ReconError::Data(format!("stale node key {key}")))
    }

    pub(crate) fn node_ref_mut(&mut self, key: NodeKey) -> Result<&mut Node> {
        self.nodes
            .get_mut(key)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| ReconError::Data(format!("stale node key {key}")))
    }

    /// Live node count, the root included.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(key, slot)| slot.as_ref().map(|_| key))
    }

    /// Key of the node carrying a replica id, through the previous-id map.
    pub fn key_of(&self, id: &NodeId) -> Option<NodeKey> {
        if let Some(key) = self.index.get(id) {
            return Some(*key);
        }
        self.previous_ids
            .get(id)
            .and_then(|new_id| self.index.get(new_id))
            .copied()
    }

    pub fn node_by_id(&self, id: &NodeId) -> Option<&Node> {
        self.key_of(id).and_then(|key| self.node(key))
    }

    pub fn record_previous_id(&mut self, old_id: NodeId, new_id: NodeId) {
        self.previous_ids.insert(old_id, new_id);
    }

    pub fn new_id_for(&self, old_id: &NodeId) -> Option<&NodeId> {
        self.previous_ids.get(old_id)
    }

    /// Inserts a fresh node under `parent`. The node must carry an id (tmp
    /// nodes carry generated ones).
    pub fn attach(&mut self, mut node: Node, parent: NodeKey) -> Result<NodeKey> {
        let id = node
            .id
            .clone()
            .ok_or_else(|| ReconError::Data("cannot attach a node without an id".to_string()))?;
        self.node_ref(parent)?;
        node.parent = Some(parent);
        let key = self.nodes.len();
        self.nodes.push(Some(node));
        self.index.insert(id.clone(), key);
        if let Some(parent_node) = self.node_mut(parent) {
            parent_node.children.insert(id, key);
        }
        trace!(side = %self.side, key, "attached node");
        Ok(key)
    }

    /// Moves a node under a new parent. Refused when it would make the
    /// node its own ancestor.
    pub fn set_parent(&mut self, key: NodeKey, new_parent: NodeKey) -> Result<()> {
        if key == new_parent || self.is_ancestor(new_parent, key) {
            return Err(ReconError::Data(format!(
                "reparenting node {key} under {new_parent} would create a cycle"
            )));
        }
        self.node_ref(new_parent)?;
        self.detach_from_parent(key)?;
        let id = self
            .node_ref(key)?
            .id
            .clone()
            .ok_or_else(|| ReconError::Data("cannot reparent a node without an id".to_string()))?;
        self.node_ref_mut(key)?.parent = Some(new_parent);
        self.node_ref_mut(new_parent)?.children.insert(id, key);
        Ok(())
    }

    pub fn detach_from_parent(&mut self, key: NodeKey) -> Result<()> {
        let (parent, id) = {
            let node = self.node_ref(key)?;
            (node.parent, node.id.clone())
        };
        if let (Some(parent), Some(id)) = (parent, id) {
            if let Some(parent_node) = self.node_mut(parent) {
                parent_node.children.remove(&id);
            }
        }
        self.node_ref_mut(key)?.parent = None;
        Ok(())
    }

    /// Removes a node and all its descendants.
    pub fn remove_subtree(&mut self, key: NodeKey) -> Result<()> {
        self.detach_from_parent(key)?;
        let mut stack = vec![key];
        let mut removed = 0usize;
        while let Some(current) = stack.pop() {
            let node = match self.nodes.get_mut(current).and_then(Option::take) {
                Some(node) => node,
                None => continue,
            };
            if let Some(id) = &node.id {
                self.index.remove(id);
            }
            stack.extend(node.children.values().copied());
            removed += 1;
            if removed > self.nodes.len() {
                return Err(ReconError::Data(
                    "subtree removal does not terminate".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Re-keys a node in the id index and its parent's child map.
    pub fn update_node_id(&mut self, key: NodeKey, new_id: NodeId) -> Result<()> {
        let (old_id, parent) = {
            let node = self.node_ref(key)?;
            (node.id.clone(), node.parent)
        };
        if let Some(old_id) = &old_id {
            self.index.remove(old_id);
            if let Some(parent) = parent {
                if let Some(parent_node) = self.node_mut(parent) {
                    parent_node.children.remove(old_id);
                }
            }
        }
        self.index.insert(new_id.clone(), key);
        if let Some(parent) = parent {
            let id = new_id.clone();
            if let Some(parent_node) = self.node_mut(parent) {
                parent_node.children.insert(id, key);
            }
        }
        self.node_ref_mut(key)?.id = Some(new_id);
        Ok(())
    }

    /// Path relative to the root.
    pub fn path_of(&self, key: NodeKey) -> Result<PathBuf> {
        let mut names: Vec<&str> = Vec::new();
        let mut current = key;
        let mut depth = 0usize;
        while current != self.root {
            let node = self.node_ref(current)?;
            names.push(node.name());
            current = node
                .parent
                .ok_or_else(|| ReconError::Data(format!("node {key} is detached from the tree")))?;
            depth += 1;
            if depth > MAX_DEPTH {
                return Err(ReconError::Data(format!(
                    "ancestry of node {key} does not terminate"
                )));
            }
        }
        Ok(names.iter().rev().collect())
    }

    pub fn depth_of(&self, key: NodeKey) -> Result<usize> {
        let mut current = key;
        let mut depth = 0usize;
        while current != self.root {
            current = self
                .node_ref(current)?
                .parent
                .ok_or_else(|| ReconError::Data(format!("node {key} is detached from the tree")))?;
            depth += 1;
            if depth > MAX_DEPTH {
                return Err(ReconError::Data(format!(
                    "ancestry of node {key} does not terminate"
                )));
            }
        }
        Ok(depth)
    }

    /// Resolves a root-relative path by normalized name matching. A child
    /// that is only delete-flagged matches last, after any live child of
    /// the same name (delete-then-recreate leaves both in the tree).
    pub fn node_by_path(&self, path: &Path) -> Option<NodeKey> {
        let mut current = self.root;
        for component in path.components() {
            let segment = match component {
                Component::Normal(s) => normalize_name(&s.to_string_lossy()),
                Component::CurDir => continue,
                _ => return None,
            };
            let node = self.node(current)?;
            let mut live = None;
            let mut deleted = None;
            for &child in node.children.values() {
                let Some(c) = self.node(child) else { continue };
                if c.normalized_name() != segment {
                    continue;
                }
                if c.change_events().contains(crate::fs_op::OpType::Delete)
                    && !c.change_events().contains(crate::fs_op::OpType::Create)
                {
                    deleted.get_or_insert(child);
                } else {
                    live.get_or_insert(child);
                }
            }
            current = live.or(deleted)?;
        }
        Some(current)
    }

    /// Whether `ancestor` lies strictly above `key`. False for the node
    /// itself.
    pub fn is_ancestor(&self, key: NodeKey, ancestor: NodeKey) -> bool {
        if key == ancestor {
            return false;
        }
        let mut current = key;
        let mut depth = 0usize;
        while let Some(node) = self.node(current) {
            match node.parent {
                Some(parent) if parent == ancestor => return true,
                Some(parent) => current = parent,
                None => return false,
            }
            depth += 1;
            if depth > MAX_DEPTH {
                return false;
            }
        }
        false
    }

    pub fn mark_all_unprocessed(&mut self) {
        for slot in self.nodes.iter_mut().flatten() {
            slot.status = NodeStatus::Unprocessed;
        }
    }

    pub fn set_status(&mut self, key: NodeKey, status: NodeStatus) -> Result<()> {
        self.node_ref_mut(key)?.status = status;
        Ok(())
    }

    /// Marks a node and every descendant as processed.
    pub fn mark_subtree_processed(&mut self, key: NodeKey) -> Result<()> {
        let mut stack = vec![key];
        let mut visited = 0usize;
        while let Some(current) = stack.pop() {
            let node = self.node_ref_mut(current)?;
            node.status = NodeStatus::Processed;
            stack.extend(node.children.values().copied());
            visited += 1;
            if visited > self.nodes.len() {
                return Err(ReconError::Data(
                    "subtree walk does not terminate".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Drops everything but the root and clears per-pass bookkeeping.
    pub fn reset_working_state(&mut self) {
        let root = self.nodes.get_mut(self.root).and_then(Option::take);
        self.nodes.clear();
        self.index.clear();
        self.previous_ids.clear();
        if let Some(mut root) = root {
            root.children.clear();
            root.change_events.clear();
            root.previous_id = None;
            root.status = NodeStatus::Unprocessed;
            if let Some(id) = root.id.clone() {
                self.index.insert(id, 0);
            }
            self.nodes.push(Some(root));
            self.root = 0;
        }
    }

    /// Removes a single node (its children must have been moved away
    /// first). The id index entry is only dropped when it still points at
    /// this node, so a re-keyed id keeps its new mapping.
    pub fn remove_node(&mut self, key: NodeKey) -> Result<Node> {
        self.detach_from_parent(key)?;
        let node = self
            .nodes
            .get_mut(key)
            .and_then(Option::take)
            .ok_or_else(|| ReconError::Data(format!("stale node key {key}")))?;
        if let Some(id) = &node.id {
            if self.index.get(id) == Some(&key) {
                self.index.remove(id);
            }
        }
        Ok(node)
    }

    /// Moves a tmp placeholder's children onto the real node occupying the
    /// same position, then drops the placeholder.
    pub fn merge_tmp_into_real(&mut self, tmp: NodeKey, real: NodeKey) -> Result<()> {
        if !self.node_ref(tmp)?.is_tmp() {
            return Err(ReconError::Data(format!(
                "node {tmp} is not a placeholder"
            )));
        }
        let children: Vec<NodeKey> = self.node_ref(tmp)?.children.values().copied().collect();
        for child in children {
            self.set_parent(child, real)?;
        }
        self.remove_node(tmp)?;
        Ok(())
    }

    /// Detached reference to a node, for conflict and operation records.
    pub fn make_ref(&self, key: NodeKey) -> Result<crate::node::NodeRef> {
        let node = self.node_ref(key)?;
        let id = node
            .id()
            .cloned()
            .ok_or_else(|| ReconError::Data(format!("node {key} has no replica id")))?;
        Ok(crate::node::NodeRef {
            side: self.side,
            id,
            db_id: node.db_id(),
            path: self.path_of(key)?,
            node_type: node.node_type(),
        })
    }

    /// No placeholder may survive tree completion.
    pub fn integrity_check(&self) -> Result<()> {
        for key in self.keys() {
            if self.node_ref(key)?.is_tmp() {
                let path = self.path_of(key)?;
                return Err(ReconError::Data(format!(
                    "unresolved placeholder node at {} after tree completion",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_op::OpType;

    fn test_tree() -> UpdateTree {
        let root = crate::db::tests::test_node(1, None, "", ItemType::Directory, "lroot", "rroot");
        UpdateTree::new(ReplicaSide::Local, &root).unwrap()
    }

    fn attach_dir(tree: &mut UpdateTree, id: &str, name: &str, parent: NodeKey) -> NodeKey {
        tree.attach(
            Node::new(Some(id.into()), name, ItemType::Directory),
            parent,
        )
        .unwrap()
    }

    #[test]
    fn attach_and_lookup() {
        let mut tree = test_tree();
        let root = tree.root_key();
        let a = attach_dir(&mut tree, "a", "A", root);
        let b = attach_dir(&mut tree, "b", "B", a);
        assert_eq!(tree.key_of(&"b".into()), Some(b));
        assert_eq!(tree.path_of(b).unwrap(), PathBuf::from("A/B"));
        assert_eq!(tree.depth_of(b).unwrap(), 2);
        assert_eq!(tree.node_by_path(Path::new("A/B")), Some(b));
        assert_eq!(tree.node_by_path(Path::new("A/C")), None);
        assert_eq!(tree.len(), 3);
        assert!(!tree.is_empty());
    }

    #[test]
    fn reparent_guards_against_cycles() {
        let mut tree = test_tree();
        let root = tree.root_key();
        let a = attach_dir(&mut tree, "a", "A", root);
        let b = attach_dir(&mut tree, "b", "B", a);
        let c = attach_dir(&mut tree, "c", "C", b);
        assert!(tree.set_parent(a, c).is_err(), "A under its own descendant");
        assert!(tree.set_parent(a, a).is_err());
        tree.set_parent(c, root).unwrap();
        assert_eq!(tree.path_of(c).unwrap(), PathBuf::from("C"));
        assert!(tree.is_ancestor(b, root));
        assert!(!tree.is_ancestor(c, a));
    }

    #[test]
    fn update_node_id_rekeys_index_and_child_map() {
        let mut tree = test_tree();
        let root = tree.root_key();
        let a = attach_dir(&mut tree, "a", "A", root);
        tree.update_node_id(a, "a2".into()).unwrap();
        assert_eq!(tree.key_of(&"a2".into()), Some(a));
        assert_eq!(tree.index.get(&"a".into()), None);
        let root_node = tree.node(root).unwrap();
        assert_eq!(root_node.child_by_id(&"a2".into()), Some(a));
        assert_eq!(root_node.child_by_id(&"a".into()), None);
    }

    #[test]
    fn previous_id_map_resolves_old_ids() {
        let mut tree = test_tree();
        let root = tree.root_key();
        let a = attach_dir(&mut tree, "new", "A", root);
        tree.record_previous_id("old".into(), "new".into());
        assert_eq!(tree.key_of(&"old".into()), Some(a));
        assert_eq!(tree.key_of(&"new".into()), Some(a));
    }

    #[test]
    fn remove_subtree_clears_index() {
        let mut tree = test_tree();
        let root = tree.root_key();
        let a = attach_dir(&mut tree, "a", "A", root);
        let _b = attach_dir(&mut tree, "b", "B", a);
        tree.remove_subtree(a).unwrap();
        assert_eq!(tree.key_of(&"a".into()), None);
        assert_eq!(tree.key_of(&"b".into()), None);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn merge_tmp_adopts_children() {
        let mut tree = test_tree();
        let root = tree.root_key();
        let mut tmp = Node::new(Some(generate_tmp_id()), "A", ItemType::Directory);
        tmp.is_tmp = true;
        let tmp = tree.attach(tmp, root).unwrap();
        let child = attach_dir(&mut tree, "c", "C", tmp);
        let real = attach_dir(&mut tree, "a", "A", root);
        tree.merge_tmp_into_real(tmp, real).unwrap();
        assert_eq!(tree.node(child).unwrap().parent(), Some(real));
        assert!(tree.node(tmp).is_none());
        assert!(tree.integrity_check().is_ok());
    }

    #[test]
    fn integrity_check_flags_surviving_tmp() {
        let mut tree = test_tree();
        let root = tree.root_key();
        let mut tmp = Node::new(Some(generate_tmp_id()), "ghost", ItemType::Directory);
        tmp.is_tmp = true;
        tree.attach(tmp, root).unwrap();
        assert!(tree.integrity_check().is_err());
    }

    #[test]
    fn reset_keeps_only_root() {
        let mut tree = test_tree();
        let root = tree.root_key();
        let a = attach_dir(&mut tree, "a", "A", root);
        tree.node_mut(a).unwrap().insert_change_event(OpType::Create);
        tree.record_previous_id("x".into(), "y".into());
        tree.reset_working_state();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.key_of(&"a".into()), None);
        assert_eq!(tree.new_id_for(&"x".into()), None);
        assert_eq!(tree.key_of(&"lroot".into()), Some(tree.root_key()));
    }

    #[test]
    fn path_matching_is_normalization_aware() {
        let mut tree = test_tree();
        let root = tree.root_key();
        let a = attach_dir(&mut tree, "a", "caf\u{e9}", root);
        assert_eq!(tree.node_by_path(Path::new("cafe\u{301}")), Some(a));
    }
}
