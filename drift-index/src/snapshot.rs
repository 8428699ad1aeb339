//! Live snapshot of one replica's file tree.
//!
//! The snapshot is a flat, id-indexed item store fed concurrently by a
//! filesystem observer and read by the reconciliation pass, so all state
//! sits behind one coarse mutex. A monotonic revision counter bumps on
//! every structural change that is visible from the root; orphan edits and
//! asynchronous checksum arrival do not bump it, which keeps revision-gated
//! consumers from re-running for invisible changes.

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{IndexError, Result};
use crate::item::{normalize_name, ItemType, NodeId, SnapshotItem};

/// Which replica a snapshot (or tree, or operation) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaSide {
    Local,
    Remote,
}

impl ReplicaSide {
    pub fn opposite(&self) -> ReplicaSide {
        match self {
            ReplicaSide::Local => ReplicaSide::Remote,
            ReplicaSide::Remote => ReplicaSide::Local,
        }
    }
}

impl std::fmt::Display for ReplicaSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaSide::Local => f.write_str("local"),
            ReplicaSide::Remote => f.write_str("remote"),
        }
    }
}

// Parent-chain walks are capped so a corrupted chain cannot loop forever.
const MAX_DEPTH: usize = 1000;

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<NodeId, SnapshotItem>,
    children: HashMap<NodeId, BTreeSet<NodeId>>,
    revision: u64,
    valid: bool,
}

/// Coarse-locked live snapshot of one replica.
#[derive(Debug)]
pub struct Snapshot {
    side: ReplicaSide,
    root_id: NodeId,
    inner: Mutex<Inner>,
}

impl Snapshot {
    pub fn new(side: ReplicaSide, root_id: NodeId) -> Self {
        let snapshot = Self {
            side,
            root_id,
            inner: Mutex::new(Inner::default()),
        };
        snapshot.init();
        snapshot
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resets to the root-only state and marks the snapshot invalid until
    /// the next full rescan completes. The revision counter is kept so it
    /// stays monotonic across rescans.
    pub fn init(&self) {
        let mut inner = self.lock();
        inner.items.clear();
        inner.children.clear();
        inner.valid = false;
        let root = SnapshotItem::new(
            self.root_id.clone(),
            NodeId::default(),
            "",
            ItemType::Directory,
        );
        inner.items.insert(self.root_id.clone(), root);
        debug!(side = %self.side, "snapshot reset to root-only state");
    }

    pub fn is_valid(&self) -> bool {
        self.lock().valid
    }

    pub fn set_valid(&self, valid: bool) {
        self.lock().valid = valid;
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Upserts an item keyed by id. Returns false for structurally invalid
    /// input (empty ids, self-parenting). A sibling carrying the same
    /// normalized name under the target parent but a different id is
    /// removed first: the replica cannot hold both, so the last writer
    /// wins.
    pub fn update_item(&self, item: SnapshotItem) -> bool {
        if item.id.is_empty() || item.parent_id.is_empty() {
            warn!(side = %self.side, "rejected snapshot item with empty id or parent id");
            return false;
        }
        if item.id == item.parent_id {
            warn!(side = %self.side, id = %item.id, "rejected self-parented snapshot item");
            return false;
        }

        let mut inner = self.lock();

        // Evict a same-named sibling with a different id.
        let duplicate = inner
            .children
            .get(&item.parent_id)
            .into_iter()
            .flatten()
            .find(|child_id| {
                **child_id != item.id
                    && inner
                        .items
                        .get(child_id)
                        .is_some_and(|c| c.normalized_name() == item.normalized_name())
            })
            .cloned();
        if let Some(dup_id) = duplicate {
            debug!(side = %self.side, evicted = %dup_id, kept = %item.id,
                "evicting same-named sibling on upsert");
            let was_visible = !inner.is_orphan(&self.root_id, &dup_id);
            inner.remove_subtree(&dup_id);
            if was_visible {
                inner.revision += 1;
            }
        }

        let previous = inner
            .items
            .get(&item.id)
            .map(|p| (p.parent_id.clone(), p.same_as(&item)));
        let parent_changed = match previous {
            Some((_, true)) => return true,
            Some((old_parent, false)) => {
                let changed = old_parent != item.parent_id;
                if changed {
                    inner.detach_child(&old_parent, &item.id);
                }
                changed
            }
            None => false,
        };

        inner
            .children
            .entry(item.parent_id.clone())
            .or_default()
            .insert(item.id.clone());

        // An item may arrive before its parent; hold a placeholder so the
        // subtree stays connected once the parent shows up.
        if item.parent_id != self.root_id && !inner.items.contains_key(&item.parent_id) {
            let placeholder = SnapshotItem::new(
                item.parent_id.clone(),
                NodeId::default(),
                "",
                ItemType::Unknown,
            );
            inner.items.insert(item.parent_id.clone(), placeholder);
        }

        let id = item.id.clone();
        inner.items.insert(id.clone(), item);
        if parent_changed || !inner.is_orphan(&self.root_id, &id) {
            inner.revision += 1;
            let revision = inner.revision;
            if let Some(stored) = inner.items.get_mut(&id) {
                stored.last_change_revision = revision;
            }
        }
        true
    }

    /// Removes an item and its whole subtree. An absent id is a successful
    /// no-op; an empty id is rejected.
    pub fn remove_item(&self, id: &NodeId) -> bool {
        if id.is_empty() {
            return false;
        }
        let mut inner = self.lock();
        if !inner.items.contains_key(id) {
            return true;
        }
        let was_visible = !inner.is_orphan(&self.root_id, id);
        inner.remove_subtree(id);
        if was_visible {
            inner.revision += 1;
        }
        debug!(side = %self.side, id = %id, "removed snapshot subtree");
        true
    }

    /// Path of an item relative to the snapshot root.
    pub fn path(&self, id: &NodeId) -> Result<PathBuf> {
        let inner = self.lock();
        let mut names: Vec<String> = Vec::new();
        let mut current = id.clone();
        let mut depth = 0usize;
        while current != self.root_id {
            let item = inner
                .items
                .get(&current)
                .ok_or_else(|| IndexError::ItemNotFound(current.to_string()))?;
            if item.parent_id.is_empty() {
                return Err(IndexError::BrokenAncestry(id.to_string()));
            }
            names.push(item.name().to_string());
            current = item.parent_id.clone();
            depth += 1;
            if depth > MAX_DEPTH {
                return Err(IndexError::BrokenAncestry(id.to_string()));
            }
        }
        let path: PathBuf = names.iter().rev().collect();
        // A name shaped like a drive letter would give the relative path a
        // root-name component, which no sync path may have.
        if path
            .components()
            .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
        {
            warn!(side = %self.side, id = %id, path = %path.display(),
                "item path carries a root-name component, ignoring item");
            return Err(IndexError::IgnoredPath(path));
        }
        Ok(path)
    }

    /// Resolves a root-relative path to an item id by walking normalized
    /// segment names down from the root.
    pub fn item_id(&self, path: &Path) -> Option<NodeId> {
        let inner = self.lock();
        let mut current = self.root_id.clone();
        for component in path.components() {
            let segment = match component {
                Component::Normal(s) => normalize_name(&s.to_string_lossy()),
                Component::CurDir => continue,
                _ => return None,
            };
            let next = inner
                .children
                .get(&current)?
                .iter()
                .find(|child_id| {
                    inner
                        .items
                        .get(child_id)
                        .is_some_and(|c| c.normalized_name() == segment)
                })
                .cloned()?;
            current = next;
        }
        Some(current)
    }

    pub fn exists(&self, id: &NodeId) -> bool {
        let inner = self.lock();
        inner.items.contains_key(id) && !inner.is_orphan(&self.root_id, id)
    }

    pub fn path_exists(&self, path: &Path) -> bool {
        self.item_id(path).is_some()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.lock().items.keys().cloned().collect()
    }

    pub fn children_ids(&self, id: &NodeId) -> Vec<NodeId> {
        self.lock()
            .children
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn item(&self, id: &NodeId) -> Option<SnapshotItem> {
        self.lock().items.get(id).cloned()
    }

    pub fn name(&self, id: &NodeId) -> Option<String> {
        self.lock().items.get(id).map(|i| i.name().to_string())
    }

    pub fn item_type(&self, id: &NodeId) -> Option<ItemType> {
        self.lock().items.get(id).map(|i| i.item_type)
    }

    pub fn created_at(&self, id: &NodeId) -> Option<chrono::DateTime<chrono::Utc>> {
        self.lock().items.get(id).and_then(|i| i.created_at)
    }

    pub fn modified_at(&self, id: &NodeId) -> Option<chrono::DateTime<chrono::Utc>> {
        self.lock().items.get(id).and_then(|i| i.modified_at)
    }

    /// Size of an item; directories aggregate their descendants.
    pub fn size(&self, id: &NodeId) -> i64 {
        let inner = self.lock();
        let Some(item) = inner.items.get(id) else {
            return 0;
        };
        if !item.item_type.is_directory() {
            return item.size;
        }
        let mut total = 0i64;
        let mut stack: Vec<NodeId> = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(child_ids) = inner.children.get(&current) {
                for child_id in child_ids {
                    if let Some(child) = inner.items.get(child_id) {
                        if child.item_type.is_directory() {
                            stack.push(child_id.clone());
                        } else {
                            total += child.size;
                        }
                    }
                }
            }
        }
        total
    }

    pub fn content_checksum(&self, id: &NodeId) -> Option<String> {
        self.lock().items.get(id).and_then(|i| i.content_checksum.clone())
    }

    pub fn is_link(&self, id: &NodeId) -> bool {
        self.lock().items.get(id).is_some_and(|i| i.is_link)
    }

    pub fn can_write(&self, id: &NodeId) -> bool {
        self.lock().items.get(id).is_some_and(|i| i.can_write)
    }

    pub fn can_share(&self, id: &NodeId) -> bool {
        self.lock().items.get(id).is_some_and(|i| i.can_share)
    }

    pub fn last_change_revision(&self, id: &NodeId) -> u64 {
        self.lock()
            .items
            .get(id)
            .map(|i| i.last_change_revision)
            .unwrap_or(0)
    }

    /// An item is an orphan when its parent chain does not reach the root.
    pub fn is_orphan(&self, id: &NodeId) -> bool {
        self.lock().is_orphan(&self.root_id, id)
    }

    /// Whether `ancestor` lies strictly above `id`. False for the item
    /// itself and for the root item.
    pub fn is_ancestor(&self, id: &NodeId, ancestor: &NodeId) -> bool {
        if id == ancestor || *id == self.root_id {
            return false;
        }
        let inner = self.lock();
        let mut current = id.clone();
        let mut depth = 0usize;
        while let Some(item) = inner.items.get(&current) {
            if item.parent_id.is_empty() {
                return false;
            }
            if item.parent_id == *ancestor {
                return true;
            }
            current = item.parent_id.clone();
            depth += 1;
            if depth > MAX_DEPTH {
                return false;
            }
        }
        false
    }

    /// Content checksums arrive asynchronously from the hashing worker;
    /// recording one must not retrigger revision-gated consumers.
    pub fn set_content_checksum(&self, id: &NodeId, checksum: impl Into<String>) -> bool {
        let mut inner = self.lock();
        match inner.items.get_mut(id) {
            Some(item) => {
                item.content_checksum = Some(checksum.into());
                true
            }
            None => false,
        }
    }

    pub fn clear_content_checksum(&self, id: &NodeId) -> bool {
        let mut inner = self.lock();
        match inner.items.get_mut(id) {
            Some(item) => {
                item.content_checksum = None;
                true
            }
            None => false,
        }
    }

    pub fn set_name(&self, id: &NodeId, name: &str) -> bool {
        self.mutate(id, |item| item.set_name(name))
    }

    pub fn set_created_at(&self, id: &NodeId, at: chrono::DateTime<chrono::Utc>) -> bool {
        self.mutate(id, |item| item.created_at = Some(at))
    }

    pub fn set_modified_at(&self, id: &NodeId, at: chrono::DateTime<chrono::Utc>) -> bool {
        self.mutate(id, |item| item.modified_at = Some(at))
    }

    pub fn set_parent_id(&self, id: &NodeId, parent_id: NodeId) -> bool {
        if parent_id.is_empty() || parent_id == *id {
            return false;
        }
        let mut inner = self.lock();
        let old_parent = match inner.items.get(id) {
            Some(item) => item.parent_id.clone(),
            None => return false,
        };
        if old_parent == parent_id {
            return true;
        }
        inner.detach_child(&old_parent, id);
        inner
            .children
            .entry(parent_id.clone())
            .or_default()
            .insert(id.clone());
        if let Some(item) = inner.items.get_mut(id) {
            item.parent_id = parent_id;
        }
        inner.stamp(&self.root_id, id);
        true
    }

    fn mutate(&self, id: &NodeId, f: impl FnOnce(&mut SnapshotItem)) -> bool {
        let mut inner = self.lock();
        if let Some(item) = inner.items.get_mut(id) {
            f(item);
        } else {
            return false;
        }
        inner.stamp(&self.root_id, id);
        true
    }
}

impl Inner {
    fn is_orphan(&self, root_id: &NodeId, id: &NodeId) -> bool {
        if id == root_id {
            return false;
        }
        let mut current = id;
        let mut depth = 0usize;
        loop {
            let Some(item) = self.items.get(current) else {
                return true;
            };
            if item.parent_id == *root_id {
                return false;
            }
            if item.parent_id.is_empty() {
                return true;
            }
            current = &item.parent_id;
            depth += 1;
            if depth > MAX_DEPTH {
                return true;
            }
        }
    }

    fn detach_child(&mut self, parent_id: &NodeId, id: &NodeId) {
        if let Some(set) = self.children.get_mut(parent_id) {
            set.remove(id);
            if set.is_empty() {
                self.children.remove(parent_id);
            }
        }
    }

    fn remove_subtree(&mut self, id: &NodeId) {
        if let Some(item) = self.items.get(id) {
            let parent_id = item.parent_id.clone();
            self.detach_child(&parent_id, id);
        }
        let mut stack: Vec<NodeId> = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(child_ids) = self.children.remove(&current) {
                stack.extend(child_ids);
            }
            self.items.remove(&current);
        }
    }

    /// Bumps the revision and stamps the item iff it is visible from the
    /// root.
    fn stamp(&mut self, root_id: &NodeId, id: &NodeId) {
        if self.is_orphan(root_id, id) {
            return;
        }
        self.revision += 1;
        let revision = self.revision;
        if let Some(item) = self.items.get_mut(id) {
            item.last_change_revision = revision;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> NodeId {
        NodeId::from("root")
    }

    fn test_snapshot() -> Snapshot {
        Snapshot::new(ReplicaSide::Local, root())
    }

    fn dir(id: &str, parent: &str, name: &str) -> SnapshotItem {
        SnapshotItem::new(id.into(), parent.into(), name, ItemType::Directory)
    }

    fn file(id: &str, parent: &str, name: &str) -> SnapshotItem {
        SnapshotItem::new(id.into(), parent.into(), name, ItemType::File)
    }

    #[test]
    fn update_item_is_idempotent() {
        let snap = test_snapshot();
        let item = file("f1", "root", "a.txt").with_size(10);
        assert!(snap.update_item(item.clone()));
        let rev = snap.revision();
        assert!(rev > 0);
        assert!(snap.update_item(item));
        assert_eq!(snap.revision(), rev, "identical upsert must not bump revision");
    }

    #[test]
    fn update_item_rejects_invalid_input() {
        let snap = test_snapshot();
        let no_parent = SnapshotItem::new("f1".into(), NodeId::default(), "a", ItemType::File);
        assert!(!snap.update_item(no_parent));
        let self_parented = SnapshotItem::new("x".into(), "x".into(), "a", ItemType::File);
        assert!(!snap.update_item(self_parented));
        assert!(snap.ids().len() == 1, "only the root remains");
    }

    #[test]
    fn name_collision_evicts_sibling() {
        let snap = test_snapshot();
        assert!(snap.update_item(file("f1", "root", "caf\u{e9}.txt")));
        // NFD spelling of the same name, different id
        assert!(snap.update_item(file("f2", "root", "cafe\u{301}.txt")));
        assert!(!snap.exists(&"f1".into()));
        assert!(snap.exists(&"f2".into()));
        assert_eq!(snap.children_ids(&root()).len(), 1);
    }

    #[test]
    fn remove_item_removes_descendants() {
        let snap = test_snapshot();
        snap.update_item(dir("d1", "root", "dir"));
        snap.update_item(file("f1", "d1", "a.txt"));
        snap.update_item(file("f2", "d1", "b.txt"));
        assert!(snap.remove_item(&"d1".into()));
        assert!(!snap.exists(&"d1".into()));
        assert!(!snap.exists(&"f1".into()));
        assert!(!snap.exists(&"f2".into()));
        // absent id is a successful no-op
        assert!(snap.remove_item(&"d1".into()));
    }

    #[test]
    fn orphan_changes_do_not_bump_revision() {
        let snap = test_snapshot();
        // parent "ghost" never attached to root
        snap.update_item(file("f1", "ghost", "a.txt"));
        assert!(snap.is_orphan(&"f1".into()));
        let rev = snap.revision();
        snap.update_item(file("f1", "ghost", "a.txt").with_size(5));
        assert_eq!(snap.revision(), rev);
        // attaching the parent makes the subtree visible
        snap.update_item(dir("ghost", "root", "ghost"));
        assert!(!snap.is_orphan(&"f1".into()));
    }

    #[test]
    fn checksum_update_does_not_bump_revision() {
        let snap = test_snapshot();
        snap.update_item(file("f1", "root", "a.txt"));
        let rev = snap.revision();
        assert!(snap.set_content_checksum(&"f1".into(), "abc123"));
        assert_eq!(snap.revision(), rev);
        assert_eq!(snap.content_checksum(&"f1".into()).as_deref(), Some("abc123"));
        assert!(snap.clear_content_checksum(&"f1".into()));
        assert_eq!(snap.revision(), rev);
    }

    #[test]
    fn path_and_item_id_round_trip() {
        let snap = test_snapshot();
        snap.update_item(dir("d1", "root", "docs"));
        snap.update_item(file("f1", "d1", "notes.txt"));
        let path = snap.path(&"f1".into()).unwrap();
        assert_eq!(path, PathBuf::from("docs/notes.txt"));
        assert_eq!(snap.item_id(&path), Some("f1".into()));
        assert_eq!(snap.item_id(Path::new("")), Some(root()));
    }

    #[test]
    fn path_of_unknown_item_fails() {
        let snap = test_snapshot();
        assert!(matches!(
            snap.path(&"nope".into()),
            Err(IndexError::ItemNotFound(_))
        ));
    }

    #[test]
    fn is_ancestor_is_strict() {
        let snap = test_snapshot();
        snap.update_item(dir("d1", "root", "a"));
        snap.update_item(dir("d2", "d1", "b"));
        snap.update_item(file("f1", "d2", "c.txt"));
        assert!(snap.is_ancestor(&"f1".into(), &"d1".into()));
        assert!(snap.is_ancestor(&"f1".into(), &root()));
        assert!(!snap.is_ancestor(&"f1".into(), &"f1".into()));
        assert!(!snap.is_ancestor(&root(), &root()));
        assert!(!snap.is_ancestor(&"d1".into(), &"d2".into()));
    }

    #[test]
    fn directory_size_aggregates_descendants() {
        let snap = test_snapshot();
        snap.update_item(dir("d1", "root", "dir"));
        snap.update_item(file("f1", "d1", "a.txt").with_size(10));
        snap.update_item(dir("d2", "d1", "sub"));
        snap.update_item(file("f2", "d2", "b.txt").with_size(32));
        assert_eq!(snap.size(&"d1".into()), 42);
        assert_eq!(snap.size(&"f1".into()), 10);
    }

    #[test]
    fn reparent_updates_both_parents() {
        let snap = test_snapshot();
        snap.update_item(dir("d1", "root", "a"));
        snap.update_item(dir("d2", "root", "b"));
        snap.update_item(file("f1", "d1", "x.txt"));
        assert!(snap.set_parent_id(&"f1".into(), "d2".into()));
        assert!(snap.children_ids(&"d1".into()).is_empty());
        assert_eq!(snap.children_ids(&"d2".into()), vec![NodeId::from("f1")]);
        assert_eq!(snap.path(&"f1".into()).unwrap(), PathBuf::from("b/x.txt"));
    }

    #[test]
    fn init_resets_but_keeps_revision_monotonic() {
        let snap = test_snapshot();
        snap.update_item(file("f1", "root", "a.txt"));
        snap.set_valid(true);
        let rev = snap.revision();
        snap.init();
        assert!(!snap.is_valid());
        assert!(!snap.exists(&"f1".into()));
        assert!(snap.revision() >= rev);
        assert!(snap.exists(&root()));
    }
}
