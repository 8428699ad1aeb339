//! Cross-tree node correspondence.
//!
//! The db id is the pivot: a node known to the last-synced store maps to
//! the other tree through its row. Nodes the store has never seen (fresh
//! creates, children of renamed placeholders) fall back to path
//! resolution through the nearest store-known ancestor.

use std::path::PathBuf;

use drift_index::{NodeId, Snapshot};

use crate::db::SyncDb;
use crate::errors::{ReconError, Result};
use crate::fs_op::OpType;
use crate::node::NodeKey;
use crate::tree::UpdateTree;

/// Counterpart of a node through the store's id mapping. Honors the other
/// tree's previous-id map, so a delete+create coalesced node is still
/// found under its old identity.
pub fn corresponding_node_direct(
    db: &dyn SyncDb,
    src: &UpdateTree,
    dst: &UpdateTree,
    key: NodeKey,
) -> Result<Option<NodeKey>> {
    let node = src.node_ref(key)?;
    let db_id = match node.db_id() {
        Some(db_id) => db_id,
        None => {
            let Some(id) = node.id() else {
                return Ok(None);
            };
            match db.db_id(src.side(), id)? {
                Some(db_id) => db_id,
                None => return Ok(None),
            }
        }
    };
    let Some(other_id) = db.node_id(dst.side(), db_id)? else {
        return Ok(None);
    };
    Ok(dst.key_of(&other_id))
}

/// Counterpart of a node, direct when the store knows it, by path
/// otherwise. A missing counterpart is `None`, never an error.
pub fn corresponding_node(
    db: &dyn SyncDb,
    src: &UpdateTree,
    dst: &UpdateTree,
    key: NodeKey,
) -> Result<Option<NodeKey>> {
    if let Some(found) = corresponding_node_direct(db, src, dst, key)? {
        return Ok(Some(found));
    }
    corresponding_node_from_path(db, src, dst, key)
}

/// Rebases the node's path below its nearest store-known ancestor onto
/// that ancestor's counterpart in the other tree.
fn corresponding_node_from_path(
    db: &dyn SyncDb,
    src: &UpdateTree,
    dst: &UpdateTree,
    key: NodeKey,
) -> Result<Option<NodeKey>> {
    let mut relative: Vec<String> = Vec::new();
    let mut current = key;
    let mut depth = 0usize;
    let ancestor = loop {
        if current == src.root_key() {
            break dst.root_key();
        }
        let node = src.node_ref(current)?;
        let known_db_id = match node.db_id() {
            Some(db_id) => Some(db_id),
            None => match node.id() {
                Some(id) => db.db_id(src.side(), id)?,
                None => None,
            },
        };
        if current != key {
            if let Some(db_id) = known_db_id {
                let Some(other_id) = db.node_id(dst.side(), db_id)? else {
                    return Ok(None);
                };
                match dst.key_of(&other_id) {
                    Some(other_key) => break other_key,
                    None => return Ok(None),
                }
            }
        }
        relative.push(node.name().to_string());
        current = node.parent().ok_or_else(|| {
            ReconError::Data("detached node during correspondence lookup".to_string())
        })?;
        depth += 1;
        if depth > 1000 {
            return Err(ReconError::Data(
                "correspondence ancestry does not terminate".to_string(),
            ));
        }
    };
    let mut path = dst.path_of(ancestor)?;
    for name in relative.iter().rev() {
        path.push(name);
    }
    Ok(dst.node_by_path(&path))
}

/// Whether two corresponding changed nodes describe the same outcome on
/// both replicas, making their "conflict" resolvable by doing nothing.
///
/// Holds for directories created on both sides, for moves landing at the
/// same name under the same parent row, and for file content changes that
/// produced identical content. Content equality requires equal checksums
/// when both snapshots have one; only while a checksum is still pending
/// does it fall back to equal size and modification time.
pub fn is_pseudo_conflict(
    a_tree: &UpdateTree,
    a_key: NodeKey,
    a_snap: &Snapshot,
    b_tree: &UpdateTree,
    b_key: NodeKey,
    b_snap: &Snapshot,
) -> Result<bool> {
    let a = a_tree.node_ref(a_key)?;
    let b = b_tree.node_ref(b_key)?;
    if !a.has_any_change() || !b.has_any_change() {
        return Ok(false);
    }

    if a.is_directory()
        && b.is_directory()
        && a.has_change(OpType::Create)
        && b.has_change(OpType::Create)
    {
        return Ok(true);
    }

    if a.has_change(OpType::Move) && b.has_change(OpType::Move) {
        if a.normalized_name() == b.normalized_name() {
            let a_parent_db = parent_db_id(a_tree, a_key)?;
            let b_parent_db = parent_db_id(b_tree, b_key)?;
            if a_parent_db.is_some() && a_parent_db == b_parent_db {
                return Ok(true);
            }
        }
        return Ok(false);
    }

    let a_content = a.has_change(OpType::Create) || a.has_change(OpType::Edit);
    let b_content = b.has_change(OpType::Create) || b.has_change(OpType::Edit);
    if !a.is_directory() && !b.is_directory() && a_content && b_content {
        let a_id = node_id_of(a_tree, a_key)?;
        let b_id = node_id_of(b_tree, b_key)?;
        let a_checksum = a_snap.content_checksum(&a_id);
        let b_checksum = b_snap.content_checksum(&b_id);
        return Ok(match (a_checksum, b_checksum) {
            (Some(a_sum), Some(b_sum)) => a_sum == b_sum,
            _ => {
                a_snap.size(&a_id) == b_snap.size(&b_id)
                    && a_snap.modified_at(&a_id).is_some()
                    && a_snap.modified_at(&a_id) == b_snap.modified_at(&b_id)
            }
        });
    }

    Ok(false)
}

fn parent_db_id(tree: &UpdateTree, key: NodeKey) -> Result<Option<i64>> {
    match tree.node_ref(key)?.parent() {
        Some(parent) => Ok(tree.node_ref(parent)?.db_id()),
        None => Ok(None),
    }
}

fn node_id_of(tree: &UpdateTree, key: NodeKey) -> Result<NodeId> {
    tree.node_ref(key)?
        .id()
        .cloned()
        .ok_or_else(|| ReconError::Data("changed node without a replica id".to_string()))
}

/// Pre-move path of a node as the store remembers it, used to rule out
/// nested moves when pairing move-move cycles.
pub fn db_path_of(db: &dyn SyncDb, tree: &UpdateTree, key: NodeKey) -> Result<Option<PathBuf>> {
    match tree.node_ref(key)?.db_id() {
        Some(db_id) => db.path(tree.side(), db_id),
        None => Ok(None),
    }
}
