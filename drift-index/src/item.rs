//! Flat snapshot records: replica item identifiers and per-item metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Normalizes a file name to NFC so that the NFC and NFD encodings of the
/// same name compare equal across replicas.
pub fn normalize_name(name: &str) -> String {
    name.nfc().collect()
}

/// Replica-assigned identifier of a filesystem item (inode-derived string
/// on a local replica, server file id on a remote one).
///
/// The empty id is the "no parent" sentinel used above the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    File,
    Directory,
    Unknown,
}

impl ItemType {
    pub fn is_directory(&self) -> bool {
        matches!(self, ItemType::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ItemType::File)
    }
}

/// One item of a replica snapshot. Parent linkage lives here; the child
/// index is maintained by the owning [`Snapshot`](crate::Snapshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub id: NodeId,
    pub parent_id: NodeId,
    name: String,
    normalized_name: String,
    pub item_type: ItemType,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub size: i64,
    pub is_link: bool,
    pub content_checksum: Option<String>,
    pub can_write: bool,
    pub can_share: bool,
    /// Snapshot revision at which this item last changed structurally.
    pub last_change_revision: u64,
}

impl SnapshotItem {
    pub fn new(
        id: NodeId,
        parent_id: NodeId,
        name: impl Into<String>,
        item_type: ItemType,
    ) -> Self {
        let name = name.into();
        let normalized_name = normalize_name(&name);
        Self {
            id,
            parent_id,
            name,
            normalized_name,
            item_type,
            created_at: None,
            modified_at: None,
            size: 0,
            is_link: false,
            content_checksum: None,
            can_write: true,
            can_share: true,
            last_change_revision: 0,
        }
    }

    pub fn with_times(
        mut self,
        created_at: DateTime<Utc>,
        modified_at: DateTime<Utc>,
    ) -> Self {
        self.created_at = Some(created_at);
        self.modified_at = Some(modified_at);
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.normalized_name = normalize_name(&self.name);
    }

    /// Field-wise equality ignoring the last-change revision stamp.
    pub(crate) fn same_as(&self, other: &SnapshotItem) -> bool {
        self.id == other.id
            && self.parent_id == other.parent_id
            && self.normalized_name == other.normalized_name
            && self.item_type == other.item_type
            && self.created_at == other.created_at
            && self.modified_at == other.modified_at
            && self.size == other.size
            && self.is_link == other.is_link
            && self.content_checksum == other.content_checksum
            && self.can_write == other.can_write
            && self.can_share == other.can_share
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_name_matches_across_encodings() {
        // "é" precomposed vs decomposed
        let nfc = SnapshotItem::new("1".into(), "root".into(), "caf\u{e9}", ItemType::File);
        let nfd = SnapshotItem::new("2".into(), "root".into(), "cafe\u{301}", ItemType::File);
        assert_eq!(nfc.normalized_name(), nfd.normalized_name());
        assert_ne!(nfd.name(), nfd.normalized_name());
    }

    #[test]
    fn same_as_ignores_revision_stamp() {
        let a = SnapshotItem::new("1".into(), "root".into(), "a.txt", ItemType::File);
        let mut b = a.clone();
        b.last_change_revision = 42;
        assert!(a.same_as(&b));
        b.size = 7;
        assert!(!a.same_as(&b));
    }
}
