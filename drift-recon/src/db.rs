//! Last-synced node-mapping store.
//!
//! One row per item that both replicas agreed on at the end of the last
//! successful sync: the db id is the pivot between the local and remote
//! replica ids. Reconciliation only reads this store; it is written by the
//! executor once operations have been applied.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use drift_index::{normalize_name, ItemType, NodeId, ReplicaSide};

use crate::errors::{ReconError, Result};

/// One row of the node mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct DbNode {
    pub db_id: i64,
    pub parent_db_id: Option<i64>,
    pub name_local: String,
    pub name_remote: String,
    pub id_local: Option<NodeId>,
    pub id_remote: Option<NodeId>,
    pub item_type: ItemType,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_local: Option<DateTime<Utc>>,
    pub modified_remote: Option<DateTime<Utc>>,
    pub size: i64,
    pub checksum: Option<String>,
}

impl DbNode {
    pub fn name(&self, side: ReplicaSide) -> &str {
        match side {
            ReplicaSide::Local => &self.name_local,
            ReplicaSide::Remote => &self.name_remote,
        }
    }

    pub fn replica_id(&self, side: ReplicaSide) -> Option<&NodeId> {
        match side {
            ReplicaSide::Local => self.id_local.as_ref(),
            ReplicaSide::Remote => self.id_remote.as_ref(),
        }
    }

    pub fn modified(&self, side: ReplicaSide) -> Option<DateTime<Utc>> {
        match side {
            ReplicaSide::Local => self.modified_local,
            ReplicaSide::Remote => self.modified_remote,
        }
    }
}

/// Read interface over the last-synced store. Lookup misses are `None`,
/// never errors.
pub trait SyncDb {
    fn root(&self) -> Result<DbNode>;
    fn node(&self, db_id: i64) -> Result<Option<DbNode>>;
    fn node_by_replica_id(&self, side: ReplicaSide, id: &NodeId) -> Result<Option<DbNode>>;
    fn db_id(&self, side: ReplicaSide, id: &NodeId) -> Result<Option<i64>>;
    fn node_id(&self, side: ReplicaSide, db_id: i64) -> Result<Option<NodeId>>;
    fn parent(&self, side: ReplicaSide, id: &NodeId) -> Result<Option<NodeId>>;
    /// Path of a row relative to the sync root, using the given side's
    /// names.
    fn path(&self, side: ReplicaSide, db_id: i64) -> Result<Option<PathBuf>>;
    fn id_by_path(&self, side: ReplicaSide, path: &Path) -> Result<Option<NodeId>>;
    /// All replica ids known on one side, the root included.
    fn ids(&self, side: ReplicaSide) -> Result<Vec<NodeId>>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS node_mapping (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_db_id INTEGER REFERENCES node_mapping(db_id),
    name_local TEXT NOT NULL,
    name_remote TEXT NOT NULL,
    id_local TEXT,
    id_remote TEXT,
    item_type TEXT NOT NULL,
    created_at INTEGER,
    modified_local INTEGER,
    modified_remote INTEGER,
    size INTEGER NOT NULL DEFAULT 0,
    checksum TEXT
);

CREATE INDEX IF NOT EXISTS idx_node_mapping_parent ON node_mapping(parent_db_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_node_mapping_id_local ON node_mapping(id_local);
CREATE UNIQUE INDEX IF NOT EXISTS idx_node_mapping_id_remote ON node_mapping(id_remote);
"#;

const NODE_COLUMNS: &str = "db_id, parent_db_id, name_local, name_remote, id_local, id_remote, \
     item_type, created_at, modified_local, modified_remote, size, checksum";

/// SQLite-backed [`SyncDb`].
pub struct SqliteSyncDb {
    conn: Connection,
}

impl SqliteSyncDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!("opened sync database at {}", path.display());
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Inserts or replaces a row. A zero `db_id` lets SQLite assign one;
    /// the assigned id is returned either way.
    pub fn upsert_node(&self, node: &DbNode) -> Result<i64> {
        if node.db_id > 0 {
            self.conn.execute(
                "INSERT OR REPLACE INTO node_mapping \
                 (db_id, parent_db_id, name_local, name_remote, id_local, id_remote, \
                  item_type, created_at, modified_local, modified_remote, size, checksum) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    node.db_id,
                    node.parent_db_id,
                    node.name_local,
                    node.name_remote,
                    node.id_local.as_ref().map(|id| id.as_str()),
                    node.id_remote.as_ref().map(|id| id.as_str()),
                    item_type_to_str(node.item_type),
                    node.created_at.map(|t| t.timestamp()),
                    node.modified_local.map(|t| t.timestamp()),
                    node.modified_remote.map(|t| t.timestamp()),
                    node.size,
                    node.checksum,
                ],
            )?;
            Ok(node.db_id)
        } else {
            self.conn.execute(
                "INSERT INTO node_mapping \
                 (parent_db_id, name_local, name_remote, id_local, id_remote, \
                  item_type, created_at, modified_local, modified_remote, size, checksum) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    node.parent_db_id,
                    node.name_local,
                    node.name_remote,
                    node.id_local.as_ref().map(|id| id.as_str()),
                    node.id_remote.as_ref().map(|id| id.as_str()),
                    item_type_to_str(node.item_type),
                    node.created_at.map(|t| t.timestamp()),
                    node.modified_local.map(|t| t.timestamp()),
                    node.modified_remote.map(|t| t.timestamp()),
                    node.size,
                    node.checksum,
                ],
            )?;
            Ok(self.conn.last_insert_rowid())
        }
    }

    pub fn delete_node(&self, db_id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM node_mapping WHERE db_id = ?1", params![db_id])?;
        Ok(affected > 0)
    }

    fn children(&self, parent_db_id: i64) -> Result<Vec<DbNode>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM node_mapping WHERE parent_db_id = ?1"
        ))?;
        let rows = stmt.query_map(params![parent_db_id], row_to_node)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }
}

fn item_type_to_str(item_type: ItemType) -> &'static str {
    match item_type {
        ItemType::File => "file",
        ItemType::Directory => "directory",
        ItemType::Unknown => "unknown",
    }
}

fn item_type_from_str(s: &str) -> ItemType {
    match s {
        "file" => ItemType::File,
        "directory" => ItemType::Directory,
        _ => ItemType::Unknown,
    }
}

fn timestamp_from_secs(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbNode> {
    let item_type: String = row.get(6)?;
    Ok(DbNode {
        db_id: row.get(0)?,
        parent_db_id: row.get(1)?,
        name_local: row.get(2)?,
        name_remote: row.get(3)?,
        id_local: row.get::<_, Option<String>>(4)?.map(NodeId::from),
        id_remote: row.get::<_, Option<String>>(5)?.map(NodeId::from),
        item_type: item_type_from_str(&item_type),
        created_at: timestamp_from_secs(row.get(7)?),
        modified_local: timestamp_from_secs(row.get(8)?),
        modified_remote: timestamp_from_secs(row.get(9)?),
        size: row.get(10)?,
        checksum: row.get(11)?,
    })
}

fn id_column(side: ReplicaSide) -> &'static str {
    match side {
        ReplicaSide::Local => "id_local",
        ReplicaSide::Remote => "id_remote",
    }
}

impl SyncDb for SqliteSyncDb {
    fn root(&self) -> Result<DbNode> {
        let root = self
            .conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM node_mapping WHERE parent_db_id IS NULL"),
                [],
                row_to_node,
            )
            .optional()?;
        root.ok_or_else(|| ReconError::Data("sync database has no root row".to_string()))
    }

    fn node(&self, db_id: i64) -> Result<Option<DbNode>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM node_mapping WHERE db_id = ?1"),
                params![db_id],
                row_to_node,
            )
            .optional()?)
    }

    fn node_by_replica_id(&self, side: ReplicaSide, id: &NodeId) -> Result<Option<DbNode>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM node_mapping WHERE {} = ?1",
                    id_column(side)
                ),
                params![id.as_str()],
                row_to_node,
            )
            .optional()?)
    }

    fn db_id(&self, side: ReplicaSide, id: &NodeId) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT db_id FROM node_mapping WHERE {} = ?1",
                    id_column(side)
                ),
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn node_id(&self, side: ReplicaSide, db_id: i64) -> Result<Option<NodeId>> {
        let id: Option<Option<String>> = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM node_mapping WHERE db_id = ?1",
                    id_column(side)
                ),
                params![db_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.flatten().map(NodeId::from))
    }

    fn parent(&self, side: ReplicaSide, id: &NodeId) -> Result<Option<NodeId>> {
        let Some(node) = self.node_by_replica_id(side, id)? else {
            return Ok(None);
        };
        let Some(parent_db_id) = node.parent_db_id else {
            return Ok(None);
        };
        self.node_id(side, parent_db_id)
    }

    fn path(&self, side: ReplicaSide, db_id: i64) -> Result<Option<PathBuf>> {
        let mut names: Vec<String> = Vec::new();
        let mut current = db_id;
        loop {
            let Some(node) = self.node(current)? else {
                return Ok(None);
            };
            match node.parent_db_id {
                Some(parent) => {
                    names.push(node.name(side).to_string());
                    current = parent;
                }
                None => break,
            }
            if names.len() > 1000 {
                return Err(ReconError::Data(format!(
                    "node mapping ancestry for db id {db_id} does not terminate"
                )));
            }
        }
        Ok(Some(names.iter().rev().collect()))
    }

    fn id_by_path(&self, side: ReplicaSide, path: &Path) -> Result<Option<NodeId>> {
        let mut current = self.root()?;
        for component in path.components() {
            let std::path::Component::Normal(segment) = component else {
                continue;
            };
            let segment = normalize_name(&segment.to_string_lossy());
            let next = self
                .children(current.db_id)?
                .into_iter()
                .find(|child| normalize_name(child.name(side)) == segment);
            match next {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(current.replica_id(side).cloned())
    }

    fn ids(&self, side: ReplicaSide) -> Result<Vec<NodeId>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM node_mapping WHERE {} IS NOT NULL ORDER BY db_id",
            id_column(side),
            id_column(side)
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(NodeId::from(row?));
        }
        Ok(ids)
    }
}
