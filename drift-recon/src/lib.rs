//! Reconciliation engine for driftsync
//!
//! This crate turns two replicas' pending filesystem operations into a
//! converging plan:
//! - Update-tree construction over the last-synced store
//! - Conflict detection with a priority-ordered resolution queue
//! - Sync-operation generation with pseudo-conflict elimination
//! - Session orchestration with cooperative abort

pub mod builder;
pub mod conflict;
pub mod correspond;
pub mod db;
pub mod errors;
pub mod finder;
pub mod fs_op;
pub mod generator;
pub mod node;
pub mod operation;
pub mod session;
pub mod tree;

pub use builder::TreeBuilder;
pub use conflict::{Conflict, ConflictKind, ConflictQueue};
pub use db::{DbNode, SqliteSyncDb, SyncDb};
pub use errors::{ReconError, Result};
pub use finder::ConflictFinder;
pub use fs_op::{ChangeEvents, FsOperation, FsOperationSet, OpType};
pub use generator::OperationGenerator;
pub use node::{Node, NodeKey, NodeRef, NodeStatus};
pub use operation::{SyncOperation, SyncOperationList};
pub use session::{AbortHandle, ReconcileOutcome, ReconciliationSession};
pub use tree::UpdateTree;
