pub mod errors;
pub mod item;
pub mod snapshot;

pub use errors::{IndexError, Result};
pub use item::{normalize_name, ItemType, NodeId, SnapshotItem};
pub use snapshot::{ReplicaSide, Snapshot};
