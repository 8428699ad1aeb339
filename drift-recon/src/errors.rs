use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconError {
    /// Structural inconsistency between the operation set, the tree and the
    /// last-synced store. The current pass must be discarded and rebuilt
    /// from fresh snapshots.
    #[error("Data error: {0}")]
    Data(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Index error: {0}")]
    Index(#[from] drift_index::IndexError),

    #[error("Reconciliation pass aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, ReconError>;
