use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Broken ancestry for item {0}: parent chain does not reach the root")]
    BrokenAncestry(String),

    #[error("Path ignored (root-name component): {0}")]
    IgnoredPath(std::path::PathBuf),
}

pub type Result<T> = std::result::Result<T, IndexError>;
