#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The probed record or session does not exist. Expected during
    /// optimistic probes (e.g. crash recovery finding no checkpoint).
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored body exists but fails to parse. Never reported as absence.
    #[error("corrupt record at {path}: {reason}")]
    CorruptRecord { path: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Reject blank identifiers before they reach a backend.
pub(crate) fn require_id(kind: &str, id: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() {
        return Err(StoreError::InvalidArgument(format!("blank {kind}")));
    }
    Ok(())
}
