use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Transient feed error: {0}")]
    Transient(String),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Publish of {requested} payloads exceeds the per-post limit of {limit}")]
    Capacity { limit: usize, requested: usize },

    #[error("Dataset '{0}' is not registered")]
    UnknownDataset(String),

    #[error("No snapshot of '{dataset}' found{}", at_reference(.reference))]
    SnapshotNotFound {
        dataset: String,
        reference: Option<String>,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl LedgerError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

fn at_reference(reference: &Option<String>) -> String {
    reference
        .as_ref()
        .map(|r| format!(" at reference {r}"))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl<T> From<std::sync::PoisonError<T>> for LedgerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(LedgerError::Transient("timeout".into()).is_transient());
        assert!(!LedgerError::Feed("403".into()).is_transient());
        assert!(!LedgerError::Parse("eof".into()).is_transient());
    }

    #[test]
    fn test_snapshot_not_found_message() {
        let err = LedgerError::SnapshotNotFound {
            dataset: "bank".into(),
            reference: Some("42".into()),
        };
        assert_eq!(err.to_string(), "No snapshot of 'bank' found at reference 42");

        let err = LedgerError::SnapshotNotFound {
            dataset: "bank".into(),
            reference: None,
        };
        assert_eq!(err.to_string(), "No snapshot of 'bank' found");
    }
}
