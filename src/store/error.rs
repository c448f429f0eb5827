use crate::InstanceStatus;

/// Store-level error with retry classification.
///
/// `AlreadyExists`, `Conflict`, and `NotFound` describe outcomes of the
/// store's atomic operations and are never retryable: retrying the same call
/// would observe the same state. `Backend` covers provider failures and
/// carries the classification the coordinator uses when deciding to retry.
///
/// **Retryable backend errors**: database busy/locked, connection timeouts,
/// temporary resource exhaustion. **Non-retryable**: corruption, constraint
/// violations, malformed rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `create` found an existing record for the id.
    AlreadyExists { id: String },
    /// A conditional transition found a different current status.
    Conflict {
        id: String,
        expected: InstanceStatus,
        actual: InstanceStatus,
    },
    /// No record for the id.
    NotFound { id: String },
    /// Provider failure.
    Backend {
        /// Operation that failed (e.g. "transition", "list_non_terminal").
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl StoreError {
    /// A transient backend error that might succeed on retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Backend {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent backend error that retrying will not fix.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Backend {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend { retryable: true, .. })
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::AlreadyExists { id } => write!(f, "instance already exists: {id}"),
            StoreError::Conflict { id, expected, actual } => {
                write!(f, "transition conflict on {id}: expected {expected}, found {actual}")
            }
            StoreError::NotFound { id } => write!(f, "instance not found: {id}"),
            StoreError::Backend {
                operation, message, ..
            } => write!(f, "{operation}: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_classification() {
        let retryable = StoreError::retryable("transition", "database is locked");
        assert!(retryable.is_retryable());

        let permanent = StoreError::permanent("create", "constraint violation");
        assert!(!permanent.is_retryable());

        let display = format!("{permanent}");
        assert!(display.contains("create"));
        assert!(display.contains("constraint"));
    }

    #[test]
    fn structural_errors_are_not_retryable() {
        assert!(!StoreError::AlreadyExists { id: "U1".into() }.is_retryable());
        assert!(!StoreError::NotFound { id: "U1".into() }.is_retryable());
        assert!(
            !StoreError::Conflict {
                id: "U1".into(),
                expected: InstanceStatus::Pending,
                actual: InstanceStatus::Running,
            }
            .is_retryable()
        );
    }
}
