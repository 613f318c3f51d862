//! The closed error taxonomy for the persistence gateway.

use thiserror::Error;

/// Error returned by every gateway operation.
///
/// `Io` is retriable by the caller; `Constraint` never is; `NotFound` is
/// expected to be mapped to a warning + no-op where the contract allows it.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transport or engine failure; a retry may succeed.
    #[error("storage i/o error: {0}")]
    Io(#[source] sqlx::Error),

    /// Unique/check/foreign-key violation; retrying cannot help.
    #[error("storage constraint violation: {0}")]
    Constraint(#[source] sqlx::Error),

    /// The addressed row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Whether a caller-side retry has any chance of succeeding.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Short kind tag used in structured API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Constraint(_) => "constraint",
            Self::NotFound(_) => "notfound",
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_owned()),
            sqlx::Error::Database(db) => {
                use sqlx::error::ErrorKind;
                match db.kind() {
                    ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation => Self::Constraint(err),
                    _ => Self::Io(err),
                }
            }
            _ => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_notfound() {
        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert_eq!(err.kind(), "notfound");
        assert!(!err.is_retriable());
    }

    #[test]
    fn pool_timeout_maps_to_io() {
        let err: StorageError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(err.is_retriable());
    }
}
