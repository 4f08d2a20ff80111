use thiserror::Error;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Row changed under us since it was loaded.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failure is worth retrying at the job level (storage hiccups).
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            AppError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }
}

/// Convenience `Result` alias for storage and configuration operations.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AppError::NotFound("notification 42".to_string());
        assert_eq!(err.to_string(), "Not found: notification 42");

        let err = AppError::Config("DATABASE_URL missing".to_string());
        assert!(err.to_string().contains("DATABASE_URL"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = AppError::Database(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
        let err = AppError::Database(sqlx::Error::RowNotFound);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_conflict_not_transient() {
        let err = AppError::Conflict("notification 7 is read".to_string());
        assert_eq!(err.to_string(), "Conflict: notification 7 is read");
        assert!(!err.is_transient());
    }
}
