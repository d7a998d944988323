use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Migration error: {0}")]
    MigrationError(#[from] MigrationError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<crate::config::DatabaseUrlError> for AppError {
    fn from(err: crate::config::DatabaseUrlError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = self.to_string();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": message
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::DatabaseError(DatabaseError::NotFound) => StatusCode::NOT_FOUND,
            AppError::DatabaseError(DatabaseError::PoolExhausted { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DatabaseError(DatabaseError::ConnectionError(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DatabaseError(DatabaseError::PoolClosed) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failures of the runtime (request-handling) database path.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// The database could not be reached while opening a session.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Every pooled session stayed checked out for the whole wait budget.
    #[error("Connection pool exhausted: {capacity} sessions in use after waiting {waited:?}")]
    PoolExhausted { capacity: u32, waited: Duration },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Record not found")]
    NotFound,
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound,
            sqlx::Error::PoolClosed => DatabaseError::PoolClosed,
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
                DatabaseError::ConnectionError(err.to_string())
            }
            _ => DatabaseError::QueryError(err.to_string()),
        }
    }
}

/// Failures of the migration path. A failed revision is never recorded as
/// applied.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("failed to access migration scripts at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid migration script {}: {reason}", .path.display())]
    InvalidScript { path: PathBuf, reason: String },

    #[error("broken revision chain: {0}")]
    BrokenChain(String),

    #[error("unknown revision '{0}'")]
    UnknownRevision(String),

    #[error("revision '{revision}' failed: {source}")]
    ExecutionFailed {
        revision: String,
        source: sqlx::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid migration database URL: {0}")]
    Url(#[from] crate::config::DatabaseUrlError),

    #[error("schema registry is inconsistent: {0}")]
    Schema(#[from] crate::db::schema::SchemaError),

    #[error("database is at {current} but the newest revision is {head}; upgrade first")]
    NotUpToDate { current: String, head: String },

    #[error("failed to start migration runtime: {0}")]
    Runtime(std::io::Error),

    #[error("no schema changes detected")]
    NothingToGenerate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::InternalError(_)));

        let config_err = config::ConfigError::NotFound(String::from("key not found"));
        let app_err: AppError = config_err.into();
        assert!(matches!(app_err, AppError::ConfigError(_)));

        let db_err = sqlx::Error::RowNotFound;
        let app_err: AppError = db_err.into();
        assert!(matches!(app_err, AppError::DatabaseError(DatabaseError::NotFound)));

        let app_err: AppError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(app_err, AppError::DatabaseError(DatabaseError::ConnectionError(_))));
    }

    #[test]
    fn test_error_status_codes() {
        let err = AppError::ValidationError("invalid input".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = AppError::DatabaseError(DatabaseError::NotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = AppError::DatabaseError(DatabaseError::PoolExhausted {
            capacity: 1,
            waited: Duration::from_millis(50),
        });
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err = AppError::DatabaseError(DatabaseError::QueryError("syntax".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_display() {
        let err = AppError::ValidationError("test error".to_string());
        assert_eq!(err.to_string(), "Validation error: test error");

        let err = AppError::DatabaseError(DatabaseError::NotFound);
        assert_eq!(err.to_string(), "Database error: Record not found");

        let err = AppError::MigrationError(MigrationError::UnknownRevision("abc123".into()));
        assert_eq!(err.to_string(), "Migration error: unknown revision 'abc123'");
    }
}
